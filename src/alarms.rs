// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! One-shot alarms backed by tokio timers.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::events::{EventSender, SyncEvent};

/// Alarm kinds. At most one alarm of each kind is outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Alarm {
    /// Retry the phone after a failure.
    PhoneRetry,
    /// Periodic phone resync after a success.
    PhoneResync,
    /// Outstanding phone request timed out.
    PhoneRequestTimeout,
    /// Next network time poll.
    NetworkRefresh,
}

impl Alarm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Alarm::PhoneRetry => "phone-retry",
            Alarm::PhoneResync => "phone-resync",
            Alarm::PhoneRequestTimeout => "phone-request-timeout",
            Alarm::NetworkRefresh => "network-refresh",
        }
    }
}

/// Alarm service used by the manager and the sources.
pub trait AlarmScheduler: Send + Sync {
    /// Schedule `alarm` after `delay`, replacing any outstanding one.
    fn set(&self, alarm: Alarm, delay: Duration);

    /// Cancel `alarm` if outstanding.
    fn cancel(&self, alarm: Alarm);

    /// Whether `alarm` is outstanding.
    fn is_pending(&self, alarm: Alarm) -> bool;

    /// Consume an expiry. Returns false for expiries of replaced or
    /// cancelled alarms.
    fn acknowledge(&self, alarm: Alarm, generation: u64) -> bool;
}

struct Scheduled {
    generation: u64,
    handle: JoinHandle<()>,
}

/// [`AlarmScheduler`] delivering expiries as [`SyncEvent::Alarm`].
pub struct TokioAlarms {
    events: EventSender,
    next_generation: Mutex<u64>,
    scheduled: Mutex<HashMap<Alarm, Scheduled>>,
}

impl TokioAlarms {
    pub fn new(events: EventSender) -> Self {
        Self {
            events,
            next_generation: Mutex::new(0),
            scheduled: Mutex::new(HashMap::new()),
        }
    }

    /// Cancel everything, used on shutdown.
    pub fn cancel_all(&self) {
        for (_, scheduled) in self.scheduled.lock().drain() {
            scheduled.handle.abort();
        }
    }
}

impl AlarmScheduler for TokioAlarms {
    fn set(&self, alarm: Alarm, delay: Duration) {
        let generation = {
            let mut next = self.next_generation.lock();
            *next += 1;
            *next
        };

        let events = self.events.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(SyncEvent::Alarm { alarm, generation });
        });

        debug!("Alarm {} set in {:?} (gen {})", alarm.as_str(), delay, generation);
        if let Some(previous) = self
            .scheduled
            .lock()
            .insert(alarm, Scheduled { generation, handle })
        {
            previous.handle.abort();
        }
    }

    fn cancel(&self, alarm: Alarm) {
        if let Some(scheduled) = self.scheduled.lock().remove(&alarm) {
            scheduled.handle.abort();
            debug!("Alarm {} cancelled", alarm.as_str());
        }
    }

    fn is_pending(&self, alarm: Alarm) -> bool {
        self.scheduled.lock().contains_key(&alarm)
    }

    fn acknowledge(&self, alarm: Alarm, generation: u64) -> bool {
        let mut scheduled = self.scheduled.lock();
        match scheduled.get(&alarm) {
            Some(current) if current.generation == generation => {
                scheduled.remove(&alarm);
                true
            }
            _ => false,
        }
    }
}

impl Drop for TokioAlarms {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
