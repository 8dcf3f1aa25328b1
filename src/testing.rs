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

//! Test doubles shared by unit tests.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::alarms::{Alarm, AlarmScheduler};
use crate::events::{ClockAdjustment, SourceInput, SourceKind, SyncEvent, SyncOutcome};
use crate::sources::TimeSource;

#[derive(Default)]
struct AlarmBook {
    next_generation: u64,
    pending: HashMap<Alarm, (u64, Duration)>,
}

/// Alarm scheduler that never fires on its own.
#[derive(Default)]
pub struct RecordingAlarms {
    book: Mutex<AlarmBook>,
}

impl RecordingAlarms {
    /// Expiry event for the outstanding `alarm`.
    pub fn fire(&self, alarm: Alarm) -> Option<SyncEvent> {
        let book = self.book.lock();
        book.pending
            .get(&alarm)
            .map(|(generation, _)| SyncEvent::Alarm {
                alarm,
                generation: *generation,
            })
    }

    /// Delay of the outstanding `alarm`.
    pub fn delay(&self, alarm: Alarm) -> Option<Duration> {
        self.book.lock().pending.get(&alarm).map(|(_, delay)| *delay)
    }

    /// Number of outstanding alarms.
    pub fn pending_count(&self) -> usize {
        self.book.lock().pending.len()
    }
}

impl AlarmScheduler for RecordingAlarms {
    fn set(&self, alarm: Alarm, delay: Duration) {
        let mut book = self.book.lock();
        book.next_generation += 1;
        let generation = book.next_generation;
        book.pending.insert(alarm, (generation, delay));
    }

    fn cancel(&self, alarm: Alarm) {
        self.book.lock().pending.remove(&alarm);
    }

    fn is_pending(&self, alarm: Alarm) -> bool {
        self.book.lock().pending.contains_key(&alarm)
    }

    fn acknowledge(&self, alarm: Alarm, generation: u64) -> bool {
        let mut book = self.book.lock();
        match book.pending.get(&alarm) {
            Some((current, _)) if *current == generation => {
                book.pending.remove(&alarm);
                true
            }
            _ => false,
        }
    }
}

/// Calls observed by a [`ScriptedSource`].
#[derive(Debug, Default)]
pub struct SourceCalls {
    pub starts: u32,
    pub refreshes: u32,
    pub timeouts: u32,
    pub cancels: u32,
    /// Outcome returned by every `start_update`.
    pub start_result: Option<SyncOutcome>,
}

/// Time source whose results are driven by the test.
///
/// Inputs map straight to outcomes: phone time and NITZ reports succeed,
/// network results succeed or fail as delivered.
pub struct ScriptedSource {
    kind: SourceKind,
    calls: Arc<Mutex<SourceCalls>>,
}

impl ScriptedSource {
    pub fn new(kind: SourceKind) -> (Box<Self>, Arc<Mutex<SourceCalls>>) {
        let calls = Arc::new(Mutex::new(SourceCalls::default()));
        (
            Box::new(Self {
                kind,
                calls: calls.clone(),
            }),
            calls,
        )
    }
}

impl TimeSource for ScriptedSource {
    fn kind(&self) -> SourceKind {
        self.kind
    }

    fn start_update(&mut self) -> Option<SyncOutcome> {
        let mut calls = self.calls.lock();
        calls.starts += 1;
        calls.start_result.clone()
    }

    fn handle_refresh(&mut self) -> Option<SyncOutcome> {
        self.calls.lock().refreshes += 1;
        None
    }

    fn handle_request_timeout(&mut self) -> Option<SyncOutcome> {
        self.calls.lock().timeouts += 1;
        Some(SyncOutcome::failure("timed out"))
    }

    fn handle_input(&mut self, input: SourceInput) -> Option<SyncOutcome> {
        Some(match input {
            SourceInput::NetworkRefreshed { result, .. } => match result {
                Ok(outcome) => SyncOutcome::Success(outcome.adjustment),
                Err(reason) => SyncOutcome::Failure(reason),
            },
            _ => SyncOutcome::Success(ClockAdjustment::default()),
        })
    }

    fn cancel_pending_tasks(&mut self) {
        self.calls.lock().cancels += 1;
    }
}
