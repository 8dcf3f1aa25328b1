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

//! Network (SNTP) time source.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::TimeSource;
use crate::alarms::{Alarm, AlarmScheduler};
use crate::events::{EventSender, SourceInput, SourceKind, SyncEvent, SyncOutcome};
use crate::refresh::RefreshTimeCallable;

/// Polls network time while active.
pub struct NetworkTimeSyncer {
    callable: RefreshTimeCallable,
    alarms: Arc<dyn AlarmScheduler>,
    events: EventSender,
    polling_interval: Duration,
    polling_interval_shorter: Duration,
    retry_count: u32,
    try_again_counter: u32,
    active: bool,
    /// Tag of the refresh whose result is awaited.
    generation: u64,
    in_flight: Option<JoinHandle<()>>,
}

impl NetworkTimeSyncer {
    pub fn new(
        callable: RefreshTimeCallable,
        alarms: Arc<dyn AlarmScheduler>,
        events: EventSender,
        polling_interval: Duration,
        polling_interval_shorter: Duration,
        retry_count: u32,
    ) -> Self {
        Self {
            callable,
            alarms,
            events,
            polling_interval,
            polling_interval_shorter,
            retry_count,
            try_again_counter: 0,
            active: false,
            generation: 0,
            in_flight: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    fn spawn_refresh(&mut self) {
        if let Some(previous) = self.in_flight.take() {
            previous.abort();
        }

        self.generation += 1;
        let generation = self.generation;
        let callable = self.callable.clone();
        let events = self.events.clone();
        self.in_flight = Some(tokio::spawn(async move {
            let result = match tokio::task::spawn_blocking(move || callable.call()).await {
                Ok(result) => result.map_err(|e| e.to_string()),
                Err(e) => Err(format!("refresh worker failed: {}", e)),
            };
            let _ = events.send(SyncEvent::Input(SourceInput::NetworkRefreshed {
                generation,
                result,
            }));
        }));
    }
}

impl TimeSource for NetworkTimeSyncer {
    fn kind(&self) -> SourceKind {
        SourceKind::Network
    }

    fn start_update(&mut self) -> Option<SyncOutcome> {
        info!("Starting network time sync");
        self.active = true;
        self.try_again_counter = 0;
        self.handle_refresh()
    }

    fn handle_refresh(&mut self) -> Option<SyncOutcome> {
        if !self.active {
            return None;
        }
        debug!("Refreshing network time");
        self.spawn_refresh();
        None
    }

    fn handle_input(&mut self, input: SourceInput) -> Option<SyncOutcome> {
        let SourceInput::NetworkRefreshed { generation, result } = input else {
            return None;
        };

        if !self.active || generation != self.generation {
            debug!("Ignoring result of superseded network refresh {}", generation);
            return None;
        }
        self.in_flight = None;

        match result {
            Ok(outcome) => {
                self.try_again_counter = 0;
                self.alarms.set(Alarm::NetworkRefresh, self.polling_interval);
                Some(SyncOutcome::Success(outcome.adjustment))
            }
            Err(reason) => {
                self.try_again_counter += 1;
                let delay = if self.try_again_counter <= self.retry_count {
                    self.polling_interval_shorter
                } else {
                    self.try_again_counter = 0;
                    self.polling_interval
                };
                warn!("Network time unavailable, retrying in {:?}: {}", delay, reason);
                self.alarms.set(Alarm::NetworkRefresh, delay);
                Some(SyncOutcome::Failure(reason))
            }
        }
    }

    fn cancel_pending_tasks(&mut self) {
        if self.active {
            info!("Stopping network time sync");
        }
        self.active = false;
        self.try_again_counter = 0;
        // Results already queued for the old refresh no longer match.
        self.generation += 1;
        self.alarms.cancel(Alarm::NetworkRefresh);
        if let Some(in_flight) = self.in_flight.take() {
            in_flight.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::events::{self, ClockAdjustment};
    use crate::refresh::{NetworkTimeCache, NtpClient, NtpSample, RefreshOutcome};
    use crate::testing::RecordingAlarms;
    use anyhow::Result;
    use parking_lot::Mutex;

    struct FixedNtp(i64);

    impl NtpClient for FixedNtp {
        fn request_time(&self) -> Result<NtpSample> {
            Ok(NtpSample {
                time_millis: self.0,
                round_trip_ms: 10,
            })
        }
    }

    const POLL: Duration = Duration::from_secs(86_400);
    const SHORT: Duration = Duration::from_secs(60);

    fn syncer(ntp_millis: i64) -> (NetworkTimeSyncer, Arc<RecordingAlarms>, events::EventReceiver) {
        let (tx, rx) = events::channel();
        let clock = Arc::new(ManualClock::new(1_000));
        let cache = Arc::new(Mutex::new(NetworkTimeCache::new(Box::new(FixedNtp(ntp_millis)))));
        let callable = RefreshTimeCallable::new(cache, clock, POLL, Duration::from_secs(5));
        let alarms = Arc::new(RecordingAlarms::default());
        let syncer = NetworkTimeSyncer::new(callable, alarms.clone(), tx, POLL, SHORT, 2);
        (syncer, alarms, rx)
    }

    fn success(generation: u64) -> SourceInput {
        SourceInput::NetworkRefreshed {
            generation,
            result: Ok(RefreshOutcome {
                adjustment: ClockAdjustment::default(),
                refreshed: true,
            }),
        }
    }

    fn failure(generation: u64) -> SourceInput {
        SourceInput::NetworkRefreshed {
            generation,
            result: Err("unreachable".to_string()),
        }
    }

    #[tokio::test]
    async fn test_start_runs_refresh_worker() {
        let (mut syncer, _, mut rx) = syncer(60_000);
        assert!(syncer.start_update().is_none());
        assert!(syncer.is_active());

        match rx.recv().await {
            Some(SyncEvent::Input(SourceInput::NetworkRefreshed {
                generation,
                result: Ok(outcome),
            })) => {
                assert_eq!(generation, 1);
                assert!(outcome.refreshed);
                assert!(outcome.adjustment.applied);
                assert_eq!(outcome.adjustment.drift_ms, 59_000);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_success_schedules_next_poll() {
        let (mut syncer, alarms, _rx) = syncer(0);
        syncer.active = true;

        assert!(matches!(syncer.handle_input(success(0)), Some(SyncOutcome::Success(_))));
        assert_eq!(alarms.delay(Alarm::NetworkRefresh), Some(POLL));
    }

    #[test]
    fn test_failures_back_off_then_wait_full_interval() {
        let (mut syncer, alarms, _rx) = syncer(0);
        syncer.active = true;

        for _ in 0..2 {
            assert!(matches!(syncer.handle_input(failure(0)), Some(SyncOutcome::Failure(_))));
            assert_eq!(alarms.delay(Alarm::NetworkRefresh), Some(SHORT));
        }

        syncer.handle_input(failure(0));
        assert_eq!(alarms.delay(Alarm::NetworkRefresh), Some(POLL));

        // Counter starts over.
        syncer.handle_input(failure(0));
        assert_eq!(alarms.delay(Alarm::NetworkRefresh), Some(SHORT));
    }

    #[test]
    fn test_cancel_ignores_late_results() {
        let (mut syncer, alarms, _rx) = syncer(0);
        syncer.active = true;
        syncer.handle_input(failure(0));

        syncer.cancel_pending_tasks();
        assert!(!syncer.is_active());
        assert!(!alarms.is_pending(Alarm::NetworkRefresh));

        assert!(syncer.handle_input(success(0)).is_none());
        assert!(syncer.handle_refresh().is_none());
        assert!(!alarms.is_pending(Alarm::NetworkRefresh));
    }

    #[tokio::test]
    async fn test_result_queued_before_restart_ignored() {
        let (mut syncer, alarms, mut rx) = syncer(0);
        syncer.start_update();
        let stale = match rx.recv().await {
            Some(SyncEvent::Input(input)) => input,
            other => panic!("unexpected {:?}", other),
        };

        // Cancelled and restarted before the manager drained the result.
        syncer.cancel_pending_tasks();
        syncer.start_update();

        assert!(syncer.handle_input(stale).is_none());
        assert!(!alarms.is_pending(Alarm::NetworkRefresh));

        let fresh = match rx.recv().await {
            Some(SyncEvent::Input(input)) => input,
            other => panic!("unexpected {:?}", other),
        };
        assert!(matches!(syncer.handle_input(fresh), Some(SyncOutcome::Success(_))));
        assert!(alarms.is_pending(Alarm::NetworkRefresh));
    }
}
