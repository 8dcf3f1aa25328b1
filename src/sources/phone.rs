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

//! Phone companion time source.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::TimeSource;
use crate::alarms::{Alarm, AlarmScheduler};
use crate::clock::{adjust_clock, SystemClock};
use crate::companion::{CompanionLink, Message, TimeResponsePayload};
use crate::events::{SourceInput, SourceKind, SyncOutcome};
use crate::timezone::TimeZoneMediator;

struct PendingRequest {
    id: String,
    sent_elapsed_millis: i64,
}

/// Requests time from the paired phone.
pub struct PhoneTimeSyncer {
    link: Arc<dyn CompanionLink>,
    alarms: Arc<dyn AlarmScheduler>,
    clock: Arc<dyn SystemClock>,
    time_zone: Arc<TimeZoneMediator>,
    request_timeout: Duration,
    drift_threshold: Duration,
    pending: Option<PendingRequest>,
}

impl PhoneTimeSyncer {
    pub fn new(
        link: Arc<dyn CompanionLink>,
        alarms: Arc<dyn AlarmScheduler>,
        clock: Arc<dyn SystemClock>,
        time_zone: Arc<TimeZoneMediator>,
        request_timeout: Duration,
        drift_threshold: Duration,
    ) -> Self {
        Self {
            link,
            alarms,
            clock,
            time_zone,
            request_timeout,
            drift_threshold,
            pending: None,
        }
    }

    /// Id of the outstanding request.
    pub fn pending_request(&self) -> Option<&str> {
        self.pending.as_ref().map(|p| p.id.as_str())
    }

    fn send_request(&mut self) -> Result<()> {
        let id = Uuid::new_v4().to_string();
        self.link.send(Message::time_request(id.clone())?)?;

        debug!("Time request {} sent to phone", id);
        self.pending = Some(PendingRequest {
            id,
            sent_elapsed_millis: self.clock.elapsed_millis(),
        });
        self.alarms.set(Alarm::PhoneRequestTimeout, self.request_timeout);
        Ok(())
    }

    fn apply(&mut self, response: &TimeResponsePayload) -> Result<SyncOutcome> {
        // Half the round trip approximates the time since the phone read its clock.
        let latency = match self.pending.take() {
            Some(pending) => (self.clock.elapsed_millis() - pending.sent_elapsed_millis).max(0) / 2,
            None => 0,
        };
        self.alarms.cancel(Alarm::PhoneRequestTimeout);

        let adjustment = adjust_clock(
            self.clock.as_ref(),
            response.time_millis + latency,
            self.drift_threshold,
        )?;

        if let Some(zone) = &response.time_zone {
            if let Err(e) = self.time_zone.on_phone_time_zone(zone) {
                warn!("Phone time zone not applied: {}", e);
            }
        }

        Ok(SyncOutcome::Success(adjustment))
    }
}

impl TimeSource for PhoneTimeSyncer {
    fn kind(&self) -> SourceKind {
        SourceKind::Phone
    }

    fn start_update(&mut self) -> Option<SyncOutcome> {
        if !self.link.is_connected() {
            self.cancel_pending_tasks();
            return Some(SyncOutcome::failure("companion not connected"));
        }

        match self.send_request() {
            Ok(()) => None,
            Err(e) => {
                self.cancel_pending_tasks();
                Some(SyncOutcome::failure(format!("time request failed: {}", e)))
            }
        }
    }

    fn handle_refresh(&mut self) -> Option<SyncOutcome> {
        self.start_update()
    }

    fn handle_request_timeout(&mut self) -> Option<SyncOutcome> {
        let pending = self.pending.take()?;
        info!("Phone did not answer time request {}", pending.id);
        Some(SyncOutcome::failure("phone time request timed out"))
    }

    fn handle_input(&mut self, input: SourceInput) -> Option<SyncOutcome> {
        let SourceInput::PhoneTime(response) = input else {
            return None;
        };

        match (&response.request_id, &self.pending) {
            (None, _) => debug!("Time pushed by phone"),
            (Some(id), Some(pending)) if *id == pending.id => {}
            (Some(id), _) => {
                debug!("Ignoring stale phone response {}", id);
                return None;
            }
        }

        Some(match self.apply(&response) {
            Ok(outcome) => outcome,
            Err(e) => SyncOutcome::failure(e.to_string()),
        })
    }

    fn cancel_pending_tasks(&mut self) {
        self.pending = None;
        self.alarms.cancel(Alarm::PhoneRequestTimeout);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::companion::{MessageType, TimeRequestPayload};
    use crate::state::SyncState;
    use crate::testing::RecordingAlarms;
    use crate::timezone::TimeZoneSink;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct FakeLink {
        connected: Mutex<bool>,
        sent: Mutex<Vec<Message>>,
    }

    impl CompanionLink for FakeLink {
        fn is_connected(&self) -> bool {
            *self.connected.lock()
        }

        fn send(&self, message: Message) -> Result<()> {
            self.sent.lock().push(message);
            Ok(())
        }
    }

    struct NullSink;

    impl TimeZoneSink for NullSink {
        fn current(&self) -> Option<String> {
            None
        }

        fn apply(&self, _zone: &str) -> Result<()> {
            Ok(())
        }
    }

    struct Fixture {
        link: Arc<FakeLink>,
        alarms: Arc<RecordingAlarms>,
        clock: Arc<ManualClock>,
        mediator: Arc<TimeZoneMediator>,
        syncer: PhoneTimeSyncer,
    }

    fn fixture(connected: bool) -> Fixture {
        let link = Arc::new(FakeLink::default());
        *link.connected.lock() = connected;
        let alarms = Arc::new(RecordingAlarms::default());
        let clock = Arc::new(ManualClock::new(10_000_000));
        let mediator = TimeZoneMediator::new(Box::new(NullSink), SyncState::new());
        let syncer = PhoneTimeSyncer::new(
            link.clone(),
            alarms.clone(),
            clock.clone(),
            mediator.clone(),
            Duration::from_secs(30),
            Duration::from_secs(5),
        );
        Fixture {
            link,
            alarms,
            clock,
            mediator,
            syncer,
        }
    }

    fn request_id(message: &Message) -> String {
        assert_eq!(message.message_type, MessageType::TimeRequest);
        TimeRequestPayload::from_json(&message.payload)
            .unwrap()
            .request_id
    }

    #[test]
    fn test_disconnected_fails_immediately() {
        let mut f = fixture(false);
        assert!(matches!(f.syncer.start_update(), Some(SyncOutcome::Failure(_))));
        assert!(f.link.sent.lock().is_empty());
        assert!(!f.alarms.is_pending(Alarm::PhoneRequestTimeout));
    }

    #[test]
    fn test_request_sets_timeout() {
        let mut f = fixture(true);
        assert!(f.syncer.start_update().is_none());

        let sent = f.link.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(f.syncer.pending_request(), Some(request_id(&sent[0]).as_str()));
        assert!(f.alarms.is_pending(Alarm::PhoneRequestTimeout));
    }

    #[test]
    fn test_timeout_reports_failure_once() {
        let mut f = fixture(true);
        f.syncer.start_update();

        assert!(matches!(
            f.syncer.handle_request_timeout(),
            Some(SyncOutcome::Failure(_))
        ));
        assert!(f.syncer.handle_request_timeout().is_none());
    }

    #[test]
    fn test_response_compensates_round_trip() {
        let mut f = fixture(true);
        f.syncer.start_update();
        let id = request_id(&f.link.sent.lock()[0]);

        f.clock.advance(400);
        let outcome = f.syncer.handle_input(SourceInput::PhoneTime(TimeResponsePayload {
            request_id: Some(id),
            time_millis: 20_000_000,
            time_zone: Some("Europe/Paris".to_string()),
        }));

        match outcome {
            Some(SyncOutcome::Success(adj)) => {
                assert!(adj.applied);
                assert_eq!(adj.drift_ms, 20_000_200 - 10_000_400);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(f.clock.writes(), vec![20_000_200]);
        assert_eq!(f.syncer.pending_request(), None);
        assert!(!f.alarms.is_pending(Alarm::PhoneRequestTimeout));
        assert_eq!(f.mediator.current().as_deref(), Some("Europe/Paris"));
    }

    #[test]
    fn test_small_drift_leaves_clock_alone() {
        let mut f = fixture(true);
        let outcome = f.syncer.handle_input(SourceInput::PhoneTime(TimeResponsePayload {
            request_id: None,
            time_millis: 10_001_000,
            time_zone: None,
        }));

        assert_eq!(
            outcome,
            Some(SyncOutcome::Success(crate::events::ClockAdjustment {
                drift_ms: 1_000,
                applied: false,
            }))
        );
        assert!(f.clock.writes().is_empty());
    }

    #[test]
    fn test_stale_response_ignored() {
        let mut f = fixture(true);
        f.syncer.start_update();

        let outcome = f.syncer.handle_input(SourceInput::PhoneTime(TimeResponsePayload {
            request_id: Some("old-request".to_string()),
            time_millis: 0,
            time_zone: None,
        }));
        assert!(outcome.is_none());
        assert!(f.syncer.pending_request().is_some());
    }
}
