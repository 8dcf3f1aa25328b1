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

//! Time sync coordinator.
//!
//! The manager owns the three time sources and decides which of them runs.
//! The phone is always tried first. After more than
//! [`MAX_FAILURE_RETRY_COUNT`] consecutive phone failures the network and
//! NITZ sources are started as fallbacks, while the phone keeps being
//! retried at a slower pace. The first success from any source cancels all
//! other work and returns the manager to [`SyncPhase::Idle`].

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::alarms::{Alarm, AlarmScheduler};
use crate::config::PhoneConfig;
use crate::events::{ClockAdjustment, SourceKind, SyncEvent, SyncOutcome};
use crate::sources::TimeSource;
use crate::state::{SyncPhase, SyncState};
use crate::storage::SyncHistory;
use crate::timezone::TimeZoneMediator;

/// Consecutive phone failures tolerated before the fallbacks start.
pub const MAX_FAILURE_RETRY_COUNT: u32 = 3;

/// Phone retry timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_failure_retry_count: u32,
    pub retry_interval: Duration,
    pub fallback_retry_interval: Duration,
    /// Resync after a success, None disables.
    pub resync_interval: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&PhoneConfig::default())
    }
}

impl From<&PhoneConfig> for RetryPolicy {
    fn from(config: &PhoneConfig) -> Self {
        Self {
            max_failure_retry_count: config.max_failure_retry_count,
            retry_interval: Duration::from_secs(config.retry_interval_secs),
            fallback_retry_interval: Duration::from_secs(config.fallback_retry_interval_secs),
            resync_interval: (config.resync_interval_secs > 0)
                .then(|| Duration::from_secs(config.resync_interval_secs)),
        }
    }
}

/// Arbitrates between phone, network and NITZ time.
pub struct TimeSyncManager {
    phone: Box<dyn TimeSource>,
    network: Box<dyn TimeSource>,
    nitz: Box<dyn TimeSource>,
    alarms: Arc<dyn AlarmScheduler>,
    policy: RetryPolicy,
    state: Arc<SyncState>,
    time_zone: Arc<TimeZoneMediator>,
    history: Option<SyncHistory>,
    phase: SyncPhase,
    failure_count: u32,
}

impl TimeSyncManager {
    /// Create the manager and immediately attempt a phone sync.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        phone: Box<dyn TimeSource>,
        network: Box<dyn TimeSource>,
        nitz: Box<dyn TimeSource>,
        alarms: Arc<dyn AlarmScheduler>,
        policy: RetryPolicy,
        state: Arc<SyncState>,
        time_zone: Arc<TimeZoneMediator>,
        history: Option<SyncHistory>,
    ) -> Self {
        let mut manager = Self {
            phone,
            network,
            nitz,
            alarms,
            policy,
            state,
            time_zone,
            history,
            phase: SyncPhase::Idle,
            failure_count: 0,
        };
        manager.start_phone_time_update();
        manager
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    /// Consecutive phone failures since the last success.
    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    /// Ask the phone for the time.
    pub fn start_phone_time_update(&mut self) {
        // The attempt replaces any scheduled retry or resync.
        self.alarms.cancel(Alarm::PhoneRetry);
        self.alarms.cancel(Alarm::PhoneResync);
        if self.phase != SyncPhase::FallbackActive {
            self.phase = SyncPhase::AwaitingPhoneResponse;
        }
        self.publish();

        debug!("Requesting time from phone ({})", self.phase.as_str());
        let outcome = self.phone.start_update();
        self.dispatch(SourceKind::Phone, outcome);
    }

    /// Process one event from the channel.
    pub fn handle_event(&mut self, event: SyncEvent) {
        match event {
            SyncEvent::Alarm { alarm, generation } => {
                if !self.alarms.acknowledge(alarm, generation) {
                    debug!("Dropping stale {} alarm", alarm.as_str());
                    return;
                }
                self.handle_alarm(alarm);
            }
            SyncEvent::Input(input) => {
                let kind = input.source();
                let outcome = self.source_mut(kind).handle_input(input);
                self.dispatch(kind, outcome);
            }
            SyncEvent::CompanionConnected { address } => {
                info!("Companion connected: {}", address);
                self.time_zone.set_companion_connected(true);
                self.state.set_companion_connected(true);
                self.start_phone_time_update();
            }
            SyncEvent::CompanionDisconnected => {
                info!("Companion disconnected");
                self.time_zone.set_companion_connected(false);
                self.state.set_companion_connected(false);
            }
        }
    }

    fn handle_alarm(&mut self, alarm: Alarm) {
        match alarm {
            Alarm::PhoneRetry | Alarm::PhoneResync => self.start_phone_time_update(),
            Alarm::PhoneRequestTimeout => {
                let outcome = self.phone.handle_request_timeout();
                self.dispatch(SourceKind::Phone, outcome);
            }
            Alarm::NetworkRefresh => {
                let outcome = self.network.handle_refresh();
                self.dispatch(SourceKind::Network, outcome);
            }
        }
    }

    fn source_mut(&mut self, kind: SourceKind) -> &mut dyn TimeSource {
        match kind {
            SourceKind::Phone => self.phone.as_mut(),
            SourceKind::Network => self.network.as_mut(),
            SourceKind::Nitz => self.nitz.as_mut(),
        }
    }

    fn dispatch(&mut self, source: SourceKind, outcome: Option<SyncOutcome>) {
        match outcome {
            Some(SyncOutcome::Success(adjustment)) => self.on_success(source, adjustment),
            Some(SyncOutcome::Failure(reason)) => self.on_failure(source, &reason),
            None => {}
        }
    }

    fn on_success(&mut self, source: SourceKind, adjustment: ClockAdjustment) {
        info!(
            "Time synced from {} (drift {} ms, {})",
            source.as_str(),
            adjustment.drift_ms,
            if adjustment.applied { "clock set" } else { "within threshold" }
        );

        self.failure_count = 0;
        self.alarms.cancel(Alarm::PhoneRetry);
        self.phone.cancel_pending_tasks();
        self.network.cancel_pending_tasks();
        self.nitz.cancel_pending_tasks();
        self.phase = SyncPhase::Idle;

        self.state.record_success(source, adjustment.drift_ms);
        self.record(source, &SyncOutcome::Success(adjustment));

        if let Some(interval) = self.policy.resync_interval {
            self.alarms.set(Alarm::PhoneResync, interval);
        }
        self.publish();
    }

    fn on_failure(&mut self, source: SourceKind, reason: &str) {
        self.record(source, &SyncOutcome::failure(reason));

        if source != SourceKind::Phone {
            warn!("{} sync failed: {}", source.as_str(), reason);
            return;
        }

        self.failure_count = self.failure_count.saturating_add(1);
        warn!(
            "Phone sync failed ({}/{}): {}",
            self.failure_count, self.policy.max_failure_retry_count, reason
        );

        if self.failure_count <= self.policy.max_failure_retry_count {
            self.alarms.set(Alarm::PhoneRetry, self.policy.retry_interval);
            self.publish();
            return;
        }

        if self.phase != SyncPhase::FallbackActive {
            self.start_fallbacks();
        }

        // A fallback may already have succeeded while starting.
        if self.phase == SyncPhase::FallbackActive {
            self.alarms
                .set(Alarm::PhoneRetry, self.policy.fallback_retry_interval);
        }
        self.publish();
    }

    fn start_fallbacks(&mut self) {
        info!("Phone retries exhausted, starting network and NITZ time sync");
        self.phase = SyncPhase::FallbackActive;
        self.publish();

        let outcome = self.network.start_update();
        self.dispatch(SourceKind::Network, outcome);

        if self.phase == SyncPhase::FallbackActive {
            let outcome = self.nitz.start_update();
            self.dispatch(SourceKind::Nitz, outcome);
        }
    }

    fn record(&self, source: SourceKind, outcome: &SyncOutcome) {
        if let Some(history) = &self.history {
            if let Err(e) = history.record(source, outcome) {
                warn!("Failed to record sync history: {}", e);
            }
        }
    }

    fn publish(&self) {
        self.state.set_phase(self.phase, self.failure_count);
    }

    /// Stop every source and drop the manager's own alarms.
    pub fn shutdown(&mut self) {
        info!("Stopping time sync");
        self.phone.cancel_pending_tasks();
        self.network.cancel_pending_tasks();
        self.nitz.cancel_pending_tasks();
        self.alarms.cancel(Alarm::PhoneRetry);
        self.alarms.cancel(Alarm::PhoneResync);
        self.phase = SyncPhase::Idle;
        self.publish();
    }
}
