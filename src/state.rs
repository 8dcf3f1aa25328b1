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

//! Shared sync status.

use chrono::{DateTime, Local};
use parking_lot::RwLock;
use std::sync::Arc;

use crate::events::SourceKind;

/// Coordinator phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    AwaitingPhoneResponse,
    FallbackActive,
}

impl SyncPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncPhase::Idle => "Idle",
            SyncPhase::AwaitingPhoneResponse => "Awaiting phone",
            SyncPhase::FallbackActive => "Fallback active",
        }
    }
}

/// Last successful sync.
#[derive(Debug, Clone, PartialEq)]
pub struct LastSync {
    pub source: SourceKind,
    pub at: DateTime<Local>,
    pub drift_ms: i64,
}

/// Shared daemon state.
#[derive(Debug)]
pub struct SyncState {
    /// Current coordinator phase.
    pub phase: RwLock<SyncPhase>,

    /// Consecutive phone failures.
    pub failure_count: RwLock<u32>,

    /// Whether the companion link is up.
    pub companion_connected: RwLock<bool>,

    /// Last successful sync.
    pub last_sync: RwLock<Option<LastSync>>,

    /// Time zone currently applied.
    pub time_zone: RwLock<Option<String>>,
}

impl Default for SyncState {
    fn default() -> Self {
        Self {
            phase: RwLock::new(SyncPhase::Idle),
            failure_count: RwLock::new(0),
            companion_connected: RwLock::new(false),
            last_sync: RwLock::new(None),
            time_zone: RwLock::new(None),
        }
    }
}

impl SyncState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_phase(&self, phase: SyncPhase, failure_count: u32) {
        *self.phase.write() = phase;
        *self.failure_count.write() = failure_count;
    }

    pub fn get_phase(&self) -> SyncPhase {
        *self.phase.read()
    }

    pub fn get_failure_count(&self) -> u32 {
        *self.failure_count.read()
    }

    pub fn set_companion_connected(&self, connected: bool) {
        *self.companion_connected.write() = connected;
    }

    pub fn is_companion_connected(&self) -> bool {
        *self.companion_connected.read()
    }

    pub fn record_success(&self, source: SourceKind, drift_ms: i64) {
        *self.last_sync.write() = Some(LastSync {
            source,
            at: Local::now(),
            drift_ms,
        });
    }

    pub fn get_last_sync(&self) -> Option<LastSync> {
        self.last_sync.read().clone()
    }

    pub fn set_time_zone(&self, zone: String) {
        *self.time_zone.write() = Some(zone);
    }

    pub fn get_time_zone(&self) -> Option<String> {
        self.time_zone.read().clone()
    }

    /// One-line summary for status logging.
    pub fn summary(&self) -> String {
        let last = match self.get_last_sync() {
            Some(last) => format!(
                "last sync {} via {} (drift {} ms)",
                last.at.format("%Y-%m-%d %H:%M:%S"),
                last.source.as_str(),
                last.drift_ms
            ),
            None => "never synced".to_string(),
        };
        format!(
            "{}, {} failures, companion {}, zone {}, {}",
            self.get_phase().as_str(),
            self.get_failure_count(),
            if self.is_companion_connected() { "up" } else { "down" },
            self.get_time_zone().as_deref().unwrap_or("unset"),
            last
        )
    }
}
