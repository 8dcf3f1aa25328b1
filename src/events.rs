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

//! Events flowing into the sync manager.
//!
//! Every asynchronous piece of the daemon (alarms, the companion link, the
//! NITZ feed, network refresh workers) reports back through a single
//! channel of [`SyncEvent`]s, which the manager drains on one task.

use tokio::sync::mpsc;

use crate::alarms::Alarm;
use crate::companion::TimeResponsePayload;
use crate::refresh::RefreshOutcome;
use crate::sources::nitz::NitzSignal;

/// Sending half of the manager's event channel.
pub type EventSender = mpsc::UnboundedSender<SyncEvent>;

/// Receiving half of the manager's event channel.
pub type EventReceiver = mpsc::UnboundedReceiver<SyncEvent>;

/// Create the manager's event channel.
pub fn channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// The three competing time sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    Phone,
    Network,
    Nitz,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Phone => "PHONE",
            SourceKind::Network => "NETWORK",
            SourceKind::Nitz => "NITZ",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PHONE" => Some(SourceKind::Phone),
            "NETWORK" => Some(SourceKind::Network),
            "NITZ" => Some(SourceKind::Nitz),
            _ => None,
        }
    }
}

/// Clock correction observed while handling a reference time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClockAdjustment {
    /// Reference time minus device time, in milliseconds.
    pub drift_ms: i64,
    /// Whether the device clock was written.
    pub applied: bool,
}

/// Result of a sync attempt, reported by a source handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Success(ClockAdjustment),
    Failure(String),
}

impl SyncOutcome {
    pub fn failure(reason: impl Into<String>) -> Self {
        SyncOutcome::Failure(reason.into())
    }
}

/// Data delivered to a specific source.
#[derive(Debug, Clone)]
pub enum SourceInput {
    /// Time response (or unsolicited push) from the phone.
    PhoneTime(TimeResponsePayload),
    /// Result of a network refresh worker, tagged with the refresh it
    /// belongs to.
    NetworkRefreshed {
        generation: u64,
        result: Result<RefreshOutcome, String>,
    },
    /// Parsed NITZ report from the modem.
    Nitz(NitzSignal),
}

impl SourceInput {
    /// The source this input belongs to.
    pub fn source(&self) -> SourceKind {
        match self {
            SourceInput::PhoneTime(_) => SourceKind::Phone,
            SourceInput::NetworkRefreshed { .. } => SourceKind::Network,
            SourceInput::Nitz(_) => SourceKind::Nitz,
        }
    }
}

/// Everything the manager reacts to.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// A scheduled alarm expired.
    Alarm { alarm: Alarm, generation: u64 },
    /// Input for one of the sources.
    Input(SourceInput),
    /// Companion link established.
    CompanionConnected { address: String },
    /// Companion link lost.
    CompanionDisconnected,
}
