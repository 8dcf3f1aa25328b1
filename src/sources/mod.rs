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

//! Time sources arbitrated by the manager.
//!
//! Every source exposes the same capability set. Handlers run on the
//! manager's task and may return a [`SyncOutcome`], which the manager feeds
//! into its success or failure path. Long-running work (network requests,
//! listening to the modem) is spawned and reports back as a
//! [`SourceInput`] through the event channel.

pub mod network;
pub mod nitz;
pub mod phone;

pub use network::NetworkTimeSyncer;
pub use nitz::{ModemNitzFeed, NitzFeed, NitzSignal, NitzTimeSyncer};
pub use phone::PhoneTimeSyncer;

use crate::events::{SourceInput, SourceKind, SyncOutcome};

/// Uniform capability interface of a time source.
pub trait TimeSource: Send {
    /// Which source this is.
    fn kind(&self) -> SourceKind;

    /// Begin a sync attempt.
    fn start_update(&mut self) -> Option<SyncOutcome>;

    /// The source's scheduled alarm fired.
    fn handle_refresh(&mut self) -> Option<SyncOutcome>;

    /// An outstanding request timed out.
    fn handle_request_timeout(&mut self) -> Option<SyncOutcome> {
        None
    }

    /// A result for this source arrived.
    fn handle_input(&mut self, input: SourceInput) -> Option<SyncOutcome>;

    /// Drop every outstanding piece of work.
    fn cancel_pending_tasks(&mut self);
}
