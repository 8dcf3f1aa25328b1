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

//! Wearable time synchronization.
//!
//! Keeps the device clock and time zone correct by arbitrating between the
//! paired phone, network time (SNTP) and cellular NITZ reports.

pub mod alarms;
pub mod clock;
pub mod companion;
pub mod config;
pub mod events;
pub mod manager;
pub mod refresh;
pub mod sources;
pub mod state;
pub mod storage;
pub mod timezone;

#[cfg(test)]
mod testing;
