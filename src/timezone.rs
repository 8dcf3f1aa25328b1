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

//! Time zone selection between phone and NITZ.
//!
//! The phone's zone wins while the companion is connected and has reported
//! one. Otherwise NITZ decides: an explicit zone id if the network sent a
//! valid one, the current zone if it already matches the reported offset,
//! or a fixed `Etc/GMT` zone for whole-hour offsets.

use anyhow::{anyhow, Result};
use jiff::tz::TimeZone;
use jiff::Timestamp;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::sources::nitz::NitzSignal;
use crate::state::SyncState;

/// Where the selected zone is applied.
pub trait TimeZoneSink: Send + Sync {
    /// Zone currently in effect, if known.
    fn current(&self) -> Option<String>;

    /// Make `zone` the device zone.
    fn apply(&self, zone: &str) -> Result<()>;
}

/// Persists the zone id to a file in the data directory.
pub struct FileTimeZoneSink {
    path: PathBuf,
}

impl FileTimeZoneSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl TimeZoneSink for FileTimeZoneSink {
    fn current(&self) -> Option<String> {
        let content = std::fs::read_to_string(&self.path).ok()?;
        let zone = content.trim();
        if zone.is_empty() {
            None
        } else {
            Some(zone.to_string())
        }
    }

    fn apply(&self, zone: &str) -> Result<()> {
        std::fs::write(&self.path, format!("{}\n", zone))?;
        Ok(())
    }
}

struct MediatorInner {
    companion_connected: bool,
    phone_zone: Option<String>,
    current: Option<String>,
}

/// Arbitrates the device time zone.
pub struct TimeZoneMediator {
    sink: Box<dyn TimeZoneSink>,
    state: Arc<SyncState>,
    inner: Mutex<MediatorInner>,
}

impl TimeZoneMediator {
    pub fn new(sink: Box<dyn TimeZoneSink>, state: Arc<SyncState>) -> Arc<Self> {
        let current = sink.current();
        if let Some(zone) = &current {
            state.set_time_zone(zone.clone());
        }

        Arc::new(Self {
            sink,
            state,
            inner: Mutex::new(MediatorInner {
                companion_connected: false,
                phone_zone: None,
                current,
            }),
        })
    }

    /// Zone currently applied.
    pub fn current(&self) -> Option<String> {
        self.inner.lock().current.clone()
    }

    pub fn set_companion_connected(&self, connected: bool) {
        self.inner.lock().companion_connected = connected;
    }

    /// Zone reported by the phone.
    pub fn on_phone_time_zone(&self, zone: &str) -> Result<()> {
        validate_zone(zone)?;

        let mut inner = self.inner.lock();
        inner.phone_zone = Some(zone.to_string());
        self.apply(&mut inner, zone)
    }

    /// Zone information from a NITZ report.
    pub fn on_nitz(&self, signal: &NitzSignal) -> Result<()> {
        let mut inner = self.inner.lock();

        if inner.companion_connected && inner.phone_zone.is_some() {
            debug!("Ignoring NITZ zone while phone zone is authoritative");
            return Ok(());
        }

        if let Some(zone) = &signal.zone_id {
            match validate_zone(zone) {
                Ok(()) => return self.apply(&mut inner, zone),
                Err(e) => warn!("NITZ zone id rejected: {}", e),
            }
        }

        let offset_secs = signal.offset_minutes * 60;

        if let Some(current) = &inner.current {
            if offset_at(current, signal.utc_millis)? == Some(offset_secs) {
                debug!("Current zone {} matches NITZ offset", current);
                return Ok(());
            }
        }

        match fixed_zone_for_offset(offset_secs) {
            Some(zone) => self.apply(&mut inner, &zone),
            None => {
                warn!(
                    "No zone for NITZ offset {} min, keeping {:?}",
                    signal.offset_minutes, inner.current
                );
                Ok(())
            }
        }
    }

    fn apply(&self, inner: &mut MediatorInner, zone: &str) -> Result<()> {
        if inner.current.as_deref() == Some(zone) {
            return Ok(());
        }

        self.sink.apply(zone)?;
        info!(
            "Time zone changed: {} -> {}",
            inner.current.as_deref().unwrap_or("unset"),
            zone
        );
        inner.current = Some(zone.to_string());
        self.state.set_time_zone(zone.to_string());
        Ok(())
    }
}

fn validate_zone(zone: &str) -> Result<()> {
    TimeZone::get(zone)
        .map(|_| ())
        .map_err(|e| anyhow!("Unknown time zone '{}': {}", zone, e))
}

/// UTC offset in seconds of `zone` at `utc_millis`, None for unknown zones.
fn offset_at(zone: &str, utc_millis: i64) -> Result<Option<i32>> {
    let tz = match TimeZone::get(zone) {
        Ok(tz) => tz,
        Err(_) => return Ok(None),
    };
    let ts = Timestamp::from_millisecond(utc_millis)
        .map_err(|e| anyhow!("NITZ time out of range: {}", e))?;
    Ok(Some(tz.to_offset(ts).seconds()))
}

/// `Etc/GMT` zones carry inverted signs: `Etc/GMT-2` is UTC+2.
fn fixed_zone_for_offset(offset_secs: i32) -> Option<String> {
    if offset_secs % 3600 != 0 {
        return None;
    }
    let hours = offset_secs / 3600;
    let zone = match hours {
        0 => "Etc/UTC".to_string(),
        -12..=14 => format!("Etc/GMT{:+}", -hours),
        _ => return None,
    };
    validate_zone(&zone).ok().map(|_| zone)
}
