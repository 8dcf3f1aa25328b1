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

//! Device clock access.

use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::info;

use crate::events::ClockAdjustment;

/// Wall and monotonic clock of the device.
pub trait SystemClock: Send + Sync {
    /// Wall-clock time in milliseconds since the UNIX epoch.
    fn now_millis(&self) -> i64;

    /// Monotonic milliseconds since an arbitrary origin.
    fn elapsed_millis(&self) -> i64;

    /// Set the wall clock.
    fn set_millis(&self, millis: i64) -> Result<()>;
}

fn host_millis() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_millis() as i64,
        Err(e) => -(e.duration().as_millis() as i64),
    }
}

/// Corrected wall clock kept as an offset over the host clock.
pub struct OffsetClock {
    origin: Instant,
    offset_ms: Mutex<i64>,
}

impl OffsetClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset_ms: Mutex::new(0),
        }
    }

    /// Current correction applied over the host clock.
    pub fn offset_millis(&self) -> i64 {
        *self.offset_ms.lock()
    }
}

impl Default for OffsetClock {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemClock for OffsetClock {
    fn now_millis(&self) -> i64 {
        host_millis() + *self.offset_ms.lock()
    }

    fn elapsed_millis(&self) -> i64 {
        self.origin.elapsed().as_millis() as i64
    }

    fn set_millis(&self, millis: i64) -> Result<()> {
        *self.offset_ms.lock() = millis - host_millis();
        Ok(())
    }
}

/// Writes `CLOCK_REALTIME` directly. Requires CAP_SYS_TIME.
pub struct KernelClock {
    origin: Instant,
}

impl KernelClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for KernelClock {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemClock for KernelClock {
    fn now_millis(&self) -> i64 {
        host_millis()
    }

    fn elapsed_millis(&self) -> i64 {
        self.origin.elapsed().as_millis() as i64
    }

    fn set_millis(&self, millis: i64) -> Result<()> {
        // SAFETY: timespec is plain data; zeroed covers any padding fields.
        let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
        ts.tv_sec = millis.div_euclid(1000) as libc::time_t;
        ts.tv_nsec = (millis.rem_euclid(1000) * 1_000_000) as libc::c_long;

        // SAFETY: ts is a valid, initialized timespec.
        let rc = unsafe { libc::clock_settime(libc::CLOCK_REALTIME, &ts) };
        if rc != 0 {
            return Err(anyhow!(
                "clock_settime failed: {}",
                std::io::Error::last_os_error()
            ));
        }
        Ok(())
    }
}

/// Compare `reference_millis` against the device clock and write it when
/// the drift exceeds `threshold`.
pub fn adjust_clock(
    clock: &dyn SystemClock,
    reference_millis: i64,
    threshold: Duration,
) -> Result<ClockAdjustment> {
    let drift_ms = reference_millis - clock.now_millis();
    let applied = drift_ms.unsigned_abs() > threshold.as_millis() as u64;

    if applied {
        clock.set_millis(reference_millis)?;
        info!("Clock adjusted by {} ms", drift_ms);
    }

    Ok(ClockAdjustment { drift_ms, applied })
}

/// Clock under manual control, for tests.
#[cfg(test)]
pub struct ManualClock {
    now: Mutex<i64>,
    elapsed: Mutex<i64>,
    writes: Mutex<Vec<i64>>,
}

#[cfg(test)]
impl ManualClock {
    pub fn new(now_millis: i64) -> Self {
        Self {
            now: Mutex::new(now_millis),
            elapsed: Mutex::new(0),
            writes: Mutex::new(Vec::new()),
        }
    }

    /// Move both clocks forward.
    pub fn advance(&self, millis: i64) {
        *self.now.lock() += millis;
        *self.elapsed.lock() += millis;
    }

    pub fn writes(&self) -> Vec<i64> {
        self.writes.lock().clone()
    }
}

#[cfg(test)]
impl SystemClock for ManualClock {
    fn now_millis(&self) -> i64 {
        *self.now.lock()
    }

    fn elapsed_millis(&self) -> i64 {
        *self.elapsed.lock()
    }

    fn set_millis(&self, millis: i64) -> Result<()> {
        *self.now.lock() = millis;
        self.writes.lock().push(millis);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offset_clock_set() {
        let clock = OffsetClock::new();
        let target = clock.now_millis() + 3_600_000;

        clock.set_millis(target).unwrap();

        let offset = clock.offset_millis();
        assert!((offset - 3_600_000).abs() < 1_000);
        assert!((clock.now_millis() - target).abs() < 1_000);
    }

    #[test]
    fn test_adjust_within_threshold() {
        let clock = ManualClock::new(1_000_000);
        let adj = adjust_clock(&clock, 1_004_000, Duration::from_millis(5_000)).unwrap();

        assert_eq!(adj.drift_ms, 4_000);
        assert!(!adj.applied);
        assert!(clock.writes().is_empty());
    }

    #[test]
    fn test_adjust_beyond_threshold() {
        let clock = ManualClock::new(1_000_000);
        let adj = adjust_clock(&clock, 990_000, Duration::from_millis(5_000)).unwrap();

        assert_eq!(adj.drift_ms, -10_000);
        assert!(adj.applied);
        assert_eq!(clock.writes(), vec![990_000]);
        assert_eq!(clock.now_millis(), 990_000);
    }
}
