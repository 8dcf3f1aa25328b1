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

//! Network time refresh.
//!
//! Network time is cached together with the monotonic instant it was
//! obtained, so it stays usable until the polling interval elapses. A
//! refresh only hits the network when the cache is at least that old, and
//! only writes the clock when the drift exceeds the configured threshold.

use anyhow::{anyhow, bail, Result};
use parking_lot::Mutex;
use std::net::UdpSocket;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::clock::{adjust_clock, SystemClock};
use crate::events::ClockAdjustment;

/// One network time reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NtpSample {
    /// Network time at the moment the reply arrived.
    pub time_millis: i64,
    pub round_trip_ms: i64,
}

/// Source of network time readings.
pub trait NtpClient: Send + Sync {
    /// Query the network. Blocking.
    fn request_time(&self) -> Result<NtpSample>;
}

/// SNTP over UDP.
pub struct SntpClient {
    server: String,
    timeout: Duration,
}

impl SntpClient {
    pub fn new(server: impl Into<String>, timeout: Duration) -> Self {
        Self {
            server: server.into(),
            timeout,
        }
    }
}

impl NtpClient for SntpClient {
    fn request_time(&self) -> Result<NtpSample> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.set_read_timeout(Some(self.timeout))?;

        let result = sntpc::simple_get_time(&self.server, &socket)
            .map_err(|e| anyhow!("SNTP request to {} failed: {:?}", self.server, e))?;

        let fraction_ms = ((result.sec_fraction() as u64 * 1000) >> 32) as i64;
        let server_millis = result.sec() as i64 * 1000 + fraction_ms;
        let round_trip_ms = (result.roundtrip() / 1000) as i64;

        debug!(
            "SNTP reply from {}: {} ms, rtt {} ms",
            self.server, server_millis, round_trip_ms
        );

        Ok(NtpSample {
            time_millis: server_millis + round_trip_ms / 2,
            round_trip_ms,
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct CachedSample {
    time_millis: i64,
    elapsed_millis: i64,
}

/// Last network time reading, aged against the monotonic clock.
pub struct NetworkTimeCache {
    client: Box<dyn NtpClient>,
    last: Option<CachedSample>,
}

impl NetworkTimeCache {
    pub fn new(client: Box<dyn NtpClient>) -> Self {
        Self { client, last: None }
    }

    /// Age of the cached reading, None when nothing was fetched yet.
    pub fn cache_age(&self, clock: &dyn SystemClock) -> Option<Duration> {
        self.last.map(|s| {
            let age = (clock.elapsed_millis() - s.elapsed_millis).max(0);
            Duration::from_millis(age as u64)
        })
    }

    /// Network time now, extrapolated from the cached reading.
    pub fn current_time_millis(&self, clock: &dyn SystemClock) -> Option<i64> {
        self.last
            .map(|s| s.time_millis + (clock.elapsed_millis() - s.elapsed_millis))
    }

    /// Fetch a new reading regardless of cache age.
    pub fn force_refresh(&mut self, clock: &dyn SystemClock) -> Result<()> {
        let sample = self.client.request_time()?;
        self.last = Some(CachedSample {
            time_millis: sample.time_millis,
            elapsed_millis: clock.elapsed_millis(),
        });
        Ok(())
    }

    fn is_older_than(&self, clock: &dyn SystemClock, max_age: Duration) -> bool {
        match self.cache_age(clock) {
            Some(age) => age >= max_age,
            None => true,
        }
    }
}

/// Result of a successful refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshOutcome {
    pub adjustment: ClockAdjustment,
    /// Whether the network was queried.
    pub refreshed: bool,
}

/// One network time poll. Cheap to clone; runs on a blocking worker.
#[derive(Clone)]
pub struct RefreshTimeCallable {
    cache: Arc<Mutex<NetworkTimeCache>>,
    clock: Arc<dyn SystemClock>,
    polling_interval: Duration,
    drift_threshold: Duration,
}

impl RefreshTimeCallable {
    pub fn new(
        cache: Arc<Mutex<NetworkTimeCache>>,
        clock: Arc<dyn SystemClock>,
        polling_interval: Duration,
        drift_threshold: Duration,
    ) -> Self {
        Self {
            cache,
            clock,
            polling_interval,
            drift_threshold,
        }
    }

    pub fn call(&self) -> Result<RefreshOutcome> {
        let clock = self.clock.as_ref();
        let mut cache = self.cache.lock();

        let mut refreshed = false;
        if cache.is_older_than(clock, self.polling_interval) {
            match cache.force_refresh(clock) {
                Ok(()) => refreshed = true,
                Err(e) => warn!("Network time refresh failed: {}", e),
            }
        }

        if cache.is_older_than(clock, self.polling_interval) {
            bail!("no network time newer than {:?}", self.polling_interval);
        }

        let network_now = cache
            .current_time_millis(clock)
            .ok_or_else(|| anyhow!("network time cache empty"))?;
        let adjustment = adjust_clock(clock, network_now, self.drift_threshold)?;

        if adjustment.applied {
            info!("Clock set from network time (drift {} ms)", adjustment.drift_ms);
        } else {
            debug!("Network time within threshold (drift {} ms)", adjustment.drift_ms);
        }

        Ok(RefreshOutcome {
            adjustment,
            refreshed,
        })
    }
}
