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

//! Wear time sync daemon.

use anyhow::Result;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wear_timesync::alarms::{AlarmScheduler, TokioAlarms};
use wear_timesync::clock::{KernelClock, OffsetClock, SystemClock};
use wear_timesync::companion::{CompanionClient, CompanionLink};
use wear_timesync::config::{ClockMode, Config};
use wear_timesync::events;
use wear_timesync::manager::{RetryPolicy, TimeSyncManager};
use wear_timesync::refresh::{NetworkTimeCache, RefreshTimeCallable, SntpClient};
use wear_timesync::sources::{
    ModemNitzFeed, NetworkTimeSyncer, NitzFeed, NitzTimeSyncer, PhoneTimeSyncer,
};
use wear_timesync::state::SyncState;
use wear_timesync::storage::SyncHistory;
use wear_timesync::timezone::{FileTimeZoneSink, TimeZoneMediator};

const STATUS_INTERVAL: Duration = Duration::from_secs(600);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("wear_timesync=info".parse()?),
        )
        .init();

    info!("Starting wear-timesyncd v{}...", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = Config::load()?;
    info!("Configuration loaded");

    let clock: Arc<dyn SystemClock> = match config.clock.mode {
        ClockMode::Offset => Arc::new(OffsetClock::new()),
        ClockMode::Kernel => Arc::new(KernelClock::new()),
    };
    info!("Clock mode: {:?}", config.clock.mode);

    // Initialize storage
    let history = if config.history.enabled {
        match SyncHistory::new(&config.data_dir, config.history.max_entries) {
            Ok(history) => Some(history),
            Err(e) => {
                warn!("Sync history unavailable: {}", e);
                None
            }
        }
    } else {
        None
    };

    let state = SyncState::new();
    let (event_tx, mut event_rx) = events::channel();
    let alarms = Arc::new(TokioAlarms::new(event_tx.clone()));
    let time_zone = TimeZoneMediator::new(
        Box::new(FileTimeZoneSink::new(config.data_dir.join("timezone"))),
        state.clone(),
    );

    // Companion link
    let companion = CompanionClient::new(
        config.companion.address.clone(),
        Duration::from_secs(config.companion.reconnect_delay_secs),
    );
    let companion_task = companion.clone().spawn(event_tx.clone());
    info!("Companion bridge: {}", config.companion.address);

    // Time sources
    let phone = PhoneTimeSyncer::new(
        companion as Arc<dyn CompanionLink>,
        alarms.clone(),
        clock.clone(),
        time_zone.clone(),
        Duration::from_secs(config.phone.request_timeout_secs),
        config.drift_threshold(),
    );

    let cache = NetworkTimeCache::new(Box::new(SntpClient::new(
        config.network.server.clone(),
        Duration::from_millis(config.network.timeout_ms),
    )));
    let polling_interval = Duration::from_secs(config.network.polling_interval_secs);
    let network = NetworkTimeSyncer::new(
        RefreshTimeCallable::new(
            Arc::new(Mutex::new(cache)),
            clock.clone(),
            polling_interval,
            config.drift_threshold(),
        ),
        alarms.clone(),
        event_tx.clone(),
        polling_interval,
        Duration::from_secs(config.network.polling_interval_shorter_secs),
        config.network.retry_count,
    );

    let feed = config
        .nitz
        .device
        .as_ref()
        .map(|device| Arc::new(ModemNitzFeed::new(device.clone())) as Arc<dyn NitzFeed>);
    if feed.is_none() {
        info!("No NITZ device configured");
    }
    let nitz = NitzTimeSyncer::new(
        feed,
        clock.clone(),
        time_zone.clone(),
        event_tx.clone(),
        config.drift_threshold(),
    );
    drop(event_tx);

    let mut manager = TimeSyncManager::new(
        Box::new(phone),
        Box::new(network),
        Box::new(nitz),
        alarms.clone() as Arc<dyn AlarmScheduler>,
        RetryPolicy::from(&config.phone),
        state.clone(),
        time_zone,
        history,
    );

    info!("Ready.");

    let mut status = tokio::time::interval(STATUS_INTERVAL);
    status.tick().await;

    loop {
        tokio::select! {
            Some(event) = event_rx.recv() => {
                manager.handle_event(event);
            }
            _ = status.tick() => {
                info!("Status: {}", state.summary());
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    manager.shutdown();
    alarms.cancel_all();
    companion_task.abort();

    info!("wear-timesyncd stopped");
    Ok(())
}
