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

//! Configuration module.
//!
//! Handles loading and saving daemon settings.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::manager::MAX_FAILURE_RETRY_COUNT;

const APP_DIR: &str = "wear-timesync";

/// Daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory for history and time zone state.
    #[serde(skip)]
    pub data_dir: PathBuf,

    /// Companion link settings.
    pub companion: CompanionConfig,

    /// Phone sync policy.
    pub phone: PhoneConfig,

    /// Network (SNTP) sync settings.
    pub network: NetworkConfig,

    /// NITZ feed settings.
    pub nitz: NitzConfig,

    /// Clock settings.
    pub clock: ClockConfig,

    /// History settings.
    pub history: HistoryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompanionConfig {
    /// Address of the phone companion bridge.
    pub address: String,

    /// Delay before reconnecting after the link drops.
    pub reconnect_delay_secs: u64,
}

impl Default for CompanionConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:7420".to_string(),
            reconnect_delay_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PhoneConfig {
    /// How long to wait for a TIME_RESP.
    pub request_timeout_secs: u64,

    /// Backoff between retries while below the failure limit.
    pub retry_interval_secs: u64,

    /// Consecutive failures tolerated before falling back.
    pub max_failure_retry_count: u32,

    /// Backoff between phone retries once fallbacks are running.
    pub fallback_retry_interval_secs: u64,

    /// Periodic resync after a success. 0 disables.
    pub resync_interval_secs: u64,
}

impl Default for PhoneConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 30,
            retry_interval_secs: 60,
            max_failure_retry_count: MAX_FAILURE_RETRY_COUNT,
            fallback_retry_interval_secs: 900,
            resync_interval_secs: 6 * 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// SNTP server as `host:port`.
    pub server: String,

    /// SNTP request timeout in milliseconds.
    pub timeout_ms: u64,

    /// Maximum age of cached network time before a refresh is forced.
    pub polling_interval_secs: u64,

    /// Retry interval after a failed refresh.
    pub polling_interval_shorter_secs: u64,

    /// Short retries before waiting a full polling interval.
    pub retry_count: u32,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            server: "pool.ntp.org:123".to_string(),
            timeout_ms: 5_000,
            polling_interval_secs: 24 * 3600,
            polling_interval_shorter_secs: 60,
            retry_count: 3,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NitzConfig {
    /// Modem device or file emitting NITZ lines. NITZ is unavailable when unset.
    pub device: Option<PathBuf>,
}

/// How clock writes reach the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClockMode {
    /// Keep a corrected clock inside the daemon.
    Offset,
    /// Write CLOCK_REALTIME.
    Kernel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockConfig {
    pub mode: ClockMode,

    /// Drift tolerated before the clock is written.
    pub drift_threshold_ms: u64,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            mode: ClockMode::Offset,
            drift_threshold_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Enable sync history.
    pub enabled: bool,

    /// Maximum number of history entries.
    pub max_entries: u32,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: 1000,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            companion: CompanionConfig::default(),
            phone: PhoneConfig::default(),
            network: NetworkConfig::default(),
            nitz: NitzConfig::default(),
            clock: ClockConfig::default(),
            history: HistoryConfig::default(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
        .join("config.toml")
}

impl Config {
    /// Load configuration from the default location or create it.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&default_config_path())?;

        // Set data directory
        config.data_dir = default_data_dir();
        std::fs::create_dir_all(&config.data_dir)?;

        Ok(config)
    }

    /// Load configuration from `path`, writing defaults when missing.
    pub fn load_from(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let config: Self = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str(&content)?
        } else {
            let config = Self::default();
            let content = toml::to_string_pretty(&config)?;
            std::fs::write(path, content)?;
            config
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the sync loop cannot run with.
    pub fn validate(&self) -> Result<()> {
        let intervals = [
            ("phone.request_timeout_secs", self.phone.request_timeout_secs),
            ("phone.retry_interval_secs", self.phone.retry_interval_secs),
            (
                "phone.fallback_retry_interval_secs",
                self.phone.fallback_retry_interval_secs,
            ),
            ("network.timeout_ms", self.network.timeout_ms),
            ("network.polling_interval_secs", self.network.polling_interval_secs),
            (
                "network.polling_interval_shorter_secs",
                self.network.polling_interval_shorter_secs,
            ),
            ("companion.reconnect_delay_secs", self.companion.reconnect_delay_secs),
        ];
        for (name, value) in intervals {
            if value == 0 {
                bail!("{} must be greater than zero", name);
            }
        }

        if self.network.polling_interval_shorter_secs > self.network.polling_interval_secs {
            bail!("network.polling_interval_shorter_secs exceeds network.polling_interval_secs");
        }

        if self.network.server.trim().is_empty() {
            bail!("network.server must not be empty");
        }

        Ok(())
    }

    pub fn drift_threshold(&self) -> Duration {
        Duration::from_millis(self.clock.drift_threshold_ms)
    }
}
