use profile_store::ObisCode;
use serde::Deserialize;
use std::{fs, time::Duration};

use crate::sync::SyncSettings;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    pub bind_addr: String,
    /// Largest frame (header included) accepted before the connection is closed.
    pub max_frame_len: usize,
    pub outbound_queue: usize,
    /// Inbound frames kept per channel for diagnostics.
    pub frame_history: usize,
    pub status_channel_capacity: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:4059".to_string(),
            max_frame_len: 64 * 1024,
            outbound_queue: 32,
            frame_history: 8,
            status_channel_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CorrelationConfig {
    pub request_timeout_ms: u64,
    pub purge_interval_ms: u64,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 30_000,
            purge_interval_ms: 60_000,
        }
    }
}

impl CorrelationConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_millis(self.purge_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProfileConfig {
    pub obis: ObisCode,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

fn default_batch_size() -> usize {
    96
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub default_model: String,
    pub lock_wait_ms: u64,
    pub unknown_period_window_secs: u64,
    pub max_rows_per_run: usize,
    pub max_run_time_secs: u64,
    /// Worker pool size; two per CPU when unset.
    pub workers: Option<usize>,
    pub max_blocks: u32,
    pub profiles: Vec<ProfileConfig>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 900,
            default_model: "unknown".to_string(),
            lock_wait_ms: 2_000,
            unknown_period_window_secs: 24 * 3600,
            max_rows_per_run: 10_000,
            max_run_time_secs: 600,
            workers: None,
            max_blocks: 256,
            profiles: vec![ProfileConfig {
                obis: ObisCode::new(1, 0, 99, 1, 0, 255),
                batch_size: default_batch_size(),
            }],
        }
    }
}

impl SyncConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_wait_ms)
    }

    pub fn settings(&self) -> SyncSettings {
        SyncSettings {
            unknown_period_window: Duration::from_secs(self.unknown_period_window_secs.max(1)),
            max_rows_per_run: self.max_rows_per_run.max(1),
            max_run_time: Duration::from_secs(self.max_run_time_secs),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreConfig {
    #[default]
    Memory,
    Postgres {
        uri: String,
        #[serde(default = "default_max_connections")]
        max_connections: u32,
        #[serde(default = "default_max_retries")]
        max_retries: u32,
        #[serde(default = "default_retry_backoff_ms")]
        retry_backoff_ms: u64,
    },
}

fn default_max_connections() -> u32 {
    5
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    500
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub bind_addr: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub listener: ListenerConfig,
    #[serde(default)]
    pub correlation: CorrelationConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub store: StoreConfig,
    pub metrics: Option<MetricsConfig>,
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        use std::env;

        let path = env::var("HEADEND_CONFIG").unwrap_or_else(|_| "headend-config.toml".to_string());
        let contents = fs::read_to_string(&path)?;
        let cfg = Self::parse(&contents)?;
        Ok(cfg)
    }

    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }
}
