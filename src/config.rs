use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Label every peer data channel is opened under.
pub const DATA_CHANNEL_LABEL: &str = "rtc-battery";

/// Default port of the signaling relay binary.
pub const DEFAULT_RELAY_PORT: u16 = 8081;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub signaling: SignalingConfig,
    pub storage: StorageConfig,
    /// Delay between the last apply and the debounced SQL snapshot write.
    pub snapshot_debounce_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalingConfig {
    /// Relay URL, e.g. `ws://localhost:8081`. May also be passed to `connect`.
    pub url: Option<String>,
    /// Room token. The token is both the room name and the only credential.
    pub token: Option<String>,
    pub reconnect: ReconnectConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Base delay for exponential backoff (ms)
    pub base_delay_ms: u64,
    /// Maximum backoff delay (ms)
    pub max_delay_ms: u64,
    /// Attempts before giving up and reporting `disconnected`
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding the op log, snapshot, and meta store.
    /// `None` keeps everything in memory (tests, throwaway nodes).
    pub dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            signaling: SignalingConfig::default(),
            storage: StorageConfig { dir: None },
            snapshot_debounce_ms: 1_000,
        }
    }
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            url: None,
            token: None,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            max_attempts: 10,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            signaling: SignalingConfig {
                url: env::var("BATTERY_SIGNALING_URL").ok(),
                token: env::var("BATTERY_ROOM_TOKEN").ok(),
                reconnect: ReconnectConfig::default(),
            },
            storage: StorageConfig {
                dir: env::var("BATTERY_DATA_DIR").ok().map(PathBuf::from),
            },
            snapshot_debounce_ms: env::var("BATTERY_SNAPSHOT_DEBOUNCE_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1_000),
        }
    }
}

impl ReconnectConfig {
    /// Backoff delay for a 1-based reconnect attempt:
    /// `min(base * 2^(attempt - 1), max)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u64 << (attempt.saturating_sub(1)).min(16);
        Duration::from_millis(
            self.base_delay_ms
                .saturating_mul(factor)
                .min(self.max_delay_ms),
        )
    }
}
