use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::room::Participant;

pub const DEFAULT_CONFIG_FILE: &str = "room_sync.toml";
const ENV_PREFIX: &str = "ROOM_SYNC";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// WebSocket endpoint of the messaging backend.
    pub ws_url: String,
    /// Base URL of the REST API serving room history.
    pub api_url: String,
    /// Bearer token for both the socket handshake and REST calls.
    #[serde(default)]
    pub token: Option<String>,
    pub participant: Participant,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub typing: TypingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_factor: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        ReconnectConfig {
            max_attempts: 5,
            initial_delay_ms: 500,
            max_delay_ms: 10_000,
            backoff_factor: 2.0,
        }
    }
}

impl ReconnectConfig {
    /// Delay before reconnect `attempt` (1-based), without jitter. Never
    /// exceeds `max_delay_ms`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let max = Duration::from_millis(self.max_delay_ms);
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let initial = Duration::from_millis(self.initial_delay_ms);
        Duration::try_from_secs_f64(initial.as_secs_f64() * self.backoff_factor.powi(exponent))
            .map_or(max, |delay| delay.min(max))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypingConfig {
    pub expiry_ms: u64,
    /// Minimum gap between outgoing typing signals.
    pub signal_interval_ms: u64,
}

impl Default for TypingConfig {
    fn default() -> Self {
        TypingConfig {
            expiry_ms: 3_000,
            signal_interval_ms: 1_000,
        }
    }
}

impl TypingConfig {
    pub fn expiry(&self) -> Duration {
        Duration::from_millis(self.expiry_ms)
    }

    pub fn signal_interval(&self) -> Duration {
        Duration::from_millis(self.signal_interval_ms)
    }
}

impl ClientConfig {
    /// Layers built-in defaults, the optional TOML file and `ROOM_SYNC__*`
    /// environment variables, later sources winning.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));
        let defaults = ReconnectConfig::default();
        let typing = TypingConfig::default();

        let built = Config::builder()
            .set_default("ws_url", "ws://127.0.0.1:3003/ws")?
            .set_default("api_url", "http://127.0.0.1:3000/api")?
            .set_default("participant.id", "guest")?
            .set_default("participant.name", "Guest")?
            .set_default("reconnect.max_attempts", i64::from(defaults.max_attempts))?
            .set_default("reconnect.initial_delay_ms", defaults.initial_delay_ms)?
            .set_default("reconnect.max_delay_ms", defaults.max_delay_ms)?
            .set_default("reconnect.backoff_factor", defaults.backoff_factor)?
            .set_default("typing.expiry_ms", typing.expiry_ms)?
            .set_default("typing.signal_interval_ms", typing.signal_interval_ms)?
            .add_source(File::from(path).format(FileFormat::Toml).required(false))
            .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;

        Ok(built.try_deserialize()?)
    }
}
