//! Application configuration.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

/// Application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Server configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// Realtime transport configuration.
    #[serde(default)]
    pub realtime: RealtimeConfig,
    /// Client synchronization configuration.
    #[serde(default)]
    pub sync: SyncConfig,
    /// Authentication configuration.
    #[serde(default)]
    pub auth: AuthConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to bind to.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Public URL of this instance.
    #[serde(default = "default_url")]
    pub url: String,
}

/// Realtime transport configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RealtimeConfig {
    /// Buffered events per channel before slow sessions start lagging.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// Extra time a session may stay open past its token expiry.
    #[serde(default)]
    pub token_grace_ms: u64,
}

/// Client synchronization configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Maximum automatic reconnection attempts before giving up.
    #[serde(default = "default_reconnect_max_attempts")]
    pub reconnect_max_attempts: u32,
    /// Delay before the first reconnection attempt.
    #[serde(default = "default_reconnect_initial_delay_ms")]
    pub reconnect_initial_delay_ms: u64,
    /// Upper bound on the reconnection delay.
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,
    /// Backoff multiplier applied per attempt.
    #[serde(default = "default_reconnect_multiplier")]
    pub reconnect_multiplier: f64,
    /// Random jitter applied to each delay, as a fraction of the delay.
    #[serde(default = "default_reconnect_jitter")]
    pub reconnect_jitter: f64,
    /// How long after the last keystroke a typing indicator auto-stops.
    #[serde(default = "default_typing_timeout_ms")]
    pub typing_timeout_ms: u64,
}

/// Authentication configuration.
///
/// Token issuance is handled outside this system; the server only resolves
/// already-issued tokens. The static table below exists for development and
/// testing deployments.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    /// Static token-to-user mapping for development deployments.
    #[serde(default)]
    pub static_tokens: HashMap<String, String>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

const fn default_port() -> u16 {
    3000
}

fn default_url() -> String {
    "http://localhost:3000".to_string()
}

const fn default_channel_capacity() -> usize {
    1000
}

const fn default_reconnect_max_attempts() -> u32 {
    5
}

const fn default_reconnect_initial_delay_ms() -> u64 {
    1000
}

const fn default_reconnect_max_delay_ms() -> u64 {
    30_000
}

const fn default_reconnect_multiplier() -> f64 {
    2.0
}

const fn default_reconnect_jitter() -> f64 {
    0.25
}

const fn default_typing_timeout_ms() -> u64 {
    3000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            url: default_url(),
        }
    }
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            token_grace_ms: 0,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            reconnect_max_attempts: default_reconnect_max_attempts(),
            reconnect_initial_delay_ms: default_reconnect_initial_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
            reconnect_multiplier: default_reconnect_multiplier(),
            reconnect_jitter: default_reconnect_jitter(),
            typing_timeout_ms: default_typing_timeout_ms(),
        }
    }
}

impl Config {
    /// Load configuration from files and environment variables.
    ///
    /// Configuration is loaded in the following order:
    /// 1. `config/default.toml`
    /// 2. `config/{environment}.toml` (based on `CHATWIRE_ENV`)
    /// 3. Environment variables with `CHATWIRE_` prefix
    ///
    /// A `.env` file in the working directory is read first, if present.
    pub fn load() -> Result<Self, config::ConfigError> {
        dotenvy::dotenv().ok();
        let env = std::env::var("CHATWIRE_ENV").unwrap_or_else(|_| "development".to_string());

        let config = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name(&format!("config/{env}")).required(false))
            .add_source(
                config::Environment::with_prefix("CHATWIRE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Load configuration from a specific file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, config::ConfigError> {
        let config = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("CHATWIRE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }
}
