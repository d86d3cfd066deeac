//! Application configuration loaded from environment variables and config files.
//!
//! Supports `.env` files for development and environment variables for production.
//! Config precedence: env vars > .env file > duet.toml > defaults

use serde::Deserialize;
use std::sync::OnceLock;
use std::time::Duration;

static CONFIG: OnceLock<AppConfig> = OnceLock::new();

pub use config::ConfigError;

/// Get the global application configuration.
///
/// # Panics
/// Panics if config has not been initialized via [`init`].
pub fn get() -> &'static AppConfig {
    CONFIG.get().expect("Config not initialized. Call duet_common::config::init() first.")
}

/// Initialize the global configuration from environment.
///
/// Should be called once at application startup, before any other code accesses config.
pub fn init() -> Result<&'static AppConfig, ConfigError> {
    // Load .env file if present (development)
    let _ = dotenvy::dotenv();

    let app_config = load(Some("duet"))?;
    Ok(CONFIG.get_or_init(|| app_config))
}

/// Build a configuration without touching the global.
///
/// `file` names an optional config file (extension resolved by the `config` crate).
pub fn load(file: Option<&str>) -> Result<AppConfig, ConfigError> {
    let mut builder = config::Config::builder()
        // Defaults
        .set_default("signaling.url", "ws://localhost:8000/ws/call/")?
        .set_default("signaling.reconnect_delay_ms", 3000)?
        .set_default("signaling.connect_timeout_ms", 10000)?
        .set_default("call.offer_delay_ms", 1000)?
        .set_default("call.in_call_delay_ms", 2000)?
        .set_default("identity.mode", "remote")?
        .set_default("identity.url", "http://localhost:8000")?
        .set_default("media.audio", true)?
        .set_default("media.video", true)?
        .set_default("media.bind_ip", "0.0.0.0")?
        .set_default(
            "media.stun_urls",
            vec!["stun:stun.l.google.com:19302", "stun:stun1.l.google.com:19302"],
        )?;

    if let Some(name) = file {
        builder = builder.add_source(config::File::with_name(name).required(false));
    }

    let cfg = builder
        // Environment variables (DUET_SIGNALING__URL, DUET_IDENTITY__MODE, etc.)
        .add_source(
            config::Environment::with_prefix("DUET")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let app_config: AppConfig = cfg.try_deserialize()?;
    app_config.validate()?;
    Ok(app_config)
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub signaling: SignalingConfig,
    pub call: CallTimingConfig,
    pub identity: IdentityConfig,
    pub media: MediaConfig,
}

impl AppConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        let url = url::Url::parse(&self.signaling.url)
            .map_err(|e| ConfigError::Message(format!("signaling.url: {e}")))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(ConfigError::Message(format!(
                "signaling.url must use ws:// or wss://, got {}",
                url.scheme()
            )));
        }
        if self.identity.mode == IdentityMode::Remote {
            url::Url::parse(&self.identity.url)
                .map_err(|e| ConfigError::Message(format!("identity.url: {e}")))?;
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SignalingConfig {
    /// WebSocket URL of the coordinating service.
    pub url: String,
    /// Fixed delay before each reconnect attempt. There is no backoff growth.
    pub reconnect_delay_ms: u64,
    /// Upper bound on one dial, handshake included. A dial that hangs longer
    /// counts as failed and the fixed reconnect delay starts.
    pub connect_timeout_ms: u64,
}

impl SignalingConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CallTimingConfig {
    /// Delay between Matched and the caller emitting its offer.
    pub offer_delay_ms: u64,
    /// Delay between Matched and InCall. The coordinator sends no confirmation
    /// for this step; the delay only gives both sides time to finish local setup.
    pub in_call_delay_ms: u64,
}

impl CallTimingConfig {
    pub fn offer_delay(&self) -> Duration {
        Duration::from_millis(self.offer_delay_ms)
    }

    pub fn in_call_delay(&self) -> Duration {
        Duration::from_millis(self.in_call_delay_ms)
    }
}

/// How the bearer token is provisioned.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum IdentityMode {
    /// Issued by the identity endpoint.
    Remote,
    /// Generated on this device.
    Local,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IdentityConfig {
    pub mode: IdentityMode,
    /// Base URL of the identity endpoint (remote mode only).
    pub url: String,
    /// Where to persist the token between runs. In-memory when unset.
    pub token_path: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MediaConfig {
    pub audio: bool,
    pub video: bool,
    /// Local address the peer engine binds its UDP socket to.
    pub bind_ip: String,
    /// Logged at startup only. The peer engine gathers host candidates and
    /// does not query these servers, so calls across NAT are not supported.
    pub stun_urls: Vec<String>,
}
