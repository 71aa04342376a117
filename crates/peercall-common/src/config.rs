//! Application configuration loaded from environment variables and config files.
//!
//! Supports `.env` files for development and environment variables for production.
//! `.env` only fills in variables that are not already set.
//! Config precedence: env vars > .env file > peercall.toml > defaults

use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::Duration;

static CONFIG: OnceLock<AppConfig> = OnceLock::new();

/// Get the global application configuration.
///
/// # Panics
/// Panics if config has not been initialized via [`init`].
pub fn get() -> &'static AppConfig {
    CONFIG.get().expect("Config not initialized. Call peercall_common::config::init() first.")
}

/// Initialize the global configuration from environment.
///
/// Should be called once at application startup, before any other code accesses config.
pub fn init() -> Result<&'static AppConfig, config::ConfigError> {
    let app_config = AppConfig::load()?;
    Ok(CONFIG.get_or_init(|| app_config))
}

fn builder() -> Result<config::ConfigBuilder<config::builder::DefaultState>, config::ConfigError> {
    config::Config::builder()
        .set_default("call.dial_timeout_secs", 30)?
        .set_default("call.ring_timeout_secs", 30)?
        .set_default("call.busy_reply", true)?
        .set_default("media.audio", true)?
        .set_default("media.video", false)?
        .set_default("rtc.bundle_policy", "max-compat")?
        .set_default("rtc.rtcp_mux_policy", "negotiate")?
        .set_default("logging.filter", "peercall=info")?
        .set_default("logging.json", false)
}

/// Environment variables: `PEERCALL_CALL__DIAL_TIMEOUT_SECS`, `PEERCALL_MEDIA__VIDEO`, etc.
fn environment() -> config::Environment {
    config::Environment::with_prefix("PEERCALL")
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}

impl AppConfig {
    /// Load configuration from defaults, `peercall.toml`, then `PEERCALL_<SECTION>__<KEY>`
    /// variables (e.g. `PEERCALL_CALL__DIAL_TIMEOUT_SECS`), including those set by `.env`.
    pub fn load() -> Result<Self, config::ConfigError> {
        // Load .env file if present (development)
        let _ = dotenvy::dotenv();

        builder()?
            // Optional config file
            .add_source(config::File::with_name("peercall").required(false))
            .add_source(environment())
            .build()?
            .try_deserialize()
    }

    /// Load configuration from a TOML document layered over the defaults.
    pub fn from_toml_str(toml: &str) -> Result<Self, config::ConfigError> {
        builder()?
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()?
            .try_deserialize()
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub call: CallConfig,
    #[serde(default)]
    pub media: MediaConfig,
    #[serde(default)]
    pub rtc: RtcConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallConfig {
    /// How long an outgoing call rings before it is recorded as not answered.
    pub dial_timeout_secs: u64,
    /// How long an incoming call rings before it is recorded as missed.
    pub ring_timeout_secs: u64,
    /// Reply with `CallEnd` when an incoming call is refused because we are busy.
    pub busy_reply: bool,
}

impl CallConfig {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    pub fn ring_timeout(&self) -> Duration {
        Duration::from_secs(self.ring_timeout_secs)
    }
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            dial_timeout_secs: 30,
            ring_timeout_secs: 30,
            busy_reply: true,
        }
    }
}

/// Initial state of the user's audio/video toggles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            audio: true,
            video: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RtcConfig {
    /// TURN/STUN servers handed to every peer connection.
    #[serde(default = "IceServer::default_stun")]
    pub ice_servers: Vec<IceServer>,
    pub bundle_policy: BundlePolicy,
    pub rtcp_mux_policy: RtcpMuxPolicy,
}

impl Default for RtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: IceServer::default_stun(),
            bundle_policy: BundlePolicy::MaxCompat,
            rtcp_mux_policy: RtcpMuxPolicy::Negotiate,
        }
    }
}

/// ICE server configuration (STUN/TURN).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    /// Default STUN servers (free, public).
    /// In production, add TURN servers for NAT traversal.
    pub fn default_stun() -> Vec<Self> {
        vec![
            Self {
                urls: vec![
                    "stun:stun.l.google.com:19302".into(),
                    "stun:stun1.l.google.com:19302".into(),
                ],
                username: None,
                credential: None,
            },
            Self {
                urls: vec!["stun:stun.cloudflare.com:3478".into()],
                username: None,
                credential: None,
            },
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BundlePolicy {
    Balanced,
    MaxCompat,
    MaxBundle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RtcpMuxPolicy {
    Negotiate,
    Require,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directive used when `RUST_LOG` is unset.
    pub filter: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "peercall=info".into(),
            json: false,
        }
    }
}
