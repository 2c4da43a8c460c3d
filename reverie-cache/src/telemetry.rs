//! Tracing subscriber initialization.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use reverie_core::{ConfigError, ReverieResult};

/// Logging configuration from environment variables.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// `EnvFilter` directives, e.g. `"reverie_cache=debug,info"`.
    pub filter: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            json: false,
        }
    }
}

impl TelemetryConfig {
    /// # Environment Variables
    /// - `REVERIE_LOG`: filter directives (default: `info`)
    /// - `REVERIE_LOG_FORMAT`: `json` for structured output (default: text)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            filter: std::env::var("REVERIE_LOG")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(defaults.filter),
            json: std::env::var("REVERIE_LOG_FORMAT")
                .map(|s| s.eq_ignore_ascii_case("json"))
                .unwrap_or(defaults.json),
        }
    }
}

/// Install the global tracing subscriber.
///
/// Returns `Ok(false)` when a global subscriber is already installed, so
/// embedding applications and tests can call this unconditionally.
pub fn init_tracing(config: &TelemetryConfig) -> ReverieResult<bool> {
    let env_filter = EnvFilter::try_new(&config.filter).map_err(|e| ConfigError::InvalidValue {
        field: "telemetry.filter".to_string(),
        value: config.filter.clone(),
        reason: e.to_string(),
    })?;

    let registry = tracing_subscriber::registry().with(env_filter);
    let installed = if config.json {
        registry.with(tracing_subscriber::fmt::layer().json()).try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };

    if installed.is_err() {
        return Ok(false);
    }

    tracing::info!(filter = %config.filter, json = config.json, "Telemetry initialized");
    Ok(true)
}
