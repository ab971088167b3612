//! Tracing telemetry
//!
//! Console logging setup for binaries embedding the dispatch core.
//! Library code only emits `tracing` events; installing a subscriber is the
//! embedding process's call.

use tracing_subscriber::EnvFilter;

/// Output format of the console logger
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable, multi-field lines
    #[default]
    Pretty,
    /// One JSON object per event
    Json,
}

/// Configuration for console telemetry
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name attached to the startup event
    pub service_name: String,
    /// Log filter (e.g., "info", "turnstile_dispatch=debug")
    pub log_filter: Option<String>,
    /// Force debug-level output when no filter is given
    pub debug: bool,
    pub format: LogFormat,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "turnstile-dispatch".to_string(),
            log_filter: None,
            debug: false,
            format: LogFormat::Pretty,
        }
    }
}

impl TelemetryConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `SERVICE_NAME`: Service name (default: "turnstile-dispatch")
    /// - `RUST_LOG` or `LOG_LEVEL`: Log filter
    /// - `DEBUG`: "true" enables debug output when no filter is set
    /// - `LOG_FORMAT`: "json" or "pretty" (default)
    pub fn from_env() -> Self {
        Self {
            service_name: std::env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "turnstile-dispatch".to_string()),
            log_filter: std::env::var("RUST_LOG")
                .ok()
                .or_else(|| std::env::var("LOG_LEVEL").ok()),
            debug: std::env::var("DEBUG")
                .map(|v| v.to_lowercase() == "true" || v == "1")
                .unwrap_or(false),
            format: match std::env::var("LOG_FORMAT").as_deref() {
                Ok("json") => LogFormat::Json,
                _ => LogFormat::Pretty,
            },
        }
    }

    fn filter(&self) -> EnvFilter {
        let fallback = if self.debug { "debug" } else { "info" };
        self.log_filter
            .as_ref()
            .and_then(|f| EnvFilter::try_new(f).ok())
            .unwrap_or_else(|| EnvFilter::new(fallback))
    }
}

/// Telemetry initialisation errors
#[derive(Debug, thiserror::Error)]
#[error("failed to install tracing subscriber: {0}")]
pub struct TelemetryError(String);

/// Install the global tracing subscriber
///
/// Fails instead of panicking when a subscriber is already installed.
///
/// # Example
///
/// ```ignore
/// use turnstile_dispatch::telemetry::{init_telemetry, TelemetryConfig};
///
/// init_telemetry(TelemetryConfig::from_env())?;
/// ```
pub fn init_telemetry(config: TelemetryConfig) -> Result<(), TelemetryError> {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(config.filter())
        .with_target(true);

    let installed = match config.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Pretty => builder.try_init(),
    };
    installed.map_err(|e| TelemetryError(e.to_string()))?;

    tracing::info!(service = %config.service_name, format = ?config.format, "Telemetry initialized");
    Ok(())
}
