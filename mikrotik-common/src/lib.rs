//! MikroTik exporter common library
//!
//! This crate provides the pieces shared by the exporter and its tests:
//!
//! - [`device`] - The device session capability (`DeviceConnector`, `DeviceSession`, `Menu`)
//! - [`simulator`] - An in-process simulated RouterOS device
//! - [`config`] - Logging settings
//! - [`error`] - Error types

pub mod config;
pub mod device;
pub mod error;
pub mod simulator;

// Re-export commonly used types at the crate root
pub use config::{LogFormat, LoggingConfig};
pub use device::{
    DeviceConnector, DeviceError, DeviceSession, EventStream, Menu, Query, Record, StreamBatch,
};
pub use error::{Error, Result};
pub use simulator::SimulatedRouter;

/// Initialize tracing with the given configuration.
///
/// Supports two output formats:
/// - `LogFormat::Text` (default): Human-readable text format
/// - `LogFormat::Json`: Structured JSON format for log aggregation systems
///
/// `RUST_LOG`, when set, takes precedence over the configured level.
///
/// # Example
///
/// ```ignore
/// use mikrotik_common::{LoggingConfig, LogFormat, init_tracing};
///
/// let config = LoggingConfig {
///     level: "info".to_string(),
///     format: LogFormat::Json,
/// };
/// init_tracing(&config)?;
/// ```
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    match config.format {
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(fmt::layer())
                .with(filter)
                .try_init()
                .map_err(|e| Error::Config(format!("Failed to initialize tracing: {}", e)))?;
        }
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(fmt::layer().json())
                .with(filter)
                .try_init()
                .map_err(|e| Error::Config(format!("Failed to initialize tracing: {}", e)))?;
        }
    }

    Ok(())
}
