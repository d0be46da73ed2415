//! KSI Telemetry - Logging setup for the KSI daemon.
//!
//! This crate provides:
//! - Configurable logging setup with multiple formats
//! - Stderr or file targets (`<log_dir>/daemon.log`)
//! - Integration with the tracing ecosystem
//!
//! # Example
//!
//! ```rust,no_run
//! use ksi_telemetry::{LogConfig, LogFormat, setup_logging};
//!
//! # fn main() -> Result<(), ksi_telemetry::TelemetryError> {
//! let config = LogConfig::new("debug")
//!     .with_format(LogFormat::Compact)
//!     .with_directive("ksi_events=trace");
//!
//! setup_logging(&config)?;
//! tracing::info!("daemon starting");
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod error;
mod logging;

pub use error::{TelemetryError, TelemetryResult};
pub use logging::{LogConfig, LogFormat, LogTarget, setup_logging};
