//! runlet observability
//!
//! Structured logging for the runlet binary: pretty, JSON or compact console
//! output, optional rotated log files, and `RUST_LOG` overrides.
//!
//! ```no_run
//! use runlet_observability::{init_logging, LoggingConfig};
//!
//! let _guard = init_logging(&LoggingConfig::default()).expect("logging");
//! tracing::info!("ready");
//! ```

pub mod config;
pub mod error;
pub mod logging;

pub use config::*;
pub use error::{ObservabilityError, Result};
pub use logging::{init_logging, LogGuard};
