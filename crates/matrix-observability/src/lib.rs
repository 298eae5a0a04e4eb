//! Matrix observability
//!
//! Structured logging for the gateway: subscriber setup driven by
//! configuration, plus span helpers that attach connection and peer context
//! to every event emitted inside them.

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod logging;

pub use config::{Config, LoggingConfig};
pub use error::{ObservabilityError, Result};
pub use logging::{connection_span, peer_span, LogManager};
