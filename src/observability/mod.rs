//! Observability for the cloud link
//!
//! Structured logging through `tracing`, with span macros for connection
//! attempts and publishes.

pub mod logging;

pub use logging::{init_default_logging, init_logging, LogFormat, LoggingSettings};

// Span macros for structured logging
pub use logging::{connection_span, publish_span};
