//! Observability: structured logging setup and span helpers

pub mod logging;

pub use logging::{init_default_logging, init_logging, LogFormat, LoggingOptions};

// Span macros for structured logging
pub use logging::{lifecycle_span, mqtt_span};
