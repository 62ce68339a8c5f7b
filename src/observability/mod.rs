//! Observability: structured logging and health reporting

pub mod health;
pub mod logging;

pub use health::{check_health, HealthReport, ServiceHealth};
pub use logging::{bootstrap_dispatch, init_from_config, init_logging, LogFormat};

// Span macros for structured logging
pub use logging::{broker_span, lifecycle_span, submission_span};
