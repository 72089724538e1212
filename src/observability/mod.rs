//! Observability for the broker client
//!
//! Structured logging setup and span macros. Session health is exposed
//! through [`crate::session::SessionStats`] rather than a metrics endpoint.

pub mod logging;

pub use logging::{init_default_logging, init_logging, parse_level, LogFormat};

// Span macros for structured logging
pub use logging::{session_span, transport_span};
