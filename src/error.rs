//! Error taxonomy for the broker session
//!
//! Transport and protocol failures never escape as panics or unhandled
//! results: the session converts them into state transitions and reports them
//! to callers as [`SessionError`] diagnostics.

use crate::config::ConfigError;
use crate::protocol::ProtocolError;
use crate::transport::TransportError;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use thiserror::Error;

/// How a rejected CONNECT should be treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailureKind {
    /// Broker-side trouble (overload, unavailable); retry with backoff
    Transient,
    /// The credential itself was rejected; stop retrying
    Terminal,
    /// No recognizable classification; retry a bounded number of times
    Ambiguous,
}

impl fmt::Display for AuthFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AuthFailureKind::Transient => "transient",
            AuthFailureKind::Terminal => "terminal",
            AuthFailureKind::Ambiguous => "ambiguous",
        };
        f.write_str(label)
    }
}

/// Main error type for session operations and diagnostics
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Authentication failed ({kind}): {message}")]
    Auth {
        kind: AuthFailureKind,
        message: String,
    },

    #[error("Broker reported an error: {message}")]
    Broker { message: String },

    #[error("Outbound queue full, dropped oldest message for {destination}")]
    Capacity { destination: String },

    #[error("Invalid destination: {0:?}")]
    InvalidDestination(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Session is closed")]
    SessionClosed,

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl SessionError {
    pub fn auth<S: Into<String>>(kind: AuthFailureKind, message: S) -> Self {
        Self::Auth {
            kind,
            message: sanitize_error_message(&message.into()),
        }
    }

    pub fn broker<S: Into<String>>(message: S) -> Self {
        Self::Broker {
            message: sanitize_error_message(&message.into()),
        }
    }

    /// Whether the session keeps retrying after this error
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            SessionError::Auth {
                kind: AuthFailureKind::Terminal,
                ..
            } | SessionError::SessionClosed
                | SessionError::Config(_)
        )
    }
}

impl From<ConfigError> for SessionError {
    fn from(error: ConfigError) -> Self {
        SessionError::Config(sanitize_error_message(&error.to_string()))
    }
}

impl From<serde_json::Error> for SessionError {
    fn from(error: serde_json::Error) -> Self {
        SessionError::Serialization(error.to_string())
    }
}

static SECRET_PAIR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(password|passcode|token|key|secret)[=:]\s*\S+").expect("valid secret pattern")
});
static BEARER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)bearer\s+\S+").expect("valid bearer pattern"));

/// Redact credentials and cap length before a message is logged or surfaced
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = BEARER.replace_all(message, "Bearer ***").to_string();
    sanitized = SECRET_PAIR.replace_all(&sanitized, "${1}=***").to_string();

    if sanitized.len() > 500 {
        let truncate_suffix = "...[truncated]";
        let mut cut = 500 - truncate_suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], truncate_suffix);
    }

    sanitized
}

/// Result type for session operations
pub type SessionResult<T> = Result<T, SessionError>;
