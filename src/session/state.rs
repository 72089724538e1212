//! Caller-visible connection state

use std::fmt;
use std::time::Duration;

/// Why a session reached [`ConnectionState::Closed`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// disconnect() was called
    ClientDisconnect,
    /// The broker rejected the credential, or ambiguous failures ran out
    AuthRejected(String),
    /// The configured reconnect attempt limit was reached
    RetriesExhausted(String),
}

/// Session lifecycle as observed through the facade
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Initial state, nothing opened yet
    #[default]
    Disconnected,
    /// Transport opening
    Connecting,
    /// Transport open, CONNECT sent, awaiting CONNECTED or ERROR
    Authenticating,
    /// CONNECTED received
    Connected,
    /// Link lost; the next attempt fires after `delay`
    ReconnectWaiting { attempt: u32, delay: Duration },
    /// Terminal until a fresh connect()
    Closed(CloseReason),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, ConnectionState::Closed(_))
    }

    /// A connection attempt is already under way or established
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Authenticating | ConnectionState::Connected
        )
    }

    /// Variant name without payload, for logs and metrics labels
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::Connected => "connected",
            ConnectionState::ReconnectWaiting { .. } => "reconnect_waiting",
            ConnectionState::Closed(_) => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::ReconnectWaiting { attempt, delay } => {
                write!(f, "reconnect_waiting(attempt {attempt}, {}ms)", delay.as_millis())
            }
            ConnectionState::Closed(reason) => write!(f, "closed({reason:?})"),
            other => f.write_str(other.name()),
        }
    }
}
