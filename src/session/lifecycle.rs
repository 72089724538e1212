//! Pure lifecycle decisions for the session driver
//!
//! Everything here is side-effect free apart from logging, so the policy can be
//! tested without a runtime.

use super::state::{CloseReason, ConnectionState};
use crate::error::AuthFailureKind;
use crate::protocol::{headers, Frame};
use once_cell::sync::Lazy;
use regex::Regex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};

static TERMINAL_AUTH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(invalid|expired|revoked|malformed|bad)[ _-]*(token|credential|jwt|password|signature)|unauthori[sz]ed|forbidden|access[ _-]denied|authentication[ _-]failed|\b40[13]\b",
    )
    .expect("valid terminal auth pattern")
});

static TRANSIENT_AUTH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)overload|unavailable|try[ _-]again|rate[ _-]limit|too[ _-]many|timeout|timed[ _-]out|busy|temporar|\b(429|502|503|504)\b",
    )
    .expect("valid transient auth pattern")
});

/// Classify an ERROR frame received while authenticating
///
/// Looks at the `message` header and the body. Credential rejection wins over
/// overload markers when both appear.
pub fn classify_auth_error(frame: &Frame) -> AuthFailureKind {
    let text = format!(
        "{} {}",
        frame.get(headers::MESSAGE).unwrap_or_default(),
        frame.body_text()
    );
    if TERMINAL_AUTH.is_match(&text) {
        AuthFailureKind::Terminal
    } else if TRANSIENT_AUTH.is_match(&text) {
        AuthFailureKind::Transient
    } else {
        AuthFailureKind::Ambiguous
    }
}

/// Short human summary of an ERROR frame
pub fn error_summary(frame: &Frame) -> String {
    match frame.get(headers::MESSAGE) {
        Some(message) if !message.is_empty() => message.to_string(),
        _ => {
            let body = frame.body_text();
            if body.trim().is_empty() {
                "broker sent ERROR without detail".to_string()
            } else {
                body.trim().to_string()
            }
        }
    }
}

/// What to do after an authentication failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthDecision {
    /// Go through the normal reconnect backoff
    Retry,
    /// Stop and close with the given reason
    Close(CloseReason),
}

/// Decide on an auth failure. `ambiguous_so_far` counts earlier ambiguous
/// failures since the last successful connection.
pub fn decide_auth_failure(
    kind: AuthFailureKind,
    ambiguous_so_far: u32,
    max_ambiguous_retries: u32,
    message: &str,
) -> AuthDecision {
    match kind {
        AuthFailureKind::Transient => AuthDecision::Retry,
        AuthFailureKind::Terminal => AuthDecision::Close(CloseReason::AuthRejected(message.to_string())),
        AuthFailureKind::Ambiguous => {
            if ambiguous_so_far < max_ambiguous_retries {
                AuthDecision::Retry
            } else {
                AuthDecision::Close(CloseReason::AuthRejected(format!(
                    "{message} (after {} ambiguous retries)",
                    max_ambiguous_retries
                )))
            }
        }
    }
}

/// True when inbound silence has exceeded the negotiated interval times the
/// missed-beat tolerance
pub fn heartbeat_overdue(silence: Duration, expect_every: Duration, tolerance: u32) -> bool {
    silence > expect_every.saturating_mul(tolerance.max(1))
}

/// Snapshot of session health
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStats {
    pub state: ConnectionState,
    /// Time since the current connection reached Connected
    pub uptime: Option<Duration>,
    /// Time since the last inbound MESSAGE
    pub time_since_last_message: Option<Duration>,
    /// Successful reconnections after the first connection
    pub reconnect_count: u32,
    pub queued_messages: usize,
    pub active_subscriptions: usize,
}

impl SessionStats {
    pub fn is_healthy(&self) -> bool {
        self.state.is_connected()
    }
}

pub fn calculate_session_stats(
    state: ConnectionState,
    connected_at: Option<Instant>,
    last_message_at: Option<Instant>,
    reconnect_count: u32,
    queued_messages: usize,
    active_subscriptions: usize,
) -> SessionStats {
    let now = Instant::now();
    let uptime = if state.is_connected() {
        connected_at.map(|t| now.duration_since(t))
    } else {
        None
    };

    SessionStats {
        state,
        uptime,
        time_since_last_message: last_message_at.map(|t| now.duration_since(t)),
        reconnect_count,
        queued_messages,
        active_subscriptions,
    }
}

/// Log a state transition at a level matching its severity
pub fn log_state_transition(from: &ConnectionState, to: &ConnectionState) {
    match (from, to) {
        (ConnectionState::Authenticating, ConnectionState::Connected) => {
            info!("Broker session established");
        }
        (ConnectionState::Connected, ConnectionState::ReconnectWaiting { attempt, delay }) => {
            warn!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Broker connection lost, reconnecting"
            );
        }
        (_, ConnectionState::ReconnectWaiting { attempt, delay }) => {
            info!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Scheduling reconnection attempt"
            );
        }
        (_, ConnectionState::Closed(CloseReason::ClientDisconnect)) => {
            info!("Broker session closed by client");
        }
        (_, ConnectionState::Closed(reason)) => {
            error!(reason = ?reason, "Broker session closed permanently");
        }
        _ => {
            info!(from = %from, to = %to, "Connection state changed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Command;

    fn error_frame(message: &str, body: &str) -> Frame {
        Frame::new(Command::Error)
            .header(headers::MESSAGE, message)
            .with_body(body.to_string())
    }

    #[test]
    fn test_classify_terminal() {
        for message in [
            "Invalid token",
            "JWT expired_token",
            "Access denied",
            "Unauthorized",
            "403",
            "authentication failed",
        ] {
            assert_eq!(
                classify_auth_error(&error_frame(message, "")),
                AuthFailureKind::Terminal,
                "{message}"
            );
        }
    }

    #[test]
    fn test_classify_transient() {
        for message in ["Server overloaded", "Service Unavailable", "please try again", "503"] {
            assert_eq!(
                classify_auth_error(&error_frame(message, "")),
                AuthFailureKind::Transient,
                "{message}"
            );
        }
    }

    #[test]
    fn test_classify_uses_body_and_prefers_terminal() {
        assert_eq!(
            classify_auth_error(&error_frame("error", "rate limit exceeded")),
            AuthFailureKind::Transient
        );
        assert_eq!(
            classify_auth_error(&error_frame("busy", "invalid credential")),
            AuthFailureKind::Terminal
        );
    }

    #[test]
    fn test_classify_ambiguous() {
        assert_eq!(
            classify_auth_error(&error_frame("Something went wrong", "")),
            AuthFailureKind::Ambiguous
        );
        assert_eq!(
            classify_auth_error(&Frame::new(Command::Error)),
            AuthFailureKind::Ambiguous
        );
    }

    #[test]
    fn test_ambiguous_failures_are_bounded() {
        assert_eq!(
            decide_auth_failure(AuthFailureKind::Ambiguous, 0, 3, "x"),
            AuthDecision::Retry
        );
        assert_eq!(
            decide_auth_failure(AuthFailureKind::Ambiguous, 2, 3, "x"),
            AuthDecision::Retry
        );
        assert!(matches!(
            decide_auth_failure(AuthFailureKind::Ambiguous, 3, 3, "x"),
            AuthDecision::Close(CloseReason::AuthRejected(_))
        ));
        assert!(matches!(
            decide_auth_failure(AuthFailureKind::Ambiguous, 0, 0, "x"),
            AuthDecision::Close(_)
        ));
    }

    #[test]
    fn test_terminal_and_transient_decisions() {
        assert_eq!(
            decide_auth_failure(AuthFailureKind::Terminal, 0, 3, "bad token"),
            AuthDecision::Close(CloseReason::AuthRejected("bad token".into()))
        );
        assert_eq!(
            decide_auth_failure(AuthFailureKind::Transient, 99, 3, "busy"),
            AuthDecision::Retry
        );
    }

    #[test]
    fn test_error_summary() {
        assert_eq!(error_summary(&error_frame("boom", "detail")), "boom");
        assert_eq!(
            error_summary(&Frame::new(Command::Error).with_body("  detail \n")),
            "detail"
        );
        assert_eq!(
            error_summary(&Frame::new(Command::Error)),
            "broker sent ERROR without detail"
        );
    }

    #[test]
    fn test_heartbeat_overdue() {
        let every = Duration::from_secs(10);
        assert!(!heartbeat_overdue(Duration::from_secs(19), every, 2));
        assert!(heartbeat_overdue(Duration::from_secs(21), every, 2));
        // Zero tolerance behaves as one missed beat
        assert!(heartbeat_overdue(Duration::from_secs(11), every, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_stats() {
        let connected_at = Instant::now();
        tokio::time::advance(Duration::from_secs(5)).await;

        let stats = calculate_session_stats(ConnectionState::Connected, Some(connected_at), None, 2, 0, 3);
        assert_eq!(stats.uptime, Some(Duration::from_secs(5)));
        assert_eq!(stats.time_since_last_message, None);
        assert!(stats.is_healthy());

        let stats =
            calculate_session_stats(ConnectionState::Connecting, Some(connected_at), None, 2, 4, 3);
        assert_eq!(stats.uptime, None);
        assert_eq!(stats.queued_messages, 4);
        assert!(!stats.is_healthy());
    }
}
