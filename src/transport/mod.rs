//! Transport layer for the broker session
//!
//! This module provides the transport abstraction the session drives and two
//! concrete adapters (WebSocket and raw TCP). A [`Transport`] opens a
//! [`TransportLink`]: an ordered duplex byte stream with a sender half for
//! outbound bytes and close, and an event receiver for data, close and error.
//! The session never learns which concrete adapter is underneath.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;
use url::Url;

pub mod tcp;
pub mod websocket;

pub use tcp::TcpTransport;
pub use websocket::WebSocketTransport;

/// Transport failures. Always recoverable by reconnecting.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection refused: {0}")]
    Refused(String),
    #[error("Connection closed: {0}")]
    Closed(String),
    #[error("Timed out: {0}")]
    TimedOut(String),
    #[error("Unsupported endpoint: {0}")]
    UnsupportedEndpoint(String),
    #[error("I/O error: {0}")]
    Io(String),
}

/// Inbound notifications from one link, delivered in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Data(Bytes),
    Closed(Option<String>),
    Error(TransportError),
}

/// Requests from the session to the adapter's I/O task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    Data(Bytes),
    Close,
}

/// Session-side handle for writing to and closing a link
#[derive(Debug)]
pub struct LinkSender {
    tx: mpsc::UnboundedSender<Outgoing>,
}

impl LinkSender {
    /// Queue bytes for the adapter. Never blocks.
    pub fn send(&self, data: Bytes) -> Result<(), TransportError> {
        self.tx
            .send(Outgoing::Data(data))
            .map_err(|_| TransportError::Closed("transport task has stopped".to_string()))
    }

    /// Close the link. Consumes the sender so a link is closed at most once.
    pub fn close(self) {
        let _ = self.tx.send(Outgoing::Close);
    }
}

/// An open duplex link returned by [`Transport::open`]
#[derive(Debug)]
pub struct TransportLink {
    pub sender: LinkSender,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Adapter-side ends of a link's channels
#[derive(Debug)]
pub struct LinkEndpoint {
    pub outgoing: mpsc::UnboundedReceiver<Outgoing>,
    pub events: mpsc::UnboundedSender<TransportEvent>,
}

impl LinkEndpoint {
    /// Report an event to the session. Returns false once the session side is gone.
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.events.send(event).is_ok()
    }
}

impl TransportLink {
    /// Create a link and the matching adapter endpoint
    pub fn pair() -> (TransportLink, LinkEndpoint) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (ev_tx, ev_rx) = mpsc::unbounded_channel();
        (
            TransportLink {
                sender: LinkSender { tx: out_tx },
                events: ev_rx,
            },
            LinkEndpoint {
                outgoing: out_rx,
                events: ev_tx,
            },
        )
    }
}

/// Capability to open duplex links to a broker endpoint
///
/// Implementations hide the concrete mechanism (WebSocket, TCP, in-memory).
/// The returned link must deliver bytes in order and report close or error
/// exactly once through its event stream.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Short adapter name for logs
    fn name(&self) -> &'static str;

    /// Open a new link to `endpoint`
    async fn open(&self, endpoint: &Url) -> Result<TransportLink, TransportError>;
}

/// Map an I/O error from connecting into the transport taxonomy
pub(crate) fn classify_io_error(error: &std::io::Error) -> TransportError {
    use std::io::ErrorKind;
    match error.kind() {
        ErrorKind::ConnectionRefused => TransportError::Refused(error.to_string()),
        ErrorKind::TimedOut => TransportError::TimedOut(error.to_string()),
        ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe => {
            TransportError::Closed(error.to_string())
        }
        _ => TransportError::Io(error.to_string()),
    }
}
