//! In-memory transport for testing
//!
//! [`MockTransport`] hands every opened link to the test as a
//! [`MockConnection`], which plays the broker side: it decodes the frames the
//! session writes and injects CONNECTED, MESSAGE, ERROR or a dropped link.

use crate::protocol::{headers, Command, Decoded, Frame, FrameCodec, HeartBeat, PROTOCOL_VERSION};
use crate::transport::{
    LinkEndpoint, Outgoing, Transport, TransportError, TransportEvent, TransportLink,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use url::Url;

/// Mock transport for testing
#[derive(Clone)]
pub struct MockTransport {
    connections_tx: mpsc::UnboundedSender<MockConnection>,
    connections_rx: Arc<AsyncMutex<mpsc::UnboundedReceiver<MockConnection>>>,
    fail_next: Arc<AtomicU32>,
    open_count: Arc<AtomicU32>,
    open_delay: Arc<Mutex<Option<Duration>>>,
    endpoints: Arc<Mutex<Vec<Url>>>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        let (connections_tx, connections_rx) = mpsc::unbounded_channel();
        Self {
            connections_tx,
            connections_rx: Arc::new(AsyncMutex::new(connections_rx)),
            fail_next: Arc::new(AtomicU32::new(0)),
            open_count: Arc::new(AtomicU32::new(0)),
            open_delay: Arc::new(Mutex::new(None)),
            endpoints: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Refuse the next `count` open attempts
    pub fn fail_next_opens(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Make every open take `delay` before completing
    pub fn set_open_delay(&self, delay: Option<Duration>) {
        if let Ok(mut guard) = self.open_delay.lock() {
            *guard = delay;
        }
    }

    /// Number of open attempts so far, failed ones included
    pub fn open_count(&self) -> u32 {
        self.open_count.load(Ordering::SeqCst)
    }

    /// Endpoints passed to open, in order
    pub fn endpoints(&self) -> Vec<Url> {
        self.endpoints.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Wait for the session to open its next link
    pub async fn next_connection(&self) -> Option<MockConnection> {
        self.connections_rx.lock().await.recv().await
    }

    /// A link opened and not yet taken, without waiting
    pub async fn try_next_connection(&self) -> Option<MockConnection> {
        self.connections_rx.lock().await.try_recv().ok()
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn open(&self, endpoint: &Url) -> Result<TransportLink, TransportError> {
        self.open_count.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut endpoints) = self.endpoints.lock() {
            endpoints.push(endpoint.clone());
        }

        let delay = self.open_delay.lock().ok().and_then(|d| *d);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let refused = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(TransportError::Refused("mock broker refused".to_string()));
        }

        let (link, endpoint) = TransportLink::pair();
        let _ = self.connections_tx.send(MockConnection::new(endpoint));
        Ok(link)
    }
}

/// Broker side of one mock link
pub struct MockConnection {
    endpoint: LinkEndpoint,
    codec: FrameCodec,
    frames: VecDeque<Frame>,
    heartbeats: usize,
    closed_by_client: bool,
}

impl MockConnection {
    fn new(endpoint: LinkEndpoint) -> Self {
        Self {
            endpoint,
            codec: FrameCodec::new(),
            frames: VecDeque::new(),
            heartbeats: 0,
            closed_by_client: false,
        }
    }

    /// Next frame written by the client. `None` once the client closed the link.
    pub async fn next_frame(&mut self) -> Option<Frame> {
        loop {
            if let Some(frame) = self.frames.pop_front() {
                return Some(frame);
            }
            if self.closed_by_client {
                return None;
            }
            match self.endpoint.outgoing.recv().await {
                Some(outgoing) => self.absorb(outgoing),
                None => self.closed_by_client = true,
            }
        }
    }

    /// Frames already written, without waiting
    pub fn drain_frames(&mut self) -> Vec<Frame> {
        while let Ok(outgoing) = self.endpoint.outgoing.try_recv() {
            self.absorb(outgoing);
        }
        self.frames.drain(..).collect()
    }

    /// Wait for the CONNECT frame and answer CONNECTED
    pub async fn accept(&mut self) -> Option<Frame> {
        self.accept_with_heartbeat(HeartBeat::disabled()).await
    }

    pub async fn accept_with_heartbeat(&mut self, heart_beat: HeartBeat) -> Option<Frame> {
        let connect = self.next_frame().await?;
        if connect.command != Command::Connect {
            return None;
        }
        self.send_frame(
            &Frame::new(Command::Connected)
                .header(headers::VERSION, PROTOCOL_VERSION)
                .header(headers::HEART_BEAT, heart_beat.to_header()),
        );
        Some(connect)
    }

    /// Wait for the CONNECT frame and answer ERROR with `message`
    pub async fn reject(&mut self, message: &str) -> Option<Frame> {
        let connect = self.next_frame().await?;
        self.send_frame(&Frame::new(Command::Error).header(headers::MESSAGE, message));
        Some(connect)
    }

    /// Deliver a MESSAGE with a JSON body
    pub fn deliver(&self, destination: &str, subscription: Option<&str>, body: &str) {
        let mut frame = Frame::new(Command::Message)
            .header(headers::DESTINATION, destination)
            .header(headers::MESSAGE_ID, format!("msg-{}", fastrand::u32(..)))
            .header(headers::CONTENT_TYPE, "application/json");
        if let Some(subscription) = subscription {
            frame = frame.header(headers::SUBSCRIPTION, subscription);
        }
        self.send_frame(&frame.with_body(body.to_string()));
    }

    pub fn send_frame(&self, frame: &Frame) {
        self.send_bytes(FrameCodec::encode(frame));
    }

    /// Write raw bytes toward the client
    pub fn send_bytes(&self, bytes: Bytes) {
        self.endpoint.emit(TransportEvent::Data(bytes));
    }

    pub fn send_heartbeat(&self) {
        self.send_bytes(FrameCodec::heartbeat());
    }

    /// Simulate the network dropping the link
    pub fn drop_link(self) {
        self.endpoint.emit(TransportEvent::Closed(Some("mock link dropped".to_string())));
    }

    /// Simulate a transport error on the link
    pub fn fail(self, error: TransportError) {
        self.endpoint.emit(TransportEvent::Error(error));
    }

    /// Wait until the client closes this link
    pub async fn wait_closed(&mut self) {
        while self.next_frame().await.is_some() {}
    }

    pub fn is_closed_by_client(&self) -> bool {
        self.closed_by_client
    }

    /// Heart-beats received from the client so far
    pub fn heartbeats_received(&self) -> usize {
        self.heartbeats
    }

    fn absorb(&mut self, outgoing: Outgoing) {
        match outgoing {
            Outgoing::Data(bytes) => {
                self.codec.feed(&bytes);
                while let Ok(Some(decoded)) = self.codec.decode_next() {
                    match decoded {
                        Decoded::Frame(frame) => self.frames.push_back(frame),
                        Decoded::Heartbeat => self.heartbeats += 1,
                    }
                }
            }
            Outgoing::Close => self.closed_by_client = true,
        }
    }
}
