//! Public facade over one broker session
//!
//! A [`BrokerClient`] is a cheap, cloneable handle to a session actor. All
//! methods post commands to the actor; none of them touch the transport
//! directly, and `publish` never waits on the network.

use crate::config::ClientConfig;
use crate::error::{AuthFailureKind, SessionError, SessionResult};
use crate::session::driver::{SessionCommand, SessionDriver};
use crate::session::{
    ClientEvent, CloseReason, ConnectionState, Credential, Delivery, OutboundEnvelope,
    SessionSettings, SessionStats, SubscriptionId,
};
use crate::transport::{TcpTransport, Transport, WebSocketTransport};
use bytes::Bytes;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, Instrument};
use uuid::Uuid;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Handle to a resilient broker session
#[derive(Clone)]
pub struct BrokerClient {
    session_id: Uuid,
    commands: mpsc::UnboundedSender<SessionCommand>,
    state_rx: watch::Receiver<ConnectionState>,
    events: broadcast::Sender<ClientEvent>,
}

impl std::fmt::Debug for BrokerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerClient")
            .field("session_id", &self.session_id)
            .field("state", &*self.state_rx.borrow())
            .finish()
    }
}

impl BrokerClient {
    /// Start a session over `transport`. Must be called within a tokio runtime.
    ///
    /// The session stays in `Disconnected` until [`BrokerClient::connect`].
    /// It stops once every clone of the handle has been dropped.
    pub fn new(settings: SessionSettings, transport: Arc<dyn Transport>) -> Self {
        let session_id = Uuid::new_v4();
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let driver = SessionDriver::new(settings, transport, commands_rx, state_tx, events.clone());
        let span = crate::session_span!(session_id = %session_id);
        tokio::spawn(driver.run().instrument(span));

        Self {
            session_id,
            commands,
            state_rx,
            events,
        }
    }

    /// Start a session with the transport matching the endpoint scheme:
    /// WebSocket for `ws`/`wss`, TCP for `tcp`/`stomp`
    pub fn from_config(config: &ClientConfig) -> SessionResult<Self> {
        let settings = SessionSettings::from_config(config)?;
        let transport: Arc<dyn Transport> = match settings.endpoint.scheme() {
            "ws" | "wss" => Arc::new(WebSocketTransport::new()),
            _ => Arc::new(TcpTransport::new()),
        };
        Ok(Self::new(settings, transport))
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Begin connecting with `credential`. No-op while an attempt is already
    /// in progress or established. Returns once the session has accepted the
    /// request; use [`BrokerClient::wait_until_connected`] to await the outcome.
    pub async fn connect(&self, credential: impl Into<Credential>) -> SessionResult<()> {
        let (ack, done) = oneshot::channel();
        self.send(SessionCommand::Connect {
            credential: credential.into(),
            ack,
        })?;
        done.await.map_err(|_| SessionError::SessionClosed)
    }

    /// Close the session. Idempotent; safe to call in any state.
    pub async fn disconnect(&self) {
        let (ack, done) = oneshot::channel();
        if self.send(SessionCommand::Disconnect { ack }).is_ok() {
            let _ = done.await;
        }
    }

    /// Serialize `payload` as JSON and send it, or queue it until connected
    pub fn publish<T: Serialize + ?Sized>(&self, destination: &str, payload: &T) -> SessionResult<()> {
        let body = serde_json::to_vec(payload)?;
        self.publish_raw(destination, Bytes::from(body))
    }

    /// Send an already serialized JSON body
    pub fn publish_raw(&self, destination: &str, body: Bytes) -> SessionResult<()> {
        validate_destination(destination)?;
        self.send(SessionCommand::Publish(OutboundEnvelope::new(destination, body)))
    }

    /// Register `handler` for every MESSAGE on `destination`. The handler runs
    /// on the session task and must not block.
    pub async fn subscribe<F>(&self, destination: &str, handler: F) -> SessionResult<Subscription>
    where
        F: Fn(&Delivery) + Send + Sync + 'static,
    {
        validate_destination(destination)?;
        let (reply, id_rx) = oneshot::channel();
        self.send(SessionCommand::Subscribe {
            destination: destination.to_string(),
            handler: Arc::new(handler),
            reply,
        })?;
        let id = id_rx.await.map_err(|_| SessionError::SessionClosed)?;
        debug!(subscription = %id, destination, "Subscribed");

        Ok(Subscription {
            id,
            destination: destination.to_string(),
            commands: self.commands.downgrade(),
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    /// Watch receiver that always holds the latest state
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Every state change, dropped message and diagnostic from now on
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Wait until the state satisfies `predicate`, returning that state
    pub async fn wait_for_state<P>(&self, predicate: P, timeout: Duration) -> SessionResult<ConnectionState>
    where
        P: Fn(&ConnectionState) -> bool,
    {
        let mut state_rx = self.state_rx.clone();
        let timeout_result = tokio::time::timeout(timeout, async {
            loop {
                {
                    let state = state_rx.borrow_and_update();
                    if predicate(&state) {
                        return Ok(state.clone());
                    }
                }
                if state_rx.changed().await.is_err() {
                    return Err(SessionError::SessionClosed);
                }
            }
        })
        .await;

        match timeout_result {
            Ok(result) => result,
            Err(_) => Err(SessionError::Timeout(format!(
                "state change after {}ms (still {})",
                timeout.as_millis(),
                self.state()
            ))),
        }
    }

    /// Wait for Connected. Fails early if the session closes instead.
    pub async fn wait_until_connected(&self, timeout: Duration) -> SessionResult<()> {
        let state = self
            .wait_for_state(|s| s.is_connected() || s.is_closed(), timeout)
            .await?;
        match state {
            ConnectionState::Connected => Ok(()),
            ConnectionState::Closed(CloseReason::AuthRejected(message)) => {
                Err(SessionError::auth(AuthFailureKind::Terminal, message))
            }
            _ => Err(SessionError::SessionClosed),
        }
    }

    /// Health snapshot from the session
    pub async fn stats(&self) -> SessionResult<SessionStats> {
        let (reply, stats_rx) = oneshot::channel();
        self.send(SessionCommand::Stats(reply))?;
        stats_rx.await.map_err(|_| SessionError::SessionClosed)
    }

    fn send(&self, command: SessionCommand) -> SessionResult<()> {
        self.commands
            .send(command)
            .map_err(|_| SessionError::SessionClosed)
    }
}

fn validate_destination(destination: &str) -> SessionResult<()> {
    if destination.trim().is_empty() || destination.contains('\0') {
        return Err(SessionError::InvalidDestination(destination.to_string()));
    }
    Ok(())
}

/// Capability to remove exactly one subscribe() registration
///
/// Dropping it leaves the subscription in place.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    destination: String,
    commands: mpsc::WeakUnboundedSender<SessionCommand>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Remove the registration. Sends UNSUBSCRIBE if currently connected.
    pub fn unsubscribe(self) {
        if let Some(commands) = self.commands.upgrade() {
            let _ = commands.send(SessionCommand::Unsubscribe(self.id));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockTransport;
    use url::Url;

    fn client() -> (BrokerClient, MockTransport) {
        let transport = MockTransport::new();
        let settings = SessionSettings::new(Url::parse("ws://mock.local/ws").unwrap());
        (BrokerClient::new(settings, Arc::new(transport.clone())), transport)
    }

    #[test]
    fn test_validate_destination() {
        assert!(validate_destination("/topic/chat").is_ok());
        assert!(validate_destination("/user/queue/reply").is_ok());
        assert!(matches!(
            validate_destination(""),
            Err(SessionError::InvalidDestination(_))
        ));
        assert!(validate_destination("  ").is_err());
        assert!(validate_destination("/topic/\0bad").is_err());
    }

    #[tokio::test]
    async fn test_initial_state_is_disconnected() {
        let (client, _transport) = client();
        assert_eq!(client.state(), ConnectionState::Disconnected);
        let stats = client.stats().await.unwrap();
        assert_eq!(stats.reconnect_count, 0);
        assert_eq!(stats.active_subscriptions, 0);
    }

    #[tokio::test]
    async fn test_publish_rejects_bad_destination() {
        let (client, _transport) = client();
        let result = client.publish("", &serde_json::json!({"a": 1}));
        assert!(matches!(result, Err(SessionError::InvalidDestination(_))));
    }

    #[tokio::test]
    async fn test_wait_for_state_times_out() {
        let (client, _transport) = client();
        let result = client
            .wait_for_state(|s| s.is_connected(), Duration::from_millis(20))
            .await;
        assert!(matches!(result, Err(SessionError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let (client, _transport) = client();
        client.disconnect().await;
        client.disconnect().await;
        assert_eq!(
            client.state(),
            ConnectionState::Closed(CloseReason::ClientDisconnect)
        );
    }

    #[tokio::test]
    async fn test_debug_does_not_leak_credential() {
        let (client, _transport) = client();
        client.connect("very-secret-token").await.unwrap();
        let printed = format!("{client:?}");
        assert!(!printed.contains("very-secret-token"));
    }
}
