//! Session actor
//!
//! One task owns all mutable session state: the current link, the codec, the
//! registry, the outbound queue and the timers. Facade commands, transport
//! events and timer firings arrive on channels and are handled one at a time.
//!
//! Every link and timer is tagged with the connection epoch it belongs to.
//! Tearing down a link bumps the epoch, so anything still in flight for the
//! old link is recognized as stale and ignored (or, for a link that finished
//! opening too late, closed).

use super::backoff::{Backoff, ReconnectDecision};
use super::credential::Credential;
use super::lifecycle::{
    self, calculate_session_stats, classify_auth_error, decide_auth_failure, error_summary,
    heartbeat_overdue, AuthDecision, SessionStats,
};
use super::outbound::{OutboundEnvelope, OutboundQueue};
use super::registry::{Delivery, MessageHandler, SubscriptionId, SubscriptionRegistry};
use super::settings::SessionSettings;
use super::state::{CloseReason, ConnectionState};
use super::timers::{TimerFired, TimerKind, Timers};
use crate::error::{sanitize_error_message, AuthFailureKind, SessionError};
use crate::protocol::{
    headers, Command as FrameCommand, Decoded, Frame, FrameCodec, HeartBeat, NegotiatedHeartBeat,
};
use crate::transport::{LinkSender, Transport, TransportError, TransportEvent, TransportLink};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::mpsc::error::SendError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn, Instrument};

/// Notifications published to every facade listener
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    StateChanged(ConnectionState),
    /// A queued publish was evicted to make room for a newer one
    MessageDropped {
        destination: String,
        enqueued_at: DateTime<Utc>,
    },
    /// A failure the session recovered from (or closed on)
    Diagnostic(SessionError),
}

/// Requests from the facade
pub(crate) enum SessionCommand {
    Connect {
        credential: Credential,
        ack: oneshot::Sender<()>,
    },
    Disconnect {
        ack: oneshot::Sender<()>,
    },
    Publish(OutboundEnvelope),
    Subscribe {
        destination: String,
        handler: MessageHandler,
        reply: oneshot::Sender<SubscriptionId>,
    },
    Unsubscribe(SubscriptionId),
    Stats(oneshot::Sender<SessionStats>),
}

/// Completions posted back by tasks the session spawned
pub(crate) enum SessionEvent {
    Opened {
        epoch: u64,
        result: Result<TransportLink, TransportError>,
    },
    Link {
        epoch: u64,
        event: TransportEvent,
    },
    Timer(TimerFired),
}

impl From<TimerFired> for SessionEvent {
    fn from(fired: TimerFired) -> Self {
        SessionEvent::Timer(fired)
    }
}

pub(crate) struct SessionDriver {
    settings: SessionSettings,
    transport: Arc<dyn Transport>,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: mpsc::UnboundedReceiver<SessionEvent>,
    state_tx: watch::Sender<ConnectionState>,
    notify: broadcast::Sender<ClientEvent>,

    codec: FrameCodec,
    registry: SubscriptionRegistry,
    outbound: OutboundQueue,
    backoff: Backoff,
    timers: Timers<SessionEvent>,

    link: Option<LinkSender>,
    forwarder: Option<JoinHandle<()>>,
    epoch: u64,
    credential: Option<Credential>,
    negotiated: NegotiatedHeartBeat,

    last_inbound: Instant,
    connected_at: Option<Instant>,
    last_message_at: Option<Instant>,
    ever_connected: bool,
    reconnect_count: u32,
    ambiguous_auth_failures: u32,
}

impl SessionDriver {
    pub(crate) fn new(
        settings: SessionSettings,
        transport: Arc<dyn Transport>,
        commands: mpsc::UnboundedReceiver<SessionCommand>,
        state_tx: watch::Sender<ConnectionState>,
        notify: broadcast::Sender<ClientEvent>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            codec: FrameCodec::with_max_frame_bytes(settings.max_frame_bytes),
            registry: SubscriptionRegistry::new(),
            outbound: OutboundQueue::new(settings.outbound_capacity),
            backoff: Backoff::new(settings.reconnect.clone()),
            timers: Timers::new(events_tx.clone()),
            settings,
            transport,
            commands,
            events_tx,
            events_rx,
            state_tx,
            notify,
            link: None,
            forwarder: None,
            epoch: 0,
            credential: None,
            negotiated: NegotiatedHeartBeat::default(),
            last_inbound: Instant::now(),
            connected_at: None,
            last_message_at: None,
            ever_connected: false,
            reconnect_count: 0,
            ambiguous_auth_failures: 0,
        }
    }

    /// Run until every facade handle is dropped
    pub(crate) async fn run(mut self) {
        info!(
            endpoint = %self.settings.endpoint,
            transport = self.transport.name(),
            "Broker session started"
        );

        loop {
            tokio::select! {
                biased;
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(event) = self.events_rx.recv() => self.handle_event(event),
            }
        }

        if !self.state().is_closed() {
            self.close(CloseReason::ClientDisconnect);
        }
        info!("Broker session stopped");
    }

    fn state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    fn set_state(&mut self, next: ConnectionState) {
        let previous = self.state();
        if previous == next {
            return;
        }
        lifecycle::log_state_transition(&previous, &next);
        self.state_tx.send_replace(next.clone());
        let _ = self.notify.send(ClientEvent::StateChanged(next));
    }

    fn diagnostic(&self, error: SessionError) {
        let _ = self.notify.send(ClientEvent::Diagnostic(error));
    }

    fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Connect { credential, ack } => {
                self.connect(credential);
                let _ = ack.send(());
            }
            SessionCommand::Disconnect { ack } => {
                self.disconnect();
                let _ = ack.send(());
            }
            SessionCommand::Publish(envelope) => self.publish(envelope),
            SessionCommand::Subscribe {
                destination,
                handler,
                reply,
            } => {
                let id = self.subscribe(destination, handler);
                let _ = reply.send(id);
            }
            SessionCommand::Unsubscribe(id) => self.unsubscribe(id),
            SessionCommand::Stats(reply) => {
                let _ = reply.send(self.stats());
            }
        }
    }

    fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Opened { epoch, result } => self.on_opened(epoch, result),
            SessionEvent::Link { epoch, event } => {
                if epoch != self.epoch {
                    trace!(target: "broker_session", epoch, current = self.epoch, "Ignoring stale link event");
                    return;
                }
                self.on_link_event(event);
            }
            SessionEvent::Timer(fired) => {
                if fired.epoch != self.epoch {
                    trace!(target: "broker_session", kind = ?fired.kind, "Ignoring stale timer");
                    return;
                }
                self.on_timer(fired.kind);
            }
        }
    }

    // Commands

    fn connect(&mut self, credential: Credential) {
        let state = self.state();
        if state.is_active() {
            debug!(state = %state, "connect() ignored, attempt already in progress");
            return;
        }
        if matches!(state, ConnectionState::Disconnected | ConnectionState::Closed(_)) {
            self.backoff.reset();
            self.ambiguous_auth_failures = 0;
        }
        self.credential = Some(credential);
        self.start_attempt();
    }

    fn disconnect(&mut self) {
        if self.state().is_closed() {
            self.outbound.clear();
            return;
        }
        self.close(CloseReason::ClientDisconnect);
    }

    fn publish(&mut self, envelope: OutboundEnvelope) {
        if self.state().is_connected() {
            let frame = Frame::send(&envelope.destination, envelope.payload.clone());
            if self.send_frame(&frame).is_ok() {
                return;
            }
        }
        self.enqueue(envelope);
    }

    fn enqueue(&mut self, envelope: OutboundEnvelope) {
        if let Some(evicted) = self.outbound.push(envelope) {
            let error = SessionError::Capacity {
                destination: evicted.destination.clone(),
            };
            warn!(capacity = self.outbound.capacity(), "{}", error);
            let _ = self.notify.send(ClientEvent::MessageDropped {
                destination: evicted.destination,
                enqueued_at: evicted.enqueued_at,
            });
        }
    }

    fn subscribe(&mut self, destination: String, handler: MessageHandler) -> SubscriptionId {
        let id = self.registry.add(destination.clone(), handler);
        debug!(subscription = %id, destination = %destination, "Subscription registered");

        if self.state().is_connected() {
            if let Some(frame) = self.registry.activate(id, self.epoch) {
                let _ = self.send_frame(&frame);
            }
        }
        id
    }

    fn unsubscribe(&mut self, id: SubscriptionId) {
        let Some(removed) = self.registry.remove(id) else {
            return;
        };
        debug!(subscription = %id, destination = %removed.destination, "Subscription removed");

        if let (Some(wire_id), true) = (removed.wire_id, self.state().is_connected()) {
            let _ = self.send_frame(&Frame::unsubscribe(&wire_id));
        }
    }

    fn stats(&self) -> SessionStats {
        calculate_session_stats(
            self.state(),
            self.connected_at,
            self.last_message_at,
            self.reconnect_count,
            self.outbound.len(),
            self.registry.len(),
        )
    }

    // Link lifecycle

    /// Close the current link, cancel its timers and move to a new epoch
    fn teardown_link(&mut self) {
        if let Some(link) = self.link.take() {
            link.close();
        }
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
        self.timers.cancel_all();
        self.codec.reset();
        self.registry.on_disconnected();
        self.negotiated = NegotiatedHeartBeat::default();
        self.connected_at = None;
        self.epoch += 1;
    }

    fn start_attempt(&mut self) {
        self.teardown_link();
        let epoch = self.epoch;
        self.set_state(ConnectionState::Connecting);

        let transport = Arc::clone(&self.transport);
        let endpoint = self.settings.endpoint.clone();
        let events = self.events_tx.clone();
        let span = crate::transport_span!(transport = transport.name(), epoch);
        tokio::spawn(
            async move {
                let result = transport.open(&endpoint).await;
                if let Err(e) = &result {
                    debug!(target: "broker_transport", error = %e, "Open failed");
                }
                if let Err(SendError(SessionEvent::Opened {
                    result: Ok(link), ..
                })) = events.send(SessionEvent::Opened { epoch, result })
                {
                    link.sender.close();
                }
            }
            .instrument(span),
        );

        self.timers
            .arm_once(TimerKind::ConnectTimeout, epoch, self.settings.connect_timeout);
    }

    fn on_opened(&mut self, epoch: u64, result: Result<TransportLink, TransportError>) {
        if epoch != self.epoch || !matches!(self.state(), ConnectionState::Connecting) {
            if let Ok(link) = result {
                debug!(epoch, "Closing link superseded while opening");
                link.sender.close();
            }
            return;
        }

        let link = match result {
            Ok(link) => link,
            Err(e) => {
                self.connection_lost(SessionError::Transport(e));
                return;
            }
        };

        let Some(credential) = self.credential.clone() else {
            link.sender.close();
            self.close(CloseReason::ClientDisconnect);
            return;
        };

        let TransportLink { sender, mut events } = link;
        let forward_to = self.events_tx.clone();
        self.forwarder = Some(tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let terminal = !matches!(event, TransportEvent::Data(_));
                if forward_to.send(SessionEvent::Link { epoch, event }).is_err() || terminal {
                    return;
                }
            }
            // Adapter went away without reporting why
            let _ = forward_to.send(SessionEvent::Link {
                epoch,
                event: TransportEvent::Closed(None),
            });
        }));
        self.link = Some(sender);
        self.last_inbound = Instant::now();

        self.set_state(ConnectionState::Authenticating);
        let connect = Frame::connect(&self.settings.host, self.settings.heartbeat, credential.expose());
        if let Err(e) = self.send_frame(&connect) {
            self.connection_lost(SessionError::Transport(e));
        }
    }

    fn on_link_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Data(bytes) => {
                self.last_inbound = Instant::now();
                self.codec.feed(&bytes);
                self.drain_codec();
            }
            TransportEvent::Closed(reason) => {
                let reason = reason.unwrap_or_else(|| "closed by peer".to_string());
                self.connection_lost(SessionError::Transport(TransportError::Closed(reason)));
            }
            TransportEvent::Error(e) => self.connection_lost(SessionError::Transport(e)),
        }
    }

    fn drain_codec(&mut self) {
        let epoch = self.epoch;
        while epoch == self.epoch {
            match self.codec.decode_next() {
                Ok(Some(Decoded::Frame(frame))) => self.on_frame(frame),
                Ok(Some(Decoded::Heartbeat)) => {
                    trace!(target: "broker_session", "Heart-beat received");
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Malformed frame from broker");
                    self.connection_lost(SessionError::Protocol(e));
                    break;
                }
            }
        }
    }

    fn on_frame(&mut self, frame: Frame) {
        debug!(target: "broker_session", frame = ?frame, "Frame received");
        match frame.command {
            FrameCommand::Connected => {
                if matches!(self.state(), ConnectionState::Authenticating) {
                    self.on_connected(&frame);
                } else {
                    warn!(state = %self.state(), "Unexpected CONNECTED frame ignored");
                }
            }
            FrameCommand::Message => {
                if !self.state().is_connected() {
                    warn!("MESSAGE before CONNECTED ignored");
                    return;
                }
                self.last_message_at = Some(Instant::now());
                let delivery = Delivery::from_frame(&frame);
                let delivered = self
                    .registry
                    .route(frame.get(headers::SUBSCRIPTION), &delivery);
                if delivered == 0 {
                    debug!(destination = %delivery.destination, "No handler for message");
                }
            }
            FrameCommand::Error => {
                if matches!(self.state(), ConnectionState::Authenticating) {
                    self.on_auth_failure(&frame);
                } else {
                    let error = SessionError::broker(error_summary(&frame));
                    warn!(error = %error, "Broker reported an error, reconnecting");
                    self.connection_lost(error);
                }
            }
            FrameCommand::Receipt => {
                debug!(target: "broker_session", receipt = ?frame.get("receipt-id"), "Receipt");
            }
            other => {
                warn!(command = other.as_str(), "Client-only frame received from broker, ignored");
            }
        }
    }

    fn on_connected(&mut self, frame: &Frame) {
        self.timers.cancel(TimerKind::ConnectTimeout);

        let server_beat = match frame.get(headers::HEART_BEAT).map(HeartBeat::parse) {
            Some(Ok(beat)) => beat,
            Some(Err(e)) => {
                warn!(error = %e, "Ignoring unusable heart-beat from broker");
                HeartBeat::disabled()
            }
            None => HeartBeat::disabled(),
        };
        self.negotiated = HeartBeat::negotiate(self.settings.heartbeat, server_beat);

        self.backoff.reset();
        self.ambiguous_auth_failures = 0;
        if self.ever_connected {
            self.reconnect_count += 1;
        }
        self.ever_connected = true;
        self.connected_at = Some(Instant::now());
        self.set_state(ConnectionState::Connected);

        let epoch = self.epoch;
        if let Some(every) = self.negotiated.send_every {
            self.timers.arm_repeating(TimerKind::HeartbeatOut, epoch, every);
        }
        if let Some(every) = self.negotiated.expect_every {
            self.timers.arm_repeating(TimerKind::HeartbeatCheck, epoch, every);
        }

        let subscribes = self.registry.on_connected(epoch);
        info!(
            version = frame.get(headers::VERSION).unwrap_or("unknown"),
            subscriptions = subscribes.len(),
            queued = self.outbound.len(),
            "Connected to broker"
        );
        for subscribe in &subscribes {
            if self.send_frame(subscribe).is_err() {
                return;
            }
        }
        self.flush_outbound();
    }

    fn flush_outbound(&mut self) {
        while let Some(envelope) = self.outbound.pop_front() {
            let frame = Frame::send(&envelope.destination, envelope.payload.clone());
            if self.send_frame(&frame).is_err() {
                self.outbound.push_front(envelope);
                break;
            }
        }
    }

    fn on_auth_failure(&mut self, frame: &Frame) {
        let kind = classify_auth_error(frame);
        let summary = sanitize_error_message(&error_summary(frame));
        warn!(kind = %kind, message = %summary, "Broker rejected CONNECT");
        self.diagnostic(SessionError::auth(kind, summary.clone()));

        match decide_auth_failure(
            kind,
            self.ambiguous_auth_failures,
            self.settings.max_ambiguous_auth_retries,
            &summary,
        ) {
            AuthDecision::Retry => {
                if kind == AuthFailureKind::Ambiguous {
                    self.ambiguous_auth_failures += 1;
                }
                self.schedule_reconnect(summary);
            }
            AuthDecision::Close(reason) => self.close(reason),
        }
    }

    fn on_timer(&mut self, kind: TimerKind) {
        match kind {
            TimerKind::Reconnect => {
                if matches!(self.state(), ConnectionState::ReconnectWaiting { .. }) {
                    self.start_attempt();
                }
            }
            TimerKind::ConnectTimeout => {
                if matches!(
                    self.state(),
                    ConnectionState::Connecting | ConnectionState::Authenticating
                ) {
                    let timeout = self.settings.connect_timeout;
                    self.connection_lost(SessionError::Transport(TransportError::TimedOut(format!(
                        "no CONNECTED within {}ms",
                        timeout.as_millis()
                    ))));
                }
            }
            TimerKind::HeartbeatOut => {
                if let Some(link) = &self.link {
                    trace!(target: "broker_session", "Sending heart-beat");
                    let _ = link.send(FrameCodec::heartbeat());
                }
            }
            TimerKind::HeartbeatCheck => {
                let Some(expect_every) = self.negotiated.expect_every else {
                    return;
                };
                let silence = self.last_inbound.elapsed();
                if heartbeat_overdue(silence, expect_every, self.settings.heartbeat_tolerance) {
                    self.connection_lost(SessionError::Transport(TransportError::TimedOut(format!(
                        "no inbound traffic for {}ms",
                        silence.as_millis()
                    ))));
                }
            }
        }
    }

    // Failure handling

    fn connection_lost(&mut self, error: SessionError) {
        warn!(error = %error, state = %self.state(), "Broker connection lost");
        let reason = error.to_string();
        self.diagnostic(error);
        self.schedule_reconnect(reason);
    }

    fn schedule_reconnect(&mut self, reason: String) {
        self.teardown_link();
        match self.backoff.next() {
            ReconnectDecision::Proceed { attempt, delay } => {
                self.set_state(ConnectionState::ReconnectWaiting { attempt, delay });
                self.timers.arm_once(TimerKind::Reconnect, self.epoch, delay);
            }
            ReconnectDecision::AbortMaxAttemptsExceeded => {
                self.close(CloseReason::RetriesExhausted(reason));
            }
        }
    }

    fn close(&mut self, reason: CloseReason) {
        if self.state().is_connected() {
            let _ = self.send_frame(&Frame::disconnect());
        }
        self.teardown_link();
        self.credential = None;

        if reason == CloseReason::ClientDisconnect && !self.outbound.is_empty() {
            debug!(discarded = self.outbound.len(), "Discarding queued messages on disconnect");
            self.outbound.clear();
        }
        self.set_state(ConnectionState::Closed(reason));
    }

    fn send_frame(&self, frame: &Frame) -> Result<(), TransportError> {
        let link = self
            .link
            .as_ref()
            .ok_or_else(|| TransportError::Closed("no active link".to_string()))?;
        debug!(target: "broker_session", frame = ?frame, "Frame sent");
        link.send(FrameCodec::encode(frame))
    }
}
