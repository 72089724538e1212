//! Subscription registry
//!
//! Logical subscriptions outlive individual transport links. Each carries a
//! wire id only while a connection is up; ids are regenerated per connection
//! epoch and every live entry is replayed as a SUBSCRIBE on reconnect.

use crate::protocol::{headers, Frame};
use serde_json::Value;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, warn};

/// Stable identifier of one subscribe() registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An inbound MESSAGE as handed to application handlers
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub destination: String,
    pub message_id: Option<String>,
    pub headers: Vec<(String, String)>,
    /// JSON body; non-JSON bodies arrive as a string, empty bodies as null
    pub payload: Value,
}

impl Delivery {
    pub fn from_frame(frame: &Frame) -> Self {
        let payload = if frame.body.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&frame.body).unwrap_or_else(|_| Value::String(frame.body_text()))
        };
        Self {
            destination: frame.get(headers::DESTINATION).unwrap_or_default().to_string(),
            message_id: frame.get(headers::MESSAGE_ID).map(str::to_string),
            headers: frame.headers.clone(),
            payload,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

/// Callback consuming deliveries. Runs on the session task, so it must not block.
pub type MessageHandler = Arc<dyn Fn(&Delivery) + Send + Sync>;

/// What remains of a removed subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovedSubscription {
    pub destination: String,
    /// Set when the subscription was live on the current connection
    pub wire_id: Option<String>,
}

struct Entry {
    id: SubscriptionId,
    destination: String,
    handler: MessageHandler,
    wire_id: Option<String>,
}

/// Destination to handler bookkeeping, in creation order
#[derive(Default)]
pub struct SubscriptionRegistry {
    entries: Vec<Entry>,
    next_id: u64,
}

impl fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(
                self.entries
                    .iter()
                    .map(|e| (e.id, e.destination.as_str(), e.wire_id.as_deref())),
            )
            .finish()
    }
}

fn wire_id_for(epoch: u64, id: SubscriptionId) -> String {
    format!("sub-{epoch}-{id}")
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, destination: impl Into<String>, handler: MessageHandler) -> SubscriptionId {
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        self.entries.push(Entry {
            id,
            destination: destination.into(),
            handler,
            wire_id: None,
        });
        id
    }

    /// Drop a registration. `None` if it was already removed.
    pub fn remove(&mut self, id: SubscriptionId) -> Option<RemovedSubscription> {
        let index = self.entries.iter().position(|e| e.id == id)?;
        let entry = self.entries.remove(index);
        Some(RemovedSubscription {
            destination: entry.destination,
            wire_id: entry.wire_id,
        })
    }

    /// Assign fresh wire ids for `epoch` and build one SUBSCRIBE per entry,
    /// in creation order
    pub fn on_connected(&mut self, epoch: u64) -> Vec<Frame> {
        self.entries
            .iter_mut()
            .map(|entry| {
                let wire_id = wire_id_for(epoch, entry.id);
                let frame = Frame::subscribe(&entry.destination, &wire_id);
                entry.wire_id = Some(wire_id);
                frame
            })
            .collect()
    }

    /// Give a single entry its wire id on the live connection
    pub fn activate(&mut self, id: SubscriptionId, epoch: u64) -> Option<Frame> {
        let entry = self.entries.iter_mut().find(|e| e.id == id)?;
        let wire_id = wire_id_for(epoch, entry.id);
        let frame = Frame::subscribe(&entry.destination, &wire_id);
        entry.wire_id = Some(wire_id);
        Some(frame)
    }

    /// The link is gone; wire ids are meaningless now
    pub fn on_disconnected(&mut self) {
        for entry in &mut self.entries {
            entry.wire_id = None;
        }
    }

    /// Deliver to every handler on `destination`, in registration order
    pub fn dispatch(&self, destination: &str, delivery: &Delivery) -> usize {
        let mut delivered = 0;
        for entry in self.entries.iter().filter(|e| e.destination == destination) {
            invoke(entry, delivery);
            delivered += 1;
        }
        delivered
    }

    /// Route an inbound MESSAGE: an exact wire id match wins, otherwise fan
    /// out by destination
    pub fn route(&self, wire_id: Option<&str>, delivery: &Delivery) -> usize {
        if let Some(wire_id) = wire_id {
            if let Some(entry) = self
                .entries
                .iter()
                .find(|e| e.wire_id.as_deref() == Some(wire_id))
            {
                invoke(entry, delivery);
                return 1;
            }
        }
        self.dispatch(&delivery.destination, delivery)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries currently carrying a wire id
    pub fn live_count(&self) -> usize {
        self.entries.iter().filter(|e| e.wire_id.is_some()).count()
    }
}

fn invoke(entry: &Entry, delivery: &Delivery) {
    debug!(
        target: "broker_session",
        subscription = %entry.id,
        destination = %entry.destination,
        "Dispatching message"
    );
    if catch_unwind(AssertUnwindSafe(|| (entry.handler)(delivery))).is_err() {
        warn!(
            subscription = %entry.id,
            destination = %entry.destination,
            "Message handler panicked"
        );
    }
}
