//! Broker session: lifecycle state machine and its collaborators
//!
//! Pure policy (`backoff`, `lifecycle`, `outbound`, `registry`) is kept apart
//! from the impure actor in `driver`, which owns the link and the timers.

pub mod backoff;
pub mod credential;
pub(crate) mod driver;
pub mod lifecycle;
pub mod outbound;
pub mod registry;
pub mod settings;
pub mod state;
pub mod timers;

pub use backoff::{Backoff, ReconnectDecision, ReconnectPolicy};
pub use credential::Credential;
pub use driver::ClientEvent;
pub use lifecycle::SessionStats;
pub use outbound::{OutboundEnvelope, OutboundQueue};
pub use registry::{Delivery, MessageHandler, SubscriptionId, SubscriptionRegistry};
pub use settings::SessionSettings;
pub use state::{CloseReason, ConnectionState};
