//! brokerlink - resilient broker session client
//!
//! Maintains one logical connection to a STOMP 1.2 broker over an unreliable
//! transport, multiplexes many subscriptions onto it, and survives link drops
//! by reconnecting with backoff and replaying every live subscription.
//!
//! # Overview
//!
//! - [`protocol`]: frame model, resumable codec and heart-beat negotiation
//! - [`transport`]: the `Transport` capability with WebSocket and TCP adapters
//! - [`session`]: the lifecycle state machine, subscription registry,
//!   outbound queue and backoff
//! - [`client`]: the [`BrokerClient`] facade
//!
//! # Quick Start
//!
//! ```no_run
//! use brokerlink::{BrokerClient, ClientConfig};
//! use std::time::Duration;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ClientConfig::for_endpoint("wss://broker.example.com/ws");
//! let client = BrokerClient::from_config(&config)?;
//!
//! let subscription = client
//!     .subscribe("/topic/chat", |delivery| println!("{}", delivery.payload))
//!     .await?;
//!
//! client.connect("bearer-token").await?;
//! client.wait_until_connected(Duration::from_secs(10)).await?;
//! client.publish("/topic/chat", &serde_json::json!({"text": "hello"}))?;
//!
//! subscription.unsubscribe();
//! client.disconnect().await;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod observability;
pub mod protocol;
pub mod session;
pub mod testing;
pub mod transport;

pub use client::{BrokerClient, Subscription};
pub use config::{ClientConfig, ConfigError};
pub use error::{AuthFailureKind, SessionError, SessionResult};
pub use session::{
    ClientEvent, CloseReason, ConnectionState, Credential, Delivery, SessionStats, SubscriptionId,
};
