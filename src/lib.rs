//! # relay-link
//!
//! A resilient persistent-connection client: one logical duplex message
//! channel to a remote endpoint over an unreliable transport, with a simple
//! send/receive/subscribe surface on top.
//!
//! ## Features
//!
//! - **Auto-reconnection** with capped exponential backoff and a bounded
//!   attempt budget
//! - **Connect timeouts** and an awaitable readiness gate (no polling)
//! - **Offline queueing**: bounded FIFO replayed on reconnect, lossy under
//!   pressure by design
//! - **Typed dispatch**: subscribe handlers per message-type tag or
//!   globally; unsubscription via explicit capability tokens
//! - **Heartbeat** liveness probes while connected
//! - **Observability**: watchable connection status, lifecycle hooks,
//!   bounded message history
//!
//! ## Example
//!
//! ```rust,no_run
//! use relay_link::{RelayLinkClient, SendOptions};
//!
//! # async fn example() -> relay_link::Result<()> {
//! let client = RelayLinkClient::builder()
//!     .url("wss://relay.example.test/ws")
//!     .build()?;
//!
//! client.connect().await?;
//!
//! let sub = client.subscribe("utxo", |data| {
//!     println!("utxo update: {}", data);
//! });
//!
//! client
//!     .send("query", serde_json::json!({"tag": "snapshot"}), SendOptions::default())
//!     .await?;
//!
//! sub.unsubscribe();
//! client.disconnect().await?;
//! # Ok(())
//! # }
//! ```

mod backoff;
mod connection;
mod gate;
mod handlers;
mod history;
mod queue;

pub mod client;
pub mod error;
pub mod event_handlers;
pub mod models;
pub mod transport;

pub use client::{RelayLinkClient, RelayLinkClientBuilder};
pub use error::{RelayLinkError, Result};
pub use event_handlers::{DisconnectReason, EventHandlers};
pub use handlers::{HandlerId, MessageHandler, Subscription};
pub use models::{
    ConnectionOptions, ConnectionState, ConnectionStatus, Envelope, SendOptions, SendOutcome,
};
pub use transport::{Connector, TransportEvent, TransportLink, WsConnector};
