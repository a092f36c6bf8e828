//! # natswire
//!
//! A resilient Tokio client for the NATS wire protocol: publish/subscribe
//! with at-least-once delivery semantics over a single persistent socket.
//!
//! The crate is built around three pieces:
//!
//! - an incremental, binary-safe **wire parser** that tolerates frames
//!   split at arbitrary TCP chunk boundaries,
//! - a **connection actor** owning the socket, driving the handshake, and
//!   reconnecting across a gossip-maintained server pool with backoff,
//! - a **subscription registry and request multiplexer** correlating many
//!   concurrent request/reply exchanges over one wildcard inbox
//!   subscription.
//!
//! ## Example
//!
//! ```ignore
//! use natswire::{Client, Options};
//!
//! #[tokio::main]
//! async fn main() -> natswire::Result<()> {
//!     let client = Client::connect(Options::new().server("127.0.0.1:4222")).await?;
//!
//!     let mut sub = client.subscribe("greet.*").await?;
//!     client.publish("greet.joe", "hello").await?;
//!     if let Some(Ok(message)) = sub.next().await {
//!         println!("{}: {:?}", message.subject, message.payload);
//!     }
//!
//!     let reply = client.request("time.now", "").await?;
//!     println!("reply: {:?}", reply.payload);
//!
//!     client.drain().await
//! }
//! ```

pub mod auth;
pub mod connection;
pub mod error;
pub mod options;
pub mod protocol;
pub mod transport;

mod mux;
mod subs;

pub use auth::{Authenticator, Credentials};
pub use connection::{Client, Event, PoolUpdate, RequestOptions, ServerEndpoint, Stats};
pub use error::{Error, ParseError, PermissionOperation, Result, ServerError};
pub use options::Options;
pub use protocol::{HeaderMap, ServerInfo};
pub use subs::{Message, SubscribeOptions, Subscription};

/// Connect to a single server with default options.
pub async fn connect(server: impl Into<String>) -> Result<Client> {
    Client::connect(Options::new().server(server)).await
}
