//! Async client for the CDP control/telemetry protocol.
//!
//! A [`Client`] connects to a control application over WebSocket, negotiates
//! the protocol handshake (optionally authenticating with challenge/response
//! credentials), then exposes the server's hierarchical tree of typed nodes:
//! read and write scalar values, and subscribe to structural and
//! value-change notifications.
//!
//! ```no_run
//! use cdp_client::{Client, ClientOptions, DefaultListener};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), cdp_client::Error> {
//!     let client = Arc::new(Client::new(
//!         ClientOptions::new("127.0.0.1"),
//!         Arc::new(DefaultListener),
//!     ));
//!
//!     let runner = {
//!         let client = Arc::clone(&client);
//!         tokio::spawn(async move { client.run_event_loop().await })
//!     };
//!
//!     let value = client.find_node("App1.Comp1.Value1").await?;
//!     println!("{} = {:?}", value.path(), value.last_value());
//!
//!     client.disconnect();
//!     let _ = runner.await;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod error;
pub mod listener;
pub mod node;
pub mod value;

mod auth;
mod requests;
mod session;
mod time_sync;
mod tree;

pub use client::{Client, ClientOptions, DEFAULT_PORT};
pub use error::{Error, Result};
pub use listener::{
    ApplicationAcceptanceRequest, CredentialsRequest, DefaultListener, NotificationListener,
    UserAuthResult,
};
pub use node::{Node, SubscriptionToken};
pub use value::Value;

pub use cdp_proto as proto;
pub use cdp_proto::{AuthResultCode, NodeType, ValueType};
