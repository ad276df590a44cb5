//! Huddle Network Library
//!
//! TCP links between replicas of the same room. Document updates cross the
//! wire as opaque blobs; this crate neither decodes nor orders them.
//!
//! # Architecture
//!
//! - **Server**: accepts inbound links
//! - **Client**: dials outbound links
//! - **Link**: either kind, once the handshake is done
//! - **Protocol**: Length-prefixed JSON messages
//!
//! # Usage
//!
//! ```ignore
//! let (events_tx, mut events) = tokio::sync::mpsc::channel(256);
//! let server = Server::start(7340, identity.clone(), events_tx.clone()).await?;
//! let client = Client::connect("10.0.0.2:7340", &identity, events_tx).await?;
//!
//! while let Some(event) = events.recv().await {
//!     match event {
//!         PeerEvent::Update { blob, .. } => { /* apply */ }
//!         _ => {}
//!     }
//! }
//! ```

pub mod client;
pub mod error;
mod frame;
pub mod link;
pub mod protocol;
pub mod server;
pub mod url;

pub use client::Client;
pub use error::{Error, Result};
pub use frame::SYNC_BATCH_BUDGET;
pub use link::{Direction, Identity, LinkHandle, LinkId, PeerEvent};
pub use protocol::{Blob, Message, PeerInfo};
pub use server::Server;
pub use url::PeerUrl;

/// Default port for Huddle listeners
pub const DEFAULT_PORT: u16 = 7340;
