//! # LSTREAM Core
//!
//! Multiplexed streams of money and data between two endpoints that share a
//! secret, carried over a conditional-payment transport of Prepare, Fulfill
//! and Reject packets.
//!
//! This crate provides:
//! - Packet and frame encoding with authenticated encryption
//! - Per-stream money and data accounting with flow control
//! - Packet amount discovery and exchange-rate probing
//! - Client connections and a server that hands out per-client addresses
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Server / Connection                         │
//! │   (send loop, inbound handler, handshake, rate probing)         │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                          Streams                                │
//! │   (money holds, receive limits, ordered data with windows)      │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                      Packets and frames                         │
//! │   (encrypted into the data field of ledger packets)             │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use lstream_core::{Connection, ConnectionConfig, Server, ServerConfig};
//! use lstream_transport::MemoryTransport;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let (client_side, server_side) = MemoryTransport::pair();
//! let server = Server::listen(Arc::new(server_side), ServerConfig::new("test.server")).await?;
//! let (address, secret) = server.generate_address_and_secret(None)?;
//!
//! let client = Connection::connect(
//!     Arc::new(client_side),
//!     address,
//!     &secret,
//!     ConnectionConfig::default().with_source_account("test.client"),
//! )
//! .await?;
//! let stream = client.create_stream()?;
//! stream.send_total(1000, Duration::from_secs(5)).await?;
//! client.end().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod congestion;
pub mod connection;
pub mod error;
pub mod packet;
pub mod server;
pub mod stream;
pub mod util;

pub use congestion::CongestionController;
pub use connection::{
    AssetDetails, Connection, ConnectionConfig, ConnectionEvent, ConnectionStats, Role, Stream,
    StreamEvent,
};
pub use error::{ConnectionError, Error, PacketError, Result, StreamError};
pub use packet::{ErrorCode, Frame, FrameType, Packet};
pub use server::{DEFAULT_CLOSED_CONNECTION_GRACE, Server, ServerConfig};
pub use stream::StreamState;
pub use util::Ratio;

/// Open a client connection. Shorthand for [`Connection::connect`].
///
/// # Errors
///
/// See [`Connection::connect`].
pub async fn create_connection(
    transport: std::sync::Arc<dyn lstream_transport::Transport>,
    destination_account: impl Into<String>,
    shared_secret: &[u8; 32],
    config: ConnectionConfig,
) -> std::result::Result<Connection, ConnectionError> {
    Connection::connect(transport, destination_account, shared_secret, config).await
}
