//! Transport trait abstraction for ledger-packet carriers.
//!
//! A transport moves one serialized ledger packet to the peer and returns
//! the peer's serialized response. It also delivers unsolicited inbound
//! packets to a registered [`DataHandler`]. Connection management, retries
//! and reconnection belong to the transport implementation, not to STREAM.

use crate::error::TransportError;
use async_trait::async_trait;
use std::sync::Arc;

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Handler for inbound ledger packets.
///
/// Receives a serialized Prepare and must always answer with a serialized
/// Fulfill or Reject.
#[async_trait]
pub trait DataHandler: Send + Sync {
    /// Handle one inbound packet.
    async fn handle_data(&self, data: Vec<u8>) -> Vec<u8>;
}

/// Async transport trait for ledger-packet exchange.
///
/// # Examples
///
/// ```no_run
/// use lstream_transport::{MemoryTransport, Transport};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let (client, _server) = MemoryTransport::pair();
/// client.connect().await?;
/// let response = client.send_data(vec![12, 0]).await?;
/// println!("Received {} bytes", response.len());
/// # Ok(())
/// # }
/// ```
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish the underlying link.
    ///
    /// # Errors
    /// Returns `TransportError` if the link cannot be established
    async fn connect(&self) -> TransportResult<()>;

    /// Tear down the underlying link.
    ///
    /// # Errors
    /// Returns `TransportError` if closing fails
    async fn disconnect(&self) -> TransportResult<()>;

    /// Whether the link is up.
    fn is_connected(&self) -> bool;

    /// Send one serialized Prepare and wait for the serialized response.
    ///
    /// # Errors
    /// Returns `TransportError` if the packet could not be delivered at all.
    /// A delivered packet that was refused comes back as a serialized Reject.
    async fn send_data(&self, data: Vec<u8>) -> TransportResult<Vec<u8>>;

    /// Register the handler for inbound packets.
    ///
    /// # Errors
    /// Returns `TransportError::HandlerAlreadyRegistered` if one is present.
    fn register_data_handler(&self, handler: Arc<dyn DataHandler>) -> TransportResult<()>;

    /// Remove the inbound handler, if any.
    fn deregister_data_handler(&self);
}
