//! # LSTREAM Transport
//!
//! The ledger-packet layer that LSTREAM packets ride on.
//!
//! This crate provides:
//! - The [`Transport`] trait: one `send_data(request) -> response` exchange
//!   plus a handler for unsolicited inbound packets
//! - OER binary primitives (variable-length integers, length-prefixed strings)
//! - Ledger packets (Prepare / Fulfill / Reject) and their codec
//! - An in-memory duplex transport with a configurable path (exchange rate,
//!   maximum packet amount, liquidity) for tests and local use

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod ledger;
pub mod memory;
pub mod oer;
pub mod transport;

pub use error::{CodecError, TransportError};
pub use ledger::{AmountTooLargeData, ErrorCode, Fulfill, LedgerPacket, Prepare, Reject};
pub use memory::{MemoryTransport, PathConfig};
pub use transport::{DataHandler, Transport, TransportResult};

/// Maximum size of the data field of a ledger packet
pub const MAX_DATA_SIZE: usize = 32767;
