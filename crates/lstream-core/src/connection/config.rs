//! Connection configuration

use crate::stream::DEFAULT_STREAM_BUFFER_SIZE;
use crate::util::Ratio;
use std::time::Duration;

/// Default number of streams the peer may open at once
pub const DEFAULT_MAX_REMOTE_STREAMS: u64 = 10;

/// Default connection-wide data window in bytes
pub const DEFAULT_CONNECTION_BUFFER_SIZE: u64 = 10 * DEFAULT_STREAM_BUFFER_SIZE;

/// Largest ledger packet data field
pub const DEFAULT_MAX_PACKET_SIZE: usize = lstream_transport::MAX_DATA_SIZE;

/// Receipt parameters for a server-side connection
#[derive(Clone)]
pub struct ReceiptConfig {
    /// Nonce included in every receipt
    pub nonce: [u8; 16],
    /// Secret the receipts are authenticated with
    pub secret: [u8; 32],
}

impl std::fmt::Debug for ReceiptConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceiptConfig")
            .field("nonce", &hex::encode(self.nonce))
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// Connection configuration
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Our address, announced to the peer
    pub source_account: String,

    /// Our asset code
    pub asset_code: String,

    /// Our asset scale
    pub asset_scale: u8,

    /// Accepted drop from the probed exchange rate
    pub slippage: Ratio,

    /// Significant digits the probed rate must have
    pub minimum_exchange_rate_precision: u32,

    /// Fixed ceiling on the amount per packet
    pub maximum_packet_amount: Option<u64>,

    /// Streams the peer may have open at once
    pub max_remote_streams: u64,

    /// Connection-wide receive window
    pub connection_buffer_size: u64,

    /// Per-stream receive window
    pub stream_buffer_size: u64,

    /// Pad every packet's ciphertext to this size
    pub pad_packets_to: Option<usize>,

    /// Close after this long without a packet
    pub idle_timeout: Duration,

    /// How long to wait for a response; also the Prepare expiry
    pub packet_timeout: Duration,

    /// First retry delay after a temporary error
    pub min_retry_delay: Duration,

    /// Longest retry delay
    pub max_retry_delay: Duration,

    /// Probe packets sent before giving up on the exchange rate
    pub exchange_rate_attempts: u32,

    /// Largest ledger data field to produce
    pub max_packet_size: usize,

    /// Attach receipts to fulfilled packets
    pub receipts: Option<ReceiptConfig>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            source_account: "private.local".to_string(),
            asset_code: "XYZ".to_string(),
            asset_scale: 9,
            slippage: Ratio::new(1, 100).unwrap_or(Ratio::ONE),
            minimum_exchange_rate_precision: 3,
            maximum_packet_amount: None,
            max_remote_streams: DEFAULT_MAX_REMOTE_STREAMS,
            connection_buffer_size: DEFAULT_CONNECTION_BUFFER_SIZE,
            stream_buffer_size: DEFAULT_STREAM_BUFFER_SIZE,
            pad_packets_to: None,
            idle_timeout: Duration::from_secs(60),
            packet_timeout: Duration::from_secs(30),
            min_retry_delay: Duration::from_millis(100),
            max_retry_delay: Duration::from_secs(10),
            exchange_rate_attempts: 8,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            receipts: None,
        }
    }
}

impl ConnectionConfig {
    /// Set our address.
    #[must_use]
    pub fn with_source_account(mut self, account: impl Into<String>) -> Self {
        self.source_account = account.into();
        self
    }

    /// Set our asset.
    #[must_use]
    pub fn with_asset(mut self, code: impl Into<String>, scale: u8) -> Self {
        self.asset_code = code.into();
        self.asset_scale = scale;
        self
    }

    /// Set the accepted slippage.
    #[must_use]
    pub fn with_slippage(mut self, slippage: Ratio) -> Self {
        self.slippage = slippage;
        self
    }

    /// Set the required rate precision.
    #[must_use]
    pub fn with_exchange_rate_precision(mut self, digits: u32) -> Self {
        self.minimum_exchange_rate_precision = digits;
        self
    }

    /// Fix the ceiling on the amount per packet.
    #[must_use]
    pub fn with_maximum_packet_amount(mut self, amount: u64) -> Self {
        self.maximum_packet_amount = Some(amount);
        self
    }

    /// Set how many streams the peer may open.
    #[must_use]
    pub fn with_max_remote_streams(mut self, streams: u64) -> Self {
        self.max_remote_streams = streams;
        self
    }

    /// Set the per-stream receive window.
    #[must_use]
    pub fn with_stream_buffer_size(mut self, bytes: u64) -> Self {
        self.stream_buffer_size = bytes;
        self
    }

    /// Set the connection-wide receive window.
    #[must_use]
    pub fn with_connection_buffer_size(mut self, bytes: u64) -> Self {
        self.connection_buffer_size = bytes;
        self
    }

    /// Pad packets to a fixed ciphertext size.
    #[must_use]
    pub fn with_padding(mut self, size: usize) -> Self {
        self.pad_packets_to = Some(size.min(self.max_packet_size));
        self
    }

    /// Set the idle timeout.
    #[must_use]
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set the per-packet timeout.
    #[must_use]
    pub fn with_packet_timeout(mut self, timeout: Duration) -> Self {
        self.packet_timeout = timeout;
        self
    }

    /// Set the retry delay range.
    #[must_use]
    pub fn with_retry_delays(mut self, min: Duration, max: Duration) -> Self {
        self.min_retry_delay = min;
        self.max_retry_delay = max.max(min);
        self
    }

    /// Set how many probe packets to try.
    #[must_use]
    pub fn with_exchange_rate_attempts(mut self, attempts: u32) -> Self {
        self.exchange_rate_attempts = attempts;
        self
    }

    /// Attach receipts to fulfilled packets.
    #[must_use]
    pub fn with_receipts(mut self, nonce: [u8; 16], secret: [u8; 32]) -> Self {
        self.receipts = Some(ReceiptConfig { nonce, secret });
        self
    }

    /// Highest stream id the peer may use.
    #[must_use]
    pub fn max_stream_id(&self) -> u64 {
        self.max_remote_streams.saturating_mul(2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ConnectionConfig::default();
        assert_eq!(config.max_stream_id(), 20);
        assert_eq!(config.slippage, Ratio::new(1, 100).unwrap());
        assert_eq!(config.minimum_exchange_rate_precision, 3);
        assert_eq!(config.stream_buffer_size, 16_384);
        assert_eq!(config.packet_timeout, Duration::from_secs(30));
        assert_eq!(config.max_packet_size, 32_767);
        assert!(config.receipts.is_none());
    }

    #[test]
    fn test_builders() {
        let config = ConnectionConfig::default()
            .with_source_account("test.alice")
            .with_asset("USD", 2)
            .with_maximum_packet_amount(1500)
            .with_padding(100_000)
            .with_retry_delays(Duration::from_secs(1), Duration::from_millis(1));
        assert_eq!(config.source_account, "test.alice");
        assert_eq!(config.asset_code, "USD");
        assert_eq!(config.maximum_packet_amount, Some(1500));
        assert_eq!(config.pad_packets_to, Some(32_767));
        assert_eq!(config.max_retry_delay, Duration::from_secs(1));
    }

    #[test]
    fn test_receipt_secret_not_logged() {
        let config = ConnectionConfig::default().with_receipts([1; 16], [2; 32]);
        let printed = format!("{config:?}");
        assert!(printed.contains("REDACTED"));
        assert!(!printed.contains("[2, 2"));
    }
}
