//! In-memory duplex transport.
//!
//! Two [`MemoryTransport`] endpoints are linked back to back. Every Prepare
//! sent by one endpoint crosses a simulated path before it reaches the
//! other endpoint's [`DataHandler`]. The path behaves like a single
//! connector hop:
//!
//! - converts the amount with a fixed exchange rate (floor)
//! - rejects amounts above its maximum with `F08` and
//!   [`AmountTooLargeData`]
//! - rejects amounts above its remaining liquidity with `T04`
//! - rejects expired packets with `R00`
//! - checks that fulfillments match conditions (`F05` otherwise)

use crate::error::TransportError;
use crate::ledger::{AmountTooLargeData, ErrorCode, LedgerPacket, Prepare, Reject};
use crate::transport::{DataHandler, Transport, TransportResult};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, SystemTime};

/// Behaviour of one direction of the simulated path
#[derive(Debug, Clone)]
pub struct PathConfig {
    /// Exchange rate as `(numerator, denominator)`
    pub exchange_rate: (u64, u64),
    /// Largest amount accepted per packet
    pub max_packet_amount: Option<u64>,
    /// Total amount the path can carry before it runs dry
    pub liquidity: Option<u64>,
    /// One-way delay added to every packet
    pub latency: Duration,
    /// Address used in `triggered_by` of path-generated rejects
    pub address: String,
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            exchange_rate: (1, 1),
            max_packet_amount: None,
            liquidity: None,
            latency: Duration::ZERO,
            address: "test.connector".to_string(),
        }
    }
}

impl PathConfig {
    /// Set the exchange rate.
    #[must_use]
    pub fn with_exchange_rate(mut self, numerator: u64, denominator: u64) -> Self {
        self.exchange_rate = (numerator, denominator);
        self
    }

    /// Set the maximum packet amount.
    #[must_use]
    pub fn with_max_packet_amount(mut self, max: u64) -> Self {
        self.max_packet_amount = Some(max);
        self
    }

    /// Set the available liquidity.
    #[must_use]
    pub fn with_liquidity(mut self, liquidity: u64) -> Self {
        self.liquidity = Some(liquidity);
        self
    }

    /// Set the one-way latency.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }
}

/// Counters for one direction of the path
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PathStats {
    /// Prepares that reached the far endpoint
    pub forwarded: u64,
    /// Prepares that were fulfilled
    pub fulfilled: u64,
    /// Prepares that were rejected, by the path or the far endpoint
    pub rejected: u64,
    /// Total source amount of fulfilled packets
    pub amount_fulfilled: u64,
}

struct Endpoint {
    handler: RwLock<Option<Arc<dyn DataHandler>>>,
    connected: AtomicBool,
}

impl Endpoint {
    fn new() -> Self {
        Self {
            handler: RwLock::new(None),
            connected: AtomicBool::new(false),
        }
    }

    fn handler(&self) -> Option<Arc<dyn DataHandler>> {
        match self.handler.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

struct Path {
    config: PathConfig,
    liquidity: Mutex<Option<u64>>,
    temporary_failures: AtomicU32,
    forwarded: AtomicU64,
    fulfilled: AtomicU64,
    rejected: AtomicU64,
    amount_fulfilled: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl Path {
    fn new(config: PathConfig) -> Self {
        Self {
            liquidity: Mutex::new(config.liquidity),
            config,
            temporary_failures: AtomicU32::new(0),
            forwarded: AtomicU64::new(0),
            fulfilled: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            amount_fulfilled: AtomicU64::new(0),
        }
    }

    fn reject(&self, code: ErrorCode, message: &str) -> LedgerPacket {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        Reject::new(code, &self.config.address, message).into()
    }

    fn convert(&self, amount: u64) -> Option<u64> {
        let (numerator, denominator) = self.config.exchange_rate;
        if denominator == 0 {
            return None;
        }
        let converted = u128::from(amount) * u128::from(numerator) / u128::from(denominator);
        u64::try_from(converted).ok()
    }

    async fn forward(&self, prepare: Prepare, remote: &Endpoint) -> LedgerPacket {
        if self
            .temporary_failures
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
        {
            return self.reject(ErrorCode::T00_INTERNAL_ERROR, "injected temporary failure");
        }

        if let Some(max) = self.config.max_packet_amount {
            if prepare.amount > max {
                tracing::trace!(amount = prepare.amount, max, "path rejecting packet as too large");
                self.rejected.fetch_add(1, Ordering::Relaxed);
                return Reject::new(
                    ErrorCode::F08_AMOUNT_TOO_LARGE,
                    &self.config.address,
                    "packet amount exceeds maximum",
                )
                .with_data(
                    AmountTooLargeData {
                        received_amount: prepare.amount,
                        maximum_amount: max,
                    }
                    .to_bytes(),
                )
                .into();
            }
        }

        if let Some(remaining) = *lock(&self.liquidity) {
            if prepare.amount > remaining {
                return self.reject(ErrorCode::T04_INSUFFICIENT_LIQUIDITY, "insufficient liquidity");
            }
        }

        let time_left = match prepare.expires_at.duration_since(SystemTime::now()) {
            Ok(left) if !left.is_zero() => left,
            _ => return self.reject(ErrorCode::R00_TRANSFER_TIMED_OUT, "packet expired"),
        };

        let Some(amount) = self.convert(prepare.amount) else {
            return self.reject(ErrorCode::F02_UNREACHABLE, "no exchange rate");
        };

        let handler = match remote.handler() {
            Some(handler) if remote.connected.load(Ordering::Acquire) => handler,
            _ => return self.reject(ErrorCode::F02_UNREACHABLE, "receiver not connected"),
        };

        let source_amount = prepare.amount;
        let condition = prepare.execution_condition;
        let forwarded = LedgerPacket::Prepare(Prepare { amount, ..prepare });
        self.forwarded.fetch_add(1, Ordering::Relaxed);

        let response =
            match tokio::time::timeout(time_left, handler.handle_data(forwarded.to_bytes())).await {
                Ok(bytes) => bytes,
                Err(_) => return self.reject(ErrorCode::R00_TRANSFER_TIMED_OUT, "packet expired"),
            };

        match LedgerPacket::from_bytes(&response) {
            Ok(LedgerPacket::Fulfill(fulfill)) => {
                let hash: [u8; 32] = Sha256::digest(fulfill.fulfillment).into();
                if hash != condition {
                    return self.reject(
                        ErrorCode::F05_WRONG_CONDITION,
                        "fulfillment does not match condition",
                    );
                }
                if let Some(remaining) = lock(&self.liquidity).as_mut() {
                    *remaining = remaining.saturating_sub(source_amount);
                }
                self.fulfilled.fetch_add(1, Ordering::Relaxed);
                self.amount_fulfilled
                    .fetch_add(source_amount, Ordering::Relaxed);
                LedgerPacket::Fulfill(fulfill)
            }
            Ok(LedgerPacket::Reject(reject)) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                LedgerPacket::Reject(reject)
            }
            Ok(LedgerPacket::Prepare(_)) | Err(_) => {
                self.reject(ErrorCode::T00_INTERNAL_ERROR, "invalid response from receiver")
            }
        }
    }
}

/// One endpoint of an in-memory duplex transport
#[derive(Clone)]
pub struct MemoryTransport {
    local: Arc<Endpoint>,
    remote: Arc<Endpoint>,
    outgoing: Arc<Path>,
}

impl MemoryTransport {
    /// Create two linked endpoints with a 1:1 path in both directions.
    #[must_use]
    pub fn pair() -> (Self, Self) {
        Self::pair_with(PathConfig::default(), PathConfig::default())
    }

    /// Create two linked endpoints with the given path behaviour for
    /// `a -> b` and `b -> a`.
    #[must_use]
    pub fn pair_with(a_to_b: PathConfig, b_to_a: PathConfig) -> (Self, Self) {
        let a = Arc::new(Endpoint::new());
        let b = Arc::new(Endpoint::new());
        (
            Self {
                local: a.clone(),
                remote: b.clone(),
                outgoing: Arc::new(Path::new(a_to_b)),
            },
            Self {
                local: b,
                remote: a,
                outgoing: Arc::new(Path::new(b_to_a)),
            },
        )
    }

    /// Make the next `count` outgoing packets fail with `T00`.
    pub fn inject_temporary_errors(&self, count: u32) {
        self.outgoing
            .temporary_failures
            .fetch_add(count, Ordering::AcqRel);
    }

    /// Counters for the outgoing direction.
    #[must_use]
    pub fn stats(&self) -> PathStats {
        PathStats {
            forwarded: self.outgoing.forwarded.load(Ordering::Relaxed),
            fulfilled: self.outgoing.fulfilled.load(Ordering::Relaxed),
            rejected: self.outgoing.rejected.load(Ordering::Relaxed),
            amount_fulfilled: self.outgoing.amount_fulfilled.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self) -> TransportResult<()> {
        self.local.connected.store(true, Ordering::Release);
        Ok(())
    }

    async fn disconnect(&self) -> TransportResult<()> {
        self.local.connected.store(false, Ordering::Release);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.local.connected.load(Ordering::Acquire)
    }

    async fn send_data(&self, data: Vec<u8>) -> TransportResult<Vec<u8>> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let LedgerPacket::Prepare(prepare) = LedgerPacket::from_bytes(&data)? else {
            return Err(TransportError::Other(
                "only Prepare packets can be sent".to_string(),
            ));
        };

        if !self.outgoing.config.latency.is_zero() {
            tokio::time::sleep(self.outgoing.config.latency).await;
        }
        let response = self.outgoing.forward(prepare, &self.remote).await;
        if !self.outgoing.config.latency.is_zero() {
            tokio::time::sleep(self.outgoing.config.latency).await;
        }
        Ok(response.to_bytes())
    }

    fn register_data_handler(&self, handler: Arc<dyn DataHandler>) -> TransportResult<()> {
        let mut slot = match self.local.handler.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if slot.is_some() {
            return Err(TransportError::HandlerAlreadyRegistered);
        }
        *slot = Some(handler);
        Ok(())
    }

    fn deregister_data_handler(&self) {
        let mut slot = match self.local.handler.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = None;
    }
}
