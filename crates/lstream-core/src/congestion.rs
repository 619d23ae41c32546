//! Per-path packet amount discovery.
//!
//! The path between two endpoints has an unknown maximum packet amount. The
//! controller probes for it: the probe doubles while the ceiling is unknown,
//! climbs by a tenth of the ceiling once a ceiling is known, and drops when
//! the path rejects a packet as too large or short of liquidity.

use crate::util::multiply_divide_floor;
use lstream_transport::{AmountTooLargeData, ErrorCode as RejectCode, Reject};
use tracing::debug;

/// Smallest probe after a liquidity rejection, so that at least one unit
/// survives exchange-rate conversion.
const MIN_LIQUIDITY_PROBE: u64 = 2;

/// Packet amount discovery state
#[derive(Debug, Clone)]
pub struct CongestionController {
    /// Currently probed amount
    test_maximum_packet_amount: u64,
    /// Best known ceiling, `None` while unbounded
    maximum_packet_amount: Option<u64>,
    /// Ceiling fixed by the application
    fixed_maximum: Option<u64>,
}

impl CongestionController {
    /// Create a controller, optionally with a fixed ceiling.
    #[must_use]
    pub fn new(fixed_maximum: Option<u64>) -> Self {
        Self {
            test_maximum_packet_amount: fixed_maximum.unwrap_or(u64::MAX),
            maximum_packet_amount: None,
            fixed_maximum,
        }
    }

    /// Best known path ceiling, if one has been discovered.
    #[must_use]
    pub fn known_maximum(&self) -> Option<u64> {
        self.maximum_packet_amount
    }

    /// `min(discovered ceiling, fixed ceiling)`.
    #[must_use]
    pub fn maximum_packet_amount(&self) -> u64 {
        self.maximum_packet_amount
            .unwrap_or(u64::MAX)
            .min(self.fixed_maximum.unwrap_or(u64::MAX))
    }

    /// Amount to put in the next packet.
    #[must_use]
    pub fn test_maximum_packet_amount(&self) -> u64 {
        self.test_maximum_packet_amount.min(self.maximum_packet_amount())
    }

    /// A packet carrying `amount_sent` was fulfilled.
    pub fn on_fulfill(&mut self, amount_sent: u64) {
        let ceiling = self.maximum_packet_amount();
        let probe = self.test_maximum_packet_amount();
        if amount_sent != probe || probe >= ceiling {
            return;
        }
        let next = if self.maximum_packet_amount.is_some() || self.fixed_maximum.is_some() {
            probe.saturating_add((ceiling / 10).max(1))
        } else {
            probe.saturating_mul(2)
        };
        self.test_maximum_packet_amount = next.min(ceiling);
        debug!(
            probe = self.test_maximum_packet_amount,
            ceiling, "raised packet amount probe"
        );
    }

    /// A packet carrying `amount_sent` was rejected.
    pub fn on_reject(&mut self, amount_sent: u64, reject: &Reject) {
        if reject.code == RejectCode::F08_AMOUNT_TOO_LARGE {
            let data = AmountTooLargeData::from_bytes(&reject.data).ok();
            self.on_amount_too_large(amount_sent, data);
        } else if reject.code == RejectCode::T04_INSUFFICIENT_LIQUIDITY {
            self.on_insufficient_liquidity();
        }
    }

    /// The path refused `amount_sent` as too large.
    pub fn on_amount_too_large(&mut self, amount_sent: u64, data: Option<AmountTooLargeData>) {
        let (ceiling, probe) = match data {
            Some(d) if d.received_amount > d.maximum_amount => {
                // scale the path's maximum back into source units
                let ceiling = multiply_divide_floor(amount_sent, d.maximum_amount, d.received_amount)
                    .unwrap_or_else(|_| amount_sent.saturating_sub(1));
                (ceiling, ceiling)
            }
            _ => {
                let ceiling = amount_sent.saturating_sub(1);
                (ceiling, ceiling / 2)
            }
        };
        let ceiling = match self.maximum_packet_amount {
            Some(existing) => existing.min(ceiling),
            None => ceiling,
        };
        self.maximum_packet_amount = Some(ceiling);
        self.test_maximum_packet_amount = probe.min(ceiling);
        debug!(
            amount_sent,
            ceiling,
            probe = self.test_maximum_packet_amount,
            "path rejected packet as too large"
        );
    }

    /// The path ran out of liquidity for the last packet.
    pub fn on_insufficient_liquidity(&mut self) {
        let probe = self.test_maximum_packet_amount();
        self.test_maximum_packet_amount = probe.saturating_sub(probe / 3).max(MIN_LIQUIDITY_PROBE);
        debug!(
            probe = self.test_maximum_packet_amount,
            "reduced packet amount probe after liquidity error"
        );
    }
}

impl Default for CongestionController {
    fn default() -> Self {
        Self::new(None)
    }
}
