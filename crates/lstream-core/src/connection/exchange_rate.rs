//! Handshake and exchange-rate probing.
//!
//! Both use unfulfillable packets: the peer handles the frames and rejects
//! with an encrypted reply, which for a probe reports the amount that
//! actually arrived.

use super::ConnectionInner;
use super::send_loop::Response;
use crate::error::ConnectionError;
use crate::packet::Packet;
use crate::util::{Ratio, count_digits};
use lstream_transport::ErrorCode as RejectCode;
use lstream_transport::ledger::PacketType;
use std::sync::Arc;
use tracing::{debug, info};

/// Probe amounts, tried in order until the received amount is precise enough
const PROBE_AMOUNTS: [u64; 6] = [
    1_000,
    1_000_000,
    1_000_000_000,
    1_000_000_000_000,
    1_000_000_000_000_000,
    1_000_000_000_000_000_000,
];

impl ConnectionInner {
    /// Announce our address and limits to the peer.
    pub(crate) async fn handshake(self: &Arc<Self>) -> Result<(), ConnectionError> {
        let frames = self.lock().announce_frames(&self.config, true);
        for _ in 0..self.config.exchange_rate_attempts.max(1) {
            let sequence = self.lock().take_sequence()?;
            let packet = Packet::new(sequence, PacketType::Prepare, 0, frames.clone());
            match self.send_packet(&packet, 0, false).await? {
                Response::Rejected {
                    response: Some(reply),
                    ..
                } => {
                    self.lock().announced = true;
                    self.apply_response_frames(reply.frames)?;
                    debug!(connection = %self.id, "handshake complete");
                    return Ok(());
                }
                Response::Rejected { reject, response: None }
                    if reject.code.is_temporary() || reject.code.is_relative() =>
                {
                    debug!(connection = %self.id, code = %reject.code, "handshake rejected, retrying");
                    self.back_off().await;
                }
                Response::Rejected { reject, .. } => {
                    return Err(ConnectionError::ConnectFailed(format!(
                        "{}: {}",
                        reject.code, reject.message
                    )));
                }
                Response::Fulfilled { .. } => {
                    return Err(ConnectionError::ConnectFailed(
                        "peer fulfilled an unfulfillable packet".to_string(),
                    ));
                }
            }
        }
        Err(ConnectionError::ConnectFailed("peer did not answer".to_string()))
    }

    /// Probe the path's exchange rate and store it.
    ///
    /// Probes start small and grow until the received amount has enough
    /// significant digits. `F08` lowers the probe to the path maximum.
    pub(crate) async fn discover_exchange_rate(self: &Arc<Self>) -> Result<Ratio, ConnectionError> {
        let precision = self.config.minimum_exchange_rate_precision;
        let mut step = 0;
        for _ in 0..self.config.exchange_rate_attempts {
            let (amount, capped) = {
                let state = self.lock();
                let maximum = state.congestion.test_maximum_packet_amount();
                (PROBE_AMOUNTS[step].min(maximum), PROBE_AMOUNTS[step] > maximum)
            };
            if amount == 0 {
                return Err(ConnectionError::MaxPacketAmountZero);
            }
            let sequence = self.lock().take_sequence()?;
            let packet = Packet::new(sequence, PacketType::Prepare, 0, Vec::new());

            let (reject, reply) = match self.send_packet(&packet, amount, false).await? {
                Response::Rejected { reject, response } => (reject, response),
                Response::Fulfilled { .. } => {
                    return Err(ConnectionError::ExchangeRateUnavailable(
                        "probe was fulfilled".to_string(),
                    ));
                }
            };

            if let Some(reply) = reply {
                let received = reply.prepare_amount;
                if count_digits(received) >= precision {
                    let rate = Ratio::new(received, amount).map_err(|err| {
                        ConnectionError::ExchangeRateUnavailable(err.to_string())
                    })?;
                    info!(connection = %self.id, sent = amount, received, %rate, "probed exchange rate");
                    self.lock().exchange_rate = Some(rate);
                    return Ok(rate);
                }
                if capped || step + 1 == PROBE_AMOUNTS.len() {
                    return Err(ConnectionError::ExchangeRateUnavailable(format!(
                        "received {received} for {amount}, below {precision} digits of precision"
                    )));
                }
                debug!(connection = %self.id, sent = amount, received, "probe not precise enough");
                step += 1;
                continue;
            }

            if reject.code == RejectCode::F08_AMOUNT_TOO_LARGE {
                self.lock().congestion.on_reject(amount, &reject);
            } else if reject.code.is_temporary() || reject.code.is_relative() {
                if reject.code == RejectCode::T04_INSUFFICIENT_LIQUIDITY {
                    self.lock().congestion.on_reject(amount, &reject);
                }
                self.back_off().await;
            } else {
                return Err(ConnectionError::ExchangeRateUnavailable(format!(
                    "probe rejected with {}: {}",
                    reject.code, reject.message
                )));
            }
        }
        Err(ConnectionError::ExchangeRateUnavailable(
            "out of probe attempts".to_string(),
        ))
    }
}
