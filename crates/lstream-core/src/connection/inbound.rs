//! Incoming Prepares.
//!
//! Every Prepare is answered with a Fulfill or a Reject carrying an
//! encrypted reply: the stream limits the sender needs, and for rejected
//! money the amount that actually arrived.

use super::ConnectionInner;
use crate::packet::{ErrorCode, Frame, Packet};
use async_trait::async_trait;
use lstream_crypto::sha256;
use lstream_transport::ledger::PacketType;
use lstream_transport::{DataHandler, ErrorCode as RejectCode, Fulfill, LedgerPacket, Prepare, Reject};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tracing::{debug, trace, warn};

impl ConnectionInner {
    /// Answer one Prepare addressed to this connection.
    pub(crate) fn handle_prepare(self: &Arc<Self>, prepare: Prepare) -> LedgerPacket {
        let packet = match Packet::decrypt(&self.keys, &prepare.data) {
            Ok(packet) if packet.packet_type == PacketType::Prepare => packet,
            Ok(packet) => {
                debug!(connection = %self.id, packet_type = ?packet.packet_type, "prepare carries a response packet");
                return self.plain_reject(RejectCode::F06_UNEXPECTED_PAYMENT).into();
            }
            Err(err) => {
                debug!(connection = %self.id, %err, "cannot decrypt prepare");
                return self.plain_reject(RejectCode::F06_UNEXPECTED_PAYMENT).into();
            }
        };
        let sequence = packet.sequence;
        let fulfillment = self.keys.fulfillment(&prepare.data);
        let fulfillable = sha256(&fulfillment) == prepare.execution_condition;
        trace!(
            connection = %self.id,
            sequence,
            amount = prepare.amount,
            fulfillable,
            frames = packet.frames.len(),
            "received prepare"
        );

        let mut state = self.lock();
        state.stats.packets_received += 1;
        state.last_activity = Instant::now();

        if state.closed {
            let frame = match &state.error {
                Some(err) => Frame::ConnectionClose {
                    code: err.error_code(),
                    message: err.to_string(),
                },
                None => Frame::ConnectionClose {
                    code: ErrorCode::NoError,
                    message: String::new(),
                },
            };
            drop(state);
            return self.reply_reject(sequence, prepare.amount, vec![frame]);
        }

        let outcome = match state.handle_frames(packet.frames, &self.config, true) {
            Ok(outcome) => outcome,
            Err(err) => {
                drop(state);
                warn!(connection = %self.id, %err, "peer violated the protocol");
                let frame = Frame::ConnectionClose {
                    code: err.error_code(),
                    message: err.to_string(),
                };
                let reply = self.reply_reject(sequence, prepare.amount, vec![frame]);
                self.shutdown(Some(err), false);
                return reply;
            }
        };

        let mut receipts = Vec::new();
        let accepted = if !fulfillable {
            false
        } else if prepare.amount < packet.prepare_amount {
            debug!(
                connection = %self.id,
                received = prepare.amount,
                minimum = packet.prepare_amount,
                "received less than the sender's minimum"
            );
            false
        } else {
            match state.credit_money(prepare.amount, &outcome.money, &self.config) {
                Some(frames) => {
                    receipts = frames;
                    true
                }
                None => false,
            }
        };
        let mut frames = state.response_frames(&outcome, &self.config);
        frames.extend(receipts);
        drop(state);

        let response_type = if accepted {
            PacketType::Fulfill
        } else {
            PacketType::Reject
        };
        let data = self.encrypt_reply(Packet::new(sequence, response_type, prepare.amount, frames));
        self.apply_outcome(outcome);

        if accepted {
            trace!(connection = %self.id, sequence, amount = prepare.amount, "fulfilling prepare");
            LedgerPacket::Fulfill(Fulfill { fulfillment, data })
        } else {
            Reject::new(RejectCode::F99_APPLICATION_ERROR, &self.config.source_account, "")
                .with_data(data)
                .into()
        }
    }

    fn plain_reject(&self, code: RejectCode) -> Reject {
        Reject::new(code, &self.config.source_account, "")
    }

    fn reply_reject(&self, sequence: u64, amount: u64, frames: Vec<Frame>) -> LedgerPacket {
        let data = self.encrypt_reply(Packet::new(sequence, PacketType::Reject, amount, frames));
        Reject::new(RejectCode::F99_APPLICATION_ERROR, &self.config.source_account, "")
            .with_data(data)
            .into()
    }

    fn encrypt_reply(&self, packet: Packet) -> Vec<u8> {
        match packet.encrypt(&self.keys, self.config.pad_packets_to) {
            Ok(data) => data,
            Err(err) => {
                warn!(connection = %self.id, %err, "cannot encrypt reply");
                Vec::new()
            }
        }
    }
}

/// Routes a client transport's incoming packets to its connection
pub(crate) struct ClientDataHandler {
    connection: Weak<ConnectionInner>,
}

impl ClientDataHandler {
    pub(crate) fn new(connection: &Arc<ConnectionInner>) -> Self {
        Self {
            connection: Arc::downgrade(connection),
        }
    }
}

#[async_trait]
impl DataHandler for ClientDataHandler {
    async fn handle_data(&self, data: Vec<u8>) -> Vec<u8> {
        let Some(connection) = self.connection.upgrade() else {
            return LedgerPacket::from(Reject::new(RejectCode::F02_UNREACHABLE, "", "connection closed"))
                .to_bytes();
        };
        let response = match LedgerPacket::from_bytes(&data) {
            Ok(LedgerPacket::Prepare(prepare)) => connection.handle_prepare(prepare),
            Ok(_) | Err(_) => Reject::new(
                RejectCode::F00_BAD_REQUEST,
                &connection.config.source_account,
                "expected a prepare",
            )
            .into(),
        };
        response.to_bytes()
    }
}
