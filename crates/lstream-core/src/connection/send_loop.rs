//! Outgoing packets: the send loop and the round trip underneath it.

use super::ConnectionInner;
use super::state::OutgoingPacket;
use crate::error::ConnectionError;
use crate::packet::{Frame, Packet};
use lstream_crypto::random::random_condition;
use lstream_transport::ledger::PacketType;
use lstream_transport::{ErrorCode as RejectCode, LedgerPacket, Prepare, Reject, TransportError};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, trace, warn};

/// Result of one Prepare round trip
#[derive(Debug)]
pub(crate) enum Response {
    /// The Prepare was fulfilled
    Fulfilled {
        /// Peer's decrypted reply, if it sent one
        response: Option<Packet>,
    },
    /// The Prepare was rejected by the path or the peer
    Rejected {
        /// The reject
        reject: Reject,
        /// Peer's decrypted reply, present only if the peer saw the packet
        response: Option<Packet>,
    },
}

impl ConnectionInner {
    /// Make sure a send loop will look at the current state.
    ///
    /// At most one loop runs per connection. A running loop picks up the
    /// request before it stops.
    pub(crate) fn start_send_loop(self: &Arc<Self>) {
        let runtime = self.runtime();
        {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            state.send_again = true;
            if state.send_loop_running || runtime.is_none() {
                return;
            }
            state.send_loop_running = true;
        }
        if let Some(runtime) = runtime {
            let inner = Arc::clone(self);
            runtime.spawn(async move { inner.run_send_loop().await });
        }
    }

    async fn run_send_loop(self: Arc<Self>) {
        trace!(connection = %self.id, "send loop started");
        if let Err(err) = self.send_loop().await {
            // error exits leave the running flag to us
            if err.is_fatal() {
                warn!(connection = %self.id, %err, "send loop failed");
                self.shutdown(Some(err), true);
            } else {
                debug!(connection = %self.id, %err, "send loop stopped");
            }
            self.lock().stop_send_loop();
        }
        self.emit(super::ConnectionEvent::SendLoopFinished);
        self.progress.notify_waiters();
    }

    /// Build and send packets until there is nothing left.
    ///
    /// Every `Ok` exit clears the running flag under the lock that decided
    /// to stop.
    async fn send_loop(self: &Arc<Self>) -> Result<(), ConnectionError> {
        loop {
            tokio::task::yield_now().await;

            let needs_rate = {
                let mut state = self.lock();
                if state.closed || state.destination_account.is_none() {
                    // server side: nothing can be sent until the peer announces itself
                    state.stop_send_loop();
                    return Ok(());
                }
                state.send_again = false;
                state.exchange_rate.is_none() && state.has_money_to_send()
            };
            if needs_rate {
                self.discover_exchange_rate().await?;
            }

            let out = {
                let mut state = self.lock();
                if state.closed {
                    state.stop_send_loop();
                    return Ok(());
                }
                match state.build_packet(&self.config)? {
                    Some(out) => out,
                    None => {
                        if state.finish_send_pass() {
                            return Ok(());
                        }
                        continue;
                    }
                }
            };
            self.send_and_settle(out).await?;
        }
    }

    async fn send_and_settle(self: &Arc<Self>, out: OutgoingPacket) -> Result<(), ConnectionError> {
        trace!(
            connection = %self.id,
            sequence = out.packet.sequence,
            amount = out.amount,
            "sending packet"
        );
        let response = match self.send_packet(&out.packet, out.amount, true).await {
            Ok(response) => response,
            Err(err) => {
                self.lock().on_reject(&out, false);
                return Err(err);
            }
        };

        match response {
            Response::Fulfilled { response } => {
                self.lock().on_fulfill(&out, response.as_ref(), &self.config);
                if let Some(packet) = response {
                    self.apply_response_frames(packet.frames)?;
                } else {
                    // frames queued here go out on the next iteration
                    self.lock().prune_streams();
                    self.progress.notify_waiters();
                }
                Ok(())
            }
            Response::Rejected { reject, response } => {
                self.lock().on_reject(&out, response.is_some());
                let reply_amount = response.as_ref().map(|packet| packet.prepare_amount);
                if let Some(packet) = response {
                    self.apply_response_frames(packet.frames)?;
                }
                self.progress.notify_waiters();
                self.handle_reject(&out, &reject, reply_amount).await
            }
        }
    }

    /// Decide whether a rejected packet is worth retrying.
    async fn handle_reject(
        &self,
        out: &OutgoingPacket,
        reject: &Reject,
        reply_amount: Option<u64>,
    ) -> Result<(), ConnectionError> {
        let code = reject.code;
        debug!(
            connection = %self.id,
            sequence = out.packet.sequence,
            %code,
            message = %reject.message,
            "packet rejected"
        );

        if code == RejectCode::F99_APPLICATION_ERROR {
            let Some(received) = reply_amount else {
                return Err(unexpected(reject));
            };
            if out.amount > 0 && received < out.packet.prepare_amount {
                return Err(ConnectionError::ExchangeRateTooLow {
                    received,
                    minimum: out.packet.prepare_amount,
                });
            }
            if self.lock().note_app_reject() > 1 {
                self.back_off().await;
            }
            return Ok(());
        }

        if code == RejectCode::F08_AMOUNT_TOO_LARGE {
            let mut state = self.lock();
            state.congestion.on_reject(out.amount, reject);
            if state.congestion.maximum_packet_amount() == 0 {
                return Err(ConnectionError::MaxPacketAmountZero);
            }
            return Ok(());
        }

        if code == RejectCode::T04_INSUFFICIENT_LIQUIDITY {
            self.lock().congestion.on_reject(out.amount, reject);
            self.back_off().await;
            return Ok(());
        }

        if code.is_temporary() || code.is_relative() {
            self.back_off().await;
            return Ok(());
        }

        Err(unexpected(reject))
    }

    pub(crate) async fn back_off(&self) {
        let delay = self.lock().next_retry_delay(&self.config);
        trace!(connection = %self.id, ?delay, "backing off");
        tokio::time::sleep(delay).await;
    }

    /// Apply frames the peer put in a Fulfill or Reject.
    pub(crate) fn apply_response_frames(self: &Arc<Self>, frames: Vec<Frame>) -> Result<(), ConnectionError> {
        let outcome = self.lock().handle_frames(frames, &self.config, false)?;
        self.apply_outcome(outcome);
        Ok(())
    }

    /// Send one packet and read the reply.
    ///
    /// Unfulfillable packets carry a random condition, so the peer can only
    /// reject them; they are used for probes and control messages.
    pub(crate) async fn send_packet(
        &self,
        packet: &Packet,
        amount: u64,
        fulfillable: bool,
    ) -> Result<Response, ConnectionError> {
        let data = packet.encrypt(&self.keys, self.config.pad_packets_to)?;
        let execution_condition = if fulfillable {
            self.keys.condition(&data)
        } else {
            random_condition()?
        };
        let destination = self
            .lock()
            .destination_account
            .clone()
            .ok_or_else(|| ConnectionError::ConnectFailed("peer address unknown".to_string()))?;

        let prepare = LedgerPacket::Prepare(Prepare {
            amount,
            expires_at: SystemTime::now() + self.config.packet_timeout,
            execution_condition,
            destination,
            data,
        });
        let reply = match tokio::time::timeout(
            self.config.packet_timeout,
            self.transport.send_data(prepare.to_bytes()),
        )
        .await
        {
            Ok(Ok(reply)) => reply,
            Ok(Err(TransportError::Other(message))) => {
                return Ok(Response::Rejected {
                    reject: Reject::new(RejectCode::T00_INTERNAL_ERROR, "", &message),
                    response: None,
                });
            }
            Ok(Err(err)) => return Err(err.into()),
            Err(_) => {
                return Ok(Response::Rejected {
                    reject: Reject::new(RejectCode::R00_TRANSFER_TIMED_OUT, "", "no response before timeout"),
                    response: None,
                });
            }
        };

        self.lock().last_activity = std::time::Instant::now();
        match LedgerPacket::from_bytes(&reply) {
            Ok(LedgerPacket::Fulfill(fulfill)) => Ok(Response::Fulfilled {
                response: self.read_reply(packet, PacketType::Fulfill, &fulfill.data),
            }),
            Ok(LedgerPacket::Reject(reject)) => {
                let response = self.read_reply(packet, PacketType::Reject, &reject.data);
                Ok(Response::Rejected { reject, response })
            }
            Ok(LedgerPacket::Prepare(_)) | Err(_) => Ok(Response::Rejected {
                reject: Reject::new(RejectCode::T00_INTERNAL_ERROR, "", "unreadable response"),
                response: None,
            }),
        }
    }

    fn read_reply(&self, request: &Packet, expected: PacketType, data: &[u8]) -> Option<Packet> {
        if data.is_empty() {
            return None;
        }
        match Packet::decrypt(&self.keys, data) {
            Ok(reply) if reply.sequence == request.sequence && reply.packet_type == expected => Some(reply),
            Ok(reply) => {
                debug!(
                    connection = %self.id,
                    sequence = reply.sequence,
                    expected = request.sequence,
                    "ignoring reply for another packet"
                );
                None
            }
            Err(err) => {
                trace!(connection = %self.id, %err, "reply data is not from the peer");
                None
            }
        }
    }

    /// Best-effort `ConnectionClose` to the peer.
    pub(crate) async fn send_close(&self, frame: Frame) {
        let sequence = match self.lock().take_sequence() {
            Ok(sequence) => sequence,
            Err(err) => {
                debug!(connection = %self.id, %err, "cannot send close");
                return;
            }
        };
        let packet = Packet::new(sequence, PacketType::Prepare, 0, vec![frame]);
        if let Err(err) = self.send_packet(&packet, 0, false).await {
            debug!(connection = %self.id, %err, "close not delivered");
        }
    }
}

fn unexpected(reject: &Reject) -> ConnectionError {
    ConnectionError::UnexpectedReject {
        code: reject.code.to_string(),
        message: reject.message.clone(),
    }
}
