//! Connection state shared by the send loop and the inbound handler.
//!
//! Everything here is synchronous and runs under the connection's lock:
//! stream id allocation and validation, packet assembly, frame dispatch and
//! money crediting. The async layers only move packets in and out.

use super::config::ConnectionConfig;
use super::events::{ConnectionEvent, EVENT_CHANNEL_CAPACITY, StreamEvent};
use crate::congestion::CongestionController;
use crate::error::{ConnectionError, StreamError};
use crate::packet::{ErrorCode, Frame, Packet};
use crate::stream::StreamState;
use crate::util::{Ratio, multiply_divide_floor};
use lstream_crypto::aead::ENCRYPTION_OVERHEAD;
use lstream_crypto::create_receipt;
use lstream_transport::ledger::PacketType;
use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, trace};

/// Highest sequence number a connection may use
pub const MAX_SEQUENCE: u64 = 1 << 31;

/// Worst-case size of a `StreamData` frame without its payload
const STREAM_DATA_OVERHEAD: usize = 1 + 5 + 9 + 9 + 5;

/// Worst-case size of the packet header
const MAX_HEADER_SIZE: usize = 2 + 9 + 9 + 9;

/// Which side of the connection we are
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Opened the connection; uses odd stream ids
    Client,
    /// Accepted the connection; uses even stream ids
    Server,
}

impl Role {
    fn first_stream_id(self) -> u64 {
        match self {
            Self::Client => 1,
            Self::Server => 2,
        }
    }

    /// Whether streams with `id` are opened by this side.
    #[must_use]
    pub fn owns_stream(self, id: u64) -> bool {
        (id % 2 == 1) == (self == Self::Client)
    }
}

/// Asset announced by the peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetDetails {
    /// Asset code
    pub code: String,
    /// Decimal scale
    pub scale: u8,
}

/// Connection counters
#[derive(Debug, Clone, Default)]
pub struct ConnectionStats {
    /// Packets sent by the send loop
    pub packets_sent: u64,
    /// Of those, fulfilled
    pub packets_fulfilled: u64,
    /// Of those, rejected
    pub packets_rejected: u64,
    /// Packets received from the peer
    pub packets_received: u64,
    /// Value sent, in our units
    pub total_sent: u64,
    /// Value the peer reported receiving, in its units
    pub total_delivered: u64,
    /// Value received, in our units
    pub total_received: u64,
    /// Current path ceiling
    pub maximum_packet_amount: u64,
    /// Current probe
    pub test_maximum_packet_amount: u64,
    /// Probed exchange rate
    pub exchange_rate: Option<Ratio>,
}

/// What remains of a stream after it is removed
#[derive(Debug, Clone)]
pub(crate) struct StreamSummary {
    pub(crate) total_sent: u64,
    pub(crate) total_received: u64,
    pub(crate) send_max: u64,
    pub(crate) receive_max: u64,
    pub(crate) receipt: Option<Vec<u8>>,
    pub(crate) error: Option<StreamError>,
}

impl From<&StreamState> for StreamSummary {
    fn from(state: &StreamState) -> Self {
        Self {
            total_sent: state.total_sent(),
            total_received: state.total_received(),
            send_max: state.send_max(),
            receive_max: state.receive_max(),
            receipt: state.receipt().map(<[u8]>::to_vec),
            error: state.error().cloned(),
        }
    }
}

/// A live stream and its event channel
pub(crate) struct StreamEntry {
    pub(crate) state: StreamState,
    pub(crate) events: broadcast::Sender<StreamEvent>,
}

impl StreamEntry {
    fn new(id: u64, buffer_size: u64) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            state: StreamState::new(id, buffer_size),
            events,
        }
    }

    pub(crate) fn emit(&self, event: StreamEvent) {
        let _ = self.events.send(event);
    }
}

/// A packet assembled by the send loop
#[derive(Debug)]
pub(crate) struct OutgoingPacket {
    pub(crate) packet: Packet,
    /// Source amount
    pub(crate) amount: u64,
    /// Queued connection frames, restored if the peer never sees them
    pub(crate) control_frames: Vec<Frame>,
}

/// Side effects of handling a frame list
#[derive(Debug, Default)]
pub(crate) struct FrameOutcome {
    pub(crate) new_streams: Vec<u64>,
    pub(crate) money: Vec<(u64, u64)>,
    pub(crate) touched: BTreeSet<u64>,
    pub(crate) connected: bool,
    pub(crate) wake: bool,
    /// Peer closed the connection, with an error unless graceful
    pub(crate) peer_closed: Option<Option<ConnectionError>>,
}

/// Mutable connection state
pub(crate) struct ConnectionState {
    pub(crate) role: Role,
    pub(crate) next_sequence: u64,
    next_stream_id: u64,
    pub(crate) max_stream_id: u64,
    pub(crate) remote_max_stream_id: u64,
    stream_id_blocked_sent_at: Option<u64>,
    pub(crate) streams: BTreeMap<u64, StreamEntry>,
    finished_streams: BTreeMap<u64, StreamSummary>,
    pub(crate) queued_frames: Vec<Frame>,
    pub(crate) exchange_rate: Option<Ratio>,
    pub(crate) congestion: CongestionController,
    pub(crate) destination_account: Option<String>,
    pub(crate) remote_asset: Option<AssetDetails>,
    pub(crate) connected: bool,
    pub(crate) announced: bool,
    pub(crate) closing: bool,
    pub(crate) closed: bool,
    finalized: bool,
    pub(crate) error: Option<ConnectionError>,
    pub(crate) send_loop_running: bool,
    pub(crate) send_again: bool,
    retry_delay: Duration,
    consecutive_app_rejects: u32,
    pub(crate) remote_max_data: u64,
    data_sent_total: u64,
    data_blocked_sent_at: Option<u64>,
    data_consumed: u64,
    advertised_max_data: u64,
    pub(crate) stats: ConnectionStats,
    pub(crate) last_activity: Instant,
    pub(crate) events: broadcast::Sender<ConnectionEvent>,
}

impl ConnectionState {
    pub(crate) fn new(
        role: Role,
        config: &ConnectionConfig,
        destination_account: Option<String>,
        events: broadcast::Sender<ConnectionEvent>,
    ) -> Self {
        let default_max_stream_id = super::config::DEFAULT_MAX_REMOTE_STREAMS * 2;
        Self {
            role,
            next_sequence: 1,
            next_stream_id: role.first_stream_id(),
            max_stream_id: config.max_stream_id(),
            remote_max_stream_id: default_max_stream_id,
            stream_id_blocked_sent_at: None,
            streams: BTreeMap::new(),
            finished_streams: BTreeMap::new(),
            queued_frames: Vec::new(),
            exchange_rate: None,
            congestion: CongestionController::new(config.maximum_packet_amount),
            destination_account,
            remote_asset: None,
            connected: false,
            announced: false,
            closing: false,
            closed: false,
            finalized: false,
            error: None,
            send_loop_running: false,
            send_again: false,
            retry_delay: config.min_retry_delay,
            consecutive_app_rejects: 0,
            remote_max_data: super::config::DEFAULT_CONNECTION_BUFFER_SIZE,
            data_sent_total: 0,
            data_blocked_sent_at: None,
            data_consumed: 0,
            advertised_max_data: config.connection_buffer_size,
            stats: ConnectionStats::default(),
            last_activity: Instant::now(),
            events,
        }
    }

    pub(crate) fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }

    /// Allocate a sequence number outside the send loop.
    pub(crate) fn take_sequence(&mut self) -> Result<u64, ConnectionError> {
        if self.next_sequence > MAX_SEQUENCE {
            return Err(ConnectionError::SequenceExhausted);
        }
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        Ok(sequence)
    }

    // ------------------------------------------------------------------
    // Streams
    // ------------------------------------------------------------------

    /// Open a local stream.
    ///
    /// Past the peer's limit, queues `ConnectionStreamIdBlocked` instead.
    pub(crate) fn create_stream(
        &mut self,
        config: &ConnectionConfig,
    ) -> Result<(u64, broadcast::Sender<StreamEvent>), ConnectionError> {
        if self.closed || self.closing {
            return Err(ConnectionError::Closed);
        }
        let id = self.next_stream_id;
        if id > self.remote_max_stream_id {
            if self.stream_id_blocked_sent_at != Some(self.remote_max_stream_id) {
                self.stream_id_blocked_sent_at = Some(self.remote_max_stream_id);
                self.queued_frames.push(Frame::ConnectionStreamIdBlocked {
                    max_stream_id: self.remote_max_stream_id,
                });
            }
            debug!(
                next_stream_id = id,
                remote_max_stream_id = self.remote_max_stream_id,
                "stream ids exhausted"
            );
            return Err(ConnectionError::StreamIdsExhausted {
                remote_max: self.remote_max_stream_id,
            });
        }
        self.next_stream_id += 2;
        let entry = StreamEntry::new(id, config.stream_buffer_size);
        let events = entry.events.clone();
        self.streams.insert(id, entry);
        debug!(stream_id = id, "opened stream");
        Ok((id, events))
    }

    /// Look up a live stream or the summary of a removed one.
    pub(crate) fn stream_summary(&self, id: u64) -> Option<StreamSummary> {
        match self.streams.get(&id) {
            Some(entry) => Some(StreamSummary::from(&entry.state)),
            None => self.finished_streams.get(&id).cloned(),
        }
    }

    /// Make sure the stream a frame refers to exists, opening it if the peer
    /// may open it. `Ok(false)` means the frame is for a closed stream.
    fn ensure_stream(
        &mut self,
        id: u64,
        config: &ConnectionConfig,
        outcome: &mut FrameOutcome,
    ) -> Result<bool, ConnectionError> {
        if self.streams.contains_key(&id) {
            return Ok(true);
        }
        let invalid = ConnectionError::InvalidStreamId {
            stream_id: id,
            max_stream_id: self.max_stream_id,
        };
        if id == 0 {
            return Err(invalid);
        }
        if self.role.owns_stream(id) {
            // one of ours that has already been removed
            return if id < self.next_stream_id { Ok(false) } else { Err(invalid) };
        }
        if self.finished_streams.contains_key(&id) || self.closing || self.closed {
            return Ok(false);
        }
        if id > self.max_stream_id {
            return Err(invalid);
        }
        self.streams
            .insert(id, StreamEntry::new(id, config.stream_buffer_size));
        outcome.new_streams.push(id);
        debug!(stream_id = id, "peer opened stream");
        Ok(true)
    }

    /// Remove streams both sides have closed.
    ///
    /// Returns true if frames were queued for the peer.
    pub(crate) fn prune_streams(&mut self) -> bool {
        let finished: Vec<u64> = self
            .streams
            .iter()
            .filter(|(_, entry)| entry.state.is_finished())
            .map(|(id, _)| *id)
            .collect();
        let mut queued = false;
        for id in finished {
            let Some(entry) = self.streams.remove(&id) else {
                continue;
            };
            debug!(stream_id = id, "removed closed stream");
            self.finished_streams.insert(id, StreamSummary::from(&entry.state));
            entry.emit(StreamEvent::Close);
            if !self.role.owns_stream(id) {
                self.max_stream_id += 2;
                self.queued_frames.push(Frame::ConnectionMaxStreamId {
                    max_stream_id: self.max_stream_id,
                });
                queued = true;
            }
        }
        queued
    }

    /// Whether any stream has value waiting.
    pub(crate) fn has_money_to_send(&self) -> bool {
        self.streams
            .values()
            .any(|entry| entry.state.amount_available_to_send() > 0)
    }

    /// Whether every stream has had its close acknowledged.
    pub(crate) fn all_streams_closed(&self) -> bool {
        self.streams.values().all(|entry| entry.state.is_local_closed())
    }

    // ------------------------------------------------------------------
    // Flow control
    // ------------------------------------------------------------------

    fn local_max_data(&self, config: &ConnectionConfig) -> u64 {
        self.data_consumed.saturating_add(config.connection_buffer_size)
    }

    /// Account for bytes the application read.
    ///
    /// Returns true if a new `ConnectionMaxData` was queued.
    pub(crate) fn on_data_consumed(&mut self, bytes: u64, config: &ConnectionConfig) -> bool {
        self.data_consumed = self.data_consumed.saturating_add(bytes);
        let max = self.local_max_data(config);
        if max >= self.advertised_max_data.saturating_add(config.connection_buffer_size / 2) {
            self.advertised_max_data = max;
            self.queued_frames.push(Frame::ConnectionMaxData { max_offset: max });
            return true;
        }
        false
    }

    /// Frames announcing our address, asset and limits.
    pub(crate) fn announce_frames(&self, config: &ConnectionConfig, include_address: bool) -> Vec<Frame> {
        let mut frames = Vec::with_capacity(4);
        if include_address {
            frames.push(Frame::ConnectionNewAddress {
                source_account: config.source_account.clone(),
            });
        }
        frames.push(Frame::ConnectionAssetDetails {
            source_asset_code: config.asset_code.clone(),
            source_asset_scale: config.asset_scale,
        });
        frames.push(Frame::ConnectionMaxStreamId {
            max_stream_id: self.max_stream_id,
        });
        frames.push(Frame::ConnectionMaxData {
            max_offset: self.advertised_max_data,
        });
        frames
    }

    // ------------------------------------------------------------------
    // Outgoing packets
    // ------------------------------------------------------------------

    /// Assemble the next packet, or `None` if there is nothing to send.
    pub(crate) fn build_packet(
        &mut self,
        config: &ConnectionConfig,
    ) -> Result<Option<OutgoingPacket>, ConnectionError> {
        if self.next_sequence > MAX_SEQUENCE {
            return Err(ConnectionError::SequenceExhausted);
        }
        let sequence = self.next_sequence;
        let mut frames = std::mem::take(&mut self.queued_frames);
        let control_frames = frames.clone();
        let mut amount = 0u64;

        if let Some(rate) = self.exchange_rate {
            let mut budget = self.congestion.test_maximum_packet_amount();
            for entry in self.streams.values_mut() {
                let stream = &mut entry.state;
                if stream.amount_available_to_send() == 0 {
                    continue;
                }
                let room = rate.divide_floor(stream.remote_receive_headroom());
                if room == 0 {
                    frames.extend(stream.take_money_blocked_frame());
                    continue;
                }
                let held = stream.hold_outgoing(sequence, budget.min(room));
                if held > 0 {
                    frames.push(Frame::StreamMoney {
                        stream_id: stream.id(),
                        shares: held,
                    });
                    budget -= held;
                    amount += held;
                }
            }
        }

        for entry in self.streams.values_mut() {
            frames.extend(entry.state.take_max_money_frame(sequence));
            frames.extend(entry.state.take_max_data_frame());
            frames.extend(entry.state.take_close_frame(sequence));
        }

        let max_plaintext = config.max_packet_size.saturating_sub(ENCRYPTION_OVERHEAD);
        let mut size = MAX_HEADER_SIZE + frames.iter().map(Frame::encoded_len).sum::<usize>();
        let mut connection_budget = self.remote_max_data.saturating_sub(self.data_sent_total);
        for entry in self.streams.values_mut() {
            if size + STREAM_DATA_OVERHEAD >= max_plaintext {
                break;
            }
            let stream = &mut entry.state;
            let before = stream.outgoing_offset();
            let max_bytes = max_plaintext - size - STREAM_DATA_OVERHEAD;
            if let Some((data, offset)) = stream.available_data_to_send(sequence, max_bytes, connection_budget) {
                let fresh = stream.outgoing_offset() - before;
                connection_budget -= fresh;
                self.data_sent_total += fresh;
                let frame = Frame::StreamData {
                    stream_id: stream.id(),
                    offset,
                    data,
                };
                size += frame.encoded_len();
                frames.push(frame);
            }
            if let Some(frame) = stream.take_data_blocked_frame() {
                size += frame.encoded_len();
                frames.push(frame);
            }
        }
        if connection_budget == 0
            && self.data_blocked_sent_at != Some(self.remote_max_data)
            && self.streams.values().any(|entry| entry.state.queued_bytes() > 0)
        {
            self.data_blocked_sent_at = Some(self.remote_max_data);
            frames.push(Frame::ConnectionDataBlocked {
                max_offset: self.remote_max_data,
            });
        }

        if frames.is_empty() {
            return Ok(None);
        }
        self.next_sequence += 1;
        let prepare_amount = match self.exchange_rate {
            Some(rate) if amount > 0 => rate.reduce_by(config.slippage).multiply_floor(amount),
            _ => 0,
        };
        self.stats.packets_sent += 1;
        trace!(sequence, amount, prepare_amount, frames = frames.len(), "built packet");
        Ok(Some(OutgoingPacket {
            packet: Packet::new(sequence, PacketType::Prepare, prepare_amount, frames),
            amount,
            control_frames,
        }))
    }

    /// Settle a fulfilled packet.
    pub(crate) fn on_fulfill(&mut self, out: &OutgoingPacket, response: Option<&Packet>, config: &ConnectionConfig) {
        let sequence = out.packet.sequence;
        let delivered = response.map_or(out.packet.prepare_amount, |packet| packet.prepare_amount);
        self.stats.packets_fulfilled += 1;
        self.stats.total_sent += out.amount;
        self.stats.total_delivered += delivered;
        for entry in self.streams.values_mut() {
            let committed = entry.state.packet_fulfilled(sequence);
            if committed > 0 {
                let share = multiply_divide_floor(delivered, committed, out.amount).unwrap_or(0);
                entry.state.add_remote_received(share);
                entry.emit(StreamEvent::OutgoingMoney(committed));
            }
        }
        self.congestion.on_fulfill(out.amount);
        self.retry_delay = config.min_retry_delay;
        self.consecutive_app_rejects = 0;
        self.last_activity = Instant::now();
    }

    /// Release everything a rejected packet carried.
    pub(crate) fn on_reject(&mut self, out: &OutgoingPacket, peer_saw_frames: bool) {
        let sequence = out.packet.sequence;
        self.stats.packets_rejected += 1;
        for entry in self.streams.values_mut() {
            entry.state.packet_rejected(sequence);
        }
        if !peer_saw_frames && !out.control_frames.is_empty() {
            let mut frames = out.control_frames.clone();
            frames.append(&mut self.queued_frames);
            self.queued_frames = frames;
        }
        self.last_activity = Instant::now();
    }

    /// Next backoff delay.
    pub(crate) fn next_retry_delay(&mut self, config: &ConnectionConfig) -> Duration {
        let delay = self.retry_delay;
        self.retry_delay = (delay * 2).min(config.max_retry_delay);
        delay
    }

    /// Count an application-level reject; returns how many came in a row.
    pub(crate) fn note_app_reject(&mut self) -> u32 {
        self.consecutive_app_rejects += 1;
        self.consecutive_app_rejects
    }

    // ------------------------------------------------------------------
    // Incoming frames
    // ------------------------------------------------------------------

    /// Apply frames from the peer. `in_request` is set for frames from an
    /// incoming Prepare, the only place `StreamMoney` counts.
    pub(crate) fn handle_frames(
        &mut self,
        frames: Vec<Frame>,
        config: &ConnectionConfig,
        in_request: bool,
    ) -> Result<FrameOutcome, ConnectionError> {
        let mut outcome = FrameOutcome::default();
        for frame in frames {
            trace!(frame_type = ?frame.frame_type(), "handling frame");
            match frame {
                Frame::ConnectionClose { code, message } => {
                    debug!(?code, %message, "peer closed connection");
                    outcome.peer_closed = Some(
                        (code != ErrorCode::NoError).then_some(ConnectionError::RemoteClosed { code, message }),
                    );
                }
                Frame::ConnectionNewAddress { source_account } => {
                    if self.destination_account.as_deref() != Some(source_account.as_str()) {
                        debug!(address = %source_account, "peer announced address");
                        self.destination_account = Some(source_account);
                        outcome.wake = true;
                    }
                    if !self.connected {
                        self.connected = true;
                        outcome.connected = true;
                    }
                }
                Frame::ConnectionAssetDetails {
                    source_asset_code,
                    source_asset_scale,
                } => {
                    self.remote_asset = Some(AssetDetails {
                        code: source_asset_code,
                        scale: source_asset_scale,
                    });
                }
                Frame::ConnectionMaxData { max_offset } => {
                    if max_offset > self.remote_max_data {
                        self.remote_max_data = max_offset;
                        outcome.wake = true;
                    }
                }
                Frame::ConnectionDataBlocked { max_offset } => {
                    debug!(max_offset, "peer is blocked on connection data limit");
                    self.queued_frames.push(Frame::ConnectionMaxData {
                        max_offset: self.advertised_max_data,
                    });
                    outcome.wake = true;
                }
                Frame::ConnectionMaxStreamId { max_stream_id } => {
                    if max_stream_id > self.remote_max_stream_id {
                        self.remote_max_stream_id = max_stream_id;
                        outcome.wake = true;
                    }
                }
                Frame::ConnectionStreamIdBlocked { max_stream_id } => {
                    debug!(max_stream_id, "peer is blocked on stream ids");
                }
                Frame::StreamClose {
                    stream_id,
                    code,
                    message,
                } => {
                    if !self.ensure_stream(stream_id, config, &mut outcome)? {
                        continue;
                    }
                    if let Some(entry) = self.streams.get_mut(&stream_id) {
                        if entry.state.is_remote_closed() {
                            continue;
                        }
                        debug!(stream_id, ?code, "peer closed stream");
                        if let Some(err) = entry.state.remote_close(code, message) {
                            entry.emit(StreamEvent::Error(err));
                        }
                        entry.emit(StreamEvent::End);
                        outcome.wake = true;
                    }
                }
                Frame::StreamMoney { stream_id, shares } => {
                    if in_request && self.ensure_stream(stream_id, config, &mut outcome)? {
                        outcome.money.push((stream_id, shares));
                        outcome.touched.insert(stream_id);
                    }
                }
                Frame::StreamMaxMoney {
                    stream_id,
                    receive_max,
                    total_received,
                } => {
                    if self.ensure_stream(stream_id, config, &mut outcome)? {
                        if let Some(entry) = self.streams.get_mut(&stream_id) {
                            entry.state.set_remote_receive_max(receive_max, total_received);
                        }
                        outcome.wake = true;
                    }
                }
                Frame::StreamMoneyBlocked {
                    stream_id,
                    send_max,
                    total_sent,
                } => {
                    if self.ensure_stream(stream_id, config, &mut outcome)? {
                        debug!(stream_id, send_max, total_sent, "peer is blocked on our receive max");
                        outcome.touched.insert(stream_id);
                    }
                }
                Frame::StreamData {
                    stream_id,
                    offset,
                    data,
                } => {
                    if !self.ensure_stream(stream_id, config, &mut outcome)? {
                        continue;
                    }
                    outcome.touched.insert(stream_id);
                    let Some(entry) = self.streams.get_mut(&stream_id) else {
                        continue;
                    };
                    match entry.state.push_incoming_data(offset, data) {
                        Ok(0) => {}
                        Ok(readable) => entry.emit(StreamEvent::Data(readable)),
                        Err(err) => {
                            return Err(ConnectionError::FlowControl(format!("stream {stream_id}: {err}")));
                        }
                    }
                }
                Frame::StreamMaxData {
                    stream_id,
                    max_offset,
                } => {
                    if self.ensure_stream(stream_id, config, &mut outcome)? {
                        if let Some(entry) = self.streams.get_mut(&stream_id) {
                            entry.state.set_remote_max_offset(max_offset);
                        }
                        outcome.wake = true;
                    }
                }
                Frame::StreamDataBlocked { stream_id, .. } => {
                    if let Some(entry) = self.streams.get_mut(&stream_id) {
                        entry.state.on_remote_data_blocked();
                        outcome.wake = true;
                    }
                }
                Frame::StreamReceipt { stream_id, receipt } => {
                    if let Some(entry) = self.streams.get_mut(&stream_id) {
                        entry.state.set_receipt(receipt);
                    }
                }
            }
        }
        Ok(outcome)
    }

    /// Credit `amount` across the streams in `money` by their shares.
    ///
    /// Credits nothing and returns `None` if any stream cannot take its
    /// portion. On success returns receipt frames, if receipts are configured.
    pub(crate) fn credit_money(
        &mut self,
        amount: u64,
        money: &[(u64, u64)],
        config: &ConnectionConfig,
    ) -> Option<Vec<Frame>> {
        let mut shares_by_stream: BTreeMap<u64, u128> = BTreeMap::new();
        for (id, shares) in money {
            *shares_by_stream.entry(*id).or_insert(0) += u128::from(*shares);
        }
        let total_shares: u128 = shares_by_stream.values().sum();
        if total_shares == 0 {
            return (amount == 0).then(Vec::new);
        }

        let mut portions = Vec::with_capacity(shares_by_stream.len());
        let mut remaining = amount;
        let last = shares_by_stream.len() - 1;
        for (i, (id, shares)) in shares_by_stream.iter().enumerate() {
            let portion = if i == last {
                remaining
            } else {
                // shares <= total, so the quotient fits
                (u128::from(amount) * shares / total_shares) as u64
            };
            remaining -= portion;
            portions.push((*id, portion));
        }

        for (id, portion) in &portions {
            let acceptable = self
                .streams
                .get(id)
                .is_some_and(|entry| !entry.state.is_remote_closed() && entry.state.receive_headroom() >= *portion);
            if !acceptable {
                debug!(stream_id = id, portion, "stream cannot accept money");
                return None;
            }
        }

        let mut receipts = Vec::new();
        for (id, portion) in portions {
            let Some(entry) = self.streams.get_mut(&id) else {
                continue;
            };
            if entry.state.add_to_incoming(portion).is_err() || portion == 0 {
                continue;
            }
            entry.emit(StreamEvent::Money(portion));
            if let Some(receipt_config) = &config.receipts {
                match create_receipt(
                    &receipt_config.nonce,
                    id,
                    entry.state.total_received(),
                    &receipt_config.secret,
                ) {
                    Ok(receipt) => receipts.push(Frame::StreamReceipt {
                        stream_id: id,
                        receipt: receipt.to_vec(),
                    }),
                    Err(err) => debug!(stream_id = id, %err, "no receipt for stream"),
                }
            }
        }
        self.stats.total_received += amount;
        Some(receipts)
    }

    /// Frames describing the streams a request touched, for its response.
    pub(crate) fn response_frames(&mut self, outcome: &FrameOutcome, config: &ConnectionConfig) -> Vec<Frame> {
        let mut frames = Vec::new();
        if !self.announced {
            self.announced = true;
            frames.extend(self.announce_frames(config, false));
        }
        for id in &outcome.touched {
            if let Some(entry) = self.streams.get_mut(id) {
                frames.push(entry.state.max_money_frame());
                frames.push(entry.state.max_data_frame());
            }
        }
        frames
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Close everything and notify subscribers, once.
    ///
    /// Returns false if the connection was already finalized.
    pub(crate) fn finalize(&mut self, error: Option<ConnectionError>) -> bool {
        if self.finalized {
            return false;
        }
        self.finalized = true;
        self.closed = true;
        for (id, mut entry) in std::mem::take(&mut self.streams) {
            entry.state.force_close();
            if error.is_some() {
                entry.emit(StreamEvent::Error(StreamError::ConnectionClosed));
            }
            entry.emit(StreamEvent::Close);
            self.finished_streams.insert(id, StreamSummary::from(&entry.state));
        }
        if let Some(err) = error {
            self.error = Some(err.clone());
            self.emit(ConnectionEvent::Error(err));
        }
        self.emit(ConnectionEvent::Close);
        true
    }

    /// The send loop is exiting for good.
    pub(crate) fn stop_send_loop(&mut self) {
        self.send_loop_running = false;
        self.send_again = false;
    }

    /// The send loop found nothing to send.
    ///
    /// Returns true if it should stop. A wake that arrived during the pass
    /// keeps it running for one more.
    pub(crate) fn finish_send_pass(&mut self) -> bool {
        if std::mem::take(&mut self.send_again) {
            return false;
        }
        self.send_loop_running = false;
        true
    }

    /// Snapshot of the counters.
    pub(crate) fn stats(&self) -> ConnectionStats {
        let mut stats = self.stats.clone();
        stats.maximum_packet_amount = self.congestion.maximum_packet_amount();
        stats.test_maximum_packet_amount = self.congestion.test_maximum_packet_amount();
        stats.exchange_rate = self.exchange_rate;
        stats
    }
}
