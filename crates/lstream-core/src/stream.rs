//! Per-stream money and data accounting.
//!
//! A [`StreamState`] is plain synchronous state owned by its connection. It
//! tracks the stream's limits and totals, the value held against packets in
//! flight, outgoing bytes (new data plus a retry queue for bytes whose packet
//! was rejected), and the offset-ordered reassembly of incoming bytes. The
//! connection's send loop and inbound handler are its only callers.

use crate::error::StreamError;
use crate::packet::{ErrorCode, Frame};
use lstream_crypto::receipt::decode_receipt;
use std::collections::{BTreeMap, VecDeque};
use tracing::trace;

/// Default per-stream data window in bytes
pub const DEFAULT_STREAM_BUFFER_SIZE: u64 = 16_384;

/// One byte range riding an unacknowledged packet
#[derive(Debug, Clone)]
struct SentRange {
    offset: u64,
    data: Vec<u8>,
}

/// State of one logical stream
#[derive(Debug)]
pub struct StreamState {
    id: u64,

    send_max: u64,
    total_sent: u64,
    /// Value reserved per packet sequence
    holds: BTreeMap<u64, u64>,
    outgoing_held: u64,
    remote_receive_max: u64,
    remote_total_received: u64,
    money_blocked_sent: bool,

    receive_max: u64,
    total_received: u64,
    receive_max_dirty: bool,
    max_money_sent_in: Option<u64>,
    receipt: Option<Vec<u8>>,

    send_queue: VecDeque<u8>,
    outgoing_offset: u64,
    /// Rejected ranges keyed by offset, re-offered before new data
    retry_queue: BTreeMap<u64, Vec<u8>>,
    data_in_flight: BTreeMap<u64, Vec<SentRange>>,
    remote_max_offset: u64,
    data_blocked_sent_at: Option<u64>,

    /// Out-of-order ranges keyed by offset
    incoming: BTreeMap<u64, Vec<u8>>,
    read_offset: u64,
    readable: VecDeque<u8>,
    consumed_offset: u64,
    buffer_size: u64,
    advertised_max_offset: u64,
    max_data_dirty: bool,

    closing: bool,
    close_reason: (ErrorCode, String),
    destroyed: bool,
    close_sent_in: Option<u64>,
    local_closed: bool,
    remote_closed: bool,
    error: Option<StreamError>,
}

impl StreamState {
    /// Create a stream with the given receive window.
    #[must_use]
    pub fn new(id: u64, buffer_size: u64) -> Self {
        Self {
            id,
            send_max: 0,
            total_sent: 0,
            holds: BTreeMap::new(),
            outgoing_held: 0,
            remote_receive_max: u64::MAX,
            remote_total_received: 0,
            money_blocked_sent: false,
            receive_max: 0,
            total_received: 0,
            receive_max_dirty: true,
            max_money_sent_in: None,
            receipt: None,
            send_queue: VecDeque::new(),
            outgoing_offset: 0,
            retry_queue: BTreeMap::new(),
            data_in_flight: BTreeMap::new(),
            remote_max_offset: DEFAULT_STREAM_BUFFER_SIZE,
            data_blocked_sent_at: None,
            incoming: BTreeMap::new(),
            read_offset: 0,
            readable: VecDeque::new(),
            consumed_offset: 0,
            buffer_size,
            advertised_max_offset: DEFAULT_STREAM_BUFFER_SIZE,
            max_data_dirty: true,
            closing: false,
            close_reason: (ErrorCode::NoError, String::new()),
            destroyed: false,
            close_sent_in: None,
            local_closed: false,
            remote_closed: false,
            error: None,
        }
    }

    /// Stream id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Local send limit.
    #[must_use]
    pub fn send_max(&self) -> u64 {
        self.send_max
    }

    /// Local receive limit.
    #[must_use]
    pub fn receive_max(&self) -> u64 {
        self.receive_max
    }

    /// Total value committed as sent.
    #[must_use]
    pub fn total_sent(&self) -> u64 {
        self.total_sent
    }

    /// Total value received.
    #[must_use]
    pub fn total_received(&self) -> u64 {
        self.total_received
    }

    /// Value currently held against packets in flight.
    #[must_use]
    pub fn outgoing_held(&self) -> u64 {
        self.outgoing_held
    }

    /// Latest receipt from the peer.
    #[must_use]
    pub fn receipt(&self) -> Option<&[u8]> {
        self.receipt.as_deref()
    }

    /// Error that terminated the stream, if any.
    #[must_use]
    pub fn error(&self) -> Option<&StreamError> {
        self.error.as_ref()
    }

    /// Whether the application may still send on the stream.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.closing && !self.local_closed
    }

    /// Whether the peer closed its side.
    #[must_use]
    pub fn is_remote_closed(&self) -> bool {
        self.remote_closed
    }

    /// Whether our close frame was acknowledged.
    #[must_use]
    pub fn is_local_closed(&self) -> bool {
        self.local_closed
    }

    /// Both sides closed and nothing left for the application to read.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.local_closed && self.remote_closed && self.readable.is_empty()
    }

    // ------------------------------------------------------------------
    // Money
    // ------------------------------------------------------------------

    /// Raise or lower the send limit.
    ///
    /// # Errors
    /// Returns `StreamError::Closed` if the stream is closing, or
    /// `StreamError::SendMaxTooLow` if `limit` is below the value already
    /// sent or in flight.
    pub fn set_send_max(&mut self, limit: u64) -> Result<(), StreamError> {
        if !self.is_open() {
            return Err(StreamError::Closed);
        }
        let committed = self.total_sent.saturating_add(self.outgoing_held);
        if limit < committed {
            return Err(StreamError::SendMaxTooLow { limit, committed });
        }
        if limit != self.send_max {
            self.money_blocked_sent = false;
        }
        self.send_max = limit;
        Ok(())
    }

    /// Raise or lower the receive limit.
    ///
    /// # Errors
    /// Returns `StreamError::Closed` if the stream is closing, or
    /// `StreamError::ReceiveMaxTooLow` if `limit` is below the value already
    /// received.
    pub fn set_receive_max(&mut self, limit: u64) -> Result<(), StreamError> {
        if !self.is_open() {
            return Err(StreamError::Closed);
        }
        if limit < self.total_received {
            return Err(StreamError::ReceiveMaxTooLow {
                limit,
                received: self.total_received,
            });
        }
        if limit != self.receive_max {
            self.receive_max_dirty = true;
        }
        self.receive_max = limit;
        Ok(())
    }

    /// Value that may be put into new packets.
    #[must_use]
    pub fn amount_available_to_send(&self) -> u64 {
        self.send_max
            .saturating_sub(self.total_sent)
            .saturating_sub(self.outgoing_held)
    }

    /// Reserve up to `max_amount` for the packet with `sequence`.
    ///
    /// Returns the amount actually held.
    pub fn hold_outgoing(&mut self, sequence: u64, max_amount: u64) -> u64 {
        let amount = self.amount_available_to_send().min(max_amount);
        if amount == 0 {
            return 0;
        }
        *self.holds.entry(sequence).or_insert(0) += amount;
        self.outgoing_held += amount;
        trace!(stream_id = self.id, sequence, amount, "hold");
        amount
    }

    /// Commit the hold for `sequence`. Returns the amount committed.
    pub fn execute_hold(&mut self, sequence: u64) -> u64 {
        let Some(amount) = self.holds.remove(&sequence) else {
            return 0;
        };
        self.outgoing_held -= amount;
        self.total_sent += amount;
        trace!(stream_id = self.id, sequence, amount, total_sent = self.total_sent, "execute hold");
        amount
    }

    /// Release the hold for `sequence`. Returns the amount released.
    pub fn cancel_hold(&mut self, sequence: u64) -> u64 {
        let Some(amount) = self.holds.remove(&sequence) else {
            return 0;
        };
        self.outgoing_held -= amount;
        trace!(stream_id = self.id, sequence, amount, "cancel hold");
        amount
    }

    /// Room left under the receive limit.
    #[must_use]
    pub fn receive_headroom(&self) -> u64 {
        self.receive_max.saturating_sub(self.total_received)
    }

    /// Credit incoming value.
    ///
    /// # Errors
    /// Returns `StreamError::ExceedsReceiveMax` if `amount` does not fit under
    /// the receive limit; nothing is credited in that case.
    pub fn add_to_incoming(&mut self, amount: u64) -> Result<(), StreamError> {
        let headroom = self.receive_headroom();
        if amount > headroom {
            return Err(StreamError::ExceedsReceiveMax { amount, headroom });
        }
        self.total_received += amount;
        Ok(())
    }

    /// Record the peer's receive limit and total.
    pub fn set_remote_receive_max(&mut self, receive_max: u64, total_received: u64) {
        if receive_max != self.remote_receive_max {
            self.money_blocked_sent = false;
        }
        self.remote_receive_max = receive_max;
        self.remote_total_received = self.remote_total_received.max(total_received);
    }

    /// Account for value the peer received in a fulfilled packet.
    pub fn add_remote_received(&mut self, amount: u64) {
        self.remote_total_received = self.remote_total_received.saturating_add(amount);
    }

    /// Destination units the peer will still accept.
    #[must_use]
    pub fn remote_receive_headroom(&self) -> u64 {
        self.remote_receive_max.saturating_sub(self.remote_total_received)
    }

    /// Keep `receipt` if it proves a higher total than the one held.
    pub fn set_receipt(&mut self, receipt: Vec<u8>) {
        let Ok(incoming) = decode_receipt(&receipt) else {
            trace!(stream_id = self.id, "ignoring malformed receipt");
            return;
        };
        let newer = match self.receipt.as_deref().map(decode_receipt) {
            Some(Ok(current)) => incoming.total_received >= current.total_received,
            _ => true,
        };
        if newer {
            self.receipt = Some(receipt);
        }
    }

    /// `StreamMaxMoney` announcing our limit for the packet with `sequence`,
    /// if it changed since last sent.
    pub fn take_max_money_frame(&mut self, sequence: u64) -> Option<Frame> {
        if !self.receive_max_dirty || self.remote_closed {
            return None;
        }
        self.receive_max_dirty = false;
        self.max_money_sent_in = Some(sequence);
        Some(self.max_money_frame())
    }

    /// `StreamMaxMoney` with the current limit and total.
    #[must_use]
    pub fn max_money_frame(&self) -> Frame {
        Frame::StreamMaxMoney {
            stream_id: self.id,
            receive_max: self.receive_max,
            total_received: self.total_received,
        }
    }

    /// `StreamMoneyBlocked`, once per change of either side's limit.
    pub fn take_money_blocked_frame(&mut self) -> Option<Frame> {
        if self.money_blocked_sent || self.amount_available_to_send() == 0 {
            return None;
        }
        self.money_blocked_sent = true;
        Some(Frame::StreamMoneyBlocked {
            stream_id: self.id,
            send_max: self.send_max,
            total_sent: self.total_sent,
        })
    }

    // ------------------------------------------------------------------
    // Outgoing data
    // ------------------------------------------------------------------

    /// Queue bytes to send.
    ///
    /// # Errors
    /// Returns `StreamError::Closed` if the stream is closing.
    pub fn write(&mut self, data: &[u8]) -> Result<(), StreamError> {
        if !self.is_open() {
            return Err(StreamError::Closed);
        }
        self.send_queue.extend(data);
        Ok(())
    }

    /// Bytes queued but never sent.
    #[must_use]
    pub fn queued_bytes(&self) -> usize {
        self.send_queue.len()
    }

    /// Offset of the next new byte.
    #[must_use]
    pub fn outgoing_offset(&self) -> u64 {
        self.outgoing_offset
    }

    /// Whether any bytes are queued, waiting for a retry, or in flight.
    #[must_use]
    pub fn has_pending_data(&self) -> bool {
        !self.send_queue.is_empty() || !self.retry_queue.is_empty() || !self.data_in_flight.is_empty()
    }

    /// Take the next range to send in the packet with `sequence`.
    ///
    /// Rejected ranges come first, in offset order. New bytes are limited by
    /// `max_new_bytes` and the peer's window. Returns `(bytes, offset)`.
    pub fn available_data_to_send(
        &mut self,
        sequence: u64,
        max_bytes: usize,
        max_new_bytes: u64,
    ) -> Option<(Vec<u8>, u64)> {
        if max_bytes == 0 {
            return None;
        }
        let (data, offset) = if let Some((offset, mut data)) = self.retry_queue.pop_first() {
            if data.len() > max_bytes {
                let rest = data.split_off(max_bytes);
                self.retry_queue.insert(offset + max_bytes as u64, rest);
            }
            (data, offset)
        } else {
            let window = self.remote_max_offset.saturating_sub(self.outgoing_offset);
            let len = (self.send_queue.len() as u64)
                .min(window)
                .min(max_new_bytes)
                .min(max_bytes as u64) as usize;
            if len == 0 {
                return None;
            }
            let data: Vec<u8> = self.send_queue.drain(..len).collect();
            let offset = self.outgoing_offset;
            self.outgoing_offset += len as u64;
            (data, offset)
        };
        self.data_in_flight.entry(sequence).or_default().push(SentRange {
            offset,
            data: data.clone(),
        });
        Some((data, offset))
    }

    /// The packet with `sequence` was delivered.
    pub fn ack_data(&mut self, sequence: u64) {
        self.data_in_flight.remove(&sequence);
    }

    /// The packet with `sequence` was rejected; its ranges go to the retry queue.
    pub fn nack_data(&mut self, sequence: u64) {
        let Some(ranges) = self.data_in_flight.remove(&sequence) else {
            return;
        };
        if self.is_abrupt() {
            return;
        }
        for range in ranges {
            self.retry_queue.insert(range.offset, range.data);
        }
    }

    /// Record the peer's window.
    pub fn set_remote_max_offset(&mut self, max_offset: u64) {
        if max_offset > self.remote_max_offset {
            self.remote_max_offset = max_offset;
        }
    }

    /// Whether new data is waiting on the peer's window.
    #[must_use]
    pub fn is_data_blocked(&self) -> bool {
        !self.send_queue.is_empty() && self.outgoing_offset >= self.remote_max_offset
    }

    /// `StreamDataBlocked`, once per peer window.
    pub fn take_data_blocked_frame(&mut self) -> Option<Frame> {
        if !self.is_data_blocked() || self.data_blocked_sent_at == Some(self.remote_max_offset) {
            return None;
        }
        self.data_blocked_sent_at = Some(self.remote_max_offset);
        Some(Frame::StreamDataBlocked {
            stream_id: self.id,
            max_offset: self.remote_max_offset,
        })
    }

    // ------------------------------------------------------------------
    // Incoming data
    // ------------------------------------------------------------------

    /// Highest offset we accept from the peer.
    #[must_use]
    pub fn local_max_offset(&self) -> u64 {
        self.consumed_offset
            .saturating_add(self.buffer_size)
            .max(self.advertised_max_offset)
    }

    /// Insert incoming bytes at `offset`.
    ///
    /// Returns how many bytes became readable. Duplicates and overlaps are
    /// ignored.
    ///
    /// # Errors
    /// Returns `StreamError::FlowControl` if the range ends beyond our window.
    pub fn push_incoming_data(&mut self, offset: u64, data: Vec<u8>) -> Result<usize, StreamError> {
        let end = offset.saturating_add(data.len() as u64);
        let max_offset = self.local_max_offset();
        if end > max_offset {
            return Err(StreamError::FlowControl { end, max_offset });
        }
        if end <= self.read_offset || data.is_empty() {
            return Ok(0);
        }
        match self.incoming.get(&offset) {
            Some(existing) if existing.len() >= data.len() => {}
            _ => {
                self.incoming.insert(offset, data);
            }
        }

        let before = self.readable.len();
        while let Some(entry) = self.incoming.first_entry() {
            let start = *entry.key();
            if start > self.read_offset {
                break;
            }
            let chunk = entry.remove();
            let chunk_end = start + chunk.len() as u64;
            if chunk_end <= self.read_offset {
                continue;
            }
            let skip = (self.read_offset - start) as usize;
            self.readable.extend(&chunk[skip..]);
            self.read_offset = chunk_end;
        }
        Ok(self.readable.len() - before)
    }

    /// Bytes ready to read.
    #[must_use]
    pub fn readable_len(&self) -> usize {
        self.readable.len()
    }

    /// Take every readable byte.
    pub fn read(&mut self) -> Vec<u8> {
        let data: Vec<u8> = self.readable.drain(..).collect();
        self.consumed_offset += data.len() as u64;
        let target = self.consumed_offset + self.buffer_size;
        if target >= self.advertised_max_offset + self.buffer_size / 2 {
            self.max_data_dirty = true;
        }
        data
    }

    /// The peer is blocked on our window; re-announce it.
    pub fn on_remote_data_blocked(&mut self) {
        self.max_data_dirty = true;
    }

    /// `StreamMaxData` announcing our window, if it should be sent.
    pub fn take_max_data_frame(&mut self) -> Option<Frame> {
        if !self.max_data_dirty || self.remote_closed {
            return None;
        }
        self.max_data_dirty = false;
        Some(self.max_data_frame())
    }

    /// `StreamMaxData` with the current window.
    pub fn max_data_frame(&mut self) -> Frame {
        self.advertised_max_offset = self.local_max_offset();
        Frame::StreamMaxData {
            stream_id: self.id,
            max_offset: self.advertised_max_offset,
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Close gracefully once queued value and data are delivered.
    pub fn end(&mut self) {
        if self.closing {
            return;
        }
        self.closing = true;
    }

    /// Close immediately, discarding unsent data and value.
    ///
    /// With `reason`, the peer sees the stream closed with that error;
    /// without one the close is reported as `NoError`.
    pub fn destroy(&mut self, reason: Option<(ErrorCode, String)>) {
        if self.local_closed {
            return;
        }
        self.closing = true;
        self.destroyed = true;
        self.send_queue.clear();
        self.retry_queue.clear();
        self.send_max = self.total_sent + self.outgoing_held;
        let (code, message) = reason.unwrap_or((ErrorCode::NoError, String::new()));
        if self.error.is_none() && code != ErrorCode::NoError {
            self.error = Some(StreamError::Reset {
                code,
                message: message.clone(),
            });
        }
        self.close_reason = (code, message);
    }

    /// The peer closed the stream.
    ///
    /// Returns the error if it closed with one.
    pub fn remote_close(&mut self, code: ErrorCode, message: String) -> Option<StreamError> {
        if self.remote_closed {
            return None;
        }
        self.remote_closed = true;
        self.closing = true;
        if code == ErrorCode::NoError {
            return None;
        }
        // nothing more can be delivered
        self.send_queue.clear();
        self.retry_queue.clear();
        self.send_max = self.total_sent + self.outgoing_held;
        let err = StreamError::Reset { code, message };
        self.error.get_or_insert(err.clone());
        Some(err)
    }

    /// Closing without waiting for queued value and data.
    fn is_abrupt(&self) -> bool {
        self.closing && (self.destroyed || self.close_reason.0 != ErrorCode::NoError)
    }

    fn is_ready_to_close(&self) -> bool {
        if !self.closing || self.local_closed || self.close_sent_in.is_some() {
            return false;
        }
        if self.is_abrupt() || self.remote_closed {
            return true;
        }
        self.holds.is_empty() && !self.has_pending_data() && self.amount_available_to_send() == 0
    }

    /// `StreamClose` to put in the packet with `sequence`, once the stream
    /// has nothing left in flight.
    pub fn take_close_frame(&mut self, sequence: u64) -> Option<Frame> {
        if !self.is_ready_to_close() {
            return None;
        }
        self.close_sent_in = Some(sequence);
        let (code, message) = self.close_reason.clone();
        Some(Frame::StreamClose {
            stream_id: self.id,
            code,
            message,
        })
    }

    /// Settle everything that rode the fulfilled packet `sequence`.
    ///
    /// Returns the value committed.
    pub fn packet_fulfilled(&mut self, sequence: u64) -> u64 {
        self.ack_data(sequence);
        if self.close_sent_in == Some(sequence) {
            self.local_closed = true;
        }
        self.execute_hold(sequence)
    }

    /// Release everything that rode the rejected packet `sequence`.
    ///
    /// Returns the value released.
    pub fn packet_rejected(&mut self, sequence: u64) -> u64 {
        self.nack_data(sequence);
        if self.close_sent_in == Some(sequence) {
            if !self.is_abrupt() {
                self.close_sent_in = None;
            } else {
                // an abrupt close is best effort
                self.local_closed = true;
            }
        }
        if self.max_money_sent_in == Some(sequence) {
            self.receive_max_dirty = true;
        }
        let released = self.cancel_hold(sequence);
        if self.is_abrupt() || (self.remote_closed && self.error.is_some()) {
            // value released after a reset is not offered again
            self.send_max = self.send_max.saturating_sub(released);
        }
        released
    }

    /// Mark the stream closed without telling the peer.
    pub fn force_close(&mut self) {
        self.closing = true;
        self.local_closed = true;
        self.remote_closed = true;
        self.send_queue.clear();
        self.retry_queue.clear();
        self.data_in_flight.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn stream() -> StreamState {
        StreamState::new(1, DEFAULT_STREAM_BUFFER_SIZE)
    }

    #[test]
    fn test_send_max_validation() {
        let mut s = stream();
        s.set_send_max(100).unwrap();
        assert_eq!(s.hold_outgoing(1, 60), 60);
        assert_eq!(
            s.set_send_max(50),
            Err(StreamError::SendMaxTooLow {
                limit: 50,
                committed: 60
            })
        );
        s.execute_hold(1);
        s.set_send_max(60).unwrap();
        assert_eq!(s.amount_available_to_send(), 0);
    }

    #[test]
    fn test_receive_max_validation() {
        let mut s = stream();
        s.set_receive_max(100).unwrap();
        s.add_to_incoming(80).unwrap();
        assert_eq!(
            s.set_receive_max(70),
            Err(StreamError::ReceiveMaxTooLow {
                limit: 70,
                received: 80
            })
        );
        assert_eq!(
            s.add_to_incoming(21),
            Err(StreamError::ExceedsReceiveMax {
                amount: 21,
                headroom: 20
            })
        );
        assert_eq!(s.total_received(), 80);
    }

    #[test]
    fn test_limits_rejected_after_end() {
        let mut s = stream();
        s.end();
        assert_eq!(s.set_send_max(10), Err(StreamError::Closed));
        assert_eq!(s.set_receive_max(10), Err(StreamError::Closed));
        assert_eq!(s.write(b"x"), Err(StreamError::Closed));
    }

    #[test]
    fn test_hold_lifecycle() {
        let mut s = stream();
        s.set_send_max(1000).unwrap();
        assert_eq!(s.hold_outgoing(1, 400), 400);
        assert_eq!(s.hold_outgoing(2, 700), 600);
        assert_eq!(s.hold_outgoing(3, 1), 0);
        assert_eq!(s.outgoing_held(), 1000);

        assert_eq!(s.execute_hold(1), 400);
        assert_eq!(s.cancel_hold(2), 600);
        // resolved exactly once
        assert_eq!(s.execute_hold(1), 0);
        assert_eq!(s.cancel_hold(2), 0);

        assert_eq!(s.total_sent(), 400);
        assert_eq!(s.outgoing_held(), 0);
        assert_eq!(s.amount_available_to_send(), 600);
    }

    #[test]
    fn test_remote_headroom() {
        let mut s = stream();
        assert_eq!(s.remote_receive_headroom(), u64::MAX);
        s.set_remote_receive_max(500, 100);
        assert_eq!(s.remote_receive_headroom(), 400);
        s.add_remote_received(50);
        assert_eq!(s.remote_receive_headroom(), 350);
        // totals never move backwards
        s.set_remote_receive_max(500, 10);
        assert_eq!(s.remote_receive_headroom(), 350);
    }

    #[test]
    fn test_money_blocked_sent_once() {
        let mut s = stream();
        s.set_send_max(10).unwrap();
        assert!(s.take_money_blocked_frame().is_some());
        assert!(s.take_money_blocked_frame().is_none());
        s.set_remote_receive_max(100, 0);
        assert!(s.take_money_blocked_frame().is_some());
    }

    #[test]
    fn test_data_chunks_respect_limits() {
        let mut s = stream();
        s.write(&[1u8; 100]).unwrap();
        let (chunk, offset) = s.available_data_to_send(1, 30, u64::MAX).unwrap();
        assert_eq!((chunk.len(), offset), (30, 0));
        let (chunk, offset) = s.available_data_to_send(1, 1000, 50).unwrap();
        assert_eq!((chunk.len(), offset), (50, 30));
        assert_eq!(s.queued_bytes(), 20);
        assert!(s.available_data_to_send(1, 0, 100).is_none());
    }

    #[test]
    fn test_retry_queue_precedence() {
        let mut s = stream();
        s.write(b"abcdefghij").unwrap();
        let (first, _) = s.available_data_to_send(1, 4, u64::MAX).unwrap();
        assert_eq!(first, b"abcd");
        s.nack_data(1);

        // the rejected range is re-offered before new bytes, split if needed
        let (chunk, offset) = s.available_data_to_send(2, 3, u64::MAX).unwrap();
        assert_eq!((chunk.as_slice(), offset), (&b"abc"[..], 0));
        let (chunk, offset) = s.available_data_to_send(2, 10, u64::MAX).unwrap();
        assert_eq!((chunk.as_slice(), offset), (&b"d"[..], 3));
        let (chunk, offset) = s.available_data_to_send(2, 10, u64::MAX).unwrap();
        assert_eq!((chunk.as_slice(), offset), (&b"efghij"[..], 4));

        s.ack_data(2);
        assert!(!s.has_pending_data());
    }

    #[test]
    fn test_remote_window_blocks_new_data() {
        let mut s = stream();
        s.write(&vec![0u8; DEFAULT_STREAM_BUFFER_SIZE as usize + 10]).unwrap();
        let (chunk, _) = s.available_data_to_send(1, usize::MAX, u64::MAX).unwrap();
        assert_eq!(chunk.len() as u64, DEFAULT_STREAM_BUFFER_SIZE);
        assert!(s.available_data_to_send(1, usize::MAX, u64::MAX).is_none());
        assert!(s.is_data_blocked());
        assert!(s.take_data_blocked_frame().is_some());
        assert!(s.take_data_blocked_frame().is_none());

        s.set_remote_max_offset(DEFAULT_STREAM_BUFFER_SIZE + 100);
        let (chunk, offset) = s.available_data_to_send(2, usize::MAX, u64::MAX).unwrap();
        assert_eq!((chunk.len(), offset), (10, DEFAULT_STREAM_BUFFER_SIZE));
    }

    #[test]
    fn test_reassembly_out_of_order() {
        let mut s = stream();
        assert_eq!(s.push_incoming_data(5, b"world".to_vec()), Ok(0));
        assert_eq!(s.readable_len(), 0);
        assert_eq!(s.push_incoming_data(0, b"hello".to_vec()), Ok(10));
        assert_eq!(s.read(), b"helloworld");
        assert_eq!(s.read(), b"");
    }

    #[test]
    fn test_reassembly_overlap_and_duplicates() {
        let mut s = stream();
        s.push_incoming_data(0, b"abc".to_vec()).unwrap();
        s.push_incoming_data(0, b"abc".to_vec()).unwrap();
        s.push_incoming_data(2, b"cdef".to_vec()).unwrap();
        s.push_incoming_data(1, b"bc".to_vec()).unwrap();
        assert_eq!(s.read(), b"abcdef");
    }

    #[test]
    fn test_gap_stays_buffered() {
        let mut s = stream();
        s.push_incoming_data(0, b"ab".to_vec()).unwrap();
        s.push_incoming_data(4, b"ef".to_vec()).unwrap();
        assert_eq!(s.read(), b"ab");
        assert_eq!(s.read(), b"");
        s.push_incoming_data(2, b"cd".to_vec()).unwrap();
        assert_eq!(s.read(), b"cdef");
    }

    #[test]
    fn test_flow_control_violation() {
        let mut s = StreamState::new(1, 10);
        // the peer may always use the default window it assumed
        assert!(s.push_incoming_data(DEFAULT_STREAM_BUFFER_SIZE - 1, vec![0]).is_ok());
        assert_eq!(
            s.push_incoming_data(DEFAULT_STREAM_BUFFER_SIZE, vec![0]),
            Err(StreamError::FlowControl {
                end: DEFAULT_STREAM_BUFFER_SIZE + 1,
                max_offset: DEFAULT_STREAM_BUFFER_SIZE
            })
        );
    }

    #[test]
    fn test_reading_reopens_window() {
        let mut s = stream();
        assert!(matches!(
            s.take_max_data_frame(),
            Some(Frame::StreamMaxData { max_offset, .. }) if max_offset == DEFAULT_STREAM_BUFFER_SIZE
        ));
        s.push_incoming_data(0, vec![1u8; 10_000]).unwrap();
        assert_eq!(s.read().len(), 10_000);
        assert!(matches!(
            s.take_max_data_frame(),
            Some(Frame::StreamMaxData { max_offset, .. }) if max_offset == 10_000 + DEFAULT_STREAM_BUFFER_SIZE
        ));
        assert!(s.take_max_data_frame().is_none());
    }

    #[test]
    fn test_close_waits_for_holds_and_data() {
        let mut s = stream();
        s.set_send_max(10).unwrap();
        s.write(b"xy").unwrap();
        s.hold_outgoing(1, 10);
        s.available_data_to_send(1, 10, u64::MAX);
        s.end();
        assert!(s.take_close_frame(2).is_none());

        s.packet_fulfilled(1);
        assert_eq!(s.total_sent(), 10);
        let frame = s.take_close_frame(2).unwrap();
        assert_eq!(
            frame,
            Frame::StreamClose {
                stream_id: 1,
                code: ErrorCode::NoError,
                message: String::new()
            }
        );
        assert!(s.take_close_frame(3).is_none());

        // a rejected close is retried
        s.packet_rejected(2);
        assert!(s.take_close_frame(3).is_some());
        s.packet_fulfilled(3);
        assert!(s.is_local_closed());
        assert!(!s.is_finished());
        s.remote_close(ErrorCode::NoError, String::new());
        assert!(s.is_finished());
    }

    #[test]
    fn test_destroy_discards_and_closes_immediately() {
        let mut s = stream();
        s.set_send_max(100).unwrap();
        s.write(b"pending").unwrap();
        s.hold_outgoing(1, 40);
        s.destroy(Some((ErrorCode::ApplicationError, "boom".to_string())));

        assert_eq!(s.queued_bytes(), 0);
        assert_eq!(s.amount_available_to_send(), 0);
        assert!(matches!(s.error(), Some(StreamError::Reset { .. })));
        assert!(matches!(
            s.take_close_frame(2),
            Some(Frame::StreamClose { code: ErrorCode::ApplicationError, .. })
        ));
        // the in-flight hold still resolves normally
        assert_eq!(s.packet_fulfilled(1), 40);
        assert_eq!(s.total_sent(), 40);
        assert!(s.total_sent() <= s.send_max());
    }

    #[test]
    fn test_destroy_without_reason_is_not_an_error() {
        let mut s = stream();
        s.set_send_max(100).unwrap();
        s.write(b"pending").unwrap();
        s.hold_outgoing(1, 40);
        s.destroy(None);

        assert!(s.error().is_none());
        assert_eq!(s.queued_bytes(), 0);
        assert_eq!(
            s.take_close_frame(2),
            Some(Frame::StreamClose { stream_id: 1, code: ErrorCode::NoError, message: String::new() })
        );
        // a lost close is not retried
        assert_eq!(s.packet_rejected(1), 40);
        s.packet_rejected(2);
        assert!(s.take_close_frame(3).is_none());
        assert_eq!(s.amount_available_to_send(), 0);
    }

    #[test]
    fn test_remote_error_close() {
        let mut s = stream();
        s.write(b"unsent").unwrap();
        let err = s.remote_close(ErrorCode::ApplicationError, "nope".to_string());
        assert!(err.is_some());
        assert_eq!(s.queued_bytes(), 0);
        assert!(!s.is_open());
        assert!(s.take_close_frame(1).is_some());
    }

    #[derive(Debug, Clone)]
    enum HoldOp {
        Hold(u64, u64),
        Execute(u64),
        Cancel(u64),
    }

    fn hold_op() -> impl Strategy<Value = HoldOp> {
        prop_oneof![
            (0u64..8, 0u64..500).prop_map(|(seq, amount)| HoldOp::Hold(seq, amount)),
            (0u64..8).prop_map(HoldOp::Execute),
            (0u64..8).prop_map(HoldOp::Cancel),
        ]
    }

    proptest! {
        #[test]
        fn hold_conservation(send_max in 0u64..2000, ops in proptest::collection::vec(hold_op(), 0..60)) {
            let mut s = stream();
            s.set_send_max(send_max).unwrap();
            let (mut created, mut committed, mut cancelled) = (0u64, 0u64, 0u64);
            for op in ops {
                match op {
                    HoldOp::Hold(seq, amount) => created += s.hold_outgoing(seq, amount),
                    HoldOp::Execute(seq) => committed += s.execute_hold(seq),
                    HoldOp::Cancel(seq) => cancelled += s.cancel_hold(seq),
                }
                prop_assert!(s.total_sent() + s.outgoing_held() <= s.send_max());
                prop_assert_eq!(created, committed + cancelled + s.outgoing_held());
            }
            for seq in 0..8 {
                cancelled += s.cancel_hold(seq);
            }
            prop_assert_eq!(created, committed + cancelled);
        }

        #[test]
        fn reassembly_matches_in_order_delivery(
            data in proptest::collection::vec(any::<u8>(), 1..400),
            cuts in proptest::collection::vec((0usize..400, 1usize..64), 1..30),
        ) {
            let mut s = stream();
            for (start, len) in cuts {
                let start = start % data.len();
                let end = (start + len).min(data.len());
                s.push_incoming_data(start as u64, data[start..end].to_vec()).unwrap();
                s.push_incoming_data(start as u64, data[start..end].to_vec()).unwrap();
            }
            s.push_incoming_data(0, data.clone()).unwrap();
            prop_assert_eq!(s.read(), data);
        }
    }
}
