//! Notifications delivered to the application.
//!
//! Events are broadcast over channels, so application code never runs inside
//! the protocol engine: a slow or failing subscriber cannot corrupt state or
//! hold up a fulfillment.

use super::stream_handle::Stream;
use crate::error::{ConnectionError, StreamError};

/// Capacity of each event channel
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Connection-level event
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// Handshake completed, or the peer announced its address
    Connect,
    /// The peer opened a stream
    Stream(Stream),
    /// The connection closed
    Close,
    /// The connection failed
    Error(ConnectionError),
    /// The send loop ran out of work
    SendLoopFinished,
}

impl ConnectionEvent {
    /// Stable event name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Stream(_) => "stream",
            Self::Close => "close",
            Self::Error(_) => "error",
            Self::SendLoopFinished => "_send_loop_finished",
        }
    }
}

/// Stream-level event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Value received, in our units
    Money(u64),
    /// Value sent and acknowledged, in our units
    OutgoingMoney(u64),
    /// Bytes became readable
    Data(usize),
    /// The peer closed its side
    End,
    /// The stream closed
    Close,
    /// The stream failed
    Error(StreamError),
}

impl StreamEvent {
    /// Stable event name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Money(_) => "money",
            Self::OutgoingMoney(_) => "outgoing_money",
            Self::Data(_) => "data",
            Self::End => "end",
            Self::Close => "close",
            Self::Error(_) => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names() {
        assert_eq!(ConnectionEvent::SendLoopFinished.name(), "_send_loop_finished");
        assert_eq!(ConnectionEvent::Close.name(), "close");
        assert_eq!(StreamEvent::Money(5).name(), "money");
        assert_eq!(StreamEvent::Error(StreamError::Closed).name(), "error");
    }
}
