//! Application handle to a stream.

use super::ConnectionInner;
use super::events::StreamEvent;
use super::state::StreamSummary;
use crate::error::StreamError;
use crate::packet::ErrorCode;
use crate::stream::StreamState;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::debug;

/// A stream of money and data within a connection
///
/// Handles are cheap to clone. A handle does not keep its connection alive;
/// once the connection is gone every operation fails with
/// [`StreamError::ConnectionClosed`].
#[derive(Clone)]
pub struct Stream {
    id: u64,
    connection: Weak<ConnectionInner>,
    events: broadcast::Sender<StreamEvent>,
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream").field("id", &self.id).finish_non_exhaustive()
    }
}

impl Stream {
    pub(crate) fn new(
        id: u64,
        connection: Weak<ConnectionInner>,
        events: broadcast::Sender<StreamEvent>,
    ) -> Self {
        Self {
            id,
            connection,
            events,
        }
    }

    fn connection(&self) -> Result<Arc<ConnectionInner>, StreamError> {
        self.connection.upgrade().ok_or(StreamError::ConnectionClosed)
    }

    /// Run `f` on the live stream state, then wake the send loop.
    fn update<R>(
        &self,
        f: impl FnOnce(&mut StreamState) -> Result<R, StreamError>,
    ) -> Result<R, StreamError> {
        let connection = self.connection()?;
        let result = {
            let mut state = connection.lock();
            match state.streams.get_mut(&self.id) {
                Some(entry) => f(&mut entry.state),
                None => Err(removed_error(state.stream_summary(self.id))),
            }
        };
        if result.is_ok() {
            connection.start_send_loop();
        }
        result
    }

    fn summary(&self) -> Option<StreamSummary> {
        self.connection.upgrade()?.lock().stream_summary(self.id)
    }

    /// Stream id
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Subscribe to this stream's events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.events.subscribe()
    }

    /// Value sent and acknowledged, in our units.
    #[must_use]
    pub fn total_sent(&self) -> u64 {
        self.summary().map_or(0, |s| s.total_sent)
    }

    /// Value received, in our units.
    #[must_use]
    pub fn total_received(&self) -> u64 {
        self.summary().map_or(0, |s| s.total_received)
    }

    /// Current send limit.
    #[must_use]
    pub fn send_max(&self) -> u64 {
        self.summary().map_or(0, |s| s.send_max)
    }

    /// Current receive limit.
    #[must_use]
    pub fn receive_max(&self) -> u64 {
        self.summary().map_or(0, |s| s.receive_max)
    }

    /// Latest receipt the peer sent for this stream.
    #[must_use]
    pub fn receipt(&self) -> Option<Vec<u8>> {
        self.summary()?.receipt
    }

    /// Whether money and data can still be sent.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.connection.upgrade().is_some_and(|connection| {
            connection
                .lock()
                .streams
                .get(&self.id)
                .is_some_and(|entry| entry.state.is_open())
        })
    }

    /// Allow up to `limit` in total to be sent.
    ///
    /// # Errors
    ///
    /// Fails if the stream is closed or `limit` is below what is already
    /// sent or in flight.
    pub fn set_send_max(&self, limit: u64) -> Result<(), StreamError> {
        self.update(|stream| stream.set_send_max(limit))
    }

    /// Accept up to `limit` in total.
    ///
    /// # Errors
    ///
    /// Fails if the stream is closed or `limit` is below what was received.
    pub fn set_receive_max(&self, limit: u64) -> Result<(), StreamError> {
        self.update(|stream| stream.set_receive_max(limit))
    }

    /// Send until `total_sent` reaches `amount`.
    ///
    /// # Errors
    ///
    /// [`StreamError::Timeout`] if `timeout` passes first, or the error the
    /// stream closed with.
    pub async fn send_total(&self, amount: u64, timeout: Duration) -> Result<(), StreamError> {
        if self.send_max() < amount {
            self.set_send_max(amount)?;
        }
        let id = self.id;
        self.wait(timeout, move |summary| {
            if summary.total_sent >= amount {
                return Some(Ok(()));
            }
            summary.closed.then(|| Err(summary.error.clone().unwrap_or(StreamError::Closed)))
        })
        .await
        .inspect_err(|err| debug!(stream_id = id, %err, "send_total did not complete"))
    }

    /// Send `amount` more on top of the current send limit.
    ///
    /// # Errors
    ///
    /// As [`Stream::send_total`].
    pub async fn send_money(&self, amount: u64, timeout: Duration) -> Result<(), StreamError> {
        let target = self.send_max().saturating_add(amount);
        self.send_total(target, timeout).await
    }

    /// Wait until `total_received` reaches `amount`, raising the receive
    /// limit if needed.
    ///
    /// # Errors
    ///
    /// [`StreamError::Timeout`] if `timeout` passes first, or the error the
    /// stream closed with.
    pub async fn receive_total(&self, amount: u64, timeout: Duration) -> Result<(), StreamError> {
        if self.receive_max() < amount {
            self.set_receive_max(amount)?;
        }
        self.wait(timeout, move |summary| {
            if summary.total_received >= amount {
                return Some(Ok(()));
            }
            summary.closed.then(|| Err(summary.error.clone().unwrap_or(StreamError::Closed)))
        })
        .await
    }

    async fn wait(
        &self,
        timeout: Duration,
        mut check: impl FnMut(&Progress) -> Option<Result<(), StreamError>>,
    ) -> Result<(), StreamError> {
        let connection = self.connection()?;
        let id = self.id;
        let deadline = Instant::now() + timeout;
        connection
            .wait_until(Some(deadline), |state| {
                let progress = match state.streams.get(&id) {
                    Some(entry) => Progress::live(&entry.state),
                    None => Progress::removed(state.stream_summary(id)),
                };
                check(&progress)
            })
            .await
            .unwrap_or(Err(StreamError::Timeout))
    }

    /// Queue bytes for the peer.
    ///
    /// # Errors
    ///
    /// Fails once the stream is closed for sending.
    pub fn write(&self, data: &[u8]) -> Result<(), StreamError> {
        self.update(|stream| stream.write(data))
    }

    /// Take all bytes that have arrived in order.
    #[must_use]
    pub fn read(&self) -> Vec<u8> {
        let Some(connection) = self.connection.upgrade() else {
            return Vec::new();
        };
        let data = {
            let mut state = connection.lock();
            let data = match state.streams.get_mut(&self.id) {
                Some(entry) => entry.state.read(),
                None => Vec::new(),
            };
            if !data.is_empty() {
                state.on_data_consumed(data.len() as u64, &connection.config);
            }
            data
        };
        if !data.is_empty() {
            connection.start_send_loop();
        }
        data
    }

    /// Wait for bytes, then take them.
    ///
    /// Returns an empty buffer once the peer has closed the stream and
    /// everything was read.
    ///
    /// # Errors
    ///
    /// Fails if the connection is gone.
    pub async fn read_data(&self) -> Result<Vec<u8>, StreamError> {
        let connection = self.connection()?;
        let id = self.id;
        connection
            .wait_until(None, |state| match state.streams.get(&id) {
                Some(entry) => (entry.state.readable_len() > 0 || entry.state.is_remote_closed()).then_some(()),
                None => Some(()),
            })
            .await;
        Ok(self.read())
    }

    /// Read until the peer closes the stream.
    ///
    /// # Errors
    ///
    /// Fails if the connection is gone.
    pub async fn read_to_end(&self) -> Result<Vec<u8>, StreamError> {
        let mut buffer = Vec::new();
        loop {
            let chunk = self.read_data().await?;
            if chunk.is_empty() {
                return Ok(buffer);
            }
            buffer.extend_from_slice(&chunk);
        }
    }

    /// Close gracefully once queued money and data are delivered.
    ///
    /// # Errors
    ///
    /// Fails if the stream is already gone.
    pub fn end(&self) -> Result<(), StreamError> {
        self.update(|stream| {
            stream.end();
            Ok(())
        })
    }

    /// Close immediately, dropping queued money and data.
    ///
    /// With a message, the peer sees the close as an application error;
    /// without one it is an ordinary close and waiters see
    /// [`StreamError::Closed`].
    ///
    /// # Errors
    ///
    /// Fails if the stream is already gone.
    pub fn destroy(&self, error: Option<String>) -> Result<(), StreamError> {
        let reason = error.map(|message| (ErrorCode::ApplicationError, message));
        self.update(|stream| {
            stream.destroy(reason);
            Ok(())
        })
    }
}

/// What waiters look at, for live and removed streams alike
struct Progress {
    total_sent: u64,
    total_received: u64,
    closed: bool,
    error: Option<StreamError>,
}

impl Progress {
    fn live(state: &StreamState) -> Self {
        Self {
            total_sent: state.total_sent(),
            total_received: state.total_received(),
            closed: !state.is_open() && state.outgoing_held() == 0 && state.amount_available_to_send() == 0,
            error: state.error().cloned(),
        }
    }

    fn removed(summary: Option<StreamSummary>) -> Self {
        match summary {
            Some(summary) => Self {
                total_sent: summary.total_sent,
                total_received: summary.total_received,
                closed: true,
                error: summary.error,
            },
            None => Self {
                total_sent: 0,
                total_received: 0,
                closed: true,
                error: Some(StreamError::ConnectionClosed),
            },
        }
    }
}

fn removed_error(summary: Option<StreamSummary>) -> StreamError {
    summary.and_then(|s| s.error).unwrap_or(StreamError::Closed)
}
