//! Connections between two endpoints sharing a secret.
//!
//! A [`Connection`] multiplexes [`Stream`]s of money and data over ledger
//! packets. The client side is opened with [`Connection::connect`]; server
//! side connections come from [`crate::Server`].
//!
//! Each connection runs at most one send loop task at a time. It assembles
//! packets from the streams, sends them one by one and settles the result.
//! Incoming Prepares are answered synchronously by the inbound handler.
//! Both work on the same [`ConnectionState`] behind a mutex that is never
//! held across an await.

mod config;
mod events;
mod exchange_rate;
mod inbound;
mod send_loop;
mod state;
mod stream_handle;

pub use config::{
    ConnectionConfig, DEFAULT_CONNECTION_BUFFER_SIZE, DEFAULT_MAX_PACKET_SIZE,
    DEFAULT_MAX_REMOTE_STREAMS, ReceiptConfig,
};
pub use events::{ConnectionEvent, StreamEvent};
pub use state::{AssetDetails, ConnectionStats, MAX_SEQUENCE, Role};
pub use stream_handle::Stream;

use crate::error::ConnectionError;
use crate::packet::{ErrorCode, Frame};
use events::EVENT_CHANNEL_CAPACITY;
use inbound::ClientDataHandler;
use lstream_crypto::{StreamKeys, sha256};
use lstream_transport::Transport;
use state::{ConnectionState, FrameOutcome};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{Notify, broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Shared core of a connection
pub(crate) struct ConnectionInner {
    pub(crate) id: String,
    pub(crate) config: ConnectionConfig,
    pub(crate) keys: StreamKeys,
    pub(crate) transport: Arc<dyn Transport>,
    state: Mutex<ConnectionState>,
    /// Woken whenever streams or the connection make progress
    pub(crate) progress: Notify,
    events: broadcast::Sender<ConnectionEvent>,
    incoming_tx: mpsc::UnboundedSender<Stream>,
    incoming_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Stream>>,
    tag: Option<String>,
    /// Client connections own the transport's data handler
    owns_handler: bool,
    /// Runtime the connection was created on, for wakes from outside it
    runtime: Option<tokio::runtime::Handle>,
}

impl ConnectionInner {
    pub(crate) fn new(
        role: Role,
        config: ConnectionConfig,
        shared_secret: &[u8; 32],
        transport: Arc<dyn Transport>,
        destination_account: Option<String>,
        tag: Option<String>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let state = ConnectionState::new(role, &config, destination_account, events.clone());
        Arc::new(Self {
            id: hex::encode(&sha256(shared_secret)[..4]),
            keys: StreamKeys::derive(shared_secret),
            config,
            transport,
            state: Mutex::new(state),
            progress: Notify::new(),
            events,
            incoming_tx,
            incoming_rx: tokio::sync::Mutex::new(incoming_rx),
            tag,
            owns_handler: role == Role::Client,
            runtime: tokio::runtime::Handle::try_current().ok(),
        })
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ConnectionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runtime to spawn connection tasks on, if any.
    pub(crate) fn runtime(&self) -> Option<tokio::runtime::Handle> {
        tokio::runtime::Handle::try_current()
            .ok()
            .or_else(|| self.runtime.clone())
    }

    pub(crate) fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }

    /// Wait until `check` returns `Some`, re-evaluating on every progress
    /// notification. Returns `None` if `deadline` passes first.
    pub(crate) async fn wait_until<R>(
        &self,
        deadline: Option<Instant>,
        mut check: impl FnMut(&ConnectionState) -> Option<R>,
    ) -> Option<R> {
        loop {
            let notified = self.progress.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(result) = check(&self.lock()) {
                return Some(result);
            }
            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return None;
                    }
                }
                None => notified.await,
            }
        }
    }

    fn stream_handle(self: &Arc<Self>, id: u64) -> Option<Stream> {
        let state = self.lock();
        let entry = state.streams.get(&id)?;
        Some(Stream::new(id, Arc::downgrade(self), entry.events.clone()))
    }

    /// Publish what a batch of frames changed.
    pub(crate) fn apply_outcome(self: &Arc<Self>, outcome: FrameOutcome) {
        if outcome.connected {
            info!(connection = %self.id, "peer connected");
            self.emit(ConnectionEvent::Connect);
        }
        for id in &outcome.new_streams {
            if let Some(stream) = self.stream_handle(*id) {
                self.emit(ConnectionEvent::Stream(stream.clone()));
                let _ = self.incoming_tx.send(stream);
            }
        }
        match outcome.peer_closed {
            Some(Some(err)) => {
                warn!(connection = %self.id, %err, "peer closed connection with error");
                self.shutdown(Some(err), false);
            }
            Some(None) => {
                info!(connection = %self.id, "peer closed connection");
                self.shutdown(None, false);
            }
            None => {
                let queued = self.lock().prune_streams();
                if outcome.wake || queued || !outcome.new_streams.is_empty() {
                    self.start_send_loop();
                }
            }
        }
        self.progress.notify_waiters();
    }

    /// Tear the connection down, optionally telling the peer.
    pub(crate) fn shutdown(self: &Arc<Self>, error: Option<ConnectionError>, notify_peer: bool) {
        let close = match &error {
            Some(err) => Frame::ConnectionClose {
                code: err.error_code(),
                message: err.to_string(),
            },
            None => Frame::ConnectionClose {
                code: ErrorCode::NoError,
                message: String::new(),
            },
        };
        if let Some(err) = &error {
            debug!(connection = %self.id, %err, "closing connection");
        }
        if !self.lock().finalize(error) {
            return;
        }
        if self.owns_handler {
            self.transport.deregister_data_handler();
        }
        self.progress.notify_waiters();
        if !notify_peer {
            return;
        }
        if let Some(runtime) = self.runtime() {
            let inner = Arc::clone(self);
            runtime.spawn(async move { inner.send_close(close).await });
        }
    }

    /// Close the connection after `idle_timeout` without activity.
    pub(crate) fn spawn_idle_watchdog(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let timeout = self.config.idle_timeout;
        tokio::spawn(async move {
            loop {
                let remaining = {
                    let Some(inner) = weak.upgrade() else {
                        return;
                    };
                    let state = inner.lock();
                    if state.closed {
                        return;
                    }
                    let idle = state.last_activity.elapsed();
                    if idle >= timeout && !state.send_loop_running {
                        drop(state);
                        info!(connection = %inner.id, "connection idle, closing");
                        inner.shutdown(Some(ConnectionError::IdleTimeout), true);
                        return;
                    }
                    timeout.saturating_sub(idle).max(timeout / 10)
                };
                tokio::time::sleep(remaining).await;
            }
        });
    }
}

/// Handle to a connection
///
/// Cheap to clone; all clones refer to the same connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Connection {
    pub(crate) fn from_inner(inner: Arc<ConnectionInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn inner(&self) -> &Arc<ConnectionInner> {
        &self.inner
    }

    /// Open a connection to `destination_account`.
    ///
    /// Connects the transport if needed, registers for incoming packets,
    /// exchanges addresses and limits with the peer and probes the exchange
    /// rate.
    ///
    /// # Errors
    ///
    /// Returns the transport error, [`ConnectionError::ConnectFailed`] if the
    /// peer does not answer the handshake, or the rate discovery error.
    pub async fn connect(
        transport: Arc<dyn Transport>,
        destination_account: impl Into<String>,
        shared_secret: &[u8; 32],
        config: ConnectionConfig,
    ) -> Result<Self, ConnectionError> {
        if !transport.is_connected() {
            transport.connect().await?;
        }
        let inner = ConnectionInner::new(
            Role::Client,
            config,
            shared_secret,
            Arc::clone(&transport),
            Some(destination_account.into()),
            None,
        );
        transport.register_data_handler(Arc::new(ClientDataHandler::new(&inner)))?;

        let established = async {
            inner.handshake().await?;
            inner.discover_exchange_rate().await
        };
        match established.await {
            Ok(rate) => {
                info!(connection = %inner.id, %rate, "connection established");
            }
            Err(err) => {
                warn!(connection = %inner.id, %err, "connect failed");
                inner.shutdown(Some(err.clone()), false);
                return Err(err);
            }
        }
        inner.lock().connected = true;
        inner.emit(ConnectionEvent::Connect);
        inner.spawn_idle_watchdog();
        Ok(Self { inner })
    }

    /// Short identifier used in logs
    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Our side of the connection
    #[must_use]
    pub fn role(&self) -> Role {
        self.inner.lock().role
    }

    /// Application tag carried in the server token, if any
    #[must_use]
    pub fn connection_tag(&self) -> Option<&str> {
        self.inner.tag.as_deref()
    }

    /// Configuration the connection runs with
    #[must_use]
    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Open a new stream.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::StreamIdsExhausted`] if the peer's stream
    /// limit is reached, and [`ConnectionError::Closed`] once the connection
    /// is closing.
    pub fn create_stream(&self) -> Result<Stream, ConnectionError> {
        let result = self.inner.lock().create_stream(&self.inner.config);
        match result {
            Ok((id, events)) => Ok(Stream::new(id, Arc::downgrade(&self.inner), events)),
            Err(err) => {
                // lets the peer know we are blocked
                self.inner.start_send_loop();
                Err(err)
            }
        }
    }

    /// Wait for the next stream opened by the peer.
    ///
    /// Returns `None` once the connection is closed and no streams remain.
    pub async fn accept_stream(&self) -> Option<Stream> {
        let mut incoming = self.inner.incoming_rx.lock().await;
        loop {
            if let Ok(stream) = incoming.try_recv() {
                return Some(stream);
            }
            let notified = self.inner.progress.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Ok(stream) = incoming.try_recv() {
                return Some(stream);
            }
            if self.is_closed() {
                return None;
            }
            notified.await;
        }
    }

    /// Subscribe to connection events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// Snapshot of the connection counters.
    #[must_use]
    pub fn stats(&self) -> ConnectionStats {
        self.inner.lock().stats()
    }

    /// Peer address, once known.
    #[must_use]
    pub fn destination_account(&self) -> Option<String> {
        self.inner.lock().destination_account.clone()
    }

    /// Asset the peer announced.
    #[must_use]
    pub fn destination_asset(&self) -> Option<AssetDetails> {
        self.inner.lock().remote_asset.clone()
    }

    /// Probed exchange rate, once known.
    #[must_use]
    pub fn exchange_rate(&self) -> Option<crate::util::Ratio> {
        self.inner.lock().exchange_rate
    }

    /// Value sent so far, in our units.
    #[must_use]
    pub fn total_sent(&self) -> u64 {
        self.inner.lock().stats.total_sent
    }

    /// Value the peer reported receiving, in its units.
    #[must_use]
    pub fn total_delivered(&self) -> u64 {
        self.inner.lock().stats.total_delivered
    }

    /// Value received so far, in our units.
    #[must_use]
    pub fn total_received(&self) -> u64 {
        self.inner.lock().stats.total_received
    }

    /// Whether the handshake has completed.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.lock().connected
    }

    /// Whether the connection is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// The error the connection failed with, if any.
    #[must_use]
    pub fn error(&self) -> Option<ConnectionError> {
        self.inner.lock().error.clone()
    }

    /// Close gracefully.
    ///
    /// Ends every stream, waits for queued money and data to be delivered
    /// and the streams' closes to be acknowledged, then tells the peer.
    ///
    /// # Errors
    ///
    /// Returns the error the connection failed with while closing, or
    /// [`ConnectionError::Destroyed`] if the streams did not finish within
    /// the idle timeout.
    pub async fn end(&self) -> Result<(), ConnectionError> {
        let inner = &self.inner;
        {
            let mut state = inner.lock();
            if state.closed {
                return state.error.clone().map_or(Ok(()), Err);
            }
            state.closing = true;
            for entry in state.streams.values_mut() {
                entry.state.end();
            }
        }
        debug!(connection = %inner.id, "ending connection");
        inner.start_send_loop();

        let deadline = Instant::now() + inner.config.idle_timeout;
        let drained = inner
            .wait_until(Some(deadline), |state| {
                (state.closed || (state.all_streams_closed() && !state.send_loop_running))
                    .then_some(())
            })
            .await;

        if let Some(err) = inner.lock().error.clone() {
            return Err(err);
        }
        if drained.is_none() {
            let err = ConnectionError::Destroyed("streams did not finish closing".to_string());
            inner.shutdown(Some(err.clone()), true);
            return Err(err);
        }
        let already_closed = {
            let mut state = inner.lock();
            std::mem::replace(&mut state.closed, true)
        };
        if !already_closed {
            inner
                .send_close(Frame::ConnectionClose {
                    code: ErrorCode::NoError,
                    message: String::new(),
                })
                .await;
        }
        inner.shutdown(None, false);
        info!(connection = %inner.id, "connection closed");
        Ok(())
    }

    /// Close immediately, abandoning queued money and data.
    ///
    /// With an error, streams report [`crate::StreamError::ConnectionClosed`]
    /// and the peer receives the error's code.
    pub fn destroy(&self, error: Option<ConnectionError>) {
        self.inner.shutdown(error, true);
    }
}
