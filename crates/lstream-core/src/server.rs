//! Accepting connections.
//!
//! A server owns one transport and any number of connections. Each client
//! gets its own address `{server_account}.{token}`; the token names the
//! connection and, with the server secret, determines its shared secret, so
//! the server keeps no per-client state until the first packet arrives.
//!
//! A closed connection stays registered for a grace period so late packets
//! get a close reply, then it is evicted.

use crate::connection::{Connection, ConnectionConfig, ConnectionInner, Role};
use crate::error::ConnectionError;
use crate::packet::Packet;
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use lstream_crypto::keys::{derive_shared_secret, generate_token, split_token};
use lstream_crypto::random::random_32;
use lstream_crypto::StreamKeys;
use lstream_transport::{DataHandler, ErrorCode as RejectCode, LedgerPacket, Prepare, Reject, Transport};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, Notify, mpsc};
use tracing::{debug, info};

/// How long a closed connection keeps answering before it is evicted
pub const DEFAULT_CLOSED_CONNECTION_GRACE: Duration = Duration::from_secs(60);

/// Server configuration
#[derive(Clone)]
pub struct ServerConfig {
    /// Address prefix all connections live under
    pub server_account: String,

    /// Secret connection secrets are derived from; random if `None`
    pub server_secret: Option<[u8; 32]>,

    /// Template for every accepted connection
    pub connection: ConnectionConfig,

    /// How long closed connections stay registered
    pub closed_connection_grace: Duration,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("server_account", &self.server_account)
            .field("connection", &self.connection)
            .field("closed_connection_grace", &self.closed_connection_grace)
            .finish_non_exhaustive()
    }
}

impl ServerConfig {
    /// Configuration for `server_account` with a random secret.
    #[must_use]
    pub fn new(server_account: impl Into<String>) -> Self {
        let server_account = server_account.into();
        Self {
            connection: ConnectionConfig::default().with_source_account(server_account.clone()),
            server_account,
            server_secret: None,
            closed_connection_grace: DEFAULT_CLOSED_CONNECTION_GRACE,
        }
    }

    /// Use a fixed server secret.
    #[must_use]
    pub fn with_secret(mut self, secret: [u8; 32]) -> Self {
        self.server_secret = Some(secret);
        self
    }

    /// Set the template for accepted connections.
    ///
    /// The connection's source account is replaced by the server account.
    #[must_use]
    pub fn with_connection_config(mut self, config: ConnectionConfig) -> Self {
        self.connection = config.with_source_account(self.server_account.clone());
        self
    }

    /// Set how long closed connections keep answering late packets.
    #[must_use]
    pub fn with_closed_connection_grace(mut self, grace: Duration) -> Self {
        self.closed_connection_grace = grace;
        self
    }
}

struct ServerInner {
    account: String,
    secret: [u8; 32],
    config: ConnectionConfig,
    closed_grace: Duration,
    transport: Arc<dyn Transport>,
    connections: DashMap<String, Connection>,
    incoming_tx: mpsc::UnboundedSender<Connection>,
    incoming_rx: Mutex<mpsc::UnboundedReceiver<Connection>>,
    closed: AtomicBool,
    shutdown: Notify,
}

impl ServerInner {
    fn reject(&self, code: RejectCode, message: &str) -> LedgerPacket {
        Reject::new(code, &self.account, message).into()
    }

    /// Find or open the connection a Prepare is addressed to.
    fn handle_prepare(self: &Arc<Self>, prepare: Prepare) -> LedgerPacket {
        let Some(token) = prepare
            .destination
            .strip_prefix(self.account.as_str())
            .and_then(|rest| rest.strip_prefix('.'))
            .and_then(|rest| rest.split('.').next())
            .filter(|token| !token.is_empty())
        else {
            debug!(destination = %prepare.destination, "prepare not addressed to a connection");
            return self.reject(RejectCode::F02_UNREACHABLE, "no such connection");
        };

        let existing = self.connections.get(token).map(|entry| entry.value().clone());
        let connection = match existing {
            Some(connection) => connection,
            None => {
                if self.closed.load(Ordering::Acquire) {
                    return self.reject(RejectCode::F02_UNREACHABLE, "server is closed");
                }
                let shared_secret = derive_shared_secret(&self.secret, token.as_bytes());
                if Packet::decrypt(&StreamKeys::derive(&shared_secret), &prepare.data).is_err() {
                    debug!("first packet for token does not decrypt");
                    return self.reject(RejectCode::F06_UNEXPECTED_PAYMENT, "");
                }
                match self.connections.entry(token.to_string()) {
                    Entry::Occupied(entry) => entry.get().clone(),
                    Entry::Vacant(entry) => {
                        let (_, tag) = split_token(token);
                        let inner = ConnectionInner::new(
                            Role::Server,
                            self.config.clone(),
                            &shared_secret,
                            Arc::clone(&self.transport),
                            None,
                            tag.map(str::to_string),
                        );
                        let connection = Connection::from_inner(inner);
                        entry.insert(connection.clone());
                        connection.inner().spawn_idle_watchdog();
                        self.evict_when_closed(token.to_string(), connection.clone());
                        info!(connection = %connection.id(), tag = ?tag, "accepted connection");
                        let _ = self.incoming_tx.send(connection.clone());
                        connection
                    }
                }
            }
        };

        connection.inner().handle_prepare(prepare)
    }

    /// Drop `connection` from the table `closed_grace` after it closes.
    fn evict_when_closed(self: &Arc<Self>, token: String, connection: Connection) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let server = Arc::downgrade(self);
        let grace = self.closed_grace;
        runtime.spawn(async move {
            connection
                .inner()
                .wait_until(None, |state| state.closed.then_some(()))
                .await;
            tokio::time::sleep(grace).await;
            let Some(server) = server.upgrade() else {
                return;
            };
            let evicted = server.connections.remove_if(&token, |_, current| {
                Arc::ptr_eq(current.inner(), connection.inner())
            });
            if evicted.is_some() {
                debug!(connection = %connection.id(), "evicted closed connection");
            }
        });
    }
}

struct ServerDataHandler {
    server: Weak<ServerInner>,
}

#[async_trait]
impl DataHandler for ServerDataHandler {
    async fn handle_data(&self, data: Vec<u8>) -> Vec<u8> {
        let Some(server) = self.server.upgrade() else {
            return LedgerPacket::from(Reject::new(RejectCode::F02_UNREACHABLE, "", "server closed")).to_bytes();
        };
        let response = match LedgerPacket::from_bytes(&data) {
            Ok(LedgerPacket::Prepare(prepare)) => server.handle_prepare(prepare),
            Ok(_) | Err(_) => server.reject(RejectCode::F00_BAD_REQUEST, "expected a prepare"),
        };
        response.to_bytes()
    }
}

/// Accepts connections on a transport
pub struct Server {
    inner: Arc<ServerInner>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("account", &self.inner.account)
            .field("connections", &self.inner.connections.len())
            .finish_non_exhaustive()
    }
}

impl Server {
    /// Start accepting connections on `transport`.
    ///
    /// # Errors
    ///
    /// Fails if the transport cannot connect, already has a handler, or no
    /// random secret could be generated.
    pub async fn listen(transport: Arc<dyn Transport>, config: ServerConfig) -> Result<Self, ConnectionError> {
        let secret = match config.server_secret {
            Some(secret) => secret,
            None => random_32()?,
        };
        if !transport.is_connected() {
            transport.connect().await?;
        }
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ServerInner {
            account: config.server_account,
            secret,
            config: config.connection,
            closed_grace: config.closed_connection_grace,
            transport: Arc::clone(&transport),
            connections: DashMap::new(),
            incoming_tx,
            incoming_rx: Mutex::new(incoming_rx),
            closed: AtomicBool::new(false),
            shutdown: Notify::new(),
        });
        transport.register_data_handler(Arc::new(ServerDataHandler {
            server: Arc::downgrade(&inner),
        }))?;
        info!(account = %inner.account, "server listening");
        Ok(Self { inner })
    }

    /// Address prefix of this server
    #[must_use]
    pub fn account(&self) -> &str {
        &self.inner.account
    }

    /// Create credentials for a new client.
    ///
    /// Returns the destination address and shared secret to hand to the
    /// client. `tag` is carried in the address and reported by
    /// [`Connection::connection_tag`].
    ///
    /// # Errors
    ///
    /// Fails if `tag` contains characters outside `[A-Za-z0-9_~-]`.
    pub fn generate_address_and_secret(&self, tag: Option<&str>) -> Result<(String, [u8; 32]), ConnectionError> {
        let token = generate_token(tag)?;
        let shared_secret = derive_shared_secret(&self.inner.secret, token.as_bytes());
        Ok((format!("{}.{}", self.inner.account, token), shared_secret))
    }

    /// Wait for the next new connection.
    ///
    /// Returns `None` after [`Server::close`].
    pub async fn accept_connection(&self) -> Option<Connection> {
        let mut incoming = self.inner.incoming_rx.lock().await;
        let shutdown = self.inner.shutdown.notified();
        tokio::pin!(shutdown);
        shutdown.as_mut().enable();
        if self.inner.closed.load(Ordering::Acquire) {
            return incoming.try_recv().ok();
        }
        tokio::select! {
            connection = incoming.recv() => connection,
            () = shutdown => incoming.try_recv().ok(),
        }
    }

    /// Number of registered connections, including closed ones still in
    /// their grace period
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.inner.connections.len()
    }

    /// Stop accepting connections and close the open ones gracefully.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let connections: Vec<Connection> = self
            .inner
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for connection in connections {
            if let Err(err) = connection.end().await {
                debug!(connection = %connection.id(), %err, "connection did not close cleanly");
            }
        }
        self.inner.shutdown.notify_waiters();
        self.inner.connections.clear();
        self.inner.transport.deregister_data_handler();
        info!(account = %self.inner.account, "server closed");
    }
}
