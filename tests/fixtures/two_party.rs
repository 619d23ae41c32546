//! A client and a server connected through an in-memory path.
//!
//! # Example
//!
//! ```no_run
//! use lstream_integration_tests::fixtures::TwoParty;
//!
//! # async fn example() {
//! let pair = TwoParty::new().await.unwrap();
//! pair.accept_money(u64::MAX);
//! let stream = pair.client.create_stream().unwrap();
//! # }
//! ```

use lstream_core::{Connection, ConnectionConfig, ConnectionError, Server, ServerConfig};
use lstream_transport::{MemoryTransport, PathConfig};
use std::sync::Arc;
use std::time::Duration;

/// Server account used by every fixture
pub const SERVER_ACCOUNT: &str = "test.server";

/// Client account used by every fixture
pub const CLIENT_ACCOUNT: &str = "test.client";

/// A connected client and server
pub struct TwoParty {
    /// Listening server
    pub server: Server,
    /// Client side of the connection
    pub client: Connection,
    /// Server side of the connection
    pub server_connection: Connection,
    /// Client's transport, for stats and fault injection
    pub client_transport: MemoryTransport,
    /// Server's transport
    pub server_transport: MemoryTransport,
}

impl TwoParty {
    /// Connect over a 1:1 path with default configuration.
    pub async fn new() -> Result<Self, ConnectionError> {
        Self::with(
            PathConfig::default(),
            PathConfig::default(),
            fast_config(),
            fast_config(),
        )
        .await
    }

    /// Connect with explicit path and connection configuration.
    pub async fn with(
        to_server: PathConfig,
        to_client: PathConfig,
        client_config: ConnectionConfig,
        server_config: ConnectionConfig,
    ) -> Result<Self, ConnectionError> {
        crate::init_tracing();
        let (client_transport, server_transport) = MemoryTransport::pair_with(to_server, to_client);
        let server = Server::listen(
            Arc::new(server_transport.clone()),
            ServerConfig::new(SERVER_ACCOUNT).with_connection_config(server_config),
        )
        .await?;
        let (address, secret) = server.generate_address_and_secret(None)?;
        let client = Connection::connect(
            Arc::new(client_transport.clone()),
            address,
            &secret,
            client_config.with_source_account(CLIENT_ACCOUNT),
        )
        .await?;
        let server_connection = tokio::time::timeout(Duration::from_secs(5), server.accept_connection())
            .await
            .ok()
            .flatten()
            .ok_or_else(|| ConnectionError::ConnectFailed("server did not accept".to_string()))?;
        Ok(Self {
            server,
            client,
            server_connection,
            client_transport,
            server_transport,
        })
    }

    /// Accept every stream the client opens with the given receive limit.
    pub fn accept_money(&self, receive_max: u64) {
        let connection = self.server_connection.clone();
        tokio::spawn(async move {
            while let Some(stream) = connection.accept_stream().await {
                let _ = stream.set_receive_max(receive_max);
            }
        });
    }
}

/// Defaults with short retry delays.
#[must_use]
pub fn fast_config() -> ConnectionConfig {
    ConnectionConfig::default()
        .with_retry_delays(Duration::from_millis(5), Duration::from_millis(50))
        .with_packet_timeout(Duration::from_secs(5))
}
