//! End-to-end tests: a client and a server over an in-memory path.

use lstream_core::{
    Connection, ConnectionConfig, ConnectionError, ErrorCode, Ratio, Server, ServerConfig,
    StreamError, StreamEvent,
};
use lstream_crypto::verify_receipt;
use lstream_integration_tests::eventually;
use lstream_integration_tests::fixtures::{TwoParty, fast_config};
use lstream_transport::{MemoryTransport, PathConfig};
use std::sync::Arc;
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Money
// ============================================================================

#[tokio::test]
async fn test_payment_with_exchange_rate() {
    let pair = TwoParty::with(
        PathConfig::default().with_exchange_rate(1, 2),
        PathConfig::default().with_exchange_rate(2, 1),
        fast_config(),
        fast_config(),
    )
    .await
    .unwrap();
    pair.accept_money(u64::MAX);

    assert_eq!(pair.client.exchange_rate(), Some(Ratio::new(1, 2).unwrap()));

    let stream = pair.client.create_stream().unwrap();
    stream.send_total(1000, TIMEOUT).await.unwrap();

    assert_eq!(stream.total_sent(), 1000);
    assert!(
        eventually(TIMEOUT, || pair.server_connection.total_received() == 500).await,
        "server received {}",
        pair.server_connection.total_received()
    );
    assert_eq!(pair.client.total_delivered(), 500);
    assert_eq!(pair.client_transport.stats().amount_fulfilled, 1000);
}

#[tokio::test]
async fn test_receiver_limits_money() {
    let pair = TwoParty::new().await.unwrap();
    pair.accept_money(600);

    let stream = pair.client.create_stream().unwrap();
    let result = stream.send_total(1000, Duration::from_millis(500)).await;
    assert_eq!(result, Err(StreamError::Timeout));
    assert_eq!(stream.total_sent(), 600);
    assert_eq!(pair.server_connection.total_received(), 600);
}

#[tokio::test]
async fn test_receive_total_waits_for_money() {
    let pair = TwoParty::new().await.unwrap();
    let client_stream = pair.client.create_stream().unwrap();
    client_stream.set_send_max(2500).unwrap();

    let server_stream = tokio::time::timeout(TIMEOUT, pair.server_connection.accept_stream())
        .await
        .unwrap()
        .unwrap();
    let mut events = server_stream.subscribe();
    server_stream.receive_total(2500, TIMEOUT).await.unwrap();
    assert_eq!(server_stream.total_received(), 2500);

    let mut credited = 0;
    while let Ok(event) = events.try_recv() {
        if let StreamEvent::Money(amount) = event {
            credited += amount;
        }
    }
    assert_eq!(credited, 2500);
}

#[tokio::test]
async fn test_discovers_path_maximum() {
    let pair = TwoParty::with(
        PathConfig::default().with_max_packet_amount(1500),
        PathConfig::default(),
        fast_config(),
        fast_config(),
    )
    .await
    .unwrap();
    pair.accept_money(u64::MAX);

    let stream = pair.client.create_stream().unwrap();
    stream.send_total(10_000, TIMEOUT).await.unwrap();

    let stats = pair.client.stats();
    assert_eq!(stats.maximum_packet_amount, 1500);
    assert_eq!(stats.total_sent, 10_000);
    assert!(stats.packets_rejected >= 1);
}

#[tokio::test]
async fn test_recovers_from_temporary_errors() {
    let pair = TwoParty::new().await.unwrap();
    pair.accept_money(u64::MAX);
    pair.client_transport.inject_temporary_errors(3);

    let stream = pair.client.create_stream().unwrap();
    stream.send_total(5000, TIMEOUT).await.unwrap();
    assert_eq!(pair.server_connection.total_received(), 5000);
    assert!(pair.client.stats().packets_rejected >= 3);
}

#[tokio::test]
async fn test_receipts() {
    let receipt_secret = [9u8; 32];
    let pair = TwoParty::with(
        PathConfig::default(),
        PathConfig::default(),
        fast_config(),
        fast_config().with_receipts([1u8; 16], receipt_secret),
    )
    .await
    .unwrap();
    pair.accept_money(u64::MAX);

    let stream = pair.client.create_stream().unwrap();
    stream.send_total(3000, TIMEOUT).await.unwrap();

    let receipt = stream.receipt().expect("receipt attached to fulfill");
    let verified = verify_receipt(&receipt, &receipt_secret).unwrap();
    assert_eq!(verified.stream_id, stream.id());
    assert_eq!(verified.total_received, 3000);
    assert_eq!(verified.nonce, [1u8; 16]);
}

#[tokio::test]
async fn test_server_sends_money_to_client() {
    let pair = TwoParty::with(
        PathConfig::default(),
        PathConfig::default().with_exchange_rate(3, 1),
        fast_config(),
        fast_config(),
    )
    .await
    .unwrap();

    let client = pair.client.clone();
    tokio::spawn(async move {
        while let Some(stream) = client.accept_stream().await {
            let _ = stream.set_receive_max(u64::MAX);
        }
    });

    let stream = pair.server_connection.create_stream().unwrap();
    assert_eq!(stream.id() % 2, 0);
    stream.send_total(1000, TIMEOUT).await.unwrap();
    assert!(eventually(TIMEOUT, || pair.client.total_received() == 3000).await);
}

// ============================================================================
// Data
// ============================================================================

#[tokio::test]
async fn test_data_transfer_beyond_windows() {
    let pair = TwoParty::new().await.unwrap();
    let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();

    let stream = pair.client.create_stream().unwrap();
    stream.write(&payload).unwrap();
    stream.end().unwrap();

    let server_stream = tokio::time::timeout(TIMEOUT, pair.server_connection.accept_stream())
        .await
        .unwrap()
        .unwrap();
    let received = tokio::time::timeout(TIMEOUT, server_stream.read_to_end())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received.len(), payload.len());
    assert_eq!(received, payload);
}

#[tokio::test]
async fn test_data_in_both_directions() {
    let pair = TwoParty::new().await.unwrap();

    let client_stream = pair.client.create_stream().unwrap();
    client_stream.write(b"ping").unwrap();

    let server_stream = tokio::time::timeout(TIMEOUT, pair.server_connection.accept_stream())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(server_stream.read_data().await.unwrap(), b"ping");
    server_stream.write(b"pong").unwrap();
    server_stream.end().unwrap();

    let reply = tokio::time::timeout(TIMEOUT, client_stream.read_to_end())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, b"pong");
}

#[tokio::test]
async fn test_padded_packets() {
    let pair = TwoParty::with(
        PathConfig::default(),
        PathConfig::default(),
        fast_config().with_padding(2000),
        fast_config().with_padding(2000),
    )
    .await
    .unwrap();

    let stream = pair.client.create_stream().unwrap();
    stream.write(b"hidden length").unwrap();
    stream.end().unwrap();
    let server_stream = pair.server_connection.accept_stream().await.unwrap();
    let data = tokio::time::timeout(TIMEOUT, server_stream.read_to_end())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(data, b"hidden length");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writers_share_one_send_loop() {
    let pair = TwoParty::new().await.unwrap();

    let mut writers = Vec::new();
    for _ in 0..4 {
        let stream = pair.client.create_stream().unwrap();
        writers.push(tokio::spawn(async move {
            let chunk = vec![stream.id() as u8; 250];
            for _ in 0..40 {
                stream.write(&chunk).unwrap();
                tokio::task::yield_now().await;
            }
            stream.end().unwrap();
        }));
    }
    for writer in writers {
        writer.await.unwrap();
    }

    for _ in 0..4 {
        let stream = tokio::time::timeout(TIMEOUT, pair.server_connection.accept_stream())
            .await
            .unwrap()
            .unwrap();
        let received = tokio::time::timeout(TIMEOUT, stream.read_to_end())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.len(), 250 * 40);
        assert!(received.iter().all(|&byte| u64::from(byte) == stream.id()));
    }
}

#[tokio::test]
async fn test_write_from_plain_thread_is_sent() {
    let pair = TwoParty::new().await.unwrap();
    let stream = pair.client.create_stream().unwrap();

    let writer = stream.clone();
    std::thread::spawn(move || writer.write(b"from a plain thread"))
        .join()
        .unwrap()
        .unwrap();

    let server_stream = tokio::time::timeout(TIMEOUT, pair.server_connection.accept_stream())
        .await
        .unwrap()
        .unwrap();
    let received = tokio::time::timeout(TIMEOUT, server_stream.read_data())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, b"from a plain thread");
}

// ============================================================================
// Streams
// ============================================================================

#[tokio::test]
async fn test_stream_id_limit_and_release() {
    let pair = TwoParty::with(
        PathConfig::default(),
        PathConfig::default(),
        fast_config(),
        fast_config().with_max_remote_streams(2),
    )
    .await
    .unwrap();

    let first = pair.client.create_stream().unwrap();
    let second = pair.client.create_stream().unwrap();
    assert_eq!((first.id(), second.id()), (1, 3));
    assert!(matches!(
        pair.client.create_stream(),
        Err(ConnectionError::StreamIdsExhausted { remote_max: 4 })
    ));

    first.end().unwrap();
    assert!(
        eventually(TIMEOUT, || pair.client.create_stream().is_ok()).await,
        "closing a stream should free a stream id"
    );
}

#[tokio::test]
async fn test_stream_destroy_reaches_peer() {
    let pair = TwoParty::new().await.unwrap();
    let stream = pair.client.create_stream().unwrap();
    stream.write(b"x").unwrap();

    let server_stream = pair.server_connection.accept_stream().await.unwrap();
    let mut events = server_stream.subscribe();
    stream.destroy(Some("changed my mind".to_string())).unwrap();

    let error = tokio::time::timeout(TIMEOUT, async {
        loop {
            match events.recv().await {
                Ok(StreamEvent::Error(err)) => return err,
                Ok(_) => continue,
                Err(err) => panic!("event channel closed: {err}"),
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(
        error,
        StreamError::Reset {
            code: ErrorCode::ApplicationError,
            message: "changed my mind".to_string(),
        }
    );
}

// ============================================================================
// Connection lifecycle
// ============================================================================

#[tokio::test]
async fn test_handshake_exchanges_details() {
    let pair = TwoParty::with(
        PathConfig::default(),
        PathConfig::default(),
        fast_config().with_asset("USD", 2),
        fast_config().with_asset("EUR", 6),
    )
    .await
    .unwrap();

    assert!(pair.client.is_connected());
    let server_asset = pair.client.destination_asset().unwrap();
    assert_eq!((server_asset.code.as_str(), server_asset.scale), ("EUR", 6));
    let client_asset = pair.server_connection.destination_asset().unwrap();
    assert_eq!((client_asset.code.as_str(), client_asset.scale), ("USD", 2));
    assert_eq!(pair.server_connection.destination_account().as_deref(), Some("test.client"));
    assert_eq!(pair.server.connection_count(), 1);
}

#[tokio::test]
async fn test_graceful_end_closes_both_sides() {
    let pair = TwoParty::new().await.unwrap();
    pair.accept_money(u64::MAX);
    let stream = pair.client.create_stream().unwrap();
    stream.set_send_max(4000).unwrap();

    pair.client.end().await.unwrap();
    assert!(pair.client.is_closed());
    assert_eq!(stream.total_sent(), 4000);
    assert!(eventually(TIMEOUT, || pair.server_connection.is_closed()).await);
    assert!(pair.server_connection.error().is_none());
}

#[tokio::test]
async fn test_destroy_reports_error_to_peer() {
    let pair = TwoParty::new().await.unwrap();
    pair.client
        .destroy(Some(ConnectionError::Destroyed("shutting down".to_string())));
    assert!(pair.client.is_closed());
    assert!(eventually(TIMEOUT, || pair.server_connection.is_closed()).await);
    assert!(matches!(
        pair.server_connection.error(),
        Some(ConnectionError::RemoteClosed {
            code: ErrorCode::ApplicationError,
            ..
        })
    ));
}

#[tokio::test]
async fn test_wrong_secret_fails_to_connect() {
    lstream_integration_tests::init_tracing();
    let (client_transport, server_transport) = MemoryTransport::pair();
    let server = Server::listen(Arc::new(server_transport), ServerConfig::new("test.server"))
        .await
        .unwrap();
    let (address, _) = server.generate_address_and_secret(Some("invoice-42")).unwrap();

    let result = Connection::connect(
        Arc::new(client_transport),
        address,
        &[0u8; 32],
        ConnectionConfig::default(),
    )
    .await;
    assert!(matches!(result, Err(ConnectionError::ConnectFailed(_))));
    assert_eq!(server.connection_count(), 0);
}

#[tokio::test]
async fn test_connection_tag() {
    lstream_integration_tests::init_tracing();
    let (client_transport, server_transport) = MemoryTransport::pair();
    let server = Server::listen(Arc::new(server_transport), ServerConfig::new("test.server"))
        .await
        .unwrap();
    assert!(server.generate_address_and_secret(Some("bad tag!")).is_err());
    let (address, secret) = server.generate_address_and_secret(Some("order_7")).unwrap();

    let _client = Connection::connect(Arc::new(client_transport), address, &secret, fast_config())
        .await
        .unwrap();
    let accepted = server.accept_connection().await.unwrap();
    assert_eq!(accepted.connection_tag(), Some("order_7"));
}

#[tokio::test]
async fn test_rate_probe_fails_without_value() {
    let result = TwoParty::with(
        PathConfig::default().with_exchange_rate(0, 1),
        PathConfig::default(),
        fast_config(),
        fast_config(),
    )
    .await;
    assert!(matches!(result, Err(ConnectionError::ExchangeRateUnavailable(_))));
}

#[tokio::test]
async fn test_idle_timeout() {
    let pair = TwoParty::with(
        PathConfig::default(),
        PathConfig::default(),
        fast_config().with_idle_timeout(Duration::from_millis(200)),
        fast_config(),
    )
    .await
    .unwrap();
    assert!(eventually(TIMEOUT, || pair.client.is_closed()).await);
    assert!(matches!(pair.client.error(), Some(ConnectionError::IdleTimeout)));
}

#[tokio::test]
async fn test_closed_connections_are_evicted_after_grace() {
    lstream_integration_tests::init_tracing();
    let (client_transport, server_transport) = MemoryTransport::pair();
    let server = Server::listen(
        Arc::new(server_transport),
        ServerConfig::new("test.server")
            .with_connection_config(fast_config())
            .with_closed_connection_grace(Duration::from_millis(100)),
    )
    .await
    .unwrap();
    let (address, secret) = server.generate_address_and_secret(None).unwrap();
    let client = Connection::connect(Arc::new(client_transport), address, &secret, fast_config())
        .await
        .unwrap();
    let accepted = server.accept_connection().await.unwrap();
    assert_eq!(server.connection_count(), 1);

    client.end().await.unwrap();
    assert!(eventually(TIMEOUT, || accepted.is_closed()).await);
    // still registered right after closing
    assert_eq!(server.connection_count(), 1);
    assert!(eventually(TIMEOUT, || server.connection_count() == 0).await);
}

#[tokio::test]
async fn test_server_close_ends_connections() {
    let pair = TwoParty::new().await.unwrap();
    pair.server.close().await;
    assert!(pair.server_connection.is_closed());
    assert!(pair.server.accept_connection().await.is_none());
    assert!(eventually(TIMEOUT, || pair.client.is_closed()).await);
}
