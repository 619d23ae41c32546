//! Property-based tests for LSTREAM
//!
//! Uses proptest to verify invariants across large input spaces.

use proptest::prelude::*;

// ============================================================================
// Packet Properties
// ============================================================================

mod packet_properties {
    use super::*;
    use lstream_core::{ErrorCode, Frame, Packet};
    use lstream_crypto::StreamKeys;
    use lstream_transport::ledger::PacketType;

    fn frame_strategy() -> impl Strategy<Value = Frame> {
        prop_oneof![
            (any::<u64>(), any::<u64>())
                .prop_map(|(stream_id, shares)| Frame::StreamMoney { stream_id, shares }),
            (any::<u64>(), any::<u64>(), prop::collection::vec(any::<u8>(), 0..512))
                .prop_map(|(stream_id, offset, data)| Frame::StreamData { stream_id, offset, data }),
            (any::<u64>(), any::<u64>(), any::<u64>()).prop_map(|(stream_id, receive_max, total_received)| {
                Frame::StreamMaxMoney { stream_id, receive_max, total_received }
            }),
            (any::<u64>(), "[a-z ]{0,32}").prop_map(|(stream_id, message)| Frame::StreamClose {
                stream_id,
                code: ErrorCode::ApplicationError,
                message,
            }),
            "[a-z.]{1,40}".prop_map(|source_account| Frame::ConnectionNewAddress { source_account }),
            any::<u64>().prop_map(|max_stream_id| Frame::ConnectionMaxStreamId { max_stream_id }),
        ]
    }

    proptest! {
        /// Encrypted packets decrypt to the same frames
        #[test]
        fn encrypted_roundtrip(
            sequence in 1u64..(1 << 31),
            amount in any::<u64>(),
            frames in prop::collection::vec(frame_strategy(), 0..8),
            secret in any::<[u8; 32]>(),
        ) {
            let keys = StreamKeys::derive(&secret);
            let packet = Packet::new(sequence, PacketType::Prepare, amount, frames);
            let encrypted = packet.encrypt(&keys, None).unwrap();
            prop_assert_eq!(Packet::decrypt(&keys, &encrypted).unwrap(), packet);
        }

        /// Any flipped bit makes the ciphertext unreadable
        #[test]
        fn tampering_detected(
            frames in prop::collection::vec(frame_strategy(), 1..4),
            position in any::<prop::sample::Index>(),
            bit in 0u8..8,
        ) {
            let keys = StreamKeys::derive(&[3u8; 32]);
            let packet = Packet::new(1, PacketType::Prepare, 0, frames);
            let mut encrypted = packet.encrypt(&keys, None).unwrap();
            let index = position.index(encrypted.len());
            encrypted[index] ^= 1 << bit;
            prop_assert!(Packet::decrypt(&keys, &encrypted).is_err());
        }

        /// Padding hides the length of small packets
        #[test]
        fn padding_fixes_size(payload in prop::collection::vec(any::<u8>(), 0..400)) {
            let keys = StreamKeys::derive(&[5u8; 32]);
            let packet = Packet::new(
                9,
                PacketType::Prepare,
                0,
                vec![Frame::StreamData { stream_id: 1, offset: 0, data: payload }],
            );
            let encrypted = packet.encrypt(&keys, Some(1024)).unwrap();
            prop_assert_eq!(encrypted.len(), 1024);
            prop_assert_eq!(Packet::decrypt(&keys, &encrypted).unwrap(), packet);
        }
    }
}

// ============================================================================
// End-to-end Money Properties
// ============================================================================

mod money_properties {
    use super::*;
    use lstream_integration_tests::fixtures::{TwoParty, fast_config};
    use lstream_transport::PathConfig;
    use std::time::Duration;

    fn run<T>(future: impl std::future::Future<Output = T>) -> T {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(future)
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(12))]

        /// What the receiver credits is exactly what the sender saw delivered,
        /// never more than the path's conversion and never below the slippage
        /// bound.
        #[test]
        fn value_is_conserved(
            numerator in 1u64..10,
            denominator in 1u64..10,
            amount in 1_000u64..50_000,
            max_packet in prop::option::of(500u64..5_000),
        ) {
            let (sent, delivered, received) = run(async move {
                let mut path = PathConfig::default().with_exchange_rate(numerator, denominator);
                if let Some(max) = max_packet {
                    path = path.with_max_packet_amount(max);
                }
                let pair = TwoParty::with(path, PathConfig::default(), fast_config(), fast_config())
                    .await
                    .unwrap();
                pair.accept_money(u64::MAX);
                let stream = pair.client.create_stream().unwrap();
                stream.send_total(amount, Duration::from_secs(20)).await.unwrap();
                (
                    pair.client.total_sent(),
                    pair.client.total_delivered(),
                    pair.server_connection.total_received(),
                )
            });

            prop_assert_eq!(sent, amount);
            prop_assert_eq!(delivered, received);
            prop_assert!(u128::from(received) * u128::from(denominator) <= u128::from(amount) * u128::from(numerator));
            // 1% slippage on top of the probed rate, which is itself floored
            let lower = u128::from(amount) * u128::from(numerator) * 98 / (u128::from(denominator) * 100);
            prop_assert!(u128::from(received) >= lower.saturating_sub(10));
        }
    }
}
