//! Property tests for packet fragmentation
//!
//! Run with: cargo test --test test_fragmenter_props

use jacquard_core::transport::fragmenter::{decode_varint, encode_varint, Fragmenter, MAX_PACKET_SIZE};
use proptest::prelude::*;

proptest! {
    #[test]
    fn prop_roundtrip_any_packet(
        packet in prop::collection::vec(any::<u8>(), 0..=MAX_PACKET_SIZE),
        mtu in 23u16..=512,
    ) {
        let sender = Fragmenter::new(mtu).expect("fragmenter");
        let mut receiver = Fragmenter::new(mtu).expect("fragmenter");
        let fragments = sender.fragments(&packet).expect("fragments");

        let mut reassembled = None;
        for (index, fragment) in fragments.iter().enumerate() {
            prop_assert!(fragment.len() <= mtu as usize - 3);
            let result = receiver.add_fragment(fragment);
            if index + 1 < fragments.len() {
                prop_assert!(result.is_none());
            } else {
                reassembled = result;
            }
        }
        prop_assert_eq!(reassembled, Some(packet));
        prop_assert!(!receiver.is_assembling());
    }

    #[test]
    fn prop_receiver_recovers_after_lost_fragment(
        first in prop::collection::vec(any::<u8>(), 100..=MAX_PACKET_SIZE),
        second in prop::collection::vec(any::<u8>(), 0..=200),
        lost in 1usize..4,
    ) {
        let fragmenter = Fragmenter::new(23).expect("fragmenter");
        let mut receiver = Fragmenter::new(23).expect("fragmenter");

        // 100 bytes at the minimum MTU is always more than 4 fragments
        let mut broken = fragmenter.fragments(&first).expect("fragments");
        broken.remove(lost);
        for fragment in &broken {
            prop_assert!(receiver.add_fragment(fragment).is_none());
        }

        let intact = fragmenter.fragments(&second).expect("fragments");
        let packet = intact.iter().find_map(|fragment| receiver.add_fragment(fragment));
        prop_assert_eq!(packet, Some(second));
    }

    #[test]
    fn prop_varint_roundtrip(value in any::<u64>()) {
        let mut bytes = Vec::new();
        encode_varint(value, &mut bytes);
        prop_assert_eq!(decode_varint(&bytes), Some((value, bytes.len())));
    }
}

#[test]
fn test_oversized_packet_is_rejected() {
    let fragmenter = Fragmenter::new(185).expect("fragmenter");
    assert!(fragmenter.fragments(&vec![0u8; MAX_PACKET_SIZE + 1]).is_err());
}
