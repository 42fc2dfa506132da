//! 帧分类性质测试
//!
//! 字符串消息的任何一帧都不会以 data discriminator 开头，二进制消息的每一帧都会；
//! 接收端据此把两类消息分开，不会互相串台。

use framelink_core::protocol::frame::{DATA_DISCRIMINATOR, Limits, encode_data, encode_string};
use framelink_core::protocol::{Inbound, Reassembler};
use proptest::prelude::*;

fn feed(frames: &[Vec<u8>]) -> Vec<Inbound> {
    let mut reassembler = Reassembler::new(1 << 20);
    frames.iter().filter_map(|f| reassembler.feed(f)).collect()
}

proptest! {
    #[test]
    fn test_strings_never_look_like_data(text in "\\PC{1,600}", max_string in 20usize..300) {
        let limits = Limits::from_max_string(max_string);
        let frames = encode_string(&text, limits);
        for frame in &frames {
            prop_assert_ne!(frame.first(), Some(&DATA_DISCRIMINATOR));
        }
        let inbound = feed(&frames);
        prop_assert_eq!(inbound.len(), 1);
        match &inbound[0] {
            Inbound::Text(Ok(received)) => prop_assert_eq!(received, &text),
            other => prop_assert!(false, "unexpected {:?}", other),
        }
    }

    #[test]
    fn test_data_never_looks_like_text(
        payload in proptest::collection::vec(any::<u8>(), 2..2000),
        max_string in 20usize..300,
    ) {
        let limits = Limits::from_max_string(max_string);
        let frames = encode_data(&payload, limits);
        for frame in &frames {
            prop_assert_eq!(frame.first(), Some(&DATA_DISCRIMINATOR));
            prop_assert!(frame.len() <= limits.max_string);
        }
        for inbound in feed(&frames) {
            prop_assert!(
                matches!(inbound, Inbound::Data { .. }),
                "expected a data message, got {:?}",
                inbound
            );
        }
    }

    #[test]
    fn test_control_bytes_in_text_survive(text in "[\\n\\x0b\\x01a-z]{1,400}") {
        let frames = encode_string(&text, Limits::from_max_string(64));
        let inbound = feed(&frames);
        prop_assert_eq!(inbound.len(), 1);
        prop_assert!(
            matches!(&inbound[0], Inbound::Text(Ok(t)) if t == &text),
            "text did not survive framing"
        );
    }
}
