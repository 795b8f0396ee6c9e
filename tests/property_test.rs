// tests/property_test.rs

//! Property-based tests for the frame codec, the acknowledgment window and
//! the matcher, verifying invariants that must hold for arbitrary inputs.

use bytes::BytesMut;
use logbus::core::flow::AckWindow;
use logbus::core::protocol::{Document, Frame, FrameCodec, FrameType, matches_document};
use proptest::prelude::*;
use serde_json::Value;
use tokio_util::codec::{Decoder, Encoder};

fn arb_document() -> impl Strategy<Value = Document> {
    prop::collection::btree_map("[a-zA-Z][a-zA-Z0-9_]{0,12}", arb_scalar(), 0..6)
        .prop_map(|m| m.into_iter().map(|(k, v)| (k, v)).collect())
}

fn arb_scalar() -> impl Strategy<Value = Value> {
    prop_oneof![
        any::<i64>().prop_map(Value::from),
        any::<bool>().prop_map(Value::from),
        "[ -~]{0,24}".prop_map(Value::from),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 128,
        ..ProptestConfig::default()
    })]

    /// A decoder fed an encoded frame one byte at a time must report "need
    /// more data" at every prefix and produce the frame exactly once, with
    /// an empty buffer left over.
    #[test]
    fn codec_never_decodes_a_partial_frame(body in arb_document()) {
        let frame = Frame::new(FrameType::Publish, body);
        let mut encoded = BytesMut::new();
        FrameCodec.encode(frame.clone(), &mut encoded).unwrap();

        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        let total = encoded.len();
        for (i, byte) in encoded.iter().enumerate() {
            buf.extend_from_slice(&[*byte]);
            let decoded = codec.decode(&mut buf).unwrap();
            if i + 1 < total {
                prop_assert!(decoded.is_none(), "decoded early at byte {}", i + 1);
            } else {
                let decoded = decoded.expect("full frame did not decode");
                prop_assert_eq!(decoded.frame_type, frame.frame_type);
                prop_assert_eq!(&decoded.body, &frame.body);
            }
        }
        prop_assert!(buf.is_empty());
    }

    /// Decoding a stream of concatenated frames yields each frame in order.
    #[test]
    fn codec_splits_concatenated_frames(bodies in prop::collection::vec(arb_document(), 1..5)) {
        let mut buf = BytesMut::new();
        for body in &bodies {
            FrameCodec.encode(Frame::new(FrameType::Publish, body.clone()), &mut buf).unwrap();
        }

        let mut codec = FrameCodec;
        for body in &bodies {
            let decoded = codec.decode(&mut buf).unwrap().expect("frame missing");
            prop_assert_eq!(&decoded.body, body);
        }
        prop_assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    /// The unacknowledged count tracks a saturating model for any op order.
    #[test]
    fn ack_window_matches_saturating_model(ops in prop::collection::vec(
        (any::<bool>(), 0u64..1_000_000),
        0..64
    )) {
        let window = AckWindow::new(1024);
        let mut model: u64 = 0;
        for (is_add, bytes) in ops {
            if is_add {
                window.add(bytes);
                model += bytes;
            } else {
                window.ack(bytes);
                model = model.saturating_sub(bytes);
            }
            prop_assert_eq!(window.unacked(), model);
            prop_assert_eq!(window.has_capacity(), model < 1024);
        }
    }

    /// A matcher built from any subset of a document's fields matches it.
    #[test]
    fn matcher_subset_always_matches(doc in arb_document(), mask in any::<u8>()) {
        let matcher: Document = doc
            .iter()
            .enumerate()
            .filter(|(i, _)| mask & (1 << (i % 8)) != 0)
            .map(|(_, (k, v))| (k.clone(), v.clone()))
            .collect();
        prop_assert!(matches_document(&matcher, &doc));
    }

    /// A matcher requiring a field the document lacks never matches.
    #[test]
    fn matcher_with_absent_field_never_matches(doc in arb_document(), value in arb_scalar()) {
        let mut matcher = Document::new();
        // The key space above never produces a leading underscore.
        matcher.insert("_absent".into(), value);
        prop_assert!(!matches_document(&matcher, &doc));
    }
}
