//! Property-based tests over the codec and timing layers.

use proptest::prelude::*;

// ============================================================================
// Command codec properties
// ============================================================================

mod command_properties {
    use super::*;
    use parley_transport::Command;

    proptest! {
        /// Any argument value survives escaping, including separators.
        #[test]
        fn command_roundtrip(
            name in "[a-z][a-z0-9_]{0,15}",
            keys in prop::collection::vec("[a-z][a-z0-9_]{0,11}", 0..6),
            values in prop::collection::vec(any::<String>(), 0..6),
        ) {
            let mut command = Command::new(name.clone());
            for (key, value) in keys.iter().zip(&values) {
                command = command.arg(key.clone(), value.clone());
            }
            let encoded = command.encode();

            let parsed = Command::parse(&encoded).expect("own encoding must parse");
            prop_assert_eq!(&parsed.name, &name);
            for (key, value) in keys.iter().zip(&values) {
                prop_assert_eq!(parsed.get(key), Some(value.as_str()));
            }
        }

        /// Escaping never emits the raw separators.
        #[test]
        fn escaped_value_has_no_separators(value in any::<String>()) {
            let escaped = parley_transport::command::escape(&value);
            prop_assert!(!escaped.contains(' '));
            prop_assert!(!escaped.contains('|'));
            prop_assert_eq!(parley_transport::command::unescape(&escaped), Some(value));
        }
    }
}

// ============================================================================
// Compression properties
// ============================================================================

mod compression_properties {
    use super::*;
    use parley_core::quickerlz;

    proptest! {
        /// Decompression inverts compression for any input.
        #[test]
        fn compress_roundtrip(data in prop::collection::vec(any::<u8>(), 0..2048)) {
            let compressed = quickerlz::compress(&data);
            let restored = quickerlz::decompress(&compressed, 1 << 20)
                .expect("own output must decompress");
            prop_assert_eq!(restored, data);
        }

        /// The size cap is honored no matter the input.
        #[test]
        fn decompress_respects_cap(data in prop::collection::vec(any::<u8>(), 64..512)) {
            let compressed = quickerlz::compress(&data);
            if data.len() > 16 {
                prop_assert!(quickerlz::decompress(&compressed, 16).is_err());
            }
        }
    }
}

// ============================================================================
// Timing properties
// ============================================================================

mod timing_properties {
    use super::*;
    use parley_transport::{RtoEstimator, CLOCK_GRANULARITY, MAX_RETRY_INTERVAL};
    use std::time::Duration;

    proptest! {
        /// After any sample sequence the timeout stays in protocol bounds.
        #[test]
        fn rto_stays_bounded(samples in prop::collection::vec(1u64..3000, 1..40)) {
            let mut estimator = RtoEstimator::new();
            for millis in samples {
                estimator.sample(Duration::from_millis(millis));
                let rto = estimator.rto();
                prop_assert!(rto >= CLOCK_GRANULARITY);
                prop_assert!(rto <= MAX_RETRY_INTERVAL);
            }
        }
    }
}

// ============================================================================
// Window properties
// ============================================================================

mod window_properties {
    use super::*;
    use parley_core::GenerationWindow;

    proptest! {
        /// Dragging to a value makes that value and everything at or
        /// below it stale.
        #[test]
        fn drag_makes_past_stale(values in prop::collection::vec(any::<u16>(), 1..32)) {
            let mut window = GenerationWindow::new(128);
            for v in values {
                if window.is_in_window(v) {
                    prop_assert!(window.set_and_drag(v));
                    prop_assert!(!window.set_and_drag(v), "replay must be stale");
                } else {
                    prop_assert!(!window.set_and_drag(v));
                }
            }
        }
    }
}
