//! Property-based tests for the key/value line codec and config overrides.

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use crate::config::{CliOverrides, Config};
    use crate::kv::{format_line, parse_line, slice_value, KvLine, ValueAssembler};

    // Any value survives slicing and reassembly, and every slice but the last
    // is exactly the slice size.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn test_slice_reassemble_round_trip(
            value in "[A-Za-z0-9+/=]{0,300}",
            slice_size in 1usize..64
        ) {
            let slices = slice_value(&value, slice_size).unwrap();
            let (last, full) = slices.split_last().unwrap();
            prop_assert!(last.len() < slice_size);
            prop_assert!(full.iter().all(|s| s.len() == slice_size));

            let mut assembler = ValueAssembler::new(slice_size).unwrap();
            let mut complete = Vec::new();
            for slice in &slices {
                let line = parse_line(&format_line("key", slice)).unwrap();
                if let Some(done) = assembler.push(line).unwrap() {
                    complete.push(done);
                }
            }
            prop_assert_eq!(complete, vec![KvLine::new("key", value)]);
        }

        #[test]
        fn test_line_round_trip(
            key in "[A-Za-z]{1,32}",
            value in "[A-Za-z0-9+/= ;]{0,64}"
        ) {
            let line = format_line(&key, &value);
            let parsed = parse_line(&line).unwrap();
            prop_assert_eq!(parsed.key, key);
            prop_assert_eq!(parsed.value, value);
        }

        #[test]
        fn test_overrides_take_precedence(
            slice_size in 1usize..1000,
            timeout in 1u64..3600
        ) {
            let overrides = CliOverrides {
                slice_size: Some(slice_size),
                timeout_seconds: Some(timeout),
                ..Default::default()
            };
            let config = Config::default().with_overrides(&overrides);
            prop_assert_eq!(config.transport.slice_size, slice_size);
            prop_assert_eq!(config.transport.timeout_seconds, timeout);
            prop_assert!(config.validate().is_ok());
        }
    }
}
