//! Deterministic sample key encoding.
//!
//! Every sample gets a fixed-width decimal key built from its shard id and its
//! ordinal within the shard:
//!
//! ```text
//! key = shard_id * 10^digits_per_shard + ordinal
//! ```
//!
//! zero-padded to `digits_per_shard + digits_shard_count` characters, so keys
//! sort lexicographically in (shard, ordinal) order and never collide as long
//! as `ordinal < 10^digits_per_shard` and `shard_id < 10^digits_shard_count`.
//!
//! # Example
//!
//! ```
//! use shardfetch::key::{compute_key, digits_for_capacity};
//!
//! let digits = digits_for_capacity(10_000);
//! assert_eq!(digits, 4);
//! assert_eq!(compute_key(42, 7, digits, 5), "000070042");
//! ```

/// Widest key whose numeric value always fits in a `u128`.
pub const MAX_KEY_DIGITS: u32 = 38;

/// Formats the global sample key for `ordinal` within shard `shard_id`.
///
/// Past `u128` range the key is built textually: shard id followed by the
/// ordinal padded to `digits_per_shard`, which is the same decimal string
/// whenever `ordinal < 10^digits_per_shard`.
#[must_use]
pub fn compute_key(
    ordinal: u64,
    shard_id: u64,
    digits_per_shard: u32,
    digits_shard_count: u32,
) -> String {
    let width = (digits_per_shard + digits_shard_count) as usize;
    let true_key = 10u128
        .checked_pow(digits_per_shard)
        .and_then(|scale| u128::from(shard_id).checked_mul(scale))
        .and_then(|base| base.checked_add(u128::from(ordinal)));
    match true_key {
        Some(true_key) => format!("{true_key:0width$}"),
        None => {
            let ordinal_width = digits_per_shard as usize;
            format!("{:0>width$}", format!("{shard_id}{ordinal:0ordinal_width$}"))
        }
    }
}

/// Number of decimal digits needed for ordinals of a shard holding `capacity`
/// items, i.e. `ceil(log10(capacity))`.
///
/// Computed with integers so exact powers of ten are not subject to float
/// rounding (`10_000` needs 4 digits, `10_001` needs 5).
#[must_use]
pub fn digits_for_capacity(capacity: u64) -> u32 {
    let mut digits = 0;
    let mut bound: u128 = 1;
    while bound < u128::from(capacity) {
        bound *= 10;
        digits += 1;
    }
    digits
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn test_compute_key_pads_to_total_width() {
        assert_eq!(compute_key(0, 0, 4, 5), "000000000");
        assert_eq!(compute_key(1, 0, 4, 5), "000000001");
        assert_eq!(compute_key(9999, 3, 4, 5), "000039999");
    }

    #[test]
    fn test_compute_key_length_is_exact_over_domain() {
        for digits_per_shard in 1..=3u32 {
            for digits_shard_count in 1..=3u32 {
                let max_ordinal = 10u64.pow(digits_per_shard) - 1;
                let max_shard = 10u64.pow(digits_shard_count) - 1;
                for (ordinal, shard) in [(0, 0), (max_ordinal, max_shard), (1, max_shard)] {
                    let key = compute_key(ordinal, shard, digits_per_shard, digits_shard_count);
                    assert_eq!(key.len(), (digits_per_shard + digits_shard_count) as usize);
                    assert!(key.chars().all(|c| c.is_ascii_digit()), "non-numeric key {key}");
                }
            }
        }
    }

    #[test]
    fn test_compute_key_is_injective_and_sortable() {
        let mut seen = HashSet::new();
        let mut previous = String::new();
        for shard in 0..10u64 {
            for ordinal in 0..100u64 {
                let key = compute_key(ordinal, shard, 2, 1);
                assert!(seen.insert(key.clone()), "duplicate key {key}");
                assert!(key > previous, "{key} should sort after {previous}");
                previous = key;
            }
        }
        assert_eq!(seen.len(), 1000);
    }

    #[test]
    fn test_digits_for_capacity() {
        assert_eq!(digits_for_capacity(1), 0);
        assert_eq!(digits_for_capacity(2), 1);
        assert_eq!(digits_for_capacity(10), 1);
        assert_eq!(digits_for_capacity(11), 2);
        assert_eq!(digits_for_capacity(10_000), 4);
        assert_eq!(digits_for_capacity(10_001), 5);
        assert_eq!(digits_for_capacity(u64::MAX), 20);
    }

    #[test]
    fn test_compute_key_beyond_u128_range() {
        let digits_per_shard = digits_for_capacity(u64::MAX);
        let key = compute_key(7, u64::MAX, digits_per_shard, 20);
        assert_eq!(key.len(), 40);
        assert_eq!(key, format!("{}{:020}", u64::MAX, 7));

        // the textual path agrees with the numeric one where both apply
        assert_eq!(compute_key(42, 7, 4, 5), "000070042");
        assert_eq!(compute_key(5, 123, 30, 8), format!("{:0>38}", format!("123{:030}", 5)));
    }
}
