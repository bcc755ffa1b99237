//! Reserve-capacity percentage arithmetic
//!
//! Percentages are whole numbers of the base volume size, rounded half up,
//! which is how the reserve percentage of an existing chain is reported.

/// Percentage of `base_bytes` that `bytes` represents, rounded half up
pub fn percent_of(bytes: u64, base_bytes: u64) -> u32 {
    if base_bytes == 0 {
        return 0;
    }
    let scaled = (bytes as u128) * 100 + (base_bytes as u128) / 2;
    u32::try_from(scaled / base_bytes as u128).unwrap_or(u32::MAX)
}

/// Bytes corresponding to `pct` percent of `base_bytes` (truncated)
pub fn bytes_for_percent(pct: u32, base_bytes: u64) -> u64 {
    let bytes = (base_bytes as u128) * (pct as u128) / 100;
    u64::try_from(bytes).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const GIB: u64 = 1024 * 1024 * 1024;

    #[test]
    fn test_percent_rounding() {
        assert_eq!(percent_of(20 * GIB, 100 * GIB), 20);
        assert_eq!(percent_of(205, 1000), 21);
        assert_eq!(percent_of(204, 1000), 20);
        assert_eq!(percent_of(10, 0), 0);
    }

    #[test]
    fn test_bytes_for_percent() {
        assert_eq!(bytes_for_percent(20, 100 * GIB), 20 * GIB);
        assert_eq!(bytes_for_percent(0, 100 * GIB), 0);
    }

    proptest! {
        #[test]
        fn prop_percent_of_bytes_for_percent(pct in 0u32..=500, base in 200u64..(1u64 << 50)) {
            let bytes = bytes_for_percent(pct, base);
            prop_assert_eq!(percent_of(bytes, base), pct);
        }
    }
}
