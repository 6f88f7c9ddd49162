//! Byte-signature verification
//!
//! The sole gate against patching a mismatched host build: every hook that
//! mutates code verifies its expected original bytes first.

/// Position-wise comparison of `expected` against the start of `actual`.
/// An empty pattern never verifies.
pub fn expected_matches(actual: &[u8], expected: &[u8]) -> bool {
    !expected.is_empty()
        && actual.len() >= expected.len()
        && &actual[..expected.len()] == expected
}

/// Compares `expected.len()` bytes of host memory at `addr`.
///
/// # Safety
/// `addr` must be readable for at least `expected.len()` bytes.
#[cfg(all(windows, target_arch = "x86"))]
pub unsafe fn verify(addr: crate::manifest::Address, expected: &[u8]) -> bool {
    if expected.is_empty() {
        return false;
    }
    let actual = std::slice::from_raw_parts(addr as usize as *const u8, expected.len());
    expected_matches(actual, expected)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match() {
        assert!(expected_matches(&[0x8B, 0xEC, 0x83], &[0x8B, 0xEC, 0x83]));
    }

    #[test]
    fn test_prefix_match() {
        assert!(expected_matches(&[0x8B, 0xEC, 0x83, 0x90], &[0x8B, 0xEC]));
    }

    #[test]
    fn test_single_byte_difference_fails() {
        assert!(!expected_matches(&[0x8B, 0xEC, 0x83], &[0x8B, 0xED, 0x83]));
    }

    #[test]
    fn test_short_window_fails() {
        assert!(!expected_matches(&[0x8B], &[0x8B, 0xEC]));
    }

    #[test]
    fn test_empty_pattern_fails() {
        assert!(!expected_matches(&[0x8B, 0xEC], &[]));
    }
}
