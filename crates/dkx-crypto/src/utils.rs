//! Constant-time comparison helpers.
//!
//! Used wherever key bytes, echoed handshake messages or recovered plaintext
//! are compared against an expected value.

use constant_time_eq::constant_time_eq;

/// Compare two byte slices in constant time.
///
/// Slices of different length compare unequal.
///
/// ```rust
/// use dkx_crypto::utils::constant_time_compare;
///
/// assert!(constant_time_compare(b"nonce", b"nonce"));
/// assert!(!constant_time_compare(b"nonce", b"nonsE"));
/// ```
pub fn constant_time_compare(a: &[u8], b: &[u8]) -> bool {
    constant_time_eq(a, b)
}

/// Compare two fixed-size arrays in constant time.
pub fn constant_time_compare_array<const N: usize>(a: &[u8; N], b: &[u8; N]) -> bool {
    constant_time_eq(a, b)
}
