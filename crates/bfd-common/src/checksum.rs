//! MD5 helpers for verifying extract downloads
//!
//! The CCW export attaches an MD5 digest to every object it uploads, so that
//! is the only digest the download path checks.

use crate::error::{BfdError, Result};

/// Lowercase hex MD5 of `bytes`
pub fn md5_hex(bytes: &[u8]) -> String {
    format!("{:x}", md5::compute(bytes))
}

/// Compare `bytes` against an expected hex MD5. Hex case is ignored.
pub fn verify_md5(bytes: &[u8], expected: &str) -> Result<()> {
    let actual = md5_hex(bytes);
    if actual.eq_ignore_ascii_case(expected.trim()) {
        Ok(())
    } else {
        Err(BfdError::ChecksumMismatch {
            expected: expected.to_string(),
            actual,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_md5_known_value() {
        assert_eq!(md5_hex(b"hello world"), "5eb63bbbe01eeed093cb22bb8f5acdc3");
    }

    #[test]
    fn test_verify_ignores_case_and_padding() {
        assert!(verify_md5(b"hello world", " 5EB63BBBE01EEED093CB22BB8F5ACDC3\n").is_ok());
    }

    #[test]
    fn test_verify_reports_mismatch() {
        let err = verify_md5(b"hello world!", "5eb63bbbe01eeed093cb22bb8f5acdc3").unwrap_err();
        match err {
            BfdError::ChecksumMismatch { expected, actual } => {
                assert_eq!(expected, "5eb63bbbe01eeed093cb22bb8f5acdc3");
                assert_ne!(actual, expected);
            },
            other => panic!("unexpected error: {other}"),
        }
    }
}
