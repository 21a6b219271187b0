//! ETag helpers
//!
//! S3 ETags are quoted lowercase hex MD5 digests for whole-object puts, and
//! `"<hex>-<count>"` for multipart objects, where the hex is the MD5 over
//! the concatenation of the raw 16-byte part digests in part-number order.

use md5::{Digest, Md5};

/// Compute the quoted ETag for a payload
#[must_use]
pub fn etag_of(data: &[u8]) -> String {
    quote(&hex::encode(Md5::digest(data)))
}

/// Quote a hex digest in the S3 ETag form
#[must_use]
pub fn quote(hex_digest: &str) -> String {
    format!("\"{hex_digest}\"")
}

/// Strip surrounding quotes from an ETag, if present
#[must_use]
pub fn unquote(etag: &str) -> &str {
    etag.trim_matches('"')
}

/// Compute the S3 composite ETag from raw part digests
///
/// The digest input is the concatenation of the raw (not hex) 16-byte MD5s
/// of the parts, in part-number order.
#[must_use]
pub fn composite_etag(part_digests: &[[u8; 16]]) -> String {
    let mut combined = Md5::new();
    for digest in part_digests {
        combined.update(digest);
    }
    quote(&format!(
        "{}-{}",
        hex::encode(combined.finalize()),
        part_digests.len()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_etag_of_known_value() {
        // md5("hello") = 5d41402abc4b2a76b9719d911017c592
        assert_eq!(etag_of(b"hello"), "\"5d41402abc4b2a76b9719d911017c592\"");
    }

    #[test]
    fn test_quote_unquote() {
        assert_eq!(quote("abc"), "\"abc\"");
        assert_eq!(unquote("\"abc\""), "abc");
        assert_eq!(unquote("abc"), "abc");
    }

    #[test]
    fn test_composite_etag_form() {
        let d1: [u8; 16] = md5::Md5::digest(b"part one").into();
        let d2: [u8; 16] = md5::Md5::digest(b"part two").into();
        let etag = composite_etag(&[d1, d2]);
        assert!(etag.starts_with('"') && etag.ends_with("-2\""));

        let mut combined = md5::Md5::new();
        combined.update(d1);
        combined.update(d2);
        let expected = format!("\"{}-2\"", hex::encode(combined.finalize()));
        assert_eq!(etag, expected);
    }
}
