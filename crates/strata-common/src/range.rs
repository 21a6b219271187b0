//! HTTP Range header parsing
//!
//! Accepts the three S3-supported forms `bytes=a-b`, `bytes=a-`, and
//! `bytes=-n`; anything else, or a range that falls outside the object,
//! is unsatisfiable (HTTP 416).

use crate::error::{Error, Result};

/// An inclusive byte range within an object
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    /// Inclusive end offset
    pub end: u64,
}

impl ByteRange {
    /// Number of bytes covered by the range
    #[must_use]
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        false // start <= end is an invariant of parse()
    }

    /// Format a `Content-Range` header value
    ///
    /// The complete length is reported as `*`: under replication the
    /// responding node is authoritative for the range but the gateway does
    /// not re-derive the full object size on the 206 path.
    #[must_use]
    pub fn content_range(&self) -> String {
        format!("bytes {}-{}/*", self.start, self.end)
    }
}

/// Parse a `Range` header against an object of `size` bytes
pub fn parse_range(spec: &str, size: u64) -> Result<ByteRange> {
    let spec = spec.trim();
    let Some(rest) = spec.strip_prefix("bytes=") else {
        return Err(Error::InvalidRange(spec.to_string()));
    };

    let mut parts = rest.splitn(2, '-');
    let (start_str, end_str) = match (parts.next(), parts.next()) {
        (Some(s), Some(e)) => (s.trim(), e.trim()),
        _ => return Err(Error::InvalidRange(spec.to_string())),
    };

    if size == 0 {
        return Err(Error::InvalidRange(spec.to_string()));
    }

    let (start, end) = if start_str.is_empty() {
        // "-n": the last n bytes
        if end_str.is_empty() {
            return Err(Error::InvalidRange(spec.to_string()));
        }
        let suffix: u64 = end_str
            .parse()
            .map_err(|_| Error::InvalidRange(spec.to_string()))?;
        if suffix == 0 {
            return Err(Error::InvalidRange(spec.to_string()));
        }
        (size.saturating_sub(suffix), size - 1)
    } else if end_str.is_empty() {
        // "a-": from a to the end
        let start: u64 = start_str
            .parse()
            .map_err(|_| Error::InvalidRange(spec.to_string()))?;
        (start, size - 1)
    } else {
        // "a-b"
        let start: u64 = start_str
            .parse()
            .map_err(|_| Error::InvalidRange(spec.to_string()))?;
        let end: u64 = end_str
            .parse()
            .map_err(|_| Error::InvalidRange(spec.to_string()))?;
        (start, end)
    };

    if start > end || end >= size {
        return Err(Error::InvalidRange(spec.to_string()));
    }

    Ok(ByteRange { start, end })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bounded() {
        let r = parse_range("bytes=2-5", 10).unwrap();
        assert_eq!(r, ByteRange { start: 2, end: 5 });
        assert_eq!(r.len(), 4);
    }

    #[test]
    fn test_parse_open_ended() {
        let r = parse_range("bytes=3-", 10).unwrap();
        assert_eq!(r, ByteRange { start: 3, end: 9 });
    }

    #[test]
    fn test_parse_suffix() {
        let r = parse_range("bytes=-4", 10).unwrap();
        assert_eq!(r, ByteRange { start: 6, end: 9 });

        // A suffix longer than the object covers the whole object
        let r = parse_range("bytes=-100", 10).unwrap();
        assert_eq!(r, ByteRange { start: 0, end: 9 });
    }

    #[test]
    fn test_parse_rejects_bad_forms() {
        assert!(parse_range("2-5", 10).is_err());
        assert!(parse_range("bytes=", 10).is_err());
        assert!(parse_range("bytes=-", 10).is_err());
        assert!(parse_range("bytes=a-b", 10).is_err());
        assert!(parse_range("bytes=5-2", 10).is_err());
    }

    #[test]
    fn test_parse_rejects_out_of_range() {
        assert!(parse_range("bytes=10-12", 10).is_err());
        assert!(parse_range("bytes=0-10", 10).is_err());
        assert!(parse_range("bytes=0-0", 0).is_err());
    }

    #[test]
    fn test_content_range_header() {
        let r = ByteRange { start: 2, end: 5 };
        assert_eq!(r.content_range(), "bytes 2-5/*");
    }
}
