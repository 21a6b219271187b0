//! Request parsing helpers shared by both roles

use std::collections::HashMap;

/// Split `/{bucket}/{key...}` into its decoded parts
///
/// The key may itself contain `/`; the bucket is the first segment only.
#[must_use]
pub fn split_object_path(path: &str) -> (String, String) {
    let path = path.trim_start_matches('/');
    match path.split_once('/') {
        Some((bucket, key)) => (decode_component(bucket), decode_component(key)),
        None => (decode_component(path), String::new()),
    }
}

/// Parse a raw query string into decoded key/value pairs
///
/// Bare keys (`?uploads`) map to an empty value so presence checks work.
#[must_use]
pub fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (decode_query_component(k), decode_query_component(v)),
            None => (decode_query_component(pair), String::new()),
        })
        .collect()
}

/// URL-decode a path component; undecodable bytes pass through lossily
fn decode_component(s: &str) -> String {
    urlencoding::decode(s)
        .map(|decoded| decoded.into_owned())
        .unwrap_or_else(|_| {
            String::from_utf8_lossy(&urlencoding::decode_binary(s.as_bytes())).into_owned()
        })
}

/// Query components additionally treat `+` as a space
fn decode_query_component(s: &str) -> String {
    decode_component(&s.replace('+', " "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_object_path() {
        assert_eq!(
            split_object_path("/bucket/a/b/c"),
            ("bucket".to_string(), "a/b/c".to_string())
        );
        assert_eq!(
            split_object_path("/bucket"),
            ("bucket".to_string(), String::new())
        );
        assert_eq!(split_object_path("/"), (String::new(), String::new()));
    }

    #[test]
    fn test_split_decodes_escapes_but_not_plus() {
        assert_eq!(
            split_object_path("/b/hello%20world+x"),
            ("b".to_string(), "hello world+x".to_string())
        );
    }

    #[test]
    fn test_parse_query() {
        let q = parse_query("uploads&partNumber=3&prefix=a%2Fb&name=hello+world");
        assert_eq!(q.get("uploads").map(String::as_str), Some(""));
        assert_eq!(q.get("partNumber").map(String::as_str), Some("3"));
        assert_eq!(q.get("prefix").map(String::as_str), Some("a/b"));
        assert_eq!(q.get("name").map(String::as_str), Some("hello world"));
        assert!(!q.contains_key("missing"));
    }

    #[test]
    fn test_encoded_plus_survives_query_decoding() {
        // %2B decodes to a literal plus; only a raw '+' is a space
        let q = parse_query("marker=a%2Bb");
        assert_eq!(q.get("marker").map(String::as_str), Some("a+b"));
    }
}
