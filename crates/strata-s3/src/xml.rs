//! S3 XML document types
//!
//! Serialized with quick-xml's serde support. Field renames are part of the
//! S3 wire contract.

use serde::{Deserialize, Serialize};
use strata_common::{Error, Result};

/// `GET /<bucket>?list-type=2` response document
#[derive(Debug, Serialize)]
#[serde(rename = "ListBucketResult")]
pub struct ListBucketResult {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Prefix", skip_serializing_if = "String::is_empty")]
    pub prefix: String,
    #[serde(rename = "Delimiter", skip_serializing_if = "String::is_empty")]
    pub delimiter: String,
    #[serde(rename = "MaxKeys")]
    pub max_keys: usize,
    #[serde(rename = "IsTruncated")]
    pub is_truncated: bool,
    #[serde(rename = "KeyCount")]
    pub key_count: usize,
    #[serde(rename = "Contents")]
    pub contents: Vec<Contents>,
    #[serde(rename = "CommonPrefixes", skip_serializing_if = "Vec::is_empty")]
    pub common_prefixes: Vec<CommonPrefix>,
    #[serde(rename = "ContinuationToken", skip_serializing_if = "String::is_empty")]
    pub continuation_token: String,
    #[serde(
        rename = "NextContinuationToken",
        skip_serializing_if = "String::is_empty"
    )]
    pub next_continuation_token: String,
    #[serde(rename = "StartAfter", skip_serializing_if = "String::is_empty")]
    pub start_after: String,
}

#[derive(Debug, Serialize)]
pub struct Contents {
    #[serde(rename = "Key")]
    pub key: String,
    #[serde(rename = "LastModified")]
    pub last_modified: String,
    #[serde(rename = "ETag")]
    pub etag: String,
    #[serde(rename = "Size")]
    pub size: u64,
    #[serde(rename = "StorageClass")]
    pub storage_class: String,
}

#[derive(Debug, Serialize)]
pub struct CommonPrefix {
    #[serde(rename = "Prefix")]
    pub prefix: String,
}

/// `POST /<bucket>/<key>?uploads` response document
#[derive(Debug, Serialize)]
#[serde(rename = "InitiateMultipartUploadResult")]
pub struct InitiateMultipartUploadResult {
    #[serde(rename = "Bucket")]
    pub bucket: String,
    #[serde(rename = "Key")]
    pub key: String,
    #[serde(rename = "UploadId")]
    pub upload_id: String,
}

/// `POST /<bucket>/<key>?uploadId=` request document
#[derive(Debug, Deserialize)]
#[serde(rename = "CompleteMultipartUpload")]
pub struct CompleteMultipartUpload {
    #[serde(rename = "Part", default)]
    pub parts: Vec<CompletePart>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CompletePart {
    #[serde(rename = "PartNumber")]
    pub part_number: u32,
    #[serde(rename = "ETag")]
    pub etag: String,
}

/// `POST /<bucket>/<key>?uploadId=` response document
#[derive(Debug, Serialize)]
#[serde(rename = "CompleteMultipartUploadResult")]
pub struct CompleteMultipartUploadResult {
    #[serde(rename = "Location")]
    pub location: String,
    #[serde(rename = "Bucket")]
    pub bucket: String,
    #[serde(rename = "Key")]
    pub key: String,
    #[serde(rename = "ETag")]
    pub etag: String,
}

/// Serialize a document with the XML declaration prepended
pub fn to_xml<T: Serialize>(doc: &T) -> Result<String> {
    let body = quick_xml::se::to_string(doc)
        .map_err(|e| Error::Serialization(format!("xml encode: {e}")))?;
    Ok(format!("<?xml version=\"1.0\" encoding=\"UTF-8\"?>{body}"))
}

/// Parse a CompleteMultipartUpload request body
pub fn parse_complete_multipart(body: &[u8]) -> Result<CompleteMultipartUpload> {
    let text = std::str::from_utf8(body).map_err(|e| Error::MalformedXml(e.to_string()))?;
    quick_xml::de::from_str(text).map_err(|e| Error::MalformedXml(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_bucket_result_serializes() {
        let doc = ListBucketResult {
            name: "b".into(),
            prefix: "p/".into(),
            delimiter: String::new(),
            max_keys: 1000,
            is_truncated: false,
            key_count: 1,
            contents: vec![Contents {
                key: "p/x".into(),
                last_modified: "2024-01-01T00:00:00.000Z".into(),
                etag: "\"abc\"".into(),
                size: 3,
                storage_class: "STANDARD".into(),
            }],
            common_prefixes: Vec::new(),
            continuation_token: String::new(),
            next_continuation_token: String::new(),
            start_after: String::new(),
        };
        let xml = to_xml(&doc).unwrap();
        assert!(xml.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
        assert!(xml.contains("<ListBucketResult>"));
        assert!(xml.contains("<Key>p/x</Key>"));
        assert!(xml.contains("<KeyCount>1</KeyCount>"));
        // Empty optionals are omitted entirely
        assert!(!xml.contains("<Delimiter>"));
        assert!(!xml.contains("<NextContinuationToken>"));
    }

    #[test]
    fn test_parse_complete_multipart() {
        let body = br#"<CompleteMultipartUpload>
            <Part><PartNumber>1</PartNumber><ETag>"aaa"</ETag></Part>
            <Part><PartNumber>2</PartNumber><ETag>"bbb"</ETag></Part>
        </CompleteMultipartUpload>"#;
        let doc = parse_complete_multipart(body).unwrap();
        assert_eq!(doc.parts.len(), 2);
        assert_eq!(doc.parts[0].part_number, 1);
        assert_eq!(doc.parts[1].etag, "\"bbb\"");
    }

    #[test]
    fn test_parse_complete_multipart_rejects_garbage() {
        assert!(parse_complete_multipart(b"not xml <<<").is_err());
    }

    #[test]
    fn test_initiate_result_serializes() {
        let doc = InitiateMultipartUploadResult {
            bucket: "b".into(),
            key: "k".into(),
            upload_id: "u-1".into(),
        };
        let xml = to_xml(&doc).unwrap();
        assert!(xml.contains("<UploadId>u-1</UploadId>"));
    }
}
