//! S3-compatible blob store for raw payloads.
//!
//! Documents whose raw payload exceeds the configured threshold keep only a
//! `raw_key` in the row; the bytes live in an S3-compatible bucket (MinIO,
//! LocalStack, or S3 proper via a custom endpoint). Requests are signed
//! with AWS Signature V4 using pure-Rust primitives (`hmac`, `sha2`) — no
//! C library dependencies, so the build works everywhere.
//!
//! Only two operations exist: [`BlobStore::put`] and [`BlobStore::get`].
//! Everything else about the bucket (lifecycle, replication) is the
//! operator's concern.

use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::config::BlobConfig;
use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// Signed client for one bucket.
pub struct BlobStore {
    config: BlobConfig,
    client: reqwest::Client,
}

impl BlobStore {
    pub fn new(config: BlobConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    /// Store `bytes` under `key`. Any failure is [`Error::BlobUnavailable`].
    pub async fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let (url, headers) = self.signed_request("PUT", key, bytes);

        let mut req = self.client.put(&url).body(bytes.to_vec());
        for (name, value) in &headers {
            req = req.header(name.as_str(), value.as_str());
        }

        let resp = req
            .send()
            .await
            .map_err(|e| Error::BlobUnavailable(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(Error::BlobUnavailable(format!(
                "PUT {} returned HTTP {}",
                key,
                resp.status()
            )));
        }
        Ok(())
    }

    /// Retrieve the bytes stored under `key`. A missing object is
    /// [`Error::NotFound`]; any other failure is [`Error::BlobUnavailable`].
    pub async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let (url, headers) = self.signed_request("GET", key, b"");

        let mut req = self.client.get(&url);
        for (name, value) in &headers {
            req = req.header(name.as_str(), value.as_str());
        }

        let resp = req
            .send()
            .await
            .map_err(|e| Error::BlobUnavailable(e.to_string()))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::NotFound(format!("blob {} not found", key)));
        }
        if !resp.status().is_success() {
            return Err(Error::BlobUnavailable(format!(
                "GET {} returned HTTP {}",
                key,
                resp.status()
            )));
        }

        let bytes = resp
            .bytes()
            .await
            .map_err(|e| Error::BlobUnavailable(e.to_string()))?;
        Ok(bytes.to_vec())
    }

    /// Build the URL and SigV4 headers for one request.
    fn signed_request(&self, method: &str, key: &str, payload: &[u8]) -> (String, Vec<(String, String)>) {
        let host = self
            .config
            .endpoint
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .trim_end_matches('/')
            .to_string();
        let scheme = if self.config.endpoint.starts_with("http://") {
            "http"
        } else {
            "https"
        };

        let encoded_key = key.split('/').map(uri_encode).collect::<Vec<_>>().join("/");
        let canonical_uri = format!("/{}/{}", self.config.bucket, encoded_key);
        let url = format!("{}://{}{}", scheme, host, canonical_uri);

        let now = Utc::now();
        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();

        let payload_hash = hex_sha256(payload);

        let mut headers = vec![
            ("host".to_string(), host),
            ("x-amz-content-sha256".to_string(), payload_hash.clone()),
            ("x-amz-date".to_string(), amz_date.clone()),
        ];
        headers.sort_by(|a, b| a.0.cmp(&b.0));

        let signed_headers: String = headers
            .iter()
            .map(|(k, _)| k.as_str())
            .collect::<Vec<_>>()
            .join(";");
        let canonical_headers: String = headers
            .iter()
            .map(|(k, v)| format!("{}:{}\n", k, v))
            .collect();

        let canonical_request = format!(
            "{}\n{}\n\n{}\n{}\n{}",
            method, canonical_uri, canonical_headers, signed_headers, payload_hash
        );

        let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, self.config.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            credential_scope,
            hex_sha256(canonical_request.as_bytes())
        );

        let signing_key = derive_signing_key(
            &self.config.secret_key,
            &date_stamp,
            &self.config.region,
            "s3",
        );
        let signature = hex_hmac_sha256(&signing_key, string_to_sign.as_bytes());

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            self.config.access_key, credential_scope, signed_headers, signature
        );

        // `host` goes out implicitly with the request; the rest explicitly.
        let out_headers = vec![
            ("Authorization".to_string(), authorization),
            ("x-amz-content-sha256".to_string(), payload_hash),
            ("x-amz-date".to_string(), amz_date),
        ];

        (url, out_headers)
    }
}

/// Compute the blob key for a document's raw payload. Content-addressed by
/// checksum, so identical payloads share an object and re-ingests never
/// orphan a key mid-write.
pub fn raw_key_for(collection: &str, checksum: &str) -> String {
    format!("raw/{}/{}", collection, checksum)
}

fn hex_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn hex_hmac_sha256(key: &[u8], data: &[u8]) -> String {
    hex::encode(hmac_sha256(key, data))
}

/// SigV4 key derivation chain:
///
/// ```text
/// kDate    = HMAC("AWS4" + secret, dateStamp)
/// kRegion  = HMAC(kDate, region)
/// kService = HMAC(kRegion, service)
/// kSigning = HMAC(kService, "aws4_request")
/// ```
fn derive_signing_key(secret_key: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(
        format!("AWS4{}", secret_key).as_bytes(),
        date_stamp.as_bytes(),
    );
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// URI-encode per RFC 3986: everything but unreserved characters.
fn uri_encode(s: &str) -> String {
    let mut result = String::new();
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(byte as char);
            }
            _ => result.push_str(&format!("%{:02X}", byte)),
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uri_encode_unreserved_passthrough() {
        assert_eq!(uri_encode("abc-XYZ_0.9~"), "abc-XYZ_0.9~");
        assert_eq!(uri_encode("a b/c"), "a%20b%2Fc");
    }

    #[test]
    fn signing_key_derivation_matches_aws_test_vector() {
        // Published AWS SigV4 example key.
        let key = derive_signing_key(
            "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY",
            "20120215",
            "us-east-1",
            "iam",
        );
        assert_eq!(
            hex::encode(key),
            "f4780e2d9f65fa895f9c67b32ce1baf0b0d8a43505a000a1a9e090d414db404d"
        );
    }

    #[test]
    fn raw_key_layout() {
        assert_eq!(raw_key_for("kb", "abc123"), "raw/kb/abc123");
    }

    #[test]
    fn payload_hash_is_hex_sha256() {
        assert_eq!(
            hex_sha256(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
