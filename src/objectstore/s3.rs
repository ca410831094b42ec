//! S3-compatible object storage client (Vultr Object Storage, DO Spaces)
//!
//! Requests are path-style and signed with AWS Signature Version 4.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::Client;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use super::{
    ObjectStore, ObjectStoreError, PushBucketObject, StateStoreCredentials, StateStoreDetails,
};

type HmacSha256 = Hmac<Sha256>;

/// Signing region accepted by S3-compatible providers that ignore regions
pub const DEFAULT_SIGNING_REGION: &str = "us-east-1";

// ============================================================================
// SBIO: Pure signing functions (no I/O)
// ============================================================================

pub fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

fn hmac_sha256(key: &[u8], data: &str) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(data.as_bytes());
    mac.finalize().into_bytes().to_vec()
}

/// Percent-encode a path for the canonical request, keeping `/`
pub fn uri_encode_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    for byte in path.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => {
                out.push(byte as char)
            }
            other => out.push_str(&format!("%{:02X}", other)),
        }
    }
    out
}

/// Inputs to a SigV4 signature
#[derive(Debug, Clone)]
pub struct SigningRequest<'a> {
    pub method: &'a str,
    pub host: &'a str,
    /// Already-encoded canonical path, e.g. `/bucket/key`
    pub path: &'a str,
    pub payload_hash: &'a str,
    pub timestamp: DateTime<Utc>,
    pub region: &'a str,
}

/// Compute the `Authorization` header value for a request
pub fn authorization_header(
    request: &SigningRequest<'_>,
    credentials: &StateStoreCredentials,
) -> String {
    let amz_date = request.timestamp.format("%Y%m%dT%H%M%SZ").to_string();
    let date_stamp = request.timestamp.format("%Y%m%d").to_string();
    let signed_headers = "host;x-amz-content-sha256;x-amz-date";

    let canonical_request = format!(
        "{}\n{}\n\nhost:{}\nx-amz-content-sha256:{}\nx-amz-date:{}\n\n{}\n{}",
        request.method,
        request.path,
        request.host,
        request.payload_hash,
        amz_date,
        signed_headers,
        request.payload_hash
    );

    let scope = format!("{}/{}/s3/aws4_request", date_stamp, request.region);
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{}\n{}\n{}",
        amz_date,
        scope,
        sha256_hex(canonical_request.as_bytes())
    );

    let k_date = hmac_sha256(
        format!("AWS4{}", credentials.secret_access_key).as_bytes(),
        &date_stamp,
    );
    let k_region = hmac_sha256(&k_date, request.region);
    let k_service = hmac_sha256(&k_region, "s3");
    let k_signing = hmac_sha256(&k_service, "aws4_request");
    let signature: String = hmac_sha256(&k_signing, &string_to_sign)
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect();

    format!(
        "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
        credentials.access_key_id, scope, signed_headers, signature
    )
}

// ============================================================================
// SBIO: I/O implementation (real HTTP client)
// ============================================================================

#[derive(Clone)]
pub struct S3ObjectStore {
    client: Client,
    region: String,
}

impl S3ObjectStore {
    pub fn new() -> Self {
        Self::with_region(DEFAULT_SIGNING_REGION)
    }

    pub fn with_region(region: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            region: region.into(),
        }
    }

    async fn send(
        &self,
        method: reqwest::Method,
        credentials: &StateStoreCredentials,
        details: &StateStoreDetails,
        key: Option<&str>,
        body: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<reqwest::Response, ObjectStoreError> {
        let raw_path = match key {
            Some(key) => format!("/{}/{}", details.name, key.trim_start_matches('/')),
            None => format!("/{}", details.name),
        };
        let path = uri_encode_path(&raw_path);
        let payload_hash = sha256_hex(&body);
        let timestamp = Utc::now();

        let authorization = authorization_header(
            &SigningRequest {
                method: method.as_str(),
                host: &details.hostname,
                path: &path,
                payload_hash: &payload_hash,
                timestamp,
                region: &self.region,
            },
            credentials,
        );

        let url = format!("https://{}{}", details.hostname, path);
        debug!("{} {}", method, url);

        let mut req = self
            .client
            .request(method, &url)
            .header("x-amz-date", timestamp.format("%Y%m%dT%H%M%SZ").to_string())
            .header("x-amz-content-sha256", payload_hash)
            .header("Authorization", authorization)
            .body(body);
        if let Some(ct) = content_type {
            req = req.header("Content-Type", ct);
        }

        let response = req
            .send()
            .await
            .map_err(|e| ObjectStoreError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ObjectStoreError::Http {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response)
    }
}

impl Default for S3ObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn create_bucket(
        &self,
        credentials: &StateStoreCredentials,
        details: &StateStoreDetails,
    ) -> Result<(), ObjectStoreError> {
        match self
            .send(
                reqwest::Method::PUT,
                credentials,
                details,
                None,
                Vec::new(),
                None,
            )
            .await
        {
            Ok(_) => {
                info!("created state store bucket {}", details.name);
                Ok(())
            }
            // BucketAlreadyOwnedByYou
            Err(ObjectStoreError::Http { status: 409, .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn put_object(
        &self,
        credentials: &StateStoreCredentials,
        details: &StateStoreDetails,
        object: &PushBucketObject,
    ) -> Result<(), ObjectStoreError> {
        let body = tokio::fs::read(&object.local_path).await?;
        let size = body.len();
        self.send(
            reqwest::Method::PUT,
            credentials,
            details,
            Some(&object.remote_path),
            body,
            Some(&object.content_type),
        )
        .await?;
        info!(
            "uploaded {} of size {} successfully",
            object.local_path.display(),
            size
        );
        Ok(())
    }

    async fn get_object(
        &self,
        credentials: &StateStoreCredentials,
        details: &StateStoreDetails,
        remote_path: &str,
        local_path: &Path,
    ) -> Result<(), ObjectStoreError> {
        let response = self
            .send(
                reqwest::Method::GET,
                credentials,
                details,
                Some(remote_path),
                Vec::new(),
                None,
            )
            .await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ObjectStoreError::Request(e.to_string()))?;
        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(local_path, &bytes).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_sha256_of_empty_payload() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_uri_encode_path() {
        assert_eq!(uri_encode_path("/bucket/a b/c+d.json"), "/bucket/a%20b/c%2Bd.json");
        assert_eq!(uri_encode_path("/plain/key-1_~.txt"), "/plain/key-1_~.txt");
    }

    #[test]
    fn test_authorization_header_matches_reference_signature() {
        let credentials = StateStoreCredentials {
            access_key_id: "AKIDEXAMPLE".to_string(),
            secret_access_key: "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY".to_string(),
        };
        let payload_hash = sha256_hex(br#"{"a":1}"#);
        assert_eq!(
            payload_hash,
            "015abd7f5cc57a2dd94b7590f04ad8084273905ee33ec5cebeae62276a97f862"
        );

        let header = authorization_header(
            &SigningRequest {
                method: "PUT",
                host: "ewr1.vultrobjects.com",
                path: "/mgmt-state-store/clusters/mgmt.json",
                payload_hash: &payload_hash,
                timestamp: Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap(),
                region: "us-east-1",
            },
            &credentials,
        );

        assert_eq!(
            header,
            "AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20240115/us-east-1/s3/aws4_request, \
             SignedHeaders=host;x-amz-content-sha256;x-amz-date, \
             Signature=1ff2c8b28f936a3849c20744cf2e05c122f7785ab25ae148c3e6dfb6f605c152"
        );
    }
}
