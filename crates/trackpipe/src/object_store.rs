//! Object storage backends.
//!
//! Raw and transformed files live in object storage, addressed by
//! [`ObjectRef`] (bucket + key). Two backends implement [`ObjectStore`]:
//!
//! | Backend | Layout |
//! |---------|--------|
//! | [`LocalObjectStore`] | `<root>/<bucket>/<key>` on the local filesystem |
//! | [`S3ObjectStore`] | S3 REST API, AWS Signature V4, streaming GET/PUT |
//!
//! Both are blocking and stream through files, so an object is never held
//! in memory. Callers on a tokio runtime run them inside
//! `tokio::task::spawn_blocking`.
//!
//! # Configuration
//!
//! ```toml
//! [objects]
//! backend = "s3"
//! region = "us-east-2"
//! # endpoint_url = "http://localhost:9000"   # MinIO, path-style
//! ```
//!
//! S3 credentials are read from `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY`
//! and optionally `AWS_SESSION_TOKEN`.

use std::fmt;
use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::config::{ObjectBackend, ObjectsConfig};

/// Location of one object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRef {
    pub bucket: String,
    pub key: String,
}

impl ObjectRef {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s3://{}/{}", self.bucket, self.key)
    }
}

/// Blocking byte-level access to object storage.
pub trait ObjectStore: Send + Sync {
    /// Copy the object's bytes into `dest`. Returns the number of bytes.
    fn download(&self, object: &ObjectRef, dest: &mut File) -> Result<u64>;

    /// Store the contents of the file at `src` as the object.
    fn upload(&self, object: &ObjectRef, src: &Path) -> Result<u64>;
}

/// Build the configured backend.
pub fn from_config(config: &ObjectsConfig) -> Result<Box<dyn ObjectStore>> {
    match config.backend {
        ObjectBackend::Local => Ok(Box::new(LocalObjectStore::new(&config.root))),
        ObjectBackend::S3 => Ok(Box::new(S3ObjectStore::new(
            config.region.clone(),
            config.endpoint_url.clone(),
            AwsCredentials::from_env()?,
        ))),
    }
}

// ============ Local backend ============

/// Objects stored as plain files under a root directory.
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Filesystem path of an object. Keys may not escape the bucket.
    pub fn path_of(&self, object: &ObjectRef) -> Result<PathBuf> {
        for part in [&object.bucket, &object.key] {
            let path = Path::new(part);
            let escapes = path
                .components()
                .any(|c| !matches!(c, Component::Normal(_)));
            if part.is_empty() || escapes {
                bail!("Invalid object location: {}", object);
            }
        }
        Ok(self.root.join(&object.bucket).join(&object.key))
    }
}

impl ObjectStore for LocalObjectStore {
    fn download(&self, object: &ObjectRef, dest: &mut File) -> Result<u64> {
        let path = self.path_of(object)?;
        let mut src = File::open(&path)
            .with_context(|| format!("Failed to open {} ({})", object, path.display()))?;
        let bytes = io::copy(&mut src, dest)
            .with_context(|| format!("Failed to read {}", object))?;
        Ok(bytes)
    }

    fn upload(&self, object: &ObjectRef, src: &Path) -> Result<u64> {
        let path = self.path_of(object)?;
        let parent = path
            .parent()
            .with_context(|| format!("Invalid object location: {}", object))?;
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;

        // Write beside the target and rename, so readers never see a partial object.
        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        let bytes = io::copy(&mut File::open(src)?, tmp.as_file_mut())?;
        tmp.persist(&path)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(bytes)
    }
}

// ============ S3 backend ============

/// AWS credentials loaded from environment variables.
pub struct AwsCredentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
}

impl AwsCredentials {
    pub fn new(access_key_id: String, secret_access_key: String, session_token: Option<String>) -> Self {
        Self {
            access_key_id,
            secret_access_key,
            session_token,
        }
    }

    /// Load credentials from `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY`,
    /// and optionally `AWS_SESSION_TOKEN`.
    pub fn from_env() -> Result<Self> {
        let access_key_id = std::env::var("AWS_ACCESS_KEY_ID")
            .context("AWS_ACCESS_KEY_ID environment variable not set")?;
        let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY")
            .context("AWS_SECRET_ACCESS_KEY environment variable not set")?;
        let session_token = std::env::var("AWS_SESSION_TOKEN").ok();
        Ok(Self::new(access_key_id, secret_access_key, session_token))
    }
}

type HmacSha256 = Hmac<Sha256>;

const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";

/// S3 (or S3-compatible) object storage over signed REST calls.
///
/// With the default endpoint, requests are virtual-hosted
/// (`<bucket>.s3.<region>.amazonaws.com/<key>`); with a custom
/// `endpoint_url` they are path-style (`<endpoint>/<bucket>/<key>`).
pub struct S3ObjectStore {
    region: String,
    endpoint_url: Option<String>,
    creds: AwsCredentials,
}

/// A signed request, ready to send.
struct SignedRequest {
    url: String,
    headers: Vec<(String, String)>,
}

impl S3ObjectStore {
    pub fn new(region: String, endpoint_url: Option<String>, creds: AwsCredentials) -> Self {
        Self {
            region,
            endpoint_url,
            creds,
        }
    }

    /// Scheme, host and canonical URI for an object.
    fn locate(&self, object: &ObjectRef) -> (String, String, String) {
        let encoded_key = object
            .key
            .split('/')
            .map(uri_encode)
            .collect::<Vec<_>>()
            .join("/");
        match self.endpoint_url {
            Some(ref endpoint) => {
                let scheme = if endpoint.starts_with("http://") {
                    "http"
                } else {
                    "https"
                };
                let host = endpoint
                    .trim_start_matches("https://")
                    .trim_start_matches("http://")
                    .trim_end_matches('/')
                    .to_string();
                let uri = format!("/{}/{}", uri_encode(&object.bucket), encoded_key);
                (scheme.to_string(), host, uri)
            }
            None => (
                "https".to_string(),
                format!("{}.s3.{}.amazonaws.com", object.bucket, self.region),
                format!("/{}", encoded_key),
            ),
        }
    }

    fn sign(&self, method: &str, object: &ObjectRef, payload_hash: &str) -> SignedRequest {
        let (scheme, host, canonical_uri) = self.locate(object);

        let now = Utc::now();
        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();

        let mut headers = vec![
            ("host".to_string(), host.clone()),
            ("x-amz-content-sha256".to_string(), payload_hash.to_string()),
            ("x-amz-date".to_string(), amz_date.clone()),
        ];
        if let Some(ref token) = self.creds.session_token {
            headers.push(("x-amz-security-token".to_string(), token.clone()));
        }
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

        let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, self.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            credential_scope,
            hex_sha256(canonical_request.as_bytes())
        );
        let signing_key =
            derive_signing_key(&self.creds.secret_access_key, &date_stamp, &self.region, "s3");
        let signature = hex_hmac_sha256(&signing_key, string_to_sign.as_bytes());

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            self.creds.access_key_id, credential_scope, signed_headers, signature
        );

        // `host` is set by the HTTP client from the URL.
        let mut out: Vec<(String, String)> =
            headers.into_iter().filter(|(k, _)| k != "host").collect();
        out.push(("authorization".to_string(), authorization));

        SignedRequest {
            url: format!("{}://{}{}", scheme, host, canonical_uri),
            headers: out,
        }
    }
}

impl ObjectStore for S3ObjectStore {
    fn download(&self, object: &ObjectRef, dest: &mut File) -> Result<u64> {
        let signed = self.sign("GET", object, UNSIGNED_PAYLOAD);
        let client = reqwest::blocking::Client::new();
        let mut req = client.get(&signed.url);
        for (k, v) in &signed.headers {
            req = req.header(k.as_str(), v.as_str());
        }

        let mut resp = req
            .send()
            .map_err(|e| anyhow::anyhow!("Failed to get {}: {}", object, e))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().unwrap_or_default();
            bail!(
                "S3 GetObject failed (HTTP {}) for {}: {}",
                status,
                object,
                body.chars().take(500).collect::<String>()
            );
        }

        let bytes = resp
            .copy_to(dest)
            .map_err(|e| anyhow::anyhow!("Failed to read body of {}: {}", object, e))?;
        debug!(%object, bytes, "downloaded object");
        Ok(bytes)
    }

    fn upload(&self, object: &ObjectRef, src: &Path) -> Result<u64> {
        let file = File::open(src).with_context(|| format!("Failed to open {}", src.display()))?;
        let len = file.metadata()?.len();

        let signed = self.sign("PUT", object, UNSIGNED_PAYLOAD);
        let client = reqwest::blocking::Client::new();
        let mut req = client
            .put(&signed.url)
            .body(reqwest::blocking::Body::sized(file, len));
        for (k, v) in &signed.headers {
            req = req.header(k.as_str(), v.as_str());
        }

        let resp = req
            .send()
            .map_err(|e| anyhow::anyhow!("Failed to put {}: {}", object, e))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().unwrap_or_default();
            bail!(
                "S3 PutObject failed (HTTP {}) for {}: {}",
                status,
                object,
                body.chars().take(500).collect::<String>()
            );
        }
        debug!(%object, bytes = len, "uploaded object");
        Ok(len)
    }
}

// ============ AWS SigV4 Helpers ============

/// Compute the hex-encoded SHA-256 hash of data.
fn hex_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Compute HMAC-SHA256 of data with the given key.
fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn hex_hmac_sha256(key: &[u8], data: &[u8]) -> String {
    hex::encode(hmac_sha256(key, data))
}

/// Derive the AWS SigV4 signing key for a given date, region, and service.
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

/// URI-encode a string per RFC 3986. Unreserved: `A-Z a-z 0-9 - _ . ~`.
fn uri_encode(s: &str) -> String {
    let mut result = String::new();
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(byte as char);
            }
            _ => {
                result.push_str(&format!("%{:02X}", byte));
            }
        }
    }
    result
}
