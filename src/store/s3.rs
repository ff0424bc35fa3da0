//! Amazon S3 document store.
//!
//! Lists objects with `ListObjectsV2` (one metadata call per 1000 keys) and
//! downloads them with `GetObject`, signing every request with AWS
//! Signature V4. Custom endpoints cover S3-compatible services (MinIO,
//! LocalStack).
//!
//! The ETag reported by the listing is the version identifier, so change
//! detection never downloads or hashes object content.
//!
//! # Configuration
//!
//! ```toml
//! [store]
//! kind = "s3"
//! bucket = "acme-hr-policies"
//! region = "eu-west-1"
//! include_globs = ["**/*.pdf", "**/*.docx", "**/*.md"]
//! # endpoint_url = "http://localhost:9000"   # MinIO
//!
//! [store.prefixes]
//! employee = "employee/"
//! executive = "executive/"
//! master = "master/"
//! ```
//!
//! # Environment Variables
//!
//! - `AWS_ACCESS_KEY_ID`: required
//! - `AWS_SECRET_ACCESS_KEY`: required
//! - `AWS_SESSION_TOKEN`: optional (for temporary credentials / IAM roles)

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use std::time::Duration;

use policy_retrieval_core::models::{DocumentRef, RoleScope};

use super::{owning_role, relative_key, DocumentStore, KeyFilter};
use crate::config::{PrefixConfig, StoreConfig};
use crate::error::{Result, RetrievalError};

type HmacSha256 = Hmac<Sha256>;

pub struct S3Store {
    client: reqwest::Client,
    bucket: String,
    region: String,
    endpoint_url: Option<String>,
    creds: AwsCredentials,
    prefixes: PrefixConfig,
    filter: KeyFilter,
}

impl S3Store {
    pub fn from_config(config: &StoreConfig, filter: KeyFilter) -> Result<Self> {
        let bucket = config
            .bucket
            .clone()
            .ok_or_else(|| RetrievalError::Config("store.bucket is not set".into()))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| RetrievalError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            bucket,
            region: config.region.clone(),
            endpoint_url: config.endpoint_url.clone(),
            creds: AwsCredentials::from_env()?,
            prefixes: config.prefixes.clone(),
            filter,
        })
    }

    /// Hostname for the bucket, or the custom endpoint when configured.
    fn host(&self) -> String {
        match &self.endpoint_url {
            Some(endpoint) => endpoint
                .trim_start_matches("https://")
                .trim_start_matches("http://")
                .trim_end_matches('/')
                .to_string(),
            None => format!("{}.s3.{}.amazonaws.com", self.bucket, self.region),
        }
    }

    fn scheme(&self) -> &'static str {
        match &self.endpoint_url {
            Some(endpoint) if endpoint.starts_with("http://") => "http",
            _ => "https",
        }
    }

    /// Path-style addressing is required for custom endpoints.
    fn bucket_path(&self) -> String {
        match &self.endpoint_url {
            Some(_) => format!("/{}", self.bucket),
            None => String::new(),
        }
    }

    /// Send a signed, empty-payload GET request.
    async fn signed_get(
        &self,
        canonical_uri: &str,
        query: &[(String, String)],
    ) -> Result<reqwest::Response> {
        let host = self.host();
        let now = Utc::now();
        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let payload_hash = hex_sha256(b"");

        let mut sorted = query.to_vec();
        sorted.sort();
        let canonical_querystring = sorted
            .iter()
            .map(|(k, v)| format!("{}={}", uri_encode(k), uri_encode(v)))
            .collect::<Vec<_>>()
            .join("&");

        let mut headers = vec![
            ("host".to_string(), host.clone()),
            ("x-amz-content-sha256".to_string(), payload_hash.clone()),
            ("x-amz-date".to_string(), amz_date.clone()),
        ];
        if let Some(token) = &self.creds.session_token {
            headers.push(("x-amz-security-token".to_string(), token.clone()));
        }
        headers.sort();

        let signed_headers = headers
            .iter()
            .map(|(k, _)| k.as_str())
            .collect::<Vec<_>>()
            .join(";");
        let canonical_headers: String = headers
            .iter()
            .map(|(k, v)| format!("{}:{}\n", k, v))
            .collect();

        let canonical_request = format!(
            "GET\n{}\n{}\n{}\n{}\n{}",
            canonical_uri, canonical_querystring, canonical_headers, signed_headers, payload_hash
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
        let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes()));
        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            self.creds.access_key_id, credential_scope, signed_headers, signature
        );

        let mut url = format!("{}://{}{}", self.scheme(), host, canonical_uri);
        if !canonical_querystring.is_empty() {
            url.push('?');
            url.push_str(&canonical_querystring);
        }

        let mut req = self
            .client
            .get(&url)
            .header("Authorization", authorization)
            .header("x-amz-content-sha256", payload_hash)
            .header("x-amz-date", amz_date);
        if let Some(token) = &self.creds.session_token {
            req = req.header("x-amz-security-token", token);
        }

        req.send()
            .await
            .map_err(|e| RetrievalError::unavailable(format!("s3://{}: {}", self.bucket, e)))
    }
}

#[async_trait]
impl DocumentStore for S3Store {
    async fn list(&self, role: RoleScope) -> Result<Vec<DocumentRef>> {
        let prefix = self.prefixes.for_role(role);
        let canonical_uri = format!("{}/", self.bucket_path());
        let mut docs = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let mut query = vec![
                ("list-type".to_string(), "2".to_string()),
                ("max-keys".to_string(), "1000".to_string()),
                ("prefix".to_string(), prefix.to_string()),
            ];
            if let Some(token) = &continuation {
                query.push(("continuation-token".to_string(), token.clone()));
            }

            let resp = self.signed_get(&canonical_uri, &query).await?;
            let status = resp.status();
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(status_error(
                    status,
                    format!(
                        "ListObjectsV2 s3://{}/{} (HTTP {}): {}",
                        self.bucket,
                        prefix,
                        status,
                        body.chars().take(300).collect::<String>()
                    ),
                ));
            }

            let xml = resp
                .text()
                .await
                .map_err(|e| RetrievalError::unavailable(e.to_string()))?;
            let page = parse_list_objects(&xml);

            for obj in page.objects {
                let Some(rel) = relative_key(prefix, &obj.key) else {
                    continue;
                };
                if owning_role(&self.prefixes, &obj.key) != Some(role) || !self.filter.matches(rel) {
                    continue;
                }
                docs.push(DocumentRef::new(obj.key, role, obj.etag, obj.size));
            }

            match (page.is_truncated, page.next_token) {
                (true, Some(token)) => continuation = Some(token),
                _ => break,
            }
        }

        docs.sort_by(|a, b| a.key.cmp(&b.key));
        tracing::debug!(role = %role, objects = docs.len(), bucket = %self.bucket, "listed s3 prefix");
        Ok(docs)
    }

    async fn fetch(&self, doc: &DocumentRef) -> Result<Vec<u8>> {
        let encoded_key = doc
            .key
            .split('/')
            .map(uri_encode)
            .collect::<Vec<_>>()
            .join("/");
        let canonical_uri = format!("{}/{}", self.bucket_path(), encoded_key);

        let resp = self.signed_get(&canonical_uri, &[]).await?;
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Err(RetrievalError::NotFound {
                key: doc.key.clone(),
            });
        }
        if !status.is_success() {
            return Err(status_error(
                status,
                format!("GetObject '{}' (HTTP {})", doc.key, status),
            ));
        }

        let bytes = resp
            .bytes()
            .await
            .map_err(|e| RetrievalError::unavailable(format!("reading '{}': {}", doc.key, e)))?;
        Ok(bytes.to_vec())
    }

    fn describe(&self) -> String {
        format!("s3://{}", self.bucket)
    }
}

/// 5xx and 429 are worth retrying; other statuses (auth, bad request) are not.
fn status_error(status: StatusCode, message: String) -> RetrievalError {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetrievalError::unavailable(message)
    } else {
        RetrievalError::rejected(message)
    }
}

// ============ AWS Credentials ============

struct AwsCredentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
}

impl AwsCredentials {
    fn from_env() -> Result<Self> {
        let var = |name: &str| {
            std::env::var(name)
                .map_err(|_| RetrievalError::Config(format!("{} environment variable not set", name)))
        };
        Ok(Self {
            access_key_id: var("AWS_ACCESS_KEY_ID")?,
            secret_access_key: var("AWS_SECRET_ACCESS_KEY")?,
            session_token: std::env::var("AWS_SESSION_TOKEN").ok(),
        })
    }
}

// ============ AWS SigV4 Helpers ============

fn hex_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    // HMAC accepts keys of any length, so this cannot fail.
    let mut mac = match HmacSha256::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => return Vec::new(),
    };
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Derive the SigV4 signing key.
///
/// ```text
/// kDate    = HMAC("AWS4" + secret, dateStamp)
/// kRegion  = HMAC(kDate, region)
/// kService = HMAC(kRegion, service)
/// kSigning = HMAC(kService, "aws4_request")
/// ```
fn derive_signing_key(secret_key: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(format!("AWS4{}", secret_key).as_bytes(), date_stamp.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// RFC 3986 encoding of everything except `A-Z a-z 0-9 - _ . ~`.
fn uri_encode(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(byte as char)
            }
            _ => result.push_str(&format!("%{:02X}", byte)),
        }
    }
    result
}

// ============ ListObjectsV2 parsing ============

#[derive(Debug, PartialEq)]
struct ListedObject {
    key: String,
    etag: String,
    size: u64,
}

#[derive(Debug, Default)]
struct ListPage {
    objects: Vec<ListedObject>,
    is_truncated: bool,
    next_token: Option<String>,
}

fn parse_list_objects(xml: &str) -> ListPage {
    let mut page = ListPage {
        is_truncated: xml_value(xml, "IsTruncated").as_deref() == Some("true"),
        next_token: xml_value(xml, "NextContinuationToken"),
        ..Default::default()
    };

    let mut rest = xml;
    while let Some(start) = rest.find("<Contents>") {
        let body = &rest[start + "<Contents>".len()..];
        let Some(end) = body.find("</Contents>") else {
            break;
        };
        let block = &body[..end];
        rest = &body[end + "</Contents>".len()..];

        let key = xml_value(block, "Key").unwrap_or_default();
        if key.is_empty() || key.ends_with('/') {
            continue;
        }
        page.objects.push(ListedObject {
            key,
            etag: xml_value(block, "ETag")
                .unwrap_or_default()
                .trim_matches('"')
                .to_string(),
            size: xml_value(block, "Size")
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
        });
    }
    page
}

/// Text content of the first `<tag>` element, with XML entities decoded.
fn xml_value(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = xml.find(&open)? + open.len();
    let end = xml[start..].find(&close)?;
    Some(unescape_xml(&xml[start..start + end]))
}

fn unescape_xml(s: &str) -> String {
    s.replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_list_objects_page() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<ListBucketResult>
  <IsTruncated>true</IsTruncated>
  <NextContinuationToken>tok-2</NextContinuationToken>
  <Contents><Key>employee/</Key><ETag>"d"</ETag><Size>0</Size></Contents>
  <Contents><Key>employee/Leave &amp; Absence.pdf</Key><ETag>&quot;abc123&quot;</ETag><Size>2048</Size></Contents>
  <Contents><Key>employee/Expenses.md</Key><ETag>"def456"</ETag><Size>10</Size></Contents>
</ListBucketResult>"#;
        let page = parse_list_objects(xml);
        assert!(page.is_truncated);
        assert_eq!(page.next_token.as_deref(), Some("tok-2"));
        assert_eq!(
            page.objects,
            vec![
                ListedObject {
                    key: "employee/Leave & Absence.pdf".into(),
                    etag: "abc123".into(),
                    size: 2048
                },
                ListedObject {
                    key: "employee/Expenses.md".into(),
                    etag: "def456".into(),
                    size: 10
                },
            ]
        );
    }

    #[test]
    fn test_parse_last_page() {
        let page = parse_list_objects("<ListBucketResult><IsTruncated>false</IsTruncated></ListBucketResult>");
        assert!(!page.is_truncated);
        assert!(page.objects.is_empty());
    }

    #[test]
    fn test_uri_encode() {
        assert_eq!(uri_encode("Leave Policy.pdf"), "Leave%20Policy.pdf");
        assert_eq!(uri_encode("a~b_c-d.e"), "a~b_c-d.e");
    }

    #[test]
    fn test_status_classification() {
        assert!(status_error(StatusCode::SERVICE_UNAVAILABLE, "x".into()).is_transient());
        assert!(status_error(StatusCode::TOO_MANY_REQUESTS, "x".into()).is_transient());
        assert!(!status_error(StatusCode::FORBIDDEN, "x".into()).is_transient());
    }

    #[test]
    fn test_signing_key_is_deterministic() {
        let a = derive_signing_key("secret", "20240101", "us-east-1", "s3");
        let b = derive_signing_key("secret", "20240101", "us-east-1", "s3");
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
    }
}
