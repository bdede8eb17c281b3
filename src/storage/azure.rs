//! Azure Blob Storage backend.
//!
//! Talks to the Azure Blob REST API with `reqwest` for the few calls the
//! labelling engine needs:
//!   `list_prefixes()`   -> List Blobs with `delimiter=/` (BlobPrefix entries)
//!   `list_blob_page()`  -> List Blobs without delimiter, one `marker` page
//!   `download_to()`     -> Get Blob on a SAS-qualified URL, streamed to disk
//!   `read_blob()`       -> Get Blob signed with Shared Key
//!
//! Read tokens are container Service SAS tokens signed locally with the
//! account key (see [`super::sas`]); no round trip is needed to mint one.
//!
//! Credentials come from the `storage` config section.  An empty
//! `account_key` falls back to the `AZURE_STORAGE_KEY` environment variable.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use bytes::Bytes;
use garde::Validate;
use hmac::{Hmac, Mac};
use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::StatusCode;
use sha2::Sha256;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::OnceLock;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use super::backend::{BlobItem, BlobPage, BlobStore, TokenWindow};
use super::sas::{ContainerSas, PERMISSION_READ};
use crate::config::StorageConfig;
use crate::errors::{ConfigError, TransportError};

/// Azure REST API version used for all requests.
const AZURE_API_VERSION: &str = "2023-11-03";

/// Percent-encoding set for Azure blob names: encode everything except
/// unreserved characters and '/'.
const AZURE_BLOB_ENCODE_SET: percent_encoding::AsciiSet = percent_encoding::NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'/');

/// Percent-encoding set for query values.
const AZURE_QUERY_ENCODE_SET: percent_encoding::AsciiSet = percent_encoding::NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Credential input checked before any client is built.
#[derive(Debug, Validate)]
pub struct AzureCredentials {
    /// Storage account: 3-24 lowercase letters and digits.
    #[garde(pattern(r"^[a-z0-9]{3,24}$"))]
    pub account: String,
    /// Container: 3-63 lowercase letters, digits and hyphens.
    #[garde(pattern(r"^[a-z0-9][a-z0-9\-]{1,61}[a-z0-9]$"))]
    pub container: String,
    /// Base64 account key.
    #[garde(length(min = 1))]
    pub account_key: String,
}

/// Blob store backed by one Azure storage account.
pub struct AzureBlobStore {
    /// Azure storage account name.
    account: String,
    /// Decoded account key, used for Shared Key and SAS signatures.
    key_bytes: Vec<u8>,
    /// Blob service endpoint, without trailing slash.
    base_url: String,
    /// Path component of `base_url` (non-empty for path-style emulators).
    base_path: String,
    /// Allowed SAS protocols.
    protocol: &'static str,
    /// Per-request timeout.
    timeout: std::time::Duration,
    /// HTTP client, created on first `connect()`.
    client: OnceLock<reqwest::Client>,
}

/// Parsed List Blobs response.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ListBlobsResponse {
    /// `<Blob><Name>` values.
    pub blobs: Vec<String>,
    /// `<BlobPrefix><Name>` values (only with a delimiter).
    pub prefixes: Vec<String>,
    /// Non-empty `<NextMarker>`.
    pub next_marker: Option<String>,
}

impl AzureBlobStore {
    /// Create a store from the `storage` config section.
    ///
    /// Malformed credentials are a configuration error and fail here,
    /// before any request is made.
    pub fn new(settings: &StorageConfig) -> Result<Self, ConfigError> {
        let account_key = settings.resolved_account_key().unwrap_or_default();
        let credentials = AzureCredentials {
            account: settings.account.clone(),
            container: settings.container.clone(),
            account_key,
        };
        credentials
            .validate()
            .map_err(|report| ConfigError::InvalidCredentials(report.to_string()))?;

        let key_bytes = BASE64_STANDARD
            .decode(credentials.account_key.trim())
            .map_err(|e| {
                ConfigError::InvalidCredentials(format!("account key is not valid base64: {}", e))
            })?;

        let base_url = settings.endpoint_url();
        let base_path = Self::url_path(&base_url);
        let protocol = if base_url.starts_with("http://") {
            "https,http"
        } else {
            "https"
        };

        info!(
            "Azure blob store configured: account={} endpoint={}",
            credentials.account, base_url
        );

        Ok(Self {
            account: credentials.account,
            key_bytes,
            base_url,
            base_path,
            protocol,
            timeout: std::time::Duration::from_secs(settings.request_timeout_secs),
            client: OnceLock::new(),
        })
    }

    /// Path portion of an endpoint URL (`""` for `https://host`).
    fn url_path(base_url: &str) -> String {
        let after_scheme = base_url
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(base_url);
        match after_scheme.find('/') {
            Some(idx) => after_scheme[idx..].trim_end_matches('/').to_string(),
            None => String::new(),
        }
    }

    fn client(&self) -> anyhow::Result<&reqwest::Client> {
        self.connect()?;
        self.client
            .get()
            .ok_or_else(|| anyhow::anyhow!("Azure client not initialized"))
    }

    /// URL of a container.
    fn container_url(&self, container: &str) -> String {
        format!("{}/{}", self.base_url, container)
    }

    /// Build the full URL for a blob.
    fn blob_url(&self, container: &str, blob_name: &str) -> String {
        format!("{}/{}", self.base_url, Self::blob_resource(container, blob_name))
    }

    /// `{container}/{encoded blob}`: the request path below the account,
    /// encoded the same way for the URL and the Shared Key signature.
    fn blob_resource(container: &str, blob_name: &str) -> String {
        let encoded_blob =
            percent_encoding::utf8_percent_encode(blob_name, &AZURE_BLOB_ENCODE_SET).to_string();
        format!("{}/{}", container, encoded_blob)
    }

    /// Get the current UTC date in RFC 1123 format for Azure headers.
    fn rfc1123_date() -> String {
        use std::time::SystemTime;
        httpdate::fmt_http_date(SystemTime::now())
    }

    /// Check if a status code indicates "not found" (404).
    fn is_not_found(status: StatusCode) -> bool {
        status == StatusCode::NOT_FOUND
    }

    fn status_error(operation: &str, status: StatusCode, body: String) -> anyhow::Error {
        TransportError::Status {
            operation: operation.to_string(),
            status: status.as_u16(),
            body,
        }
        .into()
    }

    fn request_error(operation: &str, e: reqwest::Error) -> anyhow::Error {
        TransportError::Request {
            operation: operation.to_string(),
            message: e.to_string(),
        }
        .into()
    }

    /// Sign a GET request with Shared Key and return the Authorization
    /// header value.
    ///
    /// `resource` is the path below the account: `{container}` for
    /// container-level calls or `{container}/{blob}` for blob calls.
    fn sign_get(
        &self,
        resource: &str,
        date: &str,
        query_params: &[(String, String)],
    ) -> anyhow::Result<String> {
        let ms_headers = format!("x-ms-date:{}\nx-ms-version:{}", date, AZURE_API_VERSION);

        let mut canonicalized_resource =
            format!("/{}{}/{}", self.account, self.base_path, resource);

        // Append sorted query parameters.
        if !query_params.is_empty() {
            let mut sorted_params = query_params.to_vec();
            sorted_params.sort_by(|a, b| a.0.cmp(&b.0));
            for (k, v) in &sorted_params {
                canonicalized_resource.push_str(&format!("\n{}:{}", k.to_lowercase(), v));
            }
        }

        let string_to_sign = format!(
            "GET\n\n\n\n\n\n\n\n\n\n\n\n{}\n{}",
            ms_headers, canonicalized_resource
        );

        type HmacSha256 = Hmac<Sha256>;
        let mut mac = HmacSha256::new_from_slice(&self.key_bytes)
            .map_err(|e| anyhow::anyhow!("HMAC key error: {}", e))?;
        mac.update(string_to_sign.as_bytes());
        let signature = BASE64_STANDARD.encode(mac.finalize().into_bytes());

        Ok(format!("SharedKey {}:{}", self.account, signature))
    }

    /// One List Blobs call.
    async fn list_request(
        &self,
        container: &str,
        prefix: &str,
        delimiter: Option<&str>,
        marker: Option<&str>,
    ) -> anyhow::Result<ListBlobsResponse> {
        let mut query_params = vec![
            ("restype".to_string(), "container".to_string()),
            ("comp".to_string(), "list".to_string()),
        ];
        if !prefix.is_empty() {
            query_params.push(("prefix".to_string(), prefix.to_string()));
        }
        if let Some(d) = delimiter {
            query_params.push(("delimiter".to_string(), d.to_string()));
        }
        if let Some(m) = marker {
            query_params.push(("marker".to_string(), m.to_string()));
        }

        let query = query_params
            .iter()
            .map(|(k, v)| {
                format!(
                    "{}={}",
                    k,
                    percent_encoding::utf8_percent_encode(v, &AZURE_QUERY_ENCODE_SET)
                )
            })
            .collect::<Vec<_>>()
            .join("&");
        let url = format!("{}?{}", self.container_url(container), query);

        let date = Self::rfc1123_date();
        let auth_header = self.sign_get(container, &date, &query_params)?;

        debug!(
            "Azure list: container={} prefix='{}' delimiter={:?} marker={:?}",
            container, prefix, delimiter, marker
        );

        let resp = self
            .client()?
            .get(&url)
            .header("x-ms-date", &date)
            .header("x-ms-version", AZURE_API_VERSION)
            .header("Authorization", auth_header)
            .send()
            .await
            .map_err(|e| Self::request_error("list_blobs", e))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Self::status_error("list_blobs", status, body));
        }

        let body = resp
            .text()
            .await
            .map_err(|e| Self::request_error("list_blobs", e))?;
        parse_list_response(&body)
    }
}

/// Parse a List Blobs XML response body.
///
/// ```xml
/// <EnumerationResults ContainerName="...">
///   <Prefix>cats/</Prefix>
///   <Blobs>
///     <BlobPrefix><Name>cats/siamese/</Name></BlobPrefix>
///     <Blob><Name>cats/tabby.jpg</Name><Properties>...</Properties></Blob>
///   </Blobs>
///   <NextMarker>...</NextMarker>
/// </EnumerationResults>
/// ```
pub fn parse_list_response(body: &str) -> anyhow::Result<ListBlobsResponse> {
    let mut reader = Reader::from_str(body);
    reader.trim_text(true);

    let mut path: Vec<String> = Vec::new();
    let mut result = ListBlobsResponse::default();

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => {
                path.push(String::from_utf8_lossy(e.name().as_ref()).to_string());
            }
            Ok(Event::End(_)) => {
                path.pop();
            }
            Ok(Event::Text(ref t)) => {
                let text = t
                    .unescape()
                    .map_err(|e| anyhow::anyhow!("invalid List Blobs XML text: {}", e))?
                    .to_string();
                let tail: Vec<&str> = path.iter().map(String::as_str).collect();
                match tail.as_slice() {
                    [.., "Blobs", "Blob", "Name"] => result.blobs.push(text),
                    [.., "Blobs", "BlobPrefix", "Name"] => result.prefixes.push(text),
                    [_, "NextMarker"] if !text.is_empty() => result.next_marker = Some(text),
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(anyhow::anyhow!(
                    "malformed List Blobs XML at position {}: {}",
                    reader.buffer_position(),
                    e
                ))
            }
            _ => {}
        }
    }

    Ok(result)
}

impl BlobStore for AzureBlobStore {
    fn connect(&self) -> anyhow::Result<()> {
        if self.client.get().is_some() {
            return Ok(());
        }
        let client = reqwest::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {}", e))?;
        // A concurrent connect may have won; either client is equivalent.
        let _ = self.client.set(client);
        debug!("Azure client connected: account={}", self.account);
        Ok(())
    }

    fn list_prefixes(
        &self,
        container: &str,
        prefix: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<String>>> + Send + '_>> {
        let container = container.to_string();
        let prefix = prefix.to_string();
        Box::pin(async move {
            let mut prefixes = Vec::new();
            let mut marker: Option<String> = None;
            loop {
                let page = self
                    .list_request(&container, &prefix, Some("/"), marker.as_deref())
                    .await?;
                prefixes.extend(page.prefixes);
                match page.next_marker {
                    Some(next) => marker = Some(next),
                    None => break,
                }
            }
            Ok(prefixes)
        })
    }

    fn list_blob_page(
        &self,
        container: &str,
        prefix: &str,
        marker: Option<String>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<BlobPage>> + Send + '_>> {
        let container = container.to_string();
        let prefix = prefix.to_string();
        Box::pin(async move {
            let page = self
                .list_request(&container, &prefix, None, marker.as_deref())
                .await?;
            let items = page
                .blobs
                .into_iter()
                .map(|name| BlobItem {
                    url: self.blob_url(&container, &name),
                    name,
                })
                .collect();
            Ok(BlobPage {
                items,
                next_marker: page.next_marker,
            })
        })
    }

    fn issue_read_token(&self, container: &str, window: &TokenWindow) -> anyhow::Result<String> {
        ContainerSas {
            account: &self.account,
            container,
            permissions: PERMISSION_READ,
            window: *window,
            protocol: self.protocol,
        }
        .sign(&self.key_bytes)
    }

    fn download_to(
        &self,
        url: &str,
        dest: &Path,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<u64>> + Send + '_>> {
        let url = url.to_string();
        let dest = dest.to_path_buf();
        Box::pin(async move {
            let mut resp = self
                .client()?
                .get(&url)
                .header("x-ms-version", AZURE_API_VERSION)
                .send()
                .await
                .map_err(|e| Self::request_error("download", e))?;

            if !resp.status().is_success() {
                let status = resp.status();
                if Self::is_not_found(status) {
                    return Err(TransportError::NotFound(super::backend::file_name(&url)).into());
                }
                let body = resp.text().await.unwrap_or_default();
                return Err(Self::status_error("download", status, body));
            }

            let local_write = |source| TransportError::LocalWrite {
                path: dest.display().to_string(),
                source,
            };
            let mut file = tokio::fs::File::create(&dest).await.map_err(local_write)?;
            let mut written: u64 = 0;
            while let Some(chunk) = resp
                .chunk()
                .await
                .map_err(|e| Self::request_error("download", e))?
            {
                file.write_all(&chunk).await.map_err(local_write)?;
                written += chunk.len() as u64;
            }
            file.flush().await.map_err(local_write)?;

            Ok(written)
        })
    }

    fn read_blob(
        &self,
        container: &str,
        blob_name: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Bytes>> + Send + '_>> {
        let container = container.to_string();
        let blob_name = blob_name.to_string();
        Box::pin(async move {
            let url = self.blob_url(&container, &blob_name);
            let date = Self::rfc1123_date();
            let auth_header =
                self.sign_get(&Self::blob_resource(&container, &blob_name), &date, &[])?;

            let resp = self
                .client()?
                .get(&url)
                .header("x-ms-date", &date)
                .header("x-ms-version", AZURE_API_VERSION)
                .header("Authorization", auth_header)
                .send()
                .await
                .map_err(|e| Self::request_error("read_blob", e))?;

            if !resp.status().is_success() {
                let status = resp.status();
                if Self::is_not_found(status) {
                    return Err(TransportError::NotFound(blob_name).into());
                }
                let body = resp.text().await.unwrap_or_default();
                return Err(Self::status_error("read_blob", status, body));
            }

            resp.bytes()
                .await
                .map_err(|e| Self::request_error("read_blob", e))
        })
    }
}

// -- Tests -------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> StorageConfig {
        StorageConfig {
            account: "labelacct".to_string(),
            container: "images".to_string(),
            // base64("secret")
            account_key: "c2VjcmV0".to_string(),
            ..StorageConfig::default()
        }
    }

    #[test]
    fn test_new_accepts_valid_credentials() {
        let store = AzureBlobStore::new(&settings()).unwrap();
        assert_eq!(store.key_bytes, b"secret");
        assert_eq!(store.base_url, "https://labelacct.blob.core.windows.net");
        assert_eq!(store.base_path, "");
        assert_eq!(store.protocol, "https");
    }

    #[test]
    fn test_new_rejects_bad_account_name() {
        let mut s = settings();
        s.account = "Bad_Account".to_string();
        let err = AzureBlobStore::new(&s).err().unwrap();
        assert!(matches!(err, ConfigError::InvalidCredentials(_)));
    }

    #[test]
    fn test_new_rejects_non_base64_key() {
        let mut s = settings();
        s.account_key = "not base64!!".to_string();
        let err = AzureBlobStore::new(&s).err().unwrap();
        assert!(err.to_string().contains("base64"));
    }

    #[test]
    fn test_emulator_endpoint_path() {
        let mut s = settings();
        s.endpoint = Some("http://127.0.0.1:10000/devstoreaccount1".to_string());
        let store = AzureBlobStore::new(&s).unwrap();
        assert_eq!(store.base_path, "/devstoreaccount1");
        assert_eq!(store.protocol, "https,http");
    }

    #[test]
    fn test_connect_is_idempotent() {
        let store = AzureBlobStore::new(&settings()).unwrap();
        store.connect().unwrap();
        store.connect().unwrap();
        assert!(store.client.get().is_some());
    }

    #[test]
    fn test_blob_url_encoding() {
        let store = AzureBlobStore::new(&settings()).unwrap();
        let url = store.blob_url("images", "cats/my cat.jpg");
        assert_eq!(
            url,
            "https://labelacct.blob.core.windows.net/images/cats/my%20cat.jpg"
        );
    }

    #[test]
    fn test_read_blob_signs_encoded_path() {
        let store = AzureBlobStore::new(&settings()).unwrap();
        let resource = AzureBlobStore::blob_resource("images", "cats/my cat.jpg");
        assert_eq!(resource, "images/cats/my%20cat.jpg");
        assert!(store
            .blob_url("images", "cats/my cat.jpg")
            .ends_with(&format!("/{}", resource)));

        let date = "Sun, 01 Mar 2026 12:00:00 GMT";
        let encoded = store.sign_get(&resource, date, &[]).unwrap();
        let raw = store.sign_get("images/cats/my cat.jpg", date, &[]).unwrap();
        assert_ne!(encoded, raw);
    }

    #[test]
    fn test_sign_get_is_stable() {
        let store = AzureBlobStore::new(&settings()).unwrap();
        let params = vec![
            ("restype".to_string(), "container".to_string()),
            ("comp".to_string(), "list".to_string()),
        ];
        let date = "Sun, 01 Mar 2026 12:00:00 GMT";
        let a = store.sign_get("images", date, &params).unwrap();
        let b = store.sign_get("images", date, &params).unwrap();
        assert_eq!(a, b);
        assert!(a.starts_with("SharedKey labelacct:"));
    }

    #[test]
    fn test_issue_read_token() {
        let store = AzureBlobStore::new(&settings()).unwrap();
        let window = TokenWindow::read_window(chrono::Utc::now());
        let token = store.issue_read_token("images", &window).unwrap();
        assert!(token.starts_with('?'));
        assert!(token.contains("sp=r"));
    }

    #[test]
    fn test_parse_list_response_blobs_and_marker() {
        let body = r#"<?xml version="1.0" encoding="utf-8"?>
<EnumerationResults ServiceEndpoint="https://labelacct.blob.core.windows.net/" ContainerName="images">
  <Prefix>cats/</Prefix>
  <Blobs>
    <Blob><Name>cats/a.jpg</Name><Properties><Content-Length>10</Content-Length></Properties></Blob>
    <Blob><Name>cats/b &amp; c.jpg</Name><Properties /></Blob>
  </Blobs>
  <NextMarker>2!72!MDAwMDE</NextMarker>
</EnumerationResults>"#;
        let parsed = parse_list_response(body).unwrap();
        assert_eq!(parsed.blobs, vec!["cats/a.jpg", "cats/b & c.jpg"]);
        assert!(parsed.prefixes.is_empty());
        assert_eq!(parsed.next_marker.as_deref(), Some("2!72!MDAwMDE"));
    }

    #[test]
    fn test_parse_list_response_prefixes_last_page() {
        let body = r#"<?xml version="1.0" encoding="utf-8"?>
<EnumerationResults ContainerName="images">
  <Prefix>labelled/</Prefix>
  <Delimiter>/</Delimiter>
  <Blobs>
    <BlobPrefix><Name>labelled/cats/</Name></BlobPrefix>
    <BlobPrefix><Name>labelled/dogs/</Name></BlobPrefix>
    <Blob><Name>labelled/readme.txt</Name></Blob>
  </Blobs>
  <NextMarker />
</EnumerationResults>"#;
        let parsed = parse_list_response(body).unwrap();
        assert_eq!(parsed.prefixes, vec!["labelled/cats/", "labelled/dogs/"]);
        assert_eq!(parsed.blobs, vec!["labelled/readme.txt"]);
        assert_eq!(parsed.next_marker, None);
    }

    #[test]
    fn test_parse_list_response_malformed() {
        assert!(parse_list_response("<EnumerationResults><Blobs></Nope>").is_err());
    }

    #[test]
    fn test_is_not_found() {
        assert!(AzureBlobStore::is_not_found(StatusCode::NOT_FOUND));
        assert!(!AzureBlobStore::is_not_found(StatusCode::OK));
        assert!(!AzureBlobStore::is_not_found(StatusCode::FORBIDDEN));
    }

    #[test]
    fn test_rfc1123_date_format() {
        let date = AzureBlobStore::rfc1123_date();
        assert!(date.ends_with("GMT"));
        assert!(date.contains(','));
    }
}
