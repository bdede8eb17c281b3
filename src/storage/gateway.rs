//! Storage gateway: every interaction the engine has with the blob store.
//!
//! Wraps a [`BlobStore`] with the configured container, prefix and file
//! type, and adds the behavior the rest of the crate relies on:
//!
//! - a per-instance read-token cache that signs at most once per validity
//!   window, even with concurrent callers;
//! - a depth-first directory walk driven by an explicit worklist;
//! - a lazy, page-at-a-time blob listing with suffix filtering;
//! - downloads that report a [`TransportError`] internally and collapse to
//!   a `bool` at the boundary.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use metrics::counter;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use super::backend::{blob_display_name, file_name, BlobItem, BlobRef, BlobStore, TokenWindow};
use crate::config::StorageConfig;
use crate::errors::{ConfigError, TransportError};
use crate::metrics::{
    BLOBS_LISTED_TOTAL, DIRECTORIES_LISTED_TOTAL, DOWNLOADS_TOTAL, DOWNLOAD_BYTES_TOTAL,
    TOKENS_ISSUED_TOTAL,
};

/// A cached token is re-signed once its expiry is this close.
const TOKEN_REFRESH_MARGIN_MINUTES: i64 = 5;

/// Recover a [`TransportError`] that a backend raised through `anyhow`.
fn into_transport(e: anyhow::Error) -> TransportError {
    match e.downcast::<TransportError>() {
        Ok(t) => t,
        Err(e) => TransportError::Other(e),
    }
}

#[derive(Debug, Clone)]
struct CachedToken {
    container: String,
    token: String,
    expiry: DateTime<Utc>,
}

impl CachedToken {
    fn usable_for(&self, container: &str, now: DateTime<Utc>) -> bool {
        self.container == container
            && now + Duration::minutes(TOKEN_REFRESH_MARGIN_MINUTES) < self.expiry
    }
}

/// Gateway over one blob store.
pub struct StorageGateway {
    store: Arc<dyn BlobStore>,
    settings: StorageConfig,
    token: Mutex<Option<CachedToken>>,
}

impl StorageGateway {
    /// Create a gateway with an empty token cache.
    pub fn new(store: Arc<dyn BlobStore>, settings: StorageConfig) -> Self {
        Self {
            store,
            settings,
            token: Mutex::new(None),
        }
    }

    /// The storage settings this gateway was built with.
    pub fn settings(&self) -> &StorageConfig {
        &self.settings
    }

    /// Establish the client handle. Idempotent; failure is a configuration
    /// error and is not retried.
    pub fn connect(&self) -> Result<(), ConfigError> {
        self.store
            .connect()
            .map_err(|e| ConfigError::InvalidCredentials(e.to_string()))
    }

    fn resolve_container<'a>(&'a self, container: &'a str) -> &'a str {
        if container.is_empty() {
            &self.settings.container
        } else {
            container
        }
    }

    /// Return the cached read token for `container`, signing one if none
    /// is cached or the cached one is about to expire.
    pub fn read_token(&self, container: &str) -> Result<String, TransportError> {
        self.read_token_at(container, Utc::now())
    }

    fn read_token_at(&self, container: &str, now: DateTime<Utc>) -> Result<String, TransportError> {
        let container = self.resolve_container(container);
        self.store.connect().map_err(into_transport)?;

        // Held across signing so concurrent callers see a single token.
        let mut cached = self.token.lock().expect("mutex poisoned");
        if let Some(existing) = cached.as_ref() {
            if existing.usable_for(container, now) {
                return Ok(existing.token.clone());
            }
        }

        let window = TokenWindow::read_window(now);
        let token = self
            .store
            .issue_read_token(container, &window)
            .map_err(into_transport)?;
        counter!(TOKENS_ISSUED_TOTAL).increment(1);
        info!(
            "Issued read token: container={} expires={}",
            container, window.expiry
        );
        *cached = Some(CachedToken {
            container: container.to_string(),
            token: token.clone(),
            expiry: window.expiry,
        });
        Ok(token)
    }

    /// List directory prefixes under `prefix`.
    ///
    /// With `recurse`, every discovered prefix is walked as well and the
    /// result is depth-first, parent before children, siblings in store
    /// order.
    pub async fn list_directories(
        &self,
        container: &str,
        prefix: &str,
        recurse: bool,
    ) -> Result<Vec<String>, TransportError> {
        let container = self.resolve_container(container).to_string();
        self.store.connect().map_err(into_transport)?;

        let mut directories = Vec::new();
        let mut worklist: Vec<String> = self
            .store
            .list_prefixes(&container, prefix)
            .await
            .map_err(into_transport)?;
        worklist.reverse();

        while let Some(dir) = worklist.pop() {
            if recurse {
                let mut children = self
                    .store
                    .list_prefixes(&container, &dir)
                    .await
                    .map_err(into_transport)?;
                children.reverse();
                worklist.extend(children);
            }
            directories.push(dir);
        }

        counter!(DIRECTORIES_LISTED_TOTAL).increment(directories.len() as u64);
        debug!(
            "Listed {} directories: container={} prefix='{}' recurse={}",
            directories.len(),
            container,
            prefix,
            recurse
        );
        Ok(directories)
    }

    /// Lazily list blobs under `prefix` (recursively).
    ///
    /// A non-empty `file_type` keeps only names ending with it (exact,
    /// case-sensitive).  With `include_token`, each URL gets the cached
    /// read token appended.
    pub fn list_blobs(
        &self,
        container: &str,
        prefix: &str,
        file_type: &str,
        include_token: bool,
    ) -> BlobListing<'_> {
        BlobListing {
            gateway: self,
            container: self.resolve_container(container).to_string(),
            prefix: prefix.to_string(),
            file_type: file_type.to_string(),
            include_token,
            token: None,
            buffer: VecDeque::new(),
            marker: None,
            exhausted: false,
        }
    }

    /// [`Self::list_blobs`] with the configured container, prefix and file
    /// type.
    pub fn list_configured_blobs(&self, include_token: bool) -> BlobListing<'_> {
        self.list_blobs(
            &self.settings.container,
            &self.settings.blob_prefix,
            &self.settings.file_type,
            include_token,
        )
    }

    /// Download `url` into `local_path`, returning the bytes written.
    pub async fn download_blob(&self, url: &str, local_path: &Path) -> Result<u64, TransportError> {
        self.store.connect().map_err(into_transport)?;
        match self.store.download_to(url, local_path).await {
            Ok(bytes) => {
                counter!(DOWNLOADS_TOTAL, "outcome" => "ok").increment(1);
                counter!(DOWNLOAD_BYTES_TOTAL).increment(bytes);
                debug!("Downloaded {} bytes to {}", bytes, local_path.display());
                Ok(bytes)
            }
            Err(e) => {
                counter!(DOWNLOADS_TOTAL, "outcome" => "error").increment(1);
                Err(into_transport(e))
            }
        }
    }

    /// Boolean form of [`Self::download_blob`]: failures are logged and
    /// reported as `false`, never raised.
    pub async fn try_download_blob(&self, url: &str, local_path: &Path) -> bool {
        match self.download_blob(url, local_path).await {
            Ok(_) => true,
            Err(e) => {
                warn!(
                    "Download of {} to {} failed: {}",
                    file_name(url),
                    local_path.display(),
                    e
                );
                false
            }
        }
    }

    /// Fetch a blob into memory and return it base64-encoded.
    ///
    /// Memory use is proportional to the blob size; meant for small
    /// assets only.
    pub async fn blob_as_base64(
        &self,
        container: &str,
        blob_name: &str,
    ) -> Result<String, TransportError> {
        let container = self.resolve_container(container).to_string();
        self.store.connect().map_err(into_transport)?;
        let data = self
            .store
            .read_blob(&container, blob_name)
            .await
            .map_err(into_transport)?;
        Ok(BASE64_STANDARD.encode(&data))
    }
}

/// A single forward pass over a blob listing.
///
/// Pages are fetched on demand; nothing is materialized beyond the current
/// page.
pub struct BlobListing<'a> {
    gateway: &'a StorageGateway,
    container: String,
    prefix: String,
    file_type: String,
    include_token: bool,
    token: Option<String>,
    buffer: VecDeque<BlobItem>,
    marker: Option<String>,
    exhausted: bool,
}

impl BlobListing<'_> {
    /// Next matching blob, or `None` once the listing is exhausted.
    pub async fn next(&mut self) -> Result<Option<BlobRef>, TransportError> {
        loop {
            while let Some(item) = self.buffer.pop_front() {
                if !self.file_type.is_empty() && !item.name.ends_with(&self.file_type) {
                    continue;
                }
                let url = if self.include_token {
                    if self.token.is_none() {
                        self.token = Some(self.gateway.read_token(&self.container)?);
                    }
                    format!("{}{}", item.url, self.token.as_deref().unwrap_or_default())
                } else {
                    item.url
                };
                counter!(BLOBS_LISTED_TOTAL).increment(1);
                return Ok(Some(BlobRef {
                    name: blob_display_name(&item.name),
                    url,
                }));
            }

            if self.exhausted {
                return Ok(None);
            }

            self.gateway.store.connect().map_err(into_transport)?;
            let page = self
                .gateway
                .store
                .list_blob_page(&self.container, &self.prefix, self.marker.take())
                .await
                .map_err(into_transport)?;
            self.exhausted = page.next_marker.is_none();
            self.marker = page.next_marker;
            self.buffer.extend(page.items);
        }
    }

    /// Drain the remaining listing into a vector.
    pub async fn collect_all(mut self) -> Result<Vec<BlobRef>, TransportError> {
        let mut all = Vec::new();
        while let Some(blob) = self.next().await? {
            all.push(blob);
        }
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryBlobStore;

    fn settings() -> StorageConfig {
        StorageConfig {
            backend: "memory".to_string(),
            container: "images".to_string(),
            blob_prefix: "labelled/".to_string(),
            file_type: ".jpg".to_string(),
            ..StorageConfig::default()
        }
    }

    async fn gateway_with(blobs: &[&str], page_size: usize) -> (Arc<MemoryBlobStore>, StorageGateway) {
        let store = Arc::new(MemoryBlobStore::with_page_size(page_size));
        for name in blobs {
            store.put("images", name, name.as_bytes().to_vec()).await;
        }
        let gateway = StorageGateway::new(store.clone(), settings());
        (store, gateway)
    }

    #[tokio::test]
    async fn test_read_token_is_cached() {
        let (store, gateway) = gateway_with(&[], 10).await;
        let first = gateway.read_token("images").unwrap();
        let second = gateway.read_token("images").unwrap();
        assert_eq!(first, second);
        assert_eq!(store.tokens_issued(), 1);
    }

    #[tokio::test]
    async fn test_read_token_empty_container_uses_configured() {
        let (store, gateway) = gateway_with(&[], 10).await;
        let a = gateway.read_token("").unwrap();
        let b = gateway.read_token("images").unwrap();
        assert_eq!(a, b);
        assert_eq!(store.tokens_issued(), 1);
    }

    #[tokio::test]
    async fn test_read_token_refreshes_near_expiry() {
        let (store, gateway) = gateway_with(&[], 10).await;
        let now = Utc::now();
        let first = gateway.read_token_at("images", now).unwrap();
        let later = now + Duration::hours(47) + Duration::minutes(56);
        let second = gateway.read_token_at("images", later).unwrap();
        assert_ne!(first, second);
        assert_eq!(store.tokens_issued(), 2);
    }

    #[tokio::test]
    async fn test_read_token_single_issue_across_threads() {
        let (store, gateway) = gateway_with(&[], 10).await;
        let gateway = Arc::new(gateway);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let g = gateway.clone();
                std::thread::spawn(move || g.read_token("images").unwrap())
            })
            .collect();
        let tokens: Vec<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(tokens.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(store.tokens_issued(), 1);
    }

    #[tokio::test]
    async fn test_list_directories_flat_and_recursive() {
        let (_, gateway) = gateway_with(
            &[
                "labelled/cats/a.jpg",
                "labelled/cats/kittens/b.jpg",
                "labelled/cats/kittens/tiny/c.jpg",
                "labelled/dogs/d.jpg",
                "labelled/top.jpg",
            ],
            10,
        )
        .await;

        let flat = gateway
            .list_directories("images", "labelled/", false)
            .await
            .unwrap();
        assert_eq!(flat, vec!["labelled/cats/", "labelled/dogs/"]);

        let deep = gateway
            .list_directories("images", "labelled/", true)
            .await
            .unwrap();
        assert_eq!(
            deep,
            vec![
                "labelled/cats/",
                "labelled/cats/kittens/",
                "labelled/cats/kittens/tiny/",
                "labelled/dogs/",
            ]
        );
    }

    #[tokio::test]
    async fn test_list_directories_leaf_is_empty() {
        let (_, gateway) = gateway_with(&["labelled/dogs/d.jpg"], 10).await;
        let dirs = gateway
            .list_directories("images", "labelled/dogs/", true)
            .await
            .unwrap();
        assert!(dirs.is_empty());
    }

    #[tokio::test]
    async fn test_list_blobs_filter_suffix() {
        let (_, gateway) = gateway_with(
            &["labelled/a/x.jpg", "labelled/a/y.png", "labelled/a/z.JPG"],
            10,
        )
        .await;
        let filtered = gateway
            .list_blobs("images", "labelled/", ".jpg", false)
            .collect_all()
            .await
            .unwrap();
        let names: Vec<&str> = filtered.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, vec!["x.jpg"]);

        let all = gateway
            .list_blobs("images", "labelled/", "", false)
            .collect_all()
            .await
            .unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn test_list_blobs_keeps_raw_names() {
        let (_, gateway) =
            gateway_with(&["labelled/a/100%25.jpg", "labelled/a/what?.jpg"], 10).await;
        let all = gateway
            .list_blobs("images", "labelled/", "", false)
            .collect_all()
            .await
            .unwrap();
        let names: Vec<&str> = all.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, vec!["100%25.jpg", "what?.jpg"]);
    }

    #[tokio::test]
    async fn test_list_blobs_pages_and_token() {
        let blobs: Vec<String> = (0..7).map(|i| format!("labelled/a/{i}.jpg")).collect();
        let refs: Vec<&str> = blobs.iter().map(String::as_str).collect();
        let (store, gateway) = gateway_with(&refs, 3).await;

        let mut listing = gateway.list_configured_blobs(true);
        let mut seen = Vec::new();
        while let Some(blob) = listing.next().await.unwrap() {
            assert!(blob.url.starts_with("memory://images/labelled/a/"));
            assert!(blob.url.contains("?sr=c&sp=r"));
            seen.push(blob.name);
        }
        assert_eq!(seen.len(), 7);
        assert_eq!(seen[0], "0.jpg");
        assert_eq!(seen[6], "6.jpg");
        assert_eq!(store.tokens_issued(), 1);
    }

    #[tokio::test]
    async fn test_list_blobs_without_token_has_plain_url() {
        let (store, gateway) = gateway_with(&["labelled/a/x.jpg"], 10).await;
        let all = gateway.list_configured_blobs(false).collect_all().await.unwrap();
        assert_eq!(all[0].url, "memory://images/labelled/a/x.jpg");
        assert_eq!(store.tokens_issued(), 0);
    }

    #[tokio::test]
    async fn test_download_blob_reports_and_collapses_errors() {
        let (_, gateway) = gateway_with(&["labelled/a/x.jpg"], 10).await;
        let tmp = tempfile::tempdir().unwrap();

        let ok = tmp.path().join("ok.jpg");
        let url = MemoryBlobStore::blob_url("images", "labelled/a/x.jpg");
        assert_eq!(gateway.download_blob(&url, &ok).await.unwrap(), 16);
        assert!(gateway.try_download_blob(&url, &ok).await);

        let missing = MemoryBlobStore::blob_url("images", "labelled/a/missing.jpg");
        let err = gateway
            .download_blob(&missing, &tmp.path().join("m.jpg"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::NotFound(_)));
        assert!(!gateway.try_download_blob(&missing, &tmp.path().join("m.jpg")).await);
    }

    #[tokio::test]
    async fn test_blob_as_base64() {
        let store = Arc::new(MemoryBlobStore::new());
        store.put("images", "icon.png", vec![0u8, 1, 2, 255]).await;
        let gateway = StorageGateway::new(store, settings());
        let encoded = gateway.blob_as_base64("images", "icon.png").await.unwrap();
        assert_eq!(encoded, "AAEC/w==");
        assert!(gateway.blob_as_base64("images", "nope.png").await.is_err());
    }

    #[tokio::test]
    async fn test_connect_marks_store() {
        let (store, gateway) = gateway_with(&[], 10).await;
        gateway.connect().unwrap();
        assert!(store.is_connected());
    }
}
