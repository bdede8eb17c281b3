//! In-memory blob store.
//!
//! Blobs are held in a `tokio::sync::RwLock<BTreeMap<...>>` keyed by
//! `(container, blob_name)`, so listings come back in the same
//! lexicographic order the Blob service uses.  URLs have the form
//! `memory://{container}/{blob_name}` and tokens are opaque counters.
//!
//! Listing can be paged with a small `page_size` and individual prefixes
//! can be made to fail, which lets tests drive continuation markers and
//! partial-scan failures without a network.

use bytes::Bytes;
use std::collections::BTreeMap;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use super::backend::{BlobItem, BlobPage, BlobStore, TokenWindow};
use super::sas::sas_time;
use crate::errors::TransportError;

const URL_SCHEME: &str = "memory://";

/// Blob names are percent-encoded in URLs, keeping `/`.
const NAME_ENCODE_SET: percent_encoding::AsciiSet = percent_encoding::NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'/');

/// In-memory blob store.
pub struct MemoryBlobStore {
    /// `(container, blob_name)` -> data.
    blobs: tokio::sync::RwLock<BTreeMap<(String, String), Bytes>>,
    /// Maximum items per listing page.
    page_size: usize,
    /// Prefixes whose listing fails with a transport error.
    failing_prefixes: Mutex<Vec<String>>,
    /// Number of tokens issued so far.
    tokens_issued: AtomicUsize,
    /// Set once `connect()` has run.
    connected: AtomicBool,
}

impl Default for MemoryBlobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBlobStore {
    /// Create an empty store with a page size of 5000 (the Blob service
    /// default).
    pub fn new() -> Self {
        Self::with_page_size(5000)
    }

    /// Create an empty store that pages listings every `page_size` items.
    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            blobs: tokio::sync::RwLock::new(BTreeMap::new()),
            page_size: page_size.max(1),
            failing_prefixes: Mutex::new(Vec::new()),
            tokens_issued: AtomicUsize::new(0),
            connected: AtomicBool::new(false),
        }
    }

    /// Store `data` at `container/blob_name`, replacing any previous blob.
    pub async fn put(&self, container: &str, blob_name: &str, data: impl Into<Bytes>) {
        let mut blobs = self.blobs.write().await;
        blobs.insert((container.to_string(), blob_name.to_string()), data.into());
    }

    /// Remove a blob. Missing blobs are ignored.
    pub async fn remove(&self, container: &str, blob_name: &str) {
        let mut blobs = self.blobs.write().await;
        blobs.remove(&(container.to_string(), blob_name.to_string()));
    }

    /// Make every listing whose prefix starts with `prefix` fail.
    pub fn fail_listing_under(&self, prefix: &str) {
        self.failing_prefixes
            .lock()
            .expect("mutex poisoned")
            .push(prefix.to_string());
    }

    /// Clear injected listing failures.
    pub fn clear_failures(&self) {
        self.failing_prefixes.lock().expect("mutex poisoned").clear();
    }

    /// Number of tokens issued.
    pub fn tokens_issued(&self) -> usize {
        self.tokens_issued.load(Ordering::SeqCst)
    }

    /// Whether `connect()` has been called.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// URL of a blob in this store.
    pub fn blob_url(container: &str, blob_name: &str) -> String {
        format!(
            "{}{}/{}",
            URL_SCHEME,
            container,
            percent_encoding::utf8_percent_encode(blob_name, &NAME_ENCODE_SET)
        )
    }

    /// Split a `memory://` URL into `(container, blob_name)`, dropping any
    /// token.
    fn parse_url(url: &str) -> Option<(String, String)> {
        let rest = url.strip_prefix(URL_SCHEME)?;
        let rest = rest.split('?').next().unwrap_or(rest);
        let (container, blob) = rest.split_once('/')?;
        let blob = percent_encoding::percent_decode_str(blob)
            .decode_utf8()
            .ok()?
            .into_owned();
        Some((container.to_string(), blob))
    }

    fn check_failure(&self, prefix: &str) -> anyhow::Result<()> {
        let failing = self.failing_prefixes.lock().expect("mutex poisoned");
        if failing.iter().any(|f| prefix.starts_with(f.as_str())) {
            return Err(TransportError::Status {
                operation: "list_blobs".to_string(),
                status: 503,
                body: format!("injected failure for prefix '{}'", prefix),
            }
            .into());
        }
        Ok(())
    }
}

impl BlobStore for MemoryBlobStore {
    fn connect(&self) -> anyhow::Result<()> {
        self.connected.store(true, Ordering::SeqCst);
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
            self.check_failure(&prefix)?;
            let blobs = self.blobs.read().await;
            let mut prefixes: Vec<String> = Vec::new();
            for (c, name) in blobs.keys() {
                if *c != container {
                    continue;
                }
                let Some(rest) = name.strip_prefix(prefix.as_str()) else {
                    continue;
                };
                if let Some(idx) = rest.find('/') {
                    let dir = format!("{}{}", prefix, &rest[..=idx]);
                    if prefixes.last() != Some(&dir) {
                        prefixes.push(dir);
                    }
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
            self.check_failure(&prefix)?;
            let blobs = self.blobs.read().await;
            // The marker is the last blob name of the previous page.
            let mut matching = blobs
                .keys()
                .filter(|(c, name)| *c == container && name.starts_with(prefix.as_str()))
                .filter(|(_, name)| marker.as_ref().map_or(true, |m| name > m))
                .map(|(_, name)| name.clone());

            let names: Vec<String> = matching.by_ref().take(self.page_size).collect();
            let has_more = matching.next().is_some();
            let next_marker = if has_more { names.last().cloned() } else { None };

            let items = names
                .into_iter()
                .map(|name| BlobItem {
                    url: Self::blob_url(&container, &name),
                    name,
                })
                .collect();
            Ok(BlobPage { items, next_marker })
        })
    }

    fn issue_read_token(&self, container: &str, window: &TokenWindow) -> anyhow::Result<String> {
        let n = self.tokens_issued.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!(
            "?sr=c&sp=r&c={}&se={}&sig=memory-{}",
            container,
            sas_time(&window.expiry),
            n
        ))
    }

    fn download_to(
        &self,
        url: &str,
        dest: &Path,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<u64>> + Send + '_>> {
        let url = url.to_string();
        let dest = dest.to_path_buf();
        Box::pin(async move {
            let (container, blob_name) = Self::parse_url(&url)
                .ok_or_else(|| anyhow::anyhow!("not a memory:// URL: {}", url))?;
            let data = {
                let blobs = self.blobs.read().await;
                blobs
                    .get(&(container, blob_name.clone()))
                    .cloned()
                    .ok_or(TransportError::NotFound(blob_name))?
            };
            tokio::fs::write(&dest, &data)
                .await
                .map_err(|source| TransportError::LocalWrite {
                    path: dest.display().to_string(),
                    source,
                })?;
            Ok(data.len() as u64)
        })
    }

    fn read_blob(
        &self,
        container: &str,
        blob_name: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Bytes>> + Send + '_>> {
        let key = (container.to_string(), blob_name.to_string());
        Box::pin(async move {
            let blobs = self.blobs.read().await;
            blobs
                .get(&key)
                .cloned()
                .ok_or_else(|| anyhow::Error::from(TransportError::NotFound(key.1.clone())))
        })
    }
}
