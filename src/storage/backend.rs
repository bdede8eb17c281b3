//! Abstract blob store trait.
//!
//! Every blob store must implement [`BlobStore`].  The trait exposes the
//! primitives the gateway builds on: one level of prefix listing, one page
//! of recursive blob listing, read-token issuance, and blob retrieval.
//! Futures are boxed by hand so the trait stays object safe.

use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use std::future::Future;
use std::path::Path;
use std::pin::Pin;

/// Clock-skew margin subtracted from a token's start time.
pub const TOKEN_START_SKEW_MINUTES: i64 = 5;

/// Lifetime of a read token.
pub const TOKEN_LIFETIME_HOURS: i64 = 48;

/// An identified remote object: display name plus full storage URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobRef {
    /// Final path segment of the blob name.
    pub name: String,
    /// Full storage URL, optionally token-suffixed.
    pub url: String,
}

/// One raw item of a blob listing page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobItem {
    /// Full blob name within the container.
    pub name: String,
    /// Unsigned URL of the blob.
    pub url: String,
}

/// A page of a recursive blob listing.
#[derive(Debug, Clone, Default)]
pub struct BlobPage {
    /// Blobs on this page, in store order.
    pub items: Vec<BlobItem>,
    /// Continuation marker; `None` on the last page.
    pub next_marker: Option<String>,
}

/// Validity window of a read token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenWindow {
    pub start: DateTime<Utc>,
    pub expiry: DateTime<Utc>,
}

impl TokenWindow {
    /// The standard read window: `[now - 5min, now + 48h]`.
    pub fn read_window(now: DateTime<Utc>) -> Self {
        Self {
            start: now - Duration::minutes(TOKEN_START_SKEW_MINUTES),
            expiry: now + Duration::hours(TOKEN_LIFETIME_HOURS),
        }
    }
}

/// Final path segment of a blob name or URL, percent-decoded, with any
/// query string removed.
pub fn file_name(name_or_url: &str) -> String {
    let without_query = name_or_url.split('?').next().unwrap_or(name_or_url);
    let segment = without_query
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(without_query);
    percent_encoding::percent_decode_str(segment)
        .decode_utf8_lossy()
        .into_owned()
}

/// Final `/` segment of a raw blob name, taken verbatim.
pub fn blob_display_name(blob_name: &str) -> String {
    let trimmed = blob_name.trim_end_matches('/');
    trimmed.rsplit('/').next().unwrap_or(trimmed).to_string()
}

/// Async blob store contract.
pub trait BlobStore: Send + Sync + 'static {
    /// Establish the client handle. Idempotent.
    fn connect(&self) -> anyhow::Result<()>;

    /// List the immediate sub-prefixes ("directories") of `prefix`.
    fn list_prefixes(
        &self,
        container: &str,
        prefix: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<String>>> + Send + '_>>;

    /// Fetch one page of the flat (recursive) blob listing under `prefix`.
    fn list_blob_page(
        &self,
        container: &str,
        prefix: &str,
        marker: Option<String>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<BlobPage>> + Send + '_>>;

    /// Sign a read-only token for `container`, valid over `window`.
    ///
    /// The returned string starts with `?` so it can be appended to a
    /// blob URL directly.
    fn issue_read_token(&self, container: &str, window: &TokenWindow) -> anyhow::Result<String>;

    /// Fetch `url` (typically token-qualified) into `dest`, returning the
    /// number of bytes written.
    fn download_to(
        &self,
        url: &str,
        dest: &Path,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<u64>> + Send + '_>>;

    /// Read a blob fully into memory.
    fn read_blob(
        &self,
        container: &str,
        blob_name: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Bytes>> + Send + '_>>;
}
