//! Browsing cursor over one container's catalog entries.
//!
//! The cursor holds the ordered entries of the active container and an
//! index into them.  The index is `-1` before the first item and never
//! leaves `[-1, len - 1]`.  Items are revealed in batches of
//! [`BATCH_SIZE`]: each revealed item is downloaded to a fresh file under
//! the download directory and annotated with any classification the sink
//! already holds for it.

use metrics::counter;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::{NavigationError, SourceError, TransportError};
use crate::metrics::ITEMS_REVEALED_TOTAL;
use crate::sink::{ClassificationSink, ScoredItem};
use crate::storage::backend::{file_name, BlobRef};
use crate::storage::gateway::StorageGateway;

/// Items revealed per group.
pub const BATCH_SIZE: usize = 6;

/// Positions rewound by [`BrowsingCursor::previous_group`] before the
/// forward reveal.
const PREVIOUS_REWIND: isize = 2 * BATCH_SIZE as isize + 1;

/// One revealed item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceFile {
    /// Final path segment of the blob URL.
    pub name: String,
    /// Local file the blob was downloaded to.
    pub disk_location: PathBuf,
    /// Whether the download succeeded.
    pub downloaded: bool,
    /// Labels already recorded for the item.
    pub classifications: Vec<String>,
}

/// Cooperative cancellation flag for a running group call.
///
/// Cloned handles share the flag.  The flag is cleared when a group call
/// starts and checked before each item.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Position over the active container's entries.
pub struct BrowsingCursor {
    gateway: Arc<StorageGateway>,
    sink: Option<Arc<dyn ClassificationSink>>,
    download_dir: PathBuf,
    current_container: Option<String>,
    index: isize,
    items: Vec<BlobRef>,
    cancel: CancelHandle,
}

impl BrowsingCursor {
    pub fn new(
        gateway: Arc<StorageGateway>,
        sink: Option<Arc<dyn ClassificationSink>>,
        download_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            gateway,
            sink,
            download_dir: download_dir.into(),
            current_container: None,
            index: -1,
            items: Vec::new(),
            cancel: CancelHandle::default(),
        }
    }

    /// Make `container` active with `items`, positioned before the first.
    pub fn load(&mut self, container: Option<String>, items: Vec<BlobRef>) {
        debug!(
            "Cursor loaded: container={:?} items={}",
            container,
            items.len()
        );
        self.current_container = container;
        self.items = items;
        self.index = -1;
    }

    /// Swap the gateway used for tokens and downloads.
    pub fn set_gateway(&mut self, gateway: Arc<StorageGateway>) {
        self.gateway = gateway;
    }

    pub fn current_container(&self) -> Option<&str> {
        self.current_container.as_deref()
    }

    /// Zero-based index of the last revealed item, `-1` before the first.
    pub fn current_index(&self) -> isize {
        self.index
    }

    pub fn collection_count(&self) -> usize {
        self.items.len()
    }

    /// URLs of the active container's items, in catalog order.
    pub fn collection_names(&self) -> Vec<String> {
        self.items.iter().map(|b| b.url.clone()).collect()
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    /// Handle that stops the running group call before its next item.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn can_move_next(&self) -> bool {
        self.index < self.items.len() as isize - 1
    }

    pub fn can_move_previous(&self) -> bool {
        self.index >= 0
    }

    /// Reveal up to [`BATCH_SIZE`] items after the current position.
    ///
    /// Returns an empty batch at the end of the collection.  A failed
    /// download does not end the batch; the item comes back with
    /// `downloaded == false`.
    pub async fn next_group(&mut self) -> Result<Vec<SourceFile>, TransportError> {
        self.cancel.reset();
        if !self.can_move_next() {
            return Ok(Vec::new());
        }
        let token = self.prepare_reveal().await?;
        if self.index < -1 {
            self.index = -1;
        }
        Ok(self.reveal_forward(&token).await)
    }

    /// Rewind by `2 * BATCH_SIZE + 1` and reveal forward from there.
    ///
    /// Near the start of the collection this does not reproduce the
    /// previous batch; the index is clamped to `-1` and the first batch
    /// comes back instead.  Returns an empty batch when nothing has been
    /// revealed yet.  On error the position is unchanged.
    pub async fn previous_group(&mut self) -> Result<Vec<SourceFile>, TransportError> {
        self.cancel.reset();
        if !self.can_move_previous() {
            return Ok(Vec::new());
        }
        let token = self.prepare_reveal().await?;
        self.index = (self.index - PREVIOUS_REWIND).max(-1);
        Ok(self.reveal_forward(&token).await)
    }

    /// Fallible setup of a group call: the read token and the download
    /// directory. Runs before the index moves.
    async fn prepare_reveal(&self) -> Result<String, TransportError> {
        let token = self.gateway.read_token("")?;
        tokio::fs::create_dir_all(&self.download_dir)
            .await
            .map_err(|source| TransportError::LocalWrite {
                path: self.download_dir.display().to_string(),
                source,
            })?;
        Ok(token)
    }

    async fn reveal_forward(&mut self, token: &str) -> Vec<SourceFile> {
        let mut revealed = Vec::new();
        while self.can_move_next() && revealed.len() < BATCH_SIZE {
            if self.cancel.is_cancelled() {
                info!(
                    "Group cancelled after {} items at index {}",
                    revealed.len(),
                    self.index
                );
                break;
            }
            self.index += 1;
            let blob = self.items[self.index as usize].clone();
            revealed.push(self.reveal(&blob, token).await);
        }

        counter!(ITEMS_REVEALED_TOTAL).increment(revealed.len() as u64);
        revealed
    }

    /// Position so the next group starts at the one-based `target`.
    pub fn jump_to(&mut self, target: i64) -> Result<(), NavigationError> {
        let len = self.items.len();
        if len == 0 {
            return Err(NavigationError::EmptyCollection);
        }
        if target < 1 || target > len as i64 {
            return Err(NavigationError::OutOfRange {
                requested: target,
                len,
            });
        }
        self.index = target as isize - 2;
        Ok(())
    }

    /// Boolean form of [`Self::jump_to`]; the error is logged.
    pub fn jump_to_ok(&mut self, target: i64) -> bool {
        match self.jump_to(target) {
            Ok(()) => true,
            Err(e) => {
                warn!("Jump To rejected: {}", e);
                false
            }
        }
    }

    /// Record `classifications` for the item whose file name matches
    /// `name` (case-insensitive).
    ///
    /// Returns whether a record was written.
    pub fn update_item(&self, name: &str, classifications: &[String]) -> Result<bool, SourceError> {
        let Some(sink) = self.sink.as_ref() else {
            return Ok(false);
        };
        let wanted = name.to_lowercase();
        let Some(blob) = self
            .items
            .iter()
            .find(|b| file_name(&b.url).to_lowercase() == wanted)
        else {
            debug!("No item named {} in the active container", name);
            return Ok(false);
        };

        sink.record(ScoredItem {
            container: self.current_container.clone().unwrap_or_default(),
            name: blob.url.clone(),
            classifications: classifications.to_vec(),
        })
        .map_err(SourceError::Sink)?;
        Ok(true)
    }

    async fn reveal(&self, blob: &BlobRef, token: &str) -> SourceFile {
        let disk_location = self
            .download_dir
            .join(format!("{}.jpg", Uuid::new_v4().simple()));
        let url = format!("{}{}", blob.url, token);
        let downloaded = self.gateway.try_download_blob(&url, &disk_location).await;

        let mut classifications = Vec::new();
        if let (Some(sink), Some(container)) = (&self.sink, &self.current_container) {
            match sink.find(container, &blob.url) {
                Ok(Some(found)) => classifications = found.classifications,
                Ok(None) => {}
                Err(e) => warn!("Classification lookup for {} failed: {}", blob.name, e),
            }
        }

        SourceFile {
            name: file_name(&blob.url),
            disk_location,
            downloaded,
            classifications,
        }
    }
}
