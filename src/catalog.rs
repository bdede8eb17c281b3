//! Container label index: the persisted catalog of labelled blobs.
//!
//! The catalog maps a container (a label directory, trimmed of slashes) to
//! the ordered list of blob URLs found under it.  It lives in a JSON Lines
//! file, `catalog.jsonl`, under the record location:
//!
//! ```text
//! {"container":"labelled/cats","url":"https://acct.blob.core.windows.net/images/labelled/cats/a.jpg"}
//! ```
//!
//! Appends go through a mutex so concurrent writers never interleave
//! partial lines.  A rebuild scans the whole store first, writes the new
//! catalog to a temp file and renames it into place; a failed scan leaves
//! the previous catalog untouched on disk and in memory.

use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;
use tempfile::NamedTempFile;
use tracing::{info, warn};

use crate::errors::CatalogError;
use crate::metrics::{CATALOG_REBUILDS_TOTAL, CATALOG_REBUILD_SECONDS};
use crate::storage::backend::{file_name, BlobRef};
use crate::storage::gateway::StorageGateway;

/// File name of the persisted catalog.
pub const CATALOG_FILE: &str = "catalog.jsonl";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CatalogLine {
    container: String,
    url: String,
}

#[derive(Debug, Default)]
struct Inner {
    /// Container keys in insertion order.
    order: Vec<String>,
    entries: HashMap<String, Vec<BlobRef>>,
}

impl Inner {
    fn from_lines(lines: &[CatalogLine]) -> Self {
        let mut inner = Inner::default();
        for line in lines {
            inner.push(&line.container, &line.url);
        }
        inner
    }

    fn push(&mut self, container: &str, url: &str) {
        if !self.entries.contains_key(container) {
            self.order.push(container.to_string());
        }
        let list = self.entries.entry(container.to_string()).or_default();
        list.push(BlobRef {
            name: file_name(url),
            url: url.to_string(),
        });
    }
}

/// Container key for a directory prefix: the prefix trimmed of `/`.
pub fn container_key(directory: &str) -> String {
    directory.trim_matches('/').to_string()
}

/// Display label for a container key: its final `/` segment.
pub fn container_label(container: &str) -> String {
    let trimmed = container.trim_matches('/');
    match trimmed.rfind('/') {
        Some(idx) if idx > 0 => trimmed[idx + 1..].to_string(),
        _ => trimmed.to_string(),
    }
}

/// The persisted container -> blob catalog.
pub struct LabelIndex {
    root_dir: PathBuf,
    inner: Mutex<Inner>,
}

impl LabelIndex {
    /// Open the catalog under `record_location`, loading any existing
    /// `catalog.jsonl`.
    pub fn open(record_location: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let root_dir = record_location.as_ref().to_path_buf();
        std::fs::create_dir_all(&root_dir)?;
        let lines = Self::read_lines(&root_dir.join(CATALOG_FILE))?;
        let inner = Inner::from_lines(&lines);
        info!(
            "Catalog opened at {}: {} containers, {} entries",
            root_dir.display(),
            inner.order.len(),
            lines.len()
        );
        Ok(Self {
            root_dir,
            inner: Mutex::new(inner),
        })
    }

    fn path(&self) -> PathBuf {
        self.root_dir.join(CATALOG_FILE)
    }

    fn read_lines(path: &Path) -> Result<Vec<CatalogLine>, CatalogError> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file = std::fs::File::open(path)?;
        let reader = BufReader::new(file);
        let mut lines = Vec::new();
        for (idx, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: CatalogLine =
                serde_json::from_str(&line).map_err(|e| CatalogError::Decode {
                    line: idx + 1,
                    message: e.to_string(),
                })?;
            lines.push(entry);
        }
        Ok(lines)
    }

    /// Distinct container keys, in catalog order.
    pub fn containers(&self) -> Vec<String> {
        self.inner.lock().expect("mutex poisoned").order.clone()
    }

    /// Display labels of [`Self::containers`], in the same order.
    pub fn container_labels(&self) -> Vec<String> {
        self.containers()
            .iter()
            .map(|c| container_label(c))
            .collect()
    }

    /// Whether `container` is in the catalog.
    pub fn contains(&self, container: &str) -> bool {
        self.inner
            .lock()
            .expect("mutex poisoned")
            .entries
            .contains_key(container)
    }

    /// Entries of one container, in catalog order. Unknown containers
    /// yield an empty list.
    pub fn load_container_data(&self, container: &str) -> Vec<BlobRef> {
        self.inner
            .lock()
            .expect("mutex poisoned")
            .entries
            .get(container)
            .cloned()
            .unwrap_or_default()
    }

    /// Append one entry to the catalog.
    pub fn record_entry(&self, container: &str, url: &str) -> Result<(), CatalogError> {
        let json = serde_json::to_string(&CatalogLine {
            container: container.to_string(),
            url: url.to_string(),
        })?;

        let mut inner = self.inner.lock().expect("mutex poisoned");
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path())?;
        let mut writer = BufWriter::new(file);
        writeln!(writer, "{json}")?;
        writer.flush()?;
        inner.push(container, url);
        Ok(())
    }

    /// Delete the persisted catalog and forget every entry.
    pub fn purge(&self) -> Result<(), CatalogError> {
        let mut inner = self.inner.lock().expect("mutex poisoned");
        let path = self.path();
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        *inner = Inner::default();
        Ok(())
    }

    /// Replace the catalog with a fresh scan of `storage_container`.
    ///
    /// Lists the top-level directories under `root_prefix`, then every blob
    /// below each one that ends with `file_type`.  Directory order and blob
    /// order are kept as the store returns them.  Returns the number of
    /// entries written.
    pub async fn rebuild(
        &self,
        gateway: &StorageGateway,
        storage_container: &str,
        root_prefix: &str,
        file_type: &str,
    ) -> Result<usize, CatalogError> {
        let started = Instant::now();
        let staged = match Self::scan(gateway, storage_container, root_prefix, file_type).await {
            Ok(staged) => staged,
            Err(e) => {
                counter!(CATALOG_REBUILDS_TOTAL, "outcome" => "error").increment(1);
                warn!("Catalog rebuild aborted, previous catalog kept: {}", e);
                return Err(e);
            }
        };

        let mut inner = self.inner.lock().expect("mutex poisoned");
        self.write_catalog(&staged)?;
        *inner = Inner::from_lines(&staged);

        counter!(CATALOG_REBUILDS_TOTAL, "outcome" => "ok").increment(1);
        histogram!(CATALOG_REBUILD_SECONDS).record(started.elapsed().as_secs_f64());
        info!(
            "Catalog rebuilt: {} containers, {} entries",
            inner.order.len(),
            staged.len()
        );
        Ok(staged.len())
    }

    async fn scan(
        gateway: &StorageGateway,
        storage_container: &str,
        root_prefix: &str,
        file_type: &str,
    ) -> Result<Vec<CatalogLine>, CatalogError> {
        let directories = gateway
            .list_directories(storage_container, root_prefix, false)
            .await?;

        let mut staged = Vec::new();
        for directory in &directories {
            let container = container_key(directory);
            let mut listing = gateway.list_blobs(storage_container, directory, file_type, false);
            while let Some(blob) = listing.next().await? {
                staged.push(CatalogLine {
                    container: container.clone(),
                    url: blob.url,
                });
            }
        }
        Ok(staged)
    }

    /// Write `lines` to a temp file next to the catalog and rename it over
    /// the catalog.
    fn write_catalog(&self, lines: &[CatalogLine]) -> Result<(), CatalogError> {
        let temp = NamedTempFile::new_in(&self.root_dir)?;
        {
            let mut writer = BufWriter::new(&temp);
            for line in lines {
                let json = serde_json::to_string(line)?;
                writeln!(writer, "{json}")?;
            }
            writer.flush()?;
        }
        temp.persist(self.path()).map_err(|e| CatalogError::Io(e.error))?;
        Ok(())
    }
}
