//! Labelled blob source: the application-level facade.
//!
//! Wires the configuration, the storage gateway, the label index, the
//! classification sink and the browsing cursor together.  The CLI only
//! talks to this type.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::catalog::{container_label, LabelIndex};
use crate::config::{save_config, Config};
use crate::cursor::{BrowsingCursor, CancelHandle, SourceFile};
use crate::errors::{SourceError, SourceResult};
use crate::sink::{ClassificationSink, JsonlSink};
use crate::storage::backend::BlobStore;
use crate::storage::build_store;
use crate::storage::gateway::StorageGateway;

/// Extension of downloaded files removed by [`LabeledBlobSource::clear_source_files`].
const DOWNLOAD_EXTENSION: &str = "jpg";

/// Facade over one record location and one blob store.
pub struct LabeledBlobSource {
    config: Config,
    config_path: Option<PathBuf>,
    gateway: Arc<StorageGateway>,
    index: LabelIndex,
    sink: Option<Arc<dyn ClassificationSink>>,
    cursor: BrowsingCursor,
}

impl LabeledBlobSource {
    /// Open the source over `store`, loading the catalog from the record
    /// location and selecting its first container.
    pub fn open(
        config: Config,
        store: Arc<dyn BlobStore>,
        sink: Option<Arc<dyn ClassificationSink>>,
    ) -> SourceResult<Self> {
        let gateway = Arc::new(StorageGateway::new(store, config.storage.clone()));
        gateway.connect()?;

        let index = LabelIndex::open(&config.source.record_location)?;
        let cursor = BrowsingCursor::new(
            gateway.clone(),
            sink.clone(),
            config.source.download_dir(),
        );

        let mut source = Self {
            config,
            config_path: None,
            gateway,
            index,
            sink,
            cursor,
        };
        source.select_first_container();
        info!(
            "Labelled blob source opened: {} containers, record location {}",
            source.index.containers().len(),
            source.config.source.record_location.display()
        );
        Ok(source)
    }

    /// Open with the backend named in the configuration and a
    /// [`JsonlSink`] under the record location.
    pub fn from_config(config: Config) -> SourceResult<Self> {
        let store = build_store(&config.storage)?;
        let sink = JsonlSink::open(&config.source.record_location).map_err(SourceError::Sink)?;
        Self::open(config, store, Some(Arc::new(sink)))
    }

    /// Persist configuration changes to `path` on [`Self::reconfigure`].
    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn gateway(&self) -> &StorageGateway {
        &self.gateway
    }

    pub fn cursor(&self) -> &BrowsingCursor {
        &self.cursor
    }

    /// Container keys in catalog order.
    pub fn containers(&self) -> Vec<String> {
        self.index.containers()
    }

    /// Display labels of the containers, in catalog order.
    pub fn container_labels(&self) -> Vec<String> {
        self.index.container_labels()
    }

    pub fn current_container(&self) -> Option<&str> {
        self.cursor.current_container()
    }

    /// Make `container` active. Ignored unless the container is in the
    /// catalog and differs from the active one. Returns whether the
    /// container changed.
    pub fn set_container(&mut self, container: &str) -> bool {
        if !self.index.contains(container) || self.cursor.current_container() == Some(container) {
            debug!("set_container({}) ignored", container);
            return false;
        }
        self.load_container(Some(container.to_string()));
        true
    }

    /// Resolve a container key or display label to a container key.
    pub fn resolve_container(&self, name: &str) -> Option<String> {
        let containers = self.index.containers();
        if containers.iter().any(|c| c == name) {
            return Some(name.to_string());
        }
        containers
            .into_iter()
            .find(|c| container_label(c) == name)
    }

    /// Rescan the configured container and rebuild the catalog.
    ///
    /// The sink is purged once the scan has succeeded; a failed scan
    /// leaves the catalog and the sink as they were.  Returns the new
    /// container labels.
    pub async fn acquire_content(&mut self) -> SourceResult<Vec<String>> {
        let storage = self.gateway.settings().clone();
        info!(
            "Acquiring {} files from {}/{} prefix='{}'",
            self.config.source.file_count, storage.account, storage.container, storage.blob_prefix
        );

        let entries = self
            .index
            .rebuild(
                &self.gateway,
                &storage.container,
                &storage.blob_prefix,
                &storage.file_type,
            )
            .await?;

        if let Some(sink) = &self.sink {
            sink.purge().map_err(SourceError::Sink)?;
        }

        self.select_first_container();
        info!(
            "Acquired {} entries in {} containers",
            entries,
            self.index.containers().len()
        );
        Ok(self.index.container_labels())
    }

    /// Apply `config` with the backend it names.
    pub fn reconfigure(&mut self, config: Config) -> SourceResult<()> {
        let store = build_store(&config.storage)?;
        self.reconfigure_with_store(config, store)
    }

    /// Apply `config` over `store`: save it (when a config path is set)
    /// and replace the gateway, which drops the cached read token.
    ///
    /// The record location is fixed for the lifetime of the source.
    pub fn reconfigure_with_store(
        &mut self,
        config: Config,
        store: Arc<dyn BlobStore>,
    ) -> SourceResult<()> {
        if config.source.record_location != self.config.source.record_location {
            warn!(
                "record_location change to {} takes effect on next open",
                config.source.record_location.display()
            );
        }
        if let Some(path) = &self.config_path {
            save_config(path, &config)?;
        }

        let gateway = Arc::new(StorageGateway::new(store, config.storage.clone()));
        gateway.connect()?;
        self.cursor.set_gateway(gateway.clone());
        self.gateway = gateway;
        self.config.storage = config.storage;
        self.config.logging = config.logging;
        self.config.observability = config.observability;
        self.config.source.file_count = config.source.file_count;
        self.config.source.delete_source_files_when_complete =
            config.source.delete_source_files_when_complete;
        info!("Configuration updated");
        Ok(())
    }

    /// Delete downloaded files when `delete_source_files_when_complete` is
    /// set. Returns the number of files removed.
    pub fn clear_source_files(&self) -> SourceResult<usize> {
        if !self.config.source.delete_source_files_when_complete {
            return Ok(0);
        }
        let removed = remove_downloads(self.cursor.download_dir())?;
        info!("Removed {} downloaded files", removed);
        Ok(removed)
    }

    // -- Navigation -------------------------------------------------------------

    pub fn can_move_next(&self) -> bool {
        self.cursor.can_move_next()
    }

    pub fn can_move_previous(&self) -> bool {
        self.cursor.can_move_previous()
    }

    pub async fn next_group(&mut self) -> SourceResult<Vec<SourceFile>> {
        Ok(self.cursor.next_group().await?)
    }

    pub async fn previous_group(&mut self) -> SourceResult<Vec<SourceFile>> {
        Ok(self.cursor.previous_group().await?)
    }

    pub fn jump_to(&mut self, target: i64) -> SourceResult<()> {
        Ok(self.cursor.jump_to(target)?)
    }

    pub fn update_item(&self, name: &str, classifications: &[String]) -> SourceResult<bool> {
        self.cursor.update_item(name, classifications)
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cursor.cancel_handle()
    }

    fn select_first_container(&mut self) {
        let first = self.index.containers().into_iter().next();
        self.load_container(first);
    }

    fn load_container(&mut self, container: Option<String>) {
        let items = container
            .as_deref()
            .map(|c| self.index.load_container_data(c))
            .unwrap_or_default();
        self.cursor.load(container, items);
    }
}

fn remove_downloads(dir: &Path) -> std::io::Result<usize> {
    if !dir.exists() {
        return Ok(0);
    }
    let mut removed = 0;
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let is_download = path.is_file()
            && path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case(DOWNLOAD_EXTENSION));
        if is_download {
            std::fs::remove_file(&path)?;
            removed += 1;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{load_config, StorageConfig};
    use crate::sink::{MemorySink, ScoredItem};
    use crate::storage::memory::MemoryBlobStore;
    use tempfile::TempDir;

    fn config(tmp: &TempDir) -> Config {
        let mut config = Config::default();
        config.storage = StorageConfig {
            backend: "memory".to_string(),
            container: "images".to_string(),
            blob_prefix: "labelled/".to_string(),
            ..StorageConfig::default()
        };
        config.source.record_location = tmp.path().join("records");
        config
    }

    async fn seeded_store() -> Arc<MemoryBlobStore> {
        let store = Arc::new(MemoryBlobStore::new());
        for name in [
            "labelled/cats/a.jpg",
            "labelled/cats/b.jpg",
            "labelled/cats/notes.txt",
            "labelled/dogs/c.jpg",
            "other/d.jpg",
        ] {
            store.put("images", name, name.as_bytes().to_vec()).await;
        }
        store
    }

    async fn acquired(tmp: &TempDir) -> (Arc<MemorySink>, LabeledBlobSource) {
        let sink = Arc::new(MemorySink::new());
        let mut source = LabeledBlobSource::open(
            config(tmp),
            seeded_store().await,
            Some(sink.clone() as Arc<dyn ClassificationSink>),
        )
        .unwrap();
        source.acquire_content().await.unwrap();
        (sink, source)
    }

    #[tokio::test]
    async fn test_acquire_content_selects_first_container() {
        let tmp = TempDir::new().unwrap();
        let (_, source) = acquired(&tmp).await;

        assert_eq!(source.containers(), vec!["labelled/cats", "labelled/dogs"]);
        assert_eq!(source.container_labels(), vec!["cats", "dogs"]);
        assert_eq!(source.current_container(), Some("labelled/cats"));
        assert_eq!(source.cursor().collection_count(), 2);
        assert_eq!(source.cursor().current_index(), -1);
    }

    #[tokio::test]
    async fn test_acquire_content_purges_sink() {
        let tmp = TempDir::new().unwrap();
        let (sink, mut source) = acquired(&tmp).await;
        sink.record(ScoredItem {
            container: "labelled/cats".to_string(),
            name: "memory://images/labelled/cats/a.jpg".to_string(),
            classifications: vec!["cat".to_string()],
        })
        .unwrap();

        source.acquire_content().await.unwrap();
        assert!(sink
            .find("labelled/cats", "memory://images/labelled/cats/a.jpg")
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_failed_acquire_keeps_catalog_and_sink() {
        let tmp = TempDir::new().unwrap();
        let sink = Arc::new(MemorySink::new());
        let store = seeded_store().await;
        let mut source = LabeledBlobSource::open(
            config(&tmp),
            store.clone(),
            Some(sink.clone() as Arc<dyn ClassificationSink>),
        )
        .unwrap();
        source.acquire_content().await.unwrap();
        source
            .update_item("a.jpg", &["cat".to_string()])
            .unwrap();

        store.fail_listing_under("labelled/dogs/");
        let err = source.acquire_content().await.unwrap_err();
        assert!(matches!(err, SourceError::Catalog(_)));
        assert_eq!(source.containers(), vec!["labelled/cats", "labelled/dogs"]);
        assert!(sink
            .find("labelled/cats", "memory://images/labelled/cats/a.jpg")
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_catalog_survives_reopen() {
        let tmp = TempDir::new().unwrap();
        let (_, source) = acquired(&tmp).await;
        drop(source);

        let reopened =
            LabeledBlobSource::open(config(&tmp), Arc::new(MemoryBlobStore::new()), None).unwrap();
        assert_eq!(reopened.current_container(), Some("labelled/cats"));
        assert_eq!(reopened.cursor().collection_count(), 2);
    }

    #[tokio::test]
    async fn test_set_container() {
        let tmp = TempDir::new().unwrap();
        let (_, mut source) = acquired(&tmp).await;
        source.next_group().await.unwrap();

        assert!(!source.set_container("labelled/cats"));
        assert_eq!(source.cursor().current_index(), 1);

        assert!(!source.set_container("labelled/birds"));
        assert_eq!(source.current_container(), Some("labelled/cats"));

        assert!(source.set_container("labelled/dogs"));
        assert_eq!(source.cursor().current_index(), -1);
        assert_eq!(source.cursor().collection_count(), 1);
    }

    #[tokio::test]
    async fn test_resolve_container() {
        let tmp = TempDir::new().unwrap();
        let (_, source) = acquired(&tmp).await;
        assert_eq!(
            source.resolve_container("dogs").as_deref(),
            Some("labelled/dogs")
        );
        assert_eq!(
            source.resolve_container("labelled/cats").as_deref(),
            Some("labelled/cats")
        );
        assert_eq!(source.resolve_container("birds"), None);
    }

    #[tokio::test]
    async fn test_browse_and_clear_source_files() {
        let tmp = TempDir::new().unwrap();
        let (_, mut source) = acquired(&tmp).await;
        let batch = source.next_group().await.unwrap();
        assert_eq!(batch.len(), 2);
        assert!(batch.iter().all(|f| f.downloaded && f.disk_location.exists()));

        let keep = source.cursor().download_dir().join("keep.txt");
        std::fs::write(&keep, "x").unwrap();

        assert_eq!(source.clear_source_files().unwrap(), 2);
        assert!(batch.iter().all(|f| !f.disk_location.exists()));
        assert!(keep.exists());
    }

    #[tokio::test]
    async fn test_clear_source_files_disabled() {
        let tmp = TempDir::new().unwrap();
        let mut cfg = config(&tmp);
        cfg.source.delete_source_files_when_complete = false;
        let mut source = LabeledBlobSource::open(cfg, seeded_store().await, None).unwrap();
        source.acquire_content().await.unwrap();
        source.next_group().await.unwrap();
        assert_eq!(source.clear_source_files().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reconfigure_saves_and_resets_token_cache() {
        let tmp = TempDir::new().unwrap();
        let config_path = tmp.path().join("bloblabel.yaml");
        let first = seeded_store().await;
        let mut source = LabeledBlobSource::open(config(&tmp), first.clone(), None)
            .unwrap()
            .with_config_path(&config_path);
        source.acquire_content().await.unwrap();
        source.next_group().await.unwrap();
        assert_eq!(first.tokens_issued(), 1);

        let second = seeded_store().await;
        let mut updated = config(&tmp);
        updated.source.file_count = 42;
        source
            .reconfigure_with_store(updated, second.clone())
            .unwrap();
        assert_eq!(load_config(&config_path).unwrap().source.file_count, 42);

        source.jump_to(1).unwrap();
        source.next_group().await.unwrap();
        assert_eq!(first.tokens_issued(), 1);
        assert_eq!(second.tokens_issued(), 1);
    }

    #[tokio::test]
    async fn test_jump_to_error_surfaces() {
        let tmp = TempDir::new().unwrap();
        let (_, mut source) = acquired(&tmp).await;
        let err = source.jump_to(5).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Jump to index must be within the collection size :: 1-2"
        );
    }

    #[test]
    fn test_from_config_rejects_unknown_backend() {
        let tmp = TempDir::new().unwrap();
        let mut cfg = config(&tmp);
        cfg.storage.backend = "ftp".to_string();
        assert!(matches!(
            LabeledBlobSource::from_config(cfg),
            Err(SourceError::Config(_))
        ));
    }
}
