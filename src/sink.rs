//! Classification sink: where per-item labels are recorded.
//!
//! The core only needs three calls, expressed by [`ClassificationSink`].
//! [`JsonlSink`] persists to `classifications.jsonl` under the record
//! location; later lines for the same `(container, name)` replace earlier
//! ones when the file is replayed.  [`MemorySink`] keeps everything in a
//! map.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

/// File name of the persisted classifications.
pub const SINK_FILE: &str = "classifications.jsonl";

/// One classified item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoredItem {
    /// Container key the item belongs to.
    pub container: String,
    /// Item key: the full blob URL.
    pub name: String,
    /// Labels assigned to the item.
    pub classifications: Vec<String>,
}

/// Persistence collaborator for classifications.
pub trait ClassificationSink: Send + Sync {
    /// Look up the classification recorded for `(container, name)`.
    fn find(&self, container: &str, name: &str) -> anyhow::Result<Option<ScoredItem>>;

    /// Record `item`, replacing any earlier record for the same key.
    fn record(&self, item: ScoredItem) -> anyhow::Result<()>;

    /// Forget every recorded classification.
    fn purge(&self) -> anyhow::Result<()>;
}

type Key = (String, String);

fn key_of(item: &ScoredItem) -> Key {
    (item.container.clone(), item.name.clone())
}

// -- JSONL sink -----------------------------------------------------------------

/// Append-only JSON Lines sink.
pub struct JsonlSink {
    path: PathBuf,
    items: Mutex<HashMap<Key, ScoredItem>>,
}

impl JsonlSink {
    /// Open (or create) `classifications.jsonl` under `record_location`.
    pub fn open(record_location: impl AsRef<Path>) -> anyhow::Result<Self> {
        let root = record_location.as_ref();
        std::fs::create_dir_all(root)?;
        let path = root.join(SINK_FILE);

        let mut items = HashMap::new();
        if path.exists() {
            let reader = BufReader::new(std::fs::File::open(&path)?);
            for (idx, line) in reader.lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let item: ScoredItem = serde_json::from_str(&line).map_err(|e| {
                    anyhow::anyhow!("{} line {}: {}", path.display(), idx + 1, e)
                })?;
                items.insert(key_of(&item), item);
            }
        }
        debug!("Sink opened at {}: {} items", path.display(), items.len());

        Ok(Self {
            path,
            items: Mutex::new(items),
        })
    }

    /// Number of distinct classified items.
    pub fn len(&self) -> usize {
        self.items.lock().expect("mutex poisoned").len()
    }

    /// Whether nothing has been classified.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ClassificationSink for JsonlSink {
    fn find(&self, container: &str, name: &str) -> anyhow::Result<Option<ScoredItem>> {
        let items = self.items.lock().expect("mutex poisoned");
        Ok(items
            .get(&(container.to_string(), name.to_string()))
            .cloned())
    }

    fn record(&self, item: ScoredItem) -> anyhow::Result<()> {
        let json = serde_json::to_string(&item)?;
        let mut items = self.items.lock().expect("mutex poisoned");
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let mut writer = BufWriter::new(file);
        writeln!(writer, "{json}")?;
        writer.flush()?;
        items.insert(key_of(&item), item);
        Ok(())
    }

    fn purge(&self) -> anyhow::Result<()> {
        let mut items = self.items.lock().expect("mutex poisoned");
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        items.clear();
        Ok(())
    }
}

// -- In-memory sink -------------------------------------------------------------

/// Sink that keeps classifications in memory only.
#[derive(Default)]
pub struct MemorySink {
    items: Mutex<HashMap<Key, ScoredItem>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ClassificationSink for MemorySink {
    fn find(&self, container: &str, name: &str) -> anyhow::Result<Option<ScoredItem>> {
        let items = self.items.lock().expect("mutex poisoned");
        Ok(items
            .get(&(container.to_string(), name.to_string()))
            .cloned())
    }

    fn record(&self, item: ScoredItem) -> anyhow::Result<()> {
        self.items
            .lock()
            .expect("mutex poisoned")
            .insert(key_of(&item), item);
        Ok(())
    }

    fn purge(&self) -> anyhow::Result<()> {
        self.items.lock().expect("mutex poisoned").clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn item(container: &str, name: &str, labels: &[&str]) -> ScoredItem {
        ScoredItem {
            container: container.to_string(),
            name: name.to_string(),
            classifications: labels.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_jsonl_last_write_wins_across_reopen() {
        let tmp = TempDir::new().unwrap();
        {
            let sink = JsonlSink::open(tmp.path()).unwrap();
            sink.record(item("cats", "memory://images/cats/a.jpg", &["cat"]))
                .unwrap();
            sink.record(item("cats", "memory://images/cats/a.jpg", &["cat", "tabby"]))
                .unwrap();
            sink.record(item("dogs", "memory://images/cats/a.jpg", &["dog"]))
                .unwrap();
            assert_eq!(sink.len(), 2);
        }

        let sink = JsonlSink::open(tmp.path()).unwrap();
        let found = sink
            .find("cats", "memory://images/cats/a.jpg")
            .unwrap()
            .unwrap();
        assert_eq!(found.classifications, vec!["cat", "tabby"]);
        assert_eq!(
            sink.find("dogs", "memory://images/cats/a.jpg")
                .unwrap()
                .unwrap()
                .classifications,
            vec!["dog"]
        );
        assert!(sink.find("birds", "x").unwrap().is_none());
    }

    #[test]
    fn test_jsonl_purge_removes_file() {
        let tmp = TempDir::new().unwrap();
        let sink = JsonlSink::open(tmp.path()).unwrap();
        sink.record(item("cats", "a", &["cat"])).unwrap();
        assert!(tmp.path().join(SINK_FILE).exists());

        sink.purge().unwrap();
        assert!(sink.is_empty());
        assert!(!tmp.path().join(SINK_FILE).exists());
        // Purging twice is fine.
        sink.purge().unwrap();
    }

    #[test]
    fn test_jsonl_rejects_malformed_line() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join(SINK_FILE), "{\"container\":1}\n").unwrap();
        assert!(JsonlSink::open(tmp.path()).is_err());
    }

    #[test]
    fn test_memory_sink() {
        let sink = MemorySink::new();
        sink.record(item("cats", "a", &["cat"])).unwrap();
        sink.record(item("cats", "a", &["kitten"])).unwrap();
        assert_eq!(
            sink.find("cats", "a").unwrap().unwrap().classifications,
            vec!["kitten"]
        );
        sink.purge().unwrap();
        assert!(sink.find("cats", "a").unwrap().is_none());
    }
}
