//! bloblabel -- labelled image browsing over Azure Blob Storage.
//!
//! A storage container whose top-level directories are labels is scanned
//! into a persisted catalog.  An operator then pages through one label's
//! images in batches, each downloaded to a local temp directory and shown
//! with any classification already recorded for it.  Classifications are
//! kept in a local JSON Lines sink.

pub mod catalog;
pub mod config;
pub mod cursor;
pub mod errors;
pub mod metrics;
pub mod sink;
pub mod source;
pub mod storage;

pub use catalog::LabelIndex;
pub use cursor::{BrowsingCursor, CancelHandle, SourceFile, BATCH_SIZE};
pub use errors::{SourceError, SourceResult};
pub use sink::{ClassificationSink, JsonlSink, MemorySink, ScoredItem};
pub use source::LabeledBlobSource;
pub use storage::gateway::StorageGateway;
