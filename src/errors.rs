//! Error types for the labelling engine.
//!
//! Each concern gets its own enum so callers can match on what actually
//! went wrong: configuration problems are fatal, transport failures are
//! recoverable while browsing, navigation misuse is a user-facing
//! validation error, and catalog failures leave the prior catalog intact.
//! [`SourceError`] wraps them all for the facade and the CLI.

use thiserror::Error;

/// Missing or malformed configuration and credentials.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read or written.
    #[error("configuration file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid YAML for [`crate::config::Config`].
    #[error("configuration file {path} is malformed: {message}")]
    Malformed { path: String, message: String },

    /// Storage account credentials failed validation.
    #[error("invalid storage credentials: {0}")]
    InvalidCredentials(String),

    /// The configured backend name is not known.
    #[error("unknown storage backend '{0}' (expected 'azure' or 'memory')")]
    UnknownBackend(String),
}

/// A failure talking to the blob store.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The request could not be sent or the response body not read.
    #[error("{operation} request failed: {message}")]
    Request { operation: String, message: String },

    /// The store answered with a non-success status.
    #[error("{operation}: HTTP {status} - {body}")]
    Status {
        operation: String,
        status: u16,
        body: String,
    },

    /// The requested blob does not exist.
    #[error("blob not found: {0}")]
    NotFound(String),

    /// Writing the downloaded bytes to disk failed.
    #[error("failed to write {path}: {source}")]
    LocalWrite {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Any other backend failure.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Misuse of the browsing cursor, reported to the operator.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum NavigationError {
    /// A jump was requested while no items are loaded.
    #[error("A collection must be present to use the Jump To function.")]
    EmptyCollection,

    /// A jump target outside `1..=len`.
    #[error("Jump to index must be within the collection size :: 1-{len}")]
    OutOfRange { requested: i64, len: usize },
}

/// Failure reading or writing the persisted catalog.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// File system failure on the catalog file.
    #[error("catalog I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A catalog line could not be decoded.
    #[error("catalog line {line} is malformed: {message}")]
    Decode { line: usize, message: String },

    /// An entry could not be serialized for writing.
    #[error("catalog entry could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),

    /// The scan feeding a rebuild failed; the previous catalog is kept.
    #[error("catalog scan failed: {0}")]
    Scan(#[from] TransportError),
}

/// Top-level error for the blob source facade and the CLI.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Navigation(#[from] NavigationError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    /// Classification sink failure.
    #[error("classification sink: {0}")]
    Sink(#[source] anyhow::Error),

    /// Local file system failure outside the catalog.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias used by the facade.
pub type SourceResult<T> = Result<T, SourceError>;
