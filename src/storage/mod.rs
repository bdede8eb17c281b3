//! Blob storage access.
//!
//! The [`backend::BlobStore`] trait abstracts over where blobs physically
//! live.  Implementations are the Azure Blob REST backend and an in-memory
//! store.  [`gateway::StorageGateway`] layers token caching, directory
//! walks, lazy listings and downloads on top of a store.

pub mod azure;
pub mod backend;
pub mod gateway;
pub mod memory;
pub mod sas;

use std::sync::Arc;

use crate::config::StorageConfig;
use crate::errors::ConfigError;
use backend::BlobStore;

/// Build the blob store named by `storage.backend`.
pub fn build_store(settings: &StorageConfig) -> Result<Arc<dyn BlobStore>, ConfigError> {
    match settings.backend.as_str() {
        "azure" => Ok(Arc::new(azure::AzureBlobStore::new(settings)?)),
        "memory" => Ok(Arc::new(memory::MemoryBlobStore::new())),
        other => Err(ConfigError::UnknownBackend(other.to_string())),
    }
}
