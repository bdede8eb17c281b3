//! Configuration loading and types for bloblabel.
//!
//! Configuration is read from a YAML file and deserialized into the
//! [`Config`] struct.  A missing file is created with defaults on first
//! load, and saving rewrites the whole document.  Each subsection governs
//! a different part of the system: the blob store, the local record
//! location, logging, and observability.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::errors::ConfigError;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Blob store settings.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Local record / download settings.
    #[serde(default)]
    pub source: SourceConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Observability settings.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Blob store configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Backend type: `azure` or `memory`.
    #[serde(default = "default_storage_backend")]
    pub backend: String,

    /// Azure storage account name.
    #[serde(default)]
    pub account: String,

    /// Base64 account key. Falls back to `AZURE_STORAGE_KEY` when empty.
    #[serde(default)]
    pub account_key: String,

    /// Container holding the labelled directories.
    #[serde(default)]
    pub container: String,

    /// Prefix under which label directories live.
    #[serde(default)]
    pub blob_prefix: String,

    /// File suffix filter, e.g. `.jpg`. Empty matches every blob.
    #[serde(default = "default_file_type")]
    pub file_type: String,

    /// Override of the blob service endpoint (e.g. Azurite).
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Per-request timeout in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            account: String::new(),
            account_key: String::new(),
            container: String::new(),
            blob_prefix: String::new(),
            file_type: default_file_type(),
            endpoint: None,
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl StorageConfig {
    /// The account key from config, or from `AZURE_STORAGE_KEY`.
    pub fn resolved_account_key(&self) -> Option<String> {
        if !self.account_key.is_empty() {
            return Some(self.account_key.clone());
        }
        std::env::var("AZURE_STORAGE_KEY")
            .ok()
            .filter(|k| !k.is_empty())
    }

    /// Blob service endpoint for the configured account.
    pub fn endpoint_url(&self) -> String {
        match &self.endpoint {
            Some(url) if !url.is_empty() => url.trim_end_matches('/').to_string(),
            _ => format!("https://{}.blob.core.windows.net", self.account),
        }
    }
}

/// Where classifications, the catalog and downloads are kept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Directory for the catalog, the sink and the `temp/` download area.
    #[serde(default = "default_record_location")]
    pub record_location: PathBuf,

    /// Expected number of files. Display only.
    #[serde(default)]
    pub file_count: u64,

    /// Remove downloaded files on cleanup.
    #[serde(default = "default_true")]
    pub delete_source_files_when_complete: bool,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            record_location: default_record_location(),
            file_count: 0,
            delete_source_files_when_complete: true,
        }
    }
}

impl SourceConfig {
    /// Directory that receives downloaded blobs.
    pub fn download_dir(&self) -> PathBuf {
        self.record_location.join("temp")
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: text or json.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Observability settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Install the Prometheus recorder and collect counters.
    #[serde(default = "default_true")]
    pub metrics: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self { metrics: true }
    }
}

// -- Defaults ----------------------------------------------------------------

fn default_true() -> bool {
    true
}

fn default_storage_backend() -> String {
    "azure".to_string()
}

fn default_file_type() -> String {
    ".jpg".to_string()
}

fn default_request_timeout() -> u64 {
    300
}

fn default_record_location() -> PathBuf {
    PathBuf::from("./data/records")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

// -- Loader ------------------------------------------------------------------

/// Load and parse configuration from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    serde_yaml::from_str(&contents).map_err(|e| ConfigError::Malformed {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

/// Load the configuration at `path`, writing a default file first if none
/// exists.
pub fn load_or_create_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    if path.exists() {
        return load_config(path);
    }
    let config = Config::default();
    save_config(path, &config)?;
    Ok(config)
}

/// Rewrite the configuration file at `path` with `config`.
pub fn save_config<P: AsRef<Path>>(path: P, config: &Config) -> Result<(), ConfigError> {
    let path = path.as_ref();
    let io_err = |source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }
    let yaml = serde_yaml::to_string(config).map_err(|e| ConfigError::Malformed {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    std::fs::write(path, yaml).map_err(io_err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.storage.backend, "azure");
        assert_eq!(config.storage.file_type, ".jpg");
        assert_eq!(config.storage.request_timeout_secs, 300);
        assert!(config.source.delete_source_files_when_complete);
        assert_eq!(config.logging.level, "info");
        assert!(config.observability.metrics);
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let yaml = "storage:\n  account: myacct\n  container: images\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.storage.account, "myacct");
        assert_eq!(config.storage.container, "images");
        assert_eq!(config.storage.file_type, ".jpg");
        assert_eq!(config.source.record_location, PathBuf::from("./data/records"));
    }

    #[test]
    fn test_load_or_create_writes_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("bloblabel.yaml");
        let config = load_or_create_config(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config, Config::default());

        let reloaded = load_config(&path).unwrap();
        assert_eq!(reloaded, config);
    }

    #[test]
    fn test_save_rewrites_whole_document() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("bloblabel.yaml");
        let mut config = load_or_create_config(&path).unwrap();
        config.storage.blob_prefix = "labelled/".to_string();
        config.source.file_count = 1200;
        save_config(&path, &config).unwrap();

        let reloaded = load_or_create_config(&path).unwrap();
        assert_eq!(reloaded.storage.blob_prefix, "labelled/");
        assert_eq!(reloaded.source.file_count, 1200);
    }

    #[test]
    fn test_malformed_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("bad.yaml");
        std::fs::write(&path, "storage: [not, a, map]").unwrap();
        let err = load_config(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Malformed { .. }));
    }

    #[test]
    fn test_endpoint_url() {
        let mut storage = StorageConfig {
            account: "acct".to_string(),
            ..StorageConfig::default()
        };
        assert_eq!(storage.endpoint_url(), "https://acct.blob.core.windows.net");
        storage.endpoint = Some("http://127.0.0.1:10000/devstoreaccount1/".to_string());
        assert_eq!(
            storage.endpoint_url(),
            "http://127.0.0.1:10000/devstoreaccount1"
        );
    }

    #[test]
    fn test_download_dir() {
        let source = SourceConfig {
            record_location: PathBuf::from("/var/records"),
            ..SourceConfig::default()
        };
        assert_eq!(source.download_dir(), PathBuf::from("/var/records/temp"));
    }
}
