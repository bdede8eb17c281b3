//! Prometheus metrics for bloblabel.
//!
//! Installs a global Prometheus recorder using `metrics-exporter-prometheus`
//! and defines metric name constants.  Counters are recorded with the
//! `metrics` macros at the call sites; without an installed recorder they
//! are no-ops.  The CLI renders the exposition text on request.

use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

// -- Metric name constants ----------------------------------------------------

/// Read tokens signed (counter).
pub const TOKENS_ISSUED_TOTAL: &str = "bloblabel_tokens_issued_total";

/// Blobs yielded by listings after filtering (counter).
pub const BLOBS_LISTED_TOTAL: &str = "bloblabel_blobs_listed_total";

/// Directory prefixes discovered (counter).
pub const DIRECTORIES_LISTED_TOTAL: &str = "bloblabel_directories_listed_total";

/// Blob downloads (counter). Labels: outcome.
pub const DOWNLOADS_TOTAL: &str = "bloblabel_downloads_total";

/// Bytes written by downloads (counter).
pub const DOWNLOAD_BYTES_TOTAL: &str = "bloblabel_download_bytes_total";

/// Catalog rebuilds (counter). Labels: outcome.
pub const CATALOG_REBUILDS_TOTAL: &str = "bloblabel_catalog_rebuilds_total";

/// Duration of a catalog rebuild in seconds (histogram).
pub const CATALOG_REBUILD_SECONDS: &str = "bloblabel_catalog_rebuild_seconds";

/// Items revealed by batch navigation (counter).
pub const ITEMS_REVEALED_TOTAL: &str = "bloblabel_items_revealed_total";

// -- Global recorder installation ---------------------------------------------

/// Singleton handle to the Prometheus recorder.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global Prometheus metrics recorder. Idempotent -- safe to call
/// multiple times. Returns a reference to the global handle.
pub fn init_metrics() -> &'static PrometheusHandle {
    PROMETHEUS_HANDLE.get_or_init(|| {
        PrometheusBuilder::new()
            .install_recorder()
            .expect("failed to install Prometheus recorder")
    })
}

/// Register metric descriptions with the global recorder. Call once after
/// `init_metrics()`.
pub fn describe_metrics() {
    describe_counter!(TOKENS_ISSUED_TOTAL, "Read tokens signed");
    describe_counter!(BLOBS_LISTED_TOTAL, "Blobs yielded by listings");
    describe_counter!(DIRECTORIES_LISTED_TOTAL, "Directory prefixes discovered");
    describe_counter!(DOWNLOADS_TOTAL, "Blob downloads by outcome");
    describe_counter!(DOWNLOAD_BYTES_TOTAL, "Bytes written by downloads");
    describe_counter!(CATALOG_REBUILDS_TOTAL, "Catalog rebuilds by outcome");
    describe_histogram!(CATALOG_REBUILD_SECONDS, "Catalog rebuild duration in seconds");
    describe_counter!(ITEMS_REVEALED_TOTAL, "Items revealed by batch navigation");
}

/// Render the Prometheus exposition text, if the recorder is installed.
pub fn render() -> Option<String> {
    PROMETHEUS_HANDLE.get().map(|handle| handle.render())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_names_are_prefixed() {
        for name in [
            TOKENS_ISSUED_TOTAL,
            BLOBS_LISTED_TOTAL,
            DIRECTORIES_LISTED_TOTAL,
            DOWNLOADS_TOTAL,
            DOWNLOAD_BYTES_TOTAL,
            CATALOG_REBUILDS_TOTAL,
            CATALOG_REBUILD_SECONDS,
            ITEMS_REVEALED_TOTAL,
        ] {
            assert!(name.starts_with("bloblabel_"), "{name}");
        }
    }

    #[test]
    fn test_counters_without_recorder_are_noops() {
        metrics::counter!(DOWNLOADS_TOTAL, "outcome" => "ok").increment(1);
    }
}
