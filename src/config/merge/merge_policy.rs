//! Merge rules: defaults, override order, conflict handling.

use config::Config;
use config::ConfigBuilder;
use config::ConfigError;
use std::path::Path;

/// Create a Config builder with merge policy defaults applied.
///
/// Storage paths default under `data_root`; everything else mirrors the
/// serde defaults of the section structs.
pub fn builder_with_defaults(
    data_root: &Path,
) -> Result<ConfigBuilder<config::builder::DefaultState>, ConfigError> {
    Config::builder()
        .set_default("monitor.initial_interval_ms", 2_000i64)?
        .set_default("monitor.multiplier", 2.0f64)?
        .set_default("monitor.max_interval_ms", 30_000i64)?
        .set_default("monitor.deadline_secs", 600i64)?
        .set_default("monitor.call_timeout_ms", 10_000i64)?
        .set_default("monitor.max_monitored_steps", 32i64)?
        .set_default("correlation.overfetch_multiplier", 3i64)?
        .set_default("correlation.min_window", 10i64)?
        .set_default("retrieval.max_attempts", 5i64)?
        .set_default("retrieval.max_parallel", 4i64)?
        .set_default("retrieval.batch_size", 64i64)?
        .set_default("scheduler.monitor_interval_ms", 1_000i64)?
        .set_default("scheduler.retrieval_interval_ms", 5_000i64)?
        .set_default(
            "storage.store_path",
            data_root.join("store").to_string_lossy().to_string(),
        )?
        .set_default(
            "storage.artifacts_path",
            data_root.to_string_lossy().to_string(),
        )?
        .set_default("backend.base_url", "http://127.0.0.1:7860")?
        .set_default("backend.request_timeout_ms", 30_000i64)
}
