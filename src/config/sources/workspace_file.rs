//! Per-workspace overrides for the orchestrator.
//!
//! A workspace may tune polling, correlation and retrieval for the backend it
//! talks to. `config/config.toml` applies everywhere; `config/{DARKROOM_ENV}.toml`
//! (default `development`) is layered on top.

use config::builder::DefaultState;
use config::ConfigBuilder;
use config::ConfigError;
use config::File;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const ENV_VAR: &str = "DARKROOM_ENV";
const DEFAULT_ENV: &str = "development";

/// Existing workspace config files, lowest precedence first.
pub fn workspace_config_files(workspace_root: &Path, env_name: &str) -> Vec<PathBuf> {
    let config_dir = workspace_root.join("config");
    [
        config_dir.join("config.toml"),
        config_dir.join(format!("{}.toml", env_name)),
    ]
    .into_iter()
    .filter(|path| path.is_file())
    .collect()
}

pub fn add_to_builder(
    mut builder: ConfigBuilder<DefaultState>,
    workspace_root: &Path,
) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    let env_name = std::env::var(ENV_VAR).unwrap_or_else(|_| DEFAULT_ENV.to_string());
    for path in workspace_config_files(workspace_root, &env_name) {
        debug!(config_path = %path.display(), env = %env_name, "Workspace configuration file");
        builder = builder.add_source(File::from(path).required(false));
    }
    Ok(builder)
}
