pub mod migrate;
pub mod plan;
pub mod run;
pub mod status;

use std::path::{Path, PathBuf};

use anyhow::Context;
use orchard_core::HostConfig;

use crate::exit::InvalidConfig;

/// Load and validate `orchard.toml`, applying a `--state-dir` override.
pub(crate) fn load_config(path: &Path, state_dir: Option<PathBuf>) -> anyhow::Result<HostConfig> {
    let mut config = HostConfig::from_file(path).context(InvalidConfig::new(path))?;
    if let Some(dir) = state_dir {
        config.bootstrap.state_dir = dir;
    }
    Ok(config)
}
