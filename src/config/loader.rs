// src/config/loader.rs

use std::fs;
use std::path::{Path, PathBuf};

use crate::config::model::{Config, RawConfigFile};
use crate::errors::{BuildError, Result};

/// Environment variable naming the config file when `--config` is absent.
pub const CONFIG_ENV_VAR: &str = "KERNELBUILD_CONFIG";

/// Load a configuration file and return the raw, unvalidated model.
///
/// Use [`load_and_validate`] unless you need to tweak the raw values first.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<RawConfigFile> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)
        .map_err(|e| BuildError::ConfigError(format!("reading config file {:?}: {e}", path)))?;
    Ok(toml::from_str(&contents)?)
}

pub fn load_and_validate(path: impl AsRef<Path>) -> Result<Config> {
    let raw_config = load_from_path(&path)?;
    Config::try_from(raw_config)
}

/// `$KERNELBUILD_CONFIG` if set, else `Kernelbuild.toml` in the working
/// directory.
pub fn default_config_path() -> PathBuf {
    match std::env::var_os(CONFIG_ENV_VAR) {
        Some(path) if !path.is_empty() => PathBuf::from(path),
        _ => PathBuf::from("Kernelbuild.toml"),
    }
}
