// src/config/validate.rs

use crate::config::model::{Config, RawConfigFile};
use crate::errors::{BuildError, Result};

impl TryFrom<RawConfigFile> for Config {
    type Error = BuildError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        validate_raw_config(&raw)?;
        Ok(Config::new_unchecked(raw))
    }
}

fn validate_raw_config(cfg: &RawConfigFile) -> Result<()> {
    validate_directories(cfg)?;
    validate_build(cfg)?;
    validate_backend(cfg)?;
    Ok(())
}

fn validate_directories(cfg: &RawConfigFile) -> Result<()> {
    if cfg.cache.dir.as_os_str().is_empty() {
        return Err(BuildError::ConfigError(
            "[cache].dir must not be empty".to_string(),
        ));
    }
    if cfg.build.kernel_meta_dir.as_os_str().is_empty() {
        return Err(BuildError::ConfigError(
            "[build].kernel_meta_dir must not be empty".to_string(),
        ));
    }
    // Backend outputs are promoted out of kernel_meta, never written in place.
    if cfg.cache.dir == cfg.build.kernel_meta_dir {
        return Err(BuildError::ConfigError(format!(
            "[build].kernel_meta_dir must differ from [cache].dir (both are {:?})",
            cfg.cache.dir
        )));
    }
    Ok(())
}

fn validate_build(cfg: &RawConfigFile) -> Result<()> {
    if cfg.build.poll_interval_ms == 0 {
        return Err(BuildError::ConfigError(
            "[build].poll_interval_ms must be >= 1 (got 0)".to_string(),
        ));
    }
    Ok(())
}

fn validate_backend(cfg: &RawConfigFile) -> Result<()> {
    if cfg.backend.jobs == 0 {
        return Err(BuildError::ConfigError(
            "[backend].jobs must be >= 1 (got 0)".to_string(),
        ));
    }
    if cfg.backend.cmd.trim().is_empty() {
        return Err(BuildError::ConfigError(
            "[backend].cmd must not be empty".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::types::CacheMode;

    fn parse(src: &str) -> Result<Config> {
        let raw: RawConfigFile = toml::from_str(src)?;
        Config::try_from(raw)
    }

    #[test]
    fn empty_file_uses_defaults() {
        let cfg = parse("").unwrap();
        assert_eq!(cfg.cache.mode, CacheMode::Enable);
        assert_eq!(cfg.backend.jobs, 4);
        assert!(cfg.wait_timeout().is_none());
        assert_eq!(cfg.cache_settings().max_bytes, 0);
    }

    #[test]
    fn full_file_round_trips_into_settings() {
        let cfg = parse(
            r#"
[cache]
dir = "/tmp/kc"
mode = "force"
max_size_mb = 2

[build]
kernel_meta_dir = "/tmp/km"
wait_timeout_secs = 30

[backend]
cmd = "compile.sh"
jobs = 8
"#,
        )
        .unwrap();
        let settings = cfg.cache_settings();
        assert_eq!(settings.dir, PathBuf::from("/tmp/kc"));
        assert_eq!(settings.mode, CacheMode::Force);
        assert_eq!(settings.max_bytes, 2 * 1024 * 1024);
        assert_eq!(cfg.wait_timeout().map(|d| d.as_secs()), Some(30));
    }

    #[test]
    fn zero_jobs_is_rejected() {
        let err = parse("[backend]\njobs = 0\n").unwrap_err();
        match err {
            BuildError::ConfigError(msg) => assert!(msg.contains("jobs")),
            other => panic!("expected ConfigError, got {other:?}"),
        }
    }

    #[test]
    fn shared_meta_and_cache_dir_is_rejected() {
        let err =
            parse("[cache]\ndir = \"out\"\n[build]\nkernel_meta_dir = \"out\"\n").unwrap_err();
        assert!(matches!(err, BuildError::ConfigError(_)));
    }

    #[test]
    fn unknown_cache_mode_is_a_toml_error() {
        let err = parse("[cache]\nmode = \"sometimes\"\n").unwrap_err();
        assert!(matches!(err, BuildError::TomlError(_)));
    }
}
