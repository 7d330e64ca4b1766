// src/logging.rs

//! Logging setup for `kernelbuild` using `tracing` + `tracing-subscriber`.
//!
//! The filter is chosen from, in order:
//! 1. `--log-level`, applied to `kernelbuild` targets only
//! 2. `KERNELBUILD_LOG`, taken as a full filter directive
//!    (e.g. `kernelbuild::ledger=trace,info`)
//! 3. `kernelbuild=info,warn`
//!
//! Logs go to STDERR; stdout carries command output only.

use anyhow::{Context, Result};
use tracing_subscriber::{EnvFilter, fmt};

use crate::cli::LogLevel;

const ENV_VAR: &str = "KERNELBUILD_LOG";
const DEFAULT_DIRECTIVE: &str = "kernelbuild=info,warn";

/// Install the global subscriber. Call once at startup.
pub fn init_logging(cli_level: Option<LogLevel>) -> Result<()> {
    let filter = build_filter(cli_level, std::env::var(ENV_VAR).ok().as_deref())?;

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("installing tracing subscriber: {e}"))?;

    Ok(())
}

fn build_filter(cli_level: Option<LogLevel>, env: Option<&str>) -> Result<EnvFilter> {
    let directive = directive(cli_level, env);
    EnvFilter::try_new(&directive).with_context(|| format!("invalid log filter {directive:?}"))
}

fn directive(cli_level: Option<LogLevel>, env: Option<&str>) -> String {
    match (cli_level, env.map(str::trim)) {
        (Some(level), _) => format!("kernelbuild={},warn", level_name(level)),
        (None, Some(env)) if !env.is_empty() => env.to_string(),
        _ => DEFAULT_DIRECTIVE.to_string(),
    }
}

fn level_name(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Error => "error",
        LogLevel::Warn => "warn",
        LogLevel::Info => "info",
        LogLevel::Debug => "debug",
        LogLevel::Trace => "trace",
    }
}
