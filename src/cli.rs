// src/cli.rs

//! CLI argument parsing using `clap`.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// Command-line arguments for `kernelbuild`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "kernelbuild",
    version,
    about = "Coordinate, deduplicate and cache operator kernel builds.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the config file (TOML).
    ///
    /// Default: `Kernelbuild.toml` in the current working directory. A
    /// missing default file means built-in defaults.
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `KERNELBUILD_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL", global = true)]
    pub log_level: Option<LogLevel>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Print the kernel name of a node set.
    Name {
        /// Node set file (JSON).
        nodes: PathBuf,
    },

    /// Build a node set through the process backend and wait for it.
    Build {
        /// Node set file (JSON).
        nodes: PathBuf,

        #[arg(long, default_value_t = 0)]
        graph_id: u32,

        /// Only write the compiler-input document.
        #[arg(long)]
        dump_only: bool,

        /// Skip the prebuilt kernel registry.
        #[arg(long)]
        no_binary: bool,
    },

    /// Inspect or trim the result cache.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Debug, Clone, Copy, Subcommand)]
pub enum CacheAction {
    /// Show entry counts and disk usage.
    Stats,
    /// Evict entries until the cache fits `cache.max_size_mb`.
    Evict,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}
