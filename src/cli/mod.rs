//! Command-line interface for Tapestry.
//!
//! Thin front-end over [`Engine`]: loads the configuration, builds the crypto
//! provider it names, runs one operation and prints a summary.

use crate::config::{Config, RunContext};
use crate::crypto::provider_from_config;
use crate::logging::LogFormat;
use crate::pipeline::Engine;
use anyhow::Context;
use chrono::NaiveDate;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};

pub mod backup;
pub mod init;
pub mod inspect;
pub mod restore;

/// Tapestry - file-level backup into signed, encrypted archive blocks
#[derive(Parser)]
#[command(name = "tapestry")]
#[command(about = "Back up category trees into fixed-size, signed and encrypted blocks")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Configuration file (defaults to the user config directory)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Debug-level logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Only warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormatArg::Text)]
    pub log_format: LogFormatArg,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LogFormatArg {
    Text,
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Text => LogFormat::Text,
            LogFormatArg::Json => LogFormat::Json,
        }
    }
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Pack the configured categories into blocks
    Backup(backup::BackupArgs),
    /// Restore files from collected blocks
    Restore(restore::RestoreArgs),
    /// Verify, decrypt and describe a single block
    Inspect(inspect::InspectArgs),
    /// Write a starter configuration file
    InitConfig(init::InitArgs),
}

/// Load the configuration file, falling back to the default location
pub fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => Config::default_path()?,
    };
    Config::load(&path).with_context(|| format!("loading {}", path.display()))
}

/// Validate `config` and build an engine with its crypto provider
pub fn build_engine(config: Config, date: Option<NaiveDate>) -> anyhow::Result<Engine> {
    let crypto = provider_from_config(&config)?;
    let mut ctx = RunContext::new(config).context("invalid configuration")?;
    if let Some(date) = date {
        ctx = ctx.with_date(date);
    }
    Ok(Engine::new(ctx, crypto))
}
