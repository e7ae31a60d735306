//! Backup command implementation.

use super::{build_engine, load_config};
use crate::transport::LocalDirTransport;
use chrono::NaiveDate;
use clap::Args;
use std::path::{Path, PathBuf};

/// Arguments for the backup command
#[derive(Args)]
pub struct BackupArgs {
    /// Run date used in block names (YYYY-MM-DD, default today)
    #[arg(long)]
    pub date: Option<NaiveDate>,

    /// Free-text comment stored in the recovery manifest
    #[arg(long)]
    pub comment: Option<String>,

    /// Copy finished blocks and signatures into this directory
    #[arg(long)]
    pub publish_to: Option<PathBuf>,

    /// Override the configured worker count
    #[arg(short, long)]
    pub workers: Option<usize>,
}

/// Run the backup command
pub fn run(config_path: Option<&Path>, args: BackupArgs) -> anyhow::Result<()> {
    let mut config = load_config(config_path)?;
    if let Some(comment) = args.comment {
        config.comment = comment;
    }
    if let Some(workers) = args.workers {
        config.workers = workers;
    }

    let mut engine = build_engine(config, args.date)?;
    if let Some(dir) = args.publish_to {
        engine = engine.with_transport(Box::new(LocalDirTransport::new(dir)));
    }

    let report = engine.backup()?;
    let drop_dir = &engine.context().config().drop_dir;
    let report_path = drop_dir.join(format!("{}-report.json", report.run));
    report.write_json(&report_path)?;

    println!("Backup {} completed", report.run);
    println!("  Blocks written: {}", report.blocks.len());
    println!("  Files packed: {}", report.files_packed);
    println!("  Bytes packed: {}", report.bytes_packed);
    for block in &report.blocks {
        match &block.output {
            Some(path) => println!("  {} -> {}", block.name, path.display()),
            None => println!("  {} (not written)", block.name),
        }
    }
    if !report.skipped.is_empty() {
        println!("  Skipped {} files:", report.skipped.len());
        for skipped in &report.skipped {
            println!("    {} ({})", skipped.path.display(), skipped.reason);
        }
    }
    for mismatch in &report.integrity_mismatches {
        println!("  Integrity mismatch: {}", mismatch.path.display());
    }
    for failure in &report.failures {
        println!("  {} failed at {}: {}", failure.task, failure.stage, failure.message);
    }
    println!("Report written to {}", report_path.display());

    if report.is_clean() {
        Ok(())
    } else {
        anyhow::bail!("backup {} finished with problems, see the report", report.run)
    }
}
