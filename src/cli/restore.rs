//! Restore command implementation.

use super::{build_engine, load_config};
use crate::operator::ConsoleOperator;
use crate::transport::LocalDirTransport;
use clap::Args;
use std::path::{Path, PathBuf};

/// Arguments for the restore command
#[derive(Args)]
pub struct RestoreArgs {
    /// Directory to collect blocks from (default: the configured recovery dir)
    #[arg(short, long)]
    pub source: Option<PathBuf>,

    /// Never prompt: unknown signers are rejected and missing blocks skipped
    #[arg(long)]
    pub non_interactive: bool,

    /// Fetch blocks missing from the source out of this directory
    #[arg(long)]
    pub fetch_from: Option<PathBuf>,

    /// Where to write the JSON report (default: <drop>/restore-report.json)
    #[arg(long)]
    pub report: Option<PathBuf>,
}

/// Run the restore command
pub fn run(config_path: Option<&Path>, args: RestoreArgs) -> anyhow::Result<()> {
    let mut config = load_config(config_path)?;
    if let Some(source) = args.source {
        config.recovery_dir = source;
    }
    if args.non_interactive {
        config.non_interactive = true;
    }
    let interactive = !config.non_interactive;

    let mut engine = build_engine(config, None)?;
    if interactive {
        engine = engine.with_operator(Box::new(ConsoleOperator::new()));
    }
    if let Some(dir) = args.fetch_from {
        engine = engine.with_transport(Box::new(LocalDirTransport::new(dir)));
    }

    let report = engine.restore()?;
    let report_path = args.report.unwrap_or_else(|| {
        engine
            .context()
            .config()
            .drop_dir
            .join("restore-report.json")
    });
    report.write_json(&report_path)?;

    println!(
        "Restore of {} finished",
        report.run.as_deref().unwrap_or("unknown run")
    );
    println!("  Files restored: {}", report.restored.len());
    for block in &report.blocks {
        match &block.detail {
            Some(detail) => println!("  {}: {:?} ({})", block.name, block.state, detail),
            None => println!("  {}: {:?}", block.name, block.state),
        }
    }
    if !report.missing_blocks.is_empty() {
        println!("  Missing blocks: {:?}", report.missing_blocks);
    }
    for category in &report.unmapped_categories {
        println!("  Category '{}' restored under the drop directory", category);
    }
    for file in &report.unplaced {
        println!("  Not restored: {} ({})", file.fpath, file.reason);
    }
    println!("Report written to {}", report_path.display());

    if report.is_complete() {
        Ok(())
    } else {
        anyhow::bail!("restore is incomplete, see the report")
    }
}
