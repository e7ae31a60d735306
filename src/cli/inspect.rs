//! Inspect command: verify and describe one block.

use super::{build_engine, load_config};
use clap::Args;
use std::path::{Path, PathBuf};

/// Arguments for the inspect command
#[derive(Args)]
pub struct InspectArgs {
    /// The `.tap` block to inspect
    pub block: PathBuf,

    /// Print the recovery manifest as JSON
    #[arg(long)]
    pub json: bool,
}

/// Run the inspect command
pub fn run(config_path: Option<&Path>, args: InspectArgs) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let engine = build_engine(config, None)?;
    let inspection = engine.inspect(&args.block)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&inspection)?);
        return Ok(());
    }

    let manifest = &inspection.manifest;
    println!("Block {}", inspection.block);
    match &inspection.signature {
        Some(check) if check.valid => println!(
            "  Signature: valid, {} ({})",
            check.fingerprint.as_deref().unwrap_or("?"),
            check.signer.as_deref().unwrap_or("unknown signer")
        ),
        Some(_) => println!("  Signature: INVALID"),
        None => println!("  Signature: none found"),
    }
    println!("  Compressed: {}", inspection.compressed);
    println!(
        "  Block {} of {}, {} files, {} bytes",
        manifest.meta_block.num_block,
        manifest.meta_run.sum_block,
        manifest.meta_block.count_files,
        manifest.meta_block.size_large
    );
    println!(
        "  Run: {} files, {} bytes",
        manifest.meta_run.count_files_sum, manifest.meta_run.size_extra_large
    );
    if !manifest.meta_run.comment.is_empty() {
        println!("  Comment: {}", manifest.meta_run.comment);
    }
    if manifest.legacy {
        println!("  Legacy manifest (no checksums)");
    }
    println!("  Members: {}", inspection.members);
    Ok(())
}
