//! Write a starter configuration.

use crate::config::Config;
use anyhow::Context;
use clap::Args;
use std::fs;
use std::path::{Path, PathBuf};

const HEADER: &str = "\
# Tapestry configuration
#
# active_key       fingerprint blocks are encrypted to
# signing_key      fingerprint used for detached signatures (when sign = true)
# block_size       block capacity in bytes
# categories       label = \"/absolute/root\" pairs crawled by every backup
# backend          \"gnupg\" or \"local\"; keystore is the GnuPG home or keyring file
# non_interactive  reject unknown signers and skip missing blocks without asking

";

#[derive(Args)]
pub struct InitArgs {
    /// Where to write the file (default: the user config directory)
    pub path: Option<PathBuf>,

    /// Overwrite an existing file
    #[arg(long)]
    pub force: bool,
}

pub fn run(config_path: Option<&Path>, args: InitArgs) -> anyhow::Result<()> {
    let path = match args.path.or_else(|| config_path.map(Path::to_path_buf)) {
        Some(path) => path,
        None => Config::default_path()?,
    };
    if path.exists() && !args.force {
        anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let body = toml::to_string_pretty(&Config::default())?;
    fs::write(&path, format!("{}{}", HEADER, body))
        .with_context(|| format!("writing {}", path.display()))?;
    println!("Configuration written to {}", path.display());
    println!("Set active_key, signing_key and the category roots before the first run.");
    Ok(())
}
