//! Tapestry - backup into signed, encrypted archive blocks
//!
//! Main binary entry point for the command-line interface.

use clap::Parser;
use tapestry::cli::{self, Cli, Commands};
use tapestry::logging::init_logging;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet, cli.log_format.into())?;

    let config = cli.config.as_deref();
    match cli.command {
        Commands::Backup(args) => cli::backup::run(config, args),
        Commands::Restore(args) => cli::restore::run(config, args),
        Commands::Inspect(args) => cli::inspect::run(config, args),
        Commands::InitConfig(args) => cli::init::run(config, args),
    }
}
