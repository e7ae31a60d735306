//! # Tapestry
//!
//! File-level backup that packs configured category trees into fixed-size
//! blocks, then compresses, encrypts and signs each block for offline media.
//!
//! ## Features
//!
//! - **Block packing**: largest-first bin packing into numbered blocks
//! - **Recovery manifest**: every block carries the full run index
//! - **Crypto**: GnuPG or a built-in keyring for encryption and signatures
//! - **Restore**: signer trust policy, media prompts, checksum-verified extraction
//! - **Parallel stages**: a fixed worker pool with a barrier between stages
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tapestry::{Config, Engine, RunContext};
//! use tapestry::crypto::provider_from_config;
//!
//! # fn main() -> tapestry::Result<()> {
//! let config = Config::load("tapestry.toml")?;
//! let crypto = provider_from_config(&config)?;
//! let engine = Engine::new(RunContext::new(config)?, crypto);
//!
//! let report = engine.backup()?;
//! println!("Wrote {} blocks for {}", report.blocks.len(), report.run);
//! # Ok(())
//! # }
//! ```

pub mod archive;
pub mod block;
pub mod cli;
pub mod config;
pub mod crypto;
pub mod error;
pub mod events;
pub mod hashing;
pub mod logging;
pub mod manifest;
pub mod operator;
pub mod path_safety;
pub mod pipeline;
pub mod planner;
pub mod pool;
pub mod report;
pub mod transport;
pub mod trust;

// Re-export commonly used types
pub use config::{Config, RunContext};
pub use error::{Error, Result};
pub use events::{Diagnostic, Level, Stage};
pub use manifest::RecoveryManifest;
pub use pipeline::{BackupRun, Engine, RestoreRun};
pub use report::{BackupReport, BlockState, RestoreReport};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
