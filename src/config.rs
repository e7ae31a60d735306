//! Run configuration and the immutable run context shared by every task.
//!
//! The front-end loads a [`Config`] (usually from a TOML file), and turns it
//! into a [`RunContext`] once validated. The context is never mutated after
//! the pipeline starts.

use crate::{Error, Result};
use chrono::{Local, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Default bzip2 level
pub const DEFAULT_COMPRESSION_LEVEL: u32 = 9;

/// Default block capacity (650 MiB, one CD-R)
pub const DEFAULT_BLOCK_SIZE: u64 = 650 * 1024 * 1024;

/// Which crypto provider backs the run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// The system `gpg` executable
    #[default]
    Gnupg,
    /// The built-in JSON keyring
    Local,
}

/// Configuration handed to the engine by the front-end
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Fingerprint of the key blocks are encrypted to
    pub active_key: String,
    /// Fingerprint of the key used for detached signatures
    pub signing_key: String,
    /// Whether blocks are signed
    pub sign: bool,
    /// Block capacity in bytes
    pub block_size: u64,
    /// Host label used in block names
    pub host: String,
    /// Whether packed archives are re-hashed before compression
    pub validate: bool,
    /// Whether archives are bzip2-compressed before encryption
    pub compress: bool,
    /// bzip2 level, 1-9
    pub compression_level: u32,
    /// Whether the additional categories are part of the run set
    pub include_additional: bool,
    /// Scratch directory for intermediate archives
    pub workspace: PathBuf,
    /// Output directory for blocks (and fallback root on restore)
    pub drop_dir: PathBuf,
    /// Directory blocks are collected from on restore
    pub recovery_dir: PathBuf,
    /// Worker threads, 0 for the logical CPU count
    pub workers: usize,
    /// Never prompt the operator
    pub non_interactive: bool,
    /// Crypto backend
    pub backend: Backend,
    /// GnuPG home directory, or the local keyring file
    pub keystore: Option<PathBuf>,
    /// Persisted signer allow-list
    pub trust_store: Option<PathBuf>,
    /// Free-form comment recorded in every manifest
    pub comment: String,
    /// Default categories: label -> absolute source root
    pub categories: BTreeMap<String, PathBuf>,
    /// Additional categories, included on request
    pub additional_categories: BTreeMap<String, PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        let mut categories = BTreeMap::new();
        categories.insert("docs".to_string(), home.join("Documents"));
        categories.insert("pictures".to_string(), home.join("Pictures"));

        Self {
            active_key: String::new(),
            signing_key: String::new(),
            sign: true,
            block_size: DEFAULT_BLOCK_SIZE,
            host: default_host(),
            validate: true,
            compress: true,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            include_additional: false,
            workspace: std::env::temp_dir().join("tapestry"),
            drop_dir: home.join("tapestry-output"),
            recovery_dir: home.join("tapestry-output"),
            workers: 0,
            non_interactive: false,
            backend: Backend::Gnupg,
            keystore: None,
            trust_store: None,
            comment: String::new(),
            categories,
            additional_categories: BTreeMap::new(),
        }
    }
}

fn default_host() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

impl Config {
    /// Load a config from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading config from {}", path.display());
        let content = fs::read_to_string(path).map_err(|e| {
            Error::config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save the config as TOML
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        debug!("Config saved to {}", path.display());
        Ok(())
    }

    /// Default config file location
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| Error::config("could not determine config directory"))?;
        Ok(config_dir.join("tapestry").join("tapestry.toml"))
    }

    /// Check the configuration is usable for a run
    pub fn validate(&self) -> Result<()> {
        if self.active_key.trim().is_empty() {
            return Err(Error::config("no active encryption key configured"));
        }
        if self.sign && self.signing_key.trim().is_empty() {
            return Err(Error::config("signing is enabled but no signing key is configured"));
        }
        if self.block_size == 0 {
            return Err(Error::config("block size must be greater than zero"));
        }
        if self.host.trim().is_empty() {
            return Err(Error::config("host label must not be empty"));
        }
        if self.host.contains(['/', '\\']) || self.host.starts_with('.') {
            return Err(Error::config(format!(
                "host label '{}' must be a plain file name component",
                self.host
            )));
        }
        if !(1..=9).contains(&self.compression_level) {
            return Err(Error::config(format!(
                "compression level {} is outside 1-9",
                self.compression_level
            )));
        }
        if self.categories.is_empty() && self.additional_categories.is_empty() {
            return Err(Error::config("no categories configured"));
        }
        for (label, root) in self.categories.iter().chain(&self.additional_categories) {
            if !root.is_absolute() {
                return Err(Error::config(format!(
                    "category '{}' root {} is not absolute",
                    label,
                    root.display()
                )));
            }
        }
        Ok(())
    }

    /// Categories crawled by a backup, in label order
    pub fn run_categories(&self) -> Vec<(&str, &Path)> {
        let mut set: Vec<(&str, &Path)> = self
            .categories
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_path()))
            .collect();
        if self.include_additional {
            for (label, root) in &self.additional_categories {
                if !self.categories.contains_key(label) {
                    set.push((label.as_str(), root.as_path()));
                }
            }
        }
        set.sort_by(|a, b| a.0.cmp(b.0));
        set
    }

    /// Root a category restores into, if configured (defaults win over additionals)
    pub fn category_root(&self, category: &str) -> Option<&Path> {
        self.categories
            .get(category)
            .or_else(|| self.additional_categories.get(category))
            .map(PathBuf::as_path)
    }
}

/// Immutable snapshot of everything a run needs
#[derive(Debug, Clone)]
pub struct RunContext {
    config: Config,
    run_date: NaiveDate,
    workers: usize,
}

impl RunContext {
    /// Validate `config` and snapshot it with today's date
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let workers = if config.workers == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            config.workers
        };
        Ok(Self {
            config,
            run_date: Local::now().date_naive(),
            workers,
        })
    }

    /// Override the run date (block names and `dateRec`)
    pub fn with_date(mut self, date: NaiveDate) -> Self {
        self.run_date = date;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn run_date(&self) -> NaiveDate {
        self.run_date
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// `<host>-<ISO date>`, the prefix shared by every block of the run
    pub fn run_label(&self) -> String {
        format!("{}-{}", self.config.host, self.run_date.format("%Y-%m-%d"))
    }

    /// Scratch directory for restore intermediates
    pub fn restore_workspace(&self) -> PathBuf {
        self.config.workspace.join("restore")
    }

    /// Path of the persisted signer allow-list
    pub fn trust_store_path(&self) -> PathBuf {
        self.config
            .trust_store
            .clone()
            .unwrap_or_else(|| self.config.workspace.join("trusted-signers.json"))
    }
}
