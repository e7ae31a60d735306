//! Persisted allow-list of approved signer fingerprints.

use crate::crypto::normalize_fingerprint;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug, Default, Serialize, Deserialize)]
struct TrustFile {
    trusted: BTreeSet<String>,
}

/// Fingerprints approved by an operator in this or an earlier run
#[derive(Debug, Clone)]
pub struct TrustStore {
    path: PathBuf,
    trusted: BTreeSet<String>,
}

impl TrustStore {
    /// Load the allow-list; a missing file is an empty list
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let trusted = if path.exists() {
            let file: TrustFile = serde_json::from_str(&fs::read_to_string(&path)?)?;
            file.trusted
        } else {
            BTreeSet::new()
        };
        debug!("Trust store {} holds {} signers", path.display(), trusted.len());
        Ok(Self { path, trusted })
    }

    pub fn contains(&self, fingerprint: &str) -> bool {
        self.trusted.contains(&normalize_fingerprint(fingerprint))
    }

    /// Record an approval and persist it
    pub fn approve(&mut self, fingerprint: &str) -> Result<()> {
        if self.trusted.insert(normalize_fingerprint(fingerprint)) {
            info!("Signer {} added to {}", fingerprint, self.path.display());
            self.save()?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.trusted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trusted.is_empty()
    }

    fn save(&self) -> Result<()> {
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        let file = TrustFile {
            trusted: self.trusted.clone(),
        };
        serde_json::to_writer_pretty(tmp.as_file_mut(), &file)?;
        tmp.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }
}
