//! Remote delivery of finished blocks.
//!
//! The engine only knows the `fetch`/`store` contract; where blocks go
//! (optical media staging, a bucket, an SFTP host) is up to the implementor.

use crate::{Error, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

pub trait Transport: Send + Sync {
    fn fetch(&self, name: &str) -> Result<Vec<u8>>;
    fn store(&self, name: &str, bytes: &[u8]) -> Result<()>;
}

/// Stores blocks as plain files in a directory
#[derive(Debug, Clone)]
pub struct LocalDirTransport {
    root: PathBuf,
}

impl LocalDirTransport {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn target(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty() || name.contains('/') || name.contains('\\') || name.starts_with('.') {
            return Err(Error::Transport {
                reason: format!("invalid block name '{}'", name),
            });
        }
        Ok(self.root.join(name))
    }
}

impl Transport for LocalDirTransport {
    fn fetch(&self, name: &str) -> Result<Vec<u8>> {
        let path = self.target(name)?;
        fs::read(&path).map_err(|e| Error::Transport {
            reason: format!("fetch {} failed: {}", path.display(), e),
        })
    }

    fn store(&self, name: &str, bytes: &[u8]) -> Result<()> {
        let path = self.target(name)?;
        let write = || -> std::io::Result<()> {
            fs::create_dir_all(&self.root)?;
            let mut tmp = tempfile::NamedTempFile::new_in(&self.root)?;
            std::io::Write::write_all(tmp.as_file_mut(), bytes)?;
            tmp.persist(&path).map_err(|e| e.error)?;
            Ok(())
        };
        write().map_err(|e| Error::Transport {
            reason: format!("store {} failed: {}", path.display(), e),
        })?;
        debug!("Stored {} ({} bytes)", path.display(), bytes.len());
        Ok(())
    }
}
