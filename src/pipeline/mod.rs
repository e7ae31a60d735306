//! Pipeline driver: sequences the backup and restore stages.
//!
//! The [`Engine`] holds the immutable [`RunContext`] and the injected
//! capabilities (crypto provider, archive codec, operator, transport). Each
//! run fans its per-file and per-block work through the [`WorkerPool`], with a
//! hard barrier between stages.

pub mod backup;
pub mod restore;

pub use backup::BackupRun;
pub use restore::RestoreRun;

use crate::archive::{is_compressed, ArchiveCodec, TarCodec};
use crate::config::RunContext;
use crate::crypto::{CryptoProvider, DecryptOutcome, SignatureCheck};
use crate::events::Diagnostic;
use crate::manifest::{RecoveryManifest, LEGACY_MEMBER, RIFF_MEMBER};
use crate::operator::{NonInteractive, Operator};
use crate::pool::WorkerPool;
use crate::report::{BackupReport, RestoreReport};
use crate::transport::Transport;
use crate::{Error, Result};
use crossbeam_channel::Sender;
use serde::Serialize;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Extension of encrypted blocks
pub const BLOCK_EXTENSION: &str = "tap";

/// Extension of detached signatures, appended to the block file name
pub const SIGNATURE_EXTENSION: &str = "sig";

/// The backup/restore engine
pub struct Engine {
    ctx: RunContext,
    crypto: Box<dyn CryptoProvider>,
    archive: Box<dyn ArchiveCodec>,
    operator: Box<dyn Operator>,
    transport: Option<Box<dyn Transport>>,
    frontend: Option<Sender<Diagnostic>>,
    pool: WorkerPool,
}

impl Engine {
    /// Engine with the tar codec, no operator prompts and no transport
    pub fn new(ctx: RunContext, crypto: Box<dyn CryptoProvider>) -> Self {
        let pool = WorkerPool::new(ctx.workers());
        Self {
            ctx,
            crypto,
            archive: Box::new(TarCodec::new()),
            operator: Box::new(NonInteractive),
            transport: None,
            frontend: None,
            pool,
        }
    }

    pub fn with_archive(mut self, archive: Box<dyn ArchiveCodec>) -> Self {
        self.archive = archive;
        self
    }

    pub fn with_operator(mut self, operator: Box<dyn Operator>) -> Self {
        self.operator = operator;
        self
    }

    pub fn with_transport(mut self, transport: Box<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Forward every diagnostic to a front-end channel as well
    pub fn with_frontend(mut self, frontend: Sender<Diagnostic>) -> Self {
        self.frontend = Some(frontend);
        self
    }

    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    pub(crate) fn crypto(&self) -> &dyn CryptoProvider {
        self.crypto.as_ref()
    }

    pub(crate) fn archive(&self) -> &dyn ArchiveCodec {
        self.archive.as_ref()
    }

    pub(crate) fn operator(&self) -> &dyn Operator {
        self.operator.as_ref()
    }

    pub(crate) fn transport(&self) -> Option<&dyn Transport> {
        self.transport.as_deref()
    }

    pub(crate) fn frontend(&self) -> Option<Sender<Diagnostic>> {
        self.frontend.clone()
    }

    pub(crate) fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Run every backup stage
    pub fn backup(&self) -> Result<BackupReport> {
        let mut run = BackupRun::start(self)?;
        run.build()?;
        run.validate()?;
        run.compress()?;
        run.encrypt()?;
        run.sign()?;
        run.publish()?;
        Ok(run.finish())
    }

    /// Restore from the configured recovery directory
    pub fn restore(&self) -> Result<RestoreReport> {
        let source = self.ctx.config().recovery_dir.clone();
        let mut run = RestoreRun::start(self)?;
        run.collect(&source)?;
        run.verify()?;
        run.bootstrap()?;
        run.gather()?;
        run.decrypt()?;
        run.decompress()?;
        run.extract()?;
        Ok(run.finish())
    }

    /// Verify (when a signature sits next to it), decrypt and read one block
    pub fn inspect(&self, tap: &Path) -> Result<Inspection> {
        let name = block_name(tap).ok_or_else(|| {
            Error::config(format!("{} is not a .{} file", tap.display(), BLOCK_EXTENSION))
        })?;
        let scratch = tempfile::TempDir::new()?;

        let sig = signature_path(tap);
        let signature = if sig.is_file() {
            Some(verify_file(self.crypto(), tap, &sig)?)
        } else {
            None
        };

        let payload = scratch.path().join(format!("{}.payload", name));
        let outcome = decrypt_file(self.crypto(), tap, &payload)?;
        if !outcome.ok {
            return Err(Error::DecryptFailure {
                block: name,
                status: outcome.status,
            });
        }
        let tar = scratch.path().join(format!("{}.tar", name));
        let compressed = unpack_payload(self.archive(), &payload, &tar)?;
        let members = self.archive().list(&tar)?;
        let manifest = read_manifest(self.archive(), &tar, &members)?;

        Ok(Inspection {
            block: name,
            signature,
            compressed,
            members: members.len(),
            manifest,
        })
    }
}

/// What `inspect` learned about one block
#[derive(Debug, Serialize)]
pub struct Inspection {
    pub block: String,
    #[serde(skip)]
    pub signature: Option<SignatureCheck>,
    pub compressed: bool,
    /// Archive members, manifest included
    pub members: usize,
    pub manifest: RecoveryManifest,
}

/// `name` for a path ending in `name.tap`
pub fn block_name(path: &Path) -> Option<String> {
    let file_name = path.file_name()?.to_str()?;
    let stem = file_name.strip_suffix(&format!(".{}", BLOCK_EXTENSION))?;
    (!stem.is_empty()).then(|| stem.to_string())
}

/// Ordinal suffix of a block name, `h1-2024-01-02-3` -> 3
pub fn block_ordinal(name: &str) -> Option<u32> {
    name.rsplit_once('-')?.1.parse().ok()
}

/// Run label of a block name, `h1-2024-01-02-3` -> `h1-2024-01-02`
pub fn block_run_label(name: &str) -> Option<&str> {
    let (label, ordinal) = name.rsplit_once('-')?;
    ordinal.parse::<u32>().ok().map(|_| label)
}

/// `<block>.tap.sig` beside `<block>.tap`
pub fn signature_path(tap: &Path) -> PathBuf {
    let mut name = tap.as_os_str().to_os_string();
    name.push(".");
    name.push(SIGNATURE_EXTENSION);
    PathBuf::from(name)
}

/// Write to `dest` through a temp file in the same directory
pub(crate) fn write_atomic(
    dest: &Path,
    fill: impl FnOnce(&mut dyn Write) -> Result<()>,
) -> Result<()> {
    let dir = dest.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    {
        let mut writer = BufWriter::new(tmp.as_file_mut());
        fill(&mut writer)?;
        writer.flush()?;
    }
    tmp.persist(dest).map_err(|e| e.error)?;
    Ok(())
}

pub(crate) fn verify_file(
    crypto: &dyn CryptoProvider,
    tap: &Path,
    sig: &Path,
) -> Result<SignatureCheck> {
    let mut signature = BufReader::new(File::open(sig)?);
    let mut data = BufReader::new(File::open(tap)?);
    crypto.verify(&mut signature, &mut data)
}

/// Decrypt `tap` into `dest`; on failure nothing is left at `dest`
pub(crate) fn decrypt_file(
    crypto: &dyn CryptoProvider,
    tap: &Path,
    dest: &Path,
) -> Result<DecryptOutcome> {
    let mut input = BufReader::new(File::open(tap)?);
    let mut outcome = None;
    let result = write_atomic(dest, |out| {
        let decrypted = crypto.decrypt(&mut input, out)?;
        let ok = decrypted.ok;
        outcome = Some(decrypted);
        if ok {
            Ok(())
        } else {
            Err(Error::crypto("decryption failed"))
        }
    });
    match (result, outcome) {
        (Ok(()), Some(outcome)) => Ok(outcome),
        (Err(_), Some(outcome)) if !outcome.ok => Ok(outcome),
        (Err(e), _) => Err(e),
        (Ok(()), None) => Err(Error::crypto("decryption produced no outcome")),
    }
}

/// Turn a decrypted payload into a plain tar at `tar`, removing the payload.
/// Returns whether the payload was compressed.
pub(crate) fn unpack_payload(
    archive: &dyn ArchiveCodec,
    payload: &Path,
    tar: &Path,
) -> Result<bool> {
    let compressed = is_compressed(payload)?;
    if compressed {
        archive.decompress(payload, tar)?;
        fs::remove_file(payload)?;
    } else {
        fs::rename(payload, tar)?;
    }
    debug!(compressed, "unpacked {}", tar.display());
    Ok(compressed)
}

/// Read the embedded manifest, preferring the RIFF member
pub(crate) fn read_manifest(
    archive: &dyn ArchiveCodec,
    tar: &Path,
    members: &[String],
) -> Result<RecoveryManifest> {
    let member = [RIFF_MEMBER, LEGACY_MEMBER]
        .into_iter()
        .find(|name| members.iter().any(|m| m == name))
        .ok_or_else(|| Error::RecoveryIndex {
            reason: format!("{} carries no recovery manifest", tar.display()),
        })?;
    let mut bytes = Vec::new();
    archive
        .extract_to_writer(tar, member, &mut bytes)
        .map_err(|e| Error::RecoveryIndex {
            reason: format!("cannot extract {}: {}", member, e),
        })?;
    RecoveryManifest::parse(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_names() {
        let tap = Path::new("/drop/h1-2024-01-02-3.tap");
        assert_eq!(block_name(tap).as_deref(), Some("h1-2024-01-02-3"));
        assert_eq!(block_name(Path::new("/drop/h1.tap.sig")), None);
        assert_eq!(block_name(Path::new("/drop/.tap")), None);
        assert_eq!(block_ordinal("h1-2024-01-02-3"), Some(3));
        assert_eq!(block_ordinal("nohyphen"), None);
        assert_eq!(block_run_label("h1-2024-01-02-12"), Some("h1-2024-01-02"));
        assert_eq!(
            signature_path(tap),
            PathBuf::from("/drop/h1-2024-01-02-3.tap.sig")
        );
    }
}
