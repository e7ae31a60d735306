//! Restore: collect, verify, bootstrap, gather, decrypt, decompress, extract.
//!
//! Each block moves through
//! `collected -> signature-pending -> signature-valid -> decrypted ->
//! decompressed -> (manifest-read) -> extracted`, or stops in one of the
//! failure states recorded in the report.

use super::{
    block_name, block_ordinal, block_run_label, decrypt_file, read_manifest, unpack_payload,
    verify_file, Engine, SIGNATURE_EXTENSION,
};
use crate::archive::ArchiveCodec;
use crate::config::Config;
use crate::crypto::{normalize_fingerprint, require_key, SignatureCheck};
use crate::events::{Diagnostic, ReportHandle, Reporter, Stage};
use crate::hashing::HashingWriter;
use crate::manifest::{is_manifest_member, RecoveryManifest, NOT_FOUND};
use crate::path_safety::{resolve_under, validate_relative};
use crate::pool::Job;
use crate::report::{
    BlockState, BlockStatus, IntegrityFailure, RestoreReport, RestoredFile, UnplacedFile,
};
use crate::trust::TrustStore;
use crate::{Error, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

#[derive(Debug)]
struct RestoreBlock {
    name: String,
    ordinal: Option<u32>,
    tap: PathBuf,
    sig: Option<PathBuf>,
    state: BlockState,
    detail: Option<String>,
    payload: Option<PathBuf>,
    tar: Option<PathBuf>,
}

impl RestoreBlock {
    fn fail(&mut self, state: BlockState, detail: impl Into<String>) {
        self.state = state;
        self.detail = Some(detail.into());
    }
}

enum Bootstrapped {
    Ready {
        tar: PathBuf,
        manifest: RecoveryManifest,
    },
    Failed {
        state: BlockState,
        reason: String,
    },
}

/// A member written to disk
struct Placed {
    file: RestoredFile,
    /// Category that fell back to the drop directory
    unmapped: Option<String>,
}

/// One restore run, stage by stage
pub struct RestoreRun<'e> {
    engine: &'e Engine,
    reporter: Reporter,
    handle: ReportHandle,
    workspace: PathBuf,
    trust: TrustStore,
    refused: BTreeSet<String>,
    blocks: BTreeMap<String, RestoreBlock>,
    manifest: Option<RecoveryManifest>,
    run_label: Option<String>,
    restored: Vec<RestoredFile>,
    unplaced: Vec<UnplacedFile>,
    unmapped: BTreeSet<String>,
    mismatches: Vec<IntegrityFailure>,
    missing: Vec<u32>,
}

impl<'e> RestoreRun<'e> {
    /// Check the decryption key and prepare a clean restore workspace
    pub fn start(engine: &'e Engine) -> Result<Self> {
        let ctx = engine.context();
        require_key(engine.crypto(), &ctx.config().active_key, true)?;

        let workspace = ctx.restore_workspace();
        if workspace.exists() {
            fs::remove_dir_all(&workspace)?;
        }
        fs::create_dir_all(&workspace)?;
        let trust = TrustStore::load(ctx.trust_store_path())?;

        let reporter = Reporter::spawn(engine.frontend())?;
        let handle = reporter.handle();
        info!("Starting restore into {}", workspace.display());
        Ok(Self {
            engine,
            reporter,
            handle,
            workspace,
            trust,
            refused: BTreeSet::new(),
            blocks: BTreeMap::new(),
            manifest: None,
            run_label: None,
            restored: Vec::new(),
            unplaced: Vec::new(),
            unmapped: BTreeSet::new(),
            mismatches: Vec::new(),
            missing: Vec::new(),
        })
    }

    fn config(&self) -> &'e Config {
        self.engine.context().config()
    }

    /// The recovery manifest, once bootstrapped
    pub fn manifest(&self) -> Option<&RecoveryManifest> {
        self.manifest.as_ref()
    }

    /// Current state of a block
    pub fn block_state(&self, name: &str) -> Option<BlockState> {
        self.blocks.get(name).map(|b| b.state)
    }

    /// Copy every `.tap` (and its `.tap.sig`) below `source` into the
    /// workspace. Returns how many blocks were added.
    pub fn collect(&mut self, source: &Path) -> Result<usize> {
        if !source.is_dir() {
            self.handle.emit(
                Diagnostic::warn(Stage::Collect, "recovery source is not a directory")
                    .subject(source.display().to_string()),
            );
            return Ok(0);
        }

        let sig_suffix = format!(".{}", SIGNATURE_EXTENSION);
        let mut found: BTreeMap<String, (Option<PathBuf>, Option<PathBuf>)> = BTreeMap::new();
        for entry in WalkDir::new(source).sort_by_file_name() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    self.handle
                        .emit(Diagnostic::warn(Stage::Collect, format!("walk error: {}", e)));
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            // the walker yields full paths, so nested media layouts work
            let path = entry.path();
            if let Some(name) = block_name(path) {
                found.entry(name).or_default().0 = Some(path.to_path_buf());
            } else if let Some(tap) = path
                .to_str()
                .and_then(|p| p.strip_suffix(&sig_suffix))
                .map(Path::new)
            {
                if let Some(name) = block_name(tap) {
                    found.entry(name).or_default().1 = Some(path.to_path_buf());
                }
            }
        }

        let workspace = &self.workspace;
        let mut jobs = Vec::new();
        for (name, (tap, sig)) in found {
            let Some(tap) = tap else {
                debug!("Signature without block: {}", name);
                continue;
            };
            if let Some(existing) = self.blocks.get(&name) {
                if !existing.state.is_terminal_failure() {
                    continue;
                }
            }
            jobs.push(Job::new(name.clone(), move || {
                let tap_dest = workspace.join(format!("{}.tap", name));
                fs::copy(&tap, &tap_dest)?;
                let sig_dest = match sig {
                    Some(sig) => {
                        let dest = workspace.join(format!("{}.tap.{}", name, SIGNATURE_EXTENSION));
                        fs::copy(&sig, &dest)?;
                        Some(dest)
                    }
                    None => None,
                };
                Ok((tap_dest, sig_dest))
            }));
        }

        let outcome = self
            .engine
            .pool()
            .run_stage(Stage::Collect, jobs, &self.handle)?;
        let added = outcome.outputs.len();
        for (name, (tap, sig)) in outcome.outputs {
            let ordinal = block_ordinal(&name);
            self.blocks.insert(
                name.clone(),
                RestoreBlock {
                    name,
                    ordinal,
                    tap,
                    sig,
                    state: BlockState::Collected,
                    detail: None,
                    payload: None,
                    tar: None,
                },
            );
        }
        for (name, error) in outcome.failures {
            self.handle.emit(
                Diagnostic::error(Stage::Collect, format!("cannot copy block: {}", error))
                    .task(name),
            );
        }
        info!("Collected {} blocks from {}", added, source.display());
        Ok(added)
    }

    /// Check signatures of newly collected blocks and apply the trust policy
    pub fn verify(&mut self) -> Result<()> {
        let config = self.config();
        let pending: Vec<String> = self
            .blocks
            .values()
            .filter(|b| b.state == BlockState::Collected)
            .map(|b| b.name.clone())
            .collect();
        if pending.is_empty() {
            return Ok(());
        }

        if !config.sign {
            self.handle.emit(Diagnostic::info(
                Stage::Verify,
                "signing disabled: unsigned blocks accepted, present signatures still checked",
            ));
        }
        for name in &pending {
            let Some(block) = self.blocks.get_mut(name) else {
                continue;
            };
            if block.sig.is_some() {
                block.state = BlockState::SignaturePending;
            } else if !config.sign {
                block.state = BlockState::SignatureValid;
            } else {
                let error = Error::SignatureInvalid {
                    block: name.clone(),
                    reason: "no detached signature found".to_string(),
                };
                block.fail(BlockState::RejectedSignature, error.to_string());
                self.handle.emit(
                    Diagnostic::error(Stage::Verify, error.to_string()).subject(name.clone()),
                );
            }
        }

        let crypto = self.engine.crypto();
        let jobs = self
            .blocks
            .values()
            .filter(|b| b.state == BlockState::SignaturePending)
            .filter_map(|b| {
                let sig = b.sig.as_ref()?;
                let tap = &b.tap;
                Some(Job::new(b.name.clone(), move || verify_file(crypto, tap, sig)))
            })
            .collect();
        let outcome = self
            .engine
            .pool()
            .run_stage(Stage::Verify, jobs, &self.handle)?;

        for (name, error) in outcome.failures {
            self.reject(&name, &error);
        }
        let mut checks = outcome.outputs;
        // prompts come in a stable order
        checks.sort_by(|a, b| a.0.cmp(&b.0));
        for (name, check) in checks {
            match self.trust_decision(&name, &check)? {
                Ok(()) => {
                    if let Some(block) = self.blocks.get_mut(&name) {
                        block.state = BlockState::SignatureValid;
                    }
                }
                Err(error) => self.reject(&name, &error),
            }
        }
        Ok(())
    }

    fn reject(&mut self, name: &str, error: &Error) {
        self.handle.emit(
            Diagnostic::error(Stage::Verify, error.to_string())
                .task(name.to_string())
                .subject(name.to_string()),
        );
        if let Some(block) = self.blocks.get_mut(name) {
            block.fail(BlockState::RejectedSignature, error.to_string());
        }
    }

    /// `Ok(Ok(()))` when the signer is trusted, `Ok(Err(_))` when the block
    /// must be rejected.
    fn trust_decision(
        &mut self,
        name: &str,
        check: &SignatureCheck,
    ) -> Result<std::result::Result<(), Error>> {
        let config = self.config();
        let fingerprint = match (&check.fingerprint, check.valid) {
            (Some(fp), true) => normalize_fingerprint(fp),
            _ => {
                return Ok(Err(Error::SignatureInvalid {
                    block: name.to_string(),
                    reason: "signature does not verify".to_string(),
                }))
            }
        };

        // signer trust is only enforced for runs that require signatures
        if !config.sign {
            return Ok(Ok(()));
        }

        let own_key = !config.signing_key.trim().is_empty()
            && normalize_fingerprint(&config.signing_key) == fingerprint;
        if own_key || self.trust.contains(&fingerprint) {
            return Ok(Ok(()));
        }

        let untrusted = Error::SignatureUntrusted {
            block: name.to_string(),
            fingerprint: fingerprint.clone(),
        };
        if config.non_interactive || self.refused.contains(&fingerprint) {
            return Ok(Err(untrusted));
        }
        self.handle.emit(
            Diagnostic::warn(Stage::Verify, untrusted.to_string()).subject(name.to_string()),
        );
        if self
            .engine
            .operator()
            .approve_signer(&fingerprint, check.signer.as_deref())
        {
            self.trust.approve(&fingerprint)?;
            self.handle.emit(
                Diagnostic::info(Stage::Verify, format!("signer {} approved", fingerprint))
                    .subject(name.to_string()),
            );
            Ok(Ok(()))
        } else {
            self.refused.insert(fingerprint);
            Ok(Err(untrusted))
        }
    }

    /// Decrypt the first verified block and read the run's recovery index.
    /// Fails the run if the index cannot be read.
    pub fn bootstrap(&mut self) -> Result<()> {
        let candidate = self
            .blocks
            .values()
            .filter(|b| b.state == BlockState::SignatureValid)
            .min_by_key(|b| (b.ordinal.unwrap_or(u32::MAX), b.name.clone()))
            .map(|b| (b.name.clone(), b.tap.clone()));
        let Some((name, tap)) = candidate else {
            let error = Error::RecoveryIndex {
                reason: "no verified block to read the recovery index from".to_string(),
            };
            self.handle
                .emit(Diagnostic::fatal(Stage::Bootstrap, error.to_string()));
            return Err(error);
        };

        let crypto = self.engine.crypto();
        let codec = self.engine.archive();
        let workspace = &self.workspace;
        let job_name = name.clone();
        let job = Job::new(name.clone(), move || {
            let payload = workspace.join(format!("{}.payload", job_name));
            let outcome = decrypt_file(crypto, &tap, &payload)?;
            if !outcome.ok {
                return Ok(Bootstrapped::Failed {
                    state: BlockState::FailedDecrypt,
                    reason: outcome.status,
                });
            }
            let tar = workspace.join(format!("{}.tar", job_name));
            if let Err(e) = unpack_payload(codec, &payload, &tar) {
                return Ok(Bootstrapped::Failed {
                    state: BlockState::CorruptArchive,
                    reason: e.to_string(),
                });
            }
            let manifest = codec
                .list(&tar)
                .and_then(|members| read_manifest(codec, &tar, &members));
            match manifest {
                Ok(manifest) => Ok(Bootstrapped::Ready { tar, manifest }),
                Err(e) => Ok(Bootstrapped::Failed {
                    state: BlockState::CorruptManifest,
                    reason: e.to_string(),
                }),
            }
        });

        let mut outcome = self
            .engine
            .pool()
            .run_stage(Stage::Bootstrap, vec![job], &self.handle)?;
        let result = match (outcome.outputs.pop(), outcome.failures.pop()) {
            (Some((_, result)), _) => result,
            (None, Some((_, error))) => Bootstrapped::Failed {
                state: BlockState::CorruptManifest,
                reason: error.to_string(),
            },
            (None, None) => Bootstrapped::Failed {
                state: BlockState::CorruptManifest,
                reason: "bootstrap produced no result".to_string(),
            },
        };

        match result {
            Bootstrapped::Ready { tar, manifest } => {
                if manifest.legacy {
                    self.handle.emit(
                        Diagnostic::warn(
                            Stage::Bootstrap,
                            "legacy manifest: restored files cannot be checksum-verified",
                        )
                        .subject(name.clone()),
                    );
                }
                if let Some(block) = self.blocks.get_mut(&name) {
                    block.state = BlockState::ManifestRead;
                    block.tar = Some(tar);
                    if block.ordinal.is_none() && manifest.meta_block.num_block > 0 {
                        block.ordinal = Some(manifest.meta_block.num_block);
                    }
                }
                info!(
                    "Recovery index from {}: {} blocks, {} files",
                    name,
                    manifest.expected_blocks(),
                    manifest.index.len()
                );
                self.run_label = block_run_label(&name).map(str::to_string);
                self.manifest = Some(manifest);
                self.set_aside_foreign_blocks();
                Ok(())
            }
            Bootstrapped::Failed { state, reason } => {
                if let Some(block) = self.blocks.get_mut(&name) {
                    block.fail(state, reason.clone());
                }
                let error = Error::RecoveryIndex {
                    reason: format!("bootstrap block {}: {}", name, reason),
                };
                self.handle.emit(
                    Diagnostic::fatal(Stage::Bootstrap, error.to_string()).subject(name),
                );
                Err(error)
            }
        }
    }

    fn set_aside_foreign_blocks(&mut self) {
        let Some(label) = self.run_label.clone() else {
            return;
        };
        for block in self.blocks.values_mut() {
            if block.state.is_terminal_failure() {
                continue;
            }
            if block_run_label(&block.name) != Some(label.as_str()) {
                block.fail(BlockState::ForeignRun, format!("not part of run {}", label));
                self.handle.emit(
                    Diagnostic::warn(Stage::Gather, format!("block is not part of run {}", label))
                        .subject(block.name.clone()),
                );
            }
        }
    }

    fn missing_ordinals(&self) -> Vec<u32> {
        let expected = self.manifest.as_ref().map_or(0, |m| m.expected_blocks());
        let usable: BTreeSet<u32> = self
            .blocks
            .values()
            .filter(|b| !b.state.is_terminal_failure())
            .filter_map(|b| b.ordinal)
            .collect();
        (1..=expected).filter(|n| !usable.contains(n)).collect()
    }

    /// Pull missing blocks (and their signatures) through the transport
    fn fetch_missing(&mut self) -> Result<()> {
        let (Some(transport), Some(label)) = (self.engine.transport(), self.run_label.clone())
        else {
            return Ok(());
        };
        let incoming = self.workspace.join("incoming");
        fs::create_dir_all(&incoming)?;

        let jobs = self
            .missing_ordinals()
            .into_iter()
            .map(|ordinal| {
                let name = format!("{}-{}", label, ordinal);
                let incoming = &incoming;
                Job::new(name.clone(), move || {
                    let tap = format!("{}.tap", name);
                    fs::write(incoming.join(&tap), transport.fetch(&tap)?)?;
                    let sig = format!("{}.{}", tap, SIGNATURE_EXTENSION);
                    match transport.fetch(&sig) {
                        Ok(bytes) => fs::write(incoming.join(&sig), bytes)?,
                        Err(e) => debug!("No signature for {}: {}", name, e),
                    }
                    Ok(())
                })
            })
            .collect();
        let outcome = self
            .engine
            .pool()
            .run_stage(Stage::Gather, jobs, &self.handle)?;
        for (name, error) in outcome.failures {
            self.handle.emit(
                Diagnostic::warn(Stage::Gather, format!("cannot fetch block: {}", error))
                    .task(name),
            );
        }

        if !outcome.outputs.is_empty() {
            self.collect(&incoming)?;
            self.verify()?;
            self.set_aside_foreign_blocks();
        }
        Ok(())
    }

    /// Ask the operator for media until every declared block is present or
    /// the operator gives up.
    pub fn gather(&mut self) -> Result<()> {
        if self.engine.transport().is_some() && !self.missing_ordinals().is_empty() {
            self.fetch_missing()?;
        }
        loop {
            let missing = self.missing_ordinals();
            if missing.is_empty() {
                break;
            }
            if self.config().non_interactive {
                break;
            }
            let Some(source) = self.engine.operator().request_media(&missing) else {
                break;
            };
            let added = self.collect(&source)?;
            if added == 0 {
                self.handle.emit(
                    Diagnostic::warn(Stage::Gather, "no new blocks found")
                        .subject(source.display().to_string()),
                );
            }
            self.verify()?;
            self.set_aside_foreign_blocks();
        }

        self.missing = self.missing_ordinals();
        if !self.missing.is_empty() {
            let list: Vec<String> = self.missing.iter().map(u32::to_string).collect();
            self.handle.emit(Diagnostic::warn(
                Stage::Gather,
                format!("continuing without blocks {}", list.join(", ")),
            ));
        }
        Ok(())
    }

    /// Decrypt every verified block in parallel
    pub fn decrypt(&mut self) -> Result<()> {
        let crypto = self.engine.crypto();
        let workspace = &self.workspace;
        let jobs = self
            .blocks
            .values()
            .filter(|b| b.state == BlockState::SignatureValid)
            .map(|b| {
                let name = b.name.clone();
                let tap = &b.tap;
                Job::new(name.clone(), move || {
                    let payload = workspace.join(format!("{}.payload", name));
                    let outcome = decrypt_file(crypto, tap, &payload)?;
                    if outcome.ok {
                        Ok(payload)
                    } else {
                        Err(Error::DecryptFailure {
                            block: name,
                            status: outcome.status,
                        })
                    }
                })
            })
            .collect();

        let outcome = self
            .engine
            .pool()
            .run_stage(Stage::Decrypt, jobs, &self.handle)?;
        for (name, payload) in outcome.outputs {
            if let Some(block) = self.blocks.get_mut(&name) {
                block.state = BlockState::Decrypted;
                block.payload = Some(payload);
            }
        }
        for (name, error) in outcome.failures {
            self.handle.emit(
                Diagnostic::error(Stage::Decrypt, error.to_string())
                    .task(name.clone())
                    .subject(name.clone()),
            );
            if let Some(block) = self.blocks.get_mut(&name) {
                block.fail(BlockState::FailedDecrypt, error.to_string());
            }
        }
        Ok(())
    }

    /// Turn each decrypted payload into a plain tar
    pub fn decompress(&mut self) -> Result<()> {
        let codec = self.engine.archive();
        let workspace = &self.workspace;
        let jobs = self
            .blocks
            .values()
            .filter(|b| b.state == BlockState::Decrypted)
            .filter_map(|b| {
                let payload = b.payload.as_ref()?;
                let name = b.name.clone();
                Some(Job::new(name.clone(), move || {
                    let tar = workspace.join(format!("{}.tar", name));
                    unpack_payload(codec, payload, &tar)?;
                    Ok(tar)
                }))
            })
            .collect();

        let outcome = self
            .engine
            .pool()
            .run_stage(Stage::Decompress, jobs, &self.handle)?;
        for (name, tar) in outcome.outputs {
            if let Some(block) = self.blocks.get_mut(&name) {
                block.state = BlockState::Decompressed;
                block.payload = None;
                block.tar = Some(tar);
            }
        }
        for (name, error) in outcome.failures {
            self.handle.emit(
                Diagnostic::error(Stage::Decompress, error.to_string())
                    .task(name.clone())
                    .subject(name.clone()),
            );
            if let Some(block) = self.blocks.get_mut(&name) {
                block.fail(BlockState::CorruptArchive, error.to_string());
            }
        }
        Ok(())
    }

    /// Write every packed member back under its category root
    pub fn extract(&mut self) -> Result<()> {
        let codec = self.engine.archive();
        let config = self.config();
        let manifest = self.manifest.as_ref().ok_or_else(|| Error::RecoveryIndex {
            reason: "extract called before bootstrap".to_string(),
        })?;

        let mut listings = Vec::new();
        let mut corrupt = Vec::new();
        for block in self.blocks.values() {
            if !matches!(
                block.state,
                BlockState::Decompressed | BlockState::ManifestRead
            ) {
                continue;
            }
            let Some(tar) = block.tar.as_ref() else {
                continue;
            };
            match codec.list(tar) {
                Ok(members) => listings.push((block.name.clone(), tar, members)),
                Err(e) => corrupt.push((block.name.clone(), e)),
            }
        }

        let mut jobs = Vec::new();
        for (_, tar, members) in &listings {
            for member in members.iter().filter(|m| !is_manifest_member(m)) {
                let tar: &Path = tar;
                jobs.push(Job::new(member.clone(), move || {
                    restore_member(codec, config, manifest, tar, member)
                }));
            }
        }
        let outcome = self
            .engine
            .pool()
            .run_stage(Stage::Extract, jobs, &self.handle)?;

        let extracted: Vec<String> = listings.into_iter().map(|(name, _, _)| name).collect();
        for name in extracted {
            if let Some(block) = self.blocks.get_mut(&name) {
                block.state = BlockState::Extracted;
            }
        }
        for (name, error) in corrupt {
            self.handle.emit(
                Diagnostic::error(Stage::Extract, error.to_string()).subject(name.clone()),
            );
            if let Some(block) = self.blocks.get_mut(&name) {
                block.fail(BlockState::CorruptArchive, error.to_string());
            }
        }

        for (_, placed) in outcome.outputs {
            if let Some(category) = placed.unmapped {
                if self.unmapped.insert(category.clone()) {
                    let error = Error::CategoryUnmapped {
                        category: category.clone(),
                    };
                    self.handle.emit(
                        Diagnostic::warn(
                            Stage::Extract,
                            format!("{}, restoring under the drop directory", error),
                        )
                        .subject(category),
                    );
                }
            }
            self.restored.push(placed.file);
        }

        for (id, error) in outcome.failures {
            let (category, fpath) = match self.manifest.as_ref() {
                Some(manifest) => {
                    let (category, fpath) = manifest.find(&id);
                    (category.to_string(), fpath.to_string())
                }
                None => (NOT_FOUND.to_string(), String::new()),
            };
            self.handle.emit(
                Diagnostic::error(Stage::Extract, error.to_string())
                    .task(id.clone())
                    .subject(fpath.clone()),
            );
            if let Error::IntegrityMismatch {
                expected, actual, ..
            } = &error
            {
                self.mismatches.push(IntegrityFailure {
                    id: id.clone(),
                    path: PathBuf::from(&fpath),
                    expected: expected.clone(),
                    actual: actual.clone(),
                });
            }
            self.unplaced.push(UnplacedFile {
                id,
                category,
                fpath,
                reason: error.to_string(),
            });
        }

        self.account_for_unseen_files();
        info!(
            "Restored {} files, {} not placed",
            self.restored.len(),
            self.unplaced.len()
        );
        Ok(())
    }

    /// Index entries that no extracted block carried.
    ///
    /// When every block of the run was extracted the entry names a member
    /// that no block holds; otherwise its block is assumed lost.
    fn account_for_unseen_files(&mut self) {
        let Some(manifest) = self.manifest.as_ref() else {
            return;
        };
        let seen: BTreeSet<&str> = self
            .restored
            .iter()
            .map(|f| f.id.as_str())
            .chain(self.unplaced.iter().map(|f| f.id.as_str()))
            .collect();
        let extracted: BTreeSet<u32> = self
            .blocks
            .values()
            .filter(|b| b.state == BlockState::Extracted)
            .filter_map(|b| b.ordinal)
            .collect();
        let every_block_extracted =
            (1..=manifest.expected_blocks()).all(|ordinal| extracted.contains(&ordinal));
        let reason = if every_block_extracted {
            "no restored block carried this file"
        } else {
            "block holding this file was not restored"
        };

        let unseen: Vec<UnplacedFile> = manifest
            .index
            .iter()
            .filter(|(id, _)| !seen.contains(id.as_str()))
            .map(|(id, entry)| UnplacedFile {
                id: id.clone(),
                category: entry.category.clone(),
                fpath: entry.fpath.clone(),
                reason: reason.to_string(),
            })
            .collect();
        if every_block_extracted {
            for file in &unseen {
                self.handle.emit(
                    Diagnostic::error(Stage::Extract, "indexed file missing from every block")
                        .task(file.id.clone())
                        .subject(file.fpath.clone()),
                );
            }
        }
        if !unseen.is_empty() {
            warn!("{} indexed files not restored: {}", unseen.len(), reason);
        }
        self.unplaced.extend(unseen);
    }

    /// Stop the reporter, clear the workspace and assemble the report
    pub fn finish(self) -> RestoreReport {
        let mut blocks: Vec<BlockStatus> = self
            .blocks
            .values()
            .map(|b| BlockStatus {
                name: b.name.clone(),
                ordinal: b.ordinal,
                state: b.state,
                detail: b.detail.clone(),
            })
            .collect();
        blocks.sort_by(|a, b| {
            (a.ordinal.unwrap_or(u32::MAX), &a.name).cmp(&(b.ordinal.unwrap_or(u32::MAX), &b.name))
        });

        if let Err(e) = fs::remove_dir_all(&self.workspace) {
            self.handle.emit(
                Diagnostic::warn(Stage::Extract, format!("cannot clean restore workspace: {}", e))
                    .subject(self.workspace.display().to_string()),
            );
        }
        drop(self.handle);
        let summary = self.reporter.finish();

        RestoreReport {
            run: self.run_label,
            expected_blocks: self.manifest.as_ref().map_or(0, |m| m.expected_blocks()),
            blocks,
            restored: self.restored,
            unplaced: self.unplaced,
            missing_blocks: self.missing,
            unmapped_categories: self.unmapped,
            integrity_mismatches: self.mismatches,
            diagnostics: summary.diagnostics,
        }
    }
}

/// `<dir of fpath>/<fname>`: the stored relative path with the original base name
fn restore_relative(fpath: &str, fname: &str) -> String {
    let dir = fpath.rsplit_once('/').map(|(dir, _)| dir);
    let base = if fname.is_empty() {
        fpath.rsplit('/').next().unwrap_or(fpath)
    } else {
        fname
    };
    match dir {
        Some(dir) if !dir.is_empty() => format!("{}/{}", dir, base),
        _ => base.to_string(),
    }
}

fn restore_member(
    codec: &dyn ArchiveCodec,
    config: &Config,
    manifest: &RecoveryManifest,
    tar: &Path,
    id: &str,
) -> Result<Placed> {
    let (category, relative, expected) = match manifest.entry(id) {
        Some(entry) => (
            entry.category.as_str(),
            restore_relative(&entry.fpath, &entry.fname),
            entry.sha256.as_str(),
        ),
        // metadata drift: keep the bytes under their id
        None => (NOT_FOUND, id.to_string(), ""),
    };

    let (root, unmapped) = match config.category_root(category) {
        Some(root) if category != NOT_FOUND => (root.to_path_buf(), None),
        _ => {
            validate_relative(category)?;
            (config.drop_dir.join(category), Some(category.to_string()))
        }
    };
    let dest = resolve_under(&root, &relative)?;
    let dir = dest.parent().unwrap_or(&root);
    fs::create_dir_all(dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    let mut writer = HashingWriter::new(BufWriter::new(tmp.as_file_mut()));
    codec.extract_to_writer(tar, id, &mut writer)?;
    let size = writer.written();
    let (mut inner, actual) = writer.finish();
    inner.flush()?;
    drop(inner);

    if !expected.is_empty() && actual != expected {
        return Err(Error::IntegrityMismatch {
            id: id.to_string(),
            expected: expected.to_string(),
            actual,
        });
    }
    tmp.persist(&dest).map_err(|e| e.error)?;
    debug!("Restored {} to {}", id, dest.display());

    Ok(Placed {
        file: RestoredFile {
            id: id.to_string(),
            category: category.to_string(),
            path: dest,
            size,
        },
        unmapped: unmapped.filter(|c| c != NOT_FOUND),
    })
}
