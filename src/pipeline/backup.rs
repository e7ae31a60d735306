//! Backup: plan, build, validate, compress, encrypt, sign, publish.

use super::{signature_path, write_atomic, Engine, BLOCK_EXTENSION};
use crate::crypto::require_key;
use crate::events::{Diagnostic, ReportHandle, Reporter, Stage};
use crate::hashing::HashingWriter;
use crate::manifest::RIFF_MEMBER;
use crate::planner::{self, Plan, SkippedFile};
use crate::pool::{ArchiveLocks, Job};
use crate::report::{BackupReport, BlockSummary, IntegrityFailure, TaskFailure};
use crate::{Error, Result};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// One backup run, stage by stage.
///
/// [`Engine::backup`] calls the stages in order; they are public so callers
/// can interleave their own checks between them.
pub struct BackupRun<'e> {
    engine: &'e Engine,
    reporter: Reporter,
    handle: ReportHandle,
    plan: Plan,
    /// Current workspace artifact per block (plain or compressed tar)
    archives: BTreeMap<String, PathBuf>,
    outputs: BTreeMap<String, PathBuf>,
    signatures: BTreeMap<String, PathBuf>,
    failed: BTreeSet<String>,
    mismatches: Vec<IntegrityFailure>,
    failures: Vec<TaskFailure>,
    published: Vec<String>,
}

impl<'e> BackupRun<'e> {
    /// Check keys, prepare directories and run the plan stage
    pub fn start(engine: &'e Engine) -> Result<Self> {
        let config = engine.context().config();
        require_key(engine.crypto(), &config.active_key, false)?;
        if config.sign {
            require_key(engine.crypto(), &config.signing_key, true)?;
        }
        fs::create_dir_all(&config.workspace)?;
        fs::create_dir_all(&config.drop_dir)?;

        let reporter = Reporter::spawn(engine.frontend())?;
        let handle = reporter.handle();
        info!("Starting backup run {}", engine.context().run_label());
        let plan = planner::plan(engine.context(), &handle)?;

        Ok(Self {
            engine,
            reporter,
            handle,
            plan,
            archives: BTreeMap::new(),
            outputs: BTreeMap::new(),
            signatures: BTreeMap::new(),
            failed: BTreeSet::new(),
            mismatches: Vec::new(),
            failures: Vec::new(),
            published: Vec::new(),
        })
    }

    pub fn plan(&self) -> &Plan {
        &self.plan
    }

    /// Workspace archive of a block between build and encrypt
    pub fn archive_path(&self, block: &str) -> Option<&Path> {
        self.archives.get(block).map(PathBuf::as_path)
    }

    /// Blocks still in the run, by name
    fn live_blocks(&self) -> impl Iterator<Item = (&String, &PathBuf)> {
        self.archives
            .iter()
            .filter(|(name, _)| !self.failed.contains(*name))
    }

    fn record_failure(&mut self, stage: Stage, task: String, error: &Error) {
        self.handle
            .emit(Diagnostic::error(stage, error.to_string()).task(task.clone()));
        self.failures.push(TaskFailure {
            stage,
            task,
            message: error.to_string(),
        });
    }

    /// Append every file into its block's archive, then the manifest.
    ///
    /// The manifest goes in last so that it only indexes files whose bytes
    /// actually reached the archive.
    pub fn build(&mut self) -> Result<()> {
        let workspace = &self.engine.context().config().workspace;
        let mut archives = BTreeMap::new();
        for block in &self.plan.blocks {
            let path = workspace.join(format!("{}.tar", block.name()));
            if path.exists() {
                fs::remove_file(&path)?;
            }
            archives.insert(block.name().to_string(), path);
        }

        let codec = self.engine.archive();
        let locks = ArchiveLocks::new(archives.keys().cloned());

        let mut jobs = Vec::new();
        for block in &self.plan.blocks {
            let tar = &archives[block.name()];
            let locks = &locks;
            for record in block.files() {
                jobs.push(Job::new(record.id.clone(), move || {
                    locks.with_lock(block.name(), || {
                        codec.append_file(tar, &record.id, &record.source_path)
                    })
                }));
            }
        }
        let outcome = self
            .engine
            .pool()
            .run_stage(Stage::Build, jobs, &self.handle)?;

        let mut lost = BTreeSet::new();
        for (id, error) in outcome.failures {
            lost.insert(id.clone());
            self.record_failure(Stage::Build, id, &error);
        }
        if !lost.is_empty() {
            let dropped = self.plan.drop_files(&lost);
            for record in &dropped {
                warn!(
                    "{} left out of the run: its bytes never reached the archive",
                    record.source_path.display()
                );
                self.plan.skipped.push(SkippedFile {
                    path: record.source_path.clone(),
                    size: record.size,
                    reason: "append to the block archive failed".to_string(),
                });
            }
        }

        let mut manifests = Vec::with_capacity(self.plan.blocks.len());
        for (position, block) in self.plan.blocks.iter().enumerate() {
            let view = self.plan.manifest(position).ok_or_else(|| Error::WorkerPool {
                reason: format!("no manifest for block {}", block.name()),
            })?;
            manifests.push((block.name().to_string(), view.serialize()?));
        }
        let jobs = manifests
            .iter()
            .map(|(name, manifest)| {
                let tar = &archives[name];
                Job::new(name.clone(), move || {
                    codec.append_bytes(tar, RIFF_MEMBER, manifest)
                })
            })
            .collect();
        let outcome = self
            .engine
            .pool()
            .run_stage(Stage::Build, jobs, &self.handle)?;
        for (name, error) in outcome.failures {
            self.failed.insert(name.clone());
            self.record_failure(Stage::Build, name, &error);
        }

        self.archives = archives;
        info!(
            "Built {} archives",
            self.archives.len() - self.failed.len()
        );
        Ok(())
    }

    /// Re-read every packed member and compare its SHA-256 to the record
    pub fn validate(&mut self) -> Result<()> {
        if !self.engine.context().config().validate {
            self.handle
                .emit(Diagnostic::info(Stage::Validate, "integrity validation disabled"));
            return Ok(());
        }

        let codec = self.engine.archive();
        let mut jobs = Vec::new();
        let mut sources = HashMap::new();
        for block in &self.plan.blocks {
            if self.failed.contains(block.name()) {
                continue;
            }
            let Some(tar) = self.archives.get(block.name()) else {
                continue;
            };
            for record in block.files() {
                sources.insert(record.id.clone(), record.source_path.clone());
                jobs.push(Job::new(record.id.clone(), move || {
                    let mut writer = HashingWriter::new(io::sink());
                    codec.extract_to_writer(tar, &record.id, &mut writer)?;
                    let (_, actual) = writer.finish();
                    if actual == record.sha256 {
                        Ok(())
                    } else {
                        Err(Error::IntegrityMismatch {
                            id: record.id.clone(),
                            expected: record.sha256.clone(),
                            actual,
                        })
                    }
                }));
            }
        }

        let outcome = self
            .engine
            .pool()
            .run_stage(Stage::Validate, jobs, &self.handle)?;
        for (task, error) in outcome.failures {
            match error {
                Error::IntegrityMismatch {
                    id,
                    expected,
                    actual,
                } => {
                    let path = sources.remove(&id).unwrap_or_default();
                    self.handle.emit(
                        Diagnostic::error(
                            Stage::Validate,
                            format!("integrity mismatch for {}", id),
                        )
                        .task(task)
                        .subject(path.display().to_string()),
                    );
                    self.mismatches.push(IntegrityFailure {
                        id,
                        path,
                        expected,
                        actual,
                    });
                }
                other => self.record_failure(Stage::Validate, task, &other),
            }
        }
        Ok(())
    }

    /// bzip2 each archive, replacing the plain tar
    pub fn compress(&mut self) -> Result<()> {
        let config = self.engine.context().config();
        if !config.compress {
            self.handle
                .emit(Diagnostic::info(Stage::Compress, "compression disabled"));
            return Ok(());
        }

        let codec = self.engine.archive();
        let level = config.compression_level;
        let jobs = self
            .live_blocks()
            .map(|(name, tar)| {
                Job::new(name.clone(), move || {
                    let mut packed = tar.as_os_str().to_os_string();
                    packed.push(".bz2");
                    let packed = PathBuf::from(packed);
                    codec.compress(tar, &packed, level)?;
                    fs::remove_file(tar)?;
                    Ok(packed)
                })
            })
            .collect();

        let outcome = self
            .engine
            .pool()
            .run_stage(Stage::Compress, jobs, &self.handle)?;
        for (name, packed) in outcome.outputs {
            self.archives.insert(name, packed);
        }
        for (name, error) in outcome.failures {
            self.failed.insert(name.clone());
            self.record_failure(Stage::Compress, name, &error);
        }
        Ok(())
    }

    /// Encrypt each archive to the active key as `<drop>/<block>.tap`
    pub fn encrypt(&mut self) -> Result<()> {
        let config = self.engine.context().config();
        let crypto = self.engine.crypto();
        let recipient = config.active_key.as_str();
        let drop_dir = &config.drop_dir;

        let jobs = self
            .live_blocks()
            .map(|(name, payload)| {
                Job::new(name.clone(), move || {
                    let tap = drop_dir.join(format!("{}.{}", name, BLOCK_EXTENSION));
                    let mut input = BufReader::new(File::open(payload)?);
                    write_atomic(&tap, |out| crypto.encrypt_to(recipient, &mut input, out))?;
                    fs::remove_file(payload)?;
                    Ok(tap)
                })
            })
            .collect();

        let outcome = self
            .engine
            .pool()
            .run_stage(Stage::Encrypt, jobs, &self.handle)?;
        for (name, tap) in outcome.outputs {
            self.handle.emit(
                Diagnostic::info(Stage::Encrypt, "block written")
                    .task(name.clone())
                    .subject(tap.display().to_string()),
            );
            self.outputs.insert(name, tap);
        }
        for (name, error) in outcome.failures {
            self.failed.insert(name.clone());
            self.record_failure(Stage::Encrypt, name, &error);
        }
        Ok(())
    }

    /// Detached signature `<block>.tap.sig` for every written block
    pub fn sign(&mut self) -> Result<()> {
        let config = self.engine.context().config();
        if !config.sign {
            self.handle.emit(Diagnostic::info(Stage::Sign, "signing disabled"));
            return Ok(());
        }
        let crypto = self.engine.crypto();
        let signer = config.signing_key.as_str();

        let jobs = self
            .outputs
            .iter()
            .map(|(name, tap)| {
                Job::new(name.clone(), move || {
                    let sig = signature_path(tap);
                    let mut input = BufReader::new(File::open(tap)?);
                    write_atomic(&sig, |out| crypto.sign(signer, &mut input, out))?;
                    Ok(sig)
                })
            })
            .collect();

        let outcome = self
            .engine
            .pool()
            .run_stage(Stage::Sign, jobs, &self.handle)?;
        self.signatures.extend(outcome.outputs);
        for (name, error) in outcome.failures {
            self.record_failure(Stage::Sign, name, &error);
        }
        Ok(())
    }

    /// Hand blocks and signatures to the transport, if one is configured
    pub fn publish(&mut self) -> Result<()> {
        let Some(transport) = self.engine.transport() else {
            return Ok(());
        };

        let files: Vec<&PathBuf> = self.outputs.values().chain(self.signatures.values()).collect();
        let jobs = files
            .into_iter()
            .filter_map(|path| {
                let name = path.file_name()?.to_str()?.to_string();
                Some(Job::new(name.clone(), move || {
                    transport.store(&name, &fs::read(path)?)?;
                    Ok(name)
                }))
            })
            .collect();

        let outcome = self
            .engine
            .pool()
            .run_stage(Stage::Publish, jobs, &self.handle)?;
        let mut published: Vec<String> = outcome.outputs.into_iter().map(|(_, n)| n).collect();
        published.sort();
        self.published = published;
        for (name, error) in outcome.failures {
            warn!("Publishing {} failed, local copy kept", name);
            self.record_failure(Stage::Publish, name, &error);
        }
        Ok(())
    }

    /// Stop the reporter and assemble the run report
    pub fn finish(self) -> BackupReport {
        let ctx = self.engine.context();
        let blocks = self
            .plan
            .blocks
            .iter()
            .map(|block| BlockSummary {
                name: block.name().to_string(),
                ordinal: block.ordinal(),
                files: block.len(),
                bytes: block.used(),
                output: self.outputs.get(block.name()).cloned(),
                signature: self.signatures.get(block.name()).cloned(),
            })
            .collect();
        drop(self.handle);
        let summary = self.reporter.finish();

        info!(
            "Backup {} finished: {} blocks, {} mismatches, {} failures",
            ctx.run_label(),
            self.outputs.len(),
            self.mismatches.len(),
            self.failures.len()
        );
        BackupReport {
            run: ctx.run_label(),
            date: ctx.run_date().format("%Y-%m-%d").to_string(),
            blocks,
            files_packed: self.plan.meta_run.count_files_sum,
            bytes_packed: self.plan.meta_run.size_extra_large,
            skipped: self.plan.skipped,
            integrity_mismatches: self.mismatches,
            failures: self.failures,
            published: self.published,
            diagnostics: summary.diagnostics,
        }
    }
}
