//! Run reports returned by the backup and restore pipelines.
//!
//! Both reports serialize to JSON; the CLI writes them next to the blocks as
//! `<drop>/<run>-report.json`.

use crate::events::{Diagnostic, Level, Stage};
use crate::planner::SkippedFile;
use crate::Result;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

/// A stored SHA-256 that did not match the bytes read back
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntegrityFailure {
    pub id: String,
    /// Source path on backup, destination path on restore
    pub path: PathBuf,
    pub expected: String,
    pub actual: String,
}

/// A task that failed without aborting the run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskFailure {
    pub stage: Stage,
    pub task: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockSummary {
    pub name: String,
    pub ordinal: u32,
    pub files: usize,
    pub bytes: u64,
    /// The `.tap`, once written
    pub output: Option<PathBuf>,
    /// The detached signature, once written
    pub signature: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BackupReport {
    pub run: String,
    pub date: String,
    pub blocks: Vec<BlockSummary>,
    pub files_packed: u64,
    pub bytes_packed: u64,
    pub skipped: Vec<SkippedFile>,
    pub integrity_mismatches: Vec<IntegrityFailure>,
    pub failures: Vec<TaskFailure>,
    /// Names handed to the transport
    pub published: Vec<String>,
    pub diagnostics: Vec<Diagnostic>,
}

impl BackupReport {
    /// True when every planned block was written and nothing was flagged
    pub fn is_clean(&self) -> bool {
        self.skipped.is_empty()
            && self.integrity_mismatches.is_empty()
            && self.failures.is_empty()
            && self.blocks.iter().all(|b| b.output.is_some())
    }

    pub fn write_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        write_json(self, path.as_ref())
    }
}

/// Where a restore left each block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BlockState {
    Collected,
    SignaturePending,
    SignatureValid,
    Decrypted,
    Decompressed,
    ManifestRead,
    Extracted,
    RejectedSignature,
    FailedDecrypt,
    CorruptArchive,
    CorruptManifest,
    /// Belongs to a different run than the bootstrap block
    ForeignRun,
}

impl BlockState {
    pub fn is_terminal_failure(self) -> bool {
        matches!(
            self,
            BlockState::RejectedSignature
                | BlockState::FailedDecrypt
                | BlockState::CorruptArchive
                | BlockState::CorruptManifest
                | BlockState::ForeignRun
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockStatus {
    pub name: String,
    pub ordinal: Option<u32>,
    pub state: BlockState,
    /// Why the block stopped, for failure states
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestoredFile {
    pub id: String,
    pub category: String,
    pub path: PathBuf,
    pub size: u64,
}

/// An index entry that did not end up on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnplacedFile {
    pub id: String,
    pub category: String,
    pub fpath: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RestoreReport {
    /// `<host>-<date>` of the restored run
    pub run: Option<String>,
    pub expected_blocks: u32,
    pub blocks: Vec<BlockStatus>,
    pub restored: Vec<RestoredFile>,
    pub unplaced: Vec<UnplacedFile>,
    pub missing_blocks: Vec<u32>,
    pub unmapped_categories: BTreeSet<String>,
    pub integrity_mismatches: Vec<IntegrityFailure>,
    pub diagnostics: Vec<Diagnostic>,
}

impl RestoreReport {
    /// True when every indexed file was placed under a configured root
    pub fn is_complete(&self) -> bool {
        self.unplaced.is_empty()
            && self.missing_blocks.is_empty()
            && self.unmapped_categories.is_empty()
            && self.integrity_mismatches.is_empty()
    }

    pub fn rejected_blocks(&self) -> Vec<&str> {
        self.blocks
            .iter()
            .filter(|b| b.state == BlockState::RejectedSignature)
            .map(|b| b.name.as_str())
            .collect()
    }

    pub fn block(&self, name: &str) -> Option<&BlockStatus> {
        self.blocks.iter().find(|b| b.name == name)
    }

    pub fn errors(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics.iter().filter(|d| d.level >= Level::Error)
    }

    pub fn write_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        write_json(self, path.as_ref())
    }
}

fn write_json<T: Serialize>(report: &T, path: &Path) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(tmp.as_file_mut(), report)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_backup_report_json() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let report = BackupReport {
            run: "h1-2024-01-02".to_string(),
            date: "2024-01-02".to_string(),
            blocks: vec![BlockSummary {
                name: "h1-2024-01-02-1".to_string(),
                ordinal: 1,
                files: 1,
                bytes: 11,
                output: Some(PathBuf::from("/drop/h1-2024-01-02-1.tap")),
                signature: None,
            }],
            files_packed: 1,
            bytes_packed: 11,
            ..BackupReport::default()
        };
        assert!(report.is_clean());

        let path = temp_dir.path().join("h1-2024-01-02-report.json");
        report.write_json(&path)?;
        let value: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path)?)?;
        assert_eq!(value["blocks"][0]["name"], "h1-2024-01-02-1");
        assert_eq!(value["files_packed"], 1);
        Ok(())
    }

    #[test]
    fn test_restore_report_states() {
        let mut report = RestoreReport::default();
        report.blocks.push(BlockStatus {
            name: "b1".to_string(),
            ordinal: Some(1),
            state: BlockState::RejectedSignature,
            detail: Some("bad signature".to_string()),
        });
        report.blocks.push(BlockStatus {
            name: "b2".to_string(),
            ordinal: Some(2),
            state: BlockState::Extracted,
            detail: None,
        });
        assert_eq!(report.rejected_blocks(), vec!["b1"]);
        assert!(report.is_complete());
        assert!(BlockState::FailedDecrypt.is_terminal_failure());
        assert!(!BlockState::Extracted.is_terminal_failure());
        assert_eq!(
            serde_json::to_string(&BlockState::RejectedSignature).unwrap(),
            "\"rejected-signature\""
        );
    }
}
