//! Recovery manifest ("RIFF") embedded in every block.
//!
//! Every block carries the complete file index of its run, so any single block
//! is enough to plan a full restore. The manifest is JSON with three top-level
//! tables: `metaBlock`, `metaRun` and `index`. Blocks written by older releases
//! carry a pickled manifest instead, which [`RecoveryManifest::parse`] also
//! accepts (see [`legacy`]).

pub mod legacy;

use crate::{Error, Result};
use chrono::{DateTime, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Archive member name of the JSON manifest
pub const RIFF_MEMBER: &str = "recovery-riff";

/// Archive member name of the legacy pickled manifest
pub const LEGACY_MEMBER: &str = "recovery-pkl";

/// Category returned by [`RecoveryManifest::find`] for unknown ids
pub const NOT_FOUND: &str = "not-found";

/// Whether an archive member name is a manifest rather than a packed file
pub fn is_manifest_member(name: &str) -> bool {
    name == RIFF_MEMBER || name == LEGACY_MEMBER
}

/// Per-block metadata
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaBlock {
    /// Ordinal of this block, from 1
    pub num_block: u32,
    /// Uncompressed bytes of packed files
    pub size_large: u64,
    /// Files packed into this block
    pub count_files: u64,
}

/// Date of the run: unix seconds or an ISO date string
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordDate {
    Unix(i64),
    Iso(String),
}

impl RecordDate {
    pub fn from_date(date: NaiveDate) -> Self {
        RecordDate::Iso(date.format("%Y-%m-%d").to_string())
    }

    /// Calendar date, if the value is well formed
    pub fn date(&self) -> Option<NaiveDate> {
        match self {
            RecordDate::Unix(secs) => DateTime::from_timestamp(*secs, 0).map(|d| d.date_naive()),
            RecordDate::Iso(s) => {
                let day = s.get(..10).unwrap_or(s);
                NaiveDate::parse_from_str(day, "%Y-%m-%d").ok()
            }
        }
    }
}

impl Default for RecordDate {
    fn default() -> Self {
        RecordDate::Unix(0)
    }
}

/// Run-wide metadata, identical in every block of the run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaRun {
    /// Blocks in the run
    pub sum_block: u32,
    /// Total bytes of packed files
    pub size_extra_large: u64,
    /// Total packed files
    pub count_files_sum: u64,
    pub date_rec: RecordDate,
    #[serde(default)]
    pub comment: String,
}

/// One file of the run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    /// Original base filename
    pub fname: String,
    /// SHA-256 hex; empty when recovered from a legacy manifest
    #[serde(default)]
    pub sha256: String,
    pub category: String,
    /// Path relative to the category root
    pub fpath: String,
    #[serde(default)]
    pub fsize: u64,
}

/// The complete recovery manifest of one block
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryManifest {
    pub meta_block: MetaBlock,
    pub meta_run: MetaRun,
    pub index: BTreeMap<String, IndexEntry>,
    /// Set when parsed from a pickled manifest
    #[serde(skip)]
    pub legacy: bool,
}

/// Borrowing view used to serialize one block's manifest without cloning the
/// run-wide index.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestView<'a> {
    pub meta_block: &'a MetaBlock,
    pub meta_run: &'a MetaRun,
    pub index: &'a BTreeMap<String, IndexEntry>,
}

impl ManifestView<'_> {
    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

impl RecoveryManifest {
    /// Serialize to the JSON wire format
    pub fn serialize(&self) -> Result<Vec<u8>> {
        ManifestView {
            meta_block: &self.meta_block,
            meta_run: &self.meta_run,
            index: &self.index,
        }
        .serialize()
    }

    /// Parse a RIFF manifest, falling back to the legacy pickle format.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let riff_error = match serde_json::from_slice::<RecoveryManifest>(bytes) {
            Ok(manifest) => return Ok(manifest),
            Err(e) => e,
        };

        match legacy::LegacyManifest::parse(bytes) {
            Ok(legacy) => Ok(legacy.into_manifest()),
            Err(legacy_error) => Err(Error::RecoveryIndex {
                reason: format!(
                    "neither a RIFF manifest ({}) nor a legacy manifest ({})",
                    riff_error, legacy_error
                ),
            }),
        }
    }

    /// Locate a file: `(category, relative path)`, or `(NOT_FOUND, "")`.
    pub fn find(&self, id: &str) -> (&str, &str) {
        match self.index.get(id) {
            Some(entry) => (entry.category.as_str(), entry.fpath.as_str()),
            None => (NOT_FOUND, ""),
        }
    }

    pub fn entry(&self, id: &str) -> Option<&IndexEntry> {
        self.index.get(id)
    }

    /// Blocks the run declared
    pub fn expected_blocks(&self) -> u32 {
        self.meta_run.sum_block
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample() -> RecoveryManifest {
        let mut index = BTreeMap::new();
        index.insert(
            "id-1".to_string(),
            IndexEntry {
                fname: "a.txt".to_string(),
                sha256: "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
                    .to_string(),
                category: "docs".to_string(),
                fpath: "notes/a.txt".to_string(),
                fsize: 5,
            },
        );
        RecoveryManifest {
            meta_block: MetaBlock {
                num_block: 1,
                size_large: 5,
                count_files: 1,
            },
            meta_run: MetaRun {
                sum_block: 1,
                size_extra_large: 5,
                count_files_sum: 1,
                date_rec: RecordDate::Iso("2024-01-02".to_string()),
                comment: String::new(),
            },
            index,
            legacy: false,
        }
    }

    #[test]
    fn test_wire_format_keys() -> Result<()> {
        let bytes = sample().serialize()?;
        let value: serde_json::Value = serde_json::from_slice(&bytes)?;

        assert_eq!(value["metaBlock"]["numBlock"], 1);
        assert_eq!(value["metaRun"]["sumBlock"], 1);
        assert_eq!(value["metaRun"]["countFilesSum"], 1);
        assert_eq!(value["metaRun"]["dateRec"], "2024-01-02");
        assert_eq!(value["index"]["id-1"]["fpath"], "notes/a.txt");
        assert_eq!(value["index"]["id-1"]["fsize"], 5);
        assert!(value.get("legacy").is_none());
        Ok(())
    }

    #[test]
    fn test_parse_serialized() -> Result<()> {
        let manifest = sample();
        let parsed = RecoveryManifest::parse(&manifest.serialize()?)?;
        assert_eq!(parsed, manifest);
        Ok(())
    }

    #[test]
    fn test_parse_accepts_unix_date() -> Result<()> {
        let json = br#"{"metaBlock":{"numBlock":2,"sizeLarge":10,"countFiles":1},
            "metaRun":{"sumBlock":3,"sizeExtraLarge":30,"countFilesSum":3,"dateRec":1704153600},
            "index":{}}"#;
        let parsed = RecoveryManifest::parse(json)?;
        assert_eq!(parsed.expected_blocks(), 3);
        assert_eq!(parsed.meta_run.date_rec, RecordDate::Unix(1704153600));
        assert_eq!(
            parsed.meta_run.date_rec.date(),
            NaiveDate::from_ymd_opt(2024, 1, 2)
        );
        assert_eq!(parsed.meta_run.comment, "");
        Ok(())
    }

    #[test]
    fn test_parse_rejects_garbage() {
        let result = RecoveryManifest::parse(b"definitely not a manifest");
        assert!(matches!(result, Err(Error::RecoveryIndex { .. })));
    }

    #[test]
    fn test_find_returns_sentinel() {
        let manifest = sample();
        assert_eq!(manifest.find("id-1"), ("docs", "notes/a.txt"));
        assert_eq!(manifest.find("missing"), (NOT_FOUND, ""));
    }

    #[test]
    fn test_manifest_member_names() {
        assert!(is_manifest_member("recovery-riff"));
        assert!(is_manifest_member("recovery-pkl"));
        assert!(!is_manifest_member("3f1c0c1e-0000-4000-8000-000000000000"));
    }
}
