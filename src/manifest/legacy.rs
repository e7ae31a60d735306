//! Read-only support for the pickled manifests of older releases.
//!
//! The legacy manifest is a pickled triple
//! `[block_count, {id: relative_path}, {id: category}]`, as a list or a tuple
//! and in any pickle protocol. Python 2 byte strings are decoded as UTF-8.

use super::{IndexEntry, MetaRun, RecoveryManifest};
use crate::{Error, Result};
use serde_pickle::DeOptions;
use std::collections::BTreeMap;

type Triple = (u32, BTreeMap<String, String>, BTreeMap<String, String>);

/// The decoded legacy triple
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyManifest {
    pub block_count: u32,
    pub paths: BTreeMap<String, String>,
    pub categories: BTreeMap<String, String>,
}

impl LegacyManifest {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let (block_count, paths, categories): Triple =
            serde_pickle::from_slice(bytes, DeOptions::new().decode_strings()).map_err(|e| {
                Error::RecoveryIndex {
                    reason: format!("legacy manifest: {}", e),
                }
            })?;
        Ok(Self {
            block_count,
            paths,
            categories,
        })
    }

    /// Lift into the current manifest model. Digests and sizes are unknown.
    pub fn into_manifest(self) -> RecoveryManifest {
        let mut index = BTreeMap::new();
        for (id, fpath) in self.paths {
            let category = self.categories.get(&id).cloned().unwrap_or_default();
            let fname = fpath
                .rsplit(['/', '\\'])
                .next()
                .unwrap_or(fpath.as_str())
                .to_string();
            index.insert(
                id,
                IndexEntry {
                    fname,
                    sha256: String::new(),
                    category,
                    fpath,
                    fsize: 0,
                },
            );
        }

        RecoveryManifest {
            meta_block: Default::default(),
            meta_run: MetaRun {
                sum_block: self.block_count,
                count_files_sum: index.len() as u64,
                ..Default::default()
            },
            index,
            legacy: true,
        }
    }
}

/// Build a protocol-2 pickle of a legacy triple, as older releases wrote them.
#[cfg(test)]
pub(crate) fn pickle_triple(
    count: u32,
    paths: &[(&str, &str)],
    categories: &[(&str, &str)],
) -> Vec<u8> {
    fn push_str(out: &mut Vec<u8>, s: &str) {
        out.push(b'X');
        out.extend_from_slice(&(s.len() as u32).to_le_bytes());
        out.extend_from_slice(s.as_bytes());
    }
    fn push_dict(out: &mut Vec<u8>, pairs: &[(&str, &str)]) {
        out.push(b'}');
        out.push(b'(');
        for (k, v) in pairs {
            push_str(out, k);
            push_str(out, v);
        }
        out.push(b'u');
    }

    let mut out = vec![0x80, 0x02, b']', b'q', 0x00, b'('];
    out.push(b'J');
    out.extend_from_slice(&(count as i32).to_le_bytes());
    push_dict(&mut out, paths);
    push_dict(&mut out, categories);
    out.push(b'e');
    out.push(b'.');
    out
}

#[cfg(test)]
fn pickle_triple_with_count(count: i32) -> Vec<u8> {
    let mut bytes = pickle_triple(0, &[], &[]);
    // the count follows the list, memo and mark opcodes
    bytes[7..11].copy_from_slice(&count.to_le_bytes());
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_protocol2_list() -> Result<()> {
        let bytes = pickle_triple(
            2,
            &[("id-a", "notes/a.txt"), ("id-b", "b.txt")],
            &[("id-a", "docs"), ("id-b", "pictures")],
        );
        let legacy = LegacyManifest::parse(&bytes)?;
        assert_eq!(legacy.block_count, 2);
        assert_eq!(legacy.paths.get("id-a").map(String::as_str), Some("notes/a.txt"));
        assert_eq!(legacy.categories.get("id-b").map(String::as_str), Some("pictures"));
        Ok(())
    }

    #[test]
    fn test_parse_protocol4_tuple_with_frames() -> Result<()> {
        // pickle.dumps((3, {'k': 'docs/x'}, {'k': 'docs'}), protocol=4)
        let mut bytes = vec![0x80, 0x04, 0x95];
        bytes.extend_from_slice(&0u64.to_le_bytes());
        bytes.extend_from_slice(&[b'K', 3, b'}', 0x94]);
        bytes.extend_from_slice(&[0x8c, 1, b'k', 0x94, 0x8c, 6]);
        bytes.extend_from_slice(b"docs/x");
        bytes.extend_from_slice(&[0x94, b's', b'}', 0x94, b'h', 1, 0x8c, 4]);
        bytes.extend_from_slice(b"docs");
        bytes.extend_from_slice(&[0x94, b's', 0x87, 0x94, b'.']);

        let legacy = LegacyManifest::parse(&bytes)?;
        assert_eq!(legacy.block_count, 3);
        assert_eq!(legacy.paths.get("k").map(String::as_str), Some("docs/x"));
        assert_eq!(legacy.categories.get("k").map(String::as_str), Some("docs"));
        Ok(())
    }

    #[test]
    fn test_parse_protocol0_text() -> Result<()> {
        let bytes = b"(lp0\nI1\na(dp1\nVid\np2\nVdir/f\\u00e9.txt\np3\nsa(dp4\ng2\nVdocs\np5\nsa.";
        let legacy = LegacyManifest::parse(bytes)?;
        assert_eq!(legacy.block_count, 1);
        assert_eq!(legacy.paths.get("id").map(String::as_str), Some("dir/f\u{e9}.txt"));
        assert_eq!(legacy.categories.get("id").map(String::as_str), Some("docs"));
        Ok(())
    }

    #[test]
    fn test_into_manifest_recovers_locations() -> Result<()> {
        let bytes = pickle_triple(1, &[("id-a", "notes/a.txt")], &[("id-a", "docs")]);
        let manifest = LegacyManifest::parse(&bytes)?.into_manifest();
        assert!(manifest.legacy);
        assert_eq!(manifest.expected_blocks(), 1);
        assert_eq!(manifest.find("id-a"), ("docs", "notes/a.txt"));
        assert_eq!(manifest.entry("id-a").map(|e| e.fname.as_str()), Some("a.txt"));
        Ok(())
    }

    #[test]
    fn test_rejects_wrong_shape() {
        // pickle of a bare int
        let bytes = [0x80, 0x02, b'K', 7, b'.'];
        assert!(matches!(
            LegacyManifest::parse(&bytes),
            Err(Error::RecoveryIndex { .. })
        ));
        assert!(LegacyManifest::parse(b"").is_err());

        // a negative block count
        let bytes = pickle_triple_with_count(-1);
        assert!(matches!(
            LegacyManifest::parse(&bytes),
            Err(Error::RecoveryIndex { .. })
        ));
    }

    #[test]
    fn test_parse_python2_byte_strings() -> Result<()> {
        // pickle.dumps([1, {'id': 'a.txt'}, {'id': 'docs'}], protocol=0) under Python 2
        let bytes = b"(lp0\nI1\na(dp1\nS'id'\np2\nS'a.txt'\np3\nsa(dp4\ng2\nS'docs'\np5\nsa.";
        let legacy = LegacyManifest::parse(bytes)?;
        assert_eq!(legacy.paths.get("id").map(String::as_str), Some("a.txt"));
        assert_eq!(legacy.categories.get("id").map(String::as_str), Some("docs"));
        Ok(())
    }
}
