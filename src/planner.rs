//! Crawl the category roots, hash every eligible file and pack the records
//! into blocks, largest first.

use crate::block::{Block, FileRecord, PutOutcome};
use crate::config::RunContext;
use crate::events::{Diagnostic, ReportHandle, Stage};
use crate::hashing::sha256_file;
use crate::manifest::{IndexEntry, ManifestView, MetaBlock, MetaRun, RecordDate};
use crate::{Error, Result};
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info, span, Level};
use walkdir::WalkDir;

/// A file the crawl could not take
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedFile {
    pub path: PathBuf,
    pub size: u64,
    pub reason: String,
}

/// Output of the plan stage
#[derive(Debug)]
pub struct Plan {
    pub blocks: Vec<Block>,
    /// One entry per block, same order as `blocks`
    pub meta_blocks: Vec<MetaBlock>,
    pub meta_run: MetaRun,
    /// Complete index of the run, shared by every block's manifest
    pub index: BTreeMap<String, IndexEntry>,
    pub skipped: Vec<SkippedFile>,
}

impl Plan {
    /// Manifest of the block at `position`
    pub fn manifest(&self, position: usize) -> Option<ManifestView<'_>> {
        Some(ManifestView {
            meta_block: self.meta_blocks.get(position)?,
            meta_run: &self.meta_run,
            index: &self.index,
        })
    }

    pub fn file_count(&self) -> usize {
        self.index.len()
    }

    /// Drop records whose bytes never reached their archive, shrinking the
    /// index, the block metadata and the run totals to match.
    pub fn drop_files(&mut self, ids: &BTreeSet<String>) -> Vec<FileRecord> {
        let mut dropped = Vec::new();
        for (block, meta) in self.blocks.iter_mut().zip(self.meta_blocks.iter_mut()) {
            for id in ids {
                if let Some(record) = block.remove(id) {
                    self.index.remove(id);
                    dropped.push(record);
                }
            }
            meta.size_large = block.used();
            meta.count_files = block.len() as u64;
        }
        self.meta_run.size_extra_large = self.blocks.iter().map(Block::used).sum();
        self.meta_run.count_files_sum = self.index.len() as u64;
        dropped
    }
}

/// Crawl, sort and pack. Runs on the calling thread.
pub fn plan(ctx: &RunContext, reporter: &ReportHandle) -> Result<Plan> {
    let span = span!(Level::INFO, "plan", run = %ctx.run_label());
    let _enter = span.enter();
    reporter.stage_started(Stage::Plan, 1);

    let config = ctx.config();
    let capacity = config.block_size;
    let mut skipped = Vec::new();
    let mut records = Vec::new();

    for (category, root) in config.run_categories() {
        crawl_category(category, root, capacity, reporter, &mut records, &mut skipped);
    }
    info!("Crawl found {} eligible files", records.len());

    sort_largest_first(&mut records);
    let (blocks, unplaced) = pack(records, &ctx.run_label(), capacity);
    for record in unplaced {
        let error = Error::FileTooLarge {
            path: record.source_path.clone(),
            size: record.size,
            capacity,
        };
        reporter.emit(
            Diagnostic::warn(Stage::Plan, error.to_string())
                .subject(record.source_path.display().to_string()),
        );
        skipped.push(SkippedFile {
            path: record.source_path,
            size: record.size,
            reason: error.to_string(),
        });
    }

    let mut index = BTreeMap::new();
    let mut meta_blocks = Vec::with_capacity(blocks.len());
    for block in &blocks {
        meta_blocks.push(MetaBlock {
            num_block: block.ordinal(),
            size_large: block.used(),
            count_files: block.len() as u64,
        });
        for record in block.files() {
            index.insert(
                record.id.clone(),
                IndexEntry {
                    fname: record.file_name.clone(),
                    sha256: record.sha256.clone(),
                    category: record.category.clone(),
                    fpath: record.relative_path.clone(),
                    fsize: record.size,
                },
            );
        }
    }

    let meta_run = MetaRun {
        sum_block: blocks.len() as u32,
        size_extra_large: blocks.iter().map(Block::used).sum(),
        count_files_sum: index.len() as u64,
        date_rec: RecordDate::from_date(ctx.run_date()),
        comment: config.comment.clone(),
    };

    info!(
        "Planned {} blocks holding {} files ({} bytes)",
        meta_run.sum_block, meta_run.count_files_sum, meta_run.size_extra_large
    );
    reporter.task_done(Stage::Plan);
    Ok(Plan {
        blocks,
        meta_blocks,
        meta_run,
        index,
        skipped,
    })
}

fn crawl_category(
    category: &str,
    root: &Path,
    capacity: u64,
    reporter: &ReportHandle,
    records: &mut Vec<FileRecord>,
    skipped: &mut Vec<SkippedFile>,
) {
    if !root.is_dir() {
        reporter.emit(
            Diagnostic::warn(
                Stage::Plan,
                format!("category '{}' root is not a directory", category),
            )
            .subject(root.display().to_string()),
        );
        return;
    }
    debug!("Crawling {} at {}", category, root.display());

    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                reporter.emit(Diagnostic::warn(Stage::Plan, format!("walk error: {}", e)));
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let size = match entry.metadata() {
            Ok(meta) => meta.len(),
            Err(e) => {
                reporter.emit(
                    Diagnostic::warn(Stage::Plan, format!("cannot stat: {}", e))
                        .subject(path.display().to_string()),
                );
                continue;
            }
        };

        if size > capacity {
            let error = Error::FileTooLarge {
                path: path.to_path_buf(),
                size,
                capacity,
            };
            reporter.emit(
                Diagnostic::warn(Stage::Plan, error.to_string())
                    .subject(path.display().to_string()),
            );
            skipped.push(SkippedFile {
                path: path.to_path_buf(),
                size,
                reason: error.to_string(),
            });
            continue;
        }

        let Some(relative_path) = relative_key(root, path) else {
            continue;
        };
        let sha256 = match sha256_file(path) {
            Ok(digest) => digest,
            Err(e) => {
                reporter.emit(
                    Diagnostic::error(Stage::Plan, format!("cannot hash: {}", e))
                        .subject(path.display().to_string()),
                );
                skipped.push(SkippedFile {
                    path: path.to_path_buf(),
                    size,
                    reason: e.to_string(),
                });
                continue;
            }
        };

        records.push(FileRecord::new(
            entry.file_name().to_string_lossy().into_owned(),
            category.to_string(),
            relative_path,
            path.to_path_buf(),
            size,
            sha256,
        ));
    }
}

/// `/`-joined path of `path` below `root`
fn relative_key(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// Descending size; ties keep a stable, path-ordered position
pub fn sort_largest_first(records: &mut [FileRecord]) {
    records.sort_by(|a, b| {
        Reverse(a.size)
            .cmp(&Reverse(b.size))
            .then_with(|| a.category.cmp(&b.category))
            .then_with(|| a.relative_path.cmp(&b.relative_path))
    });
}

/// First-fit-decreasing over `records`, which must already be sorted.
///
/// Returns the sealed blocks and any record no empty block would take.
pub fn pack(records: Vec<FileRecord>, run_label: &str, capacity: u64) -> (Vec<Block>, Vec<FileRecord>) {
    let smallest = records.iter().map(|r| r.size).min().unwrap_or(0);
    let mut pending = records;
    let mut blocks = Vec::new();
    let mut ordinal = 1u32;

    while !pending.is_empty() {
        let mut block = Block::new(run_label, ordinal, capacity, smallest);
        let mut rest = Vec::with_capacity(pending.len());
        for record in pending {
            match block.put(record) {
                PutOutcome::Placed => {}
                PutOutcome::TooLarge(record) | PutOutcome::Full(record) => rest.push(record),
            }
        }

        if block.is_empty() {
            return (blocks, rest);
        }
        block.seal();
        debug!(
            "Sealed {} with {} files, {} of {} bytes",
            block.name(),
            block.len(),
            block.used(),
            capacity
        );
        blocks.push(block);
        pending = rest;
        ordinal += 1;
    }
    (blocks, Vec::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::events::Reporter;
    use chrono::NaiveDate;
    use pretty_assertions::assert_eq;
    use std::fs;
    use tempfile::TempDir;

    fn record(name: &str, size: u64) -> FileRecord {
        FileRecord::new(
            name.to_string(),
            "docs".to_string(),
            name.to_string(),
            PathBuf::from("/src").join(name),
            size,
            String::new(),
        )
    }

    fn names(block: &Block) -> Vec<String> {
        let mut names: Vec<String> = block.files().map(|r| r.file_name.clone()).collect();
        names.sort();
        names
    }

    #[test]
    fn test_first_fit_decreasing() {
        let mut records = vec![
            record("c400", 400),
            record("a600", 600),
            record("d300", 300),
            record("b500", 500),
        ];
        sort_largest_first(&mut records);
        let (blocks, unplaced) = pack(records, "h1-2024-01-02", 1000);

        assert!(unplaced.is_empty());
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].name(), "h1-2024-01-02-1");
        assert_eq!(names(&blocks[0]), vec!["a600", "d300"]);
        assert_eq!(blocks[0].used(), 900);
        assert_eq!(blocks[1].name(), "h1-2024-01-02-2");
        assert_eq!(names(&blocks[1]), vec!["b500", "c400"]);
        assert_eq!(blocks[1].used(), 900);
    }

    #[test]
    fn test_pack_respects_capacity() {
        let mut records: Vec<FileRecord> = (1..=40)
            .map(|n| record(&format!("f{:02}", n), (n * 37) % 250 + 1))
            .collect();
        sort_largest_first(&mut records);
        let (blocks, unplaced) = pack(records, "h", 512);
        assert!(unplaced.is_empty());
        let placed: usize = blocks.iter().map(Block::len).sum();
        assert_eq!(placed, 40);
        for block in &blocks {
            assert!(block.used() <= block.capacity());
        }
    }

    #[test]
    fn test_exact_fit_opens_a_new_block() {
        // a non-empty block never takes a file that would fill it exactly
        let mut records: Vec<FileRecord> = ["a", "b", "c", "d"]
            .iter()
            .map(|name| record(name, 500))
            .collect();
        sort_largest_first(&mut records);
        let (blocks, unplaced) = pack(records, "h", 1000);

        assert!(unplaced.is_empty());
        assert_eq!(blocks.len(), 4);
        let used: Vec<u64> = blocks.iter().map(Block::used).collect();
        assert_eq!(used, vec![500, 500, 500, 500]);

        let mut records = vec![record("a", 500), record("b", 499)];
        sort_largest_first(&mut records);
        let (blocks, _) = pack(records, "h", 1000);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].used(), 999);
    }

    #[test]
    fn test_drop_files_shrinks_index_and_totals() {
        let mut records = vec![record("a600", 600), record("b300", 300), record("c500", 500)];
        sort_largest_first(&mut records);
        let (blocks, _) = pack(records, "h", 1000);
        let mut index = BTreeMap::new();
        let mut meta_blocks = Vec::new();
        for block in &blocks {
            meta_blocks.push(MetaBlock {
                num_block: block.ordinal(),
                size_large: block.used(),
                count_files: block.len() as u64,
            });
            for record in block.files() {
                index.insert(
                    record.id.clone(),
                    IndexEntry {
                        fname: record.file_name.clone(),
                        category: record.category.clone(),
                        fpath: record.relative_path.clone(),
                        fsize: record.size,
                        ..IndexEntry::default()
                    },
                );
            }
        }
        let mut plan = Plan {
            meta_run: MetaRun {
                sum_block: blocks.len() as u32,
                size_extra_large: 1400,
                count_files_sum: 3,
                ..MetaRun::default()
            },
            blocks,
            meta_blocks,
            index,
            skipped: Vec::new(),
        };
        let b300 = plan.blocks[0]
            .files()
            .find(|r| r.file_name == "b300")
            .map(|r| r.id.clone())
            .unwrap();

        let dropped = plan.drop_files(&BTreeSet::from([b300.clone()]));
        assert_eq!(dropped.len(), 1);
        assert!(!plan.index.contains_key(&b300));
        assert_eq!(plan.meta_blocks[0].count_files, 1);
        assert_eq!(plan.meta_blocks[0].size_large, 600);
        assert_eq!(plan.meta_run.count_files_sum, 2);
        assert_eq!(plan.meta_run.size_extra_large, 1100);
        assert_eq!(plan.meta_run.sum_block, 2);
    }

    #[test]
    fn test_pack_empty() {
        let (blocks, unplaced) = pack(Vec::new(), "h", 10);
        assert!(blocks.is_empty());
        assert!(unplaced.is_empty());
    }

    #[test]
    fn test_plan_crawls_and_builds_index() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let src = temp_dir.path().join("src");
        fs::create_dir_all(src.join("nested/deeper"))?;
        fs::write(src.join("a.txt"), b"hello")?;
        fs::write(src.join("nested/deeper/b.bin"), vec![1u8; 64])?;
        fs::write(src.join("huge.bin"), vec![0u8; 2048])?;

        let mut config = Config {
            active_key: "AAAA".to_string(),
            sign: false,
            host: "h1".to_string(),
            block_size: 1024,
            comment: "nightly".to_string(),
            ..Config::default()
        };
        config.categories.clear();
        config.categories.insert("docs".to_string(), src.clone());
        let date = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        let ctx = RunContext::new(config)?.with_date(date);

        let reporter = Reporter::spawn(None)?;
        let plan = plan(&ctx, &reporter.handle())?;
        let summary = reporter.finish();

        assert_eq!(plan.blocks.len(), 1);
        assert_eq!(plan.meta_run.sum_block, 1);
        assert_eq!(plan.meta_run.count_files_sum, 2);
        assert_eq!(plan.meta_run.size_extra_large, 69);
        assert_eq!(plan.meta_run.date_rec, RecordDate::Iso("2024-01-02".to_string()));
        assert_eq!(plan.meta_run.comment, "nightly");

        let mut paths: Vec<&str> = plan.index.values().map(|e| e.fpath.as_str()).collect();
        paths.sort();
        assert_eq!(paths, vec!["a.txt", "nested/deeper/b.bin"]);
        let a = plan.index.values().find(|e| e.fname == "a.txt").unwrap();
        assert_eq!(
            a.sha256,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );

        assert_eq!(plan.skipped.len(), 1);
        assert_eq!(plan.skipped[0].path, src.join("huge.bin"));
        assert!(summary
            .diagnostics
            .iter()
            .any(|d| d.subject.as_deref() == Some(src.join("huge.bin").to_str().unwrap())));
        Ok(())
    }
}
