//! Fixed-capacity blocks and the file records packed into them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use uuid::Uuid;

/// One backed-up file, as discovered by the crawl
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Freshly minted identifier; the file's name inside the archive
    pub id: String,
    /// Original base filename
    pub file_name: String,
    /// Category label of the root the file came from
    pub category: String,
    /// Path relative to the category root, `/`-separated
    pub relative_path: String,
    /// Absolute path the bytes are read from
    pub source_path: PathBuf,
    /// Size in bytes
    pub size: u64,
    /// SHA-256 of the contents, hex
    pub sha256: String,
}

impl FileRecord {
    /// Build a record with a new unique id
    pub fn new(
        file_name: String,
        category: String,
        relative_path: String,
        source_path: PathBuf,
        size: u64,
        sha256: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            file_name,
            category,
            relative_path,
            source_path,
            size,
            sha256,
        }
    }
}

/// Result of offering a record to a block. Rejections hand the record back.
#[derive(Debug)]
pub enum PutOutcome {
    Placed,
    /// Does not fit in the remaining space; a smaller file still might
    TooLarge(FileRecord),
    /// The block has sealed itself
    Full(FileRecord),
}

/// A bounded container of file records
#[derive(Debug, Clone)]
pub struct Block {
    name: String,
    ordinal: u32,
    capacity: u64,
    used: u64,
    smallest: u64,
    full: bool,
    files: BTreeMap<String, FileRecord>,
}

impl Block {
    /// Open an empty block. `smallest` is the smallest file size the planner saw.
    pub fn new(run_label: &str, ordinal: u32, capacity: u64, smallest: u64) -> Self {
        Self {
            name: format!("{}-{}", run_label, ordinal),
            ordinal,
            capacity,
            used: 0,
            smallest,
            full: false,
            files: BTreeMap::new(),
        }
    }

    /// Offer a record to the block.
    ///
    /// A non-empty block only accepts a file that leaves headroom (strictly
    /// smaller than the remaining space); an empty block accepts anything up
    /// to its capacity. Once full, every offer is rejected.
    pub fn put(&mut self, record: FileRecord) -> PutOutcome {
        if self.full {
            return PutOutcome::Full(record);
        }

        let remaining = self.remaining();
        if remaining < self.smallest {
            self.full = true;
            return PutOutcome::Full(record);
        }

        let fits = if self.files.is_empty() {
            record.size <= remaining
        } else {
            record.size < remaining
        };
        if !fits {
            return PutOutcome::TooLarge(record);
        }

        self.used += record.size;
        self.smallest = self.smallest.min(record.size);
        self.files.insert(record.id.clone(), record);
        PutOutcome::Placed
    }

    /// Stop accepting files
    pub fn seal(&mut self) {
        self.full = true;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ordinal(&self) -> u32 {
        self.ordinal
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn used(&self) -> u64 {
        self.used
    }

    pub fn remaining(&self) -> u64 {
        self.capacity - self.used
    }

    pub fn is_full(&self) -> bool {
        self.full
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Records in id order
    pub fn files(&self) -> impl Iterator<Item = &FileRecord> {
        self.files.values()
    }

    pub fn get(&self, id: &str) -> Option<&FileRecord> {
        self.files.get(id)
    }

    /// Take a record back out, releasing its space. The block stays sealed.
    pub fn remove(&mut self, id: &str) -> Option<FileRecord> {
        let record = self.files.remove(id)?;
        self.used -= record.size;
        Some(record)
    }
}
