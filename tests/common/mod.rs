#![allow(dead_code)]

use chrono::NaiveDate;
use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tapestry::config::{Backend, Config, RunContext};
use tapestry::crypto::LocalKeyring;
use tapestry::hashing::sha256_file;
use tapestry::operator::Operator;
use tapestry::Engine;
use tempfile::TempDir;
use walkdir::WalkDir;

pub const HOST: &str = "h1";

pub fn run_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, 2).expect("valid date")
}

/// A temp directory with source trees, a keyring holding an encryption key
/// and a signing key, and helpers to build engines over them.
pub struct Fixture {
    pub temp: TempDir,
    pub keyring: LocalKeyring,
    pub active: String,
    pub signer: String,
}

impl Fixture {
    pub fn new() -> Self {
        let temp = TempDir::new().expect("temp dir");
        let keyring = LocalKeyring::new();
        let active = keyring.generate("backup <backup@h1>").expect("active key");
        let signer = keyring.generate("signer <signer@h1>").expect("signing key");
        Self {
            temp,
            keyring,
            active,
            signer,
        }
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.temp.path().join(rel)
    }

    /// Write `contents` to `rel` under the fixture root
    pub fn write(&self, rel: &str, contents: &[u8]) -> PathBuf {
        let path = self.path(rel);
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(&path, contents).expect("write");
        path
    }

    /// Backup configuration: `docs` and `media` under `src/`
    pub fn backup_config(&self, block_size: u64) -> Config {
        let mut categories = BTreeMap::new();
        categories.insert("docs".to_string(), self.path("src/docs"));
        categories.insert("media".to_string(), self.path("src/media"));
        Config {
            active_key: self.active.clone(),
            signing_key: self.signer.clone(),
            sign: true,
            block_size,
            host: HOST.to_string(),
            validate: true,
            compress: true,
            compression_level: 6,
            include_additional: false,
            workspace: self.path("work"),
            drop_dir: self.path("drop"),
            recovery_dir: self.path("drop"),
            workers: 4,
            non_interactive: true,
            backend: Backend::Local,
            keystore: None,
            trust_store: None,
            comment: "nightly".to_string(),
            categories,
            additional_categories: BTreeMap::new(),
        }
    }

    /// Restore configuration: same categories rooted under `out/`
    pub fn restore_config(&self) -> Config {
        let mut config = self.backup_config(1024);
        config.categories = BTreeMap::from([
            ("docs".to_string(), self.path("out/docs")),
            ("media".to_string(), self.path("out/media")),
        ]);
        config.workspace = self.path("rwork");
        config.drop_dir = self.path("rdrop");
        config
    }

    pub fn engine(&self, config: Config) -> Engine {
        let ctx = RunContext::new(config)
            .expect("valid config")
            .with_date(run_date());
        Engine::new(ctx, Box::new(self.keyring.clone()))
    }
}

/// Relative path -> SHA-256 of every file under `root`
pub fn tree_digest(root: &Path) -> BTreeMap<String, String> {
    WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| {
            let rel = e
                .path()
                .strip_prefix(root)
                .expect("under root")
                .to_string_lossy()
                .replace('\\', "/");
            (rel, sha256_file(e.path()).expect("hash"))
        })
        .collect()
}

/// Operator with canned answers
pub struct ScriptedOperator {
    approve: bool,
    media: Mutex<VecDeque<PathBuf>>,
    pub asked_signers: Mutex<Vec<String>>,
    pub media_requests: Mutex<Vec<Vec<u32>>>,
}

impl ScriptedOperator {
    pub fn new(approve: bool, media: Vec<PathBuf>) -> Self {
        Self {
            approve,
            media: Mutex::new(media.into()),
            asked_signers: Mutex::new(Vec::new()),
            media_requests: Mutex::new(Vec::new()),
        }
    }
}

impl Operator for ScriptedOperator {
    fn approve_signer(&self, fingerprint: &str, _signer: Option<&str>) -> bool {
        self.asked_signers
            .lock()
            .expect("lock")
            .push(fingerprint.to_string());
        self.approve
    }

    fn request_media(&self, missing: &[u32]) -> Option<PathBuf> {
        self.media_requests
            .lock()
            .expect("lock")
            .push(missing.to_vec());
        self.media.lock().expect("lock").pop_front()
    }
}

/// Protocol-2 pickle of `[count, {id: path}, {id: category}]`
pub fn pickle_triple(count: u8, paths: &[(&str, &str)], categories: &[(&str, &str)]) -> Vec<u8> {
    fn string(out: &mut Vec<u8>, s: &str) {
        out.push(b'X');
        out.extend_from_slice(&(s.len() as u32).to_le_bytes());
        out.extend_from_slice(s.as_bytes());
    }

    let mut out = vec![0x80, 0x02, b'(', b'K', count];
    for map in [paths, categories] {
        out.push(b'}');
        for (k, v) in map {
            string(&mut out, k);
            string(&mut out, v);
            out.push(b's');
        }
    }
    out.extend_from_slice(b"l.");
    out
}
