//! Checks on relative paths read from a recovery manifest.
//!
//! Manifests arrive on untrusted media, so a stored path must never resolve
//! outside the category root it is restored under.

use crate::{Error, Result};
use std::path::{Component, Path, PathBuf};

/// Turn a manifest `fpath` into a relative path, refusing anything absolute
/// or containing `..`.
pub fn validate_relative(rel: &str) -> Result<PathBuf> {
    let unsafe_path = |reason: &str| Error::UnsafePath {
        path: rel.to_string(),
        reason: reason.to_string(),
    };
    if rel.is_empty() {
        return Err(unsafe_path("empty path"));
    }
    // manifests always use '/', whatever host wrote them
    let candidate = Path::new(rel);
    if candidate.is_absolute() || rel.starts_with('/') || rel.starts_with('\\') {
        return Err(unsafe_path("absolute paths are not allowed"));
    }
    let mut out = PathBuf::new();
    for comp in candidate.components() {
        match comp {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir => return Err(unsafe_path("parent traversal not allowed")),
            Component::RootDir | Component::Prefix(_) => {
                return Err(unsafe_path("absolute paths are not allowed"))
            }
        }
    }
    if out.as_os_str().is_empty() {
        return Err(unsafe_path("path names no file"));
    }
    Ok(out)
}

/// Join a validated relative path under `root`, refusing symlinked ancestors
pub fn resolve_under(root: &Path, rel: &str) -> Result<PathBuf> {
    let rel = validate_relative(rel)?;
    let mut cur = root.to_path_buf();
    for comp in rel.components() {
        cur.push(comp);
        if let Ok(meta) = std::fs::symlink_metadata(&cur) {
            if meta.file_type().is_symlink() {
                return Err(Error::UnsafePath {
                    path: cur.display().to_string(),
                    reason: "symlink in path (not following)".to_string(),
                });
            }
        }
    }
    Ok(cur)
}
