//! Archive codec: tar members named by file id, and bzip2 stream compression.
//!
//! The codec is a capability set injected into the pipeline so that tests or
//! alternative formats can stand in for [`TarCodec`].

pub mod tar_codec;

pub use tar_codec::TarCodec;

use crate::Result;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

/// Leading bytes of a bzip2 stream
pub const BZIP2_MAGIC: &[u8; 3] = b"BZh";

/// Operations the pipeline needs from an archive format
pub trait ArchiveCodec: Send + Sync {
    /// Append the file at `source` as a member named `member`. Returns bytes written.
    fn append_file(&self, archive: &Path, member: &str, source: &Path) -> Result<u64>;

    /// Append an in-memory member
    fn append_bytes(&self, archive: &Path, member: &str, data: &[u8]) -> Result<()>;

    /// Member names in archive order
    fn list(&self, archive: &Path) -> Result<Vec<String>>;

    /// Stream one member into `sink`. Returns bytes written.
    fn extract_to_writer(&self, archive: &Path, member: &str, sink: &mut dyn Write)
        -> Result<u64>;

    /// Extract one member to a filesystem path, replacing any existing file
    fn extract_to_path(&self, archive: &Path, member: &str, dest: &Path) -> Result<u64> {
        let parent = dest.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent)?;
        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        let written = self.extract_to_writer(archive, member, tmp.as_file_mut())?;
        tmp.as_file_mut().flush()?;
        tmp.persist(dest).map_err(|e| e.error)?;
        Ok(written)
    }

    /// Stream-compress `input` into `output`
    fn compress(&self, input: &Path, output: &Path, level: u32) -> Result<()>;

    /// Inverse of [`ArchiveCodec::compress`]
    fn decompress(&self, input: &Path, output: &Path) -> Result<()>;
}

/// Whether a payload starts with the bzip2 magic
pub fn has_compression_magic(header: &[u8]) -> bool {
    header.len() >= BZIP2_MAGIC.len() && &header[..BZIP2_MAGIC.len()] == BZIP2_MAGIC
}

/// Peek at the first bytes of a file to tell compressed from plain payloads
pub fn is_compressed(path: &Path) -> Result<bool> {
    let mut file = File::open(path)?;
    let mut header = [0u8; 3];
    let mut filled = 0;
    while filled < header.len() {
        let n = file.read(&mut header[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(has_compression_magic(&header[..filled]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_magic_detection() {
        assert!(has_compression_magic(b"BZh91AY&SY"));
        assert!(!has_compression_magic(b"BZ"));
        assert!(!has_compression_magic(b"ustar"));
    }

    #[test]
    fn test_is_compressed_short_file() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("short");
        std::fs::write(&path, b"B")?;
        assert!(!is_compressed(&path)?);
        Ok(())
    }
}
