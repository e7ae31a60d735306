//! Streaming SHA-256 helpers.

use crate::Result;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

/// Read buffer size for hashing
pub const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// Hash everything `reader` yields, in fixed-size buffered reads.
pub fn sha256_reader<R: Read>(mut reader: R) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];
    loop {
        let n = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        hasher.update(&buffer[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Compute the SHA-256 hex digest of a file
pub fn sha256_file<P: AsRef<Path>>(path: P) -> Result<String> {
    sha256_reader(File::open(path)?)
}

/// Write adapter that hashes and counts bytes on their way to `inner`.
pub struct HashingWriter<W: Write> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    /// Bytes seen so far
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Return the inner writer and the hex digest
    pub fn finish(self) -> (W, String) {
        (self.inner, hex::encode(self.hasher.finalize()))
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const HELLO_WORLD: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    #[test]
    fn test_sha256_reader_known_vector() -> Result<()> {
        assert_eq!(sha256_reader(&b"hello world"[..])?, HELLO_WORLD);
        Ok(())
    }

    #[test]
    fn test_sha256_file_spans_buffers() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("big.bin");
        let data: Vec<u8> = (0..HASH_BUFFER_SIZE * 3 + 17).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &data)?;

        let expected = hex::encode(Sha256::digest(&data));
        assert_eq!(sha256_file(&path)?, expected);
        Ok(())
    }

    #[test]
    fn test_hashing_writer_passes_bytes_through() -> Result<()> {
        let mut writer = HashingWriter::new(Vec::new());
        writer.write_all(b"hello ")?;
        writer.write_all(b"world")?;
        assert_eq!(writer.written(), 11);

        let (inner, digest) = writer.finish();
        assert_eq!(inner, b"hello world");
        assert_eq!(digest, HELLO_WORLD);
        Ok(())
    }
}
