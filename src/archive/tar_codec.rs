//! Tar (ustar) archives with optional bzip2 compression.

use super::ArchiveCodec;
use crate::{Error, Result};
use bzip2::read::BzDecoder;
use bzip2::write::BzEncoder;
use bzip2::Compression;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Seek, SeekFrom, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use tar::{Archive, Builder, EntryType, Header};
use tracing::debug;

/// Two zero records terminate a tar stream
const END_OF_ARCHIVE: u64 = 1024;

/// Tar codec. Members are flat: no directories, no recursion.
#[derive(Debug, Clone, Copy, Default)]
pub struct TarCodec;

impl TarCodec {
    pub fn new() -> Self {
        Self
    }

    /// Open an archive positioned so the next member overwrites the terminator
    fn open_for_append(archive: &Path) -> Result<File> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(archive)?;
        let len = file.metadata()?.len();
        if len >= END_OF_ARCHIVE {
            file.seek(SeekFrom::Start(len - END_OF_ARCHIVE))?;
        } else if len > 0 {
            return Err(Error::archive(format!(
                "{} is not a tar archive ({} bytes)",
                archive.display(),
                len
            )));
        }
        Ok(file)
    }

    fn header(size: u64) -> Header {
        let mut header = Header::new_ustar();
        header.set_entry_type(EntryType::Regular);
        header.set_size(size);
        header.set_mode(0o600);
        let mtime = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        header.set_mtime(mtime);
        header
    }

    /// Append one member. On failure the archive is cut back to where it was.
    fn append<R: io::Read>(archive: &Path, member: &str, size: u64, data: R) -> Result<()> {
        let mut file = Self::open_for_append(archive)?;
        let start = file.stream_position()?;
        let restore_terminator = start > 0;

        let mut counted = CountingReader { inner: data, read: 0 };
        let written = (|| -> Result<()> {
            let mut builder = Builder::new(BufWriter::new(file));
            let mut header = Self::header(size);
            builder.append_data(&mut header, member, &mut counted)?;
            if counted.read != size {
                return Err(Error::archive(format!(
                    "member {} produced {} of {} bytes",
                    member, counted.read, size
                )));
            }
            let mut writer = builder.into_inner()?;
            writer.flush()?;
            Ok(())
        })();

        if let Err(e) = written {
            let mut file = OpenOptions::new().write(true).open(archive)?;
            file.set_len(start)?;
            if restore_terminator {
                file.seek(SeekFrom::Start(start))?;
                file.write_all(&[0u8; END_OF_ARCHIVE as usize])?;
            }
            return Err(e);
        }
        Ok(())
    }
}

struct CountingReader<R> {
    inner: R,
    read: u64,
}

impl<R: io::Read> io::Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.read += n as u64;
        Ok(n)
    }
}

impl ArchiveCodec for TarCodec {
    fn append_file(&self, archive: &Path, member: &str, source: &Path) -> Result<u64> {
        let file = File::open(source)?;
        let size = file.metadata()?.len();
        // A file that changed size since the crawl would corrupt the framing
        let reader = io::Read::take(BufReader::new(file), size);
        Self::append(archive, member, size, reader)?;
        debug!(member, archive = %archive.display(), size, "appended member");
        Ok(size)
    }

    fn append_bytes(&self, archive: &Path, member: &str, data: &[u8]) -> Result<()> {
        Self::append(archive, member, data.len() as u64, data)
    }

    fn list(&self, archive: &Path) -> Result<Vec<String>> {
        let mut tar = Archive::new(BufReader::new(File::open(archive)?));
        let mut names = Vec::new();
        for entry in tar.entries_with_seek()? {
            let entry = entry?;
            names.push(entry.path()?.to_string_lossy().into_owned());
        }
        Ok(names)
    }

    fn extract_to_writer(
        &self,
        archive: &Path,
        member: &str,
        sink: &mut dyn Write,
    ) -> Result<u64> {
        let mut tar = Archive::new(BufReader::new(File::open(archive)?));
        // seeking skips member data instead of reading through it
        for entry in tar.entries_with_seek()? {
            let mut entry = entry?;
            if entry.path()?.to_string_lossy() == member {
                return Ok(io::copy(&mut entry, sink)?);
            }
        }
        Err(Error::archive(format!(
            "member {} not found in {}",
            member,
            archive.display()
        )))
    }

    fn compress(&self, input: &Path, output: &Path, level: u32) -> Result<()> {
        let mut reader = BufReader::new(File::open(input)?);
        let writer = BufWriter::new(File::create(output)?);
        let mut encoder = BzEncoder::new(writer, Compression::new(level.clamp(1, 9)));
        io::copy(&mut reader, &mut encoder)?;
        let mut writer = encoder.finish()?;
        writer.flush()?;
        Ok(())
    }

    fn decompress(&self, input: &Path, output: &Path) -> Result<()> {
        let mut decoder = BzDecoder::new(BufReader::new(File::open(input)?));
        let mut writer = BufWriter::new(File::create(output)?);
        io::copy(&mut decoder, &mut writer)?;
        writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::is_compressed;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_append_and_list_members() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let archive = temp_dir.path().join("block.tar");
        let source = temp_dir.path().join("a.txt");
        fs::write(&source, b"hello world")?;

        let codec = TarCodec::new();
        assert_eq!(codec.append_file(&archive, "id-1", &source)?, 11);
        codec.append_bytes(&archive, "recovery-riff", b"{}")?;
        codec.append_file(&archive, "id-2", &source)?;

        assert_eq!(codec.list(&archive)?, vec!["id-1", "recovery-riff", "id-2"]);
        Ok(())
    }

    #[test]
    fn test_short_member_is_rolled_back() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let archive = temp_dir.path().join("block.tar");
        let codec = TarCodec::new();
        codec.append_bytes(&archive, "id-1", b"kept")?;
        let before = fs::read(&archive)?;

        let result = TarCodec::append(&archive, "id-2", 10, &b"abc"[..]);
        assert!(matches!(result, Err(Error::Archive { .. })));
        assert_eq!(fs::read(&archive)?, before);

        codec.append_bytes(&archive, "recovery-riff", b"{}")?;
        assert_eq!(codec.list(&archive)?, vec!["id-1", "recovery-riff"]);
        Ok(())
    }

    #[test]
    fn test_extract_named_member() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let archive = temp_dir.path().join("block.tar");
        let codec = TarCodec::new();
        codec.append_bytes(&archive, "first", b"one")?;
        codec.append_bytes(&archive, "second", b"two two")?;

        let mut sink = Vec::new();
        assert_eq!(codec.extract_to_writer(&archive, "second", &mut sink)?, 7);
        assert_eq!(sink, b"two two");

        let dest = temp_dir.path().join("out").join("nested").join("first.txt");
        codec.extract_to_path(&archive, "first", &dest)?;
        assert_eq!(fs::read(&dest)?, b"one");

        let missing = codec.extract_to_writer(&archive, "third", &mut Vec::new());
        assert!(matches!(missing, Err(Error::Archive { .. })));
        Ok(())
    }

    #[test]
    fn test_compress_roundtrip_and_magic() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let archive = temp_dir.path().join("block.tar");
        let packed = temp_dir.path().join("block.tar.bz2");
        let unpacked = temp_dir.path().join("block.out.tar");
        let codec = TarCodec::new();
        codec.append_bytes(&archive, "member", &vec![7u8; 10_000])?;

        assert!(!is_compressed(&archive)?);
        codec.compress(&archive, &packed, 9)?;
        assert!(is_compressed(&packed)?);

        codec.decompress(&packed, &unpacked)?;
        assert_eq!(fs::read(&archive)?, fs::read(&unpacked)?);
        assert_eq!(codec.list(&unpacked)?, vec!["member"]);
        Ok(())
    }

    #[test]
    fn test_append_rejects_non_archive() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let archive = temp_dir.path().join("junk.tar");
        fs::write(&archive, b"junk")?;
        let result = TarCodec::new().append_bytes(&archive, "m", b"x");
        assert!(matches!(result, Err(Error::Archive { .. })));
        Ok(())
    }
}
