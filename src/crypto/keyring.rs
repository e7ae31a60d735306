//! Self-contained keyring persisted as JSON.
//!
//! Messages are XChaCha20-Poly1305 STREAM envelopes bound to the recipient
//! fingerprint: the plaintext is sealed in fixed-size segments, so neither
//! direction holds more than one segment in memory. Signatures are keyed
//! BLAKE3 MACs. Both are written as armored text so `.tap` and `.sig` files
//! look the same whichever backend made them.

use super::{normalize_fingerprint, CryptoProvider, DecryptOutcome, SignatureCheck};
use crate::{Error, Result};
use chacha20poly1305::aead::generic_array::GenericArray;
use chacha20poly1305::aead::stream::{DecryptorBE32, EncryptorBE32};
use chacha20poly1305::aead::{KeyInit, Payload};
use chacha20poly1305::{Key, XChaCha20Poly1305};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{debug, info};
use zeroize::Zeroizing;

/// XChaCha20 nonce less the 5 bytes STREAM keeps for its counter and flag
const STREAM_NONCE_LEN: usize = 19;
/// Plaintext bytes per sealed segment
const SEGMENT: usize = 64 * 1024;
const TAG_LEN: usize = 16;
const FINGERPRINT_LEN: usize = 20;
const ARMOR_LINE: usize = 64;
/// Longest armor line accepted while parsing
const MAX_LINE: u64 = 4096;
/// Largest signature file read
const MAX_SIGNATURE: u64 = 64 * 1024;

const MESSAGE_BEGIN: &str = "-----BEGIN TAPESTRY MESSAGE-----";
const MESSAGE_END: &str = "-----END TAPESTRY MESSAGE-----";
const SIGNATURE_BEGIN: &str = "-----BEGIN TAPESTRY SIGNATURE-----";
const SIGNATURE_END: &str = "-----END TAPESTRY SIGNATURE-----";

struct KeyMaterial {
    uid: String,
    secret: Zeroizing<[u8; 32]>,
}

#[derive(Serialize, Deserialize)]
struct StoredKey {
    uid: String,
    secret: String,
}

/// A keyring held in memory and optionally backed by a JSON file
#[derive(Clone, Default)]
pub struct LocalKeyring {
    path: Option<PathBuf>,
    keys: Arc<RwLock<BTreeMap<String, KeyMaterial>>>,
}

impl std::fmt::Debug for LocalKeyring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.keys.read().map(|k| k.len()).unwrap_or(0);
        f.debug_struct("LocalKeyring")
            .field("path", &self.path)
            .field("keys", &count)
            .finish()
    }
}

impl LocalKeyring {
    /// Empty in-memory keyring
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from `path`; a missing file yields an empty keyring bound to it
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut keys = BTreeMap::new();
        if path.exists() {
            let stored: BTreeMap<String, StoredKey> =
                serde_json::from_str(&fs::read_to_string(path)?)?;
            for (fingerprint, key) in stored {
                let bytes = Zeroizing::new(hex::decode(&key.secret).map_err(|e| {
                    Error::crypto(format!("keyring entry {} is not hex: {}", fingerprint, e))
                })?);
                let secret: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
                    Error::crypto(format!("keyring entry {} has a bad key length", fingerprint))
                })?;
                keys.insert(
                    normalize_fingerprint(&fingerprint),
                    KeyMaterial {
                        uid: key.uid,
                        secret: Zeroizing::new(secret),
                    },
                );
            }
            debug!("Loaded {} keys from {}", keys.len(), path.display());
        }
        Ok(Self {
            path: Some(path.to_path_buf()),
            keys: Arc::new(RwLock::new(keys)),
        })
    }

    /// Write the keyring back to its file
    pub fn save(&self) -> Result<()> {
        let path = self
            .path
            .as_ref()
            .ok_or_else(|| Error::crypto("keyring has no backing file"))?;
        let keys = self.read_keys()?;
        let stored: BTreeMap<&String, StoredKey> = keys
            .iter()
            .map(|(fp, key)| {
                (
                    fp,
                    StoredKey {
                        uid: key.uid.clone(),
                        secret: hex::encode(key.secret.as_slice()),
                    },
                )
            })
            .collect();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(tmp.as_file_mut(), &stored)?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }

    /// Create a key for `uid` and return its fingerprint
    pub fn generate(&self, uid: &str) -> Result<String> {
        let mut secret = Zeroizing::new([0u8; 32]);
        getrandom::getrandom(secret.as_mut_slice())
            .map_err(|e| Error::crypto(format!("no randomness available: {}", e)))?;
        let digest = blake3::hash(secret.as_slice());
        let fingerprint = hex::encode_upper(&digest.as_bytes()[..FINGERPRINT_LEN]);
        self.write_keys()?.insert(
            fingerprint.clone(),
            KeyMaterial {
                uid: uid.to_string(),
                secret,
            },
        );
        info!("Generated key {} for {}", fingerprint, uid);
        Ok(fingerprint)
    }

    /// Fingerprints held, sorted
    pub fn fingerprints(&self) -> Result<Vec<String>> {
        Ok(self.read_keys()?.keys().cloned().collect())
    }

    fn read_keys(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, BTreeMap<String, KeyMaterial>>> {
        self.keys
            .read()
            .map_err(|_| Error::crypto("keyring lock poisoned"))
    }

    fn write_keys(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, BTreeMap<String, KeyMaterial>>> {
        self.keys
            .write()
            .map_err(|_| Error::crypto("keyring lock poisoned"))
    }

    fn cipher(&self, fingerprint: &str) -> Result<Option<XChaCha20Poly1305>> {
        let keys = self.read_keys()?;
        Ok(keys
            .get(fingerprint)
            .map(|k| XChaCha20Poly1305::new(Key::from_slice(k.secret.as_slice()))))
    }

    fn mac(
        &self,
        fingerprint: &str,
        data: &mut dyn Read,
    ) -> Result<Option<(blake3::Hash, String)>> {
        let (secret, uid) = {
            let keys = self.read_keys()?;
            match keys.get(fingerprint) {
                Some(key) => (key.secret.clone(), key.uid.clone()),
                None => return Ok(None),
            }
        };
        let mut hasher = blake3::Hasher::new_keyed(&secret);
        io::copy(data, &mut hasher)?;
        Ok(Some((hasher.finalize(), uid)))
    }
}

fn write_armor_header(
    output: &mut dyn Write,
    begin: &str,
    headers: &[(&str, &str)],
) -> Result<()> {
    writeln!(output, "{}", begin)?;
    for (name, value) in headers {
        writeln!(output, "{}: {}", name, value)?;
    }
    writeln!(output)?;
    Ok(())
}

/// Hex-encodes everything written to it as fixed-width armor lines
struct ArmorBodyWriter<'a> {
    out: &'a mut dyn Write,
    column: usize,
}

impl<'a> ArmorBodyWriter<'a> {
    fn new(out: &'a mut dyn Write) -> Self {
        Self { out, column: 0 }
    }

    /// Terminate the last body line and write the closing marker
    fn finish(self, end: &str) -> Result<()> {
        if self.column > 0 {
            writeln!(self.out)?;
        }
        writeln!(self.out, "{}", end)?;
        Ok(())
    }
}

impl Write for ArmorBodyWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let encoded = hex::encode(buf);
        let mut rest = encoded.as_bytes();
        while !rest.is_empty() {
            if self.column == ARMOR_LINE {
                self.out.write_all(b"\n")?;
                self.column = 0;
            }
            let take = (ARMOR_LINE - self.column).min(rest.len());
            self.out.write_all(&rest[..take])?;
            self.column += take;
            rest = &rest[take..];
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}

fn read_line_bounded<R: BufRead>(reader: &mut R, line: &mut String) -> io::Result<usize> {
    line.clear();
    reader.take(MAX_LINE).read_line(line)
}

/// Read the opening marker and the header block up to the blank line.
/// `None` when the input does not start with `begin`.
fn read_armor_header<R: BufRead>(
    reader: &mut R,
    begin: &str,
) -> io::Result<Option<BTreeMap<String, String>>> {
    let mut line = String::new();
    read_line_bounded(reader, &mut line)?;
    if line.trim_end() != begin {
        return Ok(None);
    }
    let mut headers = BTreeMap::new();
    loop {
        if read_line_bounded(reader, &mut line)? == 0 {
            return Ok(None);
        }
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            return Ok(Some(headers));
        }
        let Some((name, value)) = trimmed.split_once(": ") else {
            return Ok(None);
        };
        headers.insert(name.to_string(), value.to_string());
    }
}

/// Decodes armor body lines until the closing marker
struct ArmorBodyReader<R> {
    lines: R,
    end: &'static str,
    line: String,
    decoded: Vec<u8>,
    pos: usize,
    closed: bool,
}

impl<R: BufRead> ArmorBodyReader<R> {
    fn new(lines: R, end: &'static str) -> Self {
        Self {
            lines,
            end,
            line: String::new(),
            decoded: Vec::new(),
            pos: 0,
            closed: false,
        }
    }
}

impl<R: BufRead> Read for ArmorBodyReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pos == self.decoded.len() {
            if self.closed {
                return Ok(0);
            }
            if read_line_bounded(&mut self.lines, &mut self.line)? == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "armor is not closed",
                ));
            }
            let line = self.line.trim_end();
            if line == self.end {
                self.closed = true;
                continue;
            }
            self.decoded = hex::decode(line)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            self.pos = 0;
        }
        let n = buf.len().min(self.decoded.len() - self.pos);
        buf[..n].copy_from_slice(&self.decoded[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// Fill `buf` as far as the input allows; short only at end of input
fn read_full(input: &mut dyn Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match input.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// A malformed message is a failed decryption; anything else is an I/O error
fn malformed(status: &str, error: io::Error) -> Result<DecryptOutcome> {
    match error.kind() {
        io::ErrorKind::InvalidData | io::ErrorKind::UnexpectedEof => {
            Ok(failed(&format!("{} {}", status, error)))
        }
        _ => Err(error.into()),
    }
}

impl CryptoProvider for LocalKeyring {
    fn has_key(&self, fingerprint: &str, _secret: bool) -> Result<bool> {
        // every local key is symmetric, so public and secret halves coincide
        Ok(self
            .read_keys()?
            .contains_key(&normalize_fingerprint(fingerprint)))
    }

    fn encrypt_to(
        &self,
        recipient: &str,
        input: &mut (dyn Read + Send),
        output: &mut dyn Write,
    ) -> Result<()> {
        let recipient = normalize_fingerprint(recipient);
        let cipher = self.cipher(&recipient)?.ok_or_else(|| Error::KeyNotFound {
            fingerprint: recipient.clone(),
        })?;

        let mut nonce = [0u8; STREAM_NONCE_LEN];
        getrandom::getrandom(&mut nonce)
            .map_err(|e| Error::crypto(format!("no randomness available: {}", e)))?;
        let mut encryptor =
            EncryptorBE32::from_aead(cipher, GenericArray::from_slice(&nonce));

        write_armor_header(output, MESSAGE_BEGIN, &[("Recipient", recipient.as_str())])?;
        let mut body = ArmorBodyWriter::new(output);
        body.write_all(&nonce)?;

        let mut chunk = Zeroizing::new(vec![0u8; SEGMENT]);
        let aad = recipient.as_bytes();
        loop {
            let n = read_full(input, &mut chunk)?;
            let payload = Payload {
                msg: &chunk[..n],
                aad,
            };
            // a short chunk, possibly empty, closes the stream
            if n < SEGMENT {
                let sealed = encryptor
                    .encrypt_last(payload)
                    .map_err(|_| Error::crypto("encryption failed"))?;
                body.write_all(&sealed)?;
                break;
            }
            let sealed = encryptor
                .encrypt_next(payload)
                .map_err(|_| Error::crypto("encryption failed"))?;
            body.write_all(&sealed)?;
        }
        body.finish(MESSAGE_END)
    }

    fn decrypt(
        &self,
        input: &mut (dyn Read + Send),
        output: &mut dyn Write,
    ) -> Result<DecryptOutcome> {
        let mut reader = BufReader::new(input);
        let headers = match read_armor_header(&mut reader, MESSAGE_BEGIN) {
            Ok(Some(headers)) => headers,
            Ok(None) => return Ok(failed("NODATA no armored message")),
            Err(e) => return malformed("NODATA", e),
        };
        let Some(recipient) = headers.get("Recipient") else {
            return Ok(failed("NODATA missing recipient"));
        };
        let recipient = normalize_fingerprint(recipient);
        let Some(cipher) = self.cipher(&recipient)? else {
            return Ok(failed(&format!("NO_SECKEY {}", recipient)));
        };

        let mut body = ArmorBodyReader::new(reader, MESSAGE_END);
        let mut nonce = [0u8; STREAM_NONCE_LEN];
        match read_full(&mut body, &mut nonce) {
            Ok(STREAM_NONCE_LEN) => {}
            Ok(_) => return Ok(failed("DECRYPTION_FAILED truncated message")),
            Err(e) => return malformed("DECRYPTION_FAILED", e),
        }
        let mut decryptor =
            DecryptorBE32::from_aead(cipher, GenericArray::from_slice(&nonce));

        let mut segment = vec![0u8; SEGMENT + TAG_LEN];
        let aad = recipient.as_bytes();
        loop {
            let n = match read_full(&mut body, &mut segment) {
                Ok(n) => n,
                Err(e) => return malformed("DECRYPTION_FAILED", e),
            };
            let payload = Payload {
                msg: &segment[..n],
                aad,
            };
            if n < segment.len() {
                match decryptor.decrypt_last(payload) {
                    Ok(plaintext) => {
                        output.write_all(&Zeroizing::new(plaintext))?;
                        break;
                    }
                    Err(_) => {
                        return Ok(failed("DECRYPTION_FAILED authentication tag mismatch"))
                    }
                }
            }
            match decryptor.decrypt_next(payload) {
                Ok(plaintext) => output.write_all(&Zeroizing::new(plaintext))?,
                Err(_) => return Ok(failed("DECRYPTION_FAILED authentication tag mismatch")),
            }
        }

        match read_full(&mut body, &mut [0u8; 1]) {
            Ok(0) => Ok(DecryptOutcome {
                ok: true,
                status: "DECRYPTION_OKAY".to_string(),
            }),
            Ok(_) => Ok(failed("DECRYPTION_FAILED data after the final segment")),
            Err(e) => malformed("DECRYPTION_FAILED", e),
        }
    }

    fn sign(
        &self,
        fingerprint: &str,
        input: &mut (dyn Read + Send),
        output: &mut dyn Write,
    ) -> Result<()> {
        let fingerprint = normalize_fingerprint(fingerprint);
        let (mac, _) = self
            .mac(&fingerprint, input)?
            .ok_or_else(|| Error::KeyNotFound {
                fingerprint: fingerprint.clone(),
            })?;
        write_armor_header(output, SIGNATURE_BEGIN, &[("Signer", fingerprint.as_str())])?;
        let mut body = ArmorBodyWriter::new(output);
        body.write_all(mac.as_bytes())?;
        body.finish(SIGNATURE_END)
    }

    fn verify(
        &self,
        signature: &mut (dyn Read + Send),
        data: &mut (dyn Read + Send),
    ) -> Result<SignatureCheck> {
        let mut reader = BufReader::new(signature.take(MAX_SIGNATURE));
        let Ok(Some(headers)) = read_armor_header(&mut reader, SIGNATURE_BEGIN) else {
            return Ok(SignatureCheck::default());
        };
        let Some(signer) = headers.get("Signer") else {
            return Ok(SignatureCheck::default());
        };
        let mut claimed = Vec::new();
        if ArmorBodyReader::new(reader, SIGNATURE_END)
            .read_to_end(&mut claimed)
            .is_err()
        {
            return Ok(SignatureCheck::default());
        }

        let fingerprint = normalize_fingerprint(signer);
        let Some((mac, uid)) = self.mac(&fingerprint, data)? else {
            return Ok(SignatureCheck {
                valid: false,
                fingerprint: Some(fingerprint),
                signer: None,
            });
        };
        Ok(SignatureCheck {
            // constant-time comparison
            valid: mac == claimed[..],
            fingerprint: Some(fingerprint),
            signer: Some(uid),
        })
    }
}

fn failed(status: &str) -> DecryptOutcome {
    DecryptOutcome {
        ok: false,
        status: status.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn encrypt(keyring: &LocalKeyring, fp: &str, data: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        keyring.encrypt_to(fp, &mut &data[..], &mut out)?;
        Ok(out)
    }

    #[test]
    fn test_encrypt_decrypt() -> Result<()> {
        let keyring = LocalKeyring::new();
        let fp = keyring.generate("ops@example.org")?;
        assert_eq!(fp.len(), 40);
        assert!(keyring.has_key(&fp.to_lowercase(), true)?);

        let armored = encrypt(&keyring, &fp, b"payload bytes")?;
        let text = String::from_utf8(armored.clone()).unwrap();
        assert!(text.starts_with(MESSAGE_BEGIN));
        assert!(text.contains(&format!("Recipient: {}", fp)));

        let mut plain = Vec::new();
        let outcome = keyring.decrypt(&mut &armored[..], &mut plain)?;
        assert!(outcome.ok);
        assert_eq!(plain, b"payload bytes");
        Ok(())
    }

    fn rearmor(armored: &[u8], body: impl FnOnce(String) -> String) -> Vec<u8> {
        let text = String::from_utf8(armored.to_vec()).unwrap();
        let (head, rest) = text.split_once("\n\n").unwrap();
        let encoded: String = rest
            .lines()
            .take_while(|l| *l != MESSAGE_END)
            .collect();
        let mut out = format!("{}\n\n", head);
        for line in body(encoded).as_bytes().chunks(ARMOR_LINE) {
            out.push_str(std::str::from_utf8(line).unwrap());
            out.push('\n');
        }
        out.push_str(MESSAGE_END);
        out.push('\n');
        out.into_bytes()
    }

    #[test]
    fn test_multi_segment_messages() -> Result<()> {
        let keyring = LocalKeyring::new();
        let fp = keyring.generate("a")?;
        for len in [0, SEGMENT - 1, SEGMENT, 2 * SEGMENT, 3 * SEGMENT + 17] {
            let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let armored = encrypt(&keyring, &fp, &data)?;
            let text = std::str::from_utf8(&armored).unwrap();
            assert!(text.lines().all(|l| l.len() <= ARMOR_LINE.max(MESSAGE_END.len())));

            let mut plain = Vec::new();
            let outcome = keyring.decrypt(&mut &armored[..], &mut plain)?;
            assert!(outcome.ok, "{} bytes: {}", len, outcome.status);
            assert_eq!(plain.len(), len);
            assert!(plain == data);
        }
        Ok(())
    }

    #[test]
    fn test_truncated_stream_is_rejected() -> Result<()> {
        let keyring = LocalKeyring::new();
        let fp = keyring.generate("a")?;
        let data = vec![7u8; 2 * SEGMENT + 100];
        let armored = encrypt(&keyring, &fp, &data)?;

        // drop everything after the first full segment
        let keep = 2 * (STREAM_NONCE_LEN + SEGMENT + TAG_LEN);
        let truncated = rearmor(&armored, |body| body[..keep].to_string());
        let outcome = keyring.decrypt(&mut &truncated[..], &mut Vec::new())?;
        assert!(!outcome.ok);
        assert!(outcome.status.starts_with("DECRYPTION_FAILED"));

        // a missing closing marker is caught as well
        let text = String::from_utf8(armored.clone()).unwrap();
        let unclosed = text.replace(MESSAGE_END, "");
        let outcome = keyring.decrypt(&mut unclosed.as_bytes(), &mut Vec::new())?;
        assert!(!outcome.ok);

        let intact = rearmor(&armored, |body| body);
        let mut plain = Vec::new();
        assert!(keyring.decrypt(&mut &intact[..], &mut plain)?.ok);
        assert_eq!(plain.len(), data.len());
        Ok(())
    }

    #[test]
    fn test_decrypt_failures_report_status() -> Result<()> {
        let keyring = LocalKeyring::new();
        let fp = keyring.generate("a")?;
        let armored = encrypt(&keyring, &fp, b"secret")?;

        let stranger = LocalKeyring::new();
        let outcome = stranger.decrypt(&mut &armored[..], &mut Vec::new())?;
        assert!(!outcome.ok);
        assert!(outcome.status.starts_with("NO_SECKEY"));

        // flip one hex digit in the body
        let mut tampered = String::from_utf8(armored).unwrap();
        let pos = tampered.find("\n\n").unwrap() + 10;
        let flipped = if &tampered[pos..pos + 1] == "0" { "1" } else { "0" };
        tampered.replace_range(pos..pos + 1, flipped);
        let outcome = keyring.decrypt(&mut tampered.as_bytes(), &mut Vec::new())?;
        assert!(!outcome.ok);
        assert!(outcome.status.starts_with("DECRYPTION_FAILED"));

        let outcome = keyring.decrypt(&mut &b"garbage"[..], &mut Vec::new())?;
        assert!(!outcome.ok);
        Ok(())
    }

    #[test]
    fn test_sign_and_verify() -> Result<()> {
        let keyring = LocalKeyring::new();
        let fp = keyring.generate("signer <s@example.org>")?;
        let data = b"block contents".to_vec();

        let mut sig = Vec::new();
        keyring.sign(&fp, &mut &data[..], &mut sig)?;

        let check = keyring.verify(&mut &sig[..], &mut &data[..])?;
        assert!(check.valid);
        assert_eq!(check.fingerprint.as_deref(), Some(fp.as_str()));
        assert_eq!(check.signer.as_deref(), Some("signer <s@example.org>"));

        let mut altered = data.clone();
        altered[0] ^= 0x01;
        let check = keyring.verify(&mut &sig[..], &mut &altered[..])?;
        assert!(!check.valid);
        assert_eq!(check.fingerprint.as_deref(), Some(fp.as_str()));
        Ok(())
    }

    #[test]
    fn test_sign_with_unknown_key() {
        let keyring = LocalKeyring::new();
        let result = keyring.sign("ABCDEF", &mut &b"x"[..], &mut Vec::new());
        assert!(matches!(result, Err(Error::KeyNotFound { .. })));
    }

    #[test]
    fn test_persistence() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("keys").join("keyring.json");
        let keyring = LocalKeyring::load(&path)?;
        let fp = keyring.generate("a")?;
        keyring.save()?;

        let armored = encrypt(&keyring, &fp, b"persisted")?;
        let reloaded = LocalKeyring::load(&path)?;
        assert_eq!(reloaded.fingerprints()?, vec![fp]);
        let mut plain = Vec::new();
        assert!(reloaded.decrypt(&mut &armored[..], &mut plain)?.ok);
        assert_eq!(plain, b"persisted");
        Ok(())
    }
}
