//! GnuPG backend: drives the `gpg` executable in batch mode.

use super::{normalize_fingerprint, CryptoProvider, DecryptOutcome, SignatureCheck};
use crate::{Error, Result};
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread;
use tracing::debug;

/// Prefix of machine-readable status lines
const STATUS_PREFIX: &str = "[GNUPG:] ";

/// Provider backed by the system `gpg` binary
#[derive(Debug, Clone)]
pub struct GnupgProvider {
    program: PathBuf,
    homedir: Option<PathBuf>,
}

/// Captured result of one `gpg` invocation
#[derive(Debug)]
struct Invocation {
    success: bool,
    stderr: String,
}

impl GnupgProvider {
    /// Use `gpg` from `PATH`, optionally with a specific home directory
    pub fn new(homedir: Option<PathBuf>) -> Self {
        Self {
            program: PathBuf::from("gpg"),
            homedir,
        }
    }

    /// Use a specific gpg executable
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(["--batch", "--yes", "--no-tty", "--status-fd", "2"]);
        if let Some(home) = &self.homedir {
            cmd.arg("--homedir").arg(home);
        }
        cmd
    }

    /// Run `cmd`, feeding `input` to stdin and streaming stdout into `output`.
    fn run(
        &self,
        mut cmd: Command,
        input: Option<&mut (dyn Read + Send)>,
        output: &mut dyn Write,
    ) -> Result<Invocation> {
        cmd.stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

        debug!(?cmd, "running gpg");
        let mut child = cmd
            .spawn()
            .map_err(|e| Error::crypto(format!("failed to start {}: {}", self.program.display(), e)))?;

        let stdin = child.stdin.take();
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::crypto("gpg stdout unavailable"))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::crypto("gpg stderr unavailable"))?;

        let stderr_reader = thread::spawn(move || {
            let mut text = String::new();
            let _ = stderr.read_to_string(&mut text);
            text
        });

        let copy_result = thread::scope(|scope| -> io::Result<()> {
            let feeder = match (input, stdin) {
                (Some(input), Some(mut stdin)) => Some(scope.spawn(move || {
                    match io::copy(input, &mut stdin) {
                        // gpg may stop reading early when it rejects the input
                        Err(e) if e.kind() == io::ErrorKind::BrokenPipe => Ok(()),
                        other => other.map(|_| ()),
                    }
                })),
                _ => None,
            };
            io::copy(&mut stdout, output)?;
            if let Some(feeder) = feeder {
                feeder
                    .join()
                    .map_err(|_| io::Error::new(io::ErrorKind::Other, "gpg input feeder panicked"))??;
            }
            Ok(())
        });

        let status = child.wait()?;
        let stderr = stderr_reader
            .join()
            .map_err(|_| Error::crypto("gpg stderr reader panicked"))?;
        copy_result?;

        Ok(Invocation {
            success: status.success(),
            stderr,
        })
    }
}

/// Facts extracted from `[GNUPG:]` status lines
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub decryption_okay: bool,
    pub decryption_failed: bool,
    pub no_secret_key: bool,
    pub good_signature: bool,
    pub bad_signature: bool,
    pub signature_error: bool,
    /// Primary key fingerprint from `VALIDSIG`
    pub fingerprint: Option<String>,
    /// User id from `GOODSIG`
    pub signer: Option<String>,
    /// The raw status lines
    pub lines: Vec<String>,
}

impl StatusReport {
    pub fn parse(text: &str) -> Self {
        let mut report = StatusReport::default();
        for line in text.lines() {
            let Some(status) = line.strip_prefix(STATUS_PREFIX) else {
                continue;
            };
            report.lines.push(status.to_string());
            let mut fields = status.split(' ');
            match fields.next() {
                Some("DECRYPTION_OKAY") => report.decryption_okay = true,
                Some("DECRYPTION_FAILED") => report.decryption_failed = true,
                Some("NO_SECKEY") => report.no_secret_key = true,
                Some("BADSIG") => report.bad_signature = true,
                Some("ERRSIG") => report.signature_error = true,
                Some("GOODSIG") => {
                    report.good_signature = true;
                    let uid: Vec<&str> = fields.skip(1).collect();
                    if !uid.is_empty() {
                        report.signer = Some(uid.join(" "));
                    }
                }
                Some("VALIDSIG") => {
                    // VALIDSIG <fpr> <date> <ts> <expire> <ver> <rsvd> <pk-algo> <hash-algo> <class> <primary-fpr>
                    let fields: Vec<&str> = fields.collect();
                    let primary = fields.get(9).or_else(|| fields.first());
                    report.fingerprint = primary.map(|f| normalize_fingerprint(f));
                }
                _ => {}
            }
        }
        report
    }

    /// The status lines joined, for diagnostics
    pub fn summary(&self) -> String {
        if self.lines.is_empty() {
            "no status output".to_string()
        } else {
            self.lines.join("; ")
        }
    }
}

impl CryptoProvider for GnupgProvider {
    fn has_key(&self, fingerprint: &str, secret: bool) -> Result<bool> {
        let mut cmd = self.command();
        cmd.arg("--with-colons")
            .arg(if secret {
                "--list-secret-keys"
            } else {
                "--list-keys"
            })
            .arg(fingerprint);
        let invocation = self.run(cmd, None, &mut io::sink())?;
        Ok(invocation.success)
    }

    fn encrypt_to(
        &self,
        recipient: &str,
        input: &mut (dyn Read + Send),
        output: &mut dyn Write,
    ) -> Result<()> {
        let mut cmd = self.command();
        cmd.args(["--trust-model", "always", "--armor", "--encrypt", "--recipient"])
            .arg(recipient);
        let invocation = self.run(cmd, Some(input), output)?;
        if !invocation.success {
            let report = StatusReport::parse(&invocation.stderr);
            return Err(Error::crypto(format!(
                "encryption to {} failed: {}",
                recipient,
                report.summary()
            )));
        }
        Ok(())
    }

    fn decrypt(
        &self,
        input: &mut (dyn Read + Send),
        output: &mut dyn Write,
    ) -> Result<DecryptOutcome> {
        let mut cmd = self.command();
        cmd.arg("--decrypt");
        let invocation = self.run(cmd, Some(input), output)?;
        let report = StatusReport::parse(&invocation.stderr);
        let ok = invocation.success && report.decryption_okay && !report.decryption_failed;
        Ok(DecryptOutcome {
            ok,
            status: report.summary(),
        })
    }

    fn sign(
        &self,
        fingerprint: &str,
        input: &mut (dyn Read + Send),
        output: &mut dyn Write,
    ) -> Result<()> {
        let mut cmd = self.command();
        cmd.args(["--armor", "--detach-sign", "--local-user"])
            .arg(fingerprint);
        let invocation = self.run(cmd, Some(input), output)?;
        if !invocation.success {
            let report = StatusReport::parse(&invocation.stderr);
            return Err(Error::crypto(format!(
                "signing with {} failed: {}",
                fingerprint,
                report.summary()
            )));
        }
        Ok(())
    }

    fn verify(
        &self,
        signature: &mut (dyn Read + Send),
        data: &mut (dyn Read + Send),
    ) -> Result<SignatureCheck> {
        // gpg reads the detached signature from a file and the data from stdin
        let mut sig_file = tempfile::NamedTempFile::new()?;
        io::copy(signature, sig_file.as_file_mut())?;
        sig_file.as_file_mut().flush()?;

        let mut cmd = self.command();
        cmd.arg("--verify").arg(sig_file.path()).arg("-");
        let invocation = self.run(cmd, Some(data), &mut io::sink())?;
        let report = StatusReport::parse(&invocation.stderr);

        let valid = invocation.success
            && report.good_signature
            && report.fingerprint.is_some()
            && !report.bad_signature
            && !report.signature_error;
        Ok(SignatureCheck {
            valid,
            fingerprint: report.fingerprint,
            signer: report.signer,
        })
    }
}
