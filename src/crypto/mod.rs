//! Crypto provider: encrypt, decrypt, sign and verify against a keystore.
//!
//! Two backends implement [`CryptoProvider`]:
//!
//! - [`GnupgProvider`] drives the system `gpg` executable and produces
//!   standard ASCII-armored OpenPGP messages and detached signatures.
//! - [`LocalKeyring`] (feature `keyring`) is a self-contained JSON keyring for
//!   hosts without GnuPG, and the test double used throughout the test suite.

pub mod gnupg;
#[cfg(feature = "keyring")]
pub mod keyring;

pub use gnupg::GnupgProvider;
#[cfg(feature = "keyring")]
pub use keyring::LocalKeyring;

use crate::config::{Backend, Config};
use crate::{Error, Result};
use std::io::{Read, Write};

/// Result of a decryption attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptOutcome {
    pub ok: bool,
    /// Provider status text
    pub status: String,
}

/// Result of checking a detached signature
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SignatureCheck {
    pub valid: bool,
    /// Fingerprint of the signing key, when known
    pub fingerprint: Option<String>,
    /// User id of the signer, when known
    pub signer: Option<String>,
}

/// Capability set of an OpenPGP-style keystore
pub trait CryptoProvider: Send + Sync {
    /// Whether the keystore holds `fingerprint` (its secret half when `secret`)
    fn has_key(&self, fingerprint: &str, secret: bool) -> Result<bool>;

    /// Encrypt to `recipient`; the recipient is trusted unconditionally
    fn encrypt_to(
        &self,
        recipient: &str,
        input: &mut (dyn Read + Send),
        output: &mut dyn Write,
    ) -> Result<()>;

    /// Decrypt with whichever secret key matches
    fn decrypt(
        &self,
        input: &mut (dyn Read + Send),
        output: &mut dyn Write,
    ) -> Result<DecryptOutcome>;

    /// Write a detached signature over `input`
    fn sign(
        &self,
        fingerprint: &str,
        input: &mut (dyn Read + Send),
        output: &mut dyn Write,
    ) -> Result<()>;

    /// Check a detached signature over `data`
    fn verify(
        &self,
        signature: &mut (dyn Read + Send),
        data: &mut (dyn Read + Send),
    ) -> Result<SignatureCheck>;
}

/// Fail with `KeyNotFound` unless the keystore holds the key
pub fn require_key(provider: &dyn CryptoProvider, fingerprint: &str, secret: bool) -> Result<()> {
    if provider.has_key(fingerprint, secret)? {
        Ok(())
    } else {
        Err(Error::KeyNotFound {
            fingerprint: fingerprint.to_string(),
        })
    }
}

/// Canonical form for comparing fingerprints: uppercase, no whitespace
pub fn normalize_fingerprint(fingerprint: &str) -> String {
    fingerprint
        .chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_uppercase)
        .collect()
}

/// Build the provider named by the configuration
pub fn provider_from_config(config: &Config) -> Result<Box<dyn CryptoProvider>> {
    match config.backend {
        Backend::Gnupg => Ok(Box::new(GnupgProvider::new(config.keystore.clone()))),
        #[cfg(feature = "keyring")]
        Backend::Local => {
            let path = config
                .keystore
                .as_ref()
                .ok_or_else(|| Error::config("the local backend needs a keystore path"))?;
            Ok(Box::new(LocalKeyring::load(path)?))
        }
        #[cfg(not(feature = "keyring"))]
        Backend::Local => Err(Error::config(
            "the local backend requires the `keyring` feature",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_fingerprint() {
        assert_eq!(
            normalize_fingerprint("abcd 1234\tef"),
            "ABCD1234EF".to_string()
        );
    }
}
