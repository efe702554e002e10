//! Payload Encryption
//!
//! AES-256-GCM with a versioned keyring. Keys are derived from configured
//! secrets with HKDF-SHA256. The active version encrypts; every known version
//! decrypts, so keys can be rotated without invalidating stored records.
//!
//! Ciphertext layout: `nonce (12 bytes) || ciphertext || tag (16 bytes)`.
//! The cache key is bound as associated data, so a record copied under a
//! different key fails authentication.

use std::collections::BTreeMap;

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;

use crate::config::EncryptionSettings;
use crate::error::{Error, Result};

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Versioned set of AES-256-GCM keys
pub struct Keyring {
    ciphers: BTreeMap<u32, Aes256Gcm>,
    active: Option<u32>,
    encrypt_sensitive_keys: bool,
    sensitive_patterns: Vec<String>,
}

impl std::fmt::Debug for Keyring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keyring")
            .field("versions", &self.ciphers.keys().collect::<Vec<_>>())
            .field("active", &self.active)
            .finish()
    }
}

impl Keyring {
    /// A keyring with no keys; encryption requests fail
    pub fn empty() -> Self {
        Self {
            ciphers: BTreeMap::new(),
            active: None,
            encrypt_sensitive_keys: false,
            sensitive_patterns: Vec::new(),
        }
    }

    /// Build a keyring from configuration
    pub fn from_settings(settings: &EncryptionSettings) -> Result<Self> {
        let mut ciphers = BTreeMap::new();
        for key in &settings.keys {
            let cipher = derive_cipher(key.secret.as_bytes(), settings.salt.as_bytes(), key.version)?;
            if ciphers.insert(key.version, cipher).is_some() {
                return Err(Error::Config(format!(
                    "duplicate encryption key version {}",
                    key.version
                )));
            }
        }

        let active = match settings.active_version {
            Some(v) if ciphers.contains_key(&v) => Some(v),
            Some(v) => {
                return Err(Error::Config(format!(
                    "active encryption key version {} is not configured",
                    v
                )))
            }
            None => ciphers.keys().next_back().copied(),
        };

        Ok(Self {
            ciphers,
            active,
            encrypt_sensitive_keys: settings.encrypt_sensitive_keys,
            sensitive_patterns: settings
                .sensitive_patterns
                .iter()
                .map(|p| p.to_lowercase())
                .collect(),
        })
    }

    /// Version used for new encryptions
    pub fn active_version(&self) -> Option<u32> {
        self.active
    }

    pub fn is_enabled(&self) -> bool {
        self.active.is_some()
    }

    /// Whether `key` names data that is encrypted even when not requested
    pub fn is_sensitive(&self, key: &str) -> bool {
        if !self.encrypt_sensitive_keys {
            return false;
        }
        let lowered = key.to_lowercase();
        self.sensitive_patterns.iter().any(|p| lowered.contains(p))
    }

    /// Encrypt `plaintext` for `key` with the active version
    pub fn encrypt(&self, key: &str, plaintext: &[u8]) -> Result<(Vec<u8>, u32)> {
        let version = self
            .active
            .ok_or_else(|| Error::Encryption("no encryption key configured".into()))?;
        let cipher = self.cipher(version)?;

        let mut nonce = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce);

        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: key.as_bytes(),
                },
            )
            .map_err(|_| Error::Encryption("encryption failed".into()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok((out, version))
    }

    /// Decrypt data produced by [`encrypt`](Self::encrypt) under `version`
    pub fn decrypt(&self, key: &str, data: &[u8], version: u32) -> Result<Vec<u8>> {
        if data.len() < NONCE_LEN + TAG_LEN {
            return Err(Error::Encryption("ciphertext too short".into()));
        }
        let cipher = self.cipher(version)?;
        let (nonce, ciphertext) = data.split_at(NONCE_LEN);

        cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: key.as_bytes(),
                },
            )
            .map_err(|_| {
                Error::Encryption(format!(
                    "authentication failed with key version {} (wrong or rotated key)",
                    version
                ))
            })
    }

    fn cipher(&self, version: u32) -> Result<&Aes256Gcm> {
        self.ciphers
            .get(&version)
            .ok_or_else(|| Error::Encryption(format!("unknown key version {}", version)))
    }
}

fn derive_cipher(secret: &[u8], salt: &[u8], version: u32) -> Result<Aes256Gcm> {
    let hk = Hkdf::<Sha256>::new(Some(salt), secret);
    let info = format!("ringcache record key v{}", version);
    let mut key = [0u8; 32];
    hk.expand(info.as_bytes(), &mut key)
        .map_err(|e| Error::Config(format!("key derivation failed: {}", e)))?;
    Aes256Gcm::new_from_slice(&key).map_err(|e| Error::Config(format!("invalid key: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KeyConfig;
    use assert_matches::assert_matches;

    fn settings(keys: &[(u32, &str)]) -> EncryptionSettings {
        EncryptionSettings {
            keys: keys
                .iter()
                .map(|(v, s)| KeyConfig {
                    version: *v,
                    secret: s.to_string(),
                })
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_roundtrip() {
        let keyring = Keyring::from_settings(&settings(&[(1, "s3cret")])).unwrap();
        let (ciphertext, version) = keyring.encrypt("user:1", b"payload").unwrap();
        assert_eq!(version, 1);
        assert_ne!(&ciphertext[NONCE_LEN..], b"payload");
        assert_eq!(keyring.decrypt("user:1", &ciphertext, 1).unwrap(), b"payload");
    }

    #[test]
    fn test_nonce_is_random() {
        let keyring = Keyring::from_settings(&settings(&[(1, "s3cret")])).unwrap();
        let (a, _) = keyring.encrypt("k", b"same").unwrap();
        let (b, _) = keyring.encrypt("k", b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_rotation_keeps_old_versions_readable() {
        let old = Keyring::from_settings(&settings(&[(1, "old")])).unwrap();
        let (ciphertext, v1) = old.encrypt("k", b"data").unwrap();

        let rotated = Keyring::from_settings(&settings(&[(1, "old"), (2, "new")])).unwrap();
        assert_eq!(rotated.active_version(), Some(2));
        assert_eq!(rotated.decrypt("k", &ciphertext, v1).unwrap(), b"data");
    }

    #[test]
    fn test_wrong_key_fails() {
        let a = Keyring::from_settings(&settings(&[(1, "alpha")])).unwrap();
        let b = Keyring::from_settings(&settings(&[(1, "beta")])).unwrap();
        let (ciphertext, v) = a.encrypt("k", b"data").unwrap();

        assert_matches!(b.decrypt("k", &ciphertext, v), Err(Error::Encryption(_)));
        assert_matches!(a.decrypt("k", &ciphertext, 7), Err(Error::Encryption(_)));
        assert_matches!(a.decrypt("other", &ciphertext, v), Err(Error::Encryption(_)));
    }

    #[test]
    fn test_empty_keyring_refuses() {
        let keyring = Keyring::empty();
        assert!(!keyring.is_enabled());
        assert_matches!(keyring.encrypt("k", b"x"), Err(Error::Encryption(_)));
    }

    #[test]
    fn test_sensitive_keys() {
        let keyring = Keyring::from_settings(&settings(&[(1, "s")])).unwrap();
        assert!(keyring.is_sensitive("user:42:PASSWORD"));
        assert!(keyring.is_sensitive("session_token"));
        assert!(!keyring.is_sensitive("page:home"));
    }

    #[test]
    fn test_active_version_must_exist() {
        let mut s = settings(&[(1, "s")]);
        s.active_version = Some(3);
        assert_matches!(Keyring::from_settings(&s), Err(Error::Config(_)));
    }
}
