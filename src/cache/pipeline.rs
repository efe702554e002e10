//! Serialization Pipeline
//!
//! Turns caller values into stored records and back.
//!
//! ```text
//! write: serialize → compress → encrypt → checksum → Record
//! read:  Record → verify checksum → decrypt → decompress → deserialize
//! ```
//!
//! Encryption always wraps the (possibly compressed) bytes. Each read stage
//! fails with its own error: `Integrity`, `Encryption`,
//! `DecompressionFailed`, `Serialization`.

use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::compression::{CompressionAlgorithm, CompressionManager};
use super::encryption::Keyring;
use super::entry::{now_millis, EntryOptions, Record, RecordHeader};
use crate::config::PipelineConfig;
use crate::error::{Error, Result};

/// Encodes and decodes records
#[derive(Debug)]
pub struct Pipeline {
    compression: CompressionManager,
    keyring: Keyring,
}

impl Pipeline {
    pub fn new(config: &PipelineConfig) -> Result<Self> {
        Ok(Self {
            compression: CompressionManager::with_settings(config.compression.clone()),
            keyring: Keyring::from_settings(&config.encryption)?,
        })
    }

    pub fn keyring(&self) -> &Keyring {
        &self.keyring
    }

    /// Whether a write of `key` with `options` will be encrypted
    pub fn should_encrypt(&self, key: &str, options: &EntryOptions) -> bool {
        options.encrypt || (self.keyring.is_enabled() && self.keyring.is_sensitive(key))
    }

    /// Encode raw bytes into a record stamped with `version`
    pub fn encode(
        &self,
        key: &str,
        raw: &[u8],
        version: u64,
        options: &EntryOptions,
    ) -> Result<Record> {
        let raw_size = u32::try_from(raw.len())
            .map_err(|_| Error::InvalidInput(format!("value of {} bytes is too large", raw.len())))?;

        let (compressed, compression) = if options.compress {
            self.compression.compress(raw)
        } else {
            (Bytes::copy_from_slice(raw), CompressionAlgorithm::None)
        };

        let (payload, key_version) = if self.should_encrypt(key, options) {
            let (ciphertext, v) = self.keyring.encrypt(key, &compressed)?;
            (Bytes::from(ciphertext), Some(v))
        } else {
            (compressed, None)
        };

        let expires_at_ms = options
            .ttl
            .map(|ttl| now_millis().saturating_add(ttl.as_millis() as u64));

        let header = RecordHeader {
            compression,
            key_version,
            raw_size,
            ..RecordHeader::value(version, options.priority, expires_at_ms)
        };
        Ok(Record::seal(header, payload))
    }

    /// Serialize a typed value with serde_json, then encode it
    pub fn encode_value<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        version: u64,
        options: &EntryOptions,
    ) -> Result<Record> {
        let raw = serialize(value)?;
        self.encode(key, &raw, version, options)
    }

    /// A delete marker living for `ttl`
    pub fn tombstone(&self, version: u64, ttl: Duration) -> Record {
        let expires = now_millis().saturating_add(ttl.as_millis() as u64);
        Record::seal(RecordHeader::tombstone(version, expires), Bytes::new())
    }

    /// Verify, decrypt and decompress a record back to the raw bytes
    pub fn decode(&self, key: &str, record: &Record) -> Result<Bytes> {
        record.verify(key)?;

        let header = &record.header;
        let plaintext = match header.key_version {
            Some(version) => Bytes::from(self.keyring.decrypt(key, &record.payload, version)?),
            None => record.payload.clone(),
        };

        let raw = match header.compression {
            CompressionAlgorithm::None => plaintext,
            algorithm => self.compression.decompress(&plaintext, algorithm)?,
        };

        if raw.len() != header.raw_size as usize {
            return Err(Error::Serialization(format!(
                "decoded {} bytes, header says {}",
                raw.len(),
                header.raw_size
            )));
        }
        Ok(raw)
    }

    /// Decode a record and deserialize it with serde_json
    pub fn decode_value<T: DeserializeOwned>(&self, key: &str, record: &Record) -> Result<T> {
        deserialize(&self.decode(key, record)?)
    }
}

/// serde_json encoding used for typed values
pub fn serialize<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| Error::Serialization(e.to_string()))
}

/// serde_json decoding used for typed values
pub fn deserialize<T: DeserializeOwned>(raw: &[u8]) -> Result<T> {
    serde_json::from_slice(raw).map_err(|e| Error::Serialization(e.to_string()))
}
