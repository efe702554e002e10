//! Stored Record Types
//!
//! Every value the engine writes to a backend is a self-describing binary
//! record: a plaintext header followed by the (possibly compressed and
//! encrypted) payload.
//!
//! ```text
//! offset  size  field
//! 0       2     magic "RC"
//! 2       1     format version
//! 3       1     flags (bit0 compressed, bit1 encrypted, bit2 tombstone)
//! 4       1     compression tag
//! 5       1     priority
//! 6       4     encryption key version
//! 10      8     record version
//! 18      8     expiry, ms since epoch (0 = never)
//! 26      4     raw (pre-pipeline) size
//! 30      32    SHA-256 over bytes 0..30 and the payload
//! 62      ..    payload
//! ```
//!
//! The header is never encrypted: eviction and read-repair compare versions,
//! expiry and priority without touching keys.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::compression::CompressionAlgorithm;
use crate::error::{Error, Result};

const MAGIC: &[u8; 2] = b"RC";
const FORMAT_VERSION: u8 = 1;
const FIXED_LEN: usize = 30;
const CHECKSUM_LEN: usize = 32;
/// Bytes preceding the payload
pub const HEADER_LEN: usize = FIXED_LEN + CHECKSUM_LEN;

const FLAG_COMPRESSED: u8 = 0b001;
const FLAG_ENCRYPTED: u8 = 0b010;
const FLAG_TOMBSTONE: u8 = 0b100;

// =============================================================================
// Clock
// =============================================================================

/// Milliseconds since the Unix epoch
pub fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// Hybrid clock producing strictly increasing record versions.
///
/// Versions are microseconds since the epoch, bumped past the last issued
/// value so two writes in the same microsecond still order.
#[derive(Debug, Default)]
pub struct VersionClock {
    last: AtomicU64,
}

impl VersionClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next version: `max(now_µs, last + 1)`
    pub fn next(&self) -> u64 {
        let now = chrono::Utc::now().timestamp_micros().max(0) as u64;
        let mut last = self.last.load(Ordering::Relaxed);
        loop {
            let candidate = now.max(last + 1);
            match self
                .last
                .compare_exchange_weak(last, candidate, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return candidate,
                Err(actual) => last = actual,
            }
        }
    }

    /// Advance past a version observed elsewhere (e.g. read from a replica)
    pub fn observe(&self, version: u64) {
        self.last.fetch_max(version, Ordering::AcqRel);
    }
}

// =============================================================================
// Priority
// =============================================================================

/// Eviction priority; lower priorities are evicted first, Pinned never
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum Priority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
    Pinned = 3,
}

impl Priority {
    pub fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(Priority::Low),
            1 => Ok(Priority::Normal),
            2 => Ok(Priority::High),
            3 => Ok(Priority::Pinned),
            other => Err(Error::Serialization(format!("unknown priority tag {}", other))),
        }
    }

    pub fn is_evictable(&self) -> bool {
        *self != Priority::Pinned
    }
}

// =============================================================================
// Entry Options
// =============================================================================

/// Per-entry write options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryOptions {
    /// Time to live; `None` keeps the entry until deleted or evicted
    pub ttl: Option<Duration>,
    pub priority: Priority,
    /// Encrypt even if the key is not considered sensitive
    pub encrypt: bool,
    /// Let the compression manager compress the payload
    pub compress: bool,
}

impl Default for EntryOptions {
    fn default() -> Self {
        Self {
            ttl: None,
            priority: Priority::default(),
            encrypt: false,
            compress: true,
        }
    }
}

impl EntryOptions {
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn encrypted(mut self) -> Self {
        self.encrypt = true;
        self
    }

    pub fn without_compression(mut self) -> Self {
        self.compress = false;
        self
    }
}

// =============================================================================
// Record Header
// =============================================================================

/// Plaintext record metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub compression: CompressionAlgorithm,
    /// Key version used to encrypt, if encrypted
    pub key_version: Option<u32>,
    pub tombstone: bool,
    pub priority: Priority,
    pub version: u64,
    /// Absolute expiry in ms since epoch
    pub expires_at_ms: Option<u64>,
    pub raw_size: u32,
}

impl RecordHeader {
    /// Header for a live value
    pub fn value(version: u64, priority: Priority, expires_at_ms: Option<u64>) -> Self {
        Self {
            compression: CompressionAlgorithm::None,
            key_version: None,
            tombstone: false,
            priority,
            version,
            expires_at_ms,
            raw_size: 0,
        }
    }

    /// Header for a delete marker
    pub fn tombstone(version: u64, expires_at_ms: u64) -> Self {
        Self {
            tombstone: true,
            priority: Priority::Low,
            ..Self::value(version, Priority::Low, Some(expires_at_ms))
        }
    }

    pub fn is_compressed(&self) -> bool {
        self.compression != CompressionAlgorithm::None
    }

    pub fn is_encrypted(&self) -> bool {
        self.key_version.is_some()
    }

    pub fn is_expired_at(&self, now_ms: u64) -> bool {
        self.expires_at_ms.map(|at| now_ms >= at).unwrap_or(false)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now_millis())
    }

    /// Remaining lifetime, `None` if the record never expires
    pub fn remaining_ttl(&self) -> Option<Duration> {
        self.expires_at_ms
            .map(|at| Duration::from_millis(at.saturating_sub(now_millis())))
    }

    fn flags(&self) -> u8 {
        let mut flags = 0;
        if self.is_compressed() {
            flags |= FLAG_COMPRESSED;
        }
        if self.is_encrypted() {
            flags |= FLAG_ENCRYPTED;
        }
        if self.tombstone {
            flags |= FLAG_TOMBSTONE;
        }
        flags
    }

    fn write_to(&self, buf: &mut BytesMut) {
        buf.put_slice(MAGIC);
        buf.put_u8(FORMAT_VERSION);
        buf.put_u8(self.flags());
        buf.put_u8(self.compression.tag());
        buf.put_u8(self.priority as u8);
        buf.put_u32(self.key_version.unwrap_or(0));
        buf.put_u64(self.version);
        buf.put_u64(self.expires_at_ms.unwrap_or(0));
        buf.put_u32(self.raw_size);
    }

    fn read_from(mut buf: &[u8]) -> Result<Self> {
        if buf.len() < FIXED_LEN || &buf[..2] != MAGIC {
            return Err(Error::Serialization("not a cache record".into()));
        }
        buf.advance(2);
        let format = buf.get_u8();
        if format != FORMAT_VERSION {
            return Err(Error::Serialization(format!(
                "unsupported record format {}",
                format
            )));
        }
        let flags = buf.get_u8();
        let compression = CompressionAlgorithm::from_tag(buf.get_u8())?;
        let priority = Priority::from_tag(buf.get_u8())?;
        let key_version = buf.get_u32();
        let version = buf.get_u64();
        let expires_at_ms = buf.get_u64();
        let raw_size = buf.get_u32();

        if (flags & FLAG_COMPRESSED != 0) != (compression != CompressionAlgorithm::None) {
            return Err(Error::Serialization("compression flag mismatch".into()));
        }

        Ok(Self {
            compression,
            key_version: (flags & FLAG_ENCRYPTED != 0).then_some(key_version),
            tombstone: flags & FLAG_TOMBSTONE != 0,
            priority,
            version,
            expires_at_ms: (expires_at_ms != 0).then_some(expires_at_ms),
            raw_size,
        })
    }
}

// =============================================================================
// Record
// =============================================================================

/// A header plus payload, as stored on a backend node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub header: RecordHeader,
    pub payload: Bytes,
    checksum: [u8; CHECKSUM_LEN],
}

impl Record {
    /// Build a record, computing its checksum
    pub fn seal(header: RecordHeader, payload: Bytes) -> Self {
        let checksum = Self::digest(&header, &payload);
        Self {
            header,
            payload,
            checksum,
        }
    }

    fn digest(header: &RecordHeader, payload: &[u8]) -> [u8; CHECKSUM_LEN] {
        let mut fixed = BytesMut::with_capacity(FIXED_LEN);
        header.write_to(&mut fixed);
        let mut hasher = Sha256::new();
        hasher.update(&fixed);
        hasher.update(payload);
        hasher.finalize().into()
    }

    /// Serialize to the stored byte layout
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        self.header.write_to(&mut buf);
        buf.put_slice(&self.checksum);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Parse stored bytes without verifying the checksum
    pub fn decode(bytes: &Bytes) -> Result<Self> {
        let header = RecordHeader::read_from(bytes)?;
        if bytes.len() < HEADER_LEN {
            return Err(Error::Serialization("truncated record header".into()));
        }
        let mut checksum = [0u8; CHECKSUM_LEN];
        checksum.copy_from_slice(&bytes[FIXED_LEN..HEADER_LEN]);
        Ok(Self {
            header,
            payload: bytes.slice(HEADER_LEN..),
            checksum,
        })
    }

    /// Read only the header of stored bytes
    pub fn peek_header(bytes: &[u8]) -> Result<RecordHeader> {
        RecordHeader::read_from(bytes)
    }

    /// Check the stored checksum against header and payload
    pub fn verify(&self, key: &str) -> Result<()> {
        if Self::digest(&self.header, &self.payload) == self.checksum {
            Ok(())
        } else {
            Err(Error::Integrity {
                key: key.to_string(),
            })
        }
    }

    /// Encoded size on the backend
    pub fn stored_size(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    pub fn version(&self) -> u64 {
        self.header.version
    }

    pub fn is_tombstone(&self) -> bool {
        self.header.tombstone
    }

    /// Live value: not a tombstone and not expired
    pub fn is_live(&self) -> bool {
        !self.header.tombstone && !self.header.is_expired()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn sample() -> Record {
        let header = RecordHeader {
            compression: CompressionAlgorithm::Lz4,
            key_version: Some(3),
            tombstone: false,
            priority: Priority::High,
            version: 42,
            expires_at_ms: Some(now_millis() + 60_000),
            raw_size: 100,
        };
        Record::seal(header, Bytes::from_static(b"payload-bytes"))
    }

    #[test]
    fn test_encode_decode() {
        let record = sample();
        let bytes = record.encode();
        assert_eq!(bytes.len(), record.stored_size());
        assert_eq!(&bytes[..2], b"RC");

        let decoded = Record::decode(&bytes).unwrap();
        assert_eq!(decoded, record);
        decoded.verify("k").unwrap();
        assert_eq!(Record::peek_header(&bytes).unwrap(), record.header);
    }

    #[test]
    fn test_tampered_payload_fails_integrity() {
        let mut bytes = BytesMut::from(sample().encode().as_ref());
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;

        let decoded = Record::decode(&bytes.freeze()).unwrap();
        assert_matches!(decoded.verify("k"), Err(Error::Integrity { key }) if key == "k");
    }

    #[test]
    fn test_tampered_header_fails_integrity() {
        let mut bytes = BytesMut::from(sample().encode().as_ref());
        // bump the version field
        bytes[17] ^= 0x01;
        let decoded = Record::decode(&bytes.freeze()).unwrap();
        assert_matches!(decoded.verify("k"), Err(Error::Integrity { .. }));
    }

    #[test]
    fn test_garbage_rejected() {
        assert_matches!(
            Record::decode(&Bytes::from_static(b"plain old value")),
            Err(Error::Serialization(_))
        );
        let truncated = sample().encode().slice(..40);
        assert_matches!(Record::decode(&truncated), Err(Error::Serialization(_)));
    }

    #[test]
    fn test_tombstone_header() {
        let header = RecordHeader::tombstone(7, now_millis() + 1_000);
        let record = Record::seal(header, Bytes::new());
        let decoded = Record::decode(&record.encode()).unwrap();
        assert!(decoded.is_tombstone());
        assert!(!decoded.is_live());
        assert_eq!(decoded.header.priority, Priority::Low);
    }

    #[test]
    fn test_expiry() {
        let header = RecordHeader::value(1, Priority::Normal, Some(1_000));
        assert!(header.is_expired_at(1_000));
        assert!(!header.is_expired_at(999));
        assert!(!RecordHeader::value(1, Priority::Normal, None).is_expired());
    }

    #[test]
    fn test_version_clock_monotonic() {
        let clock = VersionClock::new();
        let mut last = 0;
        for _ in 0..1000 {
            let v = clock.next();
            assert!(v > last);
            last = v;
        }
        clock.observe(last + 1_000_000_000);
        assert!(clock.next() > last + 1_000_000_000);
    }

    #[test]
    fn test_priority_order() {
        assert!(Priority::Low < Priority::Normal);
        assert!(Priority::High < Priority::Pinned);
        assert!(!Priority::Pinned.is_evictable());
    }
}
