//! Payload Compression
//!
//! LZ4 for ordinary payloads, zlib for large ones, and nothing at all for
//! small or already-compressed data.
//!
//! # Example
//!
//! ```
//! use ringcache::cache::compression::{CompressionAlgorithm, CompressionManager};
//!
//! let manager = CompressionManager::new();
//!
//! let data = "repeat me ".repeat(500);
//! let (compressed, algorithm) = manager.compress(data.as_bytes());
//! assert_eq!(algorithm, CompressionAlgorithm::Lz4);
//!
//! let decompressed = manager.decompress(&compressed, algorithm).unwrap();
//! assert_eq!(decompressed.as_ref(), data.as_bytes());
//! ```

use std::io::{Read, Write};

use bytes::Bytes;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;

use crate::config::CompressionSettings;
use crate::error::{Error, Result};

// =============================================================================
// Compression Algorithm
// =============================================================================

/// Supported compression algorithms. The discriminant is the on-disk tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum CompressionAlgorithm {
    #[default]
    None = 0,
    /// LZ4 block format with size prefix
    Lz4 = 1,
    /// zlib (Deflate)
    Zlib = 2,
}

impl CompressionAlgorithm {
    pub fn name(&self) -> &'static str {
        match self {
            CompressionAlgorithm::None => "none",
            CompressionAlgorithm::Lz4 => "lz4",
            CompressionAlgorithm::Zlib => "zlib",
        }
    }

    /// On-disk tag
    pub fn tag(&self) -> u8 {
        *self as u8
    }

    /// Parse an on-disk tag
    pub fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(CompressionAlgorithm::None),
            1 => Ok(CompressionAlgorithm::Lz4),
            2 => Ok(CompressionAlgorithm::Zlib),
            other => Err(Error::Serialization(format!(
                "unknown compression tag {}",
                other
            ))),
        }
    }
}

impl std::fmt::Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

// =============================================================================
// Compressor Trait
// =============================================================================

/// Trait for compression implementations
pub trait Compressor: Send + Sync {
    fn algorithm(&self) -> CompressionAlgorithm;

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>>;
}

/// Pass-through compressor
pub struct NoopCompressor;

impl Compressor for NoopCompressor {
    fn algorithm(&self) -> CompressionAlgorithm {
        CompressionAlgorithm::None
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }
}

/// LZ4 compressor (fast, moderate ratio)
pub struct Lz4Compressor;

impl Compressor for Lz4Compressor {
    fn algorithm(&self) -> CompressionAlgorithm {
        CompressionAlgorithm::Lz4
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        lz4::block::compress(data, Some(lz4::block::CompressionMode::DEFAULT), true).map_err(
            |e| Error::CompressionFailed {
                algorithm: "LZ4".into(),
                reason: e.to_string(),
            },
        )
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        lz4::block::decompress(data, None).map_err(|e| Error::DecompressionFailed {
            algorithm: "LZ4".into(),
            reason: e.to_string(),
        })
    }
}

/// zlib compressor (slower, better ratio on large payloads)
pub struct ZlibCompressor {
    level: u32,
}

impl ZlibCompressor {
    pub fn with_level(level: i32) -> Self {
        Self {
            level: level.clamp(0, 9) as u32,
        }
    }
}

impl Compressor for ZlibCompressor {
    fn algorithm(&self) -> CompressionAlgorithm {
        CompressionAlgorithm::Zlib
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let failed = |e: std::io::Error| Error::CompressionFailed {
            algorithm: "zlib".into(),
            reason: e.to_string(),
        };
        let mut encoder = ZlibEncoder::new(
            Vec::with_capacity(data.len() / 2),
            flate2::Compression::new(self.level),
        );
        encoder.write_all(data).map_err(failed)?;
        encoder.finish().map_err(failed)
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(data.len() * 2);
        ZlibDecoder::new(data)
            .read_to_end(&mut out)
            .map_err(|e| Error::DecompressionFailed {
                algorithm: "zlib".into(),
                reason: e.to_string(),
            })?;
        Ok(out)
    }
}

// =============================================================================
// Content Sniffing
// =============================================================================

/// Whether `data` starts with the signature of an already-compressed format
pub fn looks_compressed(data: &[u8]) -> bool {
    const SIGNATURES: &[&[u8]] = &[
        &[0x1f, 0x8b],             // gzip
        &[0x28, 0xb5, 0x2f, 0xfd], // zstd
        &[0x04, 0x22, 0x4d, 0x18], // lz4 frame
        &[0x89, b'P', b'N', b'G'], // png
        &[0xff, 0xd8, 0xff],       // jpeg
        &[b'P', b'K', 0x03, 0x04], // zip
        &[b'B', b'Z', b'h'],       // bzip2
        &[0xfd, b'7', b'z', b'X', b'Z'], // xz
    ];
    if SIGNATURES.iter().any(|sig| data.starts_with(sig)) {
        return true;
    }
    // zlib: CMF 0x78 with a valid FCHECK
    data.len() >= 2
        && data[0] == 0x78
        && matches!(data[1], 0x01 | 0x5e | 0x9c | 0xda)
}

// =============================================================================
// Compression Manager
// =============================================================================

/// Picks and applies a compression algorithm per payload
pub struct CompressionManager {
    settings: CompressionSettings,
    noop: NoopCompressor,
    lz4: Lz4Compressor,
    zlib: ZlibCompressor,
}

impl CompressionManager {
    pub fn new() -> Self {
        Self::with_settings(CompressionSettings::default())
    }

    pub fn with_settings(settings: CompressionSettings) -> Self {
        Self {
            zlib: ZlibCompressor::with_level(settings.level),
            lz4: Lz4Compressor,
            noop: NoopCompressor,
            settings,
        }
    }

    fn compressor(&self, algorithm: CompressionAlgorithm) -> &dyn Compressor {
        match algorithm {
            CompressionAlgorithm::None => &self.noop,
            CompressionAlgorithm::Lz4 => &self.lz4,
            CompressionAlgorithm::Zlib => &self.zlib,
        }
    }

    /// Algorithm that would be tried for `data`
    pub fn choose(&self, data: &[u8]) -> CompressionAlgorithm {
        if !self.settings.enabled
            || data.len() < self.settings.min_size_bytes
            || looks_compressed(data)
        {
            CompressionAlgorithm::None
        } else if data.len() >= self.settings.large_payload_threshold {
            CompressionAlgorithm::Zlib
        } else {
            CompressionAlgorithm::Lz4
        }
    }

    /// Compress `data`, returning the bytes to store and the algorithm used.
    ///
    /// Falls back to the original bytes when compression fails or does not
    /// make the payload smaller.
    pub fn compress(&self, data: &[u8]) -> (Bytes, CompressionAlgorithm) {
        let algorithm = self.choose(data);
        if algorithm == CompressionAlgorithm::None {
            return (Bytes::copy_from_slice(data), CompressionAlgorithm::None);
        }

        match self.compressor(algorithm).compress(data) {
            Ok(compressed) if compressed.len() < data.len() => (Bytes::from(compressed), algorithm),
            Ok(_) => (Bytes::copy_from_slice(data), CompressionAlgorithm::None),
            Err(e) => {
                tracing::warn!(%algorithm, error = %e, "Compression failed, storing uncompressed");
                (Bytes::copy_from_slice(data), CompressionAlgorithm::None)
            }
        }
    }

    pub fn decompress(&self, data: &[u8], algorithm: CompressionAlgorithm) -> Result<Bytes> {
        let decompressed = self.compressor(algorithm).decompress(data)?;
        Ok(Bytes::from(decompressed))
    }

    pub fn settings(&self) -> &CompressionSettings {
        &self.settings
    }
}

impl Default for CompressionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CompressionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompressionManager")
            .field("settings", self.settings())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn compressible(len: usize) -> Vec<u8> {
        b"the quick brown fox jumps over the lazy dog "
            .iter()
            .cycle()
            .take(len)
            .copied()
            .collect()
    }

    #[test]
    fn test_lz4_roundtrip() {
        let data = compressible(4096);
        let compressed = Lz4Compressor.compress(&data).unwrap();
        assert!(compressed.len() < data.len());
        assert_eq!(Lz4Compressor.decompress(&compressed).unwrap(), data);
    }

    #[test]
    fn test_zlib_roundtrip() {
        let zlib = ZlibCompressor::with_level(6);
        let data = compressible(4096);
        let compressed = zlib.compress(&data).unwrap();
        assert!(compressed.len() < data.len());
        assert!(looks_compressed(&compressed));
        assert_eq!(zlib.decompress(&compressed).unwrap(), data);
    }

    #[test]
    fn test_small_payload_not_compressed() {
        let manager = CompressionManager::new();
        let (out, algorithm) = manager.compress(b"tiny");
        assert_eq!(algorithm, CompressionAlgorithm::None);
        assert_eq!(out.as_ref(), b"tiny");
    }

    #[test]
    fn test_algorithm_chosen_by_size() {
        let manager = CompressionManager::with_settings(CompressionSettings {
            large_payload_threshold: 8 * 1024,
            ..Default::default()
        });
        assert_eq!(manager.compress(&compressible(2048)).1, CompressionAlgorithm::Lz4);
        assert_eq!(manager.compress(&compressible(16 * 1024)).1, CompressionAlgorithm::Zlib);
    }

    #[test]
    fn test_already_compressed_skipped() {
        let manager = CompressionManager::new();
        let mut gzip_like = vec![0x1f, 0x8b];
        gzip_like.extend(compressible(4096));
        let (out, algorithm) = manager.compress(&gzip_like);
        assert_eq!(algorithm, CompressionAlgorithm::None);
        assert_eq!(out.len(), gzip_like.len());
    }

    #[test]
    fn test_incompressible_kept_raw() {
        let manager = CompressionManager::new();
        // xorshift noise does not compress
        let mut x: u64 = 0x9e3779b97f4a7c15;
        let noise: Vec<u8> = (0..4096)
            .map(|_| {
                x ^= x << 13;
                x ^= x >> 7;
                x ^= x << 17;
                (x >> 24) as u8
            })
            .collect();
        let (out, algorithm) = manager.compress(&noise);
        if algorithm == CompressionAlgorithm::None {
            assert_eq!(out.as_ref(), noise.as_slice());
        } else {
            assert!(out.len() < noise.len());
        }
    }

    #[test]
    fn test_disabled() {
        let manager = CompressionManager::with_settings(CompressionSettings {
            enabled: false,
            ..Default::default()
        });
        assert_eq!(manager.compress(&compressible(8192)).1, CompressionAlgorithm::None);
    }

    #[test]
    fn test_corrupt_input_fails() {
        let manager = CompressionManager::new();
        assert_matches!(
            manager.decompress(b"\xff\xff\xff\xffgarbage", CompressionAlgorithm::Lz4),
            Err(Error::DecompressionFailed { .. })
        );
        assert_matches!(
            manager.decompress(b"not zlib at all", CompressionAlgorithm::Zlib),
            Err(Error::DecompressionFailed { .. })
        );
        assert_matches!(CompressionAlgorithm::from_tag(9), Err(Error::Serialization(_)));
    }
}
