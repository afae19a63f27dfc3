//! Gzip helpers used by the QR codec and payload paths

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};

use crate::error::{Error, Result};

/// Gzip-compress bytes at the default level
pub fn gzip(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    Ok(encoder.finish()?)
}

/// Decompress a gzip stream
pub fn gunzip(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(bytes);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| Error::Decode(format!("gunzip failed: {e}")))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let data = b"the quick brown fox jumps over the lazy dog".repeat(10);
        let packed = gzip(&data).unwrap();
        assert!(packed.len() < data.len());
        assert_eq!(gunzip(&packed).unwrap(), data);
    }

    #[test]
    fn test_gunzip_rejects_garbage() {
        assert!(gunzip(b"definitely not gzip").is_err());
    }

    #[test]
    fn test_empty_roundtrip() {
        let packed = gzip(b"").unwrap();
        assert_eq!(gunzip(&packed).unwrap(), Vec::<u8>::new());
    }
}
