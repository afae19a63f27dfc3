//! QR chunk codec
//!
//! Payloads are split into chunks, each prefixed with a 16-byte header and
//! rendered as one QR code per chunk. Decoding verifies headers, reorders by
//! chunk index, requires a contiguous `0..n-1` sequence, and reverses the
//! optional gzip pass.
//!
//! # Chunk header (16 bytes, little-endian)
//!
//! ```text
//! +--------+--------------+-------------+-------+
//! | magic  | total_chunks | chunk_index | flags |
//! | "EQRC" | u32          | u32         | u32   |
//! +--------+--------------+-------------+-------+
//! ```
//!
//! Flags: bit 0 = payload is gzip-compressed, bit 1 = final chunk.
//!
//! Chunk bytes are base64-encoded into QR byte mode so the rendered symbol
//! survives text-normalizing decoders, then drawn at a fixed version so every
//! frame in a segment has identical pixel dimensions.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use qrcode::{EcLevel, QrCode, Version};

use engram_core::compress::{gunzip, gzip};
use engram_core::config::EccLevel;
use engram_core::error::{CodecErrorKind, Error, Result};

// ============================================================================
// Parameters
// ============================================================================

/// Chunk header magic
pub const CHUNK_MAGIC: [u8; 4] = *b"EQRC";

/// Chunk header size in bytes
pub const CHUNK_HEADER_SIZE: usize = 16;

/// Flag bit: chunk payload is gzip-compressed
pub const FLAG_COMPRESSED: u32 = 1;

/// Flag bit: last chunk of the payload
pub const FLAG_FINAL: u32 = 1 << 1;

/// Compression is used only when it saves at least this fraction
const COMPRESSION_THRESHOLD: f64 = 0.10;

/// QR symbol version used for every frame
///
/// Pinned to the densest version so all frames in a segment share pixel
/// dimensions, which the video encoder requires.
const QR_VERSION: i16 = 40;

/// Modules per side at version 40
const QR_MODULES: u32 = 177;

/// Rendered pixels per module
const MODULE_SCALE: u32 = 4;

/// Quiet-zone width in modules on each side
const QUIET_MODULES: u32 = 4;

/// Pixel width and height of every rendered frame
pub const FRAME_DIM: u32 = (QR_MODULES + 2 * QUIET_MODULES) * MODULE_SCALE;

/// Density table: byte-mode capacity of a version-40 symbol per ECC level
///
/// The usable binary budget per chunk is this capacity shrunk by the base64
/// expansion, minus the header.
pub fn symbol_capacity(ecc: EccLevel) -> usize {
    match ecc {
        EccLevel::L => 2953,
        EccLevel::M => 2331,
        EccLevel::Q => 1663,
        EccLevel::H => 1273,
    }
}

/// Maximum chunk payload bytes (after the header) for an ECC level
pub fn chunk_capacity(ecc: EccLevel) -> usize {
    // base64 emits 4 chars per 3 input bytes
    let max_binary = symbol_capacity(ecc) / 4 * 3;
    max_binary - CHUNK_HEADER_SIZE
}

fn ec_level(ecc: EccLevel) -> EcLevel {
    match ecc {
        EccLevel::L => EcLevel::L,
        EccLevel::M => EcLevel::M,
        EccLevel::Q => EcLevel::Q,
        EccLevel::H => EcLevel::H,
    }
}

// ============================================================================
// Chunk header
// ============================================================================

/// Parsed 16-byte chunk header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub total_chunks: u32,
    pub chunk_index: u32,
    pub flags: u32,
}

impl ChunkHeader {
    pub fn compressed(&self) -> bool {
        self.flags & FLAG_COMPRESSED != 0
    }

    pub fn is_final(&self) -> bool {
        self.flags & FLAG_FINAL != 0
    }

    pub fn to_bytes(&self) -> [u8; CHUNK_HEADER_SIZE] {
        let mut bytes = [0u8; CHUNK_HEADER_SIZE];
        bytes[0..4].copy_from_slice(&CHUNK_MAGIC);
        bytes[4..8].copy_from_slice(&self.total_chunks.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.chunk_index.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.flags.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < CHUNK_HEADER_SIZE {
            return Err(Error::codec(
                CodecErrorKind::HeaderInvalid,
                format!("chunk shorter than header: {} bytes", bytes.len()),
            ));
        }
        if bytes[0..4] != CHUNK_MAGIC {
            return Err(Error::codec(
                CodecErrorKind::HeaderInvalid,
                format!("bad magic {:02x?}", &bytes[0..4]),
            ));
        }
        let header = ChunkHeader {
            total_chunks: u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
            chunk_index: u32::from_le_bytes(bytes[8..12].try_into().unwrap()),
            flags: u32::from_le_bytes(bytes[12..16].try_into().unwrap()),
        };
        if header.total_chunks == 0 || header.chunk_index >= header.total_chunks {
            return Err(Error::codec(
                CodecErrorKind::HeaderInvalid,
                format!(
                    "chunk index {} out of range for {} chunks",
                    header.chunk_index, header.total_chunks
                ),
            ));
        }
        Ok(header)
    }
}

/// Chunk metadata carried alongside a rendered frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkMeta {
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub compressed: bool,
    /// Payload bytes in this chunk, header excluded
    pub payload_len: u32,
}

/// One rendered QR frame: RGBA pixels plus its chunk metadata
#[derive(Debug, Clone)]
pub struct QrFrame {
    pub rgba: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub meta: ChunkMeta,
}

// ============================================================================
// Encode
// ============================================================================

/// Encode a payload into an ordered sequence of QR frames
///
/// The payload is gzip-compressed first when that saves at least 10%, then
/// split into chunks of at most `chunk_capacity(ecc)` bytes.
pub fn encode(bytes: &[u8], ecc: EccLevel) -> Result<Vec<QrFrame>> {
    if bytes.is_empty() {
        return Err(Error::InvalidInput("cannot QR-encode an empty payload".into()));
    }
    let packed = gzip(bytes)?;
    let use_compression =
        (packed.len() as f64) <= (bytes.len() as f64) * (1.0 - COMPRESSION_THRESHOLD);
    let (payload, base_flags) = if use_compression {
        (packed, FLAG_COMPRESSED)
    } else {
        (bytes.to_vec(), 0)
    };

    let capacity = chunk_capacity(ecc);
    let total_chunks = payload.len().div_ceil(capacity) as u32;
    let mut frames = Vec::with_capacity(total_chunks as usize);
    for (index, chunk) in payload.chunks(capacity).enumerate() {
        let index = index as u32;
        let mut flags = base_flags;
        if index + 1 == total_chunks {
            flags |= FLAG_FINAL;
        }
        let header = ChunkHeader {
            total_chunks,
            chunk_index: index,
            flags,
        };
        let mut packet = Vec::with_capacity(CHUNK_HEADER_SIZE + chunk.len());
        packet.extend_from_slice(&header.to_bytes());
        packet.extend_from_slice(chunk);

        let rgba = render(&packet, ecc)?;
        frames.push(QrFrame {
            rgba,
            width: FRAME_DIM,
            height: FRAME_DIM,
            meta: ChunkMeta {
                chunk_index: index,
                total_chunks,
                compressed: use_compression,
                payload_len: chunk.len() as u32,
            },
        });
    }
    Ok(frames)
}

fn render(packet: &[u8], ecc: EccLevel) -> Result<Vec<u8>> {
    let encoded = BASE64.encode(packet);
    let code = QrCode::with_version(
        encoded.as_bytes(),
        Version::Normal(QR_VERSION),
        ec_level(ecc),
    )
    .map_err(|e| Error::codec(CodecErrorKind::ChunkCorrupt, format!("qr render: {e}")))?;

    let modules = code.width() as u32;
    let colors = code.to_colors();
    let dim = FRAME_DIM;
    // White canvas, dark modules drawn over it
    let mut rgba = vec![0xffu8; (dim * dim * 4) as usize];
    for my in 0..modules {
        for mx in 0..modules {
            if colors[(my * modules + mx) as usize] == qrcode::Color::Dark {
                let px0 = (QUIET_MODULES + mx) * MODULE_SCALE;
                let py0 = (QUIET_MODULES + my) * MODULE_SCALE;
                for py in py0..py0 + MODULE_SCALE {
                    for px in px0..px0 + MODULE_SCALE {
                        let at = ((py * dim + px) * 4) as usize;
                        rgba[at] = 0;
                        rgba[at + 1] = 0;
                        rgba[at + 2] = 0;
                        // alpha stays 0xff
                    }
                }
            }
        }
    }
    Ok(rgba)
}

// ============================================================================
// Decode
// ============================================================================

/// Raw pixel frame handed back from the video layer for decoding
#[derive(Debug, Clone)]
pub struct RgbaFrame {
    pub rgba: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl From<&QrFrame> for RgbaFrame {
    fn from(frame: &QrFrame) -> Self {
        RgbaFrame {
            rgba: frame.rgba.clone(),
            width: frame.width,
            height: frame.height,
        }
    }
}

/// Decode an unordered set of frames back into the original payload
///
/// Frames are scanned, headers verified, chunks reordered by index. Any gap
/// in `0..total_chunks` fails with `CodecError(ChunkMissing)`; a frame whose
/// symbol cannot be read fails with `CodecError(ChunkCorrupt)`.
pub fn decode(frames: &[RgbaFrame]) -> Result<Vec<u8>> {
    if frames.is_empty() {
        return Err(Error::codec(CodecErrorKind::ChunkMissing, "no frames"));
    }

    let mut chunks: Vec<Option<(ChunkHeader, Vec<u8>)>> = Vec::new();
    let mut expected_total: Option<u32> = None;

    for (i, frame) in frames.iter().enumerate() {
        let packet = scan(frame)
            .map_err(|e| match e {
                Error::Codec { .. } => e,
                other => Error::codec(
                    CodecErrorKind::ChunkCorrupt,
                    format!("frame {i}: {other}"),
                ),
            })?;
        let header = ChunkHeader::from_bytes(&packet)?;
        let total = *expected_total.get_or_insert(header.total_chunks);
        if header.total_chunks != total {
            return Err(Error::codec(
                CodecErrorKind::HeaderInvalid,
                format!(
                    "frame {i} claims {} chunks, previous frames claimed {total}",
                    header.total_chunks
                ),
            ));
        }
        chunks.resize(total as usize, None);
        let body = packet[CHUNK_HEADER_SIZE..].to_vec();
        chunks[header.chunk_index as usize] = Some((header, body));
    }

    let mut payload = Vec::new();
    let mut compressed = false;
    let total = chunks.len();
    for (index, slot) in chunks.into_iter().enumerate() {
        let (header, body) = slot.ok_or_else(|| {
            Error::codec(
                CodecErrorKind::ChunkMissing,
                format!("chunk {index} of {total} never decoded"),
            )
        })?;
        if index + 1 == total && !header.is_final() {
            return Err(Error::codec(
                CodecErrorKind::HeaderInvalid,
                "last chunk is not flagged final",
            ));
        }
        compressed = header.compressed();
        payload.extend_from_slice(&body);
    }

    if compressed {
        gunzip(&payload)
    } else {
        Ok(payload)
    }
}

/// Scan a single frame and return its parsed header and chunk body
///
/// Used by decode and by integrity checks that need to inspect one frame
/// without reassembling the whole payload.
pub fn scan_frame(frame: &RgbaFrame) -> Result<(ChunkHeader, Vec<u8>)> {
    let packet = scan(frame)?;
    let header = ChunkHeader::from_bytes(&packet)?;
    Ok((header, packet[CHUNK_HEADER_SIZE..].to_vec()))
}

fn scan(frame: &RgbaFrame) -> Result<Vec<u8>> {
    let expected = (frame.width * frame.height * 4) as usize;
    if frame.rgba.len() != expected {
        return Err(Error::codec(
            CodecErrorKind::ChunkCorrupt,
            format!(
                "frame buffer is {} bytes, expected {expected} for {}x{}",
                frame.rgba.len(),
                frame.width,
                frame.height
            ),
        ));
    }
    let (w, h) = (frame.width as usize, frame.height as usize);
    let luma: Vec<u8> = frame
        .rgba
        .chunks_exact(4)
        .map(|px| {
            // ITU-R BT.601 luma, integer arithmetic
            ((77 * px[0] as u32 + 150 * px[1] as u32 + 29 * px[2] as u32) >> 8) as u8
        })
        .collect();
    let mut prepared =
        rqrr::PreparedImage::prepare_from_greyscale(w, h, |x, y| luma[y * w + x]);
    let grids = prepared.detect_grids();
    let grid = grids.first().ok_or_else(|| {
        Error::codec(CodecErrorKind::ChunkCorrupt, "no QR symbol detected in frame")
    })?;
    let (_, text) = grid
        .decode()
        .map_err(|e| Error::codec(CodecErrorKind::ChunkCorrupt, format!("qr decode: {e}")))?;
    BASE64
        .decode(text.as_bytes())
        .map_err(|e| Error::codec(CodecErrorKind::ChunkCorrupt, format!("base64: {e}")))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn as_rgba(frames: &[QrFrame]) -> Vec<RgbaFrame> {
        frames.iter().map(RgbaFrame::from).collect()
    }

    #[test]
    fn test_roundtrip_small_payload() {
        let payload = b"{\"title\":\"Debounce\",\"code\":\"function debounce(f,w){}\"}";
        let frames = encode(payload, EccLevel::M).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].width, FRAME_DIM);
        assert_eq!(decode(&as_rgba(&frames)).unwrap(), payload);
    }

    #[test]
    fn test_roundtrip_multi_chunk() {
        // Random bytes resist compression, forcing multiple chunks
        let payload: Vec<u8> = (0..5000u32).map(|i| (i.wrapping_mul(2654435761) >> 13) as u8).collect();
        let frames = encode(&payload, EccLevel::M).unwrap();
        assert!(frames.len() > 1, "expected multiple chunks, got {}", frames.len());
        assert_eq!(decode(&as_rgba(&frames)).unwrap(), payload);
    }

    #[test]
    fn test_roundtrip_out_of_order_frames() {
        let payload: Vec<u8> = (0..4000u32).map(|i| (i * 7 % 251) as u8).collect();
        let frames = encode(&payload, EccLevel::M).unwrap();
        let mut shuffled = as_rgba(&frames);
        shuffled.reverse();
        assert_eq!(decode(&shuffled).unwrap(), payload);
    }

    #[test]
    fn test_compressible_payload_uses_fewer_chunks() {
        let compressible = vec![b'a'; 20_000];
        let frames = encode(&compressible, EccLevel::M).unwrap();
        assert!(frames[0].meta.compressed);
        // 20 kB of 'a' gzips to well under one chunk
        assert_eq!(frames.len(), 1);
        assert_eq!(decode(&as_rgba(&frames)).unwrap(), compressible);
    }

    #[test]
    fn test_missing_chunk_detected() {
        let payload: Vec<u8> = (0..5000u32).map(|i| (i.wrapping_mul(40503) >> 7) as u8).collect();
        let frames = encode(&payload, EccLevel::M).unwrap();
        assert!(frames.len() >= 2);
        let partial = as_rgba(&frames[1..]);
        let err = decode(&partial).unwrap_err();
        assert!(matches!(
            err,
            Error::Codec {
                kind: CodecErrorKind::ChunkMissing,
                ..
            }
        ));
    }

    #[test]
    fn test_corrupt_frame_detected() {
        let frames = encode(b"hello memory store", EccLevel::M).unwrap();
        let mut rgba = as_rgba(&frames);
        // Blank out the symbol entirely
        rgba[0].rgba.iter_mut().for_each(|b| *b = 0x80);
        let err = decode(&rgba).unwrap_err();
        assert!(matches!(
            err,
            Error::Codec {
                kind: CodecErrorKind::ChunkCorrupt,
                ..
            }
        ));
    }

    #[test]
    fn test_header_rejects_bad_magic() {
        let mut bytes = ChunkHeader {
            total_chunks: 1,
            chunk_index: 0,
            flags: FLAG_FINAL,
        }
        .to_bytes();
        bytes[0] = b'X';
        let err = ChunkHeader::from_bytes(&bytes).unwrap_err();
        assert!(matches!(
            err,
            Error::Codec {
                kind: CodecErrorKind::HeaderInvalid,
                ..
            }
        ));
    }

    #[test]
    fn test_header_rejects_index_out_of_range() {
        let bytes = ChunkHeader {
            total_chunks: 2,
            chunk_index: 2,
            flags: 0,
        }
        .to_bytes();
        assert!(ChunkHeader::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_chunk_capacity_per_ecc() {
        assert!(chunk_capacity(EccLevel::L) > chunk_capacity(EccLevel::M));
        assert!(chunk_capacity(EccLevel::M) > chunk_capacity(EccLevel::Q));
        assert!(chunk_capacity(EccLevel::Q) > chunk_capacity(EccLevel::H));
        // Fits in a symbol after base64 expansion
        let max_packet = chunk_capacity(EccLevel::M) + CHUNK_HEADER_SIZE;
        assert!(max_packet.div_ceil(3) * 4 <= symbol_capacity(EccLevel::M));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(8))]
        #[test]
        fn test_header_roundtrip(total in 1u32..1000, flags in 0u32..4) {
            let index = total - 1;
            let header = ChunkHeader { total_chunks: total, chunk_index: index, flags };
            let back = ChunkHeader::from_bytes(&header.to_bytes()).unwrap();
            prop_assert_eq!(header, back);
        }
    }
}
