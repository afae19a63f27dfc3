//! Binary frame index (`.mvi`)
//!
//! Fixed-format, little-endian, memory-mappable index from frame number to
//! byte position and timing inside a video segment. Lookup is a binary
//! search over the sorted entry array, O(log n) worst case.
//!
//! # File layout
//!
//! ```text
//! +---------------------+ 0
//! | Header              | 32 bytes
//! |  magic "MVIX"       |
//! |  version u32 (=1)   |
//! |  frame_count u32    |
//! |  reserved [u8; 20]  |
//! +---------------------+ 32
//! | Entry 0             | 24 bytes each
//! |  frame_number  u32  |
//! |  byte_offset   u64  |
//! |  frame_size    u32  |
//! |  timestamp_ms  u32  |
//! |  type_and_flags u32 |
//! +---------------------+
//! | ...                 |
//! +---------------------+ 32 + 24 * frame_count
//! ```
//!
//! Entries MUST be strictly monotonic in `frame_number`.
//! `type_and_flags` packs the frame type in bits 8..32 and flags in bits
//! 0..8; bit 0 marks a keyframe.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use memmap2::Mmap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use engram_core::error::{Error, Result};

/// Index file magic
pub const MVI_MAGIC: [u8; 4] = *b"MVIX";

/// Format version
pub const MVI_VERSION: u32 = 1;

/// Header size in bytes
pub const MVI_HEADER_SIZE: usize = 32;

/// Entry size in bytes
pub const MVI_ENTRY_SIZE: usize = 24;

/// Flag bit: entry is a keyframe
pub const FLAG_KEYFRAME: u32 = 1;

/// Frame content type, stored in bits 8..32 of `type_and_flags`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameType {
    /// Carries QR payload chunks
    #[default]
    Content = 0,
    /// Reserved padding frame (end-of-segment alignment)
    Padding = 1,
}

impl FrameType {
    fn from_tag(tag: u32) -> Self {
        match tag {
            1 => FrameType::Padding,
            _ => FrameType::Content,
        }
    }
}

/// One 24-byte index entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameIndexEntry {
    pub frame_number: u32,
    pub byte_offset: u64,
    pub frame_size: u32,
    pub timestamp_ms: u32,
    pub type_and_flags: u32,
}

impl FrameIndexEntry {
    /// Build an entry from its parts
    pub fn new(
        frame_number: u32,
        byte_offset: u64,
        frame_size: u32,
        timestamp_ms: u32,
        frame_type: FrameType,
        keyframe: bool,
    ) -> Self {
        let mut type_and_flags = (frame_type as u32) << 8;
        if keyframe {
            type_and_flags |= FLAG_KEYFRAME;
        }
        FrameIndexEntry {
            frame_number,
            byte_offset,
            frame_size,
            timestamp_ms,
            type_and_flags,
        }
    }

    pub fn is_keyframe(&self) -> bool {
        self.type_and_flags & FLAG_KEYFRAME != 0
    }

    pub fn frame_type(&self) -> FrameType {
        FrameType::from_tag(self.type_and_flags >> 8)
    }
}

// ============================================================================
// Write
// ============================================================================

/// Write a complete index file
///
/// Entries must already be strictly monotonic by frame number; the writer
/// refuses otherwise rather than producing an index `validate` would reject.
/// The file and its data are fsynced before return; atomicity (tmp+rename)
/// is the caller's concern.
pub fn write(entries: &[FrameIndexEntry], path: &Path) -> Result<()> {
    check_monotonic(entries)?;
    let file = File::create(path)?;
    let mut out = BufWriter::new(file);

    out.write_all(&MVI_MAGIC)?;
    out.write_u32::<LittleEndian>(MVI_VERSION)?;
    out.write_u32::<LittleEndian>(entries.len() as u32)?;
    out.write_all(&[0u8; 20])?;

    for entry in entries {
        out.write_u32::<LittleEndian>(entry.frame_number)?;
        out.write_u64::<LittleEndian>(entry.byte_offset)?;
        out.write_u32::<LittleEndian>(entry.frame_size)?;
        out.write_u32::<LittleEndian>(entry.timestamp_ms)?;
        out.write_u32::<LittleEndian>(entry.type_and_flags)?;
    }

    let file = out
        .into_inner()
        .map_err(|e| Error::Store(format!("flushing frame index: {e}")))?;
    file.sync_all()?;
    Ok(())
}

fn check_monotonic(entries: &[FrameIndexEntry]) -> Result<()> {
    for window in entries.windows(2) {
        if window[1].frame_number <= window[0].frame_number {
            return Err(Error::Store(format!(
                "frame index not monotonic: {} then {}",
                window[0].frame_number, window[1].frame_number
            )));
        }
    }
    Ok(())
}

// ============================================================================
// Read
// ============================================================================

/// Read-only handle over a memory-mapped index file
pub struct FrameIndexView {
    mmap: Mmap,
    frame_count: u32,
    /// Frame numbers of keyframe entries, sorted (built once at open)
    keyframes: Vec<u32>,
}

impl FrameIndexView {
    /// Open and validate an index file for reading
    pub fn open_read(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        // Safety: the file is written atomically via tmp+rename and never
        // modified in place afterwards, so the mapping is stable.
        let mmap = unsafe { Mmap::map(&file)? };
        let frame_count = validate_bytes(&mmap, path)?;

        let mut keyframes = Vec::new();
        for i in 0..frame_count {
            let entry = read_entry(&mmap, i as usize);
            if entry.is_keyframe() {
                keyframes.push(entry.frame_number);
            }
        }
        Ok(FrameIndexView {
            mmap,
            frame_count,
            keyframes,
        })
    }

    pub fn frame_count(&self) -> u32 {
        self.frame_count
    }

    /// Look up an entry by frame number; `None` when absent
    ///
    /// Binary search over the sorted entry array.
    pub fn get_frame(&self, frame_number: u32) -> Option<FrameIndexEntry> {
        let mut lo = 0usize;
        let mut hi = self.frame_count as usize;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let entry = read_entry(&self.mmap, mid);
            match entry.frame_number.cmp(&frame_number) {
                std::cmp::Ordering::Equal => return Some(entry),
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
            }
        }
        None
    }

    /// Largest keyframe number `m <= frame_number`, with its entry
    pub fn find_nearest_keyframe(&self, frame_number: u32) -> Option<FrameIndexEntry> {
        let at = self.keyframes.partition_point(|&k| k <= frame_number);
        if at == 0 {
            return None;
        }
        self.get_frame(self.keyframes[at - 1])
    }

    /// Iterate every entry in order
    pub fn entries(&self) -> impl Iterator<Item = FrameIndexEntry> + '_ {
        (0..self.frame_count as usize).map(|i| read_entry(&self.mmap, i))
    }
}

fn read_entry(bytes: &[u8], index: usize) -> FrameIndexEntry {
    let mut at = &bytes[MVI_HEADER_SIZE + index * MVI_ENTRY_SIZE..];
    // Reads cannot fail: validate_bytes checked the length
    FrameIndexEntry {
        frame_number: at.read_u32::<LittleEndian>().unwrap(),
        byte_offset: at.read_u64::<LittleEndian>().unwrap(),
        frame_size: at.read_u32::<LittleEndian>().unwrap(),
        timestamp_ms: at.read_u32::<LittleEndian>().unwrap(),
        type_and_flags: at.read_u32::<LittleEndian>().unwrap(),
    }
}

// ============================================================================
// Validate
// ============================================================================

/// Verify magic, version, monotonicity, and size agreement
pub fn validate(path: &Path) -> Result<u32> {
    let bytes = std::fs::read(path)?;
    let frame_count = validate_bytes(&bytes, path)?;
    let mut prev: Option<u32> = None;
    for i in 0..frame_count as usize {
        let entry = read_entry(&bytes, i);
        if let Some(p) = prev {
            if entry.frame_number <= p {
                return Err(Error::Integrity(format!(
                    "{}: frame numbers not monotonic at entry {i}",
                    path.display()
                )));
            }
        }
        prev = Some(entry.frame_number);
    }
    Ok(frame_count)
}

fn validate_bytes(bytes: &[u8], path: &Path) -> Result<u32> {
    if bytes.len() < MVI_HEADER_SIZE {
        return Err(Error::Integrity(format!(
            "{}: truncated header ({} bytes)",
            path.display(),
            bytes.len()
        )));
    }
    if bytes[0..4] != MVI_MAGIC {
        return Err(Error::Integrity(format!(
            "{}: bad magic {:02x?}",
            path.display(),
            &bytes[0..4]
        )));
    }
    let version = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
    if version != MVI_VERSION {
        return Err(Error::Integrity(format!(
            "{}: unsupported version {version}",
            path.display()
        )));
    }
    let frame_count = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
    let expected = MVI_HEADER_SIZE + frame_count as usize * MVI_ENTRY_SIZE;
    if bytes.len() != expected {
        return Err(Error::Integrity(format!(
            "{}: declared {frame_count} frames ({expected} bytes) but file is {} bytes",
            path.display(),
            bytes.len()
        )));
    }
    Ok(frame_count)
}

// ============================================================================
// Tests
// ============================================================================
