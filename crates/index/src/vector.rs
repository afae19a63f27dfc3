//! Dense cosine vector index
//!
//! Optional per-scope index of fixed-dimension f32 embeddings. The
//! dimension is pinned by the first inserted vector and enforced on every
//! later insert and query (`DimensionMismatch` otherwise). Search is
//! brute-force cosine over a `BTreeMap`, which is exact, deterministic
//! (ties break by ascending id), and fast enough below ~100k vectors.
//!
//! # `vectors.bin` layout (little-endian)
//!
//! ```text
//! magic "EVEC" | version u32 | dim u32 | count u32
//! then per record: id [u8; 26] | dim * f32
//! ```

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use tracing::debug;

use engram_core::error::{Error, Result};
use engram_core::types::MemoryId;

/// Index file magic
pub const VEC_MAGIC: [u8; 4] = *b"EVEC";

/// Format version
pub const VEC_VERSION: u32 = 1;

/// Ulid length: ids are stored fixed-width
const ID_LEN: usize = 26;

#[derive(Debug, Default)]
struct VecState {
    dim: Option<usize>,
    vectors: BTreeMap<MemoryId, Vec<f32>>,
}

/// Cosine similarity index for one scope
#[derive(Debug, Default)]
pub struct VectorIndex {
    state: RwLock<VecState>,
}

impl VectorIndex {
    pub fn new() -> Self {
        VectorIndex::default()
    }

    /// Load from `vectors.bin`; a missing file yields an empty index
    pub fn open(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(VectorIndex::new());
        }
        let mut reader = BufReader::new(std::fs::File::open(path)?);
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if magic != VEC_MAGIC {
            return Err(Error::Integrity(format!(
                "{}: bad vector index magic {magic:02x?}",
                path.display()
            )));
        }
        let version = reader.read_u32::<LittleEndian>()?;
        if version != VEC_VERSION {
            return Err(Error::Integrity(format!(
                "{}: unsupported vector index version {version}",
                path.display()
            )));
        }
        let dim = reader.read_u32::<LittleEndian>()? as usize;
        let count = reader.read_u32::<LittleEndian>()? as usize;

        let mut vectors = BTreeMap::new();
        for _ in 0..count {
            let mut id_bytes = [0u8; ID_LEN];
            reader.read_exact(&mut id_bytes)?;
            let id = MemoryId::parse(
                std::str::from_utf8(&id_bytes)
                    .map_err(|e| Error::Integrity(format!("vector index id: {e}")))?,
            )?;
            let mut vector = Vec::with_capacity(dim);
            for _ in 0..dim {
                vector.push(reader.read_f32::<LittleEndian>()?);
            }
            vectors.insert(id, vector);
        }
        Ok(VectorIndex {
            state: RwLock::new(VecState {
                dim: if count > 0 { Some(dim) } else { None },
                vectors,
            }),
        })
    }

    /// Persist to `vectors.bin` (write to a sibling, fsync, rename)
    pub fn save(&self, path: &Path) -> Result<()> {
        let state = self.state.read();
        let dim = state.dim.unwrap_or(0);
        let staging = path.with_extension("bin.new");
        {
            let mut out = BufWriter::new(std::fs::File::create(&staging)?);
            out.write_all(&VEC_MAGIC)?;
            out.write_u32::<LittleEndian>(VEC_VERSION)?;
            out.write_u32::<LittleEndian>(dim as u32)?;
            out.write_u32::<LittleEndian>(state.vectors.len() as u32)?;
            for (id, vector) in &state.vectors {
                out.write_all(id.as_str().as_bytes())?;
                for &value in vector {
                    out.write_f32::<LittleEndian>(value)?;
                }
            }
            let file = out
                .into_inner()
                .map_err(|e| Error::Store(format!("flushing vector index: {e}")))?;
            file.sync_all()?;
        }
        std::fs::rename(&staging, path)?;
        debug!(count = state.vectors.len(), dim, "saved vector index");
        Ok(())
    }

    /// Insert or replace a vector
    ///
    /// The first insert pins the index dimension.
    pub fn set(&self, id: MemoryId, vector: Vec<f32>) -> Result<()> {
        if vector.is_empty() {
            return Err(Error::InvalidInput("empty vector".into()));
        }
        let mut state = self.state.write();
        match state.dim {
            None => state.dim = Some(vector.len()),
            Some(dim) if dim != vector.len() => {
                return Err(Error::DimensionMismatch {
                    expected: dim,
                    actual: vector.len(),
                })
            }
            Some(_) => {}
        }
        state.vectors.insert(id, vector);
        Ok(())
    }

    pub fn remove(&self, id: &MemoryId) -> bool {
        let mut state = self.state.write();
        let removed = state.vectors.remove(id).is_some();
        if state.vectors.is_empty() {
            state.dim = None;
        }
        removed
    }

    pub fn contains(&self, id: &MemoryId) -> bool {
        self.state.read().vectors.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.state.read().vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().vectors.is_empty()
    }

    pub fn dimension(&self) -> Option<usize> {
        self.state.read().dim
    }

    /// Every id with a stored vector, sorted
    pub fn ids(&self) -> Vec<MemoryId> {
        self.state.read().vectors.keys().cloned().collect()
    }

    /// Bulk import of (id, vector) pairs
    pub fn import_bulk(&self, pairs: Vec<(MemoryId, Vec<f32>)>) -> Result<usize> {
        let mut imported = 0;
        for (id, vector) in pairs {
            self.set(id, vector)?;
            imported += 1;
        }
        Ok(imported)
    }

    /// Import newline-delimited JSON records `{"id": ..., "vector": [...]}`
    pub fn import_jsonl<R: std::io::BufRead>(&self, reader: R) -> Result<usize> {
        #[derive(serde::Deserialize)]
        struct Record {
            id: String,
            vector: Vec<f32>,
        }
        let mut imported = 0;
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record: Record = serde_json::from_str(&line)?;
            self.set(MemoryId::parse(record.id)?, record.vector)?;
            imported += 1;
        }
        Ok(imported)
    }

    /// Cosine similarity between the query and one stored vector
    pub fn similarity(&self, id: &MemoryId, query: &[f32]) -> Result<Option<f32>> {
        let state = self.state.read();
        let Some(dim) = state.dim else {
            return Ok(None);
        };
        if query.len() != dim {
            return Err(Error::DimensionMismatch {
                expected: dim,
                actual: query.len(),
            });
        }
        Ok(state.vectors.get(id).map(|v| cosine(query, v)))
    }

    /// Top-k by cosine similarity, ties broken by ascending id
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<(MemoryId, f32)>> {
        let state = self.state.read();
        let Some(dim) = state.dim else {
            return Ok(Vec::new());
        };
        if query.len() != dim {
            return Err(Error::DimensionMismatch {
                expected: dim,
                actual: query.len(),
            });
        }
        let mut scored: Vec<(MemoryId, f32)> = state
            .vectors
            .iter()
            .map(|(id, vector)| (id.clone(), cosine(query, vector)))
            .collect();
        // Stable ordering: score descending, then id ascending. The map
        // already iterates by id, so the sort's stability settles ties.
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored)
    }
}

/// Cosine similarity; zero vectors score 0
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn id(n: u8) -> MemoryId {
        MemoryId::parse(format!("01DRZ3NDEKTSV4RRFFQ69G5F{n:02}")).unwrap()
    }

    #[test]
    fn test_first_insert_pins_dimension() {
        let index = VectorIndex::new();
        index.set(id(1), vec![1.0, 0.0, 0.0]).unwrap();
        assert_eq!(index.dimension(), Some(3));

        let err = index.set(id(2), vec![1.0, 0.0]).unwrap_err();
        assert!(matches!(
            err,
            Error::DimensionMismatch {
                expected: 3,
                actual: 2
            }
        ));
    }

    #[test]
    fn test_search_ranks_by_cosine() {
        let index = VectorIndex::new();
        index.set(id(1), vec![1.0, 0.0]).unwrap();
        index.set(id(2), vec![0.0, 1.0]).unwrap();
        index.set(id(3), vec![0.7, 0.7]).unwrap();

        let results = index.search(&[1.0, 0.0], 3).unwrap();
        assert_eq!(results[0].0, id(1));
        assert!((results[0].1 - 1.0).abs() < 1e-6);
        assert_eq!(results[1].0, id(3));
        assert_eq!(results[2].0, id(2));
    }

    #[test]
    fn test_ties_break_by_id_ascending() {
        let index = VectorIndex::new();
        index.set(id(3), vec![1.0, 0.0]).unwrap();
        index.set(id(1), vec![1.0, 0.0]).unwrap();
        index.set(id(2), vec![1.0, 0.0]).unwrap();

        let results = index.search(&[1.0, 0.0], 3).unwrap();
        let ids: Vec<_> = results.into_iter().map(|(i, _)| i).collect();
        assert_eq!(ids, vec![id(1), id(2), id(3)]);
    }

    #[test]
    fn test_query_dimension_enforced() {
        let index = VectorIndex::new();
        index.set(id(1), vec![1.0, 0.0, 0.0, 0.0]).unwrap();
        assert!(index.search(&[1.0], 1).is_err());
    }

    #[test]
    fn test_empty_index_searches_empty() {
        let index = VectorIndex::new();
        assert!(index.search(&[1.0, 2.0], 5).unwrap().is_empty());
    }

    #[test]
    fn test_save_open_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vectors.bin");

        let index = VectorIndex::new();
        index.set(id(1), vec![0.25, -1.5, 3.0]).unwrap();
        index.set(id(2), vec![1.0, 2.0, 3.0]).unwrap();
        index.save(&path).unwrap();

        let reopened = VectorIndex::open(&path).unwrap();
        assert_eq!(reopened.len(), 2);
        assert_eq!(reopened.dimension(), Some(3));
        let results = reopened.search(&[0.25, -1.5, 3.0], 1).unwrap();
        assert_eq!(results[0].0, id(1));
    }

    #[test]
    fn test_open_rejects_bad_magic() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vectors.bin");
        std::fs::write(&path, b"NOPE0000").unwrap();
        assert!(VectorIndex::open(&path).is_err());
    }

    #[test]
    fn test_import_jsonl() {
        let index = VectorIndex::new();
        let input = format!(
            "{}\n\n{}\n",
            serde_json::json!({"id": id(1).as_str(), "vector": [1.0, 0.0]}),
            serde_json::json!({"id": id(2).as_str(), "vector": [0.0, 1.0]}),
        );
        let imported = index.import_jsonl(std::io::Cursor::new(input)).unwrap();
        assert_eq!(imported, 2);
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn test_remove_last_vector_unpins_dimension() {
        let index = VectorIndex::new();
        index.set(id(1), vec![1.0]).unwrap();
        assert!(index.remove(&id(1)));
        assert_eq!(index.dimension(), None);
        // A different dimension is now acceptable
        index.set(id(2), vec![1.0, 2.0]).unwrap();
    }

    #[test]
    fn test_cosine_zero_vector() {
        assert_eq!(cosine(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }
}
