//! Monotonic ULID generation
//!
//! Ids are 26-character Crockford base32 ULIDs: a 48-bit millisecond time
//! prefix followed by 80 random bits. Within a single millisecond the
//! generator increments the random tail instead of re-rolling it, so ids
//! remain strictly lexicographically ordered even under bursts.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use ulid::Generator;

use crate::error::{Error, Result};
use crate::types::MemoryId;

/// Rollover-safe ULID source
///
/// One generator per process context; cheap to share behind the mutex since
/// generation is a few arithmetic operations.
pub struct IdGenerator {
    inner: Mutex<Generator>,
}

impl IdGenerator {
    pub fn new() -> Self {
        IdGenerator {
            inner: Mutex::new(Generator::new()),
        }
    }

    /// Generate the next id for the current wall-clock time
    ///
    /// Fails only on random-tail overflow within one millisecond, which
    /// requires 2^80 ids in 1 ms.
    pub fn next(&self) -> Result<MemoryId> {
        let ulid = self
            .inner
            .lock()
            .generate()
            .map_err(|e| Error::Store(format!("ulid generation overflow: {e}")))?;
        Ok(MemoryId::from_generated(ulid.to_string()))
    }

    /// Generate an id for an explicit timestamp (used by tests and replay)
    pub fn next_at(&self, ts: DateTime<Utc>) -> Result<MemoryId> {
        let ulid = self
            .inner
            .lock()
            .generate_from_datetime(ts.into())
            .map_err(|e| Error::Store(format!("ulid generation overflow: {e}")))?;
        Ok(MemoryId::from_generated(ulid.to_string()))
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_valid() {
        let gen = IdGenerator::new();
        let id = gen.next().unwrap();
        assert_eq!(id.as_str().len(), 26);
        assert!(MemoryId::parse(id.as_str()).is_ok());
    }

    #[test]
    fn test_ids_are_lexicographically_ordered() {
        let gen = IdGenerator::new();
        let mut prev = gen.next().unwrap();
        for _ in 0..1000 {
            let next = gen.next().unwrap();
            assert!(next > prev, "{next} should sort after {prev}");
            prev = next;
        }
    }

    #[test]
    fn test_same_millisecond_increments_tail() {
        let gen = IdGenerator::new();
        let ts = Utc::now();
        let a = gen.next_at(ts).unwrap();
        let b = gen.next_at(ts).unwrap();
        // Same millisecond prefix, strictly larger tail
        assert_eq!(a.as_str()[..10], b.as_str()[..10]);
        assert!(b > a);
    }
}
