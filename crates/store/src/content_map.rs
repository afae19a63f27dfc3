//! Content hash map: content hash → payload location
//!
//! Enforces at-most-one encoded copy per distinct content. The map is
//! in-memory only; it is rebuilt from the catalog (or the segment manifest)
//! at startup and after compaction, which is also the recovery path when it
//! ever desyncs.

use std::collections::HashMap;

use engram_core::types::PayloadRef;

use crate::catalog::Catalog;

/// Hash → location map for one scope
#[derive(Debug, Default)]
pub struct ContentHashMap {
    map: HashMap<String, PayloadRef>,
}

impl ContentHashMap {
    pub fn new() -> Self {
        ContentHashMap::default()
    }

    /// Rebuild from catalog entries
    pub fn rebuild_from(catalog: &Catalog) -> Self {
        let mut map = HashMap::new();
        for (_, summary) in catalog.iter() {
            map.insert(
                summary.payload.content_hash.clone(),
                summary.payload.clone(),
            );
        }
        ContentHashMap { map }
    }

    pub fn lookup(&self, content_hash: &str) -> Option<&PayloadRef> {
        self.map.get(content_hash)
    }

    pub fn insert(&mut self, payload: PayloadRef) {
        self.map.insert(payload.content_hash.clone(), payload);
    }

    /// Drop a hash that no catalog entry references anymore
    pub fn remove(&mut self, content_hash: &str) -> Option<PayloadRef> {
        self.map.remove(content_hash)
    }

    pub fn contains(&self, content_hash: &str) -> bool {
        self.map.contains_key(content_hash)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
