//! Per-scope catalog: id → summary
//!
//! The catalog is the authoritative listing of a scope's items. In memory it
//! is a `BTreeMap` (deterministic iteration, ids sort by creation time); on
//! disk it is `catalog.json`, rewritten atomically on save.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use engram_core::error::Result;
use engram_core::hash::sha256_hex;
use engram_core::types::{MemoryId, MemoryItemSummary};

use crate::layout::{atomic_write, ScopePaths};

#[derive(Debug, Default, Serialize, Deserialize)]
struct CatalogFile {
    items: BTreeMap<String, MemoryItemSummary>,
}

/// In-memory catalog of one scope
#[derive(Debug, Default)]
pub struct Catalog {
    map: BTreeMap<MemoryId, MemoryItemSummary>,
}

impl Catalog {
    pub fn new() -> Self {
        Catalog::default()
    }

    /// Load from `catalog.json`; a missing file yields an empty catalog
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Catalog::new());
        }
        let bytes = std::fs::read(path)?;
        let file: CatalogFile = serde_json::from_slice(&bytes)?;
        let mut map = BTreeMap::new();
        for (id, summary) in file.items {
            map.insert(MemoryId::parse(id)?, summary);
        }
        Ok(Catalog { map })
    }

    /// Persist atomically to `dest`
    pub fn save(&self, paths: &ScopePaths, dest: &Path) -> Result<()> {
        let file = CatalogFile {
            items: self
                .map
                .iter()
                .map(|(id, summary)| (id.as_str().to_string(), summary.clone()))
                .collect(),
        };
        atomic_write(paths, dest, serde_json::to_string_pretty(&file)?.as_bytes())
    }

    pub fn insert(&mut self, summary: MemoryItemSummary) {
        self.map.insert(summary.id.clone(), summary);
    }

    pub fn remove(&mut self, id: &MemoryId) -> Option<MemoryItemSummary> {
        self.map.remove(id)
    }

    pub fn get(&self, id: &MemoryId) -> Option<&MemoryItemSummary> {
        self.map.get(id)
    }

    pub fn get_mut(&mut self, id: &MemoryId) -> Option<&mut MemoryItemSummary> {
        self.map.get_mut(id)
    }

    pub fn contains(&self, id: &MemoryId) -> bool {
        self.map.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&MemoryId, &MemoryItemSummary)> {
        self.map.iter()
    }

    pub fn summaries(&self) -> Vec<MemoryItemSummary> {
        self.map.values().cloned().collect()
    }

    /// Checksum over the sorted (id, content hash) pairs
    ///
    /// This is the value recorded by snapshot markers, `snapshot-meta.json`,
    /// and `state-ok.json`; `verify` recomputes and compares it.
    pub fn checksum(&self) -> String {
        let mut acc = String::new();
        for (id, summary) in &self.map {
            acc.push_str(id.as_str());
            acc.push(':');
            acc.push_str(&summary.payload.content_hash);
            acc.push('\n');
        }
        sha256_hex(acc.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use engram_core::types::{
        ContextInfo, Facets, MemoryType, PayloadRef, Quality, Scope, Security,
    };
    use tempfile::TempDir;

    fn summary(n: u8) -> MemoryItemSummary {
        let now = Utc::now();
        MemoryItemSummary {
            id: MemoryId::parse(format!("01ARZ3NDEKTSV4RRFFQ69G5F{n:02}")).unwrap(),
            kind: MemoryType::Note,
            scope: Scope::Local,
            title: Some(format!("note {n}")),
            language: None,
            facets: Facets::default(),
            context: ContextInfo::default(),
            quality: Quality::default(),
            security: Security::default(),
            links: vec![],
            created_at: now,
            updated_at: now,
            version: 1,
            payload: PayloadRef::file(format!("{n:02}").repeat(32), 10),
        }
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let paths = ScopePaths::new(dir.path(), Scope::Local);
        paths.ensure().unwrap();

        let mut catalog = Catalog::new();
        catalog.insert(summary(1));
        catalog.insert(summary(2));
        catalog.save(&paths, &paths.catalog()).unwrap();

        let loaded = Catalog::load(&paths.catalog()).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(
            loaded.summaries().iter().map(|s| s.id.clone()).collect::<Vec<_>>(),
            catalog.summaries().iter().map(|s| s.id.clone()).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let catalog = Catalog::load(&dir.path().join("catalog.json")).unwrap();
        assert!(catalog.is_empty());
    }

    #[test]
    fn test_checksum_changes_with_content() {
        let mut catalog = Catalog::new();
        let empty = catalog.checksum();
        catalog.insert(summary(1));
        let one = catalog.checksum();
        assert_ne!(empty, one);

        // Same contents produce the same checksum regardless of insert order
        let mut other = Catalog::new();
        other.insert(summary(2));
        other.insert(summary(1));
        let mut reference = Catalog::new();
        reference.insert(summary(1));
        reference.insert(summary(2));
        assert_eq!(other.checksum(), reference.checksum());
    }
}
