//! File-backed storage adapter
//!
//! One JSON file per item under `items/`, an in-memory catalog checkpointed
//! to `catalog.json`, and the hash-only journal. Writes are atomic
//! (tmp + fsync + rename) and journaled after the rename, so a crash leaves
//! at most one reconcilable discrepancy:
//!
//! - crash between tmp write and rename: the orphan tmp file is GC'd at
//!   startup, nothing visible changed
//! - crash between rename and journal append: startup reconciliation finds
//!   the unjournaled file, recomputes its hash, and appends the implied
//!   journal entry

use parking_lot::{Mutex, RwLock};
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use engram_core::cancel::CancellationToken;
use engram_core::config::BackendKind;
use engram_core::error::{Error, Result};
use engram_core::hash::content_hash;
use engram_core::types::{
    JournalMeta, JournalOp, MemoryId, MemoryItem, MemoryItemSummary, PayloadRef, Scope,
};

use crate::adapter::{CompactionReport, SegmentStats, StorageAdapter, StoreStats, VerifyReport};
use crate::catalog::Catalog;
use crate::content_map::ContentHashMap;
use crate::journal::{Journal, JournalStats, JournalVerifyReport};
use crate::layout::{atomic_write, ScopePaths};
use crate::lock::ScopeLock;
use crate::meta::{load_snapshot_meta, load_state_ok, write_checkpoint};

/// File-per-item storage for one scope
pub struct FileStore {
    paths: ScopePaths,
    catalog: RwLock<Catalog>,
    content_map: RwLock<ContentHashMap>,
    journal: Journal,
    last_compact_at: Mutex<Option<DateTime<Utc>>>,
}

impl FileStore {
    /// Open a scope directory, migrating and reconciling as needed
    pub fn open(paths: ScopePaths) -> Result<Self> {
        paths.ensure()?;
        let journal = Journal::open(paths.journal())?;
        journal.migrate_legacy(&paths.legacy_journal())?;

        let catalog = Catalog::load(&paths.catalog())?;
        let store = FileStore {
            content_map: RwLock::new(ContentHashMap::rebuild_from(&catalog)),
            catalog: RwLock::new(catalog),
            journal,
            last_compact_at: Mutex::new(
                load_snapshot_meta(&paths.snapshot_meta())?.map(|m| m.last_ts),
            ),
            paths,
        };
        store.reconcile()?;
        Ok(store)
    }

    /// Bring item files, catalog, and journal back into agreement
    fn reconcile(&self) -> Result<()> {
        let mut catalog = self.catalog.write();
        let mut content_map = self.content_map.write();
        let mut implied = 0usize;
        let mut dropped = 0usize;

        // Pass 1: every item file must be cataloged and journaled
        for entry in std::fs::read_dir(self.paths.items_dir())? {
            let path = entry?.path();
            if path.extension().map(|e| e != "json").unwrap_or(true) {
                continue;
            }
            let item: MemoryItem = match serde_json::from_slice(&std::fs::read(&path)?) {
                Ok(item) => item,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable item file");
                    continue;
                }
            };
            let hash = content_hash(&item.body());
            let size = serde_json::to_vec(&item)?.len() as u32;
            if self.journal.last_hash(&item.id).as_deref() != Some(hash.as_str()) {
                // The rename landed but the append did not
                self.journal.append(
                    JournalOp::Upsert,
                    &item.id,
                    &hash,
                    journal_meta(&item, size),
                )?;
                implied += 1;
            }
            if !catalog.contains(&item.id) {
                let payload = PayloadRef::file(hash.clone(), size);
                content_map.insert(payload.clone());
                catalog.insert(item.summarize(payload));
            }
        }

        // Pass 2: catalog entries whose file vanished are stale
        let missing: Vec<MemoryId> = catalog
            .iter()
            .filter(|(id, _)| !self.paths.item_path(id.as_str()).exists())
            .map(|(id, _)| id.clone())
            .collect();
        for id in missing {
            catalog.remove(&id);
            dropped += 1;
        }

        if implied > 0 || dropped > 0 {
            info!(
                scope = %self.paths.scope(),
                implied_journal_entries = implied,
                dropped_catalog_entries = dropped,
                "reconciled file store"
            );
            catalog.save(&self.paths, &self.paths.catalog())?;
        }
        Ok(())
    }

    fn read_item_file(&self, id: &MemoryId) -> Result<Option<MemoryItem>> {
        let path = self.paths.item_path(id.as_str());
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_slice(&std::fs::read(&path)?)?))
    }
}

fn journal_meta(item: &MemoryItem, size: u32) -> JournalMeta {
    JournalMeta {
        size,
        kind: item.kind,
        scope: item.scope,
        title: item.title.clone(),
    }
}

impl StorageAdapter for FileStore {
    fn backend(&self) -> BackendKind {
        BackendKind::File
    }

    fn scope(&self) -> Scope {
        self.paths.scope()
    }

    fn paths(&self) -> &ScopePaths {
        &self.paths
    }

    fn write_item(&self, item: &MemoryItem, cancel: &CancellationToken) -> Result<PayloadRef> {
        cancel.check("file-store write")?;
        let _lock = ScopeLock::acquire(&self.paths.scope_lock(), self.scope())?;

        let bytes = serde_json::to_vec_pretty(item)?;
        let hash = content_hash(&item.body());
        let payload = PayloadRef::file(hash.clone(), bytes.len() as u32);

        atomic_write(&self.paths, &self.paths.item_path(item.id.as_str()), &bytes)?;
        {
            let mut catalog = self.catalog.write();
            catalog.insert(item.summarize(payload.clone()));
        }
        self.journal.append(
            JournalOp::Upsert,
            &item.id,
            &hash,
            journal_meta(item, bytes.len() as u32),
        )?;
        self.content_map.write().insert(payload.clone());
        debug!(scope = %self.scope(), id = %item.id, version = item.version, "wrote item file");
        Ok(payload)
    }

    fn read_item(&self, id: &MemoryId, cancel: &CancellationToken) -> Result<Option<MemoryItem>> {
        cancel.check("file-store read")?;
        self.read_item_file(id)
    }

    fn delete_item(&self, id: &MemoryId) -> Result<bool> {
        let _lock = ScopeLock::acquire(&self.paths.scope_lock(), self.scope())?;
        let removed = {
            let mut catalog = self.catalog.write();
            catalog.remove(id)
        };
        let Some(summary) = removed else {
            return Ok(false);
        };

        let path = self.paths.item_path(id.as_str());
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        self.journal.append(
            JournalOp::Delete,
            id,
            &summary.payload.content_hash,
            JournalMeta {
                size: 0,
                kind: summary.kind,
                scope: summary.scope,
                title: summary.title.clone(),
            },
        )?;

        // Drop the hash only when no surviving entry shares the content
        let shared = {
            let catalog = self.catalog.read();
            let found = catalog
                .iter()
                .any(|(_, s)| s.payload.content_hash == summary.payload.content_hash);
            found
        };
        if !shared {
            self.content_map.write().remove(&summary.payload.content_hash);
        }
        Ok(true)
    }

    fn get_summary(&self, id: &MemoryId) -> Option<MemoryItemSummary> {
        self.catalog.read().get(id).cloned()
    }

    fn update_summary(&self, summary: MemoryItemSummary) -> Result<()> {
        let _lock = ScopeLock::acquire(&self.paths.scope_lock(), self.scope())?;
        // Keep the item file in agreement: its non-body fields come from the
        // summary, its body stays untouched
        if let Some(mut item) = self.read_item_file(&summary.id)? {
            item.facets = summary.facets.clone();
            item.context = summary.context.clone();
            item.quality = summary.quality.clone();
            item.security = summary.security.clone();
            item.links = summary.links.clone();
            item.updated_at = summary.updated_at;
            item.version = summary.version;
            let bytes = serde_json::to_vec_pretty(&item)?;
            atomic_write(&self.paths, &self.paths.item_path(item.id.as_str()), &bytes)?;
        } else {
            return Err(Error::NotFound(summary.id.to_string()));
        }
        self.catalog.write().insert(summary);
        Ok(())
    }

    fn append_link_entry(&self, id: &MemoryId) -> Result<()> {
        let summary = self
            .get_summary(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        self.journal.append(
            JournalOp::Link,
            id,
            &summary.payload.content_hash,
            JournalMeta {
                size: 0,
                kind: summary.kind,
                scope: summary.scope,
                title: summary.title,
            },
        )?;
        Ok(())
    }

    fn list_summaries(&self) -> Vec<MemoryItemSummary> {
        self.catalog.read().summaries()
    }

    fn contains(&self, id: &MemoryId) -> bool {
        self.catalog.read().contains(id)
    }

    fn item_count(&self) -> usize {
        self.catalog.read().len()
    }

    fn lookup_hash(&self, content_hash: &str) -> Option<PayloadRef> {
        self.content_map.read().lookup(content_hash).cloned()
    }

    fn flush(&self, cancel: &CancellationToken) -> Result<()> {
        cancel.check("file-store flush")?;
        let catalog = self.catalog.read();
        catalog.save(&self.paths, &self.paths.catalog())
    }

    fn compact(&self, cancel: &CancellationToken) -> Result<CompactionReport> {
        cancel.check("file-store compact")?;
        let _lock = ScopeLock::acquire(&self.paths.scope_lock(), self.scope())?;

        // Materialize current state (files are authoritative for this
        // backend), checkpoint it, then collapse the journal
        let catalog = self.catalog.read();
        let checksum = catalog.checksum();
        catalog.save(&self.paths, &self.paths.catalog())?;
        let live_items = catalog.len();
        let seeds: Vec<(MemoryId, String)> = catalog
            .iter()
            .map(|(id, s)| (id.clone(), s.payload.content_hash.clone()))
            .collect();
        drop(catalog);

        self.journal.truncate_to_snapshot(&checksum)?;
        self.journal.seed_chains(seeds);
        let ts = write_checkpoint(&self.paths, &checksum, live_items)?;
        *self.last_compact_at.lock() = Some(ts);
        info!(scope = %self.scope(), live_items, "compacted file store");
        Ok(CompactionReport {
            live_items,
            reclaimed_frames: 0,
            checksum,
            ts,
        })
    }

    fn verify(&self) -> Result<VerifyReport> {
        let catalog = self.catalog.read();
        let computed = catalog.checksum();
        let mut problems = Vec::new();

        // Every catalog entry must resolve to a file with the recorded hash
        for (id, summary) in catalog.iter() {
            match self.read_item_file(id)? {
                Some(item) => {
                    let hash = content_hash(&item.body());
                    if hash != summary.payload.content_hash {
                        problems.push(format!(
                            "{id}: file hash {hash} disagrees with catalog {}",
                            summary.payload.content_hash
                        ));
                    }
                }
                None => problems.push(format!("{id}: item file missing")),
            }
        }

        let snapshot = load_snapshot_meta(&self.paths.snapshot_meta())?;
        let state_ok = load_state_ok(&self.paths.state_ok())?;
        let snapshot_checksum = snapshot.map(|m| m.checksum);
        let state_ok_checksum = state_ok.map(|m| m.checksum);
        for (name, marker) in [
            ("snapshot-meta", &snapshot_checksum),
            ("state-ok", &state_ok_checksum),
        ] {
            if let Some(recorded) = marker {
                if recorded != &computed {
                    problems.push(format!(
                        "{name} checksum {recorded} disagrees with computed {computed}"
                    ));
                }
            }
        }

        Ok(VerifyReport {
            ok: problems.is_empty(),
            computed_checksum: computed,
            snapshot_checksum,
            state_ok_checksum,
            problems,
        })
    }

    fn journal_entries_since(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<engram_core::types::OptimizedJournalEntry>> {
        self.journal.replay_since(since)
    }

    fn journal_stats(&self) -> Result<JournalStats> {
        self.journal.stats()
    }

    fn journal_verify(&self) -> Result<JournalVerifyReport> {
        self.journal.verify()
    }

    fn appends_since_snapshot(&self) -> u64 {
        self.journal.appends_since_snapshot()
    }

    fn last_compact_at(&self) -> Option<DateTime<Utc>> {
        *self.last_compact_at.lock()
    }

    fn stats(&self) -> StoreStats {
        StoreStats {
            backend: BackendKind::File,
            scope: self.scope(),
            item_count: self.catalog.read().len(),
            content_hashes: self.content_map.read().len(),
            segments: Vec::<SegmentStats>::new(),
            payload_cache: None,
            frame_cache: None,
            encode_queue_depth: 0,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
