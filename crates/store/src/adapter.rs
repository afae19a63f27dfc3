//! Storage abstraction over the file and video backends
//!
//! The [`StorageAdapter`] trait is the seam between the memory manager and
//! persistence. Implementations must be safe to call concurrently from
//! multiple threads (`Send + Sync`); the manager layers a readers-writer
//! discipline on top, and each adapter takes the scope's advisory lock for
//! its own mutations.
//!
//! [`open_store`] is the factory: it resolves `auto` backend selection
//! against transcoder availability and refuses to build a video store when
//! no transcoder exists.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::info;

use engram_core::cancel::CancellationToken;
use engram_core::config::{BackendKind, StoreConfig};
use engram_core::error::{Error, Result};
use engram_core::types::{MemoryId, MemoryItem, MemoryItemSummary, PayloadRef, Scope};

use crate::cache::CacheStats;
use crate::file_store::FileStore;
use crate::journal::{JournalStats, JournalVerifyReport};
use crate::layout::ScopePaths;
use crate::video_store::VideoStore;

// ============================================================================
// Reports
// ============================================================================

/// Per-segment counters for stats reporting
#[derive(Debug, Clone)]
pub struct SegmentStats {
    pub segment_id: String,
    pub frame_count: u32,
}

/// Snapshot of one adapter's state
#[derive(Debug, Clone)]
pub struct StoreStats {
    pub backend: BackendKind,
    pub scope: Scope,
    pub item_count: usize,
    pub content_hashes: usize,
    pub segments: Vec<SegmentStats>,
    pub payload_cache: Option<CacheStats>,
    pub frame_cache: Option<CacheStats>,
    pub encode_queue_depth: usize,
}

/// Outcome of a compaction run
#[derive(Debug, Clone)]
pub struct CompactionReport {
    pub live_items: usize,
    pub reclaimed_frames: u32,
    pub checksum: String,
    pub ts: DateTime<Utc>,
}

/// Outcome of a verification pass
#[derive(Debug, Clone)]
pub struct VerifyReport {
    pub ok: bool,
    pub computed_checksum: String,
    pub snapshot_checksum: Option<String>,
    pub state_ok_checksum: Option<String>,
    pub problems: Vec<String>,
}

// ============================================================================
// StorageAdapter
// ============================================================================

/// The operations every backend provides
pub trait StorageAdapter: Send + Sync {
    fn backend(&self) -> BackendKind;

    fn scope(&self) -> Scope;

    fn paths(&self) -> &ScopePaths;

    /// Persist an item's body and record it in catalog and journal
    ///
    /// Returns the payload location. Identical content already stored is
    /// deduplicated: the existing location is reused and only the catalog
    /// and journal are updated.
    ///
    /// # Errors
    ///
    /// `LockTimeout` on scope-lock contention, `Backpressure` when the
    /// encoding queue is saturated, `StoreError` on I/O failure.
    fn write_item(&self, item: &MemoryItem, cancel: &CancellationToken) -> Result<PayloadRef>;

    /// Read and reconstruct a full item
    ///
    /// Returns `Ok(None)` when the id is not in the catalog. A catalog hit
    /// whose body cannot be reconstructed is an error (`DecodeError`), never
    /// a partial item.
    fn read_item(&self, id: &MemoryId, cancel: &CancellationToken) -> Result<Option<MemoryItem>>;

    /// Remove from the catalog and journal a tombstone
    ///
    /// Returns whether the id existed. Video frame ranges stay allocated
    /// until the next compaction.
    fn delete_item(&self, id: &MemoryId) -> Result<bool>;

    fn get_summary(&self, id: &MemoryId) -> Option<MemoryItemSummary>;

    /// Replace an item's catalog summary (quality/links mutations)
    ///
    /// Body fields are untouched; for the file backend the item file is
    /// rewritten to keep it in agreement with the catalog.
    fn update_summary(&self, summary: MemoryItemSummary) -> Result<()>;

    /// Journal a link mutation for an id (content hash is unchanged)
    fn append_link_entry(&self, id: &MemoryId) -> Result<()>;

    fn list_summaries(&self) -> Vec<MemoryItemSummary>;

    fn contains(&self, id: &MemoryId) -> bool;

    fn item_count(&self) -> usize;

    /// Deduplication lookup
    fn lookup_hash(&self, content_hash: &str) -> Option<PayloadRef>;

    /// Block until queued background work (encoding, catalog save) is durable
    fn flush(&self, cancel: &CancellationToken) -> Result<()>;

    /// Rewrite storage omitting tombstones, truncate the journal, and write
    /// fresh checkpoint markers
    fn compact(&self, cancel: &CancellationToken) -> Result<CompactionReport>;

    /// Recompute the scope checksum and compare with the checkpoint markers
    fn verify(&self) -> Result<VerifyReport>;

    /// Journal entries appended after `since` (startup replay window)
    fn journal_entries_since(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<engram_core::types::OptimizedJournalEntry>>;

    fn journal_stats(&self) -> Result<JournalStats>;

    fn journal_verify(&self) -> Result<JournalVerifyReport>;

    /// Journal appends since the last snapshot (compaction trigger input)
    fn appends_since_snapshot(&self) -> u64;

    /// When this scope last compacted, if ever (compaction trigger input)
    fn last_compact_at(&self) -> Option<DateTime<Utc>>;

    fn stats(&self) -> StoreStats;
}

// ============================================================================
// Factory
// ============================================================================

/// Resolve the effective backend for a scope
///
/// Priority: explicit force (environment) → the scope's own `config.json`
/// (written at every open, so a migrated scope reopens with the backend its
/// directory actually holds) → the global configuration. `auto` prefers
/// video when a transcoder is present.
pub fn resolve_backend(
    paths: &ScopePaths,
    config: &StoreConfig,
    force: Option<BackendKind>,
) -> BackendKind {
    let requested = force
        .or_else(|| scope_backend(paths))
        .unwrap_or(config.storage.backend);
    match requested {
        BackendKind::Auto => {
            if engram_codec::video::transcoder_available() {
                BackendKind::Video
            } else {
                BackendKind::File
            }
        }
        other => other,
    }
}

/// The backend recorded in the scope's `config.json`, if any
fn scope_backend(paths: &ScopePaths) -> Option<BackendKind> {
    let bytes = std::fs::read(paths.config()).ok()?;
    let value: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    match value.pointer("/storage/backend")?.as_str()? {
        "file" => Some(BackendKind::File),
        "video" => Some(BackendKind::Video),
        _ => None,
    }
}

/// Record the resolved backend in the scope's `config.json`
///
/// Other keys in the file are preserved untouched.
fn persist_scope_backend(paths: &ScopePaths, backend: BackendKind) -> Result<()> {
    let mut value: serde_json::Value = std::fs::read(paths.config())
        .ok()
        .and_then(|bytes| serde_json::from_slice(&bytes).ok())
        .unwrap_or_else(|| serde_json::json!({}));
    let name = match backend {
        BackendKind::File => "file",
        BackendKind::Video => "video",
        BackendKind::Auto => return Ok(()),
    };
    value["storage"]["backend"] = serde_json::Value::String(name.to_string());
    crate::layout::atomic_write(
        paths,
        &paths.config(),
        serde_json::to_string_pretty(&value)?.as_bytes(),
    )
}

/// Open the storage adapter for one scope
pub fn open_store(
    paths: ScopePaths,
    config: &StoreConfig,
    force: Option<BackendKind>,
) -> Result<Arc<dyn StorageAdapter>> {
    let backend = resolve_backend(&paths, config, force);
    info!(scope = %paths.scope(), ?backend, "opening scope store");
    let store: Arc<dyn StorageAdapter> = match backend {
        BackendKind::File => Arc::new(FileStore::open(paths)?),
        BackendKind::Video => Arc::new(VideoStore::open(
            paths,
            config.storage.video_options.clone(),
        )?),
        BackendKind::Auto => {
            return Err(Error::Store(
                "backend resolution produced Auto; this is a bug".into(),
            ))
        }
    };
    persist_scope_backend(store.paths(), backend)?;
    Ok(store)
}
