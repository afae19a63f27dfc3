//! Video-backed storage adapter
//!
//! Bodies are QR-encoded into frames of a single consolidated MP4 segment
//! per scope, indexed by the binary `.mvi` frame index and mirrored in a
//! human-readable `consolidated-index.json` manifest. The catalog is
//! authoritative for which items exist; the manifest is authoritative for
//! where their frames live and drives catalog rebuilds.
//!
//! # Write path
//!
//! Upserts are deduplicated against the content hash map, staged durably
//! under `tmp/pending/`, journaled, and queued for the background encoding
//! worker. The worker drains batches (up to [`BATCH_SIZE`], or whatever
//! arrived before [`BATCH_IDLE_MS`] of quiet), re-reads the existing
//! segment, appends the new frames, and replaces `consolidated.mp4` via
//! `consolidated.mp4.new` + rename. The catalog is saved only after the
//! rename succeeds. Failed batches retry with backoff, then dead-letter to
//! `tmp/failed-encodes.ndjson`; staged bodies are re-queued at next open, so
//! an encode failure is never silent data loss.
//!
//! # Read path
//!
//! payload cache → staged pending body → frame cache → frame extraction,
//! then QR decode and a content-hash check before the body is hydrated.
//!
//! # Item states
//!
//! absent → queued (staged, provisional ref) → committed (frames in the
//! segment) → edited (new range; old range unreferenced) / tombstoned
//! (deleted from catalog; frames reclaimed by compaction).

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::HashSet;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use engram_codec::frame_index::{self, FrameIndexEntry, FrameIndexView, FrameType};
use engram_codec::qr::{self, RgbaFrame, FRAME_DIM};
use engram_codec::video;
use engram_core::cancel::CancellationToken;
use engram_core::config::{BackendKind, VideoOptions};
use engram_core::error::{Error, Result};
use engram_core::hash::sha256_hex;
use engram_core::types::{
    JournalMeta, JournalOp, MemoryBody, MemoryId, MemoryItem, MemoryItemSummary, PayloadRef,
    Scope, SegmentItemRange, VideoSegment,
};

use crate::adapter::{CompactionReport, SegmentStats, StorageAdapter, StoreStats, VerifyReport};
use crate::cache::{ShardedByteCache, FRAME_CACHE_BYTES, PAYLOAD_CACHE_BYTES};
use crate::catalog::Catalog;
use crate::content_map::ContentHashMap;
use crate::journal::{Journal, JournalStats, JournalVerifyReport};
use crate::layout::{atomic_rename, atomic_write, ScopePaths};
use crate::lock::ScopeLock;
use crate::meta::{load_snapshot_meta, load_state_ok, write_checkpoint};

/// Maximum items per encoding batch
pub const BATCH_SIZE: usize = 20;

/// Quiet period that closes a partial batch
pub const BATCH_IDLE_MS: u64 = 500;

/// Soft cap of the encoding queue; writes past it hit backpressure
pub const QUEUE_SOFT_CAP: usize = 1000;

/// Retry backoff schedule for failed batches
const RETRY_BACKOFF: [Duration; 3] = [
    Duration::from_secs(1),
    Duration::from_secs(5),
    Duration::from_secs(30),
];

/// Segment id of the consolidated segment
const CONSOLIDATED: &str = "consolidated";

/// Placeholder segment id while an item waits in the encoding queue
const PENDING: &str = "pending";

// ============================================================================
// Internal state
// ============================================================================

#[derive(Debug, Clone)]
struct EncodeJob {
    id: MemoryId,
    content_hash: String,
    body_bytes: Vec<u8>,
}

struct SegmentState {
    manifest: VideoSegment,
    view: Option<FrameIndexView>,
}

struct VideoInner {
    paths: ScopePaths,
    options: VideoOptions,
    catalog: RwLock<Catalog>,
    content_map: RwLock<ContentHashMap>,
    journal: Journal,
    segment: RwLock<SegmentState>,
    payload_cache: ShardedByteCache<String>,
    frame_cache: ShardedByteCache<(String, u32)>,
    sender: Sender<EncodeJob>,
    /// Jobs enqueued but not yet committed or dead-lettered
    in_flight: Mutex<usize>,
    drained: Condvar,
    shutdown: AtomicBool,
    last_compact_at: Mutex<Option<DateTime<Utc>>>,
}

/// Video-segment storage for one scope
pub struct VideoStore {
    inner: Arc<VideoInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl VideoStore {
    /// Open a scope directory with the video backend
    ///
    /// Fails with `DependencyMissing` when no transcoder is on PATH. If the
    /// catalog is empty but the consolidated manifest and video exist, the
    /// catalog is rebuilt from the segment before the store comes up.
    pub fn open(paths: ScopePaths, options: VideoOptions) -> Result<Self> {
        if !video::transcoder_available() {
            return Err(Error::DependencyMissing(
                "video backend requires a transcoder (ffmpeg) on PATH".into(),
            ));
        }
        paths.ensure()?;
        let journal = Journal::open(paths.journal())?;
        journal.migrate_legacy(&paths.legacy_journal())?;

        let manifest = load_manifest(&paths)?;
        let view = if paths.segment_mvi().exists() {
            frame_index::validate(&paths.segment_mvi())?;
            Some(FrameIndexView::open_read(&paths.segment_mvi())?)
        } else {
            None
        };

        let mut catalog = Catalog::load(&paths.catalog())?;
        let cancel = CancellationToken::new();
        if catalog.is_empty() && !manifest.items.is_empty() && paths.segment_video().exists() {
            catalog = rebuild_catalog(&paths, &options, &manifest, view.as_ref(), &cancel)?;
            catalog.save(&paths, &paths.catalog())?;
        }

        let (sender, receiver) = bounded(QUEUE_SOFT_CAP);
        let inner = Arc::new(VideoInner {
            content_map: RwLock::new(ContentHashMap::rebuild_from(&catalog)),
            catalog: RwLock::new(catalog),
            journal,
            segment: RwLock::new(SegmentState { manifest, view }),
            payload_cache: ShardedByteCache::new(PAYLOAD_CACHE_BYTES),
            frame_cache: ShardedByteCache::new(FRAME_CACHE_BYTES),
            sender,
            in_flight: Mutex::new(0),
            drained: Condvar::new(),
            shutdown: AtomicBool::new(false),
            last_compact_at: Mutex::new(
                load_snapshot_meta(&paths.snapshot_meta())?.map(|m| m.last_ts),
            ),
            options,
            paths,
        });

        let store = VideoStore {
            worker: Mutex::new(Some(spawn_worker(Arc::clone(&inner), receiver))),
            inner,
        };
        store.requeue_staged()?;
        Ok(store)
    }

    /// Re-queue staged bodies left behind by an interrupted worker
    fn requeue_staged(&self) -> Result<()> {
        let pending_dir = self.inner.paths.pending_dir();
        if !pending_dir.exists() {
            return Ok(());
        }
        let committed: HashSet<String> = {
            let catalog = self.inner.catalog.read();
            catalog
                .iter()
                .filter(|(_, s)| s.payload.segment_id == CONSOLIDATED)
                .map(|(_, s)| s.payload.content_hash.clone())
                .collect()
        };
        for entry in std::fs::read_dir(&pending_dir)? {
            let path = entry?.path();
            let Some(hash) = path.file_stem().map(|s| s.to_string_lossy().into_owned()) else {
                continue;
            };
            if committed.contains(&hash) {
                let _ = std::fs::remove_file(&path);
                continue;
            }
            // Find the catalog entry still waiting on this body
            let owner = {
                let catalog = self.inner.catalog.read();
                let found = catalog
                    .iter()
                    .find(|(_, s)| s.payload.content_hash == hash)
                    .map(|(id, _)| id.clone());
                found
            };
            let Some(id) = owner else {
                let _ = std::fs::remove_file(&path);
                continue;
            };
            let body_bytes = std::fs::read(&path)?;
            info!(scope = %self.inner.paths.scope(), %id, "re-queueing staged body");
            self.inner.payload_cache.put(hash.clone(), body_bytes.clone());
            enqueue(
                &self.inner,
                EncodeJob {
                    id,
                    content_hash: hash,
                    body_bytes,
                },
                &CancellationToken::new(),
            )?;
        }
        Ok(())
    }
}

impl Drop for VideoStore {
    fn drop(&mut self) {
        self.inner.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

// ============================================================================
// Write path
// ============================================================================

/// Queue a job, blocking on a full queue until headroom or the deadline
///
/// Must not be called while holding the scope lock: the worker needs that
/// lock to commit, so blocking here with it held would deadlock the drain.
fn enqueue(inner: &Arc<VideoInner>, job: EncodeJob, cancel: &CancellationToken) -> Result<()> {
    use engram_core::cancel::deadlines;
    let deadline =
        std::time::Instant::now() + cancel.remaining().unwrap_or(deadlines::UPSERT);
    *inner.in_flight.lock() += 1;
    let mut job = job;
    loop {
        match inner.sender.try_send(job) {
            Ok(()) => return Ok(()),
            Err(TrySendError::Full(returned)) => {
                if cancel.is_cancelled() || std::time::Instant::now() >= deadline {
                    *inner.in_flight.lock() -= 1;
                    return Err(Error::Backpressure {
                        depth: QUEUE_SOFT_CAP,
                        cap: QUEUE_SOFT_CAP,
                    });
                }
                job = returned;
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(TrySendError::Disconnected(_)) => {
                *inner.in_flight.lock() -= 1;
                return Err(Error::Store("encoding worker is gone".into()));
            }
        }
    }
}

impl StorageAdapter for VideoStore {
    fn backend(&self) -> BackendKind {
        BackendKind::Video
    }

    fn scope(&self) -> Scope {
        self.inner.paths.scope()
    }

    fn paths(&self) -> &ScopePaths {
        &self.inner.paths
    }

    fn write_item(&self, item: &MemoryItem, cancel: &CancellationToken) -> Result<PayloadRef> {
        cancel.check("video-store write")?;
        let inner = &self.inner;
        let _lock = ScopeLock::acquire(&inner.paths.scope_lock(), self.scope())?;

        let body = item.body();
        let body_bytes = engram_core::hash::canonical_body_json(&body).into_bytes();
        let hash = sha256_hex(&body_bytes);
        let meta = JournalMeta {
            size: body_bytes.len() as u32,
            kind: item.kind,
            scope: item.scope,
            title: item.title.clone(),
        };

        // Deduplication: identical content reuses the existing frame range
        if let Some(existing) = inner.content_map.read().lookup(&hash).cloned() {
            inner.catalog.write().insert(item.summarize(existing.clone()));
            inner.journal.append(JournalOp::Upsert, &item.id, &hash, meta)?;
            debug!(scope = %self.scope(), id = %item.id, "deduplicated against existing range");
            return Ok(existing);
        }

        // Stage durably before acknowledging: a crash before the encode
        // commits re-queues this body at next open
        let staged = inner.paths.pending_dir().join(format!("{hash}.json"));
        atomic_write(&inner.paths, &staged, &body_bytes)?;

        let provisional = PayloadRef {
            content_hash: hash.clone(),
            segment_id: PENDING.into(),
            frame_start: 0,
            frame_end: 0,
            size: body_bytes.len() as u32,
        };
        inner.catalog.write().insert(item.summarize(provisional.clone()));
        inner.content_map.write().insert(provisional.clone());
        inner.journal.append(JournalOp::Upsert, &item.id, &hash, meta)?;
        inner.payload_cache.put(hash.clone(), body_bytes.clone());

        // Release the scope lock before a potentially-blocking send: the
        // worker takes the same lock to commit
        drop(_lock);
        enqueue(
            inner,
            EncodeJob {
                id: item.id.clone(),
                content_hash: hash,
                body_bytes,
            },
            cancel,
        )?;
        Ok(provisional)
    }

    fn read_item(&self, id: &MemoryId, cancel: &CancellationToken) -> Result<Option<MemoryItem>> {
        cancel.check("video-store read")?;
        let inner = &self.inner;
        let Some(summary) = inner.catalog.read().get(id).cloned() else {
            return Ok(None);
        };
        let payload = &summary.payload;

        // 1. Payload cache
        if let Some(bytes) = inner.payload_cache.get(&payload.content_hash) {
            return hydrate(&summary, &bytes).map(Some);
        }

        // 2. Staged pending body
        let staged = inner
            .paths
            .pending_dir()
            .join(format!("{}.json", payload.content_hash));
        if staged.exists() {
            let bytes = std::fs::read(&staged)?;
            inner.payload_cache.put(payload.content_hash.clone(), bytes.clone());
            return hydrate(&summary, &bytes).map(Some);
        }
        if payload.segment_id == PENDING {
            return Err(Error::Decode(format!(
                "{id}: queued body is gone from staging and cache"
            )));
        }

        // 3. Frame extraction with the frame cache
        let segment = inner.segment.read();
        let view = segment.view.as_ref().ok_or_else(|| {
            Error::Decode(format!("{id}: no frame index for segment {}", payload.segment_id))
        })?;
        let mut frames = Vec::with_capacity(payload.frame_count() as usize);
        for k in payload.frame_start..=payload.frame_end {
            let key = (payload.segment_id.clone(), k);
            let rgba = match inner.frame_cache.get(&key) {
                Some(cached) => cached.as_ref().clone(),
                None => {
                    let pixels = video::extract_frame(
                        &inner.paths.segment_video(),
                        view,
                        k,
                        FRAME_DIM,
                        FRAME_DIM,
                        cancel,
                    )?;
                    inner.frame_cache.put(key, pixels.clone());
                    pixels
                }
            };
            frames.push(RgbaFrame {
                rgba,
                width: FRAME_DIM,
                height: FRAME_DIM,
            });
        }
        drop(segment);

        // 4. QR decode, then verify the content hash before trusting it
        let bytes = qr::decode(&frames)?;
        if sha256_hex(&bytes) != payload.content_hash {
            return Err(Error::Decode(format!(
                "{id}: decoded body hashes to {} but catalog records {}",
                sha256_hex(&bytes),
                payload.content_hash
            )));
        }
        inner.payload_cache.put(payload.content_hash.clone(), bytes.clone());
        hydrate(&summary, &bytes).map(Some)
    }

    fn delete_item(&self, id: &MemoryId) -> Result<bool> {
        let inner = &self.inner;
        let _lock = ScopeLock::acquire(&inner.paths.scope_lock(), self.scope())?;
        let Some(summary) = inner.catalog.write().remove(id) else {
            return Ok(false);
        };
        // The frame range stays allocated (tombstoned) until compaction
        inner.journal.append(
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
        inner.payload_cache.remove(&summary.payload.content_hash);
        Ok(true)
    }

    fn get_summary(&self, id: &MemoryId) -> Option<MemoryItemSummary> {
        self.inner.catalog.read().get(id).cloned()
    }

    fn update_summary(&self, summary: MemoryItemSummary) -> Result<()> {
        let inner = &self.inner;
        let _lock = ScopeLock::acquire(&inner.paths.scope_lock(), self.scope())?;
        let mut catalog = inner.catalog.write();
        if !catalog.contains(&summary.id) {
            return Err(Error::NotFound(summary.id.to_string()));
        }
        catalog.insert(summary);
        catalog.save(&inner.paths, &inner.paths.catalog())
    }

    fn append_link_entry(&self, id: &MemoryId) -> Result<()> {
        let summary = self
            .get_summary(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        self.inner.journal.append(
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
        self.inner.catalog.read().summaries()
    }

    fn contains(&self, id: &MemoryId) -> bool {
        self.inner.catalog.read().contains(id)
    }

    fn item_count(&self) -> usize {
        self.inner.catalog.read().len()
    }

    fn lookup_hash(&self, content_hash: &str) -> Option<PayloadRef> {
        self.inner.content_map.read().lookup(content_hash).cloned()
    }

    fn flush(&self, cancel: &CancellationToken) -> Result<()> {
        let inner = &self.inner;
        let mut in_flight = inner.in_flight.lock();
        while *in_flight > 0 {
            cancel.check("video-store flush")?;
            inner
                .drained
                .wait_for(&mut in_flight, Duration::from_millis(100));
        }
        drop(in_flight);
        let catalog = inner.catalog.read();
        catalog.save(&inner.paths, &inner.paths.catalog())
    }

    fn compact(&self, cancel: &CancellationToken) -> Result<CompactionReport> {
        // Settle the queue first so every live body is either committed or
        // readable from staging
        self.flush(cancel)?;
        let inner = &self.inner;
        let _lock = ScopeLock::acquire(&inner.paths.scope_lock(), self.scope())?;
        cancel.check("video-store compact")?;

        let summaries = inner.catalog.read().summaries();
        let old_frames = inner.segment.read().manifest.frame_count;

        // Read every live body, then re-encode the segment from scratch,
        // dropping tombstoned ranges and renumbering
        let mut bodies: Vec<(MemoryItemSummary, Vec<u8>)> = Vec::with_capacity(summaries.len());
        for summary in summaries {
            let bytes = self.read_body_bytes(&summary, cancel)?;
            bodies.push((summary, bytes));
        }
        let mut catalog = inner.catalog.write();
        let mut segment = inner.segment.write();
        let report =
            rewrite_segment(inner, &mut catalog, &mut segment, &bodies, cancel)?;
        drop(segment);

        let checksum = catalog.checksum();
        let live_items = catalog.len();
        catalog.save(&inner.paths, &inner.paths.catalog())?;
        let seeds: Vec<(MemoryId, String)> = catalog
            .iter()
            .map(|(id, s)| (id.clone(), s.payload.content_hash.clone()))
            .collect();
        drop(catalog);

        *inner.content_map.write() = ContentHashMap::rebuild_from(&inner.catalog.read());
        inner.frame_cache.clear();
        inner.journal.truncate_to_snapshot(&checksum)?;
        inner.journal.seed_chains(seeds);
        let ts = write_checkpoint(&inner.paths, &checksum, live_items)?;
        *inner.last_compact_at.lock() = Some(ts);
        info!(
            scope = %self.scope(),
            live_items,
            reclaimed_frames = old_frames.saturating_sub(report),
            "compacted video store"
        );
        Ok(CompactionReport {
            live_items,
            reclaimed_frames: old_frames.saturating_sub(report),
            checksum,
            ts,
        })
    }

    fn verify(&self) -> Result<VerifyReport> {
        let inner = &self.inner;
        let catalog = inner.catalog.read();
        let computed = catalog.checksum();
        let mut problems = Vec::new();

        let segment = inner.segment.read();
        if let Some(view) = &segment.view {
            frame_index::validate(&inner.paths.segment_mvi())?;
            for (id, summary) in catalog.iter() {
                let payload = &summary.payload;
                if payload.segment_id != CONSOLIDATED {
                    continue;
                }
                if payload.frame_end >= view.frame_count() {
                    problems.push(format!(
                        "{id}: frame range {}..={} exceeds segment frame count {}",
                        payload.frame_start,
                        payload.frame_end,
                        view.frame_count()
                    ));
                }
            }
        } else if catalog
            .iter()
            .any(|(_, s)| s.payload.segment_id == CONSOLIDATED)
        {
            problems.push("catalog references a segment but no frame index exists".into());
        }
        drop(segment);

        let snapshot_checksum = load_snapshot_meta(&inner.paths.snapshot_meta())?.map(|m| m.checksum);
        let state_ok_checksum = load_state_ok(&inner.paths.state_ok())?.map(|m| m.checksum);
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
        self.inner.journal.replay_since(since)
    }

    fn journal_stats(&self) -> Result<JournalStats> {
        self.inner.journal.stats()
    }

    fn journal_verify(&self) -> Result<JournalVerifyReport> {
        self.inner.journal.verify()
    }

    fn appends_since_snapshot(&self) -> u64 {
        self.inner.journal.appends_since_snapshot()
    }

    fn last_compact_at(&self) -> Option<DateTime<Utc>> {
        *self.inner.last_compact_at.lock()
    }

    fn stats(&self) -> StoreStats {
        let inner = &self.inner;
        StoreStats {
            backend: BackendKind::Video,
            scope: self.scope(),
            item_count: inner.catalog.read().len(),
            content_hashes: inner.content_map.read().len(),
            segments: vec![SegmentStats {
                segment_id: CONSOLIDATED.into(),
                frame_count: inner.segment.read().manifest.frame_count,
            }],
            payload_cache: Some(inner.payload_cache.stats()),
            frame_cache: Some(inner.frame_cache.stats()),
            encode_queue_depth: *inner.in_flight.lock(),
        }
    }
}

impl VideoStore {
    /// Body bytes for a summary, from cache, staging, or the segment
    fn read_body_bytes(
        &self,
        summary: &MemoryItemSummary,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        let item = self
            .read_item(&summary.id, cancel)?
            .ok_or_else(|| Error::NotFound(summary.id.to_string()))?;
        Ok(engram_core::hash::canonical_body_json(&item.body()).into_bytes())
    }
}

fn hydrate(summary: &MemoryItemSummary, body_bytes: &[u8]) -> Result<MemoryItem> {
    let body: MemoryBody = serde_json::from_slice(body_bytes)
        .map_err(|e| Error::Decode(format!("{}: body JSON: {e}", summary.id)))?;
    summary.hydrate(body)
}

// ============================================================================
// Encoding worker
// ============================================================================

fn spawn_worker(inner: Arc<VideoInner>, receiver: Receiver<EncodeJob>) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name(format!("engram-encode-{}", inner.paths.scope()))
        .spawn(move || worker_loop(&inner, &receiver))
        .expect("failed to spawn encoding worker thread")
}

fn worker_loop(inner: &Arc<VideoInner>, receiver: &Receiver<EncodeJob>) {
    loop {
        let first = match receiver.recv_timeout(Duration::from_millis(100)) {
            Ok(job) => job,
            Err(_) => {
                if inner.shutdown.load(Ordering::Acquire) {
                    return;
                }
                continue;
            }
        };

        // Assemble a batch: up to BATCH_SIZE, closed by BATCH_IDLE_MS quiet
        let mut batch = vec![first];
        while batch.len() < BATCH_SIZE {
            match receiver.recv_timeout(Duration::from_millis(BATCH_IDLE_MS)) {
                Ok(job) => batch.push(job),
                Err(_) => break,
            }
        }

        let mut committed = false;
        for (attempt, backoff) in std::iter::once(&Duration::ZERO)
            .chain(RETRY_BACKOFF.iter())
            .enumerate()
        {
            if !backoff.is_zero() {
                interruptible_sleep(inner, *backoff);
            }
            if inner.shutdown.load(Ordering::Acquire) && attempt > 0 {
                // Leave the staged bodies; next open re-queues them
                break;
            }
            match commit_batch(inner, &batch) {
                Ok(()) => {
                    committed = true;
                    break;
                }
                Err(e) => {
                    warn!(
                        scope = %inner.paths.scope(),
                        attempt = attempt + 1,
                        batch = batch.len(),
                        error = %e,
                        "encode batch failed"
                    );
                }
            }
        }
        if !committed {
            dead_letter(inner, &batch);
        }

        let mut in_flight = inner.in_flight.lock();
        *in_flight = in_flight.saturating_sub(batch.len());
        inner.drained.notify_all();
    }
}

fn interruptible_sleep(inner: &VideoInner, total: Duration) {
    let slice = Duration::from_millis(50);
    let mut remaining = total;
    while !remaining.is_zero() && !inner.shutdown.load(Ordering::Acquire) {
        let step = remaining.min(slice);
        std::thread::sleep(step);
        remaining -= step;
    }
}

/// Append a batch of bodies to the consolidated segment
fn commit_batch(inner: &Arc<VideoInner>, batch: &[EncodeJob]) -> Result<()> {
    let cancel = CancellationToken::new();
    let _lock = ScopeLock::acquire(&inner.paths.scope_lock(), inner.paths.scope())?;

    // Skip content an earlier batch (or dedup) already committed
    let mut todo: Vec<&EncodeJob> = Vec::new();
    let mut seen = HashSet::new();
    {
        let content_map = inner.content_map.read();
        for job in batch {
            let committed = content_map
                .lookup(&job.content_hash)
                .map(|p| p.segment_id == CONSOLIDATED)
                .unwrap_or(false);
            if !committed && seen.insert(job.content_hash.clone()) {
                todo.push(job);
            }
        }
    }
    if todo.is_empty() {
        return Ok(());
    }

    let mut segment = inner.segment.write();
    let old_count = segment.manifest.frame_count;

    // Existing frames are re-read and the whole sequence re-encoded; MP4
    // cannot be appended in place
    let mut frames: Vec<RgbaFrame> = if old_count > 0 {
        video::read_all_frames(
            &inner.paths.segment_video(),
            old_count,
            FRAME_DIM,
            FRAME_DIM,
            &cancel,
        )?
    } else {
        Vec::new()
    };

    let mut new_ranges: Vec<(String, SegmentItemRange)> = Vec::new();
    for job in &todo {
        let encoded = qr::encode(&job.body_bytes, inner.options.error_correction)?;
        let start = frames.len() as u32;
        frames.extend(encoded.iter().map(RgbaFrame::from));
        new_ranges.push((
            job.content_hash.clone(),
            SegmentItemRange {
                item_id: job.id.clone(),
                content_hash: job.content_hash.clone(),
                frame_start: start,
                frame_end: frames.len() as u32 - 1,
                size: job.body_bytes.len() as u32,
            },
        ));
    }

    write_segment_files(inner, &mut segment, frames, |manifest| {
        manifest
            .items
            .extend(new_ranges.iter().map(|(_, r)| r.clone()));
    })?;

    // Catalog updates land only after the segment rename succeeded
    {
        let mut catalog = inner.catalog.write();
        let mut content_map = inner.content_map.write();
        for (hash, range) in &new_ranges {
            let payload = PayloadRef {
                content_hash: hash.clone(),
                segment_id: CONSOLIDATED.into(),
                frame_start: range.frame_start,
                frame_end: range.frame_end,
                size: range.size,
            };
            content_map.insert(payload.clone());
            // Every id that deduplicated onto this hash moves to the range
            let owners: Vec<MemoryId> = catalog
                .iter()
                .filter(|(_, s)| &s.payload.content_hash == hash)
                .map(|(id, _)| id.clone())
                .collect();
            for id in owners {
                if let Some(summary) = catalog.get_mut(&id) {
                    summary.payload = payload.clone();
                }
            }
        }
        catalog.save(&inner.paths, &inner.paths.catalog())?;
    }

    for job in &todo {
        let staged = inner
            .paths
            .pending_dir()
            .join(format!("{}.json", job.content_hash));
        let _ = std::fs::remove_file(&staged);
    }
    debug!(
        scope = %inner.paths.scope(),
        items = todo.len(),
        frames = segment.manifest.frame_count,
        "committed encode batch"
    );
    Ok(())
}

/// Encode `frames` into `consolidated.mp4.new`, swap it in, and rewrite the
/// `.mvi` and manifest to match
fn write_segment_files(
    inner: &VideoInner,
    segment: &mut SegmentState,
    frames: Vec<RgbaFrame>,
    update_manifest: impl FnOnce(&mut VideoSegment),
) -> Result<()> {
    let cancel = CancellationToken::new();
    let video_path = inner.paths.segment_video();
    let staging = video_path.with_extension("mp4.new");
    video::encode_to_mp4(&frames, &inner.options, &staging, &cancel)?;
    atomic_rename(&staging, &video_path)?;

    let fps = inner.options.fps;
    let gop = video::gop_size(frames.len(), fps);
    let frame_bytes = (FRAME_DIM * FRAME_DIM * 4) as u64;
    let entries: Vec<FrameIndexEntry> = (0..frames.len() as u32)
        .map(|n| {
            FrameIndexEntry::new(
                n,
                n as u64 * frame_bytes,
                frame_bytes as u32,
                n * 1000 / fps,
                FrameType::Content,
                n % gop == 0,
            )
        })
        .collect();
    let mvi_staging = inner.paths.segment_mvi().with_extension("mvi.new");
    frame_index::write(&entries, &mvi_staging)?;
    atomic_rename(&mvi_staging, &inner.paths.segment_mvi())?;

    segment.manifest.frame_count = frames.len() as u32;
    segment.manifest.fps = fps;
    update_manifest(&mut segment.manifest);
    atomic_write(
        &inner.paths,
        &inner.paths.segment_manifest(),
        serde_json::to_string_pretty(&segment.manifest)?.as_bytes(),
    )?;
    segment.view = Some(FrameIndexView::open_read(&inner.paths.segment_mvi())?);
    Ok(())
}

/// Rewrite the segment with only live bodies (compaction); returns the new
/// frame count
fn rewrite_segment(
    inner: &Arc<VideoInner>,
    catalog: &mut Catalog,
    segment: &mut SegmentState,
    bodies: &[(MemoryItemSummary, Vec<u8>)],
    _cancel: &CancellationToken,
) -> Result<u32> {
    let mut frames: Vec<RgbaFrame> = Vec::new();
    let mut ranges: Vec<SegmentItemRange> = Vec::new();
    let mut encoded_at: std::collections::HashMap<String, (u32, u32)> =
        std::collections::HashMap::new();

    for (summary, body_bytes) in bodies {
        let hash = &summary.payload.content_hash;
        let (start, end) = match encoded_at.get(hash) {
            Some(range) => *range,
            None => {
                let encoded = qr::encode(body_bytes, inner.options.error_correction)?;
                let start = frames.len() as u32;
                frames.extend(encoded.iter().map(RgbaFrame::from));
                let range = (start, frames.len() as u32 - 1);
                encoded_at.insert(hash.clone(), range);
                range
            }
        };
        ranges.push(SegmentItemRange {
            item_id: summary.id.clone(),
            content_hash: hash.clone(),
            frame_start: start,
            frame_end: end,
            size: body_bytes.len() as u32,
        });
    }

    if frames.is_empty() {
        // No live bodies: drop the segment artifacts entirely
        for path in [
            inner.paths.segment_video(),
            inner.paths.segment_mvi(),
            inner.paths.segment_manifest(),
        ] {
            if path.exists() {
                std::fs::remove_file(&path)?;
            }
        }
        segment.manifest.frame_count = 0;
        segment.manifest.items.clear();
        segment.view = None;
        return Ok(0);
    }

    let new_count = frames.len() as u32;
    write_segment_files(inner, segment, frames, |manifest| {
        manifest.items = ranges.clone();
    })?;

    for range in &ranges {
        if let Some(summary) = catalog.get_mut(&range.item_id) {
            summary.payload = PayloadRef {
                content_hash: range.content_hash.clone(),
                segment_id: CONSOLIDATED.into(),
                frame_start: range.frame_start,
                frame_end: range.frame_end,
                size: range.size,
            };
        }
    }
    Ok(new_count)
}

fn dead_letter(inner: &VideoInner, batch: &[EncodeJob]) {
    let path = inner.paths.dead_letter();
    let mut lines = String::new();
    for job in batch {
        let record = serde_json::json!({
            "id": job.id.as_str(),
            "contentHash": job.content_hash,
            "size": job.body_bytes.len(),
            "ts": Utc::now(),
        });
        lines.push_str(&record.to_string());
        lines.push('\n');
    }
    let written = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .and_then(|mut f| f.write_all(lines.as_bytes()));
    match written {
        Ok(()) => error!(
            scope = %inner.paths.scope(),
            batch = batch.len(),
            path = %path.display(),
            "encode batch exhausted retries; dead-lettered"
        ),
        Err(e) => error!(
            scope = %inner.paths.scope(),
            batch = batch.len(),
            error = %e,
            "encode batch exhausted retries AND dead-letter append failed"
        ),
    }
}

// ============================================================================
// Catalog rebuild
// ============================================================================

fn load_manifest(paths: &ScopePaths) -> Result<VideoSegment> {
    let path = paths.segment_manifest();
    if path.exists() {
        Ok(serde_json::from_slice(&std::fs::read(&path)?)?)
    } else {
        Ok(VideoSegment {
            segment_id: CONSOLIDATED.into(),
            path: paths
                .segment_video()
                .to_string_lossy()
                .into_owned(),
            frame_count: 0,
            fps: 30,
            codec: "h264".into(),
            items: Vec::new(),
            created_at: Utc::now(),
        })
    }
}

/// Rebuild the catalog from the consolidated index and video
///
/// Each item range is decoded and its content hash recomputed; any entry
/// whose recomputed hash disagrees with the manifest is refused.
fn rebuild_catalog(
    paths: &ScopePaths,
    _options: &VideoOptions,
    manifest: &VideoSegment,
    view: Option<&FrameIndexView>,
    cancel: &CancellationToken,
) -> Result<Catalog> {
    let view = view.ok_or_else(|| {
        Error::Integrity("cannot rebuild catalog: segment exists without a frame index".into())
    })?;
    info!(scope = %paths.scope(), items = manifest.items.len(), "rebuilding catalog from segment");

    let mut catalog = Catalog::new();
    for range in &manifest.items {
        let mut frames = Vec::new();
        for k in range.frame_start..=range.frame_end {
            let rgba =
                video::extract_frame(&paths.segment_video(), view, k, FRAME_DIM, FRAME_DIM, cancel)?;
            frames.push(RgbaFrame {
                rgba,
                width: FRAME_DIM,
                height: FRAME_DIM,
            });
        }
        let bytes = match qr::decode(&frames) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(id = %range.item_id, error = %e, "refusing undecodable range during rebuild");
                continue;
            }
        };
        let recomputed = sha256_hex(&bytes);
        if recomputed != range.content_hash {
            warn!(
                id = %range.item_id,
                expected = %range.content_hash,
                actual = %recomputed,
                "refusing hash-mismatched range during rebuild"
            );
            continue;
        }
        let body: MemoryBody = match serde_json::from_slice(&bytes) {
            Ok(body) => body,
            Err(e) => {
                warn!(id = %range.item_id, error = %e, "refusing unparsable body during rebuild");
                continue;
            }
        };
        // Body fields are recovered exactly; everything else restarts from
        // defaults (quality signals and facets are not encoded in frames)
        let now = Utc::now();
        let item = MemoryItem {
            id: range.item_id.clone(),
            kind: body.kind,
            scope: paths.scope(),
            title: body.title.clone(),
            text: body.text.clone(),
            code: body.code.clone(),
            language: body.language.clone(),
            facets: Default::default(),
            context: Default::default(),
            quality: Default::default(),
            security: Default::default(),
            links: vec![],
            created_at: manifest.created_at,
            updated_at: now,
            version: 1,
        };
        catalog.insert(item.summarize(PayloadRef {
            content_hash: range.content_hash.clone(),
            segment_id: CONSOLIDATED.into(),
            frame_start: range.frame_start,
            frame_end: range.frame_end,
            size: range.size,
        }));
    }
    info!(scope = %paths.scope(), recovered = catalog.len(), "catalog rebuild complete");
    Ok(catalog)
}

// ============================================================================
// Tests (live transcoder required; each test probes and skips without one)
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use engram_core::types::{ContextInfo, Facets, MemoryType, Quality, Security};
    use tempfile::TempDir;

    fn item(n: u8, code: &str) -> MemoryItem {
        let now = Utc::now();
        MemoryItem {
            id: MemoryId::parse(format!("01BRZ3NDEKTSV4RRFFQ69G5F{n:02}")).unwrap(),
            kind: MemoryType::Snippet,
            scope: Scope::Local,
            title: Some(format!("video item {n}")),
            text: None,
            code: Some(code.to_string()),
            language: Some("rs".into()),
            facets: Facets::default(),
            context: ContextInfo::default(),
            quality: Quality::default(),
            security: Security::default(),
            links: vec![],
            created_at: now,
            updated_at: now,
            version: 1,
        }
    }

    fn open(dir: &TempDir) -> Option<VideoStore> {
        if !video::transcoder_available() {
            eprintln!("skipping: no transcoder on PATH");
            return None;
        }
        Some(
            VideoStore::open(
                ScopePaths::new(dir.path(), Scope::Local),
                VideoOptions::default(),
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_open_without_transcoder_is_dependency_missing() {
        // Only meaningful on machines without ffmpeg; with one present the
        // positive path is exercised by the other tests
        if video::transcoder_available() {
            return;
        }
        let dir = TempDir::new().unwrap();
        let err = VideoStore::open(
            ScopePaths::new(dir.path(), Scope::Local),
            VideoOptions::default(),
        )
        .unwrap_err();
        assert_eq!(err.code(), "DependencyMissing");
    }

    #[test]
    fn test_write_flush_read_roundtrip() {
        let dir = TempDir::new().unwrap();
        let Some(store) = open(&dir) else { return };
        let cancel = CancellationToken::new();

        let a = item(1, "fn alpha() {}");
        store.write_item(&a, &cancel).unwrap();
        store.flush(&cancel).unwrap();

        let summary = store.get_summary(&a.id).unwrap();
        assert_eq!(summary.payload.segment_id, CONSOLIDATED);

        // Cold read straight from frames
        store.inner.payload_cache.clear();
        let back = store.read_item(&a.id, &cancel).unwrap().unwrap();
        assert_eq!(back.code, a.code);
        assert_eq!(back.title, a.title);
    }

    #[test]
    fn test_read_before_encode_commits() {
        let dir = TempDir::new().unwrap();
        let Some(store) = open(&dir) else { return };
        let cancel = CancellationToken::new();

        let a = item(2, "fn beta() {}");
        store.write_item(&a, &cancel).unwrap();
        // No flush: the body may still be queued, but reads must work
        let back = store.read_item(&a.id, &cancel).unwrap().unwrap();
        assert_eq!(back.code, a.code);
        store.flush(&cancel).unwrap();
    }

    #[test]
    fn test_dedup_allocates_one_range() {
        let dir = TempDir::new().unwrap();
        let Some(store) = open(&dir) else { return };
        let cancel = CancellationToken::new();

        let a = item(3, "shared body");
        let mut b = item(4, "shared body");
        b.title = a.title.clone();
        store.write_item(&a, &cancel).unwrap();
        store.flush(&cancel).unwrap();
        let frames_before = store.stats().segments[0].frame_count;
        let hashes_before = store.stats().content_hashes;

        store.write_item(&b, &cancel).unwrap();
        store.flush(&cancel).unwrap();
        assert_eq!(store.stats().segments[0].frame_count, frames_before);
        assert_eq!(store.stats().content_hashes, hashes_before);
        assert_eq!(store.item_count(), 2);

        let pa = store.get_summary(&a.id).unwrap().payload;
        let pb = store.get_summary(&b.id).unwrap().payload;
        assert_eq!(pa, pb);
    }

    #[test]
    fn test_catalog_rebuild_from_segment() {
        let dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        let a = item(5, "fn gamma() { 5 }");
        {
            let Some(store) = open(&dir) else { return };
            store.write_item(&a, &cancel).unwrap();
            store.flush(&cancel).unwrap();
            std::fs::remove_file(store.paths().catalog()).unwrap();
        }
        let store = open(&dir).unwrap();
        assert_eq!(store.item_count(), 1);
        let back = store.read_item(&a.id, &cancel).unwrap().unwrap();
        assert_eq!(back.code, a.code);
        assert_eq!(back.title, a.title);
    }

    #[test]
    fn test_delete_tombstones_then_compact_reclaims() {
        let dir = TempDir::new().unwrap();
        let Some(store) = open(&dir) else { return };
        let cancel = CancellationToken::new();

        let a = item(6, "keep me");
        let b = item(7, "drop me");
        store.write_item(&a, &cancel).unwrap();
        store.write_item(&b, &cancel).unwrap();
        store.flush(&cancel).unwrap();
        let frames_before = store.stats().segments[0].frame_count;

        assert!(store.delete_item(&b.id).unwrap());
        // The range survives the delete
        assert_eq!(store.stats().segments[0].frame_count, frames_before);

        let report = store.compact(&cancel).unwrap();
        assert_eq!(report.live_items, 1);
        assert!(report.reclaimed_frames > 0);
        assert!(store.stats().segments[0].frame_count < frames_before);

        let back = store.read_item(&a.id, &cancel).unwrap().unwrap();
        assert_eq!(back.code, a.code);
        assert!(store.verify().unwrap().ok);
    }

    #[test]
    fn test_staged_body_requeued_after_restart() {
        let dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        let a = item(8, "fn delta() {}");
        let staged_name;
        {
            let Some(store) = open(&dir) else { return };
            store.write_item(&a, &cancel).unwrap();
            store.flush(&cancel).unwrap();
            // Pretend the commit never happened: restore the staged file
            // and a pending catalog ref
            let hash = store.get_summary(&a.id).unwrap().payload.content_hash;
            staged_name = format!("{hash}.json");
            let body_bytes =
                engram_core::hash::canonical_body_json(&a.body()).into_bytes();
            std::fs::write(store.paths().pending_dir().join(&staged_name), &body_bytes).unwrap();
            let mut summary = store.get_summary(&a.id).unwrap();
            summary.payload.segment_id = PENDING.into();
            summary.payload.frame_start = 0;
            summary.payload.frame_end = 0;
            store.update_summary(summary).unwrap();
        }
        let store = open(&dir).unwrap();
        store.flush(&cancel).unwrap();
        // The re-queued body committed and staging is clean again
        assert_eq!(
            store.get_summary(&a.id).unwrap().payload.segment_id,
            CONSOLIDATED
        );
        assert!(!store.paths().pending_dir().join(&staged_name).exists());
    }
}
