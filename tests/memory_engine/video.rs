//! Video-backend scenarios (skipped without a transcoder on PATH)

use std::sync::Arc;

use crate::snippet;
use engram::config::{BackendKind, StoreConfig};
use engram::{MemoryManager, Scope};
use engram_core::config::EnvOverrides;
use tempfile::TempDir;

fn video_manager(dir: &TempDir) -> Option<Arc<MemoryManager>> {
    if !engram::codec::video::transcoder_available() {
        eprintln!("skipping: no transcoder on PATH");
        return None;
    }
    let mut config = StoreConfig::default();
    config.storage.backend = BackendKind::Video;
    Some(Arc::new(
        MemoryManager::open(dir.path().to_path_buf(), config, EnvOverrides::default()).unwrap(),
    ))
}

#[test]
fn video_roundtrip_through_frames() {
    let dir = TempDir::new().unwrap();
    let Some(manager) = video_manager(&dir) else { return };

    let outcome = manager
        .upsert(snippet("video borne", "fn from_frames() {}", Scope::Local))
        .unwrap();
    manager.flush(Scope::Local).unwrap();

    let item = manager.get(&outcome.item.id, None).unwrap();
    assert_eq!(item.code.as_deref(), Some("fn from_frames() {}"));

    // The consolidated segment and its index exist and validate
    let mvi = dir.path().join("local/segments/consolidated.mvi");
    assert!(dir.path().join("local/segments/consolidated.mp4").exists());
    engram::codec::frame_index::validate(&mvi).unwrap();
}

#[test]
fn duplicate_content_across_scopes_shares_one_range() {
    // S2 shape: identical bodies in two scopes, one frame range
    let dir = TempDir::new().unwrap();
    let Some(manager) = video_manager(&dir) else { return };

    let local = manager
        .upsert(snippet("Debounce", "function debounce(f,w){...}", Scope::Local))
        .unwrap();
    manager.flush(Scope::Local).unwrap();
    let stats_before = manager.stats(Scope::Local).unwrap();

    let global = manager
        .upsert(snippet("Debounce", "function debounce(f,w){...}", Scope::Global))
        .unwrap();
    manager.flush(Scope::Global).unwrap();

    assert_eq!(local.content_hash, global.content_hash);
    assert_eq!(manager.list(None).unwrap().len(), 2);

    // Each scope holds its own segment; within the local scope a second
    // identical upsert must not grow the segment
    let dup = manager
        .upsert(snippet("Debounce", "function debounce(f,w){...}", Scope::Local))
        .unwrap();
    manager.flush(Scope::Local).unwrap();
    let stats_after = manager.stats(Scope::Local).unwrap();
    assert_eq!(dup.content_hash, local.content_hash);
    assert_eq!(
        stats_before.segments[0].frame_count,
        stats_after.segments[0].frame_count
    );
    assert_eq!(stats_before.content_hashes, stats_after.content_hashes);
}

#[test]
fn backend_migration_file_to_video_preserves_hashes() {
    // S5 shape: 50 items migrate file → video with validation
    let dir = TempDir::new().unwrap();
    if !engram::codec::video::transcoder_available() {
        eprintln!("skipping: no transcoder on PATH");
        return;
    }
    let mut config = StoreConfig::default();
    config.storage.backend = BackendKind::File;
    let manager = Arc::new(
        MemoryManager::open(dir.path().to_path_buf(), config, EnvOverrides::default()).unwrap(),
    );

    let mut hashes = std::collections::BTreeMap::new();
    for n in 0..50 {
        let outcome = manager
            .upsert(snippet(&format!("m{n}"), &format!("fn m{n}() {{}}"), Scope::Local))
            .unwrap();
        hashes.insert(outcome.item.id.clone(), outcome.content_hash);
    }

    let progress_calls = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let progress_calls_inner = progress_calls.clone();
    let report = manager
        .migrate_storage_backend(
            Scope::Local,
            BackendKind::Video,
            true,
            Some(&move |_p| {
                progress_calls_inner.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            }),
        )
        .unwrap();
    assert_eq!(report.migrated, 50);
    assert!(report.validated);
    assert!(report.errors.is_empty());
    assert!(progress_calls.load(std::sync::atomic::Ordering::Relaxed) >= 1);

    // Post-migration: same ids, same content hashes, video backend
    assert_eq!(
        manager.stats(Scope::Local).unwrap().backend,
        BackendKind::Video
    );
    let summaries = manager.list(Some(Scope::Local)).unwrap();
    assert_eq!(summaries.len(), 50);
    for summary in summaries {
        assert_eq!(
            Some(&summary.payload.content_hash),
            hashes.get(&summary.id),
            "content hash changed for {}",
            summary.id
        );
    }

    // A phrase found pre-migration is still found post-migration
    let results = manager
        .query(engram::QueryRequest {
            q: Some("m17".into()),
            k: 3,
            ..Default::default()
        })
        .unwrap();
    assert!(!results.items.is_empty());
}

#[test]
fn compaction_preserves_reads_and_queries() {
    // S12 shape: get and query agree before and after compaction
    let dir = TempDir::new().unwrap();
    let Some(manager) = video_manager(&dir) else { return };

    let mut kept = Vec::new();
    for n in 0..6 {
        kept.push(
            manager
                .upsert(snippet(&format!("keeper {n}"), &format!("fn k{n}() {{}}"), Scope::Local))
                .unwrap()
                .item
                .id,
        );
    }
    let doomed = manager
        .upsert(snippet("doomed", "fn gone() {}", Scope::Local))
        .unwrap();
    manager.flush(Scope::Local).unwrap();
    manager.delete(&doomed.item.id, None).unwrap();

    let before: Vec<_> = kept
        .iter()
        .map(|id| manager.get(id, None).unwrap())
        .collect();
    let report = manager.compact(Scope::Local).unwrap();
    assert_eq!(report.live_items, 6);
    assert!(report.reclaimed_frames > 0);

    for (id, before_item) in kept.iter().zip(&before) {
        let after = manager.get(id, None).unwrap();
        assert_eq!(after.title, before_item.title);
        assert_eq!(after.code, before_item.code);
        assert_eq!(after.version, before_item.version);
    }
    assert!(manager.verify(Scope::Local).unwrap().ok);
}
