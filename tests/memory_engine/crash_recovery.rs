//! Restart and crash-shape recovery

use crate::{file_manager, snippet};
use engram::Scope;
use tempfile::TempDir;

#[test]
fn restart_recovers_all_items_and_valid_journal() {
    let dir = TempDir::new().unwrap();
    let mut ids = Vec::new();
    {
        let manager = file_manager(&dir);
        for n in 0..100 {
            let outcome = manager
                .upsert(snippet(&format!("item {n}"), &format!("f{n}()"), Scope::Local))
                .unwrap();
            ids.push(outcome.item.id);
        }
        // Dropped without flushing: item files and the journal are already
        // durable, the catalog checkpoint may be stale
    }

    let manager = file_manager(&dir);
    let report = manager.journal_verify(Scope::Local).unwrap();
    assert!(report.valid, "chain breaks: {:?}", report.chain_breaks);

    assert_eq!(manager.list(Some(Scope::Local)).unwrap().len(), 100);
    for id in &ids {
        manager.get(id, None).unwrap();
    }
}

#[test]
fn orphan_tmp_files_are_invisible_and_swept() {
    let dir = TempDir::new().unwrap();
    {
        let manager = file_manager(&dir);
        manager.upsert(snippet("real", "r()", Scope::Local)).unwrap();
    }
    // Crash shape: a write that never reached its rename
    let orphan = dir.path().join("local/tmp/item.json.9999.7");
    std::fs::write(&orphan, b"{\"partial\":").unwrap();

    let manager = file_manager(&dir);
    assert_eq!(manager.list(Some(Scope::Local)).unwrap().len(), 1);
    assert!(!orphan.exists(), "orphan tmp file must be GC'd at startup");
}

#[test]
fn unjournaled_item_file_is_reconciled() {
    let dir = TempDir::new().unwrap();
    let id;
    {
        let manager = file_manager(&dir);
        id = manager
            .upsert(snippet("survivor", "s()", Scope::Local))
            .unwrap()
            .item
            .id;
        // Crash shape: rename landed, journal append lost
        std::fs::write(dir.path().join("local/journal-optimized.ndjson"), b"").unwrap();
    }

    let manager = file_manager(&dir);
    assert!(manager.get(&id, None).is_ok());
    let report = manager.journal_verify(Scope::Local).unwrap();
    assert!(report.valid);
    assert_eq!(report.entries, 1);
}

#[test]
fn journaled_delete_wins_over_stale_catalog() {
    let dir = TempDir::new().unwrap();
    let (kept, deleted);
    {
        let manager = file_manager(&dir);
        kept = manager.upsert(snippet("kept", "k()", Scope::Local)).unwrap().item.id;
        deleted = manager
            .upsert(snippet("deleted", "d()", Scope::Local))
            .unwrap()
            .item
            .id;
        manager.flush(Scope::Local).unwrap();
        manager.delete(&deleted, None).unwrap();
        // Crash shape: the delete journaled, but resurrect the item file as
        // if the removal raced the crash
        std::fs::write(
            dir.path().join(format!("local/items/{deleted}.json")),
            serde_json::to_vec(&manager.get(&kept, None).unwrap()).unwrap(),
        )
        .unwrap();
    }

    let manager = file_manager(&dir);
    assert!(manager.get(&kept, None).is_ok());
    // Startup replay re-applies the journaled delete
    assert!(manager.get(&deleted, None).is_err());
}

#[test]
fn compact_then_verify_reports_clean() {
    let dir = TempDir::new().unwrap();
    let manager = file_manager(&dir);
    for n in 0..20 {
        manager
            .upsert(snippet(&format!("c{n}"), &format!("c{n}()"), Scope::Local))
            .unwrap();
    }
    let report = manager.compact(Scope::Local).unwrap();
    assert_eq!(report.live_items, 20);

    let verify = manager.verify(Scope::Local).unwrap();
    assert!(verify.ok, "problems: {:?}", verify.problems);
    assert_eq!(
        verify.snapshot_checksum.as_deref(),
        Some(report.checksum.as_str())
    );
    assert_eq!(
        verify.state_ok_checksum.as_deref(),
        Some(report.checksum.as_str())
    );

    // Queries behave identically after compaction
    let results = manager
        .query(engram::QueryRequest {
            q: Some("c7".into()),
            k: 5,
            ..Default::default()
        })
        .unwrap();
    assert!(!results.items.is_empty());
}
