//! TTL pruning and scope migration

use crate::{file_manager, snippet};
use engram::types::MemoryType;
use engram::{Scope, ScopeFilter, UpsertRequest};
use tempfile::TempDir;

#[test]
fn prune_removes_expired_items_only() {
    let dir = TempDir::new().unwrap();
    let manager = file_manager(&dir);

    let expired = manager
        .upsert(UpsertRequest {
            ttl_days: Some(1),
            ..snippet("expired", "e()", Scope::Local)
        })
        .unwrap();
    let fresh = manager
        .upsert(UpsertRequest {
            ttl_days: Some(30),
            ..snippet("fresh", "f()", Scope::Local)
        })
        .unwrap();
    let eternal = manager.upsert(snippet("eternal", "n()", Scope::Local)).unwrap();

    // Backdate the expired item 48 hours by rewriting its file and catalog
    // through the store layer
    let mut item = manager.get(&expired.item.id, None).unwrap();
    item.updated_at = chrono::Utc::now() - chrono::Duration::hours(48);
    let store_dir = dir.path().join("local/items");
    std::fs::write(
        store_dir.join(format!("{}.json", item.id)),
        serde_json::to_vec_pretty(&item).unwrap(),
    )
    .unwrap();
    drop(manager);

    let manager = file_manager(&dir);
    let pruned = manager.prune(Scope::Local).unwrap();
    assert_eq!(pruned, vec![expired.item.id.clone()]);

    assert!(manager.get(&expired.item.id, None).is_err());
    manager.get(&fresh.item.id, None).unwrap();
    manager.get(&eternal.item.id, None).unwrap();

    // The index no longer answers for the pruned item
    let results = manager
        .query(engram::QueryRequest {
            q: Some("expired".into()),
            k: 5,
            ..Default::default()
        })
        .unwrap();
    assert!(results.items.is_empty());
}

#[test]
fn pinned_items_survive_prune() {
    let dir = TempDir::new().unwrap();
    let manager = file_manager(&dir);

    let pinned = manager
        .upsert(UpsertRequest {
            ttl_days: Some(1),
            ..snippet("pinned", "p()", Scope::Local)
        })
        .unwrap();
    manager.pin(&pinned.item.id, None).unwrap();

    let mut item = manager.get(&pinned.item.id, None).unwrap();
    item.updated_at = chrono::Utc::now() - chrono::Duration::hours(72);
    std::fs::write(
        dir.path().join(format!("local/items/{}.json", item.id)),
        serde_json::to_vec_pretty(&item).unwrap(),
    )
    .unwrap();
    drop(manager);

    let manager = file_manager(&dir);
    assert!(manager.prune(Scope::Local).unwrap().is_empty());
    manager.get(&pinned.item.id, None).unwrap();
}

#[test]
fn scope_migration_dry_run_lists_without_writing() {
    let dir = TempDir::new().unwrap();
    let manager = file_manager(&dir);

    let mut tagged = snippet("movable", "m()", Scope::Local);
    tagged.facets.tags.insert("promote".into());
    let movable = manager.upsert(tagged).unwrap();
    manager.upsert(snippet("staying", "s()", Scope::Local)).unwrap();

    let filter = ScopeFilter {
        tags: vec!["promote".into()],
        ..Default::default()
    };
    let report = manager
        .migrate_scope(Scope::Local, Scope::Committed, &filter, true)
        .unwrap();
    assert!(report.dry_run);
    assert_eq!(report.candidates, vec![movable.item.id.clone()]);
    assert_eq!(report.migrated, 0);

    // Nothing moved
    assert_eq!(manager.list(Some(Scope::Local)).unwrap().len(), 2);
    assert!(manager.list(Some(Scope::Committed)).unwrap().is_empty());
}

#[test]
fn scope_migration_moves_and_increments_version() {
    let dir = TempDir::new().unwrap();
    let manager = file_manager(&dir);

    let mut tagged = snippet("promoted", "p()", Scope::Local);
    tagged.facets.tags.insert("share".into());
    let outcome = manager.upsert(tagged).unwrap();
    let created_at = outcome.item.created_at;

    let filter = ScopeFilter {
        tags: vec!["share".into()],
        ..Default::default()
    };
    let report = manager
        .migrate_scope(Scope::Local, Scope::Committed, &filter, false)
        .unwrap();
    assert_eq!(report.migrated, 1);

    let moved = manager.get(&outcome.item.id, None).unwrap();
    assert_eq!(moved.scope, Scope::Committed);
    assert_eq!(moved.version, 2);
    assert_eq!(moved.created_at, created_at);
    assert!(moved.updated_at > outcome.item.updated_at);
    assert!(manager.get(&outcome.item.id, Some(Scope::Local)).is_err());

    // Search still finds it, now in the committed scope
    let results = manager
        .query(engram::QueryRequest {
            q: Some("promoted".into()),
            k: 5,
            ..Default::default()
        })
        .unwrap();
    assert_eq!(results.items[0].item.scope, Scope::Committed);
}

#[test]
fn scope_migration_content_regex_filter() {
    let dir = TempDir::new().unwrap();
    let manager = file_manager(&dir);

    manager
        .upsert(UpsertRequest {
            kind: Some(MemoryType::Note),
            text: Some("uses tokio::spawn internally".into()),
            scope: Some(Scope::Local),
            ..Default::default()
        })
        .unwrap();
    manager
        .upsert(UpsertRequest {
            kind: Some(MemoryType::Note),
            text: Some("plain threads only".into()),
            scope: Some(Scope::Local),
            ..Default::default()
        })
        .unwrap();

    let filter = ScopeFilter {
        content_regex: Some(r"tokio::\w+".into()),
        ..Default::default()
    };
    let report = manager
        .migrate_scope(Scope::Local, Scope::Global, &filter, true)
        .unwrap();
    assert_eq!(report.candidates.len(), 1);
}

#[test]
fn backend_migration_to_same_backend_is_noop() {
    let dir = TempDir::new().unwrap();
    let manager = file_manager(&dir);
    manager.upsert(snippet("still here", "s()", Scope::Local)).unwrap();

    let report = manager
        .migrate_storage_backend(
            Scope::Local,
            engram::config::BackendKind::File,
            true,
            None,
        )
        .unwrap();
    assert_eq!(report.migrated, 0);
    assert_eq!(manager.list(Some(Scope::Local)).unwrap().len(), 1);
}
