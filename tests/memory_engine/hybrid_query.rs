//! Lexical, hybrid, and cached queries

use std::sync::Arc;

use crate::snippet;
use engram::config::{BackendKind, StoreConfig};
use engram::{MemoryManager, QueryRequest, Scope};
use engram_core::config::EnvOverrides;
use tempfile::TempDir;

fn hybrid_manager(dir: &TempDir) -> Arc<MemoryManager> {
    let mut config = StoreConfig::default();
    config.storage.backend = BackendKind::File;
    config.ranking.hybrid.enabled = true;
    Arc::new(
        MemoryManager::open(dir.path().to_path_buf(), config, EnvOverrides::default()).unwrap(),
    )
}

#[test]
fn title_bm25_dominates_vector_similarity() {
    // Three items; the vector favors "JWT rotation" but the lexical title
    // match on "auth flow" must win under the 0.7/0.3 blend
    let dir = TempDir::new().unwrap();
    let manager = hybrid_manager(&dir);

    let auth = manager.upsert(snippet("auth flow", "a()", Scope::Local)).unwrap();
    let login = manager.upsert(snippet("login form", "b()", Scope::Local)).unwrap();
    let jwt = manager.upsert(snippet("JWT rotation", "c()", Scope::Local)).unwrap();

    manager.set_vector(&auth.item.id, vec![1.0, 0.0, 0.0, 0.0], None).unwrap();
    manager.set_vector(&login.item.id, vec![0.5, 0.5, 0.0, 0.0], None).unwrap();
    manager.set_vector(&jwt.item.id, vec![0.0, 1.0, 0.0, 0.0], None).unwrap();

    let results = manager
        .query(QueryRequest {
            q: Some("auth".into()),
            vector: Some(vec![0.0, 1.0, 0.0, 0.0]),
            k: 3,
            ..Default::default()
        })
        .unwrap();

    assert_eq!(results.items[0].item.id, auth.item.id);
    assert!(results.items[0].components.bm25 > 0.0);
}

#[test]
fn query_results_are_deterministic() {
    let dir = TempDir::new().unwrap();
    let manager = hybrid_manager(&dir);
    for n in 0..10 {
        manager
            .upsert(snippet(
                &format!("handler {n}"),
                "fn handle() {}",
                Scope::Local,
            ))
            .unwrap();
    }

    let request = || QueryRequest {
        q: Some("handler".into()),
        k: 10,
        ..Default::default()
    };
    let first: Vec<_> = manager
        .query(request())
        .unwrap()
        .items
        .iter()
        .map(|hit| (hit.item.id.clone(), hit.score))
        .collect();
    for _ in 0..5 {
        let next: Vec<_> = manager
            .query(request())
            .unwrap()
            .items
            .iter()
            .map(|hit| (hit.item.id.clone(), hit.score))
            .collect();
        assert_eq!(next, first);
    }
}

#[test]
fn phrase_and_exact_title_bonuses_surface_in_components() {
    let dir = TempDir::new().unwrap();
    let manager = hybrid_manager(&dir);

    manager
        .upsert(snippet("token rotation", "rotate()", Scope::Local))
        .unwrap();
    manager
        .upsert(snippet("rotation schedule for token", "cron()", Scope::Local))
        .unwrap();

    let results = manager
        .query(QueryRequest {
            q: Some("\"token rotation\"".into()),
            k: 2,
            ..Default::default()
        })
        .unwrap();
    let top = &results.items[0];
    assert_eq!(top.item.title.as_deref(), Some("token rotation"));
    assert!(top.components.phrase_bonus > 0.0);
    assert!(top.components.exact_title_bonus > 0.0);
}

#[test]
fn writes_invalidate_cached_queries() {
    let dir = TempDir::new().unwrap();
    let manager = hybrid_manager(&dir);

    manager.upsert(snippet("cache one", "a()", Scope::Local)).unwrap();
    let request = || QueryRequest {
        q: Some("cache".into()),
        k: 10,
        ..Default::default()
    };
    assert_eq!(manager.query(request()).unwrap().items.len(), 1);

    // A second matching item must appear despite the cached first response
    manager.upsert(snippet("cache two", "b()", Scope::Local)).unwrap();
    assert_eq!(manager.query(request()).unwrap().items.len(), 2);
}

#[test]
fn dimension_mismatch_is_rejected() {
    let dir = TempDir::new().unwrap();
    let manager = hybrid_manager(&dir);
    let a = manager.upsert(snippet("vec a", "a()", Scope::Local)).unwrap();
    manager.set_vector(&a.item.id, vec![1.0, 0.0], None).unwrap();

    let b = manager.upsert(snippet("vec b", "b()", Scope::Local)).unwrap();
    let err = manager
        .set_vector(&b.item.id, vec![1.0, 0.0, 0.0], None)
        .unwrap_err();
    assert_eq!(err.code(), "DimensionMismatch");
}
