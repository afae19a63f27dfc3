//! Query result cache
//!
//! LRU of fully-hydrated query responses, keyed by a canonicalized query
//! (field-sorted JSON of the normalized request). Every cached entry records
//! which scopes it spanned; any write to one of those scopes, and any index
//! flush, invalidates the affected entries.

use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;

use engram_core::types::Scope;

use crate::query::{QueryRequest, QueryResponse};

/// Default cache capacity
pub const QUERY_CACHE_ENTRIES: usize = 100;

struct CachedQuery {
    scopes: Vec<Scope>,
    response: QueryResponse,
}

/// LRU cache over canonical query keys
pub struct QueryCache {
    entries: Mutex<LruCache<String, CachedQuery>>,
    hits: std::sync::atomic::AtomicU64,
    misses: std::sync::atomic::AtomicU64,
}

impl QueryCache {
    pub fn new() -> Self {
        Self::with_capacity(QUERY_CACHE_ENTRIES)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        QueryCache {
            entries: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity.max(1)).expect("capacity is at least 1"),
            )),
            hits: Default::default(),
            misses: Default::default(),
        }
    }

    /// Canonical cache key: field-sorted JSON of the normalized request
    ///
    /// List-valued filters are sorted and deduplicated so equivalent
    /// requests share a key regardless of argument order.
    pub fn key(request: &QueryRequest) -> String {
        let sorted = |values: &[String]| {
            let mut values: Vec<&String> = values.iter().collect();
            values.sort();
            values.dedup();
            values.into_iter().cloned().collect::<Vec<_>>()
        };
        let mut types: Vec<&'static str> = request
            .filters
            .types
            .iter()
            .map(|t| t.as_str())
            .collect();
        types.sort();
        types.dedup();

        // BTreeMap keys serialize sorted
        let mut map = std::collections::BTreeMap::new();
        map.insert(
            "filters",
            serde_json::json!({
                "createdAfter": request.filters.created_after,
                "createdBefore": request.filters.created_before,
                "files": sorted(&request.filters.files),
                "language": request.filters.language,
                "tags": sorted(&request.filters.tags),
                "types": types,
            }),
        );
        map.insert("k", serde_json::json!(request.k));
        map.insert(
            "q",
            serde_json::json!(request.q.as_deref().map(str::trim).map(str::to_lowercase)),
        );
        map.insert(
            "scope",
            serde_json::json!(request.scope.map(|s| s.as_str())),
        );
        map.insert("vector", serde_json::json!(request.vector));
        serde_json::to_string(&map).expect("cache key serialization is infallible")
    }

    pub fn get(&self, key: &str) -> Option<QueryResponse> {
        use std::sync::atomic::Ordering;
        let found = self.entries.lock().get(key).map(|c| c.response.clone());
        match &found {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        found
    }

    pub fn put(&self, key: String, scopes: Vec<Scope>, response: QueryResponse) {
        self.entries
            .lock()
            .put(key, CachedQuery { scopes, response });
    }

    /// Drop every entry whose result spanned the written scope
    pub fn invalidate_scope(&self, scope: Scope) {
        let mut entries = self.entries.lock();
        let stale: Vec<String> = entries
            .iter()
            .filter(|(_, cached)| cached.scopes.contains(&scope))
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale {
            entries.pop(&key);
        }
    }

    /// Drop everything (index flush)
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn request(q: &str, scope: Option<Scope>) -> QueryRequest {
        QueryRequest {
            q: Some(q.to_string()),
            scope,
            k: 5,
            ..Default::default()
        }
    }

    #[test]
    fn test_key_is_order_insensitive_for_filters() {
        let mut a = request("auth", None);
        a.filters.tags = vec!["b".into(), "a".into()];
        let mut b = request("auth", None);
        b.filters.tags = vec!["a".into(), "b".into(), "a".into()];
        assert_eq!(QueryCache::key(&a), QueryCache::key(&b));
    }

    #[test]
    fn test_key_normalizes_query_text() {
        assert_eq!(
            QueryCache::key(&request("  AUTH Flow ", None)),
            QueryCache::key(&request("auth flow", None))
        );
        assert_ne!(
            QueryCache::key(&request("auth", None)),
            QueryCache::key(&request("auth", Some(Scope::Local)))
        );
    }

    #[test]
    fn test_put_get_roundtrip() {
        let cache = QueryCache::new();
        let key = QueryCache::key(&request("auth", None));
        cache.put(key.clone(), vec![Scope::Local], QueryResponse::default());
        assert!(cache.get(&key).is_some());
        assert!(cache.get("other-key").is_none());
    }

    #[test]
    fn test_invalidate_scope_drops_spanning_entries() {
        let cache = QueryCache::new();
        let local_key = "local".to_string();
        let global_key = "global".to_string();
        cache.put(local_key.clone(), vec![Scope::Local], QueryResponse::default());
        cache.put(global_key.clone(), vec![Scope::Global], QueryResponse::default());

        cache.invalidate_scope(Scope::Local);
        assert!(cache.get(&local_key).is_none());
        assert!(cache.get(&global_key).is_some());
    }

    #[test]
    fn test_capacity_evicts_lru() {
        let cache = QueryCache::with_capacity(2);
        cache.put("a".into(), vec![], QueryResponse::default());
        cache.put("b".into(), vec![], QueryResponse::default());
        let _ = cache.get(&"a".to_string());
        cache.put("c".into(), vec![], QueryResponse::default());
        assert!(cache.get(&"b".to_string()).is_none());
        assert!(cache.get(&"a".to_string()).is_some());
    }
}
