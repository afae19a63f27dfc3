//! Memory manager: scope orchestration and the public operation surface
//!
//! One [`MemoryManager`] owns the three scopes (global, local, committed),
//! each a storage adapter plus its inverted and vector indices. It exposes
//! the full operation set: upsert/get/delete/list/query/context-pack, the
//! quality mutations (link, pin, tag, feedback, use, renew), the body edits
//! (patch, append, merge), and per-scope maintenance.
//!
//! Reads without an explicit scope resolve committed → local → global and
//! return the first hit. Writes invalidate every cached query spanning the
//! written scope.

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use engram_core::cancel::{deadlines, CancellationToken};
use engram_core::config::{EnvOverrides, StoreConfig};
use engram_core::error::{Error, Result};
use engram_core::id::IdGenerator;
use engram_core::redact::RedactionCatalog;
use engram_core::types::{
    ContextInfo, Facets, Link, MemoryId, MemoryItem, MemoryItemSummary, MemoryType, Quality,
    Relation, Scope, Security, Sensitivity,
};
use engram_index::inverted::IndexDoc;
use engram_index::{parse_query, InvertedIndex, VectorIndex};
use engram_store::adapter::{open_store, StorageAdapter, StoreStats, VerifyReport};
use engram_store::journal::{JournalStats, JournalVerifyReport};
use engram_store::layout::ScopePaths;

use crate::confidence::{confidence, touch_usage};
use crate::context_pack::{build_pack, ContextPack, PackOptions};
use crate::query::{
    rank, Candidate, QueryHit, QueryRequest, QueryResponse, CANDIDATE_FACTOR,
};
use crate::query_cache::QueryCache;

// ============================================================================
// Requests
// ============================================================================

/// Input to `upsert`: the caller-controlled subset of an item
#[derive(Debug, Clone, Default)]
pub struct UpsertRequest {
    /// Absent for new items; present to mutate an existing one
    pub id: Option<MemoryId>,
    pub kind: Option<MemoryType>,
    pub scope: Option<Scope>,
    pub title: Option<String>,
    pub text: Option<String>,
    pub code: Option<String>,
    pub language: Option<String>,
    pub facets: Facets,
    pub context: ContextInfo,
    pub links: Vec<Link>,
    pub ttl_days: Option<u32>,
    pub sensitivity: Option<Sensitivity>,
}

/// What `upsert` hands back
#[derive(Debug, Clone)]
pub struct UpsertOutcome {
    pub item: MemoryItem,
    pub content_hash: String,
}

/// Partial body edit
#[derive(Debug, Clone, Default)]
pub struct PatchRequest {
    pub title: Option<String>,
    pub text: Option<String>,
    pub code: Option<String>,
    pub language: Option<String>,
}

// ============================================================================
// Scope handle
// ============================================================================

/// One scope's store and indices
pub struct ScopeHandle {
    pub store: Arc<dyn StorageAdapter>,
    pub inverted: Arc<InvertedIndex>,
    pub vectors: Arc<VectorIndex>,
    /// Set after an unrecoverable integrity failure: reads allowed, writes
    /// refused until maintenance repairs the scope
    pub read_only: AtomicBool,
}

impl ScopeHandle {
    fn check_writable(&self, scope: Scope) -> Result<()> {
        if self.read_only.load(Ordering::Acquire) {
            return Err(Error::Integrity(format!(
                "scope {scope} is read-only pending repair"
            )));
        }
        Ok(())
    }
}

// ============================================================================
// MemoryManager
// ============================================================================

/// The memory engine: three scopes behind one operation surface
pub struct MemoryManager {
    base_dir: PathBuf,
    config: StoreConfig,
    env: EnvOverrides,
    scopes: RwLock<HashMap<Scope, Arc<ScopeHandle>>>,
    id_gen: IdGenerator,
    redaction: RedactionCatalog,
    query_cache: QueryCache,
    pub(crate) scheduler: Mutex<Option<crate::maintenance::SchedulerHandle>>,
}

impl MemoryManager {
    /// Open every scope under `base_dir` and run startup recovery
    pub fn open(base_dir: PathBuf, config: StoreConfig, env: EnvOverrides) -> Result<Self> {
        config.validate()?;
        let manager = MemoryManager {
            base_dir,
            config,
            env,
            scopes: RwLock::new(HashMap::new()),
            id_gen: IdGenerator::new(),
            redaction: RedactionCatalog::builtin(),
            query_cache: QueryCache::new(),
            scheduler: Mutex::new(None),
        };
        for &scope in Scope::resolution_order() {
            let handle = manager.open_scope(scope)?;
            manager.scopes.write().insert(scope, handle);
        }
        if manager.env.skip_startup_replay {
            info!("startup replay deferred by environment");
        } else {
            for &scope in Scope::resolution_order() {
                manager.replay(scope)?;
            }
        }
        Ok(manager)
    }

    /// Open with defaults resolved from the environment
    pub fn open_default() -> Result<Self> {
        let env = EnvOverrides::from_env();
        let base = env.resolve_home();
        let config_path = base.join("config.json");
        let config = if config_path.exists() {
            StoreConfig::from_json(&std::fs::read_to_string(&config_path)?)?
        } else {
            StoreConfig::default()
        };
        Self::open(base, config, env)
    }

    fn open_scope(&self, scope: Scope) -> Result<Arc<ScopeHandle>> {
        let paths = ScopePaths::new(&self.base_dir, scope);
        let store = open_store(paths, &self.config, self.env.force_backend)?;
        let inverted = Arc::new(InvertedIndex::open(
            &store.paths().inverted_index(),
            &store.paths().index_meta(),
            self.config.maintenance.index_flush.clone(),
            self.config.ranking.field_weights.clone(),
        )?);
        let vectors = Arc::new(VectorIndex::open(&store.paths().vectors())?);
        let handle = Arc::new(ScopeHandle {
            store,
            inverted,
            vectors,
            read_only: AtomicBool::new(false),
        });
        if handle.inverted.needs_rebuild() {
            self.rebuild_index(&handle)?;
        }
        Ok(handle)
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn base_dir(&self) -> &PathBuf {
        &self.base_dir
    }

    pub(crate) fn handle(&self, scope: Scope) -> Result<Arc<ScopeHandle>> {
        self.scopes
            .read()
            .get(&scope)
            .cloned()
            .ok_or_else(|| Error::Store(format!("scope {scope} is not open")))
    }

    pub(crate) fn replace_handle(&self, scope: Scope, handle: Arc<ScopeHandle>) {
        self.scopes.write().insert(scope, handle);
        self.query_cache.invalidate_scope(scope);
    }

    pub(crate) fn take_handle(&self, scope: Scope) -> Option<Arc<ScopeHandle>> {
        self.scopes.write().remove(&scope)
    }

    pub(crate) fn invalidate_scopes(&self, scopes: &[Scope]) {
        for &scope in scopes {
            self.query_cache.invalidate_scope(scope);
        }
    }

    /// Reopen one scope from disk (after a migration swapped directories)
    pub(crate) fn reopen_scope(&self, scope: Scope) -> Result<()> {
        let handle = self.open_scope(scope)?;
        self.replace_handle(scope, handle);
        Ok(())
    }

    /// Resolve the scope holding `id`: committed → local → global
    fn resolve(&self, id: &MemoryId, scope: Option<Scope>) -> Result<(Scope, Arc<ScopeHandle>)> {
        match scope {
            Some(scope) => {
                let handle = self.handle(scope)?;
                if handle.store.contains(id) {
                    Ok((scope, handle))
                } else {
                    Err(Error::NotFound(id.to_string()))
                }
            }
            None => {
                for &scope in Scope::resolution_order() {
                    let handle = self.handle(scope)?;
                    if handle.store.contains(id) {
                        return Ok((scope, handle));
                    }
                }
                Err(Error::NotFound(id.to_string()))
            }
        }
    }

    // ========================================================================
    // Core operations
    // ========================================================================

    /// Create or mutate an item
    pub fn upsert(&self, request: UpsertRequest) -> Result<UpsertOutcome> {
        self.upsert_with(request, &CancellationToken::with_timeout(deadlines::UPSERT))
    }

    /// `upsert` with an explicit cancellation token
    pub fn upsert_with(
        &self,
        request: UpsertRequest,
        cancel: &CancellationToken,
    ) -> Result<UpsertOutcome> {
        let scope = request.scope.unwrap_or(Scope::Local);
        let handle = self.handle(scope)?;
        handle.check_writable(scope)?;

        // Redaction precedes any persistence
        let mut secret_refs = Vec::new();
        let mut redacted = |field: Option<String>| {
            field.map(|value| {
                let (clean, hashes) = self.redaction.redact(&value);
                secret_refs.extend(hashes);
                clean
            })
        };
        let title = redacted(request.title);
        let text = redacted(request.text);
        let code = redacted(request.code);

        let now = Utc::now();
        let prior = request
            .id
            .as_ref()
            .and_then(|id| handle.store.get_summary(id));
        let (id, created_at, version, mut quality, mut security) = match &prior {
            Some(prior) => (
                prior.id.clone(),
                prior.created_at,
                prior.version + 1,
                prior.quality.clone(),
                prior.security.clone(),
            ),
            None => {
                let id = match request.id {
                    Some(id) => id,
                    None => self.id_gen.next()?,
                };
                (id, now, 1, Quality::default(), Security::default())
            }
        };
        let kind = match (request.kind, &prior) {
            (Some(kind), _) => kind,
            (None, Some(prior)) => prior.kind,
            (None, None) => {
                return Err(Error::InvalidInput("upsert requires a type for new items".into()))
            }
        };
        if let Some(ttl) = request.ttl_days {
            quality.ttl_days = Some(ttl);
        }
        if let Some(sensitivity) = request.sensitivity {
            security.sensitivity = sensitivity;
        }
        security.secret_hash_refs.extend(secret_refs);
        security.secret_hash_refs.dedup();

        let mut item = MemoryItem {
            id,
            kind,
            scope,
            title,
            text,
            code,
            language: request.language,
            facets: request.facets,
            context: request.context,
            quality,
            security,
            links: request.links,
            created_at,
            updated_at: now,
            version,
        };
        let breakdown = confidence(
            &item.quality,
            &item.context,
            &item.facets,
            None,
            &self.config.confidence,
            now,
        );
        item.quality.confidence = breakdown.confidence;

        let payload = handle.store.write_item(&item, cancel)?;
        self.index_item(&handle, &item);
        self.query_cache.invalidate_scope(scope);

        Ok(UpsertOutcome {
            content_hash: payload.content_hash,
            item,
        })
    }

    fn index_item(&self, handle: &ScopeHandle, item: &MemoryItem) {
        handle.inverted.index_doc(
            &item.id,
            &IndexDoc {
                title: item.title.clone(),
                text: item.text.clone(),
                code: item.code.clone(),
                tags: item.facets.tags.iter().cloned().collect(),
            },
        );
        let paths = handle.store.paths();
        if let Err(e) = handle
            .inverted
            .maybe_flush(&paths.inverted_index(), &paths.index_meta())
        {
            warn!(error = %e, "index flush failed; retrying on next write");
        }
    }

    /// Fetch an item; without a scope, committed → local → global
    pub fn get(&self, id: &MemoryId, scope: Option<Scope>) -> Result<MemoryItem> {
        let cancel = CancellationToken::with_timeout(deadlines::QUERY);
        let (_, handle) = self.resolve(id, scope)?;
        handle
            .store
            .read_item(id, &cancel)?
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    /// Delete an item from a scope (or wherever it resolves)
    pub fn delete(&self, id: &MemoryId, scope: Option<Scope>) -> Result<bool> {
        let (scope, handle) = self.resolve(id, scope)?;
        handle.check_writable(scope)?;
        let removed = handle.store.delete_item(id)?;
        handle.inverted.remove_doc(id);
        handle.vectors.remove(id);
        let paths = handle.store.paths();
        handle
            .inverted
            .maybe_flush(&paths.inverted_index(), &paths.index_meta())?;
        self.query_cache.invalidate_scope(scope);
        Ok(removed)
    }

    /// Summaries, ordered by id (creation time)
    pub fn list(&self, scope: Option<Scope>) -> Result<Vec<MemoryItemSummary>> {
        let mut summaries = Vec::new();
        let scopes: Vec<Scope> = match scope {
            Some(scope) => vec![scope],
            None => Scope::resolution_order().to_vec(),
        };
        for scope in scopes {
            summaries.extend(self.handle(scope)?.store.list_summaries());
        }
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(summaries)
    }

    // ========================================================================
    // Query
    // ========================================================================

    /// Ranked search across one or all scopes
    pub fn query(&self, request: QueryRequest) -> Result<QueryResponse> {
        if request.k == 0 {
            return Err(Error::InvalidInput("query k must be positive".into()));
        }
        let key = QueryCache::key(&request);
        if let Some(cached) = self.query_cache.get(&key) {
            return Ok(cached);
        }

        let cancel = CancellationToken::with_timeout(deadlines::QUERY);
        let scopes: Vec<Scope> = match request.scope {
            Some(scope) => vec![scope],
            None => Scope::resolution_order().to_vec(),
        };

        let parsed = request.q.as_deref().map(parse_query);
        let mut candidates = Vec::new();
        for &scope in &scopes {
            let handle = self.handle(scope)?;
            match &parsed {
                Some(parsed) if !parsed.terms.is_empty() => {
                    let mut scored = handle.inverted.score(parsed, &self.config.ranking);
                    // Over-fetch BM25 candidates before filtering and boosts
                    scored.sort_by(|a, b| {
                        b.1.total()
                            .partial_cmp(&a.1.total())
                            .unwrap_or(std::cmp::Ordering::Equal)
                            .then_with(|| a.0.cmp(&b.0))
                    });
                    scored.truncate(request.k * CANDIDATE_FACTOR);
                    for (id, lexical) in scored {
                        let Some(summary) = handle.store.get_summary(&id) else {
                            continue;
                        };
                        let vector_score = match &request.vector {
                            Some(query_vec) => handle.vectors.similarity(&id, query_vec)?,
                            None => None,
                        };
                        candidates.push(Candidate {
                            summary,
                            lexical,
                            vector_score,
                        });
                    }
                    // A pure-vector neighbor can outrank weak lexical hits
                    if let Some(query_vec) = &request.vector {
                        if self.config.ranking.hybrid.enabled {
                            for (id, score) in handle
                                .vectors
                                .search(query_vec, request.k * CANDIDATE_FACTOR)?
                            {
                                if candidates.iter().any(|c| c.summary.id == id) {
                                    continue;
                                }
                                if let Some(summary) = handle.store.get_summary(&id) {
                                    candidates.push(Candidate {
                                        summary,
                                        lexical: Default::default(),
                                        vector_score: Some(score),
                                    });
                                }
                            }
                        }
                    }
                }
                _ => {
                    // No query text: every summary is a candidate and
                    // ranking falls to boosts and confidence
                    for summary in handle.store.list_summaries() {
                        let vector_score = match &request.vector {
                            Some(query_vec) => {
                                handle.vectors.similarity(&summary.id, query_vec)?
                            }
                            None => None,
                        };
                        candidates.push(Candidate {
                            summary,
                            lexical: Default::default(),
                            vector_score,
                        });
                    }
                }
            }
        }

        let ranked = rank(candidates, &request, &self.config, Utc::now());
        let total = ranked.len();
        let mut items = Vec::with_capacity(request.k.min(total));
        for ranked in ranked.into_iter().take(request.k) {
            let handle = self.handle(ranked.scope)?;
            let Some(item) = handle.store.read_item(&ranked.id, &cancel)? else {
                continue;
            };
            items.push(QueryHit {
                item,
                score: ranked.score,
                components: ranked.components,
            });
        }
        let response = QueryResponse { items, total };
        self.query_cache.put(key, scopes, response.clone());
        Ok(response)
    }

    /// Query, then shape the hits into a budgeted context pack
    pub fn context_pack(
        &self,
        request: QueryRequest,
        options: PackOptions,
    ) -> Result<ContextPack> {
        let response = self.query(request)?;
        Ok(build_pack(&response.items, &options))
    }

    // ========================================================================
    // Quality and link mutations
    // ========================================================================

    fn mutate_summary(
        &self,
        id: &MemoryId,
        scope: Option<Scope>,
        bump_version: bool,
        mutate: impl FnOnce(&mut MemoryItemSummary),
    ) -> Result<MemoryItemSummary> {
        let (scope, handle) = self.resolve(id, scope)?;
        handle.check_writable(scope)?;
        let mut summary = handle
            .store
            .get_summary(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        mutate(&mut summary);
        if bump_version {
            summary.version += 1;
            summary.updated_at = Utc::now();
        }
        let breakdown = confidence(
            &summary.quality,
            &summary.context,
            &summary.facets,
            None,
            &self.config.confidence,
            Utc::now(),
        );
        summary.quality.confidence = breakdown.confidence;
        handle.store.update_summary(summary.clone())?;
        self.query_cache.invalidate_scope(scope);
        Ok(summary)
    }

    /// Add a directed link between items
    pub fn link(
        &self,
        id: &MemoryId,
        target: &MemoryId,
        relation: Relation,
        scope: Option<Scope>,
    ) -> Result<()> {
        // The target must exist somewhere, but links never own their target
        self.resolve(target, None)?;
        let (_, handle) = self.resolve(id, scope)?;
        self.mutate_summary(id, scope, true, |summary| {
            let link = Link {
                target_id: target.clone(),
                relation,
            };
            if !summary.links.contains(&link) {
                summary.links.push(link);
            }
        })?;
        handle.store.append_link_entry(id)?;
        Ok(())
    }

    /// Resolve links transitively with a visited set
    pub fn related(&self, id: &MemoryId, max_depth: usize) -> Result<Vec<(MemoryId, Relation)>> {
        let mut visited = std::collections::HashSet::new();
        let mut out = Vec::new();
        let mut frontier = vec![(id.clone(), 0usize)];
        visited.insert(id.clone());
        while let Some((current, depth)) = frontier.pop() {
            if depth >= max_depth {
                continue;
            }
            let Ok((_, handle)) = self.resolve(&current, None) else {
                continue;
            };
            let Some(summary) = handle.store.get_summary(&current) else {
                continue;
            };
            for link in summary.links {
                if visited.insert(link.target_id.clone()) {
                    out.push((link.target_id.clone(), link.relation));
                    frontier.push((link.target_id, depth + 1));
                }
            }
        }
        Ok(out)
    }

    pub fn pin(&self, id: &MemoryId, scope: Option<Scope>) -> Result<()> {
        self.mutate_summary(id, scope, true, |s| s.quality.pinned = true)
            .map(|_| ())
    }

    pub fn unpin(&self, id: &MemoryId, scope: Option<Scope>) -> Result<()> {
        self.mutate_summary(id, scope, true, |s| s.quality.pinned = false)
            .map(|_| ())
    }

    /// Add and remove tags; the tag field re-indexes
    pub fn tag(
        &self,
        id: &MemoryId,
        add: &[String],
        remove: &[String],
        scope: Option<Scope>,
    ) -> Result<()> {
        let summary = self.mutate_summary(id, scope, true, |s| {
            for tag in add {
                s.facets.tags.insert(tag.clone());
            }
            for tag in remove {
                s.facets.tags.remove(tag);
            }
        })?;
        // Re-index with the new tag set
        let (_, handle) = self.resolve(id, Some(summary.scope))?;
        let item = self.get(id, Some(summary.scope))?;
        self.index_item(&handle, &item);
        Ok(())
    }

    /// Record helpful / not-helpful feedback
    pub fn feedback(&self, id: &MemoryId, helpful: bool, scope: Option<Scope>) -> Result<f32> {
        let summary = self.mutate_summary(id, scope, false, |s| {
            if helpful {
                s.quality.helpful_count += 1;
            } else {
                s.quality.not_helpful_count += 1;
            }
            s.quality.last_feedback_at = Some(Utc::now());
        })?;
        Ok(summary.quality.confidence)
    }

    /// Record a use: decayed usage, reuse count, last-used timestamp
    pub fn use_item(&self, id: &MemoryId, scope: Option<Scope>) -> Result<()> {
        let config = self.config.confidence.clone();
        self.mutate_summary(id, scope, false, |s| {
            let now = Utc::now();
            touch_usage(&mut s.quality, &config, now);
            s.quality.reuse_count += 1;
            s.quality.last_used_at = Some(now);
        })
        .map(|_| ())
    }

    /// Restart the TTL clock (and optionally change the TTL)
    pub fn renew(&self, id: &MemoryId, ttl_days: Option<u32>, scope: Option<Scope>) -> Result<()> {
        self.mutate_summary(id, scope, true, |s| {
            if ttl_days.is_some() {
                s.quality.ttl_days = ttl_days;
            }
        })
        .map(|_| ())
    }

    // ========================================================================
    // Body edits (read-modify-write upserts)
    // ========================================================================

    /// Replace individual body fields
    pub fn patch(&self, id: &MemoryId, patch: PatchRequest, scope: Option<Scope>) -> Result<UpsertOutcome> {
        let (scope, _) = self.resolve(id, scope)?;
        let current = self.get(id, Some(scope))?;
        self.upsert(UpsertRequest {
            id: Some(id.clone()),
            kind: Some(current.kind),
            scope: Some(scope),
            title: patch.title.or(current.title),
            text: patch.text.or(current.text),
            code: patch.code.or(current.code),
            language: patch.language.or(current.language),
            facets: current.facets,
            context: current.context,
            links: current.links,
            ttl_days: None,
            sensitivity: None,
        })
    }

    /// Append text to the body
    pub fn append(&self, id: &MemoryId, suffix: &str, scope: Option<Scope>) -> Result<UpsertOutcome> {
        let (scope, _) = self.resolve(id, scope)?;
        let current = self.get(id, Some(scope))?;
        let text = match current.text {
            Some(existing) if !existing.is_empty() => format!("{existing}\n{suffix}"),
            _ => suffix.to_string(),
        };
        self.patch(
            id,
            PatchRequest {
                text: Some(text),
                ..Default::default()
            },
            Some(scope),
        )
    }

    /// Merge another item's facets, links, and missing body fields into this
    /// one, then delete the source
    pub fn merge(&self, id: &MemoryId, source: &MemoryId, scope: Option<Scope>) -> Result<UpsertOutcome> {
        let (scope, _) = self.resolve(id, scope)?;
        let target = self.get(id, Some(scope))?;
        let donor = self.get(source, None)?;

        let mut facets = target.facets.clone();
        facets.tags.extend(donor.facets.tags.iter().cloned());
        facets.files.extend(donor.facets.files.iter().cloned());
        facets.symbols.extend(donor.facets.symbols.iter().cloned());
        let mut links = target.links.clone();
        for link in donor.links {
            if link.target_id != *id && !links.contains(&link) {
                links.push(link);
            }
        }

        let outcome = self.upsert(UpsertRequest {
            id: Some(id.clone()),
            kind: Some(target.kind),
            scope: Some(scope),
            title: target.title.or(donor.title),
            text: merge_text(target.text, donor.text),
            code: target.code.or(donor.code),
            language: target.language.or(donor.language),
            facets,
            context: target.context,
            links,
            ttl_days: None,
            sensitivity: None,
        })?;
        self.delete(source, None)?;
        Ok(outcome)
    }

    // ========================================================================
    // Vectors
    // ========================================================================

    pub fn set_vector(&self, id: &MemoryId, vector: Vec<f32>, scope: Option<Scope>) -> Result<()> {
        let (scope, handle) = self.resolve(id, scope)?;
        handle.vectors.set(id.clone(), vector)?;
        handle.vectors.save(&handle.store.paths().vectors())?;
        self.query_cache.invalidate_scope(scope);
        Ok(())
    }

    pub fn remove_vector(&self, id: &MemoryId, scope: Option<Scope>) -> Result<bool> {
        let (scope, handle) = self.resolve(id, scope)?;
        let removed = handle.vectors.remove(id);
        handle.vectors.save(&handle.store.paths().vectors())?;
        self.query_cache.invalidate_scope(scope);
        Ok(removed)
    }

    pub fn import_vectors(
        &self,
        scope: Scope,
        pairs: Vec<(MemoryId, Vec<f32>)>,
    ) -> Result<usize> {
        let handle = self.handle(scope)?;
        let imported = handle.vectors.import_bulk(pairs)?;
        handle.vectors.save(&handle.store.paths().vectors())?;
        self.query_cache.invalidate_scope(scope);
        Ok(imported)
    }

    pub fn import_vectors_jsonl<R: std::io::BufRead>(
        &self,
        scope: Scope,
        reader: R,
    ) -> Result<usize> {
        let handle = self.handle(scope)?;
        let imported = handle.vectors.import_jsonl(reader)?;
        handle.vectors.save(&handle.store.paths().vectors())?;
        self.query_cache.invalidate_scope(scope);
        Ok(imported)
    }

    // ========================================================================
    // Recovery, maintenance plumbing
    // ========================================================================

    /// Startup replay for one scope: reconcile journal, catalog, and index
    pub fn replay(&self, scope: Scope) -> Result<()> {
        let handle = self.handle(scope)?;
        let paths = handle.store.paths();
        let since = engram_store::meta::load_snapshot_meta(&paths.snapshot_meta())?
            .map(|m| m.last_ts);

        // Journal entries after the last snapshot are authoritative for
        // liveness: a delete journaled before a crash wins over a catalog
        // that never saved, and an upsert with no recoverable body is
        // surfaced rather than silently forgotten
        let mut live_after_replay: HashMap<MemoryId, bool> = HashMap::new();
        for entry in handle.store.journal_entries_since(since)? {
            use engram_core::types::JournalOp;
            match entry.op {
                JournalOp::Upsert => live_after_replay.insert(entry.id, true),
                JournalOp::Delete => live_after_replay.insert(entry.id, false),
                JournalOp::Link => None,
            };
        }
        for (id, &live) in &live_after_replay {
            if !live && handle.store.contains(id) {
                info!(%scope, %id, "replay re-applies journaled delete");
                handle.store.delete_item(id)?;
                handle.inverted.remove_doc(id);
                handle.vectors.remove(id);
            } else if live && !handle.store.contains(id) {
                warn!(%scope, %id, "journaled upsert has no recoverable body");
            }
        }

        // The adapters reconcile their own storage at open; here the index
        // is brought into agreement with the catalog
        let mut indexed = 0usize;
        let cancel = CancellationToken::new();
        for summary in handle.store.list_summaries() {
            if !handle.inverted.contains(&summary.id) {
                if let Some(item) = handle.store.read_item(&summary.id, &cancel)? {
                    self.index_item(&handle, &item);
                    indexed += 1;
                }
            }
        }
        let mut dropped = 0usize;
        for id in handle.inverted.doc_ids() {
            if !handle.store.contains(&id) {
                handle.inverted.remove_doc(&id);
                dropped += 1;
            }
        }
        if indexed > 0 || dropped > 0 {
            let paths = handle.store.paths();
            handle
                .inverted
                .flush(&paths.inverted_index(), &paths.index_meta())?;
            info!(%scope, indexed, dropped, "reconciled inverted index");
        }
        // Vectors for ids that no longer exist
        for id in handle.vectors.ids() {
            if !handle.store.contains(&id) {
                handle.vectors.remove(&id);
            }
        }

        // State-ok check: a checksum that diverges with zero journal appends
        // since the snapshot cannot be explained by pending writes
        if handle.store.appends_since_snapshot() == 0 {
            if let Some(marker) =
                engram_store::meta::load_state_ok(&paths.state_ok())?
            {
                let report = handle.store.verify()?;
                if report.computed_checksum != marker.checksum {
                    warn!(
                        %scope,
                        computed = %report.computed_checksum,
                        recorded = %marker.checksum,
                        "state-ok mismatch; scope is read-only until rebuilt"
                    );
                    handle.read_only.store(true, Ordering::Release);
                }
            }
        }
        Ok(())
    }

    /// Re-tokenize everything and rewrite the inverted index
    pub fn rebuild_index(&self, handle: &ScopeHandle) -> Result<usize> {
        let cancel = CancellationToken::new();
        handle.inverted.clear();
        let mut count = 0usize;
        for summary in handle.store.list_summaries() {
            if let Some(item) = handle.store.read_item(&summary.id, &cancel)? {
                handle.inverted.index_doc(
                    &item.id,
                    &IndexDoc {
                        title: item.title.clone(),
                        text: item.text.clone(),
                        code: item.code.clone(),
                        tags: item.facets.tags.iter().cloned().collect(),
                    },
                );
                count += 1;
            }
        }
        let paths = handle.store.paths();
        handle
            .inverted
            .flush(&paths.inverted_index(), &paths.index_meta())?;
        info!(scope = %handle.store.scope(), count, "rebuilt inverted index");
        Ok(count)
    }

    /// Full rebuild: index from storage, then clear the read-only latch
    pub fn rebuild(&self, scope: Scope) -> Result<usize> {
        let handle = self.handle(scope)?;
        let count = self.rebuild_index(&handle)?;
        handle.read_only.store(false, Ordering::Release);
        self.query_cache.invalidate_scope(scope);
        Ok(count)
    }

    /// Compact one scope now
    pub fn compact(&self, scope: Scope) -> Result<engram_store::adapter::CompactionReport> {
        let handle = self.handle(scope)?;
        let cancel = CancellationToken::new();
        let report = handle.store.compact(&cancel)?;
        self.query_cache.invalidate_scope(scope);
        Ok(report)
    }

    /// Write checkpoint markers for the current state without compacting
    pub fn snapshot(&self, scope: Scope) -> Result<String> {
        let handle = self.handle(scope)?;
        let cancel = CancellationToken::new();
        handle.store.flush(&cancel)?;
        let report = handle.store.verify()?;
        engram_store::meta::write_checkpoint(
            handle.store.paths(),
            &report.computed_checksum,
            handle.store.item_count(),
        )?;
        Ok(report.computed_checksum)
    }

    pub fn verify(&self, scope: Scope) -> Result<VerifyReport> {
        self.handle(scope)?.store.verify()
    }

    /// Remove TTL-expired items; video frame ranges wait for compaction
    pub fn prune(&self, scope: Scope) -> Result<Vec<MemoryId>> {
        let handle = self.handle(scope)?;
        handle.check_writable(scope)?;
        let now = Utc::now();
        let mut pruned = Vec::new();
        for summary in handle.store.list_summaries() {
            let expired = summary
                .quality
                .ttl_days
                .map(|days| summary.updated_at + chrono::Duration::days(days as i64) < now)
                .unwrap_or(false);
            if expired && !summary.quality.pinned {
                handle.store.delete_item(&summary.id)?;
                handle.inverted.remove_doc(&summary.id);
                handle.vectors.remove(&summary.id);
                pruned.push(summary.id);
            }
        }
        if !pruned.is_empty() {
            let paths = handle.store.paths();
            handle
                .inverted
                .flush(&paths.inverted_index(), &paths.index_meta())?;
            self.query_cache.invalidate_scope(scope);
            info!(%scope, pruned = pruned.len(), "pruned expired items");
        }
        Ok(pruned)
    }

    /// Block until background work in a scope is durable
    pub fn flush(&self, scope: Scope) -> Result<()> {
        let handle = self.handle(scope)?;
        let cancel = CancellationToken::new();
        handle.store.flush(&cancel)?;
        let paths = handle.store.paths();
        handle
            .inverted
            .flush(&paths.inverted_index(), &paths.index_meta())
    }

    pub fn journal_stats(&self, scope: Scope) -> Result<JournalStats> {
        self.handle(scope)?.store.journal_stats()
    }

    pub fn journal_verify(&self, scope: Scope) -> Result<JournalVerifyReport> {
        self.handle(scope)?.store.journal_verify()
    }

    pub fn stats(&self, scope: Scope) -> Result<StoreStats> {
        Ok(self.handle(scope)?.store.stats())
    }
}

impl Drop for MemoryManager {
    fn drop(&mut self) {
        if let Some(scheduler) = self.scheduler.lock().take() {
            scheduler.stop();
        }
    }
}

fn merge_text(target: Option<String>, donor: Option<String>) -> Option<String> {
    match (target, donor) {
        (Some(t), Some(d)) if !t.is_empty() && !d.is_empty() && t != d => {
            Some(format!("{t}\n{d}"))
        }
        (Some(t), _) if !t.is_empty() => Some(t),
        (_, donor) => donor,
    }
}
