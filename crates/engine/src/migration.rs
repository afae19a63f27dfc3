//! Migration engine
//!
//! Two migrations, both validating and restartable:
//!
//! - **Back-end** (file ↔ video within a scope): items stream into a fresh
//!   adapter under `<scope>_migration_<ts>/`; after every item lands and the
//!   optional re-read validation passes, the directories swap atomically
//!   (original → `<scope>_old_<ts>`, staging → scope). Any failure restores
//!   the original and deletes the staging area.
//! - **Scope** (global ↔ local ↔ committed) with content filters: matching
//!   items are rewritten with the new scope, a fresh `updated_at`, and a
//!   strictly incremented version, then removed from the source.
//!
//! Progress reports flow through a caller-supplied sink; the engine only
//! writes to it, never owns it.

use chrono::{DateTime, Utc};
use regex::Regex;
use std::sync::Arc;
use tracing::{info, warn};

use engram_core::cancel::{deadlines, CancellationToken};
use engram_core::config::BackendKind;
use engram_core::error::{Error, Result};
use engram_core::hash::content_hash;
use engram_core::types::{MemoryId, MemoryType, Scope};
use engram_index::inverted::IndexDoc;
use engram_store::adapter::open_store;
use engram_store::layout::ScopePaths;

use crate::manager::MemoryManager;

/// Items per progress callback
pub const DEFAULT_MIGRATION_BATCH: usize = 50;

/// Progress snapshot delivered to the caller's sink
#[derive(Debug, Clone, Copy)]
pub struct MigrationProgress {
    pub processed: usize,
    pub total: usize,
    pub errors: usize,
}

/// Caller-supplied progress sink
pub type ProgressSink = dyn Fn(MigrationProgress) + Send + Sync;

/// Outcome of a back-end migration
#[derive(Debug)]
pub struct BackendMigrationReport {
    pub scope: Scope,
    pub target: BackendKind,
    pub migrated: usize,
    pub errors: Vec<(MemoryId, String)>,
    pub validated: bool,
}

/// Content filters for scope migration
#[derive(Debug, Clone, Default)]
pub struct ScopeFilter {
    pub types: Vec<MemoryType>,
    pub tags: Vec<String>,
    pub files: Vec<String>,
    /// Case-insensitive substring over the title
    pub title_contains: Option<String>,
    /// Regex over title, text, and code
    pub content_regex: Option<String>,
    pub updated_after: Option<DateTime<Utc>>,
    pub updated_before: Option<DateTime<Utc>>,
}

/// Outcome of a scope migration (or its dry run)
#[derive(Debug)]
pub struct ScopeMigrationReport {
    pub candidates: Vec<MemoryId>,
    pub migrated: usize,
    pub dry_run: bool,
}

impl MemoryManager {
    /// Migrate one scope between storage back-ends
    pub fn migrate_storage_backend(
        &self,
        scope: Scope,
        target: BackendKind,
        validate: bool,
        progress: Option<&ProgressSink>,
    ) -> Result<BackendMigrationReport> {
        if target == BackendKind::Auto {
            return Err(Error::InvalidInput(
                "backend migration target must be file or video".into(),
            ));
        }
        let handle = self.handle(scope)?;
        if handle.store.backend() == target {
            return Ok(BackendMigrationReport {
                scope,
                target,
                migrated: 0,
                errors: Vec::new(),
                validated: false,
            });
        }

        let ts = Utc::now().format("%Y%m%d%H%M%S");
        let scope_dir = self.base_dir().join(scope.as_str());
        let staging_dir = self.base_dir().join(format!("{scope}_migration_{ts}"));
        let old_dir = self.base_dir().join(format!("{scope}_old_{ts}"));

        let mut config = self.config().clone();
        config.storage.backend = target;
        let staging = open_store(
            ScopePaths::at(staging_dir.clone(), scope),
            &config,
            Some(target),
        )?;

        // Stream items into the staging adapter
        let summaries = handle.store.list_summaries();
        let total = summaries.len();
        let batch = std::env::var("ENGRAM_MIGRATION_BATCH_SIZE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_MIGRATION_BATCH);
        let mut errors: Vec<(MemoryId, String)> = Vec::new();
        let mut migrated = 0usize;
        for (n, summary) in summaries.iter().enumerate() {
            let cancel = CancellationToken::with_timeout(deadlines::MIGRATION_PER_ITEM);
            let outcome = handle
                .store
                .read_item(&summary.id, &cancel)
                .and_then(|item| {
                    item.ok_or_else(|| Error::NotFound(summary.id.to_string()))
                })
                .and_then(|item| staging.write_item(&item, &cancel));
            match outcome {
                Ok(_) => migrated += 1,
                Err(e) => {
                    warn!(id = %summary.id, error = %e, "item failed to migrate");
                    errors.push((summary.id.clone(), e.to_string()));
                }
            }
            if (n + 1) % batch == 0 || n + 1 == total {
                if let Some(sink) = progress {
                    sink(MigrationProgress {
                        processed: n + 1,
                        total,
                        errors: errors.len(),
                    });
                }
            }
        }
        let cancel = CancellationToken::new();
        staging.flush(&cancel)?;

        // The migration fails only if the recovered count differs
        if staging.item_count() != total - errors.len() {
            drop(staging);
            let _ = std::fs::remove_dir_all(&staging_dir);
            return Err(Error::Store(format!(
                "migration recovered {} items, expected {}",
                migrated,
                total - errors.len()
            )));
        }

        let mut validated = false;
        if validate {
            for summary in &summaries {
                if errors.iter().any(|(id, _)| id == &summary.id) {
                    continue;
                }
                let recovered = staging
                    .read_item(&summary.id, &cancel)?
                    .ok_or_else(|| Error::NotFound(summary.id.to_string()))?;
                let hash = content_hash(&recovered.body());
                if hash != summary.payload.content_hash {
                    drop(staging);
                    let _ = std::fs::remove_dir_all(&staging_dir);
                    return Err(Error::Integrity(format!(
                        "{}: migrated hash {hash} disagrees with source {}",
                        summary.id, summary.payload.content_hash
                    )));
                }
            }
            validated = true;
        }

        // Carry the search indices across: the staging store only received
        // payloads, so the live indices persist into its layout before the
        // directories swap
        let staging_paths = ScopePaths::at(staging_dir.clone(), scope);
        handle.inverted.flush(
            &staging_paths.inverted_index(),
            &staging_paths.index_meta(),
        )?;
        if !handle.vectors.is_empty() {
            handle.vectors.save(&staging_paths.vectors())?;
        }

        // Atomic swap: close both adapters, then rename directories
        drop(staging);
        drop(handle);
        self.replace_handle_for_swap(scope)?;
        std::fs::rename(&scope_dir, &old_dir)?;
        if let Err(e) = std::fs::rename(&staging_dir, &scope_dir) {
            // Restore the original before surfacing the failure
            let _ = std::fs::rename(&old_dir, &scope_dir);
            let _ = std::fs::remove_dir_all(&staging_dir);
            self.reopen_scope(scope)?;
            return Err(e.into());
        }
        self.reopen_scope(scope)?;
        info!(%scope, ?target, migrated, "storage backend migrated");
        Ok(BackendMigrationReport {
            scope,
            target,
            migrated,
            errors,
            validated,
        })
    }

    /// Drop the live handle so directory renames see no open adapter
    fn replace_handle_for_swap(&self, scope: Scope) -> Result<()> {
        // Taking the handle out of the map drops the last engine-held Arc;
        // the adapter's worker threads shut down on drop
        let removed: Option<Arc<crate::manager::ScopeHandle>> =
            self.take_handle(scope);
        drop(removed);
        Ok(())
    }

    /// Move matching items to another scope
    ///
    /// Each migrated item is rewritten with the target scope, a fresh
    /// `updated_at`, and a strictly incremented version, then deleted from
    /// the source. With `dry_run` the candidate ids are returned unwritten.
    pub fn migrate_scope(
        &self,
        source: Scope,
        target: Scope,
        filter: &ScopeFilter,
        dry_run: bool,
    ) -> Result<ScopeMigrationReport> {
        if source == target {
            return Err(Error::InvalidInput("source and target scope are equal".into()));
        }
        let source_handle = self.handle(source)?;
        let target_handle = self.handle(target)?;
        let content_regex = filter
            .content_regex
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|e| Error::InvalidInput(format!("content regex: {e}")))?;

        let cancel = CancellationToken::new();
        let mut candidates = Vec::new();
        for summary in source_handle.store.list_summaries() {
            if !filter.types.is_empty() && !filter.types.contains(&summary.kind) {
                continue;
            }
            if !filter.tags.is_empty()
                && !filter.tags.iter().any(|t| summary.facets.tags.contains(t))
            {
                continue;
            }
            if !filter.files.is_empty()
                && !filter.files.iter().any(|f| {
                    summary.facets.files.iter().any(|have| have.contains(f.as_str()))
                })
            {
                continue;
            }
            if let Some(needle) = &filter.title_contains {
                let matched = summary
                    .title
                    .as_deref()
                    .map(|t| t.to_lowercase().contains(&needle.to_lowercase()))
                    .unwrap_or(false);
                if !matched {
                    continue;
                }
            }
            if let Some(after) = filter.updated_after {
                if summary.updated_at < after {
                    continue;
                }
            }
            if let Some(before) = filter.updated_before {
                if summary.updated_at > before {
                    continue;
                }
            }
            if let Some(regex) = &content_regex {
                let Some(item) = source_handle.store.read_item(&summary.id, &cancel)? else {
                    continue;
                };
                let haystack = [
                    item.title.as_deref().unwrap_or(""),
                    item.text.as_deref().unwrap_or(""),
                    item.code.as_deref().unwrap_or(""),
                ]
                .join("\n");
                if !regex.is_match(&haystack) {
                    continue;
                }
            }
            candidates.push(summary.id.clone());
        }

        if dry_run {
            return Ok(ScopeMigrationReport {
                candidates,
                migrated: 0,
                dry_run: true,
            });
        }

        let mut migrated = 0usize;
        for id in &candidates {
            let Some(mut item) = source_handle.store.read_item(id, &cancel)? else {
                continue;
            };
            // createdAt is preserved; updatedAt and version move forward
            item.scope = target;
            item.updated_at = Utc::now();
            item.version += 1;
            target_handle.store.write_item(&item, &cancel)?;
            target_handle.inverted.index_doc(
                &item.id,
                &IndexDoc {
                    title: item.title.clone(),
                    text: item.text.clone(),
                    code: item.code.clone(),
                    tags: item.facets.tags.iter().cloned().collect(),
                },
            );
            source_handle.store.delete_item(id)?;
            source_handle.inverted.remove_doc(id);
            source_handle.vectors.remove(id);
            migrated += 1;
        }
        for handle in [&source_handle, &target_handle] {
            let paths = handle.store.paths();
            handle
                .inverted
                .flush(&paths.inverted_index(), &paths.index_meta())?;
        }
        self.invalidate_scopes(&[source, target]);
        info!(%source, %target, migrated, "scope migration complete");
        Ok(ScopeMigrationReport {
            candidates,
            migrated,
            dry_run: false,
        })
    }
}
