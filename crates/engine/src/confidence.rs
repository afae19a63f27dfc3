//! Confidence scoring
//!
//! Each item's confidence fuses five signals under configured weights
//! (validated at load to sum to 1.0):
//!
//! - **feedback**: Beta-posterior mean of helpful/not-helpful counts
//! - **usage**: saturating function of the exponentially decayed access
//!   counter
//! - **recency**: half-life decay of time since last access
//! - **context**: weighted Jaccard-like overlap with the query's context
//!   (neutral 0.5 without one)
//! - **base**: configured prior
//!
//! Pinned items are floored at `pin_floor` and multiplied by
//! `pin_multiplier`, clamped to [0, 1].

use chrono::{DateTime, Utc};
use std::collections::BTreeSet;

use engram_core::config::ConfidenceConfig;
use engram_core::types::{ContextInfo, Facets, Quality};

/// Context a query carries for context-match scoring
#[derive(Debug, Clone, Default)]
pub struct QueryContext {
    pub repo_id: Option<String>,
    pub file: Option<String>,
    pub tool: Option<String>,
    pub tags: Vec<String>,
}

impl QueryContext {
    pub fn is_empty(&self) -> bool {
        self.repo_id.is_none() && self.file.is_none() && self.tool.is_none() && self.tags.is_empty()
    }
}

/// Individual signal values behind a confidence score
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ConfidenceBreakdown {
    pub feedback: f32,
    pub usage: f32,
    pub recency: f32,
    pub context: f32,
    pub base: f32,
    pub confidence: f32,
}

/// Compute an item's confidence in [0, 1]
pub fn confidence(
    quality: &Quality,
    item_context: &ContextInfo,
    facets: &Facets,
    query_context: Option<&QueryContext>,
    config: &ConfidenceConfig,
    now: DateTime<Utc>,
) -> ConfidenceBreakdown {
    let helpful = quality.helpful_count as f32;
    let not_helpful = quality.not_helpful_count as f32;
    let feedback = (helpful + config.prior_alpha)
        / (helpful + not_helpful + config.prior_alpha + config.prior_beta);

    let usage = 1.0 - (-quality.decayed_usage / config.usage_saturation_k).exp();

    let recency = match quality.last_accessed_at {
        Some(at) => {
            let days = (now - at).num_seconds().max(0) as f32 / 86_400.0;
            (2.0f32).powf(-days / config.recency_half_life_days)
        }
        None => 0.0,
    };

    let context = match query_context {
        Some(ctx) if !ctx.is_empty() => context_match(item_context, facets, ctx),
        _ => 0.5,
    };

    let base = config.base_prior;
    let weights = &config.weights;
    let mut score = weights.feedback * feedback
        + weights.usage * usage
        + weights.recency * recency
        + weights.context * context
        + weights.base * base;

    if quality.pinned {
        score = score.max(config.pin_floor) * config.pin_multiplier;
    }
    ConfidenceBreakdown {
        feedback,
        usage,
        recency,
        context,
        base,
        confidence: score.clamp(0.0, 1.0),
    }
}

/// Weighted Jaccard-like overlap between item and query context
///
/// Scalar facets (repo, file, tool) contribute equality matches; tag-like
/// facets (tags ∪ symbols) contribute their Jaccard index. Only facets the
/// query actually carries participate, and their weights renormalize.
fn context_match(item: &ContextInfo, facets: &Facets, query: &QueryContext) -> f32 {
    const W_REPO: f32 = 0.3;
    const W_FILE: f32 = 0.3;
    const W_TOOL: f32 = 0.1;
    const W_TAGS: f32 = 0.3;

    let mut total_weight = 0.0;
    let mut matched = 0.0;

    if let Some(repo) = &query.repo_id {
        total_weight += W_REPO;
        if item.repo_id.as_deref() == Some(repo.as_str()) {
            matched += W_REPO;
        }
    }
    if let Some(file) = &query.file {
        total_weight += W_FILE;
        if item.file.as_deref() == Some(file.as_str()) {
            matched += W_FILE;
        }
    }
    if let Some(tool) = &query.tool {
        total_weight += W_TOOL;
        if item.tool.as_deref() == Some(tool.as_str()) {
            matched += W_TOOL;
        }
    }
    if !query.tags.is_empty() {
        total_weight += W_TAGS;
        let item_tags: BTreeSet<&str> = facets
            .tags
            .iter()
            .chain(facets.symbols.iter())
            .map(String::as_str)
            .collect();
        let query_tags: BTreeSet<&str> = query.tags.iter().map(String::as_str).collect();
        let intersection = item_tags.intersection(&query_tags).count() as f32;
        let union = item_tags.union(&query_tags).count() as f32;
        if union > 0.0 {
            matched += W_TAGS * intersection / union;
        }
    }

    if total_weight == 0.0 {
        0.5
    } else {
        matched / total_weight
    }
}

/// Apply the decayed-usage update for one access
///
/// `decayed_usage ← decayed_usage * 2^(−Δdays / half_life) + 1`, where Δ is
/// the time since the previous access.
pub fn touch_usage(quality: &mut Quality, config: &ConfidenceConfig, now: DateTime<Utc>) {
    if let Some(last) = quality.last_accessed_at {
        let days = (now - last).num_seconds().max(0) as f32 / 86_400.0;
        quality.decayed_usage *= (2.0f32).powf(-days / config.usage_half_life_days);
    }
    quality.decayed_usage += 1.0;
    quality.last_accessed_at = Some(now);
}

// ============================================================================
// Tests
// ============================================================================
