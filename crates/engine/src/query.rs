//! Query pipeline: candidates → filters → blend → boosts → confidence
//!
//! The ranking order is fixed and deterministic:
//!
//! 1. BM25 candidates from the inverted index (gathered over-fetched at 2k)
//! 2. Structured filters (types, tags, files, language, date range)
//! 3. Optional hybrid blend with vector cosine scores, min-max normalized
//!    within the current candidate set
//! 4. Scope bonus, pin bonus, recency bonus, phrase/title bonuses — in that
//!    order, additive
//! 5. Confidence applied as the final multiplicative factor
//!
//! Ties always break by ascending id, so identical input and configuration
//! produce identical rankings.

use chrono::{DateTime, Utc};

use engram_core::config::StoreConfig;
use engram_core::types::{MemoryId, MemoryItem, MemoryItemSummary, MemoryType, Scope};
use engram_index::LexicalScore;

use crate::confidence::{confidence, QueryContext};

/// Over-fetch factor for BM25 candidate gathering
pub const CANDIDATE_FACTOR: usize = 2;

// ============================================================================
// Request / response types
// ============================================================================

/// Structured query filters
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryFilters {
    /// Keep items of any of these types (empty = all)
    pub types: Vec<MemoryType>,
    /// Keep items carrying any of these tags (empty = all)
    pub tags: Vec<String>,
    /// Keep items touching any of these files (substring match, empty = all)
    pub files: Vec<String>,
    pub language: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
}

impl QueryFilters {
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
            && self.tags.is_empty()
            && self.files.is_empty()
            && self.language.is_none()
            && self.created_after.is_none()
            && self.created_before.is_none()
    }

    /// Whether a summary passes every filter category
    pub fn matches(&self, summary: &MemoryItemSummary) -> bool {
        if !self.types.is_empty() && !self.types.contains(&summary.kind) {
            return false;
        }
        if !self.tags.is_empty()
            && !self.tags.iter().any(|t| summary.facets.tags.contains(t))
        {
            return false;
        }
        if !self.files.is_empty()
            && !self.files.iter().any(|f| {
                summary.facets.files.iter().any(|have| have.contains(f.as_str()))
                    || summary.context.file.as_deref().map(|have| have.contains(f.as_str()))
                        == Some(true)
            })
        {
            return false;
        }
        if let Some(language) = &self.language {
            if summary.language.as_deref() != Some(language.as_str()) {
                return false;
            }
        }
        if let Some(after) = self.created_after {
            if summary.created_at < after {
                return false;
            }
        }
        if let Some(before) = self.created_before {
            if summary.created_at > before {
                return false;
            }
        }
        true
    }
}

/// A search request
#[derive(Debug, Clone, Default)]
pub struct QueryRequest {
    pub q: Option<String>,
    /// Restrict to one scope; `None` spans all scopes
    pub scope: Option<Scope>,
    pub k: usize,
    pub filters: QueryFilters,
    pub vector: Option<Vec<f32>>,
    pub context: Option<QueryContext>,
}

/// Score breakdown attached to every hit
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ScoreComponents {
    pub bm25: f32,
    pub vector: f32,
    pub blended: f32,
    pub scope_bonus: f32,
    pub pin_bonus: f32,
    pub recency_bonus: f32,
    pub phrase_bonus: f32,
    pub exact_title_bonus: f32,
    pub confidence: f32,
}

/// One ranked result
#[derive(Debug, Clone)]
pub struct QueryHit {
    pub item: MemoryItem,
    pub score: f32,
    pub components: ScoreComponents,
}

/// Search response
#[derive(Debug, Clone, Default)]
pub struct QueryResponse {
    pub items: Vec<QueryHit>,
    /// Candidates that survived filtering, before truncation to k
    pub total: usize,
}

// ============================================================================
// Ranking
// ============================================================================

/// A candidate assembled from the indices, pre-ranking
#[derive(Debug, Clone)]
pub struct Candidate {
    pub summary: MemoryItemSummary,
    pub lexical: LexicalScore,
    pub vector_score: Option<f32>,
}

/// A ranked candidate, pre-hydration
#[derive(Debug, Clone)]
pub struct RankedCandidate {
    pub id: MemoryId,
    pub scope: Scope,
    pub score: f32,
    pub components: ScoreComponents,
}

/// Rank filtered candidates under the configured pipeline
pub fn rank(
    mut candidates: Vec<Candidate>,
    request: &QueryRequest,
    config: &StoreConfig,
    now: DateTime<Utc>,
) -> Vec<RankedCandidate> {
    candidates.retain(|c| request.filters.matches(&c.summary));

    let ranking = &config.ranking;
    let hybrid = ranking.hybrid.enabled
        && request.vector.is_some()
        && candidates.iter().any(|c| c.vector_score.is_some());

    // Min-max normalization happens within the surviving candidate set
    let (bm25_lo, bm25_hi) = min_max(candidates.iter().map(|c| c.lexical.bm25));
    let (vec_lo, vec_hi) = min_max(candidates.iter().filter_map(|c| c.vector_score));

    let mut ranked: Vec<RankedCandidate> = candidates
        .into_iter()
        .map(|candidate| {
            let summary = &candidate.summary;
            let mut components = ScoreComponents {
                bm25: candidate.lexical.bm25,
                vector: candidate.vector_score.unwrap_or(0.0),
                phrase_bonus: candidate.lexical.phrase_bonus,
                exact_title_bonus: candidate.lexical.exact_title_bonus,
                ..Default::default()
            };

            let mut score = if hybrid {
                let norm_bm25 = normalize(candidate.lexical.bm25, bm25_lo, bm25_hi);
                let norm_vec = candidate
                    .vector_score
                    .map(|v| normalize(v, vec_lo, vec_hi))
                    .unwrap_or(0.0);
                components.blended =
                    ranking.hybrid.w_bm25 * norm_bm25 + ranking.hybrid.w_vec * norm_vec;
                components.blended
            } else {
                candidate.lexical.bm25
            };

            components.scope_bonus = match summary.scope {
                Scope::Committed => ranking.scope_bonus.committed,
                Scope::Local => ranking.scope_bonus.local,
                Scope::Global => ranking.scope_bonus.global,
            };
            score += components.scope_bonus;

            if summary.quality.pinned {
                components.pin_bonus = ranking.pin_bonus;
                score += components.pin_bonus;
            }

            let reference = summary.quality.last_accessed_at.unwrap_or(summary.updated_at);
            let days = (now - reference).num_seconds().max(0) as f32 / 86_400.0;
            components.recency_bonus =
                ranking.recency.scale * (2.0f32).powf(-days / ranking.recency.half_life_days);
            score += components.recency_bonus;

            score += components.phrase_bonus + components.exact_title_bonus;

            let breakdown = confidence(
                &summary.quality,
                &summary.context,
                &summary.facets,
                request.context.as_ref(),
                &config.confidence,
                now,
            );
            components.confidence = breakdown.confidence;
            score *= breakdown.confidence;

            RankedCandidate {
                id: summary.id.clone(),
                scope: summary.scope,
                score,
                components,
            }
        })
        .collect();

    ranked.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
    ranked
}

fn min_max(values: impl Iterator<Item = f32>) -> (f32, f32) {
    let mut lo = f32::INFINITY;
    let mut hi = f32::NEG_INFINITY;
    for v in values {
        lo = lo.min(v);
        hi = hi.max(v);
    }
    (lo, hi)
}

fn normalize(value: f32, lo: f32, hi: f32) -> f32 {
    if !lo.is_finite() || !hi.is_finite() || (hi - lo).abs() < f32::EPSILON {
        // A degenerate range normalizes to full strength
        if hi.is_finite() {
            1.0
        } else {
            0.0
        }
    } else {
        (value - lo) / (hi - lo)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use engram_core::types::{ContextInfo, Facets, PayloadRef, Quality, Security};

    fn summary(n: u8, scope: Scope, kind: MemoryType) -> MemoryItemSummary {
        let now = Utc::now();
        MemoryItemSummary {
            id: MemoryId::parse(format!("01ERZ3NDEKTSV4RRFFQ69G5F{n:02}")).unwrap(),
            kind,
            scope,
            title: Some(format!("candidate {n}")),
            language: Some("rs".into()),
            facets: Facets::default(),
            context: ContextInfo::default(),
            quality: Quality::default(),
            security: Security::default(),
            links: vec![],
            created_at: now,
            updated_at: now,
            version: 1,
            payload: PayloadRef::file("ab".repeat(32), 1),
        }
    }

    fn candidate(n: u8, scope: Scope, bm25: f32) -> Candidate {
        Candidate {
            summary: summary(n, scope, MemoryType::Snippet),
            lexical: LexicalScore {
                bm25,
                ..Default::default()
            },
            vector_score: None,
        }
    }

    fn request() -> QueryRequest {
        QueryRequest {
            q: Some("query".into()),
            k: 10,
            ..Default::default()
        }
    }

    #[test]
    fn test_higher_bm25_wins_within_scope() {
        let ranked = rank(
            vec![candidate(1, Scope::Local, 1.0), candidate(2, Scope::Local, 5.0)],
            &request(),
            &StoreConfig::default(),
            Utc::now(),
        );
        assert_eq!(ranked[0].id.as_str().chars().last(), Some('2'));
    }

    #[test]
    fn test_committed_scope_outranks_global_on_equal_bm25() {
        let ranked = rank(
            vec![
                candidate(1, Scope::Global, 2.0),
                candidate(2, Scope::Committed, 2.0),
            ],
            &request(),
            &StoreConfig::default(),
            Utc::now(),
        );
        assert_eq!(ranked[0].scope, Scope::Committed);
        assert!(ranked[0].components.scope_bonus > ranked[1].components.scope_bonus);
    }

    #[test]
    fn test_pin_bonus_applied() {
        let mut pinned = candidate(1, Scope::Local, 1.0);
        pinned.summary.quality.pinned = true;
        let plain = candidate(2, Scope::Local, 1.0);

        let ranked = rank(
            vec![plain, pinned],
            &request(),
            &StoreConfig::default(),
            Utc::now(),
        );
        assert!(ranked[0].components.pin_bonus > 0.0);
        assert_eq!(ranked[0].id.as_str().chars().last(), Some('1'));
    }

    #[test]
    fn test_ties_break_by_id_ascending() {
        let ranked = rank(
            vec![
                candidate(3, Scope::Local, 1.0),
                candidate(1, Scope::Local, 1.0),
                candidate(2, Scope::Local, 1.0),
            ],
            &request(),
            &StoreConfig::default(),
            Utc::now(),
        );
        let order: Vec<char> = ranked
            .iter()
            .map(|r| r.id.as_str().chars().last().unwrap())
            .collect();
        assert_eq!(order, vec!['1', '2', '3']);
    }

    #[test]
    fn test_type_filter() {
        let mut req = request();
        req.filters.types = vec![MemoryType::Fact];
        let mut fact = candidate(1, Scope::Local, 1.0);
        fact.summary.kind = MemoryType::Fact;
        let ranked = rank(
            vec![fact, candidate(2, Scope::Local, 9.0)],
            &req,
            &StoreConfig::default(),
            Utc::now(),
        );
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].id.as_str().chars().last(), Some('1'));
    }

    #[test]
    fn test_tag_filter_is_any_of() {
        let mut req = request();
        req.filters.tags = vec!["auth".into(), "jwt".into()];
        let mut tagged = candidate(1, Scope::Local, 1.0);
        tagged.summary.facets.tags.insert("jwt".into());
        let ranked = rank(
            vec![tagged, candidate(2, Scope::Local, 9.0)],
            &req,
            &StoreConfig::default(),
            Utc::now(),
        );
        assert_eq!(ranked.len(), 1);
    }

    #[test]
    fn test_hybrid_blend_weights_bm25_over_vector() {
        // S3 shape: strongest title BM25 must beat strongest vector match
        let mut config = StoreConfig::default();
        config.ranking.hybrid.enabled = true;

        let mut auth_flow = candidate(1, Scope::Local, 10.0);
        auth_flow.vector_score = Some(0.2);
        let mut login_form = candidate(2, Scope::Local, 2.0);
        login_form.vector_score = Some(1.0);

        let mut req = request();
        req.vector = Some(vec![0.0, 1.0, 0.0, 0.0]);

        let ranked = rank(vec![auth_flow, login_form], &req, &config, Utc::now());
        // norm_bm25: 1.0 vs 0.0; norm_vec: 0.0 vs 1.0 → 0.7 vs 0.3
        assert_eq!(ranked[0].id.as_str().chars().last(), Some('1'));
        assert!((ranked[0].components.blended - 0.7).abs() < 1e-6);
        assert!((ranked[1].components.blended - 0.3).abs() < 1e-6);
    }

    #[test]
    fn test_confidence_multiplies_last() {
        let mut liked = candidate(1, Scope::Local, 1.0);
        liked.summary.quality.helpful_count = 20;
        let mut disliked = candidate(2, Scope::Local, 1.0);
        disliked.summary.quality.not_helpful_count = 20;

        let ranked = rank(
            vec![disliked, liked],
            &request(),
            &StoreConfig::default(),
            Utc::now(),
        );
        assert_eq!(ranked[0].id.as_str().chars().last(), Some('1'));
        assert!(ranked[0].components.confidence > ranked[1].components.confidence);
    }

    #[test]
    fn test_date_filter() {
        let mut req = request();
        req.filters.created_after = Some(Utc::now() + chrono::Duration::days(1));
        let ranked = rank(
            vec![candidate(1, Scope::Local, 5.0)],
            &req,
            &StoreConfig::default(),
            Utc::now(),
        );
        assert!(ranked.is_empty());
    }
}
