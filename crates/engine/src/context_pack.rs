//! Context packs: grouped, budgeted result bundles
//!
//! A context pack reshapes ranked query hits into groups (snippets, facts,
//! patterns, configs) under a token or character budget, for direct
//! inclusion in an assistant prompt. Tokens are estimated at four characters
//! each; precise budgeting belongs to the caller's tokenizer.

use engram_core::types::{MemoryId, MemoryType};

use crate::query::QueryHit;

/// Estimated characters per token
const CHARS_PER_TOKEN: usize = 4;

/// Default budget when the request names neither tokens nor chars
pub const DEFAULT_TOKEN_BUDGET: usize = 2000;

/// Pack shaping options
#[derive(Debug, Clone, Default)]
pub struct PackOptions {
    pub token_budget: Option<usize>,
    pub max_chars: Option<usize>,
    /// Cap per group (entries), unlimited when absent
    pub group_cap: Option<usize>,
}

impl PackOptions {
    fn char_budget(&self) -> usize {
        self.max_chars
            .or(self.token_budget.map(|t| t * CHARS_PER_TOKEN))
            .unwrap_or(DEFAULT_TOKEN_BUDGET * CHARS_PER_TOKEN)
    }
}

/// One packed entry
#[derive(Debug, Clone)]
pub struct PackEntry {
    pub id: MemoryId,
    pub title: Option<String>,
    pub body: String,
    pub score: f32,
}

/// The four pack groups
#[derive(Debug, Clone, Default)]
pub struct ContextGroups {
    pub snippets: Vec<PackEntry>,
    pub facts: Vec<PackEntry>,
    pub patterns: Vec<PackEntry>,
    pub configs: Vec<PackEntry>,
}

/// A budgeted, grouped pack
#[derive(Debug, Clone, Default)]
pub struct ContextPack {
    pub groups: ContextGroups,
    /// Whether anything was dropped for budget or cap reasons
    pub truncated: bool,
}

fn group_of(kind: MemoryType) -> usize {
    match kind {
        MemoryType::Snippet => 0,
        MemoryType::Fact | MemoryType::Note | MemoryType::Insight => 1,
        MemoryType::Pattern | MemoryType::Runbook => 2,
        MemoryType::Config => 3,
    }
}

/// Build a pack from ranked hits, best first
pub fn build_pack(hits: &[QueryHit], options: &PackOptions) -> ContextPack {
    let mut pack = ContextPack::default();
    let budget = options.char_budget();
    let mut spent = 0usize;

    for hit in hits {
        let item = &hit.item;
        let body = item
            .code
            .clone()
            .or_else(|| item.text.clone())
            .unwrap_or_default();
        let cost = body.len() + item.title.as_deref().map(str::len).unwrap_or(0);

        let group = match group_of(item.kind) {
            0 => &mut pack.groups.snippets,
            1 => &mut pack.groups.facts,
            2 => &mut pack.groups.patterns,
            _ => &mut pack.groups.configs,
        };
        if let Some(cap) = options.group_cap {
            if group.len() >= cap {
                pack.truncated = true;
                continue;
            }
        }
        if spent + cost > budget {
            pack.truncated = true;
            continue;
        }
        spent += cost;
        group.push(PackEntry {
            id: item.id.clone(),
            title: item.title.clone(),
            body,
            score: hit.score,
        });
    }
    pack
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::ScoreComponents;
    use chrono::Utc;
    use engram_core::types::{
        ContextInfo, Facets, MemoryItem, Quality, Scope, Security,
    };

    fn hit(n: u8, kind: MemoryType, body: &str) -> QueryHit {
        let now = Utc::now();
        QueryHit {
            item: MemoryItem {
                id: MemoryId::parse(format!("01FRZ3NDEKTSV4RRFFQ69G5F{n:02}")).unwrap(),
                kind,
                scope: Scope::Local,
                title: Some(format!("entry {n}")),
                text: Some(body.to_string()),
                code: None,
                language: None,
                facets: Facets::default(),
                context: ContextInfo::default(),
                quality: Quality::default(),
                security: Security::default(),
                links: vec![],
                created_at: now,
                updated_at: now,
                version: 1,
            },
            score: 1.0,
            components: ScoreComponents::default(),
        }
    }

    #[test]
    fn test_groups_by_type() {
        let hits = vec![
            hit(1, MemoryType::Snippet, "code-ish"),
            hit(2, MemoryType::Fact, "a fact"),
            hit(3, MemoryType::Runbook, "steps"),
            hit(4, MemoryType::Config, "settings"),
            hit(5, MemoryType::Insight, "learned"),
        ];
        let pack = build_pack(&hits, &PackOptions::default());
        assert_eq!(pack.groups.snippets.len(), 1);
        assert_eq!(pack.groups.facts.len(), 2);
        assert_eq!(pack.groups.patterns.len(), 1);
        assert_eq!(pack.groups.configs.len(), 1);
        assert!(!pack.truncated);
    }

    #[test]
    fn test_char_budget_truncates() {
        let hits = vec![
            hit(1, MemoryType::Fact, &"x".repeat(50)),
            hit(2, MemoryType::Fact, &"y".repeat(50)),
        ];
        let options = PackOptions {
            max_chars: Some(70),
            ..Default::default()
        };
        let pack = build_pack(&hits, &options);
        assert_eq!(pack.groups.facts.len(), 1);
        assert!(pack.truncated);
    }

    #[test]
    fn test_token_budget_converts_to_chars() {
        let options = PackOptions {
            token_budget: Some(10),
            ..Default::default()
        };
        assert_eq!(options.char_budget(), 40);
    }

    #[test]
    fn test_group_cap() {
        let hits = vec![
            hit(1, MemoryType::Fact, "one"),
            hit(2, MemoryType::Fact, "two"),
            hit(3, MemoryType::Fact, "three"),
        ];
        let options = PackOptions {
            group_cap: Some(2),
            ..Default::default()
        };
        let pack = build_pack(&hits, &options);
        assert_eq!(pack.groups.facts.len(), 2);
        assert!(pack.truncated);
        // Best-ranked entries kept
        assert_eq!(pack.groups.facts[0].id, hit(1, MemoryType::Fact, "").item.id);
    }

    #[test]
    fn test_code_preferred_over_text() {
        let mut snippet = hit(1, MemoryType::Snippet, "fallback text");
        snippet.item.code = Some("fn preferred() {}".into());
        let pack = build_pack(&[snippet], &PackOptions::default());
        assert_eq!(pack.groups.snippets[0].body, "fn preferred() {}");
    }
}
