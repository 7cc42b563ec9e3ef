//! Search-and-offer: vector search shaped into an enforceable next action.
//!
//! The caller never sees a raw similarity score. Every response carries
//! `must_obey: true`, a non-empty list of choices (each chain contributes at
//! most one, heads preferred) and a synthetic `create` choice, so there is
//! always a structured path forward: follow a match, refine, or mint.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::instrument;
use uuid::Uuid;

use crate::embedding::{EmbeddingClient, EmbeddingError};
use crate::memory::{ChainRef, Memory, MemoryUri};
use crate::monitoring;
use crate::vector_store::{Filter, ScoredPoint, VectorStore, VectorStoreError};

#[derive(Debug, Error)]
pub enum SearchError {
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),
    #[error(transparent)]
    Store(#[from] VectorStoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Match,
    Refine,
    Create,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_count: Option<u32>,
    pub next_action: String,
}

/// The shaped response. No top-level `error`, `score` or `results` fields,
/// by construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    pub must_obey: bool,
    pub message: String,
    pub next_action: String,
    pub perfect_matches: usize,
    pub choices: Vec<Choice>,
}

/// Scoring thresholds in force for one search.
#[derive(Debug, Clone, Copy)]
pub struct Thresholds {
    pub matching: f32,
    pub refine: f32,
}

pub struct SearchEngine {
    store: Arc<VectorStore>,
    embedding: Arc<EmbeddingClient>,
    thresholds: Thresholds,
    limit: usize,
}

impl SearchEngine {
    pub fn new(
        store: Arc<VectorStore>,
        embedding: Arc<EmbeddingClient>,
        thresholds: Thresholds,
        limit: usize,
    ) -> Self {
        Self {
            store,
            embedding,
            thresholds,
            limit,
        }
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn search(&self, query: &str) -> Result<SearchResponse, SearchError> {
        let vector = self.embedding.embed_one(query).await?;
        let hits = self.store.search(&vector, self.limit, Filter::new()).await?;
        let response = shape_results(hits, self.thresholds);
        let top_role = response
            .choices
            .first()
            .map(|c| c.role)
            .unwrap_or(Role::Create);
        monitoring::SEARCHES
            .with_label_values(&[role_name(top_role)])
            .inc();
        Ok(response)
    }
}

fn role_name(role: Role) -> &'static str {
    match role {
        Role::Match => "match",
        Role::Refine => "refine",
        Role::Create => "create",
    }
}

/// A candidate distilled from one stored point.
struct Candidate {
    uri: MemoryUri,
    label: String,
    chain: Option<ChainRef>,
    score: f32,
}

/// Group hits by chain (heads preferred, then score), gate by threshold,
/// and always close with a `create` choice.
pub fn shape_results(hits: Vec<ScoredPoint>, thresholds: Thresholds) -> SearchResponse {
    // One candidate per chain; singleton steps stand for themselves.
    let mut by_group: HashMap<Uuid, Candidate> = HashMap::new();
    for hit in hits {
        let Ok(memory) = Memory::from_payload(&hit.payload) else {
            continue;
        };
        let candidate = Candidate {
            uri: memory.uri(),
            label: memory.label,
            chain: memory.chain,
            score: hit.score,
        };
        let group = candidate
            .chain
            .as_ref()
            .map(|c| c.id)
            .unwrap_or(hit.id);
        match by_group.entry(group) {
            Entry::Occupied(mut slot) => {
                if prefer(&candidate, slot.get()) {
                    slot.insert(candidate);
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(candidate);
            }
        }
    }

    let mut candidates: Vec<Candidate> = by_group.into_values().collect();
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut choices: Vec<Choice> = Vec::new();
    let mut perfect_matches = 0;
    for candidate in candidates {
        let role = if candidate.score >= thresholds.matching {
            perfect_matches += 1;
            Role::Match
        } else if candidate.score >= thresholds.refine {
            Role::Refine
        } else {
            continue;
        };
        let uri = candidate.uri.to_string();
        let next_action = match role {
            Role::Match => format!("call kairos_begin with {uri}"),
            _ => format!("review the step, then call kairos_begin with {uri} or refine your query"),
        };
        choices.push(Choice {
            role,
            uri: Some(uri),
            label: Some(candidate.label),
            chain_label: candidate.chain.as_ref().map(|c| c.label.clone()),
            step_count: candidate.chain.as_ref().map(|c| c.step_count),
            next_action,
        });
    }

    choices.push(Choice {
        role: Role::Create,
        uri: None,
        label: None,
        chain_label: None,
        step_count: None,
        next_action: "call kairos_mint with a new protocol document".to_string(),
    });

    let (message, next_action) = if perfect_matches > 0 {
        (
            format!("{perfect_matches} matching protocol(s) found. Follow one of the match choices."),
            "pick a match choice and follow its next_action".to_string(),
        )
    } else if choices.len() > 1 {
        (
            "No exact match. Close protocols are listed; refine or create.".to_string(),
            "pick a refine choice or mint a new protocol".to_string(),
        )
    } else {
        (
            "No stored protocol matches this query.".to_string(),
            "mint a new protocol with kairos_mint".to_string(),
        )
    };

    SearchResponse {
        must_obey: true,
        message,
        next_action,
        perfect_matches,
        choices,
    }
}

/// Within a chain group the head wins; among equals the higher score wins.
fn prefer(candidate: &Candidate, existing: &Candidate) -> bool {
    let candidate_head = candidate.chain.as_ref().map(ChainRef::is_head).unwrap_or(true);
    let existing_head = existing.chain.as_ref().map(ChainRef::is_head).unwrap_or(true);
    match (candidate_head, existing_head) {
        (true, false) => true,
        (false, true) => false,
        _ => candidate.score > existing.score,
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::Value;

    use super::*;
    use crate::memory::{score_quality, MemoryKind};

    const T: Thresholds = Thresholds {
        matching: 0.95,
        refine: 0.7,
    };

    fn point(label: &str, chain: Option<(Uuid, u32, u32)>, score: f32) -> ScoredPoint {
        let id = Uuid::new_v4();
        let memory = Memory {
            memory_uuid: id,
            label: label.to_string(),
            tags: vec![],
            text: "body".into(),
            llm_model_id: "tester".into(),
            created_at: Utc::now(),
            task: "general".into(),
            kind: MemoryKind::Context,
            quality_metadata: score_quality(label, "general", "general", MemoryKind::Context, &[]),
            chain: chain.map(|(chain_id, step_index, step_count)| ChainRef {
                id: chain_id,
                label: "Chain".into(),
                step_index,
                step_count,
            }),
            proof_of_work: None,
            space_id: "app".into(),
        };
        ScoredPoint {
            id,
            score,
            payload: memory.payload(),
        }
    }

    #[test]
    fn empty_results_still_offer_create() {
        let response = shape_results(vec![], T);
        assert!(response.must_obey);
        assert_eq!(response.perfect_matches, 0);
        assert_eq!(response.choices.len(), 1);
        assert_eq!(response.choices[0].role, Role::Create);
        assert!(!response.message.is_empty());
        assert!(!response.next_action.is_empty());
    }

    #[test]
    fn scores_gate_roles() {
        let response = shape_results(
            vec![
                point("exact", None, 0.97),
                point("close", None, 0.8),
                point("far", None, 0.3),
            ],
            T,
        );
        assert_eq!(response.perfect_matches, 1);
        let roles: Vec<Role> = response.choices.iter().map(|c| c.role).collect();
        assert_eq!(roles, vec![Role::Match, Role::Refine, Role::Create]);
        // The far hit is not offered at all.
        assert_eq!(response.choices.len(), 3);
    }

    #[test]
    fn chains_contribute_one_candidate_preferring_the_head() {
        let chain_id = Uuid::new_v4();
        let response = shape_results(
            vec![
                point("step three", Some((chain_id, 3, 3)), 0.99),
                point("step one", Some((chain_id, 1, 3)), 0.96),
            ],
            T,
        );
        assert_eq!(response.perfect_matches, 1);
        assert_eq!(response.choices.len(), 2);
        assert_eq!(response.choices[0].label.as_deref(), Some("step one"));
        assert_eq!(response.choices[0].step_count, Some(3));
    }

    #[test]
    fn multiple_matches_are_all_returned() {
        let response = shape_results(
            vec![
                point("first", Some((Uuid::new_v4(), 1, 1)), 0.99),
                point("second", Some((Uuid::new_v4(), 1, 2)), 0.97),
            ],
            T,
        );
        assert_eq!(response.perfect_matches, 2);
        assert_eq!(
            response
                .choices
                .iter()
                .filter(|c| c.role == Role::Match)
                .count(),
            2
        );
    }

    #[test]
    fn forbidden_fields_are_absent() {
        let response = shape_results(vec![point("exact", None, 0.97)], T);
        let value = serde_json::to_value(&response).unwrap();
        let object = value.as_object().unwrap();
        for forbidden in [
            "error",
            "score",
            "results",
            "protocol_status",
            "best_match",
            "suggestion",
            "hint",
            "start_here",
        ] {
            assert!(!object.contains_key(forbidden), "found {forbidden}");
        }
        assert_eq!(object["must_obey"], Value::Bool(true));
    }

    #[test]
    fn match_role_serializes_as_match() {
        assert_eq!(serde_json::to_value(Role::Match).unwrap(), "match");
        assert_eq!(serde_json::to_value(Role::Refine).unwrap(), "refine");
    }

    #[test]
    fn unparseable_payloads_are_skipped() {
        let broken = ScoredPoint {
            id: Uuid::new_v4(),
            score: 0.99,
            payload: serde_json::json!({"not": "a memory"}),
        };
        let response = shape_results(vec![broken], T);
        assert_eq!(response.choices.len(), 1);
        assert_eq!(response.choices[0].role, Role::Create);
    }
}
