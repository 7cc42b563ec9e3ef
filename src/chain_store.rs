//! Chain ingestion and lifecycle against the vector store.
//!
//! Minting is atomic at the chain level: a duplicate scroll-check, then (on
//! `force_update`) a delete-by-filter, then one batch upsert. Between the
//! delete and the upsert the chain is transiently absent; a caller-initiated
//! replace accepts that window. Embedding failures degrade open: the chain
//! is stored with zero vectors and survives, unreachable by similarity
//! search until re-embedded.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use thiserror::Error;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::context::RequestContext;
use crate::embedding::EmbeddingClient;
use crate::event_bus::{Event, EventBus};
use crate::idgen;
use crate::ingest::{self, proof_spec};
use crate::memory::{
    classify_kind, classify_task, score_quality, ChainRef, Memory, MemoryUri,
};
use crate::monitoring;
use crate::render;
use crate::vector_store::{Filter, Point, VectorStore, VectorStoreError};

/// Upper bound on steps per chain; also the duplicate-scroll page size.
const MAX_CHAIN_STEPS: usize = 256;

#[derive(Debug, Clone)]
pub struct DuplicateItem {
    pub label: String,
    pub uri: String,
}

#[derive(Debug, Error)]
pub enum ChainStoreError {
    #[error("chain {chain_id} already exists")]
    Duplicate {
        chain_id: Uuid,
        items: Vec<DuplicateItem>,
    },
    #[error("a similar protocol already exists: {existing_label}")]
    SimilarMemory {
        existing_uri: String,
        existing_label: String,
        similarity_score: f32,
    },
    #[error("memory not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Store(#[from] VectorStoreError),
    #[error("stored payload is corrupt: {0}")]
    Payload(#[from] serde_json::Error),
}

pub struct ChainStore {
    store: Arc<VectorStore>,
    embedding: Arc<EmbeddingClient>,
    events: Arc<EventBus>,
    space_id: String,
    similarity_guard_threshold: Option<f32>,
}

impl ChainStore {
    pub fn new(
        store: Arc<VectorStore>,
        embedding: Arc<EmbeddingClient>,
        events: Arc<EventBus>,
        space_id: String,
        similarity_guard_threshold: Option<f32>,
    ) -> Self {
        Self {
            store,
            embedding,
            events,
            space_id,
            similarity_guard_threshold,
        }
    }

    /// Slice a markdown document and persist it as a chain of steps.
    #[instrument(level = "debug", skip(self, ctx, markdown))]
    pub async fn mint(
        &self,
        ctx: &RequestContext,
        markdown: &str,
        force_update: bool,
    ) -> Result<Vec<Memory>, ChainStoreError> {
        let timer = monitoring::MINT_DURATION.start_timer();
        let sliced = ingest::slice(markdown);

        let chain = sliced.chain_label.as_ref().map(|label| {
            let id = idgen::chain_id(label);
            (id, label.clone(), sliced.sections.len() as u32)
        });

        if let Some((chain_id, chain_label, _)) = &chain {
            let existing = self.chain_points(*chain_id).await?;
            if !existing.is_empty() {
                if !force_update {
                    return Err(ChainStoreError::Duplicate {
                        chain_id: *chain_id,
                        items: existing,
                    });
                }
                info!(%chain_id, "force_update replaces an existing chain");
                self.store
                    .delete_by_filter(chain_filter(*chain_id))
                    .await?;
            } else if !force_update {
                self.check_similar_title(chain_label).await?;
            }
        }

        let memories: Vec<Memory> = sliced
            .sections
            .iter()
            .enumerate()
            .map(|(index, section)| {
                let tags = ingest::derive_tags(&section.label, &section.body);
                let task = classify_task(&section.label, &section.body, &tags);
                let kind = classify_kind(&section.body, &tags);
                let quality_metadata = score_quality(&section.label, "general", &task, kind, &tags);
                Memory {
                    memory_uuid: idgen::step_id(),
                    label: section.label.clone(),
                    tags,
                    text: section.body.clone(),
                    llm_model_id: ctx.model_id().to_string(),
                    created_at: Utc::now(),
                    task,
                    kind,
                    quality_metadata,
                    chain: chain.as_ref().map(|(id, label, step_count)| ChainRef {
                        id: *id,
                        label: label.clone(),
                        step_index: index as u32 + 1,
                        step_count: *step_count,
                    }),
                    proof_of_work: proof_spec::parse(&section.body),
                    space_id: self.space_id.clone(),
                }
            })
            .collect();

        let vectors = self.embed_or_zero(&memories).await;
        let points: Vec<Point> = memories
            .iter()
            .zip(vectors)
            .map(|(memory, vector)| Point {
                id: memory.memory_uuid,
                vector,
                payload: memory.payload(),
            })
            .collect();

        self.store.upsert(&points).await?;
        monitoring::MINTED_STEPS.inc_by(points.len() as u64);

        if let Some((chain_id, _, _)) = chain {
            self.events.publish(Event::ChainInvalidated { chain_id });
        } else if let Some(memory) = memories.first() {
            self.events.publish(Event::MemoryInvalidated {
                memory_uuid: memory.memory_uuid,
            });
        }

        timer.observe_duration();
        Ok(memories)
    }

    /// One embedding batch for the whole chain, zero vectors on failure.
    /// The chain label leads the input so the whole chain is discoverable
    /// by its title.
    async fn embed_or_zero(&self, memories: &[Memory]) -> Vec<Vec<f32>> {
        let texts: Vec<String> = memories
            .iter()
            .map(|m| match &m.chain {
                Some(chain) => format!("{}\n\n{}\n\n{}", chain.label, m.label, m.text),
                None => format!("{}\n\n{}", m.label, m.text),
            })
            .collect();
        match self.embedding.embed_batch(&texts).await {
            Ok(vectors) => vectors,
            Err(error) => {
                warn!(%error, count = memories.len(), "embedding failed, storing zero vectors");
                monitoring::EMBEDDING_FALLBACKS.inc();
                memories.iter().map(|_| self.embedding.zero_vector()).collect()
            }
        }
    }

    /// Cosine check of the new chain label against the nearest existing
    /// head. Skipped when embedding is down; the guard is advisory.
    async fn check_similar_title(&self, chain_label: &str) -> Result<(), ChainStoreError> {
        let Some(threshold) = self.similarity_guard_threshold else {
            return Ok(());
        };
        let vector = match self.embedding.embed_one(chain_label).await {
            Ok(vector) => vector,
            Err(error) => {
                warn!(%error, "similarity guard skipped, embedding unavailable");
                return Ok(());
            }
        };
        let hits = self
            .store
            .search(&vector, 1, Filter::new().must_match("chain.step_index", json!(1)))
            .await?;
        if let Some(hit) = hits.first() {
            if hit.score >= threshold {
                let memory = Memory::from_payload(&hit.payload)?;
                return Err(ChainStoreError::SimilarMemory {
                    existing_uri: memory.uri().to_string(),
                    existing_label: memory.label,
                    similarity_score: hit.score,
                });
            }
        }
        Ok(())
    }

    async fn chain_points(&self, chain_id: Uuid) -> Result<Vec<DuplicateItem>, ChainStoreError> {
        let page = self
            .store
            .scroll(chain_filter(chain_id), MAX_CHAIN_STEPS, None, false)
            .await?;
        Ok(page
            .points
            .into_iter()
            .filter_map(|point| Memory::from_payload(&point.payload).ok())
            .map(|memory| DuplicateItem {
                uri: memory.uri().to_string(),
                label: memory.label,
            })
            .collect())
    }

    /// Load one memory by URI.
    pub async fn load(&self, uri: MemoryUri) -> Result<Memory, ChainStoreError> {
        let points = self.store.retrieve(&[uri.uuid()]).await?;
        let point = points
            .into_iter()
            .next()
            .ok_or_else(|| ChainStoreError::NotFound(uri.to_string()))?;
        Ok(Memory::from_payload(&point.payload)?)
    }

    /// Find a chain member by its 1-based index.
    pub async fn find_step(
        &self,
        chain_id: Uuid,
        step_index: u32,
    ) -> Result<Option<Memory>, ChainStoreError> {
        let filter = chain_filter(chain_id).must_match("chain.step_index", json!(step_index));
        let page = self.store.scroll(filter, 1, None, false).await?;
        match page.points.first() {
            Some(point) => Ok(Some(Memory::from_payload(&point.payload)?)),
            None => Ok(None),
        }
    }

    /// All members of a chain, ordered by step index.
    pub async fn chain_steps(&self, chain_id: Uuid) -> Result<Vec<Memory>, ChainStoreError> {
        let page = self
            .store
            .scroll(chain_filter(chain_id), MAX_CHAIN_STEPS, None, false)
            .await?;
        let mut steps: Vec<Memory> = page
            .points
            .iter()
            .map(|point| Memory::from_payload(&point.payload))
            .collect::<Result<_, _>>()?;
        steps.sort_by_key(|m| m.chain.as_ref().map(|c| c.step_index).unwrap_or(0));
        Ok(steps)
    }

    /// Replace the bodies of existing steps, re-deriving labels, tags and
    /// classification, preserving identity and chain membership.
    #[instrument(level = "debug", skip(self, updates))]
    pub async fn update_bodies(
        &self,
        updates: &[(MemoryUri, String)],
    ) -> Result<Vec<Result<Memory, ChainStoreError>>, ChainStoreError> {
        // Results stay aligned with the input order; a batch upsert failure
        // fails the whole call.
        let mut failures: Vec<Option<ChainStoreError>> = Vec::with_capacity(updates.len());
        let mut changed: Vec<(usize, Memory)> = Vec::new();

        for (index, (uri, doc)) in updates.iter().enumerate() {
            match self.load(*uri).await {
                Ok(mut memory) => {
                    let body = render::extract_body(doc).to_string();
                    memory.label = ingest::derive_label(&body);
                    let tags = ingest::derive_tags(&memory.label, &body);
                    memory.task = classify_task(&memory.label, &body, &tags);
                    memory.kind = classify_kind(&body, &tags);
                    memory.quality_metadata =
                        score_quality(&memory.label, "general", &memory.task, memory.kind, &tags);
                    memory.tags = tags;
                    memory.text = body;
                    memory.proof_of_work = proof_spec::parse(&memory.text);
                    failures.push(None);
                    changed.push((index, memory));
                }
                Err(error) => failures.push(Some(error)),
            }
        }

        if !changed.is_empty() {
            let memories: Vec<Memory> = changed.iter().map(|(_, m)| m.clone()).collect();
            let vectors = self.embed_or_zero(&memories).await;
            let points: Vec<Point> = memories
                .iter()
                .zip(vectors)
                .map(|(memory, vector)| Point {
                    id: memory.memory_uuid,
                    vector,
                    payload: memory.payload(),
                })
                .collect();
            self.store.upsert(&points).await?;
            for memory in &memories {
                self.events.publish(Event::MemoryInvalidated {
                    memory_uuid: memory.memory_uuid,
                });
            }
        }

        let mut by_index: std::collections::HashMap<usize, Memory> = changed.into_iter().collect();
        Ok(failures
            .into_iter()
            .enumerate()
            .map(|(index, failure)| match failure {
                Some(error) => Err(error),
                None => Ok(by_index.remove(&index).expect("updated memory present")),
            })
            .collect())
    }

    /// Delete one step by URI.
    pub async fn delete(&self, uri: MemoryUri) -> Result<(), ChainStoreError> {
        self.store.delete_ids(&[uri.uuid()]).await?;
        self.events.publish(Event::MemoryInvalidated {
            memory_uuid: uri.uuid(),
        });
        Ok(())
    }

    /// Delete every step of a chain.
    pub async fn delete_chain(&self, chain_id: Uuid) -> Result<(), ChainStoreError> {
        self.store.delete_by_filter(chain_filter(chain_id)).await?;
        self.events.publish(Event::ChainInvalidated { chain_id });
        Ok(())
    }

    /// Monotonic quality update after a successful attestation.
    #[instrument(level = "debug", skip(self))]
    pub async fn apply_quality_bonus(
        &self,
        uri: MemoryUri,
        bonus: f64,
    ) -> Result<Memory, ChainStoreError> {
        let points = self.store.retrieve(&[uri.uuid()]).await?;
        let point = points
            .into_iter()
            .next()
            .ok_or_else(|| ChainStoreError::NotFound(uri.to_string()))?;
        let mut memory = Memory::from_payload(&point.payload)?;
        memory.quality_metadata.apply_bonus(bonus);

        let vector = point
            .vector
            .unwrap_or_else(|| self.embedding.zero_vector());
        self.store
            .upsert(&[Point {
                id: memory.memory_uuid,
                vector,
                payload: memory.payload(),
            }])
            .await?;
        self.events.publish(Event::MemoryInvalidated {
            memory_uuid: memory.memory_uuid,
        });
        Ok(memory)
    }
}

fn chain_filter(chain_id: Uuid) -> Filter {
    Filter::new().must_match("chain.id", json!(chain_id))
}
