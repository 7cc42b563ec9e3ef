use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use tracing::{info, instrument, warn};

use crate::chain_store::ChainStore;
use crate::config::Config;
use crate::context::RequestContext;
use crate::elicit::{Elicitor, NullElicitor};
use crate::embedding::EmbeddingClient;
use crate::event_bus::EventBus;
use crate::memory::MemoryUri;
use crate::proof::store::{KvBackend, MemoryKv, ProofStore, RedisKv};
use crate::protocol::ProtocolEngine;
use crate::render;
use crate::search::{SearchEngine, SearchResponse, Thresholds};
use crate::server::data::{
    AttestRequest, AttestResponse, BeginResponse, DeleteRequest, DeleteResponse, DependencyHealth,
    DumpRequest, DumpResponse, HealthResponse, ItemResult, MintedItem, MintMetadata, MintResponse,
    NextRequest, NextResponse, UpdateRequest, UpdateResponse,
};
use crate::server::error::Error;
use crate::vector_store::VectorStore;

pub struct App {
    pub config: Config,
    chains: Arc<ChainStore>,
    engine: ProtocolEngine,
    search_engine: SearchEngine,
    proofs: Arc<ProofStore>,
    store: Arc<VectorStore>,
    embedding: Arc<EmbeddingClient>,
    pub events: Arc<EventBus>,
    started_at: Instant,
}

impl App {
    /// Wire every subsystem from config. The default transport has no
    /// elicitation channel; see [`App::new_with_elicitor`].
    pub async fn new(config: Config) -> anyhow::Result<Arc<Self>> {
        Self::new_with_elicitor(config, Arc::new(NullElicitor)).await
    }

    #[instrument(name = "App::new", level = "debug", skip_all)]
    pub async fn new_with_elicitor(
        config: Config,
        elicitor: Arc<dyn Elicitor>,
    ) -> anyhow::Result<Arc<Self>> {
        let embedding = Arc::new(EmbeddingClient::new(&config.embedding)?);
        let store = Arc::new(VectorStore::new(
            &config.vector_store,
            config.embedding.dimension,
            config.app.allowed_space_ids(),
        )?);

        let kv: Arc<dyn KvBackend> = match &config.kv.url {
            Some(url) => {
                info!(%url, "Connecting to kv store");
                Arc::new(RedisKv::connect(url).await?)
            }
            None => {
                warn!("No kv url configured, proof state is in-process only");
                Arc::new(MemoryKv::new())
            }
        };
        let proofs = Arc::new(ProofStore::new(kv));

        let events = Arc::new(EventBus::new(64));
        let chains = Arc::new(ChainStore::new(
            store.clone(),
            embedding.clone(),
            events.clone(),
            config.app.space_id.clone(),
            config.app.similarity_guard_threshold,
        ));
        let engine = ProtocolEngine::new(
            chains.clone(),
            proofs.clone(),
            elicitor,
            config.app.max_retries,
            config.server.elicitation_timeout,
        );
        let search_engine = SearchEngine::new(
            store.clone(),
            embedding.clone(),
            Thresholds {
                matching: config.app.match_threshold,
                refine: config.app.score_threshold,
            },
            config.app.search_limit,
        );

        Ok(Arc::new(Self {
            config,
            chains,
            engine,
            search_engine,
            proofs,
            store,
            embedding,
            events,
            started_at: Instant::now(),
        }))
    }

    /// Best-effort startup work: create the collection when absent.
    pub async fn init(&self) -> anyhow::Result<()> {
        self.store.ensure_collection().await?;
        Ok(())
    }

    #[instrument(level = "debug", skip(self, ctx, markdown))]
    pub async fn mint(
        &self,
        ctx: &RequestContext,
        markdown: &str,
        force_update: bool,
    ) -> Result<MintResponse, Error> {
        if markdown.trim().is_empty() {
            return Err(Error::InvalidInput("request body is empty".to_string()));
        }
        let started = Instant::now();

        let memories = self.chains.mint(ctx, markdown, force_update).await?;

        let items = memories
            .iter()
            .map(|memory| MintedItem {
                uri: memory.uri().to_string(),
                memory_uuid: memory.memory_uuid,
                label: memory.label.clone(),
                tags: memory.tags.clone(),
            })
            .collect::<Vec<_>>();

        Ok(MintResponse {
            status: "stored".to_string(),
            metadata: MintMetadata {
                count: items.len(),
                duration_ms: started.elapsed().as_millis() as u64,
                llm_model_id: ctx.model_id().to_string(),
            },
            items,
        })
    }

    pub async fn search(
        &self,
        _ctx: &RequestContext,
        query: &str,
    ) -> Result<SearchResponse, Error> {
        if query.trim().is_empty() {
            return Err(Error::InvalidInput("query is empty".to_string()));
        }
        Ok(self.search_engine.search(query).await?)
    }

    pub async fn begin(&self, ctx: &RequestContext, uri: &str) -> Result<BeginResponse, Error> {
        let uri = MemoryUri::from_str(uri)?;
        self.engine.begin(ctx, uri).await
    }

    pub async fn next(
        &self,
        ctx: &RequestContext,
        request: NextRequest,
    ) -> Result<NextResponse, Error> {
        let uri = MemoryUri::from_str(&request.uri)?;
        self.engine.next(ctx, uri, request.solution).await
    }

    pub async fn attest(
        &self,
        ctx: &RequestContext,
        request: &AttestRequest,
    ) -> Result<AttestResponse, Error> {
        let uri = MemoryUri::from_str(&request.uri)?;
        self.engine.attest(ctx, uri, request).await
    }

    /// Update step bodies in place; a full render has its BODY extracted
    /// between the markers first.
    pub async fn update(
        &self,
        _ctx: &RequestContext,
        request: &UpdateRequest,
    ) -> Result<UpdateResponse, Error> {
        let docs = request
            .markdown_doc
            .as_ref()
            .or(request.updates.as_ref())
            .ok_or_else(|| {
                Error::InvalidInput("markdown_doc or updates is required".to_string())
            })?;
        if docs.len() != request.uris.len() {
            return Err(Error::InvalidInput(format!(
                "{} uris but {} documents",
                request.uris.len(),
                docs.len()
            )));
        }

        let mut results: Vec<ItemResult> = Vec::with_capacity(request.uris.len());
        let mut pairs: Vec<(usize, MemoryUri, String)> = Vec::new();
        for (index, (raw, doc)) in request.uris.iter().zip(docs).enumerate() {
            match MemoryUri::from_str(raw) {
                Ok(uri) => pairs.push((index, uri, doc.clone())),
                Err(error) => results.push(ItemResult {
                    uri: raw.clone(),
                    status: "failed".to_string(),
                    message: Some(error.to_string()),
                }),
            }
        }

        let updates: Vec<(MemoryUri, String)> = pairs
            .iter()
            .map(|(_, uri, doc)| (*uri, doc.clone()))
            .collect();
        let outcomes = self.chains.update_bodies(&updates).await?;
        for ((_, uri, _), outcome) in pairs.iter().zip(outcomes) {
            match outcome {
                Ok(_) => results.push(ItemResult {
                    uri: uri.to_string(),
                    status: "updated".to_string(),
                    message: None,
                }),
                Err(error) => results.push(ItemResult {
                    uri: uri.to_string(),
                    status: "failed".to_string(),
                    message: Some(error.to_string()),
                }),
            }
        }

        let total_updated = results.iter().filter(|r| r.status == "updated").count();
        let total_failed = results.len() - total_updated;
        Ok(UpdateResponse {
            results,
            total_updated,
            total_failed,
        })
    }

    pub async fn delete(
        &self,
        _ctx: &RequestContext,
        request: &DeleteRequest,
    ) -> Result<DeleteResponse, Error> {
        let mut results: Vec<ItemResult> = Vec::with_capacity(request.uris.len());
        for raw in &request.uris {
            let outcome = match MemoryUri::from_str(raw) {
                Ok(uri) => self.chains.delete(uri).await.map_err(|e| e.to_string()),
                Err(error) => Err(error.to_string()),
            };
            match outcome {
                Ok(()) => results.push(ItemResult {
                    uri: raw.clone(),
                    status: "deleted".to_string(),
                    message: None,
                }),
                Err(message) => results.push(ItemResult {
                    uri: raw.clone(),
                    status: "failed".to_string(),
                    message: Some(message),
                }),
            }
        }

        let total_deleted = results.iter().filter(|r| r.status == "deleted").count();
        let total_failed = results.len() - total_deleted;
        Ok(DeleteResponse {
            results,
            total_deleted,
            total_failed,
        })
    }

    /// Render a step back to markdown; with `protocol` the whole chain is
    /// reassembled in step order.
    pub async fn dump(
        &self,
        _ctx: &RequestContext,
        request: &DumpRequest,
    ) -> Result<DumpResponse, Error> {
        let uri = MemoryUri::from_str(&request.uri)?;
        let memory = self.chains.load(uri).await?;
        let chain = memory.chain.clone();

        if request.protocol {
            if let Some(chain) = chain {
                let steps = self.chains.chain_steps(chain.id).await?;
                let rendered: Vec<(String, String)> = steps
                    .iter()
                    .map(|step| {
                        (
                            step.label.clone(),
                            render::extract_body(&step.text).to_string(),
                        )
                    })
                    .collect();
                return Ok(DumpResponse {
                    uri: uri.to_string(),
                    label: memory.label,
                    chain_label: Some(chain.label.clone()),
                    markdown_doc: render::render_protocol(&chain.label, &rendered),
                    step_count: Some(chain.step_count),
                });
            }
        }

        let body = render::extract_body(&memory.text);
        Ok(DumpResponse {
            uri: uri.to_string(),
            markdown_doc: render::render_step(&memory.label, body),
            chain_label: chain.as_ref().map(|c| c.label.clone()),
            step_count: chain.as_ref().map(|c| c.step_count),
            label: memory.label,
        })
    }

    /// Dependency probes: the vector store is critical, the rest degrade.
    pub async fn health(&self) -> HealthResponse {
        let (store, kv, embedding) = tokio::join!(
            self.store.ping(),
            self.proofs.ping(),
            self.embedding.ping()
        );

        let up = |ok: bool| if ok { "ok" } else { "down" };
        let store_ok = store.is_ok();
        let kv_ok = kv.is_ok();
        let embedding_ok = embedding.is_ok();

        let status = if !store_ok {
            "unhealthy"
        } else if !kv_ok || !embedding_ok {
            "degraded"
        } else {
            "healthy"
        };

        HealthResponse {
            status: status.to_string(),
            service: self.config.service.service_name.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            dependencies: DependencyHealth {
                vector_store: up(store_ok).to_string(),
                kv: up(kv_ok).to_string(),
                embedding: up(embedding_ok).to_string(),
            },
            uptime: self.started_at.elapsed().as_secs(),
        }
    }
}
