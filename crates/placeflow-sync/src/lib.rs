//! Lease-coordinated batch processing and on-demand readiness for places.

use std::sync::Arc;

use anyhow::{Context, Result};
use placeflow_adapters::{
    BackoffPolicy, CrawlClient, DescriptionGenerator, EmbeddingClient, HttpClientConfig,
    HttpCrawlClient, HttpEmbeddingClient, OpenAiDescriptionGenerator,
};
use placeflow_core::WorkerIdentity;
use placeflow_storage::{connect_pool, LeaseStore, PgLeaseStore, PgPlaceStore, PlaceStore};
use tracing::info;

pub mod config;
pub mod lease;
pub mod pipeline;
pub mod realtime;
pub mod scheduler;
pub mod worker;

#[cfg(test)]
mod testing;

pub use config::PipelineConfig;
pub use lease::{LeaseManager, LeaseTransition};
pub use pipeline::{PipelineReport, PipelineTimeouts, PlacePipeline, Stage, TextSource};
pub use realtime::{RealtimeProcessor, Registration, StatusCache};
pub use scheduler::{chunk_id_for, ChunkCursor, ChunkScheduler, ScanOutcome, WorkUnit};
pub use worker::{BatchRunSummary, BatchWorker, UnitTally};

pub const CRATE_NAME: &str = "placeflow-sync";

/// Collaborator implementations the services are wired with.
pub struct Collaborators {
    pub crawler: Arc<dyn CrawlClient>,
    pub describer: Arc<dyn DescriptionGenerator>,
    pub embedder: Arc<dyn EmbeddingClient>,
}

impl Collaborators {
    pub fn http(config: &PipelineConfig) -> Result<Self> {
        let base = HttpClientConfig {
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        };
        let crawler = HttpCrawlClient::new(
            &config.crawler_base_url,
            &base
                .clone()
                .with_timeout(config.crawl_timeout)
                .with_backoff(BackoffPolicy::none()),
        )
        .context("building crawler client")?;
        let describer = OpenAiDescriptionGenerator::new(
            &config.openai_base_url,
            config.openai_api_key.clone(),
            config.description_model.clone(),
            &base.clone().with_timeout(config.description_timeout),
        )
        .context("building description client")?;
        let embedder = HttpEmbeddingClient::new(
            &config.embedding_base_url,
            &base.with_timeout(config.embedding_timeout),
        )
        .context("building embedding client")?;
        Ok(Self {
            crawler: Arc::new(crawler),
            describer: Arc::new(describer),
            embedder: Arc::new(embedder),
        })
    }
}

/// Everything a worker process needs, wired from one config.
pub struct Services {
    pub config: PipelineConfig,
    pub places: Arc<dyn PlaceStore>,
    pub leases: Arc<LeaseManager>,
    pub pipeline: Arc<PlacePipeline>,
    pub worker: Arc<BatchWorker>,
    pub realtime: RealtimeProcessor,
}

impl Services {
    pub fn from_parts(
        config: PipelineConfig,
        lease_store: Arc<dyn LeaseStore>,
        places: Arc<dyn PlaceStore>,
        collaborators: Collaborators,
    ) -> Self {
        let identity = WorkerIdentity::generate();
        let leases = Arc::new(LeaseManager::new(
            lease_store,
            identity,
            config.lease_duration,
            config.max_retries,
        ));
        let pipeline = Arc::new(
            PlacePipeline::new(
                Arc::clone(&places),
                collaborators.crawler,
                collaborators.describer,
                collaborators.embedder,
            )
            .with_timeouts(PipelineTimeouts {
                crawl: config.crawl_timeout,
                description: config.description_timeout,
                embedding: config.embedding_timeout,
            })
            .with_keyword_arity(config.keyword_arity),
        );
        let scheduler = ChunkScheduler::new(
            Arc::clone(&leases),
            Arc::clone(&places),
            config.job_name.clone(),
        )
        .with_limits(config.chunk_size, config.max_consecutive_skips);
        let worker = Arc::new(BatchWorker::new(
            config.clone(),
            Arc::clone(&leases),
            scheduler,
            Arc::clone(&pipeline),
        ));
        let realtime = RealtimeProcessor::new(
            Arc::clone(&pipeline),
            Arc::new(StatusCache::new(config.cache_max_size, config.cache_ttl)),
            config.realtime_timeout,
        );
        Self {
            config,
            places,
            leases,
            pipeline,
            worker,
            realtime,
        }
    }

    /// Connect to Postgres and the HTTP collaborators named in `config`.
    pub async fn connect(config: PipelineConfig) -> Result<Self> {
        let pool = connect_pool(&config.database_url, config.database_max_connections)
            .await
            .context("connecting to database")?;
        let collaborators = Collaborators::http(&config)?;
        let services = Self::from_parts(
            config,
            Arc::new(PgLeaseStore::new(pool.clone())),
            Arc::new(PgPlaceStore::new(pool)),
            collaborators,
        );
        info!(
            worker = %services.leases.identity().worker_id,
            job = %services.config.job_name,
            "services ready"
        );
        Ok(services)
    }
}

pub async fn run_batch_once_from_env() -> Result<BatchRunSummary> {
    let services = Services::connect(PipelineConfig::from_env()).await?;
    services.worker.run_once().await
}
