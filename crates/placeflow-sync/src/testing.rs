//! Scripted collaborators for unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use placeflow_adapters::{
    CollaboratorError, CrawlClient, CrawlError, CrawledPlace, DescriptionDraft,
    DescriptionGenerator, DescriptionRequest, EmbeddingClient,
};
use placeflow_storage::MemoryPlaceStore;

use crate::pipeline::PlacePipeline;

#[derive(Debug, Clone)]
pub(crate) enum CrawlScript {
    Found(CrawledPlace),
    NotFound,
    ServerError,
    Rejected,
}

pub(crate) struct FakeCrawler {
    script: CrawlScript,
    delay: Duration,
    calls: AtomicUsize,
    queries: Mutex<Vec<String>>,
}

impl FakeCrawler {
    pub(crate) fn new(script: CrawlScript) -> Self {
        Self {
            script,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            queries: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn found(place: CrawledPlace) -> Self {
        Self::new(CrawlScript::Found(place))
    }

    pub(crate) fn not_found() -> Self {
        Self::new(CrawlScript::NotFound)
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn queries(&self) -> Vec<String> {
        self.queries.lock().map(|q| q.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl CrawlClient for FakeCrawler {
    async fn crawl(&self, query: &str, _place_name: &str) -> Result<CrawledPlace, CrawlError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut queries) = self.queries.lock() {
            queries.push(query.to_string());
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match &self.script {
            CrawlScript::Found(place) => Ok(place.clone()),
            CrawlScript::NotFound => Err(CrawlError::NotFound),
            CrawlScript::ServerError => Err(CrawlError::Server { status: 503 }),
            CrawlScript::Rejected => Err(CrawlError::Rejected("blocked".to_string())),
        }
    }
}

pub(crate) struct FakeDescriber {
    draft: Option<DescriptionDraft>,
    calls: AtomicUsize,
}

impl FakeDescriber {
    pub(crate) fn new(draft: Option<DescriptionDraft>) -> Self {
        Self {
            draft,
            calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DescriptionGenerator for FakeDescriber {
    async fn generate(&self, _request: &DescriptionRequest) -> Option<DescriptionDraft> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.draft.clone()
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum EmbedScript {
    /// Non-zero vectors of the given dimension.
    Vectors(usize),
    ZeroAt(usize),
    DropOne,
    Unreachable,
}

pub(crate) struct FakeEmbedder {
    script: EmbedScript,
    calls: AtomicUsize,
}

impl FakeEmbedder {
    pub(crate) fn new(script: EmbedScript) -> Self {
        Self {
            script,
            calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmbeddingClient for FakeEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let vectors = |dim: usize| -> Vec<Vec<f32>> {
            texts
                .iter()
                .enumerate()
                .map(|(i, _)| vec![0.1 + i as f32; dim])
                .collect()
        };
        match self.script {
            EmbedScript::Vectors(dim) => Ok(vectors(dim)),
            EmbedScript::ZeroAt(index) => {
                let mut out = vectors(4);
                if let Some(v) = out.get_mut(index) {
                    v.iter_mut().for_each(|x| *x = 0.0);
                }
                Ok(out)
            }
            EmbedScript::DropOne => {
                let mut out = vectors(4);
                out.pop();
                Ok(out)
            }
            EmbedScript::Unreachable => Err(CollaboratorError::Unavailable(
                "embedding service down".to_string(),
            )),
        }
    }
}

pub(crate) fn nine_keywords() -> Vec<String> {
    ["calm", "cozy", "sunny", "breezy", "quiet", "bright", "cafe", "brunch", "sea"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

pub(crate) fn crawled_place() -> CrawledPlace {
    CrawledPlace {
        review_count: Some(serde_json::json!("1,204")),
        ai_summary: vec!["Quiet brunch spot".to_string(), "Ocean view".to_string()],
        original_description: Some("Brunch cafe on the west coast.".to_string()),
        pet_friendly: Some(true),
        reviews: vec!["Great eggs".to_string(), "Lovely view".to_string()],
        ..Default::default()
    }
}

pub(crate) fn pipeline_with(
    store: Arc<MemoryPlaceStore>,
    crawler: Arc<FakeCrawler>,
    describer: Arc<FakeDescriber>,
    embedder: Arc<FakeEmbedder>,
) -> PlacePipeline {
    PlacePipeline::new(store, crawler, describer, embedder)
}
