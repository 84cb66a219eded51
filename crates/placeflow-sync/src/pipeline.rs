//! Per-place readiness stages: crawl & describe, keyword vectorization, finalize.
//!
//! Stage failures are values, never errors: every stage reports a
//! [`StageOutcome`] and the record keeps whatever partial state it reached, so
//! a later run resumes from there.

use std::sync::Arc;
use std::time::Duration;

use placeflow_adapters::{
    CollaboratorError, CrawlClient, CrawlError, CrawledPlace, DescriptionGenerator,
    DescriptionRequest, EmbeddingClient,
};
use placeflow_core::{
    CrawlState, KeywordEmbedding, Place, PlaceDescription, SkipReason, StageFailure, StageOutcome,
    DEFAULT_KEYWORD_ARITY,
};
use placeflow_storage::PlaceStore;
use tokio::time::timeout;
use tracing::{debug, info, info_span, warn, Instrument};

/// Longest fallback description cut from crawled text.
pub const DESCRIPTION_CAP: usize = 150;
/// Sentence ends at or before this char index are too early to cut at.
const MIN_SENTENCE_CUT: usize = 50;
pub const FILLER_KEYWORD: &str = "place";
pub const NO_REVIEW_TEXT: &str = "no review information";
const REVIEW_SNIPPET_LIMIT: usize = 10;
const REVIEW_FALLBACK_LIMIT: usize = 3;

/// Which crawled text the description was derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextSource {
    AiSummary,
    OriginalDescription,
    Reviews,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    CrawlDescribe,
    Vectorize,
    Finalize,
}

#[derive(Debug, Clone, Copy)]
pub struct PipelineTimeouts {
    pub crawl: Duration,
    pub description: Duration,
    pub embedding: Duration,
}

impl Default for PipelineTimeouts {
    fn default() -> Self {
        Self {
            crawl: Duration::from_secs(15 * 60),
            description: Duration::from_secs(120),
            embedding: Duration::from_secs(60),
        }
    }
}

/// Keywords paired with their vectors, ready to be attached.
#[derive(Debug, Clone, PartialEq)]
pub struct Vectorized {
    pub embeddings: Vec<KeywordEmbedding>,
    /// Category-derived keywords replaced the generated ones.
    pub degraded: bool,
}

#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub place: Place,
    pub outcome: StageOutcome<()>,
    pub failed_stage: Option<Stage>,
    pub text_source: Option<TextSource>,
    pub degraded_keywords: bool,
}

impl PipelineReport {
    fn new(
        place: Place,
        outcome: StageOutcome<()>,
        failed_stage: Option<Stage>,
        text_source: Option<TextSource>,
        degraded_keywords: bool,
    ) -> Self {
        Self {
            place,
            outcome,
            failed_stage,
            text_source,
            degraded_keywords,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.place.ready
    }

    /// Failed in a way a later run may fix.
    pub fn needs_retry(&self) -> bool {
        self.outcome
            .failure()
            .is_some_and(|failure| failure.kind.is_retryable())
    }
}

pub struct PlacePipeline {
    places: Arc<dyn PlaceStore>,
    crawler: Arc<dyn CrawlClient>,
    describer: Arc<dyn DescriptionGenerator>,
    embedder: Arc<dyn EmbeddingClient>,
    timeouts: PipelineTimeouts,
    keyword_arity: usize,
}

impl PlacePipeline {
    pub fn new(
        places: Arc<dyn PlaceStore>,
        crawler: Arc<dyn CrawlClient>,
        describer: Arc<dyn DescriptionGenerator>,
        embedder: Arc<dyn EmbeddingClient>,
    ) -> Self {
        Self {
            places,
            crawler,
            describer,
            embedder,
            timeouts: PipelineTimeouts::default(),
            keyword_arity: DEFAULT_KEYWORD_ARITY,
        }
    }

    pub fn with_timeouts(mut self, timeouts: PipelineTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_keyword_arity(mut self, arity: usize) -> Self {
        self.keyword_arity = arity.max(1);
        self
    }

    pub fn place_store(&self) -> &Arc<dyn PlaceStore> {
        &self.places
    }

    /// Run all stages on one place. Never fails; the report says how far it got.
    pub async fn run(&self, place: Place) -> PipelineReport {
        let span = info_span!("place_pipeline", place_id = place.id, name = %place.name);
        self.run_stages(place).instrument(span).await
    }

    async fn run_stages(&self, mut place: Place) -> PipelineReport {
        if let Some(reason) = skip_reason(&place) {
            debug!(?reason, "nothing to do");
            return PipelineReport::new(place, StageOutcome::Skip(reason), None, None, false);
        }

        let text_source = match self.crawl_and_describe(&mut place).await {
            StageOutcome::Success(source) => source,
            StageOutcome::Skip(reason) => {
                return PipelineReport::new(place, StageOutcome::Skip(reason), None, None, false)
            }
            StageOutcome::Fail(failure) => {
                return PipelineReport::new(
                    place,
                    StageOutcome::Fail(failure),
                    Some(Stage::CrawlDescribe),
                    None,
                    false,
                )
            }
        };

        let vectorized = match self.vectorize(&place).await {
            StageOutcome::Success(vectorized) => vectorized,
            StageOutcome::Skip(reason) => {
                return PipelineReport::new(place, StageOutcome::Skip(reason), None, Some(text_source), false)
            }
            StageOutcome::Fail(failure) => {
                place.ready = false;
                place.embeddings.clear();
                self.persist_partial(&place).await;
                return PipelineReport::new(
                    place,
                    StageOutcome::Fail(failure),
                    Some(Stage::Vectorize),
                    Some(text_source),
                    false,
                );
            }
        };

        let degraded = vectorized.degraded;
        let outcome = self.finalize(&mut place, vectorized).await;
        let failed_stage = outcome.failure().map(|_| Stage::Finalize);
        PipelineReport::new(place, outcome, failed_stage, Some(text_source), degraded)
    }

    /// Stage A: crawl the place, then generate its description.
    pub async fn crawl_and_describe(&self, place: &mut Place) -> StageOutcome<TextSource> {
        if let Some(reason) = skip_reason(place) {
            return StageOutcome::Skip(reason);
        }

        let query = place
            .stored_search_query()
            .map(str::to_string)
            .or_else(|| place.road_address.clone())
            .unwrap_or_default();

        let crawled = match timeout(self.timeouts.crawl, self.crawler.crawl(&query, &place.name)).await
        {
            Ok(Ok(crawled)) => crawled,
            Ok(Err(CrawlError::NotFound)) => {
                info!(place_id = place.id, "crawler could not find place; marking terminal");
                place.crawl_state = CrawlState::NotFound;
                place.ready = false;
                self.persist_partial(place).await;
                return StageOutcome::Fail(StageFailure::not_found("crawler returned 404"));
            }
            Ok(Err(err)) => {
                warn!(place_id = place.id, error = %err, "crawl failed");
                place.ready = false;
                self.persist_partial(place).await;
                return StageOutcome::Fail(StageFailure::transient(err.to_string()));
            }
            Err(_) => {
                warn!(place_id = place.id, timeout = ?self.timeouts.crawl, "crawl timed out");
                place.ready = false;
                self.persist_partial(place).await;
                return StageOutcome::Fail(StageFailure::transient("crawl timed out"));
            }
        };

        apply_crawled(place, &query, crawled);

        let Some((source, text)) = choose_text(place) else {
            warn!(place_id = place.id, data_quality = true, "crawl returned no usable text");
            place.ready = false;
            self.persist_partial(place).await;
            return StageOutcome::Fail(StageFailure::data_quality(
                "no summary, description or reviews to describe",
            ));
        };

        let request = description_request(place);
        let draft = match timeout(self.timeouts.description, self.describer.generate(&request)).await {
            Ok(draft) => draft,
            Err(_) => {
                warn!(place_id = place.id, "description generation timed out; using fallback");
                None
            }
        };

        let (generated, keywords) = match draft {
            Some(draft) if !is_degenerate(&sanitize_text(&draft.description)) => {
                (sanitize_text(&draft.description), draft.keywords)
            }
            _ => {
                warn!(place_id = place.id, ?source, "using truncated crawl text as description");
                let fallback = fallback_description(&text);
                let generated = if fallback.trim().is_empty() {
                    format!("About {}.", place.name)
                } else {
                    fallback
                };
                (generated, Vec::new())
            }
        };

        place
            .description
            .get_or_insert_with(PlaceDescription::default)
            .generated = Some(generated);
        place.keywords = keywords.iter().map(|k| sanitize_text(k)).collect();
        debug!(place_id = place.id, ?source, keywords = place.keywords.len(), "described place");
        StageOutcome::Success(source)
    }

    /// Stage B: settle the keyword list and embed it.
    pub async fn vectorize(&self, place: &Place) -> StageOutcome<Vectorized> {
        if place.ready {
            return StageOutcome::Skip(SkipReason::AlreadyReady);
        }
        if place.generated_description().is_none() {
            return StageOutcome::Fail(StageFailure::data_quality(
                "no generated description to vectorize",
            ));
        }

        let (keywords, degraded) = if place.keywords.len() == self.keyword_arity
            && place.keywords.iter().all(|k| !k.trim().is_empty())
        {
            (place.keywords.clone(), false)
        } else {
            warn!(
                place_id = place.id,
                got = place.keywords.len(),
                expected = self.keyword_arity,
                "keyword list unusable; deriving keywords from categories"
            );
            (fallback_keywords(&place.category, self.keyword_arity), true)
        };

        let vectors = match timeout(self.timeouts.embedding, self.embedder.embed(&keywords)).await {
            Ok(Ok(vectors)) => vectors,
            Ok(Err(CollaboratorError::Decode(message))) => {
                warn!(place_id = place.id, data_quality = true, %message, "embedding response undecodable");
                return StageOutcome::Fail(StageFailure::data_quality(message));
            }
            Ok(Err(err)) => {
                warn!(place_id = place.id, error = %err, "embedding call failed");
                return StageOutcome::Fail(StageFailure::transient(err.to_string()));
            }
            Err(_) => {
                warn!(place_id = place.id, "embedding call timed out");
                return StageOutcome::Fail(StageFailure::transient("embedding timed out"));
            }
        };

        if vectors.len() != keywords.len() {
            warn!(
                place_id = place.id,
                data_quality = true,
                requested = keywords.len(),
                returned = vectors.len(),
                "embedding count mismatch"
            );
            return StageOutcome::Fail(StageFailure::data_quality(format!(
                "expected {} embeddings, got {}",
                keywords.len(),
                vectors.len()
            )));
        }

        let embeddings: Vec<KeywordEmbedding> = keywords
            .into_iter()
            .zip(vectors)
            .map(|(keyword, vector)| KeywordEmbedding { keyword, vector })
            .collect();
        if let Some(zero) = embeddings.iter().find(|e| e.is_zero()) {
            warn!(place_id = place.id, data_quality = true, keyword = %zero.keyword, "zero embedding");
            return StageOutcome::Fail(StageFailure::data_quality(format!(
                "zero vector for keyword {}",
                zero.keyword
            )));
        }

        StageOutcome::Success(Vectorized {
            embeddings,
            degraded,
        })
    }

    /// Stage C: attach embeddings, flip `ready`, persist in one transaction.
    pub async fn finalize(&self, place: &mut Place, vectorized: Vectorized) -> StageOutcome<()> {
        place.keywords = vectorized
            .embeddings
            .iter()
            .map(|e| e.keyword.clone())
            .collect();
        place.embeddings = vectorized.embeddings;
        place.crawl_state = CrawlState::Found;
        place.ready = true;

        if !place.satisfies_ready_invariant() {
            place.ready = false;
            warn!(place_id = place.id, data_quality = true, "ready invariant violated; not finalizing");
            return StageOutcome::Fail(StageFailure::data_quality("ready invariant violated"));
        }

        match self.places.save(place).await {
            Ok(()) => {
                info!(place_id = place.id, keywords = place.keywords.len(), "place ready");
                StageOutcome::Success(())
            }
            Err(err) => {
                place.ready = false;
                warn!(place_id = place.id, error = %err, "could not persist ready place");
                StageOutcome::Fail(StageFailure::transient(err.to_string()))
            }
        }
    }

    async fn persist_partial(&self, place: &Place) {
        if let Err(err) = self.places.save(place).await {
            warn!(place_id = place.id, error = %err, "could not persist partial progress");
        }
    }
}

fn skip_reason(place: &Place) -> Option<SkipReason> {
    if place.ready {
        Some(SkipReason::AlreadyReady)
    } else if place.is_terminal() {
        Some(SkipReason::TerminalNotFound)
    } else {
        None
    }
}

fn apply_crawled(place: &mut Place, query: &str, crawled: CrawledPlace) {
    place.crawl_state = CrawlState::Found;
    if let Some(count) = crawled.review_count() {
        place.review_count = count;
    }
    if crawled.business_hours.is_some() {
        place.business_hours = crawled.business_hours;
    }
    if crawled.parking_available.is_some() {
        place.parking_available = crawled.parking_available;
    }
    if crawled.pet_friendly.is_some() {
        place.pet_friendly = crawled.pet_friendly;
    }
    place.image_urls = crawled.image_urls;
    place.sns_urls = crawled.sns_urls;
    place.reviews = crawled
        .reviews
        .iter()
        .map(|r| sanitize_text(r))
        .filter(|r| !r.trim().is_empty())
        .collect();

    let summary: Vec<String> = crawled
        .ai_summary
        .iter()
        .map(|line| sanitize_text(line))
        .filter(|line| !line.trim().is_empty())
        .collect();

    let description = place.description.get_or_insert_with(PlaceDescription::default);
    description.ai_summary = (!summary.is_empty()).then(|| summary.join("\n"));
    description.original_description = crawled
        .original_description
        .map(|d| sanitize_text(&d))
        .filter(|d| !d.trim().is_empty());
    if !query.trim().is_empty() {
        description.search_query = Some(query.to_string());
    }
}

/// AI summary, then original description, then the first few reviews.
pub fn choose_text(place: &Place) -> Option<(TextSource, String)> {
    let description = place.description.as_ref();
    if let Some(summary) = description
        .and_then(|d| d.ai_summary.as_deref())
        .filter(|s| !s.trim().is_empty())
    {
        return Some((TextSource::AiSummary, summary.to_string()));
    }
    if let Some(original) = description
        .and_then(|d| d.original_description.as_deref())
        .filter(|s| !s.trim().is_empty())
    {
        return Some((TextSource::OriginalDescription, original.to_string()));
    }
    if !place.reviews.is_empty() {
        let joined = place
            .reviews
            .iter()
            .take(REVIEW_FALLBACK_LIMIT)
            .cloned()
            .collect::<Vec<_>>()
            .join("\n");
        if !joined.trim().is_empty() {
            return Some((TextSource::Reviews, joined));
        }
    }
    None
}

pub fn review_snippet(reviews: &[String]) -> String {
    if reviews.is_empty() {
        return NO_REVIEW_TEXT.to_string();
    }
    reviews
        .iter()
        .take(REVIEW_SNIPPET_LIMIT)
        .cloned()
        .collect::<Vec<_>>()
        .join("\n")
}

fn description_request(place: &Place) -> DescriptionRequest {
    let description = place.description.as_ref();
    DescriptionRequest {
        ai_summary: description
            .and_then(|d| d.ai_summary.clone())
            .unwrap_or_default(),
        review: review_snippet(&place.reviews),
        description: description
            .and_then(|d| d.original_description.clone())
            .unwrap_or_default(),
        category: place.category.join(","),
        pet_friendly: place.pet_friendly.unwrap_or(false),
    }
}

/// Drop ASCII control characters other than tab, newline and carriage return.
pub fn sanitize_text(text: &str) -> String {
    text.chars()
        .filter(|c| !c.is_ascii_control() || matches!(c, '\t' | '\n' | '\r'))
        .collect()
}

fn is_degenerate(description: &str) -> bool {
    !description.chars().any(char::is_alphanumeric)
}

/// Cut crawled text down to a description: keep whole sentences when one ends
/// late enough, otherwise hard-truncate with an ellipsis.
pub fn fallback_description(text: &str) -> String {
    let text = sanitize_text(text.trim());
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= DESCRIPTION_CAP {
        return text;
    }
    let head = &chars[..DESCRIPTION_CAP];
    match head.iter().rposition(|c| matches!(c, '.' | '!' | '?')) {
        Some(end) if end > MIN_SENTENCE_CUT => head[..=end].iter().collect::<String>().trim().to_string(),
        _ => {
            let cut: String = chars[..DESCRIPTION_CAP - 3].iter().collect();
            format!("{}...", cut.trim())
        }
    }
}

/// Category values padded with [`FILLER_KEYWORD`] to exactly `arity` entries.
pub fn fallback_keywords(category: &[String], arity: usize) -> Vec<String> {
    category
        .iter()
        .map(|c| c.trim())
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .chain(std::iter::repeat(FILLER_KEYWORD.to_string()))
        .take(arity)
        .collect()
}
