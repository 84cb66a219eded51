//! Core domain model for the place readiness pipeline: places, chunk leases and stage outcomes.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "placeflow-core";

/// Number of keywords (and embeddings) a ready place carries.
pub const DEFAULT_KEYWORD_ARITY: usize = 9;

/// Whether the crawler could locate the place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CrawlState {
    #[default]
    Unknown,
    Found,
    NotFound,
}

impl CrawlState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::Found => "FOUND",
            Self::NotFound => "NOT_FOUND",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "UNKNOWN" => Some(Self::Unknown),
            "FOUND" => Some(Self::Found),
            "NOT_FOUND" => Some(Self::NotFound),
            _ => None,
        }
    }
}

impl fmt::Display for CrawlState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The single active description payload of a place.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PlaceDescription {
    pub original_description: Option<String>,
    pub ai_summary: Option<String>,
    /// Final user-facing description produced by the describe stage.
    pub generated: Option<String>,
    /// Query sent to the crawler; reused on later crawls when present.
    pub search_query: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeywordEmbedding {
    pub keyword: String,
    pub vector: Vec<f32>,
}

impl KeywordEmbedding {
    /// An all-zero (or empty) vector is what a failed embedding call looks like.
    pub fn is_zero(&self) -> bool {
        self.vector.iter().all(|v| *v == 0.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WeeklyHours {
    pub open: Option<String>,
    pub close: Option<String>,
    pub description: Option<String>,
    #[serde(default)]
    pub is_operating: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BusinessHours {
    pub today_status: Option<String>,
    pub description: Option<String>,
    pub last_order_minutes: Option<i32>,
    #[serde(default)]
    pub weekly: BTreeMap<String, WeeklyHours>,
}

/// A place record moving through crawl, describe and vectorize stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Place {
    pub id: i64,
    pub name: String,
    pub road_address: Option<String>,
    pub category: Vec<String>,
    pub crawl_state: CrawlState,
    pub ready: bool,
    pub review_count: i32,
    pub parking_available: Option<bool>,
    pub pet_friendly: Option<bool>,
    pub business_hours: Option<BusinessHours>,
    pub sns_urls: BTreeMap<String, String>,
    pub image_urls: Vec<String>,
    pub reviews: Vec<String>,
    pub description: Option<PlaceDescription>,
    pub keywords: Vec<String>,
    pub embeddings: Vec<KeywordEmbedding>,
    pub updated_at: DateTime<Utc>,
}

impl Place {
    pub fn new(id: i64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            road_address: None,
            category: Vec::new(),
            crawl_state: CrawlState::Unknown,
            ready: false,
            review_count: 0,
            parking_available: None,
            pet_friendly: None,
            business_hours: None,
            sns_urls: BTreeMap::new(),
            image_urls: Vec::new(),
            reviews: Vec::new(),
            description: None,
            keywords: Vec::new(),
            embeddings: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    pub fn stored_search_query(&self) -> Option<&str> {
        self.description
            .as_ref()
            .and_then(|d| d.search_query.as_deref())
            .filter(|q| !q.trim().is_empty())
    }

    pub fn generated_description(&self) -> Option<&str> {
        self.description
            .as_ref()
            .and_then(|d| d.generated.as_deref())
            .filter(|d| !d.trim().is_empty())
    }

    /// Not found by the crawler and not ready: excluded from automatic retry.
    pub fn is_terminal(&self) -> bool {
        !self.ready && self.crawl_state == CrawlState::NotFound
    }

    /// `ready` may only be true when a description and one non-zero embedding per keyword exist.
    pub fn satisfies_ready_invariant(&self) -> bool {
        if !self.ready {
            return true;
        }
        self.generated_description().is_some()
            && !self.keywords.is_empty()
            && self.embeddings.len() == self.keywords.len()
            && self
                .embeddings
                .iter()
                .zip(&self.keywords)
                .all(|(e, k)| &e.keyword == k && !e.is_zero())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LeaseStatus {
    Leased,
    Processing,
    Completed,
    Failed,
}

impl LeaseStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Leased => "LEASED",
            Self::Processing => "PROCESSING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "LEASED" => Some(Self::Leased),
            "PROCESSING" => Some(Self::Processing),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Held by a worker: subject to renewal and expiry.
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Leased | Self::Processing)
    }
}

impl fmt::Display for LeaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the lease table, keyed by `(job_name, chunk_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkLease {
    pub job_name: String,
    pub chunk_id: String,
    pub owner_id: String,
    pub owner_host: Option<String>,
    pub status: LeaseStatus,
    pub acquired_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub last_error: Option<String>,
}

impl ChunkLease {
    pub fn is_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }

    /// Whether an acquire at `now` may take this row over.
    pub fn is_eligible_at(&self, now: DateTime<Utc>) -> bool {
        if self.is_exhausted() {
            return false;
        }
        match self.status {
            LeaseStatus::Failed => true,
            LeaseStatus::Leased | LeaseStatus::Processing => self.expires_at < now,
            LeaseStatus::Completed => false,
        }
    }
}

/// Entry of the in-process single-flight cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessingStatus {
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Crawler reported the place does not exist. Terminal.
    NotFound,
    /// Outage, timeout or persistence error. Retryable.
    Transient,
    /// A collaborator answered with unusable data. Retryable, but points at a misbehaving service.
    DataQuality,
}

impl FailureKind {
    pub const fn is_retryable(self) -> bool {
        !matches!(self, Self::NotFound)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl StageFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(FailureKind::NotFound, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Transient, message)
    }

    pub fn data_quality(message: impl Into<String>) -> Self {
        Self::new(FailureKind::DataQuality, message)
    }
}

impl fmt::Display for StageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    AlreadyReady,
    TerminalNotFound,
}

/// Result of one pipeline stage. Skips are expected control flow, not errors.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome<T> {
    Success(T),
    Skip(SkipReason),
    Fail(StageFailure),
}

impl<T> StageOutcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn failure(&self) -> Option<&StageFailure> {
        match self {
            Self::Fail(failure) => Some(failure),
            _ => None,
        }
    }
}

/// Identity a worker process writes into the lease rows it owns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerIdentity {
    pub worker_id: String,
    pub hostname: String,
}

impl WorkerIdentity {
    pub fn new(worker_id: impl Into<String>, hostname: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            hostname: hostname.into(),
        }
    }

    /// `<hostname>-<8 hex chars>`, unique per process start.
    pub fn generate() -> Self {
        let hostname = local_hostname();
        let suffix = Uuid::new_v4().simple().to_string();
        Self {
            worker_id: format!("{hostname}-{}", &suffix[..8]),
            hostname,
        }
    }
}

fn local_hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}
