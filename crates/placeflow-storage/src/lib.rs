//! Lease table and place persistence for the readiness pipeline.
//!
//! Both stores are traits so batch workers run against Postgres while tests and
//! dry runs use the in-memory implementations with identical semantics.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use placeflow_core::{ChunkLease, Place};
use thiserror::Error;

mod memory;
mod pg;

pub use memory::{MemoryLeaseStore, MemoryPlaceStore};
pub use pg::{connect_pool, run_migrations, PgLeaseStore, PgPlaceStore};

pub const CRATE_NAME: &str = "placeflow-storage";

/// Error text the reaper writes into expired rows.
pub const LEASE_EXPIRED_ERROR: &str = "lease expired";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("{0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Everything needed to insert or take over one lease row.
#[derive(Debug, Clone)]
pub struct AcquireRequest<'a> {
    pub job_name: &'a str,
    pub chunk_id: &'a str,
    pub owner_id: &'a str,
    pub owner_host: Option<&'a str>,
    pub now: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub max_retries: i32,
}

/// Persisted `(job, chunk)` lease table.
///
/// Every status mutation is conditional on the caller still owning an active
/// lease; a `false` return means the lease was lost, which is not an error.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Atomic insert-if-absent, or take-over of a failed/expired row with retries left.
    async fn try_acquire(&self, request: AcquireRequest<'_>) -> StoreResult<bool>;

    async fn renew(
        &self,
        job_name: &str,
        owner_id: &str,
        new_expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<u64>;

    /// LEASED -> PROCESSING.
    async fn mark_processing(
        &self,
        job_name: &str,
        chunk_id: &str,
        owner_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<bool>;

    /// LEASED/PROCESSING -> COMPLETED.
    async fn mark_completed(
        &self,
        job_name: &str,
        chunk_id: &str,
        owner_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<bool>;

    /// LEASED/PROCESSING -> FAILED, incrementing the retry count. Returns the updated row.
    async fn mark_failed(
        &self,
        job_name: &str,
        chunk_id: &str,
        owner_id: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<ChunkLease>>;

    /// Expired LEASED/PROCESSING rows -> FAILED with [`LEASE_EXPIRED_ERROR`]. Returns the reaped rows.
    async fn fail_expired(&self, job_name: &str, now: DateTime<Utc>) -> StoreResult<Vec<ChunkLease>>;

    async fn delete_completed_before(
        &self,
        job_name: &str,
        before: DateTime<Utc>,
    ) -> StoreResult<u64>;

    /// FAILED rows whose lease ran out before `before`, exhausted or not.
    async fn delete_failed_before(
        &self,
        job_name: &str,
        before: DateTime<Utc>,
    ) -> StoreResult<u64>;

    async fn find(&self, job_name: &str, chunk_id: &str) -> StoreResult<Option<ChunkLease>>;

    async fn list_for_job(&self, job_name: &str) -> StoreResult<Vec<ChunkLease>>;

    async fn list_for_owner(&self, owner_id: &str) -> StoreResult<Vec<ChunkLease>>;

    /// Chunk ids an acquire at `now` would succeed on.
    async fn retryable_chunks(
        &self,
        job_name: &str,
        now: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<String>>;
}

/// Place rows plus their description and keyword embeddings.
#[async_trait]
pub trait PlaceStore: Send + Sync {
    /// Ids with `ready = false` and a crawl state other than NOT_FOUND, ascending, after `after_id`.
    async fn unfinished_ids_after(&self, after_id: Option<i64>, limit: usize) -> StoreResult<Vec<i64>>;

    /// Full records for `ids`, in id order; missing ids are skipped.
    async fn load_many(&self, ids: &[i64]) -> StoreResult<Vec<Place>>;

    async fn find(&self, id: i64) -> StoreResult<Option<Place>>;

    /// Last-write-wins upsert of the place, its description and embeddings in one transaction.
    async fn save(&self, place: &Place) -> StoreResult<()>;
}
