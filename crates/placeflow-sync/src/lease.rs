use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use placeflow_core::{ChunkLease, LeaseStatus, WorkerIdentity};
use placeflow_storage::{AcquireRequest, LeaseStore};
use tracing::{debug, error, info, warn};

/// Outcome of a status transition on a lease this worker believes it holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseTransition {
    Applied,
    /// Another worker took the chunk over, or the lease was reaped. Not an error.
    LeaseLost,
}

impl LeaseTransition {
    fn from_applied(applied: bool) -> Self {
        if applied {
            Self::Applied
        } else {
            Self::LeaseLost
        }
    }
}

/// Distributed lease lock over `(job, chunk)` pairs, owned by one worker identity.
pub struct LeaseManager {
    store: Arc<dyn LeaseStore>,
    identity: WorkerIdentity,
    lease_duration: Duration,
    max_retries: i32,
}

impl LeaseManager {
    pub fn new(
        store: Arc<dyn LeaseStore>,
        identity: WorkerIdentity,
        lease_duration: Duration,
        max_retries: i32,
    ) -> Self {
        Self {
            store,
            identity,
            lease_duration,
            max_retries,
        }
    }

    pub fn identity(&self) -> &WorkerIdentity {
        &self.identity
    }

    pub fn lease_duration(&self) -> Duration {
        self.lease_duration
    }

    pub async fn acquire(&self, job: &str, chunk: &str, lease_duration: Duration) -> Result<bool> {
        let now = Utc::now();
        let acquired = self
            .store
            .try_acquire(AcquireRequest {
                job_name: job,
                chunk_id: chunk,
                owner_id: &self.identity.worker_id,
                owner_host: Some(&self.identity.hostname),
                now,
                expires_at: now + lease_duration,
                max_retries: self.max_retries,
            })
            .await
            .with_context(|| format!("acquiring lease {job}/{chunk}"))?;
        if acquired {
            info!(job, chunk, worker = %self.identity.worker_id, "lease acquired");
        } else {
            debug!(job, chunk, worker = %self.identity.worker_id, "lease held elsewhere");
        }
        Ok(acquired)
    }

    /// Push `expires_at` of every active lease this worker owns to now + `extension`.
    pub async fn renew(&self, job: &str, extension: Duration) -> Result<u64> {
        let now = Utc::now();
        let renewed = self
            .store
            .renew(job, &self.identity.worker_id, now + extension, now)
            .await
            .with_context(|| format!("renewing leases for {job}"))?;
        debug!(job, worker = %self.identity.worker_id, renewed, "leases renewed");
        Ok(renewed)
    }

    pub async fn mark_processing(&self, job: &str, chunk: &str) -> Result<LeaseTransition> {
        let applied = self
            .store
            .mark_processing(job, chunk, &self.identity.worker_id, Utc::now())
            .await
            .with_context(|| format!("marking {job}/{chunk} processing"))?;
        Ok(self.log_transition(job, chunk, LeaseStatus::Processing, applied))
    }

    pub async fn mark_completed(&self, job: &str, chunk: &str) -> Result<LeaseTransition> {
        let applied = self
            .store
            .mark_completed(job, chunk, &self.identity.worker_id, Utc::now())
            .await
            .with_context(|| format!("marking {job}/{chunk} completed"))?;
        Ok(self.log_transition(job, chunk, LeaseStatus::Completed, applied))
    }

    pub async fn mark_failed(&self, job: &str, chunk: &str, error: &str) -> Result<LeaseTransition> {
        let updated = self
            .store
            .mark_failed(job, chunk, &self.identity.worker_id, error, Utc::now())
            .await
            .with_context(|| format!("marking {job}/{chunk} failed"))?;
        if let Some(lease) = &updated {
            report_exhaustion(lease);
        }
        Ok(self.log_transition(job, chunk, LeaseStatus::Failed, updated.is_some()))
    }

    /// Fail every expired active lease of `job`. Returns how many rows were reaped.
    pub async fn reap_expired(&self, job: &str, now: DateTime<Utc>) -> Result<u64> {
        let reaped = self
            .store
            .fail_expired(job, now)
            .await
            .with_context(|| format!("reaping expired leases for {job}"))?;
        for lease in &reaped {
            warn!(
                job,
                chunk = %lease.chunk_id,
                previous_owner = %lease.owner_id,
                retry_count = lease.retry_count,
                "reaped expired lease"
            );
            report_exhaustion(lease);
        }
        Ok(reaped.len() as u64)
    }

    /// Delete completed rows older than `retention`.
    pub async fn cleanup_completed(&self, job: &str, retention: Duration) -> Result<u64> {
        let cutoff = Utc::now() - retention;
        let deleted = self
            .store
            .delete_completed_before(job, cutoff)
            .await
            .with_context(|| format!("cleaning completed leases for {job}"))?;
        info!(job, deleted, %cutoff, "completed leases cleaned up");
        Ok(deleted)
    }

    /// Delete failed rows whose lease ran out more than `retention` ago.
    ///
    /// Chunk ids follow the current unfinished page, so a failed chunk whose
    /// places were finished elsewhere is never leased under the same id again.
    pub async fn prune_failed(&self, job: &str, retention: Duration) -> Result<u64> {
        let cutoff = Utc::now() - retention;
        let deleted = self
            .store
            .delete_failed_before(job, cutoff)
            .await
            .with_context(|| format!("pruning failed leases for {job}"))?;
        info!(job, deleted, %cutoff, "stale failed leases pruned");
        Ok(deleted)
    }

    /// Failed chunks that will never be re-leased automatically.
    pub async fn exhausted_chunks(&self, job: &str) -> Result<Vec<ChunkLease>> {
        Ok(self
            .leases(job)
            .await?
            .into_iter()
            .filter(|lease| lease.status == LeaseStatus::Failed && lease.is_exhausted())
            .collect())
    }

    pub async fn retryable_chunks(&self, job: &str, limit: usize) -> Result<Vec<String>> {
        self.store
            .retryable_chunks(job, Utc::now(), limit)
            .await
            .with_context(|| format!("listing retryable chunks for {job}"))
    }

    pub async fn leases(&self, job: &str) -> Result<Vec<ChunkLease>> {
        self.store
            .list_for_job(job)
            .await
            .with_context(|| format!("listing leases for {job}"))
    }

    pub async fn my_leases(&self) -> Result<Vec<ChunkLease>> {
        self.store
            .list_for_owner(&self.identity.worker_id)
            .await
            .context("listing leases owned by this worker")
    }

    fn log_transition(
        &self,
        job: &str,
        chunk: &str,
        target: LeaseStatus,
        applied: bool,
    ) -> LeaseTransition {
        let transition = LeaseTransition::from_applied(applied);
        if transition == LeaseTransition::LeaseLost {
            warn!(
                job,
                chunk,
                worker = %self.identity.worker_id,
                target = %target,
                "lease lost before transition"
            );
        } else {
            debug!(job, chunk, worker = %self.identity.worker_id, status = %target, "lease transitioned");
        }
        transition
    }
}

fn report_exhaustion(lease: &ChunkLease) {
    if lease.is_exhausted() {
        error!(
            job = %lease.job_name,
            chunk = %lease.chunk_id,
            retry_count = lease.retry_count,
            max_retries = lease.max_retries,
            last_error = lease.last_error.as_deref().unwrap_or(""),
            "chunk exhausted its retries and needs operator attention"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use placeflow_storage::{MemoryLeaseStore, LEASE_EXPIRED_ERROR};

    const JOB: &str = "distributedCrawlingJob";

    fn manager(store: Arc<MemoryLeaseStore>, worker: &str) -> LeaseManager {
        LeaseManager::new(
            store,
            WorkerIdentity::new(worker, "host"),
            Duration::minutes(10),
            3,
        )
    }

    #[tokio::test]
    async fn only_one_worker_holds_a_chunk() {
        let store = Arc::new(MemoryLeaseStore::new());
        let w1 = manager(store.clone(), "w1");
        let w2 = manager(store.clone(), "w2");

        assert!(w1.acquire(JOB, "record_1-10", Duration::minutes(10)).await.unwrap());
        assert!(!w2.acquire(JOB, "record_1-10", Duration::minutes(10)).await.unwrap());
        assert_eq!(w2.my_leases().await.unwrap().len(), 0);
        assert_eq!(w1.my_leases().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn transitions_after_takeover_report_lease_lost() {
        let store = Arc::new(MemoryLeaseStore::new());
        let w1 = manager(store.clone(), "w1");
        let w2 = manager(store.clone(), "w2");

        w1.acquire(JOB, "record_1-10", Duration::milliseconds(-1)).await.unwrap();
        assert_eq!(w2.reap_expired(JOB, Utc::now()).await.unwrap(), 1);
        assert!(w2.acquire(JOB, "record_1-10", Duration::minutes(10)).await.unwrap());

        assert_eq!(
            w1.mark_completed(JOB, "record_1-10").await.unwrap(),
            LeaseTransition::LeaseLost
        );
        assert_eq!(
            w2.mark_processing(JOB, "record_1-10").await.unwrap(),
            LeaseTransition::Applied
        );
        assert_eq!(
            w2.mark_completed(JOB, "record_1-10").await.unwrap(),
            LeaseTransition::Applied
        );

        let lease = store.find(JOB, "record_1-10").await.unwrap().unwrap();
        assert_eq!(lease.owner_id, "w2");
        assert_eq!(lease.status, LeaseStatus::Completed);
        assert_eq!(lease.last_error.as_deref(), Some(LEASE_EXPIRED_ERROR));
    }

    #[tokio::test]
    async fn repeated_failures_exhaust_the_chunk() {
        let store = Arc::new(MemoryLeaseStore::new());
        let w1 = manager(store.clone(), "w1");

        for _ in 0..3 {
            assert!(w1.acquire(JOB, "record_1-10", Duration::minutes(10)).await.unwrap());
            assert_eq!(
                w1.mark_failed(JOB, "record_1-10", "crawler down").await.unwrap(),
                LeaseTransition::Applied
            );
        }

        assert!(!w1.acquire(JOB, "record_1-10", Duration::minutes(10)).await.unwrap());
        let exhausted = w1.exhausted_chunks(JOB).await.unwrap();
        assert_eq!(exhausted.len(), 1);
        assert_eq!(exhausted[0].retry_count, 3);
        assert!(w1.retryable_chunks(JOB, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn renew_extends_only_own_active_leases() {
        let store = Arc::new(MemoryLeaseStore::new());
        let w1 = manager(store.clone(), "w1");
        let w2 = manager(store.clone(), "w2");
        w1.acquire(JOB, "record_1-10", Duration::seconds(30)).await.unwrap();
        w1.acquire(JOB, "record_11-20", Duration::seconds(30)).await.unwrap();
        w2.acquire(JOB, "record_21-30", Duration::seconds(30)).await.unwrap();
        w1.mark_completed(JOB, "record_11-20").await.unwrap();

        assert_eq!(w1.renew(JOB, Duration::minutes(10)).await.unwrap(), 1);
        let renewed = store.find(JOB, "record_1-10").await.unwrap().unwrap();
        assert!(renewed.expires_at > Utc::now() + Duration::minutes(9));
        let untouched = store.find(JOB, "record_21-30").await.unwrap().unwrap();
        assert!(untouched.expires_at < Utc::now() + Duration::minutes(1));
    }

    #[tokio::test]
    async fn prune_failed_drops_orphaned_rows_past_retention() {
        let store = Arc::new(MemoryLeaseStore::new());
        let w1 = manager(store.clone(), "w1");

        w1.acquire(JOB, "record_1-10", Duration::days(-9)).await.unwrap();
        assert_eq!(w1.reap_expired(JOB, Utc::now()).await.unwrap(), 1);
        w1.acquire(JOB, "record_11-20", Duration::minutes(10)).await.unwrap();
        w1.mark_failed(JOB, "record_11-20", "embedding service down")
            .await
            .unwrap();

        assert_eq!(w1.prune_failed(JOB, Duration::days(7)).await.unwrap(), 1);
        let left = w1.leases(JOB).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].chunk_id, "record_11-20");
    }
}
