use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use placeflow_core::{ChunkLease, LeaseStatus, Place};
use tokio::sync::Mutex;

use crate::{AcquireRequest, LeaseStore, PlaceStore, StoreError, StoreResult, LEASE_EXPIRED_ERROR};

type LeaseKey = (String, String);

/// In-process lease table. A single mutex makes every operation atomic, which
/// mirrors the row-level guarantees of the Postgres store.
#[derive(Debug, Default)]
pub struct MemoryLeaseStore {
    rows: Mutex<BTreeMap<LeaseKey, ChunkLease>>,
}

impl MemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a row directly. Used to stage fixtures.
    pub async fn put(&self, lease: ChunkLease) {
        let key = (lease.job_name.clone(), lease.chunk_id.clone());
        self.rows.lock().await.insert(key, lease);
    }

    fn key(job_name: &str, chunk_id: &str) -> LeaseKey {
        (job_name.to_string(), chunk_id.to_string())
    }
}

fn owned_active<'a>(
    rows: &'a mut BTreeMap<LeaseKey, ChunkLease>,
    job_name: &str,
    chunk_id: &str,
    owner_id: &str,
) -> Option<&'a mut ChunkLease> {
    rows.get_mut(&MemoryLeaseStore::key(job_name, chunk_id))
        .filter(|lease| lease.owner_id == owner_id && lease.status.is_active())
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn try_acquire(&self, request: AcquireRequest<'_>) -> StoreResult<bool> {
        let mut rows = self.rows.lock().await;
        let key = Self::key(request.job_name, request.chunk_id);
        match rows.get_mut(&key) {
            None => {
                rows.insert(
                    key,
                    ChunkLease {
                        job_name: request.job_name.to_string(),
                        chunk_id: request.chunk_id.to_string(),
                        owner_id: request.owner_id.to_string(),
                        owner_host: request.owner_host.map(str::to_string),
                        status: LeaseStatus::Leased,
                        acquired_at: request.now,
                        started_at: None,
                        completed_at: None,
                        expires_at: request.expires_at,
                        retry_count: 0,
                        max_retries: request.max_retries,
                        last_error: None,
                    },
                );
                Ok(true)
            }
            Some(existing) if existing.is_eligible_at(request.now) => {
                existing.owner_id = request.owner_id.to_string();
                existing.owner_host = request.owner_host.map(str::to_string);
                existing.status = LeaseStatus::Leased;
                existing.acquired_at = request.now;
                existing.started_at = None;
                existing.completed_at = None;
                existing.expires_at = request.expires_at;
                Ok(true)
            }
            Some(_) => Ok(false),
        }
    }

    async fn renew(
        &self,
        job_name: &str,
        owner_id: &str,
        new_expires_at: DateTime<Utc>,
        _now: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let mut rows = self.rows.lock().await;
        let mut renewed = 0;
        for lease in rows.values_mut() {
            if lease.job_name == job_name && lease.owner_id == owner_id && lease.status.is_active() {
                lease.expires_at = new_expires_at;
                renewed += 1;
            }
        }
        Ok(renewed)
    }

    async fn mark_processing(
        &self,
        job_name: &str,
        chunk_id: &str,
        owner_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut rows = self.rows.lock().await;
        match owned_active(&mut rows, job_name, chunk_id, owner_id) {
            Some(lease) if lease.status == LeaseStatus::Leased => {
                lease.status = LeaseStatus::Processing;
                lease.started_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_completed(
        &self,
        job_name: &str,
        chunk_id: &str,
        owner_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut rows = self.rows.lock().await;
        match owned_active(&mut rows, job_name, chunk_id, owner_id) {
            Some(lease) => {
                lease.status = LeaseStatus::Completed;
                lease.completed_at = Some(now);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn mark_failed(
        &self,
        job_name: &str,
        chunk_id: &str,
        owner_id: &str,
        error: &str,
        _now: DateTime<Utc>,
    ) -> StoreResult<Option<ChunkLease>> {
        let mut rows = self.rows.lock().await;
        Ok(owned_active(&mut rows, job_name, chunk_id, owner_id).map(|lease| {
            lease.status = LeaseStatus::Failed;
            lease.last_error = Some(error.to_string());
            lease.retry_count += 1;
            lease.clone()
        }))
    }

    async fn fail_expired(&self, job_name: &str, now: DateTime<Utc>) -> StoreResult<Vec<ChunkLease>> {
        let mut rows = self.rows.lock().await;
        let mut reaped = Vec::new();
        for lease in rows.values_mut() {
            if lease.job_name == job_name && lease.status.is_active() && lease.expires_at < now {
                lease.status = LeaseStatus::Failed;
                lease.last_error = Some(LEASE_EXPIRED_ERROR.to_string());
                lease.retry_count += 1;
                reaped.push(lease.clone());
            }
        }
        Ok(reaped)
    }

    async fn delete_completed_before(
        &self,
        job_name: &str,
        before: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let mut rows = self.rows.lock().await;
        let initial = rows.len();
        rows.retain(|_, lease| {
            !(lease.job_name == job_name
                && lease.status == LeaseStatus::Completed
                && lease.completed_at.is_some_and(|at| at < before))
        });
        Ok((initial - rows.len()) as u64)
    }

    async fn delete_failed_before(
        &self,
        job_name: &str,
        before: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let mut rows = self.rows.lock().await;
        let initial = rows.len();
        rows.retain(|_, lease| {
            !(lease.job_name == job_name
                && lease.status == LeaseStatus::Failed
                && lease.expires_at < before)
        });
        Ok((initial - rows.len()) as u64)
    }

    async fn find(&self, job_name: &str, chunk_id: &str) -> StoreResult<Option<ChunkLease>> {
        Ok(self.rows.lock().await.get(&Self::key(job_name, chunk_id)).cloned())
    }

    async fn list_for_job(&self, job_name: &str) -> StoreResult<Vec<ChunkLease>> {
        Ok(self
            .rows
            .lock()
            .await
            .values()
            .filter(|lease| lease.job_name == job_name)
            .cloned()
            .collect())
    }

    async fn list_for_owner(&self, owner_id: &str) -> StoreResult<Vec<ChunkLease>> {
        Ok(self
            .rows
            .lock()
            .await
            .values()
            .filter(|lease| lease.owner_id == owner_id)
            .cloned()
            .collect())
    }

    async fn retryable_chunks(
        &self,
        job_name: &str,
        now: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<String>> {
        Ok(self
            .rows
            .lock()
            .await
            .values()
            .filter(|lease| lease.job_name == job_name && lease.is_eligible_at(now))
            .take(limit)
            .map(|lease| lease.chunk_id.clone())
            .collect())
    }
}

/// In-process place table with switches to simulate a persistence outage.
#[derive(Debug, Default)]
pub struct MemoryPlaceStore {
    places: Mutex<BTreeMap<i64, Place>>,
    fail_saves: AtomicBool,
    fail_loads: AtomicBool,
}

impl MemoryPlaceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn with_places(places: impl IntoIterator<Item = Place>) -> Self {
        let store = Self::new();
        for place in places {
            store.insert(place).await;
        }
        store
    }

    pub async fn insert(&self, place: Place) {
        self.places.lock().await.insert(place.id, place);
    }

    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_loads(&self, fail: bool) {
        self.fail_loads.store(fail, Ordering::SeqCst);
    }

    pub async fn snapshot(&self) -> Vec<Place> {
        self.places.lock().await.values().cloned().collect()
    }
}

#[async_trait]
impl PlaceStore for MemoryPlaceStore {
    async fn unfinished_ids_after(&self, after_id: Option<i64>, limit: usize) -> StoreResult<Vec<i64>> {
        let places = self.places.lock().await;
        Ok(places
            .values()
            .filter(|place| after_id.map_or(true, |after| place.id > after))
            .filter(|place| !place.ready && !place.is_terminal())
            .take(limit)
            .map(|place| place.id)
            .collect())
    }

    async fn load_many(&self, ids: &[i64]) -> StoreResult<Vec<Place>> {
        if self.fail_loads.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("place store offline".to_string()));
        }
        let places = self.places.lock().await;
        let mut out: Vec<Place> = ids.iter().filter_map(|id| places.get(id).cloned()).collect();
        out.sort_by_key(|place| place.id);
        Ok(out)
    }

    async fn find(&self, id: i64) -> StoreResult<Option<Place>> {
        Ok(self.places.lock().await.get(&id).cloned())
    }

    async fn save(&self, place: &Place) -> StoreResult<()> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("place store offline".to_string()));
        }
        let mut stored = place.clone();
        stored.updated_at = Utc::now();
        self.places.lock().await.insert(place.id, stored);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use placeflow_core::CrawlState;

    const JOB: &str = "distributedCrawlingJob";
    const CHUNK: &str = "record_1-10";

    fn request<'a>(owner: &'a str, now: DateTime<Utc>, ttl: Duration) -> AcquireRequest<'a> {
        AcquireRequest {
            job_name: JOB,
            chunk_id: CHUNK,
            owner_id: owner,
            owner_host: Some("host-a"),
            now,
            expires_at: now + ttl,
            max_retries: 3,
        }
    }

    #[tokio::test]
    async fn second_acquire_of_live_lease_fails() {
        let store = MemoryLeaseStore::new();
        let now = Utc::now();
        assert!(store.try_acquire(request("w1", now, Duration::minutes(10))).await.unwrap());
        assert!(!store.try_acquire(request("w2", now, Duration::minutes(10))).await.unwrap());

        let lease = store.find(JOB, CHUNK).await.unwrap().unwrap();
        assert_eq!(lease.owner_id, "w1");
        assert_eq!(lease.status, LeaseStatus::Leased);
    }

    #[tokio::test]
    async fn expired_lease_is_reaped_and_taken_over() {
        let store = MemoryLeaseStore::new();
        let start = Utc::now();
        assert!(store.try_acquire(request("w1", start, Duration::seconds(1))).await.unwrap());

        let later = start + Duration::seconds(5);
        let reaped = store.fail_expired(JOB, later).await.unwrap();
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].status, LeaseStatus::Failed);
        assert_eq!(reaped[0].retry_count, 1);
        assert_eq!(reaped[0].last_error.as_deref(), Some(LEASE_EXPIRED_ERROR));

        assert!(store.try_acquire(request("w2", later, Duration::minutes(10))).await.unwrap());
        let lease = store.find(JOB, CHUNK).await.unwrap().unwrap();
        assert_eq!(lease.owner_id, "w2");
        assert_eq!(lease.status, LeaseStatus::Leased);
        assert_eq!(lease.retry_count, 1);
    }

    #[tokio::test]
    async fn exhausted_rows_are_never_reacquired() {
        let store = MemoryLeaseStore::new();
        let now = Utc::now();
        for attempt in 1..=3 {
            let owner = format!("w{attempt}");
            assert!(store
                .try_acquire(request(&owner, now, Duration::minutes(10)))
                .await
                .unwrap());
            let failed = store.mark_failed(JOB, CHUNK, &owner, "boom", now).await.unwrap();
            assert_eq!(failed.map(|lease| lease.retry_count), Some(attempt));
        }

        let lease = store.find(JOB, CHUNK).await.unwrap().unwrap();
        assert!(lease.is_exhausted());
        assert!(!store.try_acquire(request("w9", now, Duration::minutes(10))).await.unwrap());
        assert!(store.retryable_chunks(JOB, now, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn transitions_from_non_owner_are_ignored() {
        let store = MemoryLeaseStore::new();
        let now = Utc::now();
        store.try_acquire(request("w1", now, Duration::minutes(10))).await.unwrap();

        assert!(!store.mark_processing(JOB, CHUNK, "w2", now).await.unwrap());
        assert!(!store.mark_completed(JOB, CHUNK, "w2", now).await.unwrap());
        assert!(store.mark_failed(JOB, CHUNK, "w2", "nope", now).await.unwrap().is_none());

        assert!(store.mark_processing(JOB, CHUNK, "w1", now).await.unwrap());
        assert!(store.mark_completed(JOB, CHUNK, "w1", now).await.unwrap());
        // terminal rows cannot move again
        assert!(!store.mark_completed(JOB, CHUNK, "w1", now).await.unwrap());
    }

    #[tokio::test]
    async fn renew_only_touches_owned_active_rows() {
        let store = MemoryLeaseStore::new();
        let now = Utc::now();
        store.try_acquire(request("w1", now, Duration::minutes(1))).await.unwrap();
        let mut other = request("w2", now, Duration::minutes(1));
        other.chunk_id = "record_11-20";
        store.try_acquire(other).await.unwrap();

        let extended = now + Duration::minutes(10);
        assert_eq!(store.renew(JOB, "w1", extended, now).await.unwrap(), 1);
        assert_eq!(store.find(JOB, CHUNK).await.unwrap().unwrap().expires_at, extended);
        assert_ne!(
            store.find(JOB, "record_11-20").await.unwrap().unwrap().expires_at,
            extended
        );

        store.mark_completed(JOB, CHUNK, "w1", now).await.unwrap();
        assert_eq!(store.renew(JOB, "w1", extended, now).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn cleanup_removes_only_old_completed_rows() {
        let store = MemoryLeaseStore::new();
        let now = Utc::now();
        store.try_acquire(request("w1", now, Duration::minutes(10))).await.unwrap();
        store
            .mark_completed(JOB, CHUNK, "w1", now - Duration::days(8))
            .await
            .unwrap();
        let mut live = request("w1", now, Duration::minutes(10));
        live.chunk_id = "record_11-20";
        store.try_acquire(live).await.unwrap();

        let removed = store
            .delete_completed_before(JOB, now - Duration::days(7))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.list_for_job(JOB).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stale_failed_rows_are_pruned() {
        let store = MemoryLeaseStore::new();
        let now = Utc::now();
        let old = now - Duration::days(9);
        store.try_acquire(request("w1", old, Duration::minutes(10))).await.unwrap();
        store.mark_failed(JOB, CHUNK, "w1", "crawler down", old).await.unwrap();
        let mut recent = request("w1", now, Duration::minutes(10));
        recent.chunk_id = "record_11-20";
        store.try_acquire(recent).await.unwrap();
        store
            .mark_failed(JOB, "record_11-20", "w1", "crawler down", now)
            .await
            .unwrap();

        let removed = store
            .delete_failed_before(JOB, now - Duration::days(7))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        let left = store.list_for_job(JOB).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].chunk_id, "record_11-20");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_acquires_grant_exactly_one_lease() {
        let store = std::sync::Arc::new(MemoryLeaseStore::new());
        let now = Utc::now();
        let attempts: Vec<_> = (0..16)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    let owner = format!("w{i}");
                    store
                        .try_acquire(request(&owner, now, Duration::minutes(10)))
                        .await
                        .unwrap()
                })
            })
            .collect();

        let mut granted = 0;
        for attempt in attempts {
            if attempt.await.unwrap() {
                granted += 1;
            }
        }
        assert_eq!(granted, 1);
        let active: Vec<_> = store
            .list_for_job(JOB)
            .await
            .unwrap()
            .into_iter()
            .filter(|lease| lease.status.is_active())
            .collect();
        assert_eq!(active.len(), 1);
    }

    #[tokio::test]
    async fn failing_load_reports_unavailable() {
        let store = MemoryPlaceStore::with_places([Place::new(1, "One")]).await;
        store.set_fail_loads(true);
        assert!(matches!(
            store.load_many(&[1]).await,
            Err(StoreError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn unfinished_scan_skips_ready_and_not_found() {
        let mut ready = Place::new(2, "Ready");
        ready.ready = true;
        let mut gone = Place::new(3, "Gone");
        gone.crawl_state = CrawlState::NotFound;
        let store = MemoryPlaceStore::with_places([
            Place::new(1, "One"),
            ready,
            gone,
            Place::new(4, "Four"),
            Place::new(5, "Five"),
        ])
        .await;

        assert_eq!(store.unfinished_ids_after(None, 10).await.unwrap(), vec![1, 4, 5]);
        assert_eq!(store.unfinished_ids_after(Some(1), 1).await.unwrap(), vec![4]);
    }

    #[tokio::test]
    async fn failing_save_leaves_record_untouched() {
        let store = MemoryPlaceStore::with_places([Place::new(1, "One")]).await;
        store.set_fail_saves(true);
        let mut changed = Place::new(1, "Renamed");
        changed.ready = true;
        assert!(store.save(&changed).await.is_err());
        assert_eq!(store.find(1).await.unwrap().unwrap().name, "One");
    }
}
