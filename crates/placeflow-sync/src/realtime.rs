//! On-demand processing guarded by a per-process single-flight cache.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use placeflow_core::{Place, ProcessingStatus};
use tokio::sync::Mutex;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::pipeline::PlacePipeline;

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    status: ProcessingStatus,
    inserted_at: Instant,
}

/// Result of an atomic check-and-register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// The caller now owns the run for this id.
    Registered,
    InProgress,
    Completed,
}

/// Bounded, expiring map of place id to processing status.
#[derive(Debug)]
pub struct StatusCache {
    entries: Mutex<LruCache<i64, CacheEntry>>,
    ttl: Duration,
}

impl StatusCache {
    pub fn new(max_size: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(max_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    fn live(&self, entry: &CacheEntry) -> bool {
        entry.inserted_at.elapsed() < self.ttl
    }

    /// Register `InProgress` unless a live `InProgress` or `Completed` entry exists.
    pub async fn try_register(&self, place_id: i64) -> Registration {
        let mut entries = self.entries.lock().await;
        let current = entries
            .get(&place_id)
            .copied()
            .filter(|entry| self.live(entry))
            .map(|entry| entry.status);
        match current {
            Some(ProcessingStatus::InProgress) => Registration::InProgress,
            Some(ProcessingStatus::Completed) => Registration::Completed,
            Some(ProcessingStatus::Failed) | None => {
                entries.put(
                    place_id,
                    CacheEntry {
                        status: ProcessingStatus::InProgress,
                        inserted_at: Instant::now(),
                    },
                );
                Registration::Registered
            }
        }
    }

    pub async fn set(&self, place_id: i64, status: ProcessingStatus) {
        self.entries.lock().await.put(
            place_id,
            CacheEntry {
                status,
                inserted_at: Instant::now(),
            },
        );
    }

    pub async fn invalidate(&self, place_id: i64) {
        self.entries.lock().await.pop(&place_id);
    }

    pub async fn status(&self, place_id: i64) -> Option<ProcessingStatus> {
        let mut entries = self.entries.lock().await;
        let entry = entries.get(&place_id).copied()?;
        if self.live(&entry) {
            Some(entry.status)
        } else {
            entries.pop(&place_id);
            None
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

pub struct RealtimeProcessor {
    pipeline: Arc<PlacePipeline>,
    cache: Arc<StatusCache>,
    timeout: Duration,
}

impl RealtimeProcessor {
    pub fn new(pipeline: Arc<PlacePipeline>, cache: Arc<StatusCache>, timeout: Duration) -> Self {
        Self {
            pipeline,
            cache,
            timeout,
        }
    }

    pub fn cache(&self) -> &Arc<StatusCache> {
        &self.cache
    }

    /// Make `place` ready if possible within the on-demand timeout.
    ///
    /// Returns the updated place on success and the input unchanged otherwise.
    /// The spawned run settles the cache entry itself, so the entry ends
    /// `Completed`, `Failed` or absent even when the caller goes away. A
    /// timed-out run keeps going in the background; its entry is dropped so a
    /// later request can start over.
    pub async fn process_realtime(&self, place: Place) -> Place {
        if place.ready {
            return place;
        }
        let place_id = place.id;
        let span = info_span!("realtime", place_id);

        async {
            match self.cache.try_register(place_id).await {
                Registration::InProgress => {
                    debug!("already being processed");
                    return place;
                }
                Registration::Completed => {
                    return match self.pipeline.place_store().find(place_id).await {
                        Ok(Some(stored)) => stored,
                        Ok(None) => place,
                        Err(err) => {
                            warn!(error = %err, "could not reload completed place");
                            place
                        }
                    };
                }
                Registration::Registered => {}
            }

            let handle = tokio::spawn(
                settle_run(
                    Arc::clone(&self.pipeline),
                    Arc::clone(&self.cache),
                    place.clone(),
                )
                .in_current_span(),
            );

            match timeout(self.timeout, handle).await {
                Ok(Ok(Some(ready))) => ready,
                Ok(Ok(None)) => place,
                Ok(Err(join_err)) => {
                    error!(error = %join_err, "on-demand task failed");
                    place
                }
                Err(_) => {
                    self.cache.invalidate(place_id).await;
                    warn!(timeout = ?self.timeout, "on-demand processing timed out");
                    place
                }
            }
        }
        .instrument(span)
        .await
    }
}

/// Run the pipeline and record its final status. Returns the place when it became ready.
async fn settle_run(
    pipeline: Arc<PlacePipeline>,
    cache: Arc<StatusCache>,
    place: Place,
) -> Option<Place> {
    let place_id = place.id;
    let run = tokio::spawn(async move { pipeline.run(place).await });
    match run.await {
        Ok(report) if report.is_ready() => {
            cache.set(place_id, ProcessingStatus::Completed).await;
            info!("on-demand processing completed");
            Some(report.place)
        }
        Ok(report) => {
            cache.set(place_id, ProcessingStatus::Failed).await;
            warn!(outcome = ?report.outcome, "on-demand processing did not make place ready");
            None
        }
        Err(join_err) => {
            cache.invalidate(place_id).await;
            error!(error = %join_err, "on-demand pipeline task panicked");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        crawled_place, nine_keywords, pipeline_with, EmbedScript, FakeCrawler, FakeDescriber,
        FakeEmbedder,
    };
    use placeflow_adapters::DescriptionDraft;
    use placeflow_storage::{MemoryPlaceStore, PlaceStore};

    fn draft() -> Option<DescriptionDraft> {
        Some(DescriptionDraft {
            description: "A quiet cafe by the sea with bright windows.".into(),
            keywords: nine_keywords(),
        })
    }

    async fn processor(
        crawler: Arc<FakeCrawler>,
        store: Arc<MemoryPlaceStore>,
        realtime_timeout: Duration,
    ) -> RealtimeProcessor {
        let pipeline = pipeline_with(
            store,
            crawler,
            Arc::new(FakeDescriber::new(draft())),
            Arc::new(FakeEmbedder::new(EmbedScript::Vectors(4))),
        );
        RealtimeProcessor::new(
            Arc::new(pipeline),
            Arc::new(StatusCache::new(1000, Duration::from_secs(3600))),
            realtime_timeout,
        )
    }

    #[tokio::test]
    async fn registration_is_single_flight() {
        let cache = StatusCache::new(10, Duration::from_secs(60));
        assert_eq!(cache.try_register(1).await, Registration::Registered);
        assert_eq!(cache.try_register(1).await, Registration::InProgress);
        cache.set(1, ProcessingStatus::Failed).await;
        assert_eq!(cache.try_register(1).await, Registration::Registered);
        cache.set(1, ProcessingStatus::Completed).await;
        assert_eq!(cache.try_register(1).await, Registration::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entries_are_ignored() {
        let cache = StatusCache::new(10, Duration::from_secs(60));
        cache.set(1, ProcessingStatus::InProgress).await;
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(cache.status(1).await, None);
        assert_eq!(cache.try_register(1).await, Registration::Registered);
    }

    #[tokio::test]
    async fn cache_evicts_least_recently_used() {
        let cache = StatusCache::new(2, Duration::from_secs(60));
        cache.set(1, ProcessingStatus::Completed).await;
        cache.set(2, ProcessingStatus::Completed).await;
        cache.set(3, ProcessingStatus::Completed).await;
        assert_eq!(cache.len().await, 2);
        assert_eq!(cache.status(1).await, None);
    }

    #[tokio::test]
    async fn concurrent_requests_crawl_once() {
        let store = Arc::new(MemoryPlaceStore::with_places([Place::new(5, "Moon Cafe")]).await);
        let crawler = Arc::new(
            FakeCrawler::found(crawled_place()).with_delay(Duration::from_millis(200)),
        );
        let processor = processor(crawler.clone(), store.clone(), Duration::from_secs(5)).await;

        let place = Place::new(5, "Moon Cafe");
        let (a, b) = tokio::join!(
            processor.process_realtime(place.clone()),
            processor.process_realtime(place.clone())
        );

        assert_eq!(crawler.calls(), 1);
        assert!(a.ready ^ b.ready, "exactly one caller gets the processed place");
        assert_eq!(processor.cache().status(5).await, Some(ProcessingStatus::Completed));

        let again = processor.process_realtime(place).await;
        assert!(again.ready);
        assert_eq!(crawler.calls(), 1);
        assert!(store.find(5).await.unwrap().unwrap().ready);
    }

    #[tokio::test]
    async fn timeout_returns_input_and_clears_entry() {
        let store = Arc::new(MemoryPlaceStore::with_places([Place::new(6, "Slow")]).await);
        let crawler = Arc::new(FakeCrawler::found(crawled_place()).with_delay(Duration::from_secs(30)));
        let processor = processor(crawler, store, Duration::from_millis(50)).await;

        let result = processor.process_realtime(Place::new(6, "Slow")).await;
        assert!(!result.ready);
        assert_eq!(processor.cache().status(6).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_caller_still_settles_the_entry() {
        let store = Arc::new(MemoryPlaceStore::with_places([Place::new(9, "Harbor")]).await);
        let crawler = Arc::new(
            FakeCrawler::found(crawled_place()).with_delay(Duration::from_millis(300)),
        );
        let processor = Arc::new(processor(crawler.clone(), store.clone(), Duration::from_secs(5)).await);

        let caller = {
            let processor = Arc::clone(&processor);
            tokio::spawn(async move { processor.process_realtime(Place::new(9, "Harbor")).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(processor.cache().status(9).await, Some(ProcessingStatus::InProgress));
        caller.abort();
        assert!(caller.await.unwrap_err().is_cancelled());

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(processor.cache().status(9).await, Some(ProcessingStatus::Completed));
        assert!(store.find(9).await.unwrap().unwrap().ready);

        let again = processor.process_realtime(Place::new(9, "Harbor")).await;
        assert!(again.ready);
        assert_eq!(crawler.calls(), 1);
    }

    #[tokio::test]
    async fn ready_place_is_returned_untouched() {
        let store = Arc::new(MemoryPlaceStore::new());
        let crawler = Arc::new(FakeCrawler::found(crawled_place()));
        let processor = processor(crawler.clone(), store, Duration::from_secs(5)).await;

        let mut ready = Place::new(7, "Done");
        ready.ready = true;
        let result = processor.process_realtime(ready.clone()).await;
        assert_eq!(result, ready);
        assert_eq!(crawler.calls(), 0);
        assert_eq!(processor.cache().len().await, 0);
    }

    #[tokio::test]
    async fn unready_result_is_cached_as_failed() {
        let store = Arc::new(MemoryPlaceStore::with_places([Place::new(8, "Gone")]).await);
        let crawler = Arc::new(FakeCrawler::not_found());
        let processor = processor(crawler, store, Duration::from_secs(5)).await;

        let input = Place::new(8, "Gone");
        let result = processor.process_realtime(input.clone()).await;
        assert_eq!(result, input);
        assert_eq!(processor.cache().status(8).await, Some(ProcessingStatus::Failed));
    }
}
