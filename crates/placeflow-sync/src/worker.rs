use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::lease::LeaseManager;
use crate::pipeline::PlacePipeline;
use crate::scheduler::{ChunkCursor, ChunkScheduler, ScanOutcome, WorkUnit};

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct UnitTally {
    pub ready: usize,
    pub skipped: usize,
    pub terminal: usize,
    pub retryable: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchRunSummary {
    pub run_id: Uuid,
    pub worker_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub units_completed: usize,
    pub units_failed: usize,
    pub places: UnitTally,
    /// The scan stopped because every recent chunk was held by other workers.
    pub saturated: bool,
}

const MIN_HEARTBEAT: Duration = Duration::from_millis(10);

/// Renews this worker's leases on an interval until dropped.
struct Heartbeat {
    handle: JoinHandle<()>,
}

impl Heartbeat {
    fn start(
        leases: Arc<LeaseManager>,
        job: String,
        interval: Duration,
        extension: chrono::Duration,
    ) -> Self {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(MIN_HEARTBEAT));
            // first tick fires immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(err) = leases.renew(&job, extension).await {
                    warn!(job = %job, error = %err, "lease heartbeat failed");
                }
            }
        });
        Self { handle }
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Drains unfinished places chunk by chunk under the distributed lease lock.
pub struct BatchWorker {
    config: PipelineConfig,
    leases: Arc<LeaseManager>,
    scheduler: ChunkScheduler,
    pipeline: Arc<PlacePipeline>,
}

impl BatchWorker {
    pub fn new(
        config: PipelineConfig,
        leases: Arc<LeaseManager>,
        scheduler: ChunkScheduler,
        pipeline: Arc<PlacePipeline>,
    ) -> Self {
        Self {
            config,
            leases,
            scheduler,
            pipeline,
        }
    }

    pub fn leases(&self) -> &Arc<LeaseManager> {
        &self.leases
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub async fn run_once(&self) -> Result<BatchRunSummary> {
        let run_id = Uuid::new_v4();
        let worker_id = self.leases.identity().worker_id.clone();
        let span = info_span!("batch_run", %run_id, worker = %worker_id, job = %self.config.job_name);

        async {
            let started_at = Utc::now();
            let mut summary = BatchRunSummary {
                run_id,
                worker_id: worker_id.clone(),
                started_at,
                finished_at: started_at,
                units_completed: 0,
                units_failed: 0,
                places: UnitTally::default(),
                saturated: false,
            };

            let mut cursor = ChunkCursor::default();
            loop {
                match self.scheduler.next_unit(&mut cursor).await? {
                    ScanOutcome::Leased(unit) => {
                        let tally = self.process_unit(&unit).await?;
                        if tally.retryable == 0 {
                            summary.units_completed += 1;
                        } else {
                            summary.units_failed += 1;
                        }
                        summary.places.ready += tally.ready;
                        summary.places.skipped += tally.skipped;
                        summary.places.terminal += tally.terminal;
                        summary.places.retryable += tally.retryable;
                    }
                    ScanOutcome::Exhausted => break,
                    ScanOutcome::Saturated => {
                        summary.saturated = true;
                        break;
                    }
                }
            }

            summary.finished_at = Utc::now();
            info!(
                units_completed = summary.units_completed,
                units_failed = summary.units_failed,
                ready = summary.places.ready,
                retryable = summary.places.retryable,
                saturated = summary.saturated,
                pages = cursor.pages_scanned,
                "batch run finished"
            );
            Ok::<_, anyhow::Error>(summary)
        }
        .instrument(span)
        .await
    }

    /// Run every place of a leased unit, then complete or fail the lease.
    pub async fn process_unit(&self, unit: &WorkUnit) -> Result<UnitTally> {
        let span = info_span!("work_unit", chunk = %unit.chunk_id, places = unit.places.len());
        async {
            let _heartbeat = Heartbeat::start(
                Arc::clone(&self.leases),
                unit.job_name.clone(),
                self.config.heartbeat_interval,
                self.leases.lease_duration(),
            );

            let mut tally = UnitTally::default();
            let mut first_error: Option<String> = None;
            for place in &unit.places {
                let report = self.pipeline.run(place.clone()).await;
                if report.is_ready() {
                    tally.ready += 1;
                } else if report.needs_retry() {
                    tally.retryable += 1;
                    if first_error.is_none() {
                        first_error = report
                            .outcome
                            .failure()
                            .map(|f| format!("place {}: {f}", place.id));
                    }
                } else if report.outcome.failure().is_some() {
                    tally.terminal += 1;
                } else {
                    tally.skipped += 1;
                }
            }

            match first_error {
                None => {
                    self.leases
                        .mark_completed(&unit.job_name, &unit.chunk_id)
                        .await?;
                }
                Some(first) => {
                    let message = format!(
                        "{} of {} places need a retry; first: {first}",
                        tally.retryable,
                        unit.places.len()
                    );
                    self.leases
                        .mark_failed(&unit.job_name, &unit.chunk_id, &message)
                        .await?;
                }
            }
            info!(
                ready = tally.ready,
                skipped = tally.skipped,
                terminal = tally.terminal,
                retryable = tally.retryable,
                "work unit finished"
            );
            Ok::<_, anyhow::Error>(tally)
        }
        .instrument(span)
        .await
    }

    pub async fn reap(&self) -> Result<u64> {
        self.leases
            .reap_expired(&self.config.job_name, Utc::now())
            .await
    }

    /// Delete completed and stale failed leases past the retention window.
    pub async fn cleanup(&self) -> Result<u64> {
        let job = &self.config.job_name;
        let completed = self
            .leases
            .cleanup_completed(job, self.config.lease_retention)
            .await?;
        let failed = self
            .leases
            .prune_failed(job, self.config.lease_retention)
            .await?;
        Ok(completed + failed)
    }

    /// Cron-driven batch and cleanup jobs, when the scheduler is enabled.
    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;

        let worker = Arc::clone(self);
        let batch = Job::new_async(self.config.batch_cron.as_str(), move |_uuid, _l| {
            let worker = Arc::clone(&worker);
            Box::pin(async move {
                match worker.run_once().await {
                    Ok(summary) => info!(
                        run_id = %summary.run_id,
                        ready = summary.places.ready,
                        "scheduled batch run finished"
                    ),
                    Err(err) => error!(error = %err, "scheduled batch run failed"),
                }
            })
        })
        .with_context(|| format!("creating batch job for cron {}", self.config.batch_cron))?;
        sched.add(batch).await.context("adding batch job")?;

        let worker = Arc::clone(self);
        let cleanup = Job::new_async(self.config.cleanup_cron.as_str(), move |_uuid, _l| {
            let worker = Arc::clone(&worker);
            Box::pin(async move {
                if let Err(err) = worker.cleanup().await {
                    error!(error = %err, "scheduled lease cleanup failed");
                }
            })
        })
        .with_context(|| format!("creating cleanup job for cron {}", self.config.cleanup_cron))?;
        sched.add(cleanup).await.context("adding cleanup job")?;

        Ok(Some(sched))
    }
}
