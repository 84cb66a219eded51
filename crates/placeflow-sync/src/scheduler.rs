use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use placeflow_core::Place;
use placeflow_storage::PlaceStore;
use tracing::{debug, info, warn};

use crate::lease::{LeaseManager, LeaseTransition};

pub const DEFAULT_CHUNK_SIZE: usize = 10;
pub const DEFAULT_MAX_CONSECUTIVE_SKIPS: usize = 100;

/// Pagination state of one scan, owned by the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkCursor {
    /// Last place id handed out or skipped; the next page starts after it.
    pub after_id: Option<i64>,
    pub pages_scanned: usize,
    pub consecutive_skips: usize,
    pub exhausted: bool,
}

/// A leased chunk and the places it covers.
#[derive(Debug, Clone)]
pub struct WorkUnit {
    pub job_name: String,
    pub chunk_id: String,
    pub places: Vec<Place>,
}

#[derive(Debug)]
pub enum ScanOutcome {
    Leased(WorkUnit),
    /// No unfinished places remain past the cursor.
    Exhausted,
    /// Every recent chunk was held by someone else; try again later.
    Saturated,
}

pub fn chunk_id_for(first_id: i64, last_id: i64) -> String {
    format!("record_{first_id}-{last_id}")
}

pub struct ChunkScheduler {
    leases: Arc<LeaseManager>,
    places: Arc<dyn PlaceStore>,
    job_name: String,
    chunk_size: usize,
    max_consecutive_skips: usize,
}

impl ChunkScheduler {
    pub fn new(
        leases: Arc<LeaseManager>,
        places: Arc<dyn PlaceStore>,
        job_name: impl Into<String>,
    ) -> Self {
        Self {
            leases,
            places,
            job_name: job_name.into(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_consecutive_skips: DEFAULT_MAX_CONSECUTIVE_SKIPS,
        }
    }

    pub fn with_limits(mut self, chunk_size: usize, max_consecutive_skips: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self.max_consecutive_skips = max_consecutive_skips.max(1);
        self
    }

    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    /// Advance `cursor` until a chunk is leased, the table runs out, or too many
    /// chunks in a row are held by other workers.
    pub async fn next_unit(&self, cursor: &mut ChunkCursor) -> Result<ScanOutcome> {
        if cursor.exhausted {
            return Ok(ScanOutcome::Exhausted);
        }

        loop {
            self.leases.reap_expired(&self.job_name, Utc::now()).await?;

            let ids = self
                .places
                .unfinished_ids_after(cursor.after_id, self.chunk_size)
                .await
                .context("scanning unfinished places")?;
            cursor.pages_scanned += 1;

            let (Some(&first), Some(&last)) = (ids.first(), ids.last()) else {
                cursor.exhausted = true;
                info!(job = %self.job_name, pages = cursor.pages_scanned, "no unfinished places left");
                return Ok(ScanOutcome::Exhausted);
            };
            cursor.after_id = Some(last);
            let chunk_id = chunk_id_for(first, last);

            if self
                .leases
                .acquire(&self.job_name, &chunk_id, self.leases.lease_duration())
                .await?
            {
                let places = match self.places.load_many(&ids).await {
                    Ok(places) => places,
                    Err(err) => {
                        let message = format!("loading places failed: {err}");
                        self.leases
                            .mark_failed(&self.job_name, &chunk_id, &message)
                            .await?;
                        return Err(
                            anyhow::Error::new(err).context(format!("loading places for {chunk_id}"))
                        );
                    }
                };
                match self.leases.mark_processing(&self.job_name, &chunk_id).await? {
                    LeaseTransition::Applied => {
                        cursor.consecutive_skips = 0;
                        return Ok(ScanOutcome::Leased(WorkUnit {
                            job_name: self.job_name.clone(),
                            chunk_id,
                            places,
                        }));
                    }
                    LeaseTransition::LeaseLost => {}
                }
            }

            cursor.consecutive_skips += 1;
            debug!(
                job = %self.job_name,
                chunk = %chunk_id,
                consecutive_skips = cursor.consecutive_skips,
                "chunk held by another worker or lost before start; skipping"
            );
            if cursor.consecutive_skips >= self.max_consecutive_skips {
                warn!(
                    job = %self.job_name,
                    consecutive_skips = cursor.consecutive_skips,
                    "giving up scan; every recent chunk is leased elsewhere"
                );
                return Ok(ScanOutcome::Saturated);
            }
        }
    }
}
