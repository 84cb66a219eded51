use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use placeflow_core::{
    BusinessHours, ChunkLease, CrawlState, KeywordEmbedding, LeaseStatus, Place, PlaceDescription,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::debug;

use crate::{AcquireRequest, LeaseStore, PlaceStore, StoreError, StoreResult, LEASE_EXPIRED_ERROR};

const LEASE_COLUMNS: &str = "job_name, chunk_id, owner_id, owner_host, status, acquired_at, \
     started_at, completed_at, expires_at, retry_count, max_retries, last_error";

pub async fn connect_pool(database_url: &str, max_connections: u32) -> StoreResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections.max(1))
        .connect(database_url)
        .await?;
    Ok(pool)
}

pub async fn run_migrations(pool: &PgPool) -> StoreResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

fn lease_from_row(row: &PgRow) -> StoreResult<ChunkLease> {
    let status: String = row.try_get("status")?;
    let status = LeaseStatus::parse(&status)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown lease status {status}")))?;
    Ok(ChunkLease {
        job_name: row.try_get("job_name")?,
        chunk_id: row.try_get("chunk_id")?,
        owner_id: row.try_get("owner_id")?,
        owner_host: row.try_get("owner_host")?,
        status,
        acquired_at: row.try_get("acquired_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        expires_at: row.try_get("expires_at")?,
        retry_count: row.try_get("retry_count")?,
        max_retries: row.try_get("max_retries")?,
        last_error: row.try_get("last_error")?,
    })
}

#[derive(Debug, Clone)]
pub struct PgLeaseStore {
    pool: PgPool,
}

impl PgLeaseStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LeaseStore for PgLeaseStore {
    async fn try_acquire(&self, request: AcquireRequest<'_>) -> StoreResult<bool> {
        // ON CONFLICT ... DO UPDATE ... WHERE row-locks the existing lease, so
        // two workers can never both see rows_affected = 1.
        let result = sqlx::query(
            r#"
            INSERT INTO chunk_leases
                (job_name, chunk_id, owner_id, owner_host, status,
                 acquired_at, expires_at, retry_count, max_retries, created_at, updated_at)
            VALUES ($1, $2, $3, $4, 'LEASED', $5, $6, 0, $7, $5, $5)
            ON CONFLICT (job_name, chunk_id) DO UPDATE
               SET owner_id = EXCLUDED.owner_id,
                   owner_host = EXCLUDED.owner_host,
                   status = 'LEASED',
                   acquired_at = EXCLUDED.acquired_at,
                   started_at = NULL,
                   completed_at = NULL,
                   expires_at = EXCLUDED.expires_at,
                   updated_at = EXCLUDED.updated_at
             WHERE chunk_leases.retry_count < chunk_leases.max_retries
               AND (chunk_leases.status = 'FAILED'
                    OR (chunk_leases.status IN ('LEASED', 'PROCESSING')
                        AND chunk_leases.expires_at < EXCLUDED.acquired_at))
            "#,
        )
        .bind(request.job_name)
        .bind(request.chunk_id)
        .bind(request.owner_id)
        .bind(request.owner_host)
        .bind(request.now)
        .bind(request.expires_at)
        .bind(request.max_retries)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn renew(
        &self,
        job_name: &str,
        owner_id: &str,
        new_expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE chunk_leases
               SET expires_at = $3,
                   updated_at = $4
             WHERE job_name = $1
               AND owner_id = $2
               AND status IN ('LEASED', 'PROCESSING')
            "#,
        )
        .bind(job_name)
        .bind(owner_id)
        .bind(new_expires_at)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn mark_processing(
        &self,
        job_name: &str,
        chunk_id: &str,
        owner_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE chunk_leases
               SET status = 'PROCESSING',
                   started_at = $4,
                   updated_at = $4
             WHERE job_name = $1
               AND chunk_id = $2
               AND owner_id = $3
               AND status = 'LEASED'
            "#,
        )
        .bind(job_name)
        .bind(chunk_id)
        .bind(owner_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_completed(
        &self,
        job_name: &str,
        chunk_id: &str,
        owner_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE chunk_leases
               SET status = 'COMPLETED',
                   completed_at = $4,
                   updated_at = $4
             WHERE job_name = $1
               AND chunk_id = $2
               AND owner_id = $3
               AND status IN ('LEASED', 'PROCESSING')
            "#,
        )
        .bind(job_name)
        .bind(chunk_id)
        .bind(owner_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_failed(
        &self,
        job_name: &str,
        chunk_id: &str,
        owner_id: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<ChunkLease>> {
        let sql = format!(
            r#"
            UPDATE chunk_leases
               SET status = 'FAILED',
                   last_error = $4,
                   retry_count = retry_count + 1,
                   updated_at = $5
             WHERE job_name = $1
               AND chunk_id = $2
               AND owner_id = $3
               AND status IN ('LEASED', 'PROCESSING')
            RETURNING {LEASE_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(job_name)
            .bind(chunk_id)
            .bind(owner_id)
            .bind(error)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(lease_from_row).transpose()
    }

    async fn fail_expired(&self, job_name: &str, now: DateTime<Utc>) -> StoreResult<Vec<ChunkLease>> {
        let sql = format!(
            r#"
            UPDATE chunk_leases
               SET status = 'FAILED',
                   last_error = $3,
                   retry_count = retry_count + 1,
                   updated_at = $2
             WHERE job_name = $1
               AND status IN ('LEASED', 'PROCESSING')
               AND expires_at < $2
            RETURNING {LEASE_COLUMNS}
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(job_name)
            .bind(now)
            .bind(LEASE_EXPIRED_ERROR)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(lease_from_row).collect()
    }

    async fn delete_completed_before(
        &self,
        job_name: &str,
        before: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM chunk_leases
             WHERE job_name = $1
               AND status = 'COMPLETED'
               AND completed_at < $2
            "#,
        )
        .bind(job_name)
        .bind(before)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn delete_failed_before(
        &self,
        job_name: &str,
        before: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM chunk_leases
             WHERE job_name = $1
               AND status = 'FAILED'
               AND expires_at < $2
            "#,
        )
        .bind(job_name)
        .bind(before)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn find(&self, job_name: &str, chunk_id: &str) -> StoreResult<Option<ChunkLease>> {
        let sql = format!(
            "SELECT {LEASE_COLUMNS} FROM chunk_leases WHERE job_name = $1 AND chunk_id = $2"
        );
        let row = sqlx::query(&sql)
            .bind(job_name)
            .bind(chunk_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(lease_from_row).transpose()
    }

    async fn list_for_job(&self, job_name: &str) -> StoreResult<Vec<ChunkLease>> {
        let sql = format!(
            "SELECT {LEASE_COLUMNS} FROM chunk_leases WHERE job_name = $1 ORDER BY chunk_id"
        );
        let rows = sqlx::query(&sql).bind(job_name).fetch_all(&self.pool).await?;
        rows.iter().map(lease_from_row).collect()
    }

    async fn list_for_owner(&self, owner_id: &str) -> StoreResult<Vec<ChunkLease>> {
        let sql = format!(
            "SELECT {LEASE_COLUMNS} FROM chunk_leases WHERE owner_id = $1 ORDER BY job_name, chunk_id"
        );
        let rows = sqlx::query(&sql).bind(owner_id).fetch_all(&self.pool).await?;
        rows.iter().map(lease_from_row).collect()
    }

    async fn retryable_chunks(
        &self,
        job_name: &str,
        now: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<String>> {
        let rows = sqlx::query(
            r#"
            SELECT chunk_id
              FROM chunk_leases
             WHERE job_name = $1
               AND retry_count < max_retries
               AND (status = 'FAILED'
                    OR (status IN ('LEASED', 'PROCESSING') AND expires_at < $2))
             ORDER BY chunk_id
             LIMIT $3
            "#,
        )
        .bind(job_name)
        .bind(now)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| row.try_get("chunk_id").map_err(StoreError::from))
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct PgPlaceStore {
    pool: PgPool,
}

impl PgPlaceStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn load_embeddings(&self, ids: &[i64]) -> StoreResult<HashMap<i64, Vec<KeywordEmbedding>>> {
        let rows = sqlx::query(
            r#"
            SELECT place_id, keyword, embedding
              FROM place_keyword_embeddings
             WHERE place_id = ANY($1)
             ORDER BY place_id, position
            "#,
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;

        let mut out: HashMap<i64, Vec<KeywordEmbedding>> = HashMap::new();
        for row in rows {
            let place_id: i64 = row.try_get("place_id")?;
            out.entry(place_id).or_default().push(KeywordEmbedding {
                keyword: row.try_get("keyword")?,
                vector: row.try_get("embedding")?,
            });
        }
        Ok(out)
    }
}

fn place_from_row(row: &PgRow) -> StoreResult<Place> {
    let crawl_state: String = row.try_get("crawl_state")?;
    let crawl_state = CrawlState::parse(&crawl_state)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown crawl state {crawl_state}")))?;
    let business_hours: Option<Json<BusinessHours>> = row.try_get("business_hours")?;
    let sns_urls: Json<BTreeMap<String, String>> = row.try_get("sns_urls")?;
    let has_description: bool = row.try_get("has_description")?;
    let description = if has_description {
        Some(PlaceDescription {
            original_description: row.try_get("original_description")?,
            ai_summary: row.try_get("ai_summary")?,
            generated: row.try_get("generated")?,
            search_query: row.try_get("search_query")?,
        })
    } else {
        None
    };

    Ok(Place {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        road_address: row.try_get("road_address")?,
        category: row.try_get("category")?,
        crawl_state,
        ready: row.try_get("ready")?,
        review_count: row.try_get("review_count")?,
        parking_available: row.try_get("parking_available")?,
        pet_friendly: row.try_get("pet_friendly")?,
        business_hours: business_hours.map(|Json(h)| h),
        sns_urls: sns_urls.0,
        image_urls: row.try_get("image_urls")?,
        reviews: row.try_get("reviews")?,
        description,
        keywords: row.try_get("keywords")?,
        embeddings: Vec::new(),
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl PlaceStore for PgPlaceStore {
    async fn unfinished_ids_after(&self, after_id: Option<i64>, limit: usize) -> StoreResult<Vec<i64>> {
        let rows = sqlx::query(
            r#"
            SELECT id
              FROM places
             WHERE ready = FALSE
               AND crawl_state <> 'NOT_FOUND'
               AND id > $1
             ORDER BY id ASC
             LIMIT $2
            "#,
        )
        .bind(after_id.unwrap_or(i64::MIN))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| row.try_get("id").map_err(StoreError::from))
            .collect()
    }

    async fn load_many(&self, ids: &[i64]) -> StoreResult<Vec<Place>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            r#"
            SELECT p.id, p.name, p.road_address, p.category, p.crawl_state, p.ready,
                   p.review_count, p.parking_available, p.pet_friendly, p.business_hours,
                   p.sns_urls, p.image_urls, p.reviews, p.keywords, p.updated_at,
                   (d.place_id IS NOT NULL) AS has_description,
                   d.original_description, d.ai_summary, d.generated, d.search_query
              FROM places p
              LEFT JOIN place_descriptions d ON d.place_id = p.id
             WHERE p.id = ANY($1)
             ORDER BY p.id ASC
            "#,
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;

        let mut embeddings = self.load_embeddings(ids).await?;
        let mut places = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut place = place_from_row(row)?;
            place.embeddings = embeddings.remove(&place.id).unwrap_or_default();
            places.push(place);
        }
        debug!(requested = ids.len(), loaded = places.len(), "loaded places");
        Ok(places)
    }

    async fn find(&self, id: i64) -> StoreResult<Option<Place>> {
        Ok(self.load_many(&[id]).await?.into_iter().next())
    }

    async fn save(&self, place: &Place) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO places
                (id, name, road_address, category, crawl_state, ready, review_count,
                 parking_available, pet_friendly, business_hours, sns_urls, image_urls,
                 reviews, keywords, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (id) DO UPDATE
               SET name = EXCLUDED.name,
                   road_address = EXCLUDED.road_address,
                   category = EXCLUDED.category,
                   crawl_state = EXCLUDED.crawl_state,
                   ready = EXCLUDED.ready,
                   review_count = EXCLUDED.review_count,
                   parking_available = EXCLUDED.parking_available,
                   pet_friendly = EXCLUDED.pet_friendly,
                   business_hours = EXCLUDED.business_hours,
                   sns_urls = EXCLUDED.sns_urls,
                   image_urls = EXCLUDED.image_urls,
                   reviews = EXCLUDED.reviews,
                   keywords = EXCLUDED.keywords,
                   updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(place.id)
        .bind(&place.name)
        .bind(&place.road_address)
        .bind(&place.category)
        .bind(place.crawl_state.as_str())
        .bind(place.ready)
        .bind(place.review_count)
        .bind(place.parking_available)
        .bind(place.pet_friendly)
        .bind(place.business_hours.as_ref().map(Json))
        .bind(Json(&place.sns_urls))
        .bind(&place.image_urls)
        .bind(&place.reviews)
        .bind(&place.keywords)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        match &place.description {
            Some(description) => {
                sqlx::query(
                    r#"
                    INSERT INTO place_descriptions
                        (place_id, original_description, ai_summary, generated, search_query, updated_at)
                    VALUES ($1, $2, $3, $4, $5, $6)
                    ON CONFLICT (place_id) DO UPDATE
                       SET original_description = EXCLUDED.original_description,
                           ai_summary = EXCLUDED.ai_summary,
                           generated = EXCLUDED.generated,
                           search_query = EXCLUDED.search_query,
                           updated_at = EXCLUDED.updated_at
                    "#,
                )
                .bind(place.id)
                .bind(&description.original_description)
                .bind(&description.ai_summary)
                .bind(&description.generated)
                .bind(&description.search_query)
                .bind(now)
                .execute(&mut *tx)
                .await?;
            }
            None => {
                sqlx::query("DELETE FROM place_descriptions WHERE place_id = $1")
                    .bind(place.id)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        sqlx::query("DELETE FROM place_keyword_embeddings WHERE place_id = $1")
            .bind(place.id)
            .execute(&mut *tx)
            .await?;
        for (position, embedding) in place.embeddings.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO place_keyword_embeddings (place_id, position, keyword, embedding)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(place.id)
            .bind(i32::try_from(position).unwrap_or(i32::MAX))
            .bind(&embedding.keyword)
            .bind(&embedding.vector)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(
            place_id = place.id,
            crawl_state = %place.crawl_state,
            ready = place.ready,
            embeddings = place.embeddings.len(),
            "saved place"
        );
        Ok(())
    }
}
