//! Postgres-backed [`FeedStore`] (SPEC_FULL §4.1/§6).
//!
//! Runtime-built `sqlx::query`/`query_as` calls rather than the
//! compile-time `query!` macro — there is no live database to validate
//! against at build time, the same tradeoff the teacher's own SQL
//! repository left as a stub rather than guess at.

use std::collections::HashMap;

use rust_decimal::Decimal;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::errors::StoreError;
use crate::models::{
    AlertJob, CachedPrice, ChangeDetectionMemo, Compression, Feed, FeedConnection, FeedRun,
    FeedStatus, IdType, IngestJob, LinkStatus, MatchType, PriceType, ProductLink,
    QuarantinedRecord, ResolverJob, ResolverReason, RunCounters, RunStatus, RunTrigger, Transport,
};
use crate::store::{FeedStore, PriceInsert, ProductUpsert, StoreResult, UpsertedProduct};

pub struct PgFeedStore {
    pool: PgPool,
}

impl PgFeedStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn db_err(e: sqlx::Error) -> StoreError {
    StoreError::Sqlx(e)
}

fn transport_from_str(s: &str) -> Transport {
    match s {
        "PLAIN_FTP" => Transport::PlainFtp,
        _ => Transport::Sftp,
    }
}

fn compression_from_str(s: &str) -> Compression {
    match s {
        "GZIP" => Compression::Gzip,
        _ => Compression::None,
    }
}

fn status_from_str(s: &str) -> FeedStatus {
    match s {
        "ENABLED" => FeedStatus::Enabled,
        "DISABLED" => FeedStatus::Disabled,
        "PAUSED" => FeedStatus::Paused,
        _ => FeedStatus::Draft,
    }
}

fn id_type_from_str(s: &str) -> IdType {
    match s {
        "SKU" => IdType::Sku,
        "UPC" => IdType::Upc,
        "URL" => IdType::Url,
        "URL_HASH" => IdType::UrlHash,
        _ => IdType::NetworkItemId,
    }
}

fn id_type_to_str(t: IdType) -> &'static str {
    match t {
        IdType::NetworkItemId => "NETWORK_ITEM_ID",
        IdType::Sku => "SKU",
        IdType::Upc => "UPC",
        IdType::UrlHash => "URL_HASH",
        IdType::Url => "URL",
    }
}

fn row_to_feed(row: &sqlx::postgres::PgRow) -> Result<Feed, sqlx::Error> {
    Ok(Feed {
        id: row.try_get("id")?,
        source_id: row.try_get("source_id")?,
        retailer_id: row.try_get("retailer_id")?,
        status: status_from_str(row.try_get::<String, _>("status")?.as_str()),
        connection: FeedConnection {
            transport: transport_from_str(row.try_get::<String, _>("transport")?.as_str()),
            host: row.try_get("host")?,
            port: row.try_get::<i32, _>("port")? as u16,
            path: row.try_get("path")?,
            username: row.try_get("username")?,
            password_ciphertext: row.try_get("password_ciphertext")?,
        },
        compression: compression_from_str(row.try_get::<String, _>("compression")?.as_str()),
        expiry_hours: row.try_get("expiry_hours")?,
        schedule_frequency_hours: row.try_get("schedule_frequency_hours")?,
        max_row_count: row.try_get::<i32, _>("max_row_count")? as usize,
        max_file_size_bytes: row.try_get::<i64, _>("max_file_size_bytes")? as u64,
        feed_lock_id: row.try_get("feed_lock_id")?,
        change_detection: ChangeDetectionMemo {
            last_remote_mtime: row.try_get("last_remote_mtime")?,
            last_remote_size: row.try_get("last_remote_size")?,
            last_content_hash: row.try_get("last_content_hash")?,
        },
        consecutive_failures: row.try_get::<i32, _>("consecutive_failures")? as u32,
        manual_run_pending: row.try_get("manual_run_pending")?,
        last_run_at: row.try_get("last_run_at")?,
        next_run_at: row.try_get("next_run_at")?,
    })
}

const FEED_COLUMNS: &str = "id, source_id, retailer_id, status, transport, host, port, path, \
    username, password_ciphertext, compression, expiry_hours, schedule_frequency_hours, \
    max_row_count, max_file_size_bytes, feed_lock_id, last_remote_mtime, last_remote_size, \
    last_content_hash, consecutive_failures, manual_run_pending, last_run_at, next_run_at";

fn row_to_run(row: &sqlx::postgres::PgRow) -> Result<FeedRun, sqlx::Error> {
    Ok(FeedRun {
        id: row.try_get("id")?,
        feed_id: row.try_get("feed_id")?,
        source_id: row.try_get("source_id")?,
        trigger: match row.try_get::<String, _>("trigger")?.as_str() {
            "MANUAL" => RunTrigger::Manual,
            "MANUAL_PENDING" => RunTrigger::ManualPending,
            "ADMIN_TEST" => RunTrigger::AdminTest,
            "RETRY" => RunTrigger::Retry,
            _ => RunTrigger::Scheduled,
        },
        status: match row.try_get::<String, _>("status")?.as_str() {
            "SUCCEEDED" => RunStatus::Succeeded,
            "FAILED" => RunStatus::Failed,
            _ => RunStatus::Running,
        },
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        duration_ms: row.try_get("duration_ms")?,
        counters: RunCounters {
            rows_read: row.try_get::<i64, _>("rows_read")? as u64,
            rows_parsed: row.try_get::<i64, _>("rows_parsed")? as u64,
            products_upserted: row.try_get::<i64, _>("products_upserted")? as u64,
            prices_written: row.try_get::<i64, _>("prices_written")? as u64,
            products_promoted: row.try_get::<i64, _>("products_promoted")? as u64,
            products_rejected: row.try_get::<i64, _>("products_rejected")? as u64,
            duplicate_key_count: row.try_get::<i64, _>("duplicate_key_count")? as u64,
            url_hash_fallback_count: row.try_get::<i64, _>("url_hash_fallback_count")? as u64,
            error_count: row.try_get::<i64, _>("error_count")? as u64,
        },
        breaker: crate::models::CircuitBreakerMetrics {
            active_count_before: row.try_get("active_count_before")?,
            seen_success_count: row.try_get("seen_success_count")?,
            would_expire_count: row.try_get("would_expire_count")?,
            expiry_blocked: row.try_get("expiry_blocked")?,
            expiry_blocked_reason: row.try_get("expiry_blocked_reason")?,
        },
        skipped_reason: row
            .try_get::<Option<String>, _>("skipped_reason")?
            .map(|s| match s.as_str() {
                "UNCHANGED_HASH" => crate::models::SkippedReason::UnchangedHash,
                "FILE_NOT_FOUND" => crate::models::SkippedReason::FileNotFound,
                _ => crate::models::SkippedReason::UnchangedMtime,
            }),
        failure_kind: row
            .try_get::<Option<String>, _>("failure_kind")?
            .map(|s| match s.as_str() {
                "PERMANENT" => crate::errors::FailureKind::Permanent,
                "CONFIG" => crate::errors::FailureKind::Config,
                _ => crate::errors::FailureKind::Transient,
            }),
        failure_code: row.try_get("failure_code")?,
        failure_message: row.try_get("failure_message")?,
        correlation_id: row.try_get("correlation_id")?,
    })
}

const RUN_COLUMNS: &str = "id, feed_id, source_id, trigger, status, started_at, finished_at, \
    duration_ms, rows_read, rows_parsed, products_upserted, prices_written, products_promoted, \
    products_rejected, duplicate_key_count, url_hash_fallback_count, error_count, \
    active_count_before, seen_success_count, would_expire_count, expiry_blocked, \
    expiry_blocked_reason, skipped_reason, failure_kind, failure_code, failure_message, \
    correlation_id";

#[async_trait]
impl FeedStore for PgFeedStore {
    async fn get_feed(&self, feed_id: Uuid) -> StoreResult<Option<Feed>> {
        let row = sqlx::query(&format!("SELECT {FEED_COLUMNS} FROM feed WHERE id = $1"))
            .bind(feed_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(row_to_feed).transpose().map_err(db_err)
    }

    async fn due_feeds(&self, now: DateTime<Utc>) -> StoreResult<Vec<Feed>> {
        let rows = sqlx::query(&format!(
            "SELECT {FEED_COLUMNS} FROM feed WHERE status = 'ENABLED' \
             AND (next_run_at IS NULL OR next_run_at <= $1)"
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(row_to_feed).collect::<Result<_, _>>().map_err(db_err)
    }

    async fn create_run(&self, run: &FeedRun) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO feed_run (id, feed_id, source_id, trigger, status, started_at, \
             correlation_id, rows_read, rows_parsed, products_upserted, prices_written, \
             products_promoted, products_rejected, duplicate_key_count, \
             url_hash_fallback_count, error_count, active_count_before, seen_success_count, \
             would_expire_count, expiry_blocked) \
             VALUES ($1, $2, $3, $4, 'RUNNING', $5, $6, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, false)",
        )
        .bind(run.id)
        .bind(run.feed_id)
        .bind(run.source_id)
        .bind(trigger_to_str(run.trigger))
        .bind(run.started_at)
        .bind(run.correlation_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn load_run(&self, run_id: Uuid) -> StoreResult<Option<FeedRun>> {
        let row = sqlx::query(&format!("SELECT {RUN_COLUMNS} FROM feed_run WHERE id = $1"))
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(row_to_run).transpose().map_err(db_err)
    }

    async fn finalize_run(&self, run: &FeedRun) -> StoreResult<()> {
        sqlx::query(
            "UPDATE feed_run SET status = $2, finished_at = $3, duration_ms = $4, \
             rows_read = $5, rows_parsed = $6, products_upserted = $7, prices_written = $8, \
             products_promoted = $9, products_rejected = $10, duplicate_key_count = $11, \
             url_hash_fallback_count = $12, error_count = $13, active_count_before = $14, \
             seen_success_count = $15, would_expire_count = $16, expiry_blocked = $17, \
             expiry_blocked_reason = $18, skipped_reason = $19, failure_kind = $20, \
             failure_code = $21, failure_message = $22 \
             WHERE id = $1",
        )
        .bind(run.id)
        .bind(run_status_to_str(run.status))
        .bind(run.finished_at)
        .bind(run.duration_ms)
        .bind(run.counters.rows_read as i64)
        .bind(run.counters.rows_parsed as i64)
        .bind(run.counters.products_upserted as i64)
        .bind(run.counters.prices_written as i64)
        .bind(run.counters.products_promoted as i64)
        .bind(run.counters.products_rejected as i64)
        .bind(run.counters.duplicate_key_count as i64)
        .bind(run.counters.url_hash_fallback_count as i64)
        .bind(run.counters.error_count as i64)
        .bind(run.breaker.active_count_before)
        .bind(run.breaker.seen_success_count)
        .bind(run.breaker.would_expire_count)
        .bind(run.breaker.expiry_blocked)
        .bind(&run.breaker.expiry_blocked_reason)
        .bind(run.skipped_reason.map(skipped_reason_to_str))
        .bind(run.failure_kind.map(failure_kind_to_str))
        .bind(&run.failure_code)
        .bind(&run.failure_message)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn clear_manual_run_pending(&self, feed_id: Uuid) -> StoreResult<()> {
        sqlx::query("UPDATE feed SET manual_run_pending = false WHERE id = $1")
            .bind(feed_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn set_manual_run_pending(&self, feed_id: Uuid) -> StoreResult<()> {
        sqlx::query("UPDATE feed SET manual_run_pending = true WHERE id = $1")
            .bind(feed_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn reset_failures_and_reschedule(
        &self,
        feed_id: Uuid,
        next_run_at: DateTime<Utc>,
        change_detection: Option<ChangeDetectionMemo>,
    ) -> StoreResult<()> {
        if let Some(memo) = change_detection {
            sqlx::query(
                "UPDATE feed SET consecutive_failures = 0, last_run_at = now(), \
                 next_run_at = $2, last_remote_mtime = $3, last_remote_size = $4, \
                 last_content_hash = $5 WHERE id = $1",
            )
            .bind(feed_id)
            .bind(next_run_at)
            .bind(memo.last_remote_mtime)
            .bind(memo.last_remote_size)
            .bind(memo.last_content_hash)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        } else {
            sqlx::query(
                "UPDATE feed SET consecutive_failures = 0, last_run_at = now(), \
                 next_run_at = $2 WHERE id = $1",
            )
            .bind(feed_id)
            .bind(next_run_at)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        }
        Ok(())
    }

    async fn record_failure(
        &self,
        feed_id: Uuid,
        consecutive_failures: u32,
        auto_disable: bool,
    ) -> StoreResult<()> {
        if auto_disable {
            sqlx::query(
                "UPDATE feed SET consecutive_failures = $2, status = 'DISABLED', \
                 next_run_at = NULL, last_run_at = now() WHERE id = $1",
            )
            .bind(feed_id)
            .bind(consecutive_failures as i32)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        } else {
            sqlx::query(
                "UPDATE feed SET consecutive_failures = $2, last_run_at = now() WHERE id = $1",
            )
            .bind(feed_id)
            .bind(consecutive_failures as i32)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        }
        Ok(())
    }

    async fn enqueue_ingest_job(&self, job: &IngestJob) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO affiliate_feed_job (feed_id, trigger, run_id, feed_lock_id, claimed) \
             VALUES ($1, $2, $3, $4, false)",
        )
        .bind(job.feed_id)
        .bind(trigger_to_str(job.trigger))
        .bind(job.run_id)
        .bind(job.feed_lock_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn circuit_breaker_counts(
        &self,
        source_id: Uuid,
        run_id: Uuid,
        expiry_threshold: DateTime<Utc>,
    ) -> StoreResult<crate::store::CircuitBreakerCounts> {
        let row = sqlx::query(
            "SELECT \
                COUNT(*) AS active_count, \
                COUNT(*) FILTER (WHERE sps.source_product_id IS NOT NULL) AS seen_success_count \
             FROM source_product sp \
             JOIN source_product_presence spp ON spp.source_product_id = sp.id \
             LEFT JOIN source_product_seen sps \
                ON sps.source_product_id = sp.id AND sps.run_id = $3 \
             WHERE sp.source_id = $1 \
               AND spp.last_seen_success_at IS NOT NULL \
               AND spp.last_seen_success_at >= $2",
        )
        .bind(source_id)
        .bind(expiry_threshold)
        .bind(run_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        let active_count: i64 = row.try_get("active_count").map_err(db_err)?;
        let seen_success_count: i64 = row.try_get("seen_success_count").map_err(db_err)?;
        Ok(crate::store::CircuitBreakerCounts {
            active_count_before: active_count as u64,
            seen_success_count: seen_success_count as u64,
        })
    }

    async fn upsert_products(
        &self,
        run_id: Uuid,
        products: &[ProductUpsert],
    ) -> StoreResult<Vec<UpsertedProduct>> {
        if products.is_empty() {
            return Ok(vec![]);
        }

        // Single batch query: find every existing SourceProduct whose
        // SourceProductIdentifier table already contains any of this
        // chunk's candidate identifier tuples (SPEC_FULL §4.6.2 step 2).
        let mut tuple_row: Vec<i32> = Vec::new();
        let mut tuple_type: Vec<&'static str> = Vec::new();
        let mut tuple_value: Vec<String> = Vec::new();
        let mut tuple_ns: Vec<String> = Vec::new();
        for (i, product) in products.iter().enumerate() {
            for (id_type, raw_value, _normalized, _is_canonical) in &product.alternate_identifiers {
                tuple_row.push(i as i32);
                tuple_type.push(id_type_to_str(*id_type));
                tuple_value.push(raw_value.clone());
                tuple_ns.push(product.source_id.to_string());
            }
        }

        let collision_rows = sqlx::query(
            "SELECT t.row_idx, spi.source_product_id \
             FROM UNNEST($1::int[], $2::text[], $3::text[], $4::text[]) \
                AS t(row_idx, id_type, id_value, namespace) \
             JOIN source_product_identifier spi \
                ON spi.id_type = t.id_type AND spi.id_value = t.id_value \
                AND spi.namespace = t.namespace",
        )
        .bind(&tuple_row)
        .bind(&tuple_type)
        .bind(&tuple_value)
        .bind(&tuple_ns)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut candidates: HashMap<i32, Vec<Uuid>> = HashMap::new();
        for row in &collision_rows {
            let idx: i32 = row.try_get("row_idx").map_err(db_err)?;
            let id: Uuid = row.try_get("source_product_id").map_err(db_err)?;
            candidates.entry(idx).or_default().push(id);
        }

        let mut results = Vec::with_capacity(products.len());
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        for (i, product) in products.iter().enumerate() {
            let mut owners = candidates.remove(&(i as i32)).unwrap_or_default();
            owners.sort();
            owners.dedup();
            let collided = owners.len() > 1;

            let existing: Option<(Uuid,)> = if let Some(&id) = owners.first() {
                Some((id,))
            } else {
                sqlx::query_as(
                    "SELECT id FROM source_product WHERE source_id = $1 AND identity_key = $2",
                )
                .bind(product.source_id)
                .bind(&product.identity_key)
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_err)?
            };

            let source_product_id = if let Some((id,)) = existing {
                sqlx::query(
                    "UPDATE source_product SET title = $2, url = $3, normalized_url = $4, \
                     image_url = $5, brand = $6, category = $7, caliber = $8, \
                     grain_weight = $9, round_count = $10, description = $11, \
                     last_updated_by_run_id = $12 WHERE id = $1",
                )
                .bind(id)
                .bind(&product.title)
                .bind(&product.url)
                .bind(&product.normalized_url)
                .bind(&product.image_url)
                .bind(&product.brand)
                .bind(&product.category)
                .bind(&product.caliber)
                .bind(product.grain_weight)
                .bind(product.round_count)
                .bind(&product.description)
                .bind(run_id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
                id
            } else {
                let new_id = Uuid::new_v4();
                sqlx::query(
                    "INSERT INTO source_product (id, source_id, identity_key, title, url, \
                     normalized_url, image_url, brand, category, caliber, grain_weight, \
                     round_count, description, created_by_run_id, last_updated_by_run_id) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $14)",
                )
                .bind(new_id)
                .bind(product.source_id)
                .bind(&product.identity_key)
                .bind(&product.title)
                .bind(&product.url)
                .bind(&product.normalized_url)
                .bind(&product.image_url)
                .bind(&product.brand)
                .bind(&product.category)
                .bind(&product.caliber)
                .bind(product.grain_weight)
                .bind(product.round_count)
                .bind(&product.description)
                .bind(run_id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
                new_id
            };

            for (id_type, raw_value, normalized_value, is_canonical) in &product.alternate_identifiers {
                sqlx::query(
                    "INSERT INTO source_product_identifier \
                     (source_product_id, id_type, id_value, namespace, is_canonical, normalized_value) \
                     VALUES ($1, $2, $3, $4, $5, $6) \
                     ON CONFLICT (source_product_id, id_type, id_value, namespace) \
                     DO UPDATE SET is_canonical = EXCLUDED.is_canonical, \
                     normalized_value = EXCLUDED.normalized_value",
                )
                .bind(source_product_id)
                .bind(id_type_to_str(*id_type))
                .bind(raw_value)
                .bind(&product.source_id.to_string())
                .bind(is_canonical)
                .bind(normalized_value)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
            }

            results.push(UpsertedProduct {
                source_product_id,
                identity_key: product.identity_key.clone(),
                collided,
            });
        }

        tx.commit().await.map_err(db_err)?;
        Ok(results)
    }

    async fn record_presence(
        &self,
        run_id: Uuid,
        seen: &[Uuid],
        observed_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        if seen.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        sqlx::query(
            "INSERT INTO source_product_presence (source_product_id, last_seen_at) \
             SELECT id, $2 FROM UNNEST($1::uuid[]) AS id \
             ON CONFLICT (source_product_id) DO UPDATE SET last_seen_at = EXCLUDED.last_seen_at",
        )
        .bind(seen)
        .bind(observed_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        sqlx::query(
            "INSERT INTO source_product_seen (run_id, source_product_id) \
             SELECT $1, id FROM UNNEST($2::uuid[]) AS id \
             ON CONFLICT (run_id, source_product_id) DO NOTHING",
        )
        .bind(run_id)
        .bind(seen)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn promote_seen(&self, run_id: Uuid, t0: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query(
            "UPDATE source_product_presence SET last_seen_success_at = $2 \
             WHERE source_product_id IN \
             (SELECT source_product_id FROM source_product_seen WHERE run_id = $1)",
        )
        .bind(run_id)
        .bind(t0)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected())
    }

    async fn last_prices(
        &self,
        source_product_ids: &[Uuid],
    ) -> StoreResult<HashMap<Uuid, CachedPrice>> {
        if source_product_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let rows = sqlx::query(
            "SELECT DISTINCT ON (source_product_id) source_product_id, price_signature_hash, \
             created_at, price, in_stock, currency \
             FROM price WHERE source_product_id = ANY($1) \
             ORDER BY source_product_id, created_at DESC",
        )
        .bind(source_product_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut map = HashMap::with_capacity(rows.len());
        for row in rows {
            let id: Uuid = row.try_get("source_product_id").map_err(db_err)?;
            map.insert(
                id,
                CachedPrice {
                    price_signature_hash: row.try_get("price_signature_hash").map_err(db_err)?,
                    created_at: row.try_get("created_at").map_err(db_err)?,
                    price: row.try_get("price").map_err(db_err)?,
                    in_stock: row.try_get("in_stock").map_err(db_err)?,
                    currency: row.try_get("currency").map_err(db_err)?,
                },
            );
        }
        Ok(map)
    }

    async fn insert_prices(&self, prices: &[PriceInsert]) -> StoreResult<u64> {
        if prices.is_empty() {
            return Ok(0);
        }

        let mut ids = Vec::with_capacity(prices.len());
        let mut source_product_ids = Vec::with_capacity(prices.len());
        let mut product_ids: Vec<Option<Uuid>> = Vec::with_capacity(prices.len());
        let mut retailer_ids = Vec::with_capacity(prices.len());
        let mut run_ids = Vec::with_capacity(prices.len());
        let mut amounts: Vec<Decimal> = Vec::with_capacity(prices.len());
        let mut currencies = Vec::with_capacity(prices.len());
        let mut urls = Vec::with_capacity(prices.len());
        let mut in_stocks = Vec::with_capacity(prices.len());
        let mut original_prices: Vec<Option<Decimal>> = Vec::with_capacity(prices.len());
        let mut price_types = Vec::with_capacity(prices.len());
        let mut signatures = Vec::with_capacity(prices.len());
        let mut observed_ats = Vec::with_capacity(prices.len());

        for p in prices {
            ids.push(Uuid::new_v4());
            source_product_ids.push(p.source_product_id);
            product_ids.push(p.product_id);
            retailer_ids.push(p.retailer_id);
            run_ids.push(p.run_id);
            amounts.push(p.price);
            currencies.push(p.currency.clone());
            urls.push(p.url.clone());
            in_stocks.push(p.in_stock);
            original_prices.push(p.original_price);
            price_types.push(price_type_to_str(p.price_type).to_string());
            signatures.push(crate::processor::price_signature(p.price, &p.currency, p.original_price));
            observed_ats.push(p.observed_at);
        }

        // One INSERT ... SELECT FROM unnest(...) with IGNORE-ON-CONFLICT
        // (SPEC_FULL §4.6.2 step 7); `RETURNING id` row count is the
        // authoritative pricesWritten, not the attempted array length.
        let rows = sqlx::query(
            "INSERT INTO price (id, source_product_id, product_id, retailer_id, run_id, \
             price, currency, url, in_stock, original_price, price_type, \
             price_signature_hash, affiliate_feed_run_id, created_at, observed_at) \
             SELECT u.id, u.source_product_id, u.product_id, u.retailer_id, u.run_id, \
             u.price, u.currency, u.url, u.in_stock, u.original_price, u.price_type, \
             u.signature, u.run_id, now(), u.observed_at \
             FROM UNNEST($1::uuid[], $2::uuid[], $3::uuid[], $4::uuid[], $5::uuid[], \
             $6::numeric[], $7::text[], $8::text[], $9::bool[], $10::numeric[], \
             $11::text[], $12::text[], $13::timestamptz[]) \
             AS u(id, source_product_id, product_id, retailer_id, run_id, price, \
             currency, url, in_stock, original_price, price_type, signature, observed_at) \
             ON CONFLICT (source_product_id, price_signature_hash) DO NOTHING \
             RETURNING id",
        )
        .bind(&ids)
        .bind(&source_product_ids)
        .bind(&product_ids)
        .bind(&retailer_ids)
        .bind(&run_ids)
        .bind(&amounts)
        .bind(&currencies)
        .bind(&urls)
        .bind(&in_stocks)
        .bind(&original_prices)
        .bind(&price_types)
        .bind(&signatures)
        .bind(&observed_ats)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows.len() as u64)
    }

    async fn match_canonical_product_by_upc(&self, upc: &str) -> StoreResult<Option<Uuid>> {
        let row: Option<(Uuid,)> =
            sqlx::query_as("SELECT id FROM canonical_product WHERE upc = $1")
                .bind(upc)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?;
        Ok(row.map(|(id,)| id))
    }

    async fn upsert_product_link(&self, link: &ProductLink) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO product_link (source_product_id, product_id, status, match_type, \
             confidence, resolver_version, evidence) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (source_product_id) DO UPDATE SET \
             product_id = EXCLUDED.product_id, status = EXCLUDED.status, \
             match_type = EXCLUDED.match_type, confidence = EXCLUDED.confidence, \
             resolver_version = EXCLUDED.resolver_version, evidence = EXCLUDED.evidence \
             WHERE product_link.status IN ('UNMATCHED', 'NEEDS_REVIEW')",
        )
        .bind(link.source_product_id)
        .bind(link.product_id)
        .bind(link_status_to_str(link.status))
        .bind(match_type_to_str(link.match_type))
        .bind(link.confidence)
        .bind(&link.resolver_version)
        .bind(&link.evidence)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn quarantine(&self, records: &[QuarantinedRecord]) -> StoreResult<()> {
        for record in records {
            sqlx::query(
                "INSERT INTO quarantined_record (feed_id, match_key, raw_payload, \
                 blocking_error_codes) VALUES ($1, $2, $3, $4) \
                 ON CONFLICT (feed_id, match_key) DO UPDATE SET \
                 raw_payload = EXCLUDED.raw_payload, \
                 blocking_error_codes = EXCLUDED.blocking_error_codes",
            )
            .bind(record.feed_id)
            .bind(&record.match_key)
            .bind(&record.raw_payload)
            .bind(&record.blocking_error_codes)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        }
        Ok(())
    }

    async fn enqueue_alert_job(&self, job: &AlertJob) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO price_alert_job (execution_id, product_id, old_price, new_price, \
             in_stock) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(job.execution_id)
        .bind(job.product_id)
        .bind(job.old_price)
        .bind(job.new_price)
        .bind(job.in_stock)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn enqueue_resolver_job(&self, job: &ResolverJob) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO resolver_job (source_product_id, reason, resolver_version, \
             source_id, identity_key, affiliate_feed_run_id) VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(job.source_product_id)
        .bind(resolver_reason_to_str(job.reason))
        .bind(&job.resolver_version)
        .bind(job.source_id)
        .bind(&job.identity_key)
        .bind(job.affiliate_feed_run_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn claim_ingest_jobs(&self, limit: i64) -> StoreResult<Vec<IngestJob>> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let rows = sqlx::query(
            "SELECT id, feed_id, trigger, run_id, feed_lock_id FROM affiliate_feed_job \
             WHERE claimed = false ORDER BY id FOR UPDATE SKIP LOCKED LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err)?;

        let mut ids = Vec::with_capacity(rows.len());
        let mut jobs = Vec::with_capacity(rows.len());
        for row in &rows {
            let id: i64 = row.try_get("id").map_err(db_err)?;
            ids.push(id);
            jobs.push(IngestJob {
                id: Some(id),
                feed_id: row.try_get("feed_id").map_err(db_err)?,
                trigger: match row.try_get::<String, _>("trigger").map_err(db_err)?.as_str() {
                    "MANUAL" => RunTrigger::Manual,
                    "MANUAL_PENDING" => RunTrigger::ManualPending,
                    "ADMIN_TEST" => RunTrigger::AdminTest,
                    "RETRY" => RunTrigger::Retry,
                    _ => RunTrigger::Scheduled,
                },
                run_id: row.try_get("run_id").map_err(db_err)?,
                feed_lock_id: row.try_get("feed_lock_id").map_err(db_err)?,
            });
        }

        if !ids.is_empty() {
            sqlx::query("UPDATE affiliate_feed_job SET claimed = true WHERE id = ANY($1)")
                .bind(&ids)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(jobs)
    }

    async fn attach_run_to_job(
        &self,
        job_id: i64,
        run_id: Uuid,
        feed_lock_id: i64,
    ) -> StoreResult<()> {
        sqlx::query("UPDATE affiliate_feed_job SET run_id = $2, feed_lock_id = $3 WHERE id = $1")
            .bind(job_id)
            .bind(run_id)
            .bind(feed_lock_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

fn trigger_to_str(trigger: RunTrigger) -> &'static str {
    match trigger {
        RunTrigger::Scheduled => "SCHEDULED",
        RunTrigger::Manual => "MANUAL",
        RunTrigger::ManualPending => "MANUAL_PENDING",
        RunTrigger::AdminTest => "ADMIN_TEST",
        RunTrigger::Retry => "RETRY",
    }
}

fn run_status_to_str(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Running => "RUNNING",
        RunStatus::Succeeded => "SUCCEEDED",
        RunStatus::Failed => "FAILED",
    }
}

fn skipped_reason_to_str(reason: crate::models::SkippedReason) -> &'static str {
    match reason {
        crate::models::SkippedReason::UnchangedMtime => "UNCHANGED_MTIME",
        crate::models::SkippedReason::UnchangedHash => "UNCHANGED_HASH",
        crate::models::SkippedReason::FileNotFound => "FILE_NOT_FOUND",
    }
}

fn failure_kind_to_str(kind: crate::errors::FailureKind) -> &'static str {
    match kind {
        crate::errors::FailureKind::Transient => "TRANSIENT",
        crate::errors::FailureKind::Permanent => "PERMANENT",
        crate::errors::FailureKind::Config => "CONFIG",
    }
}

fn price_type_to_str(t: PriceType) -> &'static str {
    match t {
        PriceType::Regular => "REGULAR",
        PriceType::Sale => "SALE",
    }
}

fn link_status_to_str(status: LinkStatus) -> &'static str {
    match status {
        LinkStatus::Unmatched => "UNMATCHED",
        LinkStatus::Created => "CREATED",
        LinkStatus::Matched => "MATCHED",
        LinkStatus::NeedsReview => "NEEDS_REVIEW",
        LinkStatus::Error => "ERROR",
    }
}

fn match_type_to_str(t: MatchType) -> &'static str {
    match t {
        MatchType::Upc => "UPC",
        MatchType::Manual => "MANUAL",
        MatchType::None => "NONE",
    }
}

fn resolver_reason_to_str(reason: ResolverReason) -> &'static str {
    match reason {
        ResolverReason::Ingest => "INGEST",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_id_type_through_its_string_form() {
        for t in [IdType::NetworkItemId, IdType::Sku, IdType::Upc, IdType::UrlHash, IdType::Url] {
            assert_eq!(id_type_from_str(id_type_to_str(t)), t);
        }
    }

    #[test]
    fn round_trips_trigger_through_its_string_form() {
        for t in [
            RunTrigger::Scheduled,
            RunTrigger::Manual,
            RunTrigger::ManualPending,
            RunTrigger::AdminTest,
            RunTrigger::Retry,
        ] {
            let s = trigger_to_str(t);
            let back = match s {
                "MANUAL" => RunTrigger::Manual,
                "MANUAL_PENDING" => RunTrigger::ManualPending,
                "ADMIN_TEST" => RunTrigger::AdminTest,
                "RETRY" => RunTrigger::Retry,
                _ => RunTrigger::Scheduled,
            };
            assert_eq!(back, t);
        }
    }
}
