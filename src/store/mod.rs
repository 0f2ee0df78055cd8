//! Feed Store (SPEC_FULL §4.1/§6): persistence seam for feeds, runs, and
//! the product/price/link data the pipeline writes.
//!
//! Modeled as one `FeedStore` trait with batch-shaped methods, the same
//! repository-trait-per-concern shape the teacher uses
//! (`ProductRepository`/`WarehouseRepository` in the now-removed
//! `repository/traits.rs`), generalized to feed ingestion and backed by
//! runtime-built `sqlx` queries rather than the teacher's unfinished SQL
//! stub.

pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use uuid::Uuid;

use crate::errors::StoreError;
use crate::models::{
    CachedPrice, Feed, FeedRun, IdType, LinkStatus, MatchType, ProductLink,
    QuarantinedRecord, SkippedReason as ModelSkippedReason,
};

pub type StoreResult<T> = Result<T, StoreError>;

/// The circuit breaker's base counts, per SPEC_FULL §4.7.
#[derive(Debug, Clone, Copy, Default)]
pub struct CircuitBreakerCounts {
    pub active_count_before: u64,
    pub seen_success_count: u64,
}

/// A `SourceProduct` plus its resolved identity, ready to be upserted.
/// `collision` is set when the identity key already belongs to a
/// different source product (see SPEC_FULL §4.6.1).
pub struct ProductUpsert {
    pub source_id: Uuid,
    pub identity_key: String,
    pub canonical_type: IdType,
    pub title: String,
    pub url: String,
    pub normalized_url: String,
    pub image_url: Option<String>,
    pub brand: Option<String>,
    pub category: Option<String>,
    pub caliber: Option<String>,
    pub grain_weight: Option<rust_decimal::Decimal>,
    pub round_count: Option<i32>,
    pub description: Option<String>,
    pub alternate_identifiers: Vec<(IdType, String, String, bool)>,
}

pub struct UpsertedProduct {
    pub source_product_id: Uuid,
    pub identity_key: String,
    /// `true` when this row's identity key collided with an existing
    /// source product under a different raw identity (the write was
    /// skipped and the row should be quarantined by the caller).
    pub collided: bool,
}

pub struct PriceInsert {
    pub source_product_id: Uuid,
    pub product_id: Option<Uuid>,
    pub retailer_id: Uuid,
    pub run_id: Uuid,
    pub price: rust_decimal::Decimal,
    pub original_price: Option<rust_decimal::Decimal>,
    pub currency: String,
    pub url: String,
    pub in_stock: bool,
    pub price_type: crate::models::PriceType,
    pub observed_at: DateTime<Utc>,
}

/// Skip reason as persisted on a `FeedRun`/price history row. Distinct
/// from `crate::fetcher::SkipReason`, which is transport-level.
pub type PersistedSkipReason = ModelSkippedReason;

#[async_trait]
pub trait FeedStore: Send + Sync {
    async fn get_feed(&self, feed_id: Uuid) -> StoreResult<Option<Feed>>;

    async fn due_feeds(&self, now: DateTime<Utc>) -> StoreResult<Vec<Feed>>;

    async fn create_run(&self, run: &FeedRun) -> StoreResult<()>;

    /// Fetch a run by id, used to validate a retry job's run is still
    /// `RUNNING` before resuming it.
    async fn load_run(&self, run_id: Uuid) -> StoreResult<Option<FeedRun>>;

    async fn finalize_run(&self, run: &FeedRun) -> StoreResult<()>;

    /// Mark `feed.manual_run_pending` false; used by the orchestrator after
    /// it drains a pending manual run into a fresh job enqueue.
    async fn clear_manual_run_pending(&self, feed_id: Uuid) -> StoreResult<()>;

    /// Mark `feed.manual_run_pending` true; used by the orchestrator when a
    /// MANUAL/MANUAL_PENDING trigger finds the feed's lock already busy
    /// (SPEC_FULL §4.8's `LockBusy` branch).
    async fn set_manual_run_pending(&self, feed_id: Uuid) -> StoreResult<()>;

    /// On a successful finalize: zero `consecutive_failures`, schedule
    /// `next_run_at`, and, when `change_detection` is `Some` (a real
    /// download happened, as opposed to a skipped run), memoize the new
    /// `(mtime, size, contentHash)` triple.
    async fn reset_failures_and_reschedule(
        &self,
        feed_id: Uuid,
        next_run_at: DateTime<Utc>,
        change_detection: Option<crate::models::ChangeDetectionMemo>,
    ) -> StoreResult<()>;

    /// On a failed finalize: persist the new `consecutive_failures` count
    /// and, if `auto_disable` is set, flip the feed to `DISABLED` and clear
    /// `next_run_at`.
    async fn record_failure(
        &self,
        feed_id: Uuid,
        consecutive_failures: u32,
        auto_disable: bool,
    ) -> StoreResult<()>;

    /// Insert a new ingest job row for the durable queue (`SELECT ... FOR
    /// UPDATE SKIP LOCKED` consumers pick it up via `claim_ingest_jobs`).
    async fn enqueue_ingest_job(&self, job: &crate::models::IngestJob) -> StoreResult<()>;

    /// Write `{runId, feedLockId}` back onto the originating job row
    /// (SPEC_FULL §5a/§8: "retrying a failed job never creates a second
    /// FeedRun"). Called by the orchestrator under the feed's advisory
    /// lock, immediately after `create_run`, so a crash-and-redelivery of
    /// this exact job row can later resume the same `FeedRun` instead of
    /// creating a new one.
    async fn attach_run_to_job(
        &self,
        job_id: i64,
        run_id: Uuid,
        feed_lock_id: i64,
    ) -> StoreResult<()>;

    /// The circuit breaker's two base counts (SPEC_FULL §4.7), computed
    /// together since the second is a subset of the first: `active_count`
    /// is this source's products with `last_seen_success_at >=
    /// expiry_threshold`; `seen_success_count` is how many of those also
    /// appear in `SourceProductSeen` for `run_id`.
    async fn circuit_breaker_counts(
        &self,
        source_id: Uuid,
        run_id: Uuid,
        expiry_threshold: DateTime<Utc>,
    ) -> StoreResult<CircuitBreakerCounts>;

    /// Upsert a batch of parsed rows into `SourceProduct`/
    /// `SourceProductIdentifier`. Returns one result per input, in order.
    async fn upsert_products(
        &self,
        run_id: Uuid,
        products: &[ProductUpsert],
    ) -> StoreResult<Vec<UpsertedProduct>>;

    /// Phase 1: stamp `SourceProductPresence.last_seen_at` for every id in
    /// `seen` and append one `SourceProductSeen(run_id, id)` row per id
    /// (ignore-on-conflict). Never touches `last_seen_success_at` — that is
    /// Phase 2's job, gated by the circuit breaker.
    async fn record_presence(
        &self,
        run_id: Uuid,
        seen: &[Uuid],
        observed_at: DateTime<Utc>,
    ) -> StoreResult<()>;

    /// Phase 2, on a circuit-breaker pass: one UPDATE setting
    /// `last_seen_success_at = t0` for every product in
    /// `SourceProductSeen(run_id)`. Returns the affected-row count, the
    /// authoritative `productsPromoted` (SPEC_FULL §4.7).
    async fn promote_seen(&self, run_id: Uuid, t0: DateTime<Utc>) -> StoreResult<u64>;

    /// Hydrate the run-local last-price cache for a batch of source
    /// products, bounded to whatever the caller already batched.
    async fn last_prices(
        &self,
        source_product_ids: &[Uuid],
    ) -> StoreResult<HashMap<Uuid, CachedPrice>>;

    /// Bulk INSERT ... ON CONFLICT DO NOTHING. Returns the actual
    /// affected-row count, the authoritative `pricesWritten` (array length
    /// is not, per SPEC_FULL §4.6.2 step 7).
    async fn insert_prices(&self, prices: &[PriceInsert]) -> StoreResult<u64>;

    /// For a normalized UPC, look up the canonical product table (owned by
    /// a collaborator outside this core; modeled here as a single lookup
    /// seam). `None` means unmatched — the caller enqueues a resolver job.
    async fn match_canonical_product_by_upc(&self, upc: &str) -> StoreResult<Option<Uuid>>;

    /// WHERE-guarded upsert: only overwrites an existing link when its
    /// `status` is `Unmatched` or `NeedsReview` (never clobber a
    /// human-confirmed or already-errored match).
    async fn upsert_product_link(&self, link: &ProductLink) -> StoreResult<()>;

    async fn quarantine(&self, records: &[QuarantinedRecord]) -> StoreResult<()>;

    async fn enqueue_alert_job(&self, job: &crate::models::AlertJob) -> StoreResult<()>;

    async fn enqueue_resolver_job(&self, job: &crate::models::ResolverJob) -> StoreResult<()>;

    /// Pop up to `limit` ingest jobs using `SELECT ... FOR UPDATE SKIP
    /// LOCKED`, so multiple worker processes can share one queue safely.
    async fn claim_ingest_jobs(&self, limit: i64) -> StoreResult<Vec<crate::models::IngestJob>>;
}

pub fn link_status_for_match(matched: bool, match_type: MatchType) -> LinkStatus {
    match (matched, match_type) {
        (true, MatchType::Upc) | (true, MatchType::Manual) => LinkStatus::Matched,
        (true, _) => LinkStatus::Created,
        (false, _) => LinkStatus::NeedsReview,
    }
}
