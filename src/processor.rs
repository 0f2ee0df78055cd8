//! Processor (SPEC_FULL §4.6): turns a stream of parsed rows into durable,
//! idempotent writes — last-row-wins dedup, chunked upserts, presence/seen
//! bookkeeping, price-signature diffing, and alert detection.
//!
//! Batch-not-per-row query discipline follows the same "one statement per
//! batch" idiom the store's bulk repository methods already model
//! (`crate::store::FeedStore`), generalized here to the processor's own
//! chunk pipeline.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sha2::{Digest, Sha256};
use tracing::warn;
use uuid::Uuid;

use crate::errors::FeedError;
use crate::identity::IdentityResolver;
use crate::models::{
    AlertJob, AlertTopic, CachedPrice, PriceType, QuarantinedRecord, ProductLink, LinkStatus,
    MatchType, ResolverJob, ResolverReason,
};
use crate::parser::ParsedProduct;
use crate::store::{link_status_for_match, FeedStore, PriceInsert, ProductUpsert};

pub const DEFAULT_CHUNK_SIZE: usize = 1000;
pub const DEFAULT_HEARTBEAT_HOURS: i64 = 24;

/// Everything the processor needs beyond the parsed rows themselves;
/// settings and feed-specific values the orchestrator has already resolved.
#[derive(Debug, Clone, Copy)]
pub struct ProcessorConfig {
    pub chunk_size: usize,
    pub heartbeat_hours: i64,
    pub max_row_count: usize,
    pub resolver_version: &'static str,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            heartbeat_hours: DEFAULT_HEARTBEAT_HOURS,
            max_row_count: 200_000,
            resolver_version: "v1",
        }
    }
}

/// Per-chunk alert skip reasons, tallied for the end-of-run log summary
/// (SPEC_FULL §4.6.3).
#[derive(Debug, Clone, Default)]
pub struct AlertSkipCounters {
    pub null_product_id: u64,
    pub new_product: u64,
    pub currency_mismatch: u64,
    pub unknown_prior_state: u64,
    pub no_change: u64,
}

/// Totals accumulated over the whole run, ready to be written onto the
/// `FeedRun`'s counters.
#[derive(Debug, Clone, Default)]
pub struct ProcessorOutcome {
    pub rows_parsed: u64,
    pub products_upserted: u64,
    pub prices_written: u64,
    pub products_rejected: u64,
    pub duplicate_key_count: u64,
    pub url_hash_fallback_count: u64,
    pub error_count: u64,
    pub alert_skips: AlertSkipCounters,
    pub errors: Vec<RowDiagnostic>,
}

#[derive(Debug, Clone)]
pub struct RowDiagnostic {
    pub code: String,
    pub message: String,
    pub row_number: Option<u64>,
}

struct ResolvedRow {
    product: ParsedProduct,
    identity_key: String,
    canonical_type: crate::models::IdType,
    used_url_hash_fallback: bool,
    alternates: Vec<crate::identity::AlternateIdentifier>,
}

pub struct Processor<'a> {
    store: &'a dyn FeedStore,
    config: ProcessorConfig,
}

impl<'a> Processor<'a> {
    pub fn new(store: &'a dyn FeedStore, config: ProcessorConfig) -> Self {
        Self { store, config }
    }

    /// Run Phase 1 of the pipeline for one run: pre-scan dedup, then the
    /// chunked write pipeline. Does not touch `last_seen_success_at` —
    /// that is the circuit breaker's job (Phase 2).
    pub async fn process(
        &self,
        run_id: Uuid,
        source_id: Uuid,
        retailer_id: Uuid,
        t0: DateTime<Utc>,
        products: Vec<ParsedProduct>,
    ) -> Result<ProcessorOutcome, FeedError> {
        let mut outcome = ProcessorOutcome::default();

        let (rows, duplicate_key_count) = dedup_last_row_wins(products);
        outcome.duplicate_key_count = duplicate_key_count;
        outcome.rows_parsed = rows.len() as u64;
        outcome.url_hash_fallback_count = rows
            .iter()
            .filter(|r| r.used_url_hash_fallback)
            .count() as u64;

        let mut last_price_cache: HashMap<Uuid, CachedPrice> = HashMap::new();

        for chunk in rows.chunks(self.config.chunk_size) {
            match self
                .process_chunk(run_id, source_id, retailer_id, t0, chunk, &mut last_price_cache, &mut outcome)
                .await
            {
                Ok(()) => {}
                Err(FeedError::TooManyRows { .. }) => return Err(FeedError::TooManyRows {
                    read: last_price_cache.len(),
                    limit: self.config.max_row_count,
                }),
                Err(err) => {
                    outcome.products_rejected += chunk.len() as u64;
                    outcome.error_count += 1;
                    outcome.errors.push(RowDiagnostic {
                        code: "DATABASE_ERROR".into(),
                        message: err.to_string(),
                        row_number: None,
                    });
                }
            }
        }

        Ok(outcome)
    }

    async fn process_chunk(
        &self,
        run_id: Uuid,
        source_id: Uuid,
        retailer_id: Uuid,
        t0: DateTime<Utc>,
        chunk: &[ResolvedRow],
        last_price_cache: &mut HashMap<Uuid, CachedPrice>,
        outcome: &mut ProcessorOutcome,
    ) -> Result<(), FeedError> {
        // 1. Quarantine filter: rows lacking caliber never flow further.
        let (eligible, quarantined): (Vec<&ResolvedRow>, Vec<&ResolvedRow>) = chunk
            .iter()
            .partition(|row| row.product.caliber.as_deref().map(|c| !c.is_empty()).unwrap_or(false));

        if !quarantined.is_empty() {
            let records: Vec<QuarantinedRecord> = quarantined
                .iter()
                .map(|row| QuarantinedRecord {
                    feed_id: source_id,
                    match_key: row.identity_key.clone(),
                    raw_payload: serde_json::to_value(&raw_payload(&row.product)).unwrap_or_default(),
                    blocking_error_codes: vec!["MISSING_CALIBER".into()],
                })
                .collect();
            self.store.quarantine(&records).await?;
            outcome.products_rejected += quarantined.len() as u64;
        }

        if eligible.is_empty() {
            return Ok(());
        }

        // 2. Upsert SourceProducts by any identifier.
        let upserts: Vec<ProductUpsert> = eligible
            .iter()
            .map(|row| build_upsert(source_id, row))
            .collect();
        let upserted = self.store.upsert_products(run_id, &upserts).await?;

        let mut seen_ids: HashSet<Uuid> = HashSet::new();
        let mut product_for_row: Vec<(Uuid, &ResolvedRow)> = Vec::with_capacity(eligible.len());
        for (row, result) in eligible.iter().zip(upserted.iter()) {
            if result.collided {
                warn!(
                    run_id = %run_id,
                    source_product_id = %result.source_product_id,
                    identity_key = %result.identity_key,
                    "IDENTIFIER_COLLISION: row resolved to multiple source products, kept lexicographically smallest id"
                );
            }
            seen_ids.insert(result.source_product_id);
            product_for_row.push((result.source_product_id, row));
        }
        outcome.products_upserted += product_for_row.len() as u64;

        // 3. Product matching by normalized UPC. Keep the resolved canonical
        // product id per source product around (step 8 reuses it instead of
        // looking it up again).
        let mut canonical_for_row: HashMap<Uuid, Option<Uuid>> = HashMap::new();
        for (source_product_id, row) in &product_for_row {
            let Some(upc) = row.product.upc.as_deref() else {
                canonical_for_row.insert(*source_product_id, None);
                continue;
            };
            match self.store.match_canonical_product_by_upc(upc).await {
                Ok(Some(product_id)) => {
                    let link = ProductLink {
                        source_product_id: *source_product_id,
                        product_id: Some(product_id),
                        status: link_status_for_match(true, MatchType::Upc),
                        match_type: MatchType::Upc,
                        confidence: Some(1.0),
                        resolver_version: self.config.resolver_version.to_string(),
                        evidence: Some(serde_json::json!({"matched_upc": upc})),
                    };
                    self.store.upsert_product_link(&link).await?;
                    canonical_for_row.insert(*source_product_id, Some(product_id));
                }
                Ok(None) => {
                    let link = ProductLink {
                        source_product_id: *source_product_id,
                        product_id: None,
                        status: LinkStatus::Unmatched,
                        match_type: MatchType::None,
                        confidence: None,
                        resolver_version: self.config.resolver_version.to_string(),
                        evidence: None,
                    };
                    self.store.upsert_product_link(&link).await?;
                    let job = ResolverJob {
                        source_product_id: *source_product_id,
                        reason: ResolverReason::Ingest,
                        resolver_version: self.config.resolver_version.to_string(),
                        source_id,
                        identity_key: row.identity_key.clone(),
                        affiliate_feed_run_id: run_id,
                    };
                    if let Err(err) = self.store.enqueue_resolver_job(&job).await {
                        warn!(run_id = %run_id, error = %err, "resolver enqueue failed, continuing chunk");
                    }
                    canonical_for_row.insert(*source_product_id, None);
                }
                Err(err) => {
                    warn!(run_id = %run_id, error = %err, "canonical product lookup failed for row, leaving link untouched");
                    canonical_for_row.insert(*source_product_id, None);
                }
            }
        }

        // 4. Presence + seen (Phase 1 only — lastSeenAt, never lastSeenSuccessAt).
        let seen_ids_vec: Vec<Uuid> = seen_ids.iter().copied().collect();
        self.store.record_presence(run_id, &seen_ids_vec, t0).await?;

        // 5. Last-price fetch, bounded.
        let missing: Vec<Uuid> = seen_ids_vec
            .iter()
            .copied()
            .filter(|id| !last_price_cache.contains_key(id))
            .collect();
        if !missing.is_empty() {
            let fetched = self.store.last_prices(&missing).await?;
            last_price_cache.extend(fetched);
        }
        if last_price_cache.len() > self.config.max_row_count {
            return Err(FeedError::TooManyRows {
                read: last_price_cache.len(),
                limit: self.config.max_row_count,
            });
        }

        // 6/7. Decide writes, bulk insert. Snapshot each row's prior cache
        // entry before any mutation — step 8's alert detection needs these
        // exact pre-update values, and the cache below is mutated in place
        // as soon as a write is chosen.
        let mut prior_snapshot: HashMap<Uuid, Option<CachedPrice>> = HashMap::new();
        let mut to_insert: Vec<(Uuid, PriceInsert, String, Decimal)> = Vec::new();
        for (source_product_id, row) in &product_for_row {
            let prior = last_price_cache.get(source_product_id);
            prior_snapshot.insert(*source_product_id, prior.cloned());
            let signature = price_signature(row.product.price, &row.product.currency, row.product.original_price);
            let is_new = prior.is_none();
            let sig_changed = prior.map(|p| p.price_signature_hash != signature).unwrap_or(true);
            let stock_changed = prior
                .and_then(|p| p.in_stock)
                .map(|prev| prev != row.product.in_stock)
                .unwrap_or(false);
            let heartbeat_due = prior
                .map(|p| t0.signed_duration_since(p.created_at).num_hours() >= self.config.heartbeat_hours)
                .unwrap_or(false);

            if is_new || sig_changed || stock_changed || heartbeat_due {
                let insert = PriceInsert {
                    source_product_id: *source_product_id,
                    product_id: canonical_for_row.get(source_product_id).copied().flatten(),
                    retailer_id,
                    run_id,
                    price: row.product.price,
                    original_price: row.product.original_price,
                    currency: row.product.currency.clone(),
                    url: row.product.url.clone(),
                    in_stock: row.product.in_stock,
                    price_type: PriceType::Regular,
                    observed_at: t0,
                };
                to_insert.push((*source_product_id, insert, signature.clone(), row.product.price));
            }
        }

        if !to_insert.is_empty() {
            let inserts: Vec<PriceInsert> = to_insert.iter().map(|(_, p, _, _)| p.clone()).collect();
            let written = self.store.insert_prices(&inserts).await?;
            outcome.prices_written += written;

            for (source_product_id, insert, signature, price) in &to_insert {
                last_price_cache.insert(
                    *source_product_id,
                    CachedPrice {
                        price_signature_hash: signature.clone(),
                        created_at: t0,
                        price: *price,
                        in_stock: Some(insert.in_stock),
                        currency: insert.currency.clone(),
                    },
                );
            }
        }

        // 8. Alert detection, using the pre-update snapshot taken before
        // step 7 mutated `last_price_cache` in place.
        let mut alert_jobs = Vec::new();
        for (source_product_id, row) in &product_for_row {
            let prior_before = prior_snapshot.get(source_product_id).and_then(|p| p.as_ref());
            let link_product_id = canonical_for_row.get(source_product_id).copied().flatten();

            classify_alert(
                link_product_id,
                prior_before,
                row.product.price,
                row.product.in_stock,
                &row.product.currency,
                &mut outcome.alert_skips,
                &mut alert_jobs,
                run_id,
            );
        }

        for job in alert_jobs {
            if let Err(err) = self.store.enqueue_alert_job(&job).await {
                warn!(run_id = %run_id, error = %err, "alert enqueue failed, continuing chunk");
            }
        }

        Ok(())
    }
}

fn raw_payload(product: &ParsedProduct) -> serde_json::Value {
    serde_json::json!({
        "name": product.name,
        "url": product.url,
        "price": product.price.to_string(),
        "caliber": product.caliber,
    })
}

fn build_upsert(source_id: Uuid, row: &ResolvedRow) -> ProductUpsert {
    let alternate_identifiers = row
        .alternates
        .iter()
        .map(|a| (a.id_type, a.raw_value.clone(), a.normalized_value.clone(), a.is_canonical))
        .collect();

    ProductUpsert {
        source_id,
        identity_key: row.identity_key.clone(),
        canonical_type: row.canonical_type,
        title: row.product.name.clone(),
        url: row.product.url.clone(),
        normalized_url: crate::identity::canonicalize_url(&row.product.url),
        image_url: row.product.image_url.clone(),
        brand: row.product.brand.clone(),
        category: row.product.category.clone(),
        caliber: row.product.caliber.clone(),
        grain_weight: row.product.grain_weight,
        round_count: row.product.round_count,
        description: row.product.description.clone(),
        alternate_identifiers,
    }
}

/// Walk the list once, keeping only the index of each key's last
/// occurrence (SPEC_FULL §4.6.1). Returns the surviving rows in original
/// relative order, plus the count of dropped earlier duplicates.
fn dedup_last_row_wins(products: Vec<ParsedProduct>) -> (Vec<ResolvedRow>, u64) {
    let resolved: Vec<(String, crate::identity::ResolvedIdentity, ParsedProduct)> = products
        .into_iter()
        .map(|p| {
            let identity = IdentityResolver::resolve(&p);
            (identity.canonical_key.clone(), identity, p)
        })
        .collect();

    let mut last_index: HashMap<String, usize> = HashMap::new();
    for (i, (key, _, _)) in resolved.iter().enumerate() {
        last_index.insert(key.clone(), i);
    }

    let mut duplicate_count = 0u64;
    let mut rows = Vec::with_capacity(last_index.len());
    for (i, (key, identity, product)) in resolved.into_iter().enumerate() {
        if last_index.get(&key) == Some(&i) {
            rows.push(ResolvedRow {
                product,
                identity_key: identity.canonical_key,
                canonical_type: identity.canonical_type,
                used_url_hash_fallback: identity.used_url_hash_fallback,
                alternates: identity.alternates,
            });
        } else {
            duplicate_count += 1;
        }
    }

    (rows, duplicate_count)
}

/// SHA-256 of `(price, currency, originalPrice)` (SPEC_FULL §4.6.2 step 6).
pub fn price_signature(price: Decimal, currency: &str, original_price: Option<Decimal>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(price.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(currency.as_bytes());
    hasher.update(b"|");
    hasher.update(original_price.map(|p| p.to_string()).unwrap_or_default().as_bytes());
    hex::encode(hasher.finalize())
}

/// Alert detection rules (SPEC_FULL §4.6.3), evaluated against the
/// pre-update cache entry.
#[allow(clippy::too_many_arguments)]
fn classify_alert(
    canonical_product_id: Option<Uuid>,
    prior: Option<&CachedPrice>,
    new_price: Decimal,
    new_in_stock: bool,
    new_currency: &str,
    skips: &mut AlertSkipCounters,
    jobs: &mut Vec<AlertJob>,
    run_id: Uuid,
) {
    let Some(product_id) = canonical_product_id else {
        skips.null_product_id += 1;
        return;
    };
    let Some(prior) = prior else {
        skips.new_product += 1;
        return;
    };

    let price_drop = !new_currency.is_empty()
        && prior.currency == new_currency
        && prior.price > new_price;
    let currency_mismatch_suppressed = !price_drop && prior.price > new_price;

    let back_in_stock = match prior.in_stock {
        Some(false) => new_in_stock,
        Some(true) => false,
        None => false,
    };
    let unknown_prior_suppressed = prior.in_stock.is_none() && new_in_stock;

    let mut any_alert = false;
    if price_drop {
        jobs.push(AlertJob {
            execution_id: run_id,
            product_id,
            old_price: Some(prior.price),
            new_price: Some(new_price),
            in_stock: None,
        });
        any_alert = true;
    } else if currency_mismatch_suppressed {
        skips.currency_mismatch += 1;
    }

    if back_in_stock {
        jobs.push(AlertJob {
            execution_id: run_id,
            product_id,
            old_price: None,
            new_price: None,
            in_stock: Some(true),
        });
        any_alert = true;
    } else if unknown_prior_suppressed {
        skips.unknown_prior_state += 1;
    }

    let _ = AlertTopic::PriceDrop; // topic selection lives in the job enqueuer

    if !any_alert && !currency_mismatch_suppressed && !unknown_prior_suppressed {
        skips.no_change += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn cached(price: Decimal, currency: &str, in_stock: Option<bool>) -> CachedPrice {
        CachedPrice {
            price_signature_hash: price_signature(price, currency, None),
            created_at: Utc::now(),
            price,
            in_stock,
            currency: currency.to_string(),
        }
    }

    #[test]
    fn price_drop_same_currency_emits_alert() {
        let prior = cached(dec!(29.99), "USD", Some(true));
        let mut skips = AlertSkipCounters::default();
        let mut jobs = Vec::new();
        let pid = Uuid::new_v4();
        classify_alert(Some(pid), Some(&prior), dec!(24.99), true, "USD", &mut skips, &mut jobs, Uuid::new_v4());
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].old_price, Some(dec!(29.99)));
        assert_eq!(jobs[0].new_price, Some(dec!(24.99)));
        assert_eq!(jobs[0].in_stock, None);
    }

    #[test]
    fn currency_mismatch_suppresses_price_drop() {
        let prior = cached(dec!(29.99), "USD", Some(true));
        let mut skips = AlertSkipCounters::default();
        let mut jobs = Vec::new();
        classify_alert(Some(Uuid::new_v4()), Some(&prior), dec!(19.99), true, "CAD", &mut skips, &mut jobs, Uuid::new_v4());
        assert!(jobs.is_empty());
        assert_eq!(skips.currency_mismatch, 1);
    }

    #[test]
    fn back_in_stock_alert_on_stock_only_change() {
        let prior = cached(dec!(29.99), "USD", Some(false));
        let mut skips = AlertSkipCounters::default();
        let mut jobs = Vec::new();
        classify_alert(Some(Uuid::new_v4()), Some(&prior), dec!(29.99), true, "USD", &mut skips, &mut jobs, Uuid::new_v4());
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].in_stock, Some(true));
    }

    #[test]
    fn unknown_prior_stock_state_suppresses_back_in_stock() {
        let prior = cached(dec!(29.99), "USD", None);
        let mut skips = AlertSkipCounters::default();
        let mut jobs = Vec::new();
        classify_alert(Some(Uuid::new_v4()), Some(&prior), dec!(29.99), true, "USD", &mut skips, &mut jobs, Uuid::new_v4());
        assert!(jobs.is_empty());
        assert_eq!(skips.unknown_prior_state, 1);
    }

    #[test]
    fn null_product_id_skips_without_alert() {
        let prior = cached(dec!(29.99), "USD", Some(true));
        let mut skips = AlertSkipCounters::default();
        let mut jobs = Vec::new();
        classify_alert(None, Some(&prior), dec!(19.99), true, "USD", &mut skips, &mut jobs, Uuid::new_v4());
        assert!(jobs.is_empty());
        assert_eq!(skips.null_product_id, 1);
    }

    #[test]
    fn new_product_with_no_prior_entry_skips() {
        let mut skips = AlertSkipCounters::default();
        let mut jobs = Vec::new();
        classify_alert(Some(Uuid::new_v4()), None, dec!(19.99), true, "USD", &mut skips, &mut jobs, Uuid::new_v4());
        assert!(jobs.is_empty());
        assert_eq!(skips.new_product, 1);
    }

    #[test]
    fn no_change_increments_no_change_counter() {
        let prior = cached(dec!(29.99), "USD", Some(true));
        let mut skips = AlertSkipCounters::default();
        let mut jobs = Vec::new();
        classify_alert(Some(Uuid::new_v4()), Some(&prior), dec!(29.99), true, "USD", &mut skips, &mut jobs, Uuid::new_v4());
        assert!(jobs.is_empty());
        assert_eq!(skips.no_change, 1);
    }

    #[test]
    fn dedup_keeps_last_occurrence_and_counts_earlier_duplicates() {
        let row = |name: &str, sku: &str| ParsedProduct {
            name: name.into(),
            url: "https://example.com/item".into(),
            price: dec!(9.99),
            network_item_id: None,
            sku: Some(sku.into()),
            upc: None,
            brand: None,
            category: None,
            caliber: Some("9mm".into()),
            grain_weight: None,
            round_count: None,
            description: None,
            image_url: None,
            in_stock: true,
            original_price: None,
            currency: "USD".into(),
        };

        let products = vec![row("First", "SKU-1"), row("Second", "SKU-1"), row("Third", "SKU-1")];
        let (rows, dup_count) = dedup_last_row_wins(products);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].product.name, "Third");
        assert_eq!(dup_count, 2);
    }

    #[test]
    fn price_signature_is_stable_for_same_inputs() {
        let a = price_signature(dec!(19.99), "USD", Some(dec!(24.99)));
        let b = price_signature(dec!(19.99), "USD", Some(dec!(24.99)));
        assert_eq!(a, b);
        assert_ne!(a, price_signature(dec!(19.98), "USD", Some(dec!(24.99))));
    }

    proptest! {
        /// Same `(price, currency, originalPrice)` always hashes the same
        /// way, and changing any single field changes the signature.
        #[test]
        fn price_signature_is_stable_across_arbitrary_inputs(
            cents in 0i64..1_000_000,
            original_cents in 0i64..1_000_000,
            currency_idx in 0usize..3,
        ) {
            let currency = ["USD", "CAD", "EUR"][currency_idx];
            let price = Decimal::new(cents, 2);
            let original = Decimal::new(original_cents, 2);

            let a = price_signature(price, currency, Some(original));
            let b = price_signature(price, currency, Some(original));
            prop_assert_eq!(a.clone(), b);

            if cents != 0 {
                let bumped = Decimal::new(cents - 1, 2);
                prop_assert_ne!(a, price_signature(bumped, currency, Some(original)));
            }
        }
    }
}
