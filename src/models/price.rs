//! Append-only price/stock history.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PriceType {
    Regular,
    Sale,
}

/// One observed price/stock state for a source product.
///
/// Invariant: a partial unique dedup index on `(source_product_id,
/// price_signature_hash)` silently suppresses rapid duplicate inserts; no
/// other unique constraints apply to this table (it is append-only).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Price {
    pub id: Uuid,
    pub source_product_id: Uuid,
    pub product_id: Option<Uuid>,
    pub retailer_id: Uuid,
    pub price: Decimal,
    pub currency: String,
    pub url: String,
    pub in_stock: Option<bool>,
    pub original_price: Option<Decimal>,
    pub price_type: PriceType,
    pub price_signature_hash: String,
    pub affiliate_feed_run_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub observed_at: DateTime<Utc>,
}

/// The subset of a [`Price`] row needed by the processor's run-local
/// `lastPriceCache` and by alert detection.
#[derive(Debug, Clone)]
pub struct CachedPrice {
    pub price_signature_hash: String,
    pub created_at: DateTime<Utc>,
    pub price: Decimal,
    pub in_stock: Option<bool>,
    pub currency: String,
}
