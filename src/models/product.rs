//! Source-side product identity: `SourceProduct`, its identifiers, and the
//! presence/seen bookkeeping used by the circuit breaker.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kinds of identifier a parsed row may carry. UPC is intentionally never
/// canonical (see `crate::identity`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IdType {
    NetworkItemId,
    Sku,
    Upc,
    UrlHash,
    Url,
}

/// A product as seen in one source (one retailer's feed).
///
/// Invariant: `(source_id, identity_key)` is unique. A single source
/// product may expose multiple alternate identifiers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceProduct {
    pub id: Uuid,
    pub source_id: Uuid,
    pub identity_key: String,
    pub title: String,
    pub url: String,
    pub normalized_url: String,
    pub image_url: Option<String>,
    pub brand: Option<String>,
    pub category: Option<String>,
    pub caliber: Option<String>,
    pub grain_weight: Option<Decimal>,
    pub round_count: Option<i32>,
    pub description: Option<String>,
    pub created_by_run_id: Uuid,
    pub last_updated_by_run_id: Uuid,
}

/// An identifier value that has ever mapped to a [`SourceProduct`].
///
/// Invariant: `(source_product_id, id_type, id_value, namespace)` is unique.
/// At most one canonical identifier per source product per `id_type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceProductIdentifier {
    pub source_product_id: Uuid,
    pub id_type: IdType,
    pub id_value: String,
    pub namespace: String,
    pub is_canonical: bool,
    pub normalized_value: String,
}

/// Per-product freshness. `last_seen_at` is updated every run that observed
/// the row; `last_seen_success_at` is updated only after the circuit
/// breaker passes (the promotion marker).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceProductPresence {
    pub source_product_id: Uuid,
    pub last_seen_at: DateTime<Utc>,
    pub last_seen_success_at: Option<DateTime<Utc>>,
}

/// Per-run observation log. `(run_id, source_product_id)` is unique. Used
/// only for circuit-breaker math and refresh-on-unchanged scenarios.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SourceProductSeen {
    pub run_id: Uuid,
    pub source_product_id: Uuid,
}
