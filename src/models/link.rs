//! `ProductLink`: the mapping from a source product to a canonical product.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LinkStatus {
    Unmatched,
    Created,
    Matched,
    NeedsReview,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchType {
    Upc,
    Manual,
    None,
}

/// `(source_product_id -> canonical product_id)`.
///
/// Write discipline (see `crate::processor`): a WHERE-guarded upsert never
/// overwrites `Created`, and never changes `Matched` to a different
/// `product_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductLink {
    pub source_product_id: Uuid,
    pub product_id: Option<Uuid>,
    pub status: LinkStatus,
    pub match_type: MatchType,
    pub confidence: Option<f64>,
    pub resolver_version: String,
    pub evidence: Option<Value>,
}
