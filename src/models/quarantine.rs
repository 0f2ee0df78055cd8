//! `QuarantinedRecord`: rows rejected for missing trust-critical fields.

use serde_json::Value;
use uuid::Uuid;

/// A product rejected for missing a trust-critical field (e.g. caliber).
///
/// Invariant: `(feed_id, match_key)` is unique; each run overwrites the raw
/// payload and blocking error codes with the latest observation.
#[derive(Debug, Clone)]
pub struct QuarantinedRecord {
    pub feed_id: Uuid,
    pub match_key: String,
    pub raw_payload: Value,
    pub blocking_error_codes: Vec<String>,
}
