//! Wire shapes for the durable job queue (SPEC_FULL §6).

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::run::RunTrigger;

/// A feed-ingestion job. `feed_lock_id` is carried as a decimal string in
/// the wire shape because 64-bit ints are not universally JSON-safe; this
/// type keeps it as `i64` and the queue layer handles the string mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestJob {
    /// The durable queue row's own primary key. `None` for a job that
    /// hasn't been persisted yet (e.g. one built in-process by the `run`
    /// CLI subcommand); `Some` for anything that came back from
    /// `FeedStore::claim_ingest_jobs`, so `start_fresh` has a row to
    /// write `{runId, feedLockId}` back onto.
    pub id: Option<i64>,
    pub feed_id: Uuid,
    pub trigger: RunTrigger,
    pub run_id: Option<Uuid>,
    pub feed_lock_id: Option<i64>,
}

impl IngestJob {
    pub fn new(feed_id: Uuid, trigger: RunTrigger) -> Self {
        Self {
            id: None,
            feed_id,
            trigger,
            run_id: None,
            feed_lock_id: None,
        }
    }

    /// True for a job that is resuming a previously-created run (a retry),
    /// as opposed to one that still needs to create its `FeedRun`.
    pub fn is_retry(&self) -> bool {
        self.run_id.is_some()
    }
}

/// Alert enqueue output (SPEC_FULL §6). No job id is set here: dedup and
/// cooldown are owned by the downstream alerter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertJob {
    pub execution_id: Uuid,
    pub product_id: Uuid,
    pub old_price: Option<Decimal>,
    pub new_price: Option<Decimal>,
    pub in_stock: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertTopic {
    PriceDrop,
    BackInStock,
}

/// Resolver enqueue output (SPEC_FULL §6): sent for source products that
/// could not be matched to a canonical product.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverJob {
    pub source_product_id: Uuid,
    pub reason: ResolverReason,
    pub resolver_version: String,
    pub source_id: Uuid,
    pub identity_key: String,
    pub affiliate_feed_run_id: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResolverReason {
    Ingest,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_job_is_not_a_retry() {
        let job = IngestJob::new(Uuid::new_v4(), RunTrigger::Scheduled);
        assert!(!job.is_retry());
    }

    #[test]
    fn job_with_run_id_is_a_retry() {
        let mut job = IngestJob::new(Uuid::new_v4(), RunTrigger::Retry);
        job.run_id = Some(Uuid::new_v4());
        assert!(job.is_retry());
    }
}
