//! `FeedRun` and `RunError`: one invocation of the pipeline for a feed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::FailureKind;

/// What caused a job to be enqueued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunTrigger {
    Scheduled,
    Manual,
    ManualPending,
    AdminTest,
    Retry,
}

impl RunTrigger {
    /// Triggers that are allowed to run a `DISABLED` feed.
    pub fn bypasses_disabled(self) -> bool {
        matches!(self, RunTrigger::Manual | RunTrigger::AdminTest)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
}

/// Why a run completed without doing any work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SkippedReason {
    UnchangedMtime,
    UnchangedHash,
    FileNotFound,
}

/// Telemetry counters accumulated over the life of one run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunCounters {
    pub rows_read: u64,
    pub rows_parsed: u64,
    pub products_upserted: u64,
    pub prices_written: u64,
    pub products_promoted: u64,
    pub products_rejected: u64,
    pub duplicate_key_count: u64,
    pub url_hash_fallback_count: u64,
    pub error_count: u64,
}

/// Circuit-breaker inputs/outputs recorded on the run for audit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CircuitBreakerMetrics {
    pub active_count_before: i64,
    pub seen_success_count: i64,
    pub would_expire_count: i64,
    pub expiry_blocked: bool,
    pub expiry_blocked_reason: Option<String>,
}

/// One invocation of the pipeline for a feed.
///
/// Invariant: a run in `Running` is uniquely owned by one worker holding the
/// feed's advisory lock. Terminal runs (`Succeeded`/`Failed`) are immutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedRun {
    pub id: Uuid,
    pub feed_id: Uuid,
    pub source_id: Uuid,
    pub trigger: RunTrigger,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub counters: RunCounters,
    pub breaker: CircuitBreakerMetrics,
    pub skipped_reason: Option<SkippedReason>,
    pub failure_kind: Option<FailureKind>,
    pub failure_code: Option<String>,
    pub failure_message: Option<String>,
    pub correlation_id: Uuid,
}

impl FeedRun {
    pub fn new(feed_id: Uuid, source_id: Uuid, trigger: RunTrigger, t0: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            feed_id,
            source_id,
            trigger,
            status: RunStatus::Running,
            started_at: t0,
            finished_at: None,
            duration_ms: None,
            counters: RunCounters::default(),
            breaker: CircuitBreakerMetrics::default(),
            skipped_reason: None,
            failure_kind: None,
            failure_code: None,
            failure_message: None,
            correlation_id: Uuid::new_v4(),
        }
    }

    /// Per SPEC_FULL §4.7/§9: the circuit breaker's denominator for
    /// `urlHashPercentage` is `productsUpserted`, not `rowsParsed`.
    pub fn total_products_processed(&self) -> i64 {
        self.counters.products_upserted as i64
    }
}

/// Per-row diagnostic captured during a run. Capped per run by the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunError {
    pub run_id: Uuid,
    pub code: String,
    pub message: String,
    pub row_number: Option<u64>,
    pub sample_payload: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_and_admin_test_bypass_disabled() {
        assert!(RunTrigger::Manual.bypasses_disabled());
        assert!(RunTrigger::AdminTest.bypasses_disabled());
        assert!(!RunTrigger::Scheduled.bypasses_disabled());
        assert!(!RunTrigger::Retry.bypasses_disabled());
        assert!(!RunTrigger::ManualPending.bypasses_disabled());
    }

    #[test]
    fn total_products_processed_is_upserted_count() {
        let mut run = FeedRun::new(Uuid::new_v4(), Uuid::new_v4(), RunTrigger::Scheduled, Utc::now());
        run.counters.rows_parsed = 500;
        run.counters.products_upserted = 480;
        assert_eq!(run.total_products_processed(), 480);
    }
}
