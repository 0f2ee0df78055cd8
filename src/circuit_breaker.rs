//! Circuit Breaker (SPEC_FULL §4.7): decide whether a run's "seen" set is
//! safe to promote to "seen successfully", protecting against a feed that
//! silently shrank (stale credentials, truncated upstream export, wrong
//! file swapped in).
//!
//! A pure decision function over counts the processor has already
//! collected, mirroring the teacher's preference for small, independently
//! testable free functions at a pipeline's decision points.

/// Inputs the breaker needs, all counted by the processor during a run.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpikeInputs {
    /// Source products with `last_seen_success_at` set, before this run.
    pub active_count_before: u64,
    /// Distinct source products this run marked seen successfully.
    pub seen_success_count: u64,
    /// Rows resolved via URL-hash fallback (no network item id or SKU).
    pub url_hash_fallback_count: u64,
    /// Total rows processed this run.
    pub total_rows: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerDecision {
    Pass,
    Block,
}

/// Derived metrics, computed once and reused by the decision and by the
/// run's persisted `CircuitBreakerMetrics`.
#[derive(Debug, Clone, Copy)]
pub struct SpikeMetrics {
    pub active_count_before: u64,
    pub would_expire_count: u64,
    pub expiry_percentage: f64,
    pub url_hash_fallback_count: u64,
    pub url_hash_percentage: f64,
}

impl SpikeMetrics {
    pub fn compute(inputs: SpikeInputs) -> Self {
        let would_expire_count = inputs
            .active_count_before
            .saturating_sub(inputs.seen_success_count);

        let expiry_percentage = if inputs.active_count_before == 0 {
            0.0
        } else {
            (would_expire_count as f64 / inputs.active_count_before as f64) * 100.0
        };

        let url_hash_percentage = if inputs.total_rows == 0 {
            0.0
        } else {
            (inputs.url_hash_fallback_count as f64 / inputs.total_rows as f64) * 100.0
        };

        Self {
            active_count_before: inputs.active_count_before,
            would_expire_count,
            expiry_percentage,
            url_hash_fallback_count: inputs.url_hash_fallback_count,
            url_hash_percentage,
        }
    }
}

pub struct CircuitBreaker;

impl CircuitBreaker {
    /// First-match-wins over three rules, in the order SPEC_FULL §4.7
    /// specifies them:
    ///
    /// 1. `wouldExpireCount >= 500` always blocks, regardless of base size.
    /// 2. With a large enough base (`activeCountBefore >= 100`), either a
    ///    sustained expiry rate (`expiryPercentage > 30` and at least 10
    ///    products affected) or heavy URL-hash fallback use
    ///    (`urlHashFallbackCount > 1000` or `urlHashPercentage > 50`)
    ///    blocks.
    /// 3. Otherwise, pass.
    pub fn decide(metrics: &SpikeMetrics) -> BreakerDecision {
        if metrics.would_expire_count >= 500 {
            return BreakerDecision::Block;
        }

        if metrics.active_count_before >= 100 {
            let sustained_expiry = metrics.expiry_percentage > 30.0 && metrics.would_expire_count >= 10;
            let url_hash_spike =
                metrics.url_hash_fallback_count > 1000 || metrics.url_hash_percentage > 50.0;
            if sustained_expiry || url_hash_spike {
                return BreakerDecision::Block;
            }
        }

        BreakerDecision::Pass
    }
}
