//! Worker Orchestrator (SPEC_FULL §4.8): the single job entrypoint that
//! drives one feed run's state machine end to end — lock, fetch, parse,
//! process, promote, finalize.
//!
//! Concurrency is modeled the straight-line way §9 asks for: one spawned
//! `tokio` task per job, every database/transport call an `.await`
//! suspension point, no callback chains. A bounded `Semaphore` caps
//! in-flight jobs; a token-bucket limiter paces how fast new jobs start.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::circuit_breaker::{BreakerDecision, CircuitBreaker, SpikeInputs, SpikeMetrics};
use crate::errors::{FailureKind, FeedError};
use crate::fetcher::{FetchOutcome, Fetcher, FetcherPolicy, SkipReason};
use crate::lock::AdvisoryLockGuard;
use crate::models::{
    CircuitBreakerMetrics, Feed, FeedRun, FeedStatus, IngestJob, RunStatus, RunTrigger,
};
use crate::notify::{NotificationEvent, Notifier};
use crate::parser::Parser;
use crate::processor::{Processor, ProcessorConfig};
use crate::store::FeedStore;

const AUTO_DISABLE_THRESHOLD: u32 = 3;

/// Why `process` returned without driving a full run. Distinct from an
/// `Err`, which means the job should be retried/discarded per its
/// classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Feed is `DRAFT`, or `DISABLED` and the trigger may not bypass it.
    SilentSkip,
    /// A retry job whose run is no longer `RUNNING` (already finalized by
    /// another attempt).
    RetryNoLongerRunning,
    /// Lock held by another run; for manual triggers this sets
    /// `manualRunPending` instead of dropping the job.
    LockBusy,
    RanToCompletion,
}

pub struct Orchestrator<S: FeedStore> {
    store: Arc<S>,
    pool: sqlx::PgPool,
    notifier: Notifier,
    semaphore: Arc<Semaphore>,
    rate_limiter: Arc<TokenBucket>,
    fetcher_policy: FetcherPolicy,
    processor_config: ProcessorConfig,
}

impl<S: FeedStore + 'static> Orchestrator<S> {
    pub fn new(
        store: Arc<S>,
        pool: sqlx::PgPool,
        notifier: Notifier,
        worker_pool_size: usize,
        job_rate_limit_per_minute: u32,
        fetcher_policy: FetcherPolicy,
        processor_config: ProcessorConfig,
    ) -> Self {
        Self {
            store,
            pool,
            notifier,
            semaphore: Arc::new(Semaphore::new(worker_pool_size)),
            rate_limiter: Arc::new(TokenBucket::new(job_rate_limit_per_minute)),
            fetcher_policy,
            processor_config,
        }
    }

    /// Acquire a concurrency permit and a rate-limit token, then drive one
    /// job's state machine to completion. Returns once the run (or skip)
    /// is fully finalized.
    pub async fn process(&self, job: IngestJob) -> Result<ProcessOutcome, FeedError> {
        self.rate_limiter.acquire().await;
        let _permit = self
            .semaphore
            .acquire()
            .await
            .expect("semaphore is never closed");

        self.run_job(job).await
    }

    async fn run_job(&self, job: IngestJob) -> Result<ProcessOutcome, FeedError> {
        let t0 = Utc::now();

        let Some(feed) = self.store.get_feed(job.feed_id).await.map_err(FeedError::Store)? else {
            warn!(feed_id = %job.feed_id, "job referenced unknown feed, dropping");
            return Ok(ProcessOutcome::SilentSkip);
        };

        if feed.status == FeedStatus::Draft {
            return Ok(ProcessOutcome::SilentSkip);
        }
        if feed.status == FeedStatus::Disabled && !job.trigger.bypasses_disabled() {
            return Ok(ProcessOutcome::SilentSkip);
        }

        let (run, lock) = if let Some(run_id) = job.run_id {
            match self.resume_retry(run_id, job.feed_lock_id).await? {
                Some(pair) => pair,
                None => return Ok(ProcessOutcome::RetryNoLongerRunning),
            }
        } else {
            match self.start_fresh(&feed, job.id, job.trigger, t0).await? {
                Some(pair) => pair,
                None => {
                    if matches!(job.trigger, RunTrigger::Manual | RunTrigger::ManualPending) {
                        if let Err(err) = self.store.set_manual_run_pending(feed.id).await {
                            warn!(feed_id = %feed.id, error = %err, "failed to set manualRunPending on lock-busy");
                        }
                    }
                    return Ok(ProcessOutcome::LockBusy);
                }
            }
        };

        let outcome = self.drive_run(&feed, run, t0).await;

        // Read manualRunPending (and the post-finalize status, in case
        // finalize just auto-disabled the feed) while the lock is still
        // held, per SPEC_FULL §5(b)'s critical ordering.
        let (pending, status_after) = self.read_manual_run_pending_locked(feed.id).await;
        lock.release().await;

        if pending && status_after == Some(FeedStatus::Enabled) {
            let follow_up = IngestJob::new(feed.id, RunTrigger::ManualPending);
            if let Err(err) = self.store.enqueue_ingest_job(&follow_up).await {
                warn!(feed_id = %feed.id, error = %err, "failed to enqueue manual-pending follow-up job");
            } else if let Err(err) = self.store.clear_manual_run_pending(feed.id).await {
                warn!(feed_id = %feed.id, error = %err, "failed to clear manualRunPending after follow-up enqueue");
            }
        }

        outcome.map(|()| ProcessOutcome::RanToCompletion)
    }

    async fn resume_retry(
        &self,
        run_id: Uuid,
        feed_lock_id: Option<i64>,
    ) -> Result<Option<(FeedRun, AdvisoryLockGuard)>, FeedError> {
        let Some(lock_id) = feed_lock_id else {
            warn!(run_id = %run_id, "retry job missing feedLockId, dropping");
            return Ok(None);
        };

        match AdvisoryLockGuard::try_acquire(&self.pool, lock_id)
            .await
            .map_err(|e| FeedError::Store(e.into()))?
        {
            Some(lock) => {
                let run = self.load_running_run(run_id).await?;
                match run {
                    Some(run) => Ok(Some((run, lock))),
                    None => {
                        lock.release().await;
                        Ok(None)
                    }
                }
            }
            None => Ok(None),
        }
    }

    async fn load_running_run(&self, run_id: Uuid) -> Result<Option<FeedRun>, FeedError> {
        self.store
            .load_run(run_id)
            .await
            .map_err(FeedError::Store)
            .map(|run| run.filter(|r| r.status == RunStatus::Running))
    }

    async fn start_fresh(
        &self,
        feed: &Feed,
        job_id: Option<i64>,
        trigger: RunTrigger,
        t0: DateTime<Utc>,
    ) -> Result<Option<(FeedRun, AdvisoryLockGuard)>, FeedError> {
        let lock = AdvisoryLockGuard::try_acquire(&self.pool, feed.feed_lock_id)
            .await
            .map_err(|e| FeedError::Store(e.into()))?;

        let Some(lock) = lock else {
            return Ok(None);
        };

        // No throwable I/O is permitted between lock acquire and this
        // create_run call, per SPEC_FULL §5(a) — this is that one
        // mandatory step.
        let run = FeedRun::new(feed.id, feed.source_id, trigger, t0);
        self.store.create_run(&run).await.map_err(FeedError::Store)?;

        // Persist {runId, feedLockId} back onto the originating job row so
        // a redelivery of this exact job (e.g. after a worker crash) can
        // resume this run instead of creating a second one (SPEC_FULL
        // §5a/§8). Jobs built in-process (the `run` CLI subcommand) carry
        // no row id and have nothing to attach to.
        if let Some(job_id) = job_id {
            if let Err(err) = self
                .store
                .attach_run_to_job(job_id, run.id, feed.feed_lock_id)
                .await
            {
                warn!(job_id, run_id = %run.id, error = %err, "failed to attach run to job row");
            }
        }

        Ok(Some((run, lock)))
    }

    async fn read_manual_run_pending_locked(&self, feed_id: Uuid) -> (bool, Option<FeedStatus>) {
        match self.store.get_feed(feed_id).await {
            Ok(Some(feed)) => (feed.manual_run_pending, Some(feed.status)),
            Ok(None) => (false, None),
            Err(err) => {
                warn!(feed_id = %feed_id, error = %err, "failed to read manualRunPending while holding lock");
                (false, None)
            }
        }
    }

    async fn drive_run(&self, feed: &Feed, mut run: FeedRun, t0: DateTime<Utc>) -> Result<(), FeedError> {
        match self.execute(feed, &mut run, t0).await {
            Ok(memo) => {
                self.finalize_succeeded(feed, &mut run, t0, memo).await;
                Ok(())
            }
            Err(err) => {
                self.finalize_failed(feed, &mut run, &err).await;
                Err(err)
            }
        }
    }

    /// Returns `Some(memo)` when a new file was actually downloaded and
    /// processed (the caller memoizes it); `None` when the run was skipped
    /// (change detection found nothing new, so the existing memo stands).
    async fn execute(
        &self,
        feed: &Feed,
        run: &mut FeedRun,
        t0: DateTime<Utc>,
    ) -> Result<Option<crate::models::ChangeDetectionMemo>, FeedError> {
        let outcome = Fetcher::download(feed, &self.fetcher_policy)
            .await
            .map_err(FeedError::Fetch)?;

        let (content, mtime, size, content_hash) = match outcome {
            FetchOutcome::Skipped(reason) => {
                run.skipped_reason = Some(match reason {
                    SkipReason::UnchangedMtime => crate::models::SkippedReason::UnchangedMtime,
                    SkipReason::UnchangedHash => crate::models::SkippedReason::UnchangedHash,
                    SkipReason::FileNotFound => crate::models::SkippedReason::FileNotFound,
                });
                return Ok(None);
            }
            FetchOutcome::Downloaded {
                content,
                mtime,
                size,
                content_hash,
            } => (content, mtime, size, content_hash),
        };

        let parsed = Parser::parse(&content, feed.max_row_count, feed.id)?;
        run.counters.rows_read = parsed.rows_read;
        run.counters.rows_parsed = parsed.rows_parsed;

        let processor = Processor::new(self.store.as_ref(), self.processor_config);
        let proc_outcome = processor
            .process(run.id, feed.source_id, feed.retailer_id, t0, parsed.products)
            .await?;

        run.counters.products_upserted = proc_outcome.products_upserted;
        run.counters.prices_written = proc_outcome.prices_written;
        run.counters.products_rejected = proc_outcome.products_rejected;
        run.counters.duplicate_key_count = proc_outcome.duplicate_key_count;
        run.counters.url_hash_fallback_count = proc_outcome.url_hash_fallback_count;
        run.counters.error_count = proc_outcome.error_count;

        if run.counters.rows_read > 0 && run.counters.products_upserted == 0 {
            return Err(FeedError::validation(
                "parsed rows were read but no products were upserted",
            ));
        }

        let expiry_threshold = t0 - chrono::Duration::hours(feed.expiry_hours);
        let counts = self
            .store
            .circuit_breaker_counts(feed.source_id, run.id, expiry_threshold)
            .await
            .map_err(FeedError::Store)?;

        let spike_inputs = SpikeInputs {
            active_count_before: counts.active_count_before,
            seen_success_count: counts.seen_success_count,
            url_hash_fallback_count: proc_outcome.url_hash_fallback_count,
            total_rows: run.total_products_processed().max(0) as u64,
        };
        let metrics = SpikeMetrics::compute(spike_inputs);
        let decision = CircuitBreaker::decide(&metrics);

        run.breaker = CircuitBreakerMetrics {
            active_count_before: metrics.active_count_before as i64,
            seen_success_count: spike_inputs.seen_success_count as i64,
            would_expire_count: metrics.would_expire_count as i64,
            expiry_blocked: decision == BreakerDecision::Block,
            expiry_blocked_reason: if decision == BreakerDecision::Block {
                Some(format!(
                    "wouldExpireCount={} activeCountBefore={} expiryPct={:.1} urlHashPct={:.1}",
                    metrics.would_expire_count,
                    metrics.active_count_before,
                    metrics.expiry_percentage,
                    metrics.url_hash_percentage
                ))
            } else {
                None
            },
        };

        if decision == BreakerDecision::Pass {
            let promoted = self
                .store
                .promote_seen(run.id, t0)
                .await
                .map_err(FeedError::Store)?;
            run.counters.products_promoted = promoted;
        } else {
            self.notifier.notify(NotificationEvent::CircuitBreakerTriggered {
                feed_id: feed.id,
                run_id: run.id,
                would_expire_count: metrics.would_expire_count,
                active_count_before: metrics.active_count_before,
            });
        }

        Ok(Some(crate::models::ChangeDetectionMemo {
            last_remote_mtime: mtime,
            last_remote_size: Some(size as i64),
            last_content_hash: Some(content_hash),
        }))
    }

    async fn finalize_succeeded(
        &self,
        feed: &Feed,
        run: &mut FeedRun,
        t0: DateTime<Utc>,
        change_detection: Option<crate::models::ChangeDetectionMemo>,
    ) {
        run.status = RunStatus::Succeeded;
        run.finished_at = Some(Utc::now());
        run.duration_ms = run
            .finished_at
            .map(|f| (f - run.started_at).num_milliseconds());

        let had_prior_failures = feed.consecutive_failures > 0;

        if let Err(err) = self.store.finalize_run(run).await {
            error!(run_id = %run.id, error = %err, "failed to persist successful run finalize");
        }

        if had_prior_failures && run.skipped_reason.is_none() {
            self.notifier.notify(NotificationEvent::FeedRecovered {
                feed_id: feed.id,
                run_id: run.id,
            });
        }

        let next_run_at = t0 + chrono::Duration::hours(feed.schedule_frequency_hours);
        if let Err(err) = self
            .store
            .reset_failures_and_reschedule(feed.id, next_run_at, change_detection)
            .await
        {
            error!(feed_id = %feed.id, error = %err, "failed to reschedule feed after success");
        }
    }

    async fn finalize_failed(&self, feed: &Feed, run: &mut FeedRun, err: &FeedError) {
        run.status = RunStatus::Failed;
        run.finished_at = Some(Utc::now());
        run.duration_ms = run
            .finished_at
            .map(|f| (f - run.started_at).num_milliseconds());
        let failure_kind = err.classify();
        run.failure_kind = Some(failure_kind);
        run.failure_code = Some(err.code().to_string());
        run.failure_message = Some(err.to_string());

        if let Err(store_err) = self.store.finalize_run(run).await {
            error!(run_id = %run.id, error = %store_err, "failed to persist failed run finalize");
        }

        self.notifier.notify(NotificationEvent::FeedRunFailed {
            feed_id: feed.id,
            run_id: run.id,
            failure_code: run.failure_code.clone().unwrap_or_default(),
            failure_message: run.failure_message.clone().unwrap_or_default(),
            correlation_id: run.correlation_id,
        });

        let consecutive_failures = feed.consecutive_failures + 1;
        let auto_disable = consecutive_failures >= AUTO_DISABLE_THRESHOLD;

        if let Err(store_err) = self
            .store
            .record_failure(feed.id, consecutive_failures, auto_disable)
            .await
        {
            error!(feed_id = %feed.id, error = %store_err, "failed to record consecutive failure");
        }

        if auto_disable {
            self.notifier.notify(NotificationEvent::FeedAutoDisabled {
                feed_id: feed.id,
                consecutive_failures,
            });
            info!(feed_id = %feed.id, consecutive_failures, "feed auto-disabled after consecutive failures");
        } else if failure_kind == FailureKind::Transient {
            // TRANSIENT failures are retried per queue policy (SPEC_FULL
            // §7); PERMANENT/CONFIG failures are discarded by simply not
            // re-enqueuing. This is a fresh attempt (its own FeedRun), not
            // a resume of the failed one — `runId`-resume is reserved for
            // a worker crash redelivering the very same job row.
            let retry_job = IngestJob::new(feed.id, RunTrigger::Retry);
            if let Err(err) = self.store.enqueue_ingest_job(&retry_job).await {
                warn!(feed_id = %feed.id, run_id = %run.id, error = %err, "failed to enqueue retry job after transient failure");
            }
        }
    }

    /// Poll `due_feeds` and enqueue one ingest job per due feed. Called by
    /// the scheduler loop in the worker binary.
    pub async fn enqueue_due_jobs(&self, now: DateTime<Utc>) -> Result<u64, FeedError> {
        let feeds = self.store.due_feeds(now).await.map_err(FeedError::Store)?;
        let mut enqueued = 0u64;
        for feed in feeds {
            let job = IngestJob::new(feed.id, RunTrigger::Scheduled);
            if let Err(err) = self.store.enqueue_ingest_job(&job).await {
                warn!(feed_id = %feed.id, error = %err, "failed to enqueue scheduled job");
                continue;
            }
            enqueued += 1;
        }
        Ok(enqueued)
    }
}

/// A simple token-bucket rate limiter in the same spirit as the
/// industry-standard governor algorithm: capacity refills continuously at
/// `rate / minute`, callers wait until a token is available.
struct TokenBucket {
    state: Mutex<BucketState>,
    rate_per_minute: u32,
}

struct BucketState {
    tokens: f64,
    last_refill: std::time::Instant,
}

impl TokenBucket {
    fn new(rate_per_minute: u32) -> Self {
        Self {
            state: Mutex::new(BucketState {
                tokens: rate_per_minute as f64,
                last_refill: std::time::Instant::now(),
            }),
            rate_per_minute: rate_per_minute.max(1),
        }
    }

    async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock();
                let now = std::time::Instant::now();
                let elapsed = now.duration_since(state.last_refill).as_secs_f64();
                let refill = elapsed * (self.rate_per_minute as f64 / 60.0);
                state.tokens = (state.tokens + refill).min(self.rate_per_minute as f64);
                state.last_refill = now;

                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    None
                } else {
                    let deficit = 1.0 - state.tokens;
                    let secs = deficit / (self.rate_per_minute as f64 / 60.0);
                    Some(Duration::from_secs_f64(secs.max(0.01)))
                }
            };

            match wait {
                None => return,
                Some(duration) => tokio::time::sleep(duration).await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn token_bucket_allows_immediate_burst_up_to_capacity() {
        let bucket = TokenBucket::new(5);
        for _ in 0..5 {
            tokio::time::timeout(Duration::from_millis(50), bucket.acquire())
                .await
                .expect("should not need to wait within initial capacity");
        }
    }
}
