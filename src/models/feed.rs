//! Feed configuration: one retailer's catalog source.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a [`Feed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FeedStatus {
    Draft,
    Enabled,
    Disabled,
    Paused,
}

/// Remote transport used to fetch a feed's file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Transport {
    Sftp,
    PlainFtp,
}

/// Compression applied to the downloaded file, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Compression {
    None,
    Gzip,
}

impl Default for Compression {
    fn default() -> Self {
        Self::None
    }
}

/// Remote connection details for a feed. Credentials are stored as opaque
/// ciphertext; decryption happens once per run inside the worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConnection {
    pub transport: Transport,
    pub host: String,
    pub port: u16,
    pub path: String,
    pub username: String,
    pub password_ciphertext: String,
}

impl FeedConnection {
    pub fn default_port(transport: Transport) -> u16 {
        match transport {
            Transport::Sftp => 22,
            Transport::PlainFtp => 21,
        }
    }
}

/// The change-detection triple memoized per feed so unchanged downloads can
/// be skipped. Written only after a genuinely successful run (see
/// `Orchestrator::finalize`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChangeDetectionMemo {
    pub last_remote_mtime: Option<DateTime<Utc>>,
    pub last_remote_size: Option<i64>,
    pub last_content_hash: Option<String>,
}

/// Configuration of one retailer's catalog source.
///
/// Invariant: `feed_lock_id` is unique per feed and stable for the feed's
/// lifetime (it is the key used by the advisory lock).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feed {
    pub id: Uuid,
    pub source_id: Uuid,
    pub retailer_id: Uuid,
    pub status: FeedStatus,
    pub connection: FeedConnection,
    pub compression: Compression,
    pub expiry_hours: i64,
    pub schedule_frequency_hours: i64,
    pub max_row_count: usize,
    pub max_file_size_bytes: u64,
    pub feed_lock_id: i64,
    pub change_detection: ChangeDetectionMemo,
    pub consecutive_failures: u32,
    pub manual_run_pending: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
}

impl Feed {
    /// A scheduled trigger may run this feed only when both enabled and due.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == FeedStatus::Enabled
            && self.next_run_at.map(|at| now >= at).unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_ports_match_spec() {
        assert_eq!(FeedConnection::default_port(Transport::Sftp), 22);
        assert_eq!(FeedConnection::default_port(Transport::PlainFtp), 21);
    }

    #[test]
    fn feed_is_not_due_before_next_run_at() {
        let mut feed = sample_feed();
        let now = Utc::now();
        feed.next_run_at = Some(now + chrono::Duration::hours(1));
        assert!(!feed.is_due(now));
    }

    #[test]
    fn feed_is_due_with_no_prior_run() {
        let mut feed = sample_feed();
        feed.next_run_at = None;
        assert!(feed.is_due(Utc::now()));
    }

    #[test]
    fn disabled_feed_is_never_due() {
        let mut feed = sample_feed();
        feed.status = FeedStatus::Disabled;
        feed.next_run_at = None;
        assert!(!feed.is_due(Utc::now()));
    }

    fn sample_feed() -> Feed {
        Feed {
            id: Uuid::new_v4(),
            source_id: Uuid::new_v4(),
            retailer_id: Uuid::new_v4(),
            status: FeedStatus::Enabled,
            connection: FeedConnection {
                transport: Transport::Sftp,
                host: "feeds.example.com".into(),
                port: 22,
                path: "/out/catalog.csv".into(),
                username: "acme".into(),
                password_ciphertext: "enc:...".into(),
            },
            compression: Compression::None,
            expiry_hours: 72,
            schedule_frequency_hours: 24,
            max_row_count: 200_000,
            max_file_size_bytes: 500 * 1024 * 1024,
            feed_lock_id: 42,
            change_detection: ChangeDetectionMemo::default(),
            consecutive_failures: 0,
            manual_run_pending: false,
            last_run_at: None,
            next_run_at: None,
        }
    }
}
