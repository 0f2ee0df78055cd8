//! Domain error taxonomy (SPEC_FULL §7/§12).
//!
//! Library code returns typed [`FeedError`]; the classification policy
//! (`classify`) is applied exactly once, centrally, at the worker's
//! finalize step (see `crate::orchestrator`).

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Retry/surface policy for a failed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    /// Retry per queue policy: timeouts, connection resets, 5xx, unknown.
    Transient,
    /// Discard the job, mark the run FAILED: parse failures, bad format,
    /// file-not-found raised as an error, TOO_MANY_ROWS.
    Permanent,
    /// Discard the job, surface to the operator: bad credentials, missing
    /// encryption key, 401/403.
    Config,
}

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("parse error: {message}")]
    Parse { message: String },

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("configuration error: {message}")]
    Config { message: String },

    #[error("too many rows: read {read}, limit {limit}")]
    TooManyRows { read: usize, limit: usize },

    #[error("validation failure: {message}")]
    Validation { message: String },
}

impl FeedError {
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn parse<S: Into<String>>(message: S) -> Self {
        Self::Parse {
            message: message.into(),
        }
    }

    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Stable machine-readable code, used on `FeedRun::failure_code`.
    pub fn code(&self) -> &'static str {
        match self {
            FeedError::Fetch(e) => e.code(),
            FeedError::Parse { .. } => "PARSE_FAILURE",
            FeedError::Store(e) => e.code(),
            FeedError::Config { .. } => "CONFIG_ERROR",
            FeedError::TooManyRows { .. } => "TOO_MANY_ROWS",
            FeedError::Validation { .. } => "VALIDATION_FAILURE",
        }
    }

    /// Classify this error per the SPEC_FULL §7 taxonomy. Centralizing this
    /// in one function means the policy only has to be right once.
    pub fn classify(&self) -> FailureKind {
        match self {
            FeedError::Fetch(e) => e.classify(),
            FeedError::Parse { .. } => FailureKind::Permanent,
            FeedError::Store(e) => e.classify(),
            FeedError::Config { .. } => FailureKind::Config,
            FeedError::TooManyRows { .. } => FailureKind::Permanent,
            FeedError::Validation { .. } => FailureKind::Permanent,
        }
    }
}

/// Errors surfaced by `crate::fetcher`.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("connection failed: {message}")]
    Connection { message: String },

    #[error("authentication failed: {message}")]
    Auth { message: String },

    #[error("file not found: {path}")]
    NotFound { path: String },

    #[error("remote file exceeds max size: {actual} > {limit} bytes")]
    TooLarge { actual: u64, limit: u64 },

    #[error("plain FTP is disabled by policy")]
    PlainFtpDisabled,

    #[error("transport error: {message}")]
    Other { message: String },
}

impl FetchError {
    pub fn code(&self) -> &'static str {
        match self {
            FetchError::Connection { .. } => "CONNECTION_ERROR",
            FetchError::Auth { .. } => "AUTH_ERROR",
            FetchError::NotFound { .. } => "FILE_NOT_FOUND",
            FetchError::TooLarge { .. } => "FILE_TOO_LARGE",
            FetchError::PlainFtpDisabled => "PLAIN_FTP_DISABLED",
            FetchError::Other { .. } => "TRANSPORT_ERROR",
        }
    }

    pub fn classify(&self) -> FailureKind {
        match self {
            FetchError::Connection { .. } => FailureKind::Transient,
            FetchError::Auth { .. } => FailureKind::Config,
            // Thrown (not the fetcher's own skipped=FILE_NOT_FOUND path).
            FetchError::NotFound { .. } => FailureKind::Permanent,
            FetchError::TooLarge { .. } => FailureKind::Permanent,
            FetchError::PlainFtpDisabled => FailureKind::Config,
            FetchError::Other { message } => classify_by_message(message),
        }
    }
}

/// Errors surfaced by `crate::store`.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {message}")]
    Database { message: String },

    #[error("sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

impl StoreError {
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::Database { .. } => "DATABASE_ERROR",
            StoreError::Sqlx(_) => "DATABASE_ERROR",
        }
    }

    pub fn classify(&self) -> FailureKind {
        match self {
            StoreError::Database { message } => classify_by_message(message),
            StoreError::Sqlx(_) => FailureKind::Transient,
        }
    }
}

/// Classify a known set of network error codes per SPEC_FULL §7. Applied
/// before falling back to substring matching on the message.
pub fn classify_network_code(code: &str) -> Option<FailureKind> {
    match code {
        "ECONNRESET" | "ETIMEDOUT" | "EPIPE" | "ECONNREFUSED" | "EAI_AGAIN" | "ENOTFOUND" => {
            Some(FailureKind::Transient)
        }
        _ => None,
    }
}

/// Classify an HTTP-like status code per SPEC_FULL §7.
pub fn classify_status_code(status: u16) -> Option<FailureKind> {
    match status {
        401 | 403 => Some(FailureKind::Config),
        404 => Some(FailureKind::Permanent),
        408 | 429 => Some(FailureKind::Transient),
        500..=599 => Some(FailureKind::Transient),
        _ => None,
    }
}

/// Fallback substring classification for free-form error messages.
/// Unknown messages default to `Transient` — safer to retry.
pub fn classify_by_message(message: &str) -> FailureKind {
    let lower = message.to_lowercase();
    if lower.contains("timeout") {
        return FailureKind::Transient;
    }
    if lower.contains("authentication") || lower.contains("permission denied") {
        return FailureKind::Config;
    }
    if lower.contains("no such file") || lower.contains("not found") {
        return FailureKind::Permanent;
    }
    if lower.contains("parse") || lower.contains("invalid") || lower.contains("format") {
        return FailureKind::Permanent;
    }
    FailureKind::Transient
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_codes_classify_transient() {
        for code in ["ECONNRESET", "ETIMEDOUT", "EPIPE", "ECONNREFUSED", "EAI_AGAIN", "ENOTFOUND"] {
            assert_eq!(classify_network_code(code), Some(FailureKind::Transient));
        }
        assert_eq!(classify_network_code("EWEIRD"), None);
    }

    #[test]
    fn status_codes_classify_per_spec() {
        assert_eq!(classify_status_code(401), Some(FailureKind::Config));
        assert_eq!(classify_status_code(403), Some(FailureKind::Config));
        assert_eq!(classify_status_code(404), Some(FailureKind::Permanent));
        assert_eq!(classify_status_code(408), Some(FailureKind::Transient));
        assert_eq!(classify_status_code(429), Some(FailureKind::Transient));
        assert_eq!(classify_status_code(503), Some(FailureKind::Transient));
        assert_eq!(classify_status_code(200), None);
    }

    #[test]
    fn message_substrings_classify_per_spec() {
        assert_eq!(classify_by_message("connection timeout after 30s"), FailureKind::Transient);
        assert_eq!(classify_by_message("Authentication failed for user"), FailureKind::Config);
        assert_eq!(classify_by_message("permission denied reading file"), FailureKind::Config);
        assert_eq!(classify_by_message("no such file or directory"), FailureKind::Permanent);
        assert_eq!(classify_by_message("invalid record format"), FailureKind::Permanent);
        assert_eq!(classify_by_message("something weird happened"), FailureKind::Transient);
    }

    #[test]
    fn too_many_rows_is_permanent() {
        let err = FeedError::TooManyRows { read: 10, limit: 5 };
        assert_eq!(err.classify(), FailureKind::Permanent);
        assert_eq!(err.code(), "TOO_MANY_ROWS");
    }

    #[test]
    fn fetch_not_found_thrown_is_permanent_not_skipped() {
        let err = FeedError::Fetch(FetchError::NotFound { path: "/out/catalog.csv".into() });
        assert_eq!(err.classify(), FailureKind::Permanent);
    }

    #[test]
    fn plain_ftp_disabled_is_config() {
        let err = FeedError::Fetch(FetchError::PlainFtpDisabled);
        assert_eq!(err.classify(), FailureKind::Config);
        assert_eq!(err.code(), "PLAIN_FTP_DISABLED");
    }
}
