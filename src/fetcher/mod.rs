//! Fetcher (SPEC_FULL §4.3): download a feed's file via SFTP or plain FTP,
//! with change detection and a content hash.
//!
//! The only polymorphism this component needs is transport selection; per
//! SPEC_FULL §9 that is modeled as a tagged enum with one `download` entry
//! point, not a trait-object hierarchy.

mod ftp;
mod sftp;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::io::Read;

use crate::errors::FetchError;
use crate::models::{ChangeDetectionMemo, Compression, Feed, Transport};

/// Why a download was skipped without producing new content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    UnchangedMtime,
    UnchangedHash,
    FileNotFound,
}

/// Raw bytes pulled from the remote server, pre-decompression, plus
/// whatever mtime/size stat the transport could provide.
pub struct RemoteFile {
    pub bytes: Vec<u8>,
    pub mtime: Option<DateTime<Utc>>,
    pub size: u64,
}

/// Result of a fetch attempt.
pub enum FetchOutcome {
    Downloaded {
        content: Vec<u8>,
        mtime: Option<DateTime<Utc>>,
        size: u64,
        content_hash: String,
    },
    Skipped(SkipReason),
}

/// Policy inputs the fetcher needs beyond the feed record itself.
pub struct FetcherPolicy {
    pub allow_plain_ftp: bool,
    pub sftp_ready_timeout_secs: u64,
}

pub struct Fetcher;

impl Fetcher {
    /// `download(feed) -> {content, mtime?, size, contentHash, skipped?}`.
    ///
    /// File-not-found is returned as `Skipped(FileNotFound)`, a *successful*
    /// outcome, so it never cascades into the retry/auto-disable path — the
    /// file may be briefly absent during remote regeneration. All other
    /// fetch failures are returned as `Err`.
    pub async fn download(
        feed: &Feed,
        policy: &FetcherPolicy,
    ) -> Result<FetchOutcome, FetchError> {
        if feed.connection.transport == Transport::PlainFtp && !policy.allow_plain_ftp {
            return Err(FetchError::PlainFtpDisabled);
        }

        let max_size = feed.max_file_size_bytes;

        let remote = match feed.connection.transport {
            Transport::Sftp => {
                let stat = sftp::stat(&feed.connection, policy.sftp_ready_timeout_secs).await?;

                if let (Some(mtime), Some(last_mtime), Some(last_size)) = (
                    stat.mtime,
                    feed.change_detection.last_remote_mtime,
                    feed.change_detection.last_remote_size,
                ) {
                    if mtime == last_mtime && stat.size as i64 == last_size {
                        return Ok(FetchOutcome::Skipped(SkipReason::UnchangedMtime));
                    }
                }

                if stat.size > max_size {
                    return Err(FetchError::TooLarge {
                        actual: stat.size,
                        limit: max_size,
                    });
                }

                match sftp::download(&feed.connection, policy.sftp_ready_timeout_secs, max_size)
                    .await
                {
                    Ok(remote) => remote,
                    Err(FetchError::NotFound { .. }) => {
                        return Ok(FetchOutcome::Skipped(SkipReason::FileNotFound))
                    }
                    Err(err) => return Err(err),
                }
            }
            Transport::PlainFtp => {
                let size = ftp::size(&feed.connection).await?;
                if size > max_size {
                    return Err(FetchError::TooLarge {
                        actual: size,
                        limit: max_size,
                    });
                }
                match ftp::download(&feed.connection, max_size).await {
                    Ok(remote) => remote,
                    Err(FetchError::NotFound { .. }) => {
                        return Ok(FetchOutcome::Skipped(SkipReason::FileNotFound))
                    }
                    Err(err) => return Err(err),
                }
            }
        };

        let decompressed = decompress(&remote.bytes, feed.compression)?;
        let content_hash = hash_bytes(&decompressed);

        if let Some(last_hash) = &feed.change_detection.last_content_hash {
            if last_hash == &content_hash {
                return Ok(FetchOutcome::Skipped(SkipReason::UnchangedHash));
            }
        }

        Ok(FetchOutcome::Downloaded {
            content: decompressed,
            mtime: remote.mtime,
            size: remote.size,
            content_hash,
        })
    }
}

fn decompress(bytes: &[u8], compression: Compression) -> Result<Vec<u8>, FetchError> {
    match compression {
        Compression::None => Ok(bytes.to_vec()),
        Compression::Gzip => {
            let mut decoder = flate2::read::GzDecoder::new(bytes);
            let mut out = Vec::new();
            decoder
                .read_to_end(&mut out)
                .map_err(|e| FetchError::Other {
                    message: format!("gzip decompress failed: {e}"),
                })?;
            Ok(out)
        }
    }
}

fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic_and_hex_encoded() {
        let a = hash_bytes(b"hello world");
        let b = hash_bytes(b"hello world");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn hash_differs_for_different_content() {
        assert_ne!(hash_bytes(b"a"), hash_bytes(b"b"));
    }

    #[test]
    fn none_compression_is_identity() {
        let bytes = b"raw,csv,bytes".to_vec();
        assert_eq!(decompress(&bytes, Compression::None).unwrap(), bytes);
    }

    #[test]
    fn gzip_compression_round_trips() {
        use flate2::write::GzEncoder;
        use flate2::Compression as GzLevel;
        use std::io::Write;

        let mut encoder = GzEncoder::new(Vec::new(), GzLevel::default());
        encoder.write_all(b"name,url,price\nWidget,https://example.com,9.99\n").unwrap();
        let compressed = encoder.finish().unwrap();

        let out = decompress(&compressed, Compression::Gzip).unwrap();
        assert_eq!(out, b"name,url,price\nWidget,https://example.com,9.99\n");
    }
}
