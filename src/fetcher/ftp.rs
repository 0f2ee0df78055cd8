//! Plain (non-encrypted) FTP transport, gated by policy (SPEC_FULL §4.3).
//! No reliable mtime; `size` is used only for the pre-flight `SIZE` check.

use std::io::Read as _;

use suppaftp::FtpStream;

use crate::errors::FetchError;
use crate::models::FeedConnection;

use super::RemoteFile;

/// Marker embedded in the synthetic I/O error `retr`'s reader callback
/// returns when the running byte count overshoots the cap, so the
/// download can abort mid-stream instead of buffering the whole file
/// first (SPEC_FULL §4.3's streaming-abort requirement, same as `sftp.rs`).
const TOO_LARGE_MARKER: &str = "__ftp_fetch_too_large__:";

fn connect(conn: &FeedConnection) -> Result<FtpStream, FetchError> {
    let addr = format!("{}:{}", conn.host, conn.port);
    let mut stream = FtpStream::connect(&addr).map_err(|e| FetchError::Connection {
        message: format!("ftp connect to {addr} failed: {e}"),
    })?;
    stream
        .login(&conn.username, &conn.password_ciphertext)
        .map_err(|e| FetchError::Auth {
            message: format!("ftp login failed: {e}"),
        })?;
    Ok(stream)
}

pub async fn size(conn: &FeedConnection) -> Result<u64, FetchError> {
    let conn = conn.clone();
    tokio::task::spawn_blocking(move || {
        let mut stream = connect(&conn)?;
        stream
            .size(&conn.path)
            .map(|s| s as u64)
            .map_err(|e| to_fetch_error(&conn.path, 0, e))
    })
    .await
    .map_err(|e| FetchError::Other {
        message: format!("ftp size task panicked: {e}"),
    })?
}

pub async fn download(conn: &FeedConnection, max_size: u64) -> Result<RemoteFile, FetchError> {
    let conn = conn.clone();
    tokio::task::spawn_blocking(move || {
        let mut stream = connect(&conn)?;

        // Stream through `retr`'s reader callback in fixed-size chunks and
        // abort as soon as the running total overshoots the cap, the same
        // mid-download guarantee `sftp.rs` gives — `retr_as_buffer` would
        // buffer the whole file before any size check ran.
        let result = stream.retr(&conn.path, |reader| {
            let mut buf = Vec::new();
            let mut chunk = [0u8; 64 * 1024];
            loop {
                let n = reader.read(&mut chunk).map_err(suppaftp::FtpError::ConnectionError)?;
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
                if buf.len() as u64 > max_size {
                    return Err(suppaftp::FtpError::ConnectionError(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        format!("{TOO_LARGE_MARKER}{}", buf.len()),
                    )));
                }
            }
            Ok(buf)
        });

        let bytes = match result {
            Ok(bytes) => bytes,
            Err(e) => return Err(to_fetch_error(&conn.path, max_size, e)),
        };

        Ok(RemoteFile {
            size: bytes.len() as u64,
            bytes,
            mtime: None,
        })
    })
    .await
    .map_err(|e| FetchError::Other {
        message: format!("ftp download task panicked: {e}"),
    })?
}

fn to_fetch_error(path: &str, max_size: u64, err: suppaftp::FtpError) -> FetchError {
    let message = err.to_string();
    if let Some(actual) = message
        .strip_prefix(TOO_LARGE_MARKER)
        .and_then(|rest| rest.parse::<u64>().ok())
    {
        return FetchError::TooLarge {
            actual,
            limit: max_size,
        };
    }
    let lower = message.to_lowercase();
    if lower.contains("550") || lower.contains("no such file") || lower.contains("not found") {
        FetchError::NotFound {
            path: path.to_string(),
        }
    } else {
        FetchError::Other { message }
    }
}
