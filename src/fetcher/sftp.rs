//! SFTP transport: `stat` then `createReadStream`, 30s ready timeout.

use chrono::{DateTime, TimeZone, Utc};
use std::io::Read as _;
use std::net::TcpStream;
use std::time::Duration;

use crate::errors::FetchError;
use crate::models::FeedConnection;

use super::RemoteFile;

pub struct Stat {
    pub mtime: Option<DateTime<Utc>>,
    pub size: u64,
}

fn connect(conn: &FeedConnection, ready_timeout_secs: u64) -> Result<ssh2::Sftp, FetchError> {
    let addr = format!("{}:{}", conn.host, conn.port);
    let tcp = TcpStream::connect(&addr).map_err(|e| FetchError::Connection {
        message: format!("tcp connect to {addr} failed: {e}"),
    })?;
    tcp.set_read_timeout(Some(Duration::from_secs(ready_timeout_secs)))
        .ok();

    let mut session = ssh2::Session::new().map_err(|e| FetchError::Other {
        message: format!("ssh session init failed: {e}"),
    })?;
    session.set_tcp_stream(tcp);
    session.handshake().map_err(|e| FetchError::Connection {
        message: format!("ssh handshake failed: {e}"),
    })?;

    session
        .userauth_password(&conn.username, &conn.password_ciphertext)
        .map_err(|e| FetchError::Auth {
            message: format!("sftp authentication failed: {e}"),
        })?;

    session.sftp().map_err(|e| FetchError::Other {
        message: format!("sftp channel open failed: {e}"),
    })
}

pub async fn stat(conn: &FeedConnection, ready_timeout_secs: u64) -> Result<Stat, FetchError> {
    let conn = conn.clone();
    tokio::task::spawn_blocking(move || {
        let sftp = connect(&conn, ready_timeout_secs)?;
        let path = std::path::Path::new(&conn.path);
        let st = sftp.stat(path).map_err(|e| to_fetch_error(&conn.path, e))?;
        Ok(Stat {
            mtime: st.mtime.and_then(|t| Utc.timestamp_opt(t as i64, 0).single()),
            size: st.size.unwrap_or(0),
        })
    })
    .await
    .map_err(|e| FetchError::Other {
        message: format!("sftp stat task panicked: {e}"),
    })?
}

pub async fn download(
    conn: &FeedConnection,
    ready_timeout_secs: u64,
    max_size: u64,
) -> Result<RemoteFile, FetchError> {
    let conn = conn.clone();
    tokio::task::spawn_blocking(move || {
        let sftp = connect(&conn, ready_timeout_secs)?;
        let path = std::path::Path::new(&conn.path);
        let st = sftp.stat(path).map_err(|e| to_fetch_error(&conn.path, e))?;
        let size = st.size.unwrap_or(0);
        let mtime = st.mtime.and_then(|t| Utc.timestamp_opt(t as i64, 0).single());

        let mut remote_file = sftp
            .open(path)
            .map_err(|e| to_fetch_error(&conn.path, e))?;

        // Enforce the byte cap while streaming, not just from the stat.
        let mut buf = Vec::with_capacity(size.min(max_size + 1) as usize);
        let mut chunk = [0u8; 64 * 1024];
        loop {
            let n = remote_file.read(&mut chunk).map_err(|e| FetchError::Other {
                message: format!("sftp read failed: {e}"),
            })?;
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            if buf.len() as u64 > max_size {
                return Err(FetchError::TooLarge {
                    actual: buf.len() as u64,
                    limit: max_size,
                });
            }
        }

        Ok(RemoteFile {
            bytes: buf,
            mtime,
            size,
        })
    })
    .await
    .map_err(|e| FetchError::Other {
        message: format!("sftp download task panicked: {e}"),
    })?
}

fn to_fetch_error(path: &str, err: ssh2::Error) -> FetchError {
    // libssh2 surfaces SFTP status codes through the message text; the
    // common "no such file" case is mapped explicitly so callers can treat
    // it as a skippable, non-escalating outcome (SPEC_FULL §4.3).
    let message = err.to_string();
    if message.to_lowercase().contains("no such file") {
        FetchError::NotFound {
            path: path.to_string(),
        }
    } else {
        FetchError::Other { message }
    }
}
