//! Remote feed transport adapter.
//!
//! The actual FTP/SFTP client is an external collaborator; this module owns
//! the adapter trait, wall-clock timeout enforcement, plain-FTP gating and an
//! in-memory implementation used by tests, local development and admin
//! connection tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::models::{FailureCode, Feed, TransportKind};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("remote file not found: {0}")]
    FileNotFound(String),
    #[error("remote file exceeds {max_bytes} bytes")]
    FileTooLarge { max_bytes: u64 },
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("plain FTP is not allowed by settings")]
    NotAllowed,
    #[error("transport failure: {0}")]
    Other(String),
}

impl TransportError {
    pub fn failure_code(&self) -> FailureCode {
        match self {
            TransportError::Auth(_) => FailureCode::Auth,
            TransportError::FileNotFound(_) => FailureCode::FileNotFound,
            TransportError::FileTooLarge { .. } => FailureCode::FileTooLarge,
            TransportError::Timeout(_) => FailureCode::Timeout,
            TransportError::NotAllowed => FailureCode::TransportNotAllowed,
            TransportError::Other(_) => FailureCode::Transport,
        }
    }
}

/// Remote file metadata used for change detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteStat {
    pub size: u64,
    /// Unix seconds.
    pub mtime: i64,
}

/// The surface the ingestion engine needs from any transport client.
#[async_trait]
pub trait FeedTransport: Send + Sync {
    async fn stat(&self, path: &str) -> Result<RemoteStat, TransportError>;

    /// Download the whole file into memory, aborting past `max_bytes`.
    async fn download(&self, path: &str, max_bytes: u64) -> Result<Vec<u8>, TransportError>;

    async fn test_connection(&self) -> Result<(), TransportError>;
}

/// Produces connected transports for feeds. The production connector wires
/// whatever client library is deployed; tests plug the in-memory one.
#[async_trait]
pub trait TransportConnector: Send + Sync {
    async fn connect(&self, feed: &Feed) -> Result<Box<dyn FeedTransport>, TransportError>;
}

/// Plain FTP is only permitted when the global setting allows it.
pub fn validate_transport_kind(
    kind: TransportKind,
    allow_plain_ftp: bool,
) -> Result<(), TransportError> {
    match kind {
        TransportKind::Sftp => Ok(()),
        TransportKind::Ftp if allow_plain_ftp => Ok(()),
        TransportKind::Ftp => Err(TransportError::NotAllowed),
    }
}

/// Wall-clock timeouts applied around every transport call.
#[derive(Debug, Clone, Copy)]
pub struct TransportTimeouts {
    pub control: Duration,
    pub data: Duration,
}

impl Default for TransportTimeouts {
    fn default() -> Self {
        Self {
            control: Duration::from_secs(10),
            data: Duration::from_secs(30),
        }
    }
}

/// Decorator enforcing hard timeouts on an underlying transport.
pub struct TimeoutTransport {
    inner: Box<dyn FeedTransport>,
    timeouts: TransportTimeouts,
}

impl TimeoutTransport {
    pub fn new(inner: Box<dyn FeedTransport>, timeouts: TransportTimeouts) -> Self {
        Self { inner, timeouts }
    }
}

#[async_trait]
impl FeedTransport for TimeoutTransport {
    async fn stat(&self, path: &str) -> Result<RemoteStat, TransportError> {
        tokio::time::timeout(self.timeouts.control, self.inner.stat(path))
            .await
            .map_err(|_| TransportError::Timeout(self.timeouts.control))?
    }

    async fn download(&self, path: &str, max_bytes: u64) -> Result<Vec<u8>, TransportError> {
        tokio::time::timeout(self.timeouts.data, self.inner.download(path, max_bytes))
            .await
            .map_err(|_| TransportError::Timeout(self.timeouts.data))?
    }

    async fn test_connection(&self) -> Result<(), TransportError> {
        tokio::time::timeout(self.timeouts.control, self.inner.test_connection())
            .await
            .map_err(|_| TransportError::Timeout(self.timeouts.control))?
    }
}

#[derive(Debug, Clone)]
struct MemoryFile {
    bytes: Vec<u8>,
    mtime: i64,
}

#[derive(Default)]
struct MemoryState {
    files: HashMap<String, MemoryFile>,
    fail_auth: bool,
    hang: bool,
}

/// In-memory transport: a fake remote host whose files tests and local
/// development control directly.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_file(&self, path: &str, bytes: Vec<u8>, mtime: i64) {
        self.state
            .lock()
            .files
            .insert(path.to_string(), MemoryFile { bytes, mtime });
    }

    pub fn remove_file(&self, path: &str) {
        self.state.lock().files.remove(path);
    }

    /// Make every subsequent operation fail authentication.
    pub fn set_fail_auth(&self, fail: bool) {
        self.state.lock().fail_auth = fail;
    }

    /// Make every subsequent operation hang until its timeout fires.
    pub fn set_hang(&self, hang: bool) {
        self.state.lock().hang = hang;
    }

    fn check_auth(&self) -> Result<(), TransportError> {
        if self.state.lock().fail_auth {
            return Err(TransportError::Auth("invalid credentials".to_string()));
        }
        Ok(())
    }

    async fn maybe_hang(&self) {
        let hang = self.state.lock().hang;
        if hang {
            // Longer than any configured timeout; the TimeoutTransport
            // decorator aborts first.
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
    }
}

#[async_trait]
impl FeedTransport for MemoryTransport {
    async fn stat(&self, path: &str) -> Result<RemoteStat, TransportError> {
        self.maybe_hang().await;
        self.check_auth()?;
        let state = self.state.lock();
        let file = state
            .files
            .get(path)
            .ok_or_else(|| TransportError::FileNotFound(path.to_string()))?;
        Ok(RemoteStat {
            size: file.bytes.len() as u64,
            mtime: file.mtime,
        })
    }

    async fn download(&self, path: &str, max_bytes: u64) -> Result<Vec<u8>, TransportError> {
        self.maybe_hang().await;
        self.check_auth()?;
        let state = self.state.lock();
        let file = state
            .files
            .get(path)
            .ok_or_else(|| TransportError::FileNotFound(path.to_string()))?;
        if file.bytes.len() as u64 > max_bytes {
            return Err(TransportError::FileTooLarge { max_bytes });
        }
        Ok(file.bytes.clone())
    }

    async fn test_connection(&self) -> Result<(), TransportError> {
        self.maybe_hang().await;
        self.check_auth()
    }
}

/// Connector serving one shared in-memory transport to every feed, with
/// plain-FTP gating applied the same way a production connector would.
pub struct MemoryConnector {
    transport: MemoryTransport,
    timeouts: TransportTimeouts,
    allow_plain_ftp: Box<dyn Fn() -> bool + Send + Sync>,
}

impl MemoryConnector {
    pub fn new(
        transport: MemoryTransport,
        timeouts: TransportTimeouts,
        allow_plain_ftp: impl Fn() -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            transport,
            timeouts,
            allow_plain_ftp: Box::new(allow_plain_ftp),
        }
    }
}

#[async_trait]
impl TransportConnector for MemoryConnector {
    async fn connect(&self, feed: &Feed) -> Result<Box<dyn FeedTransport>, TransportError> {
        validate_transport_kind(feed.transport, (self.allow_plain_ftp)())?;
        Ok(Box::new(TimeoutTransport::new(
            Box::new(self.transport.clone()),
            self.timeouts,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_ftp_gating() {
        assert!(validate_transport_kind(TransportKind::Sftp, false).is_ok());
        assert!(validate_transport_kind(TransportKind::Ftp, true).is_ok());
        let err = validate_transport_kind(TransportKind::Ftp, false).unwrap_err();
        assert_eq!(err.failure_code(), FailureCode::TransportNotAllowed);
    }

    #[tokio::test]
    async fn test_memory_transport_stat_download() {
        let transport = MemoryTransport::new();
        transport.put_file("/export/catalog.csv", b"a,b\n1,2\n".to_vec(), 1_700_000_000);

        let stat = transport.stat("/export/catalog.csv").await.unwrap();
        assert_eq!(stat.size, 8);
        assert_eq!(stat.mtime, 1_700_000_000);

        let bytes = transport.download("/export/catalog.csv", 100).await.unwrap();
        assert_eq!(bytes, b"a,b\n1,2\n");

        let err = transport.download("/export/catalog.csv", 4).await.unwrap_err();
        assert_eq!(err.failure_code(), FailureCode::FileTooLarge);

        let err = transport.stat("/missing.csv").await.unwrap_err();
        assert_eq!(err.failure_code(), FailureCode::FileNotFound);
    }

    #[tokio::test]
    async fn test_timeout_decorator_aborts_hung_transport() {
        let transport = MemoryTransport::new();
        transport.put_file("/f.csv", b"x".to_vec(), 1);
        transport.set_hang(true);

        let wrapped = TimeoutTransport::new(
            Box::new(transport),
            TransportTimeouts {
                control: Duration::from_millis(20),
                data: Duration::from_millis(20),
            },
        );

        let err = wrapped.stat("/f.csv").await.unwrap_err();
        assert_eq!(err.failure_code(), FailureCode::Timeout);
    }

    #[tokio::test]
    async fn test_auth_failure_surfaces() {
        let transport = MemoryTransport::new();
        transport.set_fail_auth(true);
        let err = transport.test_connection().await.unwrap_err();
        assert_eq!(err.failure_code(), FailureCode::Auth);
    }
}
