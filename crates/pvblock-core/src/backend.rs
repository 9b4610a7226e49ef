use async_trait::async_trait;
use std::fmt;

pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Describes the failure category for backing store operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendErrorKind {
    InvalidInput,
    OutOfRange,
    Io,
    Unsupported,
    Other,
}

/// Error surfaced by [`BlockBackend`] implementations.
#[derive(Clone, Debug)]
pub struct BackendError {
    kind: BackendErrorKind,
    message: Option<String>,
}

impl BackendError {
    pub const fn new(kind: BackendErrorKind) -> Self {
        Self {
            kind,
            message: None,
        }
    }

    pub fn with_message(kind: BackendErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: Some(message.into()),
        }
    }

    pub fn kind(&self) -> BackendErrorKind {
        self.kind
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message() {
            Some(msg) => write!(f, "{:?}: {}", self.kind, msg),
            None => write!(f, "{:?}", self.kind),
        }
    }
}

impl std::error::Error for BackendError {}

/// Asynchronous backing store servicing ring requests.
///
/// Every call returns immediately with a future; the engine never blocks on
/// storage. Offsets and lengths are in bytes and have already been validated
/// against [`BlockBackend::len`] by the time an implementation sees them.
#[async_trait]
pub trait BlockBackend: Send + Sync {
    /// Total size of the store in bytes.
    fn len(&self) -> u64;

    /// Returns true when the store cannot be written.
    fn is_read_only(&self) -> bool {
        false
    }

    /// Fill `buf` from the store starting at `offset`.
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> BackendResult<()>;

    /// Write `buf` to the store starting at `offset`.
    async fn write_at(&self, offset: u64, buf: &[u8]) -> BackendResult<()>;

    /// Flush outstanding writes to durable media.
    async fn flush(&self) -> BackendResult<()>;

    /// Hint that the given byte range may be discarded.
    async fn discard(&self, offset: u64, len: u64) -> BackendResult<()> {
        let _ = (offset, len);
        Ok(())
    }
}
