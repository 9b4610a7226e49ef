//! [`BlockBackend`] implementations.
//!
//! [`FileBackend`] serves a regular file or block device node with positioned
//! I/O on a blocking pool; [`RamBackend`] serves a heap buffer and exists for
//! tests and demos.

use anyhow::{ensure, Context, Result};
use async_trait::async_trait;
use nix::fcntl::{fallocate, FallocateFlags};
use pvblock_core::{BackendError, BackendErrorKind, BackendResult, BlockBackend};
use std::{
    io,
    os::fd::AsRawFd,
    os::unix::fs::FileExt,
    path::Path,
    sync::atomic::{AtomicU64, Ordering},
    sync::Mutex,
};
use tokio::{fs::OpenOptions, task};
use tracing::debug;

/// Backend over a regular file or device node.
///
/// Opens read-write and falls back to read-only when the file cannot be
/// written; writes are refused thereafter and the device is surfaced as
/// read-only. Discards punch holes, keeping the file size.
pub struct FileBackend {
    file: std::fs::File,
    len: AtomicU64,
    writable: bool,
}

impl FileBackend {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let path_display = path.display().to_string();
        let rw_result = OpenOptions::new().read(true).write(true).open(path).await;

        let (file, writable) = match rw_result {
            Ok(file) => (file, true),
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::PermissionDenied | io::ErrorKind::ReadOnlyFilesystem
                ) =>
            {
                let file = OpenOptions::new()
                    .read(true)
                    .open(path)
                    .await
                    .with_context(|| format!("open {} read-only", path_display))?;
                debug!(path = %path_display, "opened backing file read-only");
                (file, false)
            }
            Err(err) => {
                return Err(err).context(format!("open {}", path_display));
            }
        };

        let len = file
            .metadata()
            .await
            .with_context(|| format!("stat {}", path_display))?
            .len();
        ensure!(len > 0, "backing file {} is empty", path_display);
        if writable {
            debug!(path = %path_display, len, "opened backing file read-write");
        }

        Ok(Self {
            file: file.into_std().await,
            len: AtomicU64::new(len),
            writable,
        })
    }
}

#[async_trait]
impl BlockBackend for FileBackend {
    fn len(&self) -> u64 {
        self.len.load(Ordering::Relaxed)
    }

    fn is_read_only(&self) -> bool {
        !self.writable
    }

    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> BackendResult<()> {
        let file = self.file.try_clone().map_err(io_error)?;
        let len = buf.len();
        let tmp = task::spawn_blocking(move || {
            let mut tmp = vec![0u8; len];
            let mut read = 0;
            while read < len {
                let n = file.read_at(&mut tmp[read..], offset + read as u64)?;
                if n == 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "short read from backing file",
                    ));
                }
                read += n;
            }
            Ok::<_, io::Error>(tmp)
        })
        .await
        .map_err(join_error)?
        .map_err(io_error)?;
        buf.copy_from_slice(&tmp);
        Ok(())
    }

    async fn write_at(&self, offset: u64, buf: &[u8]) -> BackendResult<()> {
        if !self.writable {
            return Err(BackendError::with_message(
                BackendErrorKind::Unsupported,
                "backing file opened read-only",
            ));
        }
        let file = self.file.try_clone().map_err(io_error)?;
        let data = buf.to_vec();
        let len = data.len();
        task::spawn_blocking(move || {
            let mut written = 0;
            while written < len {
                let n = file.write_at(&data[written..], offset + written as u64)?;
                if n == 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "short write to backing file",
                    ));
                }
                written += n;
            }
            Ok(())
        })
        .await
        .map_err(join_error)?
        .map_err(io_error)
    }

    async fn flush(&self) -> BackendResult<()> {
        let file = self.file.try_clone().map_err(io_error)?;
        task::spawn_blocking(move || file.sync_data())
            .await
            .map_err(join_error)?
            .map_err(io_error)
    }

    async fn discard(&self, offset: u64, len: u64) -> BackendResult<()> {
        if !self.writable {
            return Err(BackendError::with_message(
                BackendErrorKind::Unsupported,
                "backing file opened read-only",
            ));
        }
        let file = self.file.try_clone().map_err(io_error)?;
        let result = task::spawn_blocking(move || {
            fallocate(
                file.as_raw_fd(),
                FallocateFlags::FALLOC_FL_PUNCH_HOLE | FallocateFlags::FALLOC_FL_KEEP_SIZE,
                offset as i64,
                len as i64,
            )
        })
        .await
        .map_err(join_error)?;
        match result {
            Ok(()) => Ok(()),
            // Filesystems without hole punching make discard a hint no-op.
            Err(nix::errno::Errno::EOPNOTSUPP) => {
                debug!("hole punching unsupported, discard ignored");
                Ok(())
            }
            Err(errno) => Err(BackendError::with_message(
                BackendErrorKind::Io,
                errno.to_string(),
            )),
        }
    }
}

fn io_error(err: io::Error) -> BackendError {
    BackendError::with_message(BackendErrorKind::Io, err.to_string())
}

fn join_error(err: task::JoinError) -> BackendError {
    BackendError::with_message(BackendErrorKind::Other, err.to_string())
}

/// Heap-backed store. Discards zero the range.
pub struct RamBackend {
    bytes: Mutex<Vec<u8>>,
    read_only: bool,
}

impl RamBackend {
    pub fn new(len: usize) -> Self {
        Self {
            bytes: Mutex::new(vec![0u8; len]),
            read_only: false,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    fn check_range(&self, offset: u64, len: usize) -> BackendResult<()> {
        let end = offset
            .checked_add(len as u64)
            .ok_or_else(|| BackendError::new(BackendErrorKind::OutOfRange))?;
        if end > self.bytes.lock().unwrap().len() as u64 {
            return Err(BackendError::with_message(
                BackendErrorKind::OutOfRange,
                "access past end of store",
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl BlockBackend for RamBackend {
    fn len(&self) -> u64 {
        self.bytes.lock().unwrap().len() as u64
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> BackendResult<()> {
        self.check_range(offset, buf.len())?;
        let bytes = self.bytes.lock().unwrap();
        let offset = offset as usize;
        buf.copy_from_slice(&bytes[offset..offset + buf.len()]);
        Ok(())
    }

    async fn write_at(&self, offset: u64, buf: &[u8]) -> BackendResult<()> {
        if self.read_only {
            return Err(BackendError::with_message(
                BackendErrorKind::Unsupported,
                "store is read-only",
            ));
        }
        self.check_range(offset, buf.len())?;
        let mut bytes = self.bytes.lock().unwrap();
        let offset = offset as usize;
        bytes[offset..offset + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    async fn flush(&self) -> BackendResult<()> {
        Ok(())
    }

    async fn discard(&self, offset: u64, len: u64) -> BackendResult<()> {
        if self.read_only {
            return Err(BackendError::with_message(
                BackendErrorKind::Unsupported,
                "store is read-only",
            ));
        }
        self.check_range(offset, len as usize)?;
        let mut bytes = self.bytes.lock().unwrap();
        let offset = offset as usize;
        bytes[offset..offset + len as usize].fill(0);
        Ok(())
    }
}
