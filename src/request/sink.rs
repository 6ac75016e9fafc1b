//! Download destinations: a pre-sized local file or an in-memory buffer.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};

use crate::transfer::TransferError;

/// Random-access destination for downloads.
///
/// Offsets are relative to the start of the requested range, not the
/// remote object.
#[async_trait]
pub trait DownloadSink: Send + Sync {
    /// Called once before any part is written with the number of bytes to expect.
    async fn prepare(&self, total: u64) -> Result<(), TransferError>;

    /// Writes `bytes` at `offset`.
    async fn write_at(&self, offset: u64, bytes: &[u8]) -> Result<(), TransferError>;

    /// Called once after every part has been written.
    async fn finish(&self) -> Result<(), TransferError>;

    /// Reads back `length` bytes stored at `offset` after [`finish`](Self::finish),
    /// for checksumming the result. Sinks that cannot read back return `None`.
    async fn read_at(&self, offset: u64, length: u64) -> Result<Option<Vec<u8>>, TransferError> {
        let _ = (offset, length);
        Ok(None)
    }
}

/// Shared sinks, so the caller can keep a handle to what the task writes into.
#[async_trait]
impl<T: DownloadSink + ?Sized> DownloadSink for Arc<T> {
    async fn prepare(&self, total: u64) -> Result<(), TransferError> {
        (**self).prepare(total).await
    }

    async fn write_at(&self, offset: u64, bytes: &[u8]) -> Result<(), TransferError> {
        (**self).write_at(offset, bytes).await
    }

    async fn finish(&self) -> Result<(), TransferError> {
        (**self).finish().await
    }

    async fn read_at(&self, offset: u64, length: u64) -> Result<Option<Vec<u8>>, TransferError> {
        (**self).read_at(offset, length).await
    }
}

/// Download sink backed by a local file.
#[derive(Debug)]
pub struct FileSink {
    path: PathBuf,
    file: tokio::sync::Mutex<Option<File>>,
}

impl FileSink {
    /// Creates a sink writing to `path`. The file is created on [`prepare`](DownloadSink::prepare)
    /// and existing contents are kept so that resumed downloads only fill missing parts.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: tokio::sync::Mutex::new(None),
        }
    }

    /// Path of the file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, action: &str, e: std::io::Error) -> TransferError {
        TransferError::io(format!("{action} {}", self.path.display()), e)
    }
}

#[async_trait]
impl DownloadSink for FileSink {
    async fn prepare(&self, total: u64) -> Result<(), TransferError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| self.io_error("creating parent directory of", e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&self.path)
            .await
            .map_err(|e| self.io_error("opening", e))?;
        file.set_len(total)
            .await
            .map_err(|e| self.io_error("sizing", e))?;
        *self.file.lock().await = Some(file);
        Ok(())
    }

    async fn write_at(&self, offset: u64, bytes: &[u8]) -> Result<(), TransferError> {
        let mut guard = self.file.lock().await;
        let file = guard.as_mut().ok_or_else(|| {
            TransferError::invalid_request("download sink written before it was prepared")
        })?;
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| self.io_error("seeking in", e))?;
        file.write_all(bytes)
            .await
            .map_err(|e| self.io_error("writing", e))
    }

    async fn finish(&self) -> Result<(), TransferError> {
        let mut guard = self.file.lock().await;
        if let Some(mut file) = guard.take() {
            file.flush().await.map_err(|e| self.io_error("flushing", e))?;
            file.sync_all()
                .await
                .map_err(|e| self.io_error("syncing", e))?;
        }
        Ok(())
    }

    async fn read_at(&self, offset: u64, length: u64) -> Result<Option<Vec<u8>>, TransferError> {
        let mut file = File::open(&self.path)
            .await
            .map_err(|e| self.io_error("reopening", e))?;
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| self.io_error("seeking in", e))?;
        let length = usize::try_from(length)
            .map_err(|_| TransferError::invalid_request("read-back is too large for this platform"))?;
        let mut buf = vec![0u8; length];
        file.read_exact(&mut buf)
            .await
            .map_err(|e| self.io_error("reading back", e))?;
        Ok(Some(buf))
    }
}

/// Download sink collecting bytes in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    data: Mutex<Vec<u8>>,
    finished: Mutex<bool>,
}

impl MemorySink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a sink already holding `bytes`, as left by an interrupted download.
    #[must_use]
    pub fn with_bytes(bytes: Vec<u8>) -> Self {
        Self {
            data: Mutex::new(bytes),
            finished: Mutex::new(false),
        }
    }

    /// Copy of the bytes written so far.
    #[must_use]
    pub fn bytes(&self) -> Vec<u8> {
        self.data
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Whether [`finish`](DownloadSink::finish) has been called.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        *self.finished.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl DownloadSink for MemorySink {
    async fn prepare(&self, total: u64) -> Result<(), TransferError> {
        let total = usize::try_from(total)
            .map_err(|_| TransferError::invalid_request("object too large for a memory sink"))?;
        self.data
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .resize(total, 0);
        Ok(())
    }

    async fn write_at(&self, offset: u64, bytes: &[u8]) -> Result<(), TransferError> {
        let mut data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        let start = usize::try_from(offset).unwrap_or(usize::MAX);
        let end = start.saturating_add(bytes.len());
        let slot = data.get_mut(start..end).ok_or_else(|| {
            TransferError::io(
                format!("writing memory sink at offset {offset}"),
                std::io::Error::from(std::io::ErrorKind::WriteZero),
            )
        })?;
        slot.copy_from_slice(bytes);
        Ok(())
    }

    async fn finish(&self) -> Result<(), TransferError> {
        *self.finished.lock().unwrap_or_else(PoisonError::into_inner) = true;
        Ok(())
    }

    async fn read_at(&self, offset: u64, length: u64) -> Result<Option<Vec<u8>>, TransferError> {
        let data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        let start = usize::try_from(offset).unwrap_or(usize::MAX);
        let end = usize::try_from(offset.saturating_add(length)).unwrap_or(usize::MAX);
        Ok(data.get(start..end).map(<[u8]>::to_vec))
    }
}
