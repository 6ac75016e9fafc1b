//! Upload sources: a local file read positionally or an in-memory buffer.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};

use crate::transfer::TransferError;

/// Random-access byte source for uploads.
///
/// Parts are read concurrently, so implementations must tolerate
/// overlapping calls.
#[async_trait]
#[allow(clippy::len_without_is_empty)]
pub trait UploadSource: Send + Sync {
    /// Total number of bytes in the source.
    async fn len(&self) -> Result<u64, TransferError>;

    /// Reads exactly `length` bytes starting at `offset`.
    async fn read_range(&self, offset: u64, length: u64) -> Result<Vec<u8>, TransferError>;
}

#[async_trait]
impl<T: UploadSource + ?Sized> UploadSource for Arc<T> {
    async fn len(&self) -> Result<u64, TransferError> {
        (**self).len().await
    }

    async fn read_range(&self, offset: u64, length: u64) -> Result<Vec<u8>, TransferError> {
        (**self).read_range(offset, length).await
    }
}

/// Upload source backed by a local file.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    /// Creates a source for `path`. The file is opened on each read.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl UploadSource for FileSource {
    async fn len(&self) -> Result<u64, TransferError> {
        let meta = tokio::fs::metadata(&self.path).await.map_err(|e| {
            TransferError::io(format!("reading metadata of {}", self.path.display()), e)
        })?;
        Ok(meta.len())
    }

    async fn read_range(&self, offset: u64, length: u64) -> Result<Vec<u8>, TransferError> {
        let context = || format!("reading {} at offset {offset}", self.path.display());

        let mut file = File::open(&self.path)
            .await
            .map_err(|e| TransferError::io(context(), e))?;
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| TransferError::io(context(), e))?;

        let length = usize::try_from(length)
            .map_err(|_| TransferError::invalid_request("part is too large for this platform"))?;
        let mut buf = vec![0u8; length];
        file.read_exact(&mut buf)
            .await
            .map_err(|e| TransferError::io(context(), e))?;
        Ok(buf)
    }
}

/// Upload source over an in-memory buffer.
#[derive(Debug, Clone)]
pub struct MemorySource {
    data: Vec<u8>,
}

impl MemorySource {
    /// Wraps `data`.
    #[must_use]
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }
}

#[async_trait]
impl UploadSource for MemorySource {
    async fn len(&self) -> Result<u64, TransferError> {
        Ok(self.data.len() as u64)
    }

    async fn read_range(&self, offset: u64, length: u64) -> Result<Vec<u8>, TransferError> {
        let start = usize::try_from(offset).unwrap_or(usize::MAX);
        let end = usize::try_from(offset.saturating_add(length)).unwrap_or(usize::MAX);
        self.data.get(start..end).map(<[u8]>::to_vec).ok_or_else(|| {
            TransferError::io(
                format!("reading memory source at offset {offset}"),
                std::io::Error::from(std::io::ErrorKind::UnexpectedEof),
            )
        })
    }
}
