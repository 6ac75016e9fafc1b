//! Transfer requests: what to move, where, and which bytes.
//!
//! A [`TransferRequest`] is built once with the builder methods below and
//! then handed to the engine, which shares it behind an `Arc` for the life
//! of the task. Nothing in a request can change after it is submitted.

mod sink;
mod source;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;

pub use sink::{DownloadSink, FileSink, MemorySink};
pub use source::{FileSource, MemorySource, UploadSource};

use crate::transfer::{CompletedPart, Progress, TransferError};

/// Location of an object in remote storage.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectTarget {
    scope: Option<String>,
    path: String,
}

impl ObjectTarget {
    /// Creates a target for `path` at the storage root.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            scope: None,
            path: path.into(),
        }
    }

    /// Places the target inside a directory scope.
    #[must_use]
    pub fn in_scope(mut self, scope: impl Into<String>) -> Self {
        let scope = scope.into();
        self.scope = if scope.trim_matches('/').is_empty() {
            None
        } else {
            Some(scope)
        };
        self
    }

    /// Directory scope, if any.
    #[must_use]
    pub fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }

    /// Object path relative to the scope.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Full object key: scope and path joined with a single `/`.
    #[must_use]
    pub fn key(&self) -> String {
        let segments = self
            .scope
            .iter()
            .flat_map(|scope| scope.split('/'))
            .chain(self.path.split('/'))
            .filter(|segment| !segment.is_empty());
        segments.collect::<Vec<_>>().join("/")
    }
}

impl fmt::Display for ObjectTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// Half-open byte range `[start, end)`; `end = None` means to the end of the object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ByteRange {
    start: u64,
    end: Option<u64>,
}

impl ByteRange {
    /// Creates a range.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::InvalidRequest`] when the range is empty or
    /// inverted.
    pub fn new(start: u64, end: Option<u64>) -> Result<Self, TransferError> {
        if let Some(end) = end
            && end <= start
        {
            return Err(TransferError::invalid_request(format!(
                "byte range {start}-{end} is empty or inverted"
            )));
        }
        Ok(Self { start, end })
    }

    /// Range from `start` to the end of the object.
    #[must_use]
    pub fn from_offset(start: u64) -> Self {
        Self { start, end: None }
    }

    /// First byte of the range.
    #[must_use]
    pub fn start(&self) -> u64 {
        self.start
    }

    /// Exclusive end of the range, if bounded.
    #[must_use]
    pub fn end(&self) -> Option<u64> {
        self.end
    }

    /// Clamps the range to an object of `total` bytes, returning `(start, end)`.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::InvalidRequest`] when the range starts at or
    /// past the end of a non-empty object.
    pub fn resolve(&self, total: u64) -> Result<(u64, u64), TransferError> {
        if total == 0 {
            return Ok((0, 0));
        }
        if self.start >= total {
            return Err(TransferError::invalid_request(format!(
                "range start {} is beyond the object size {total}",
                self.start
            )));
        }
        let end = self.end.map_or(total, |end| end.min(total));
        Ok((self.start, end))
    }

    /// `Range` header value with an inclusive end, e.g. `bytes=0-1023`.
    #[must_use]
    pub fn header_value(&self) -> String {
        match self.end {
            Some(end) => format!("bytes={}-{}", self.start, end - 1),
            None => format!("bytes={}-", self.start),
        }
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.end {
            Some(end) => write!(f, "{}-{end}", self.start),
            None => write!(f, "{}-", self.start),
        }
    }
}

/// Which way bytes move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Local source to remote object.
    Upload,
    /// Remote object to local sink.
    Download,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Upload => f.write_str("upload"),
            Self::Download => f.write_str("download"),
        }
    }
}

/// Stable identity of a transfer, used to deduplicate concurrent requests.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskId(String);

impl TaskId {
    /// Derives the identifier from direction, target and range.
    #[must_use]
    pub fn derive(direction: Direction, target: &ObjectTarget, range: Option<&ByteRange>) -> Self {
        let range = range.map_or_else(|| "*".to_string(), ToString::to_string);
        Self(format!("{direction}:{}:{range}", target.key()))
    }

    /// The identifier as a string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where the bytes of a request come from or go to.
#[derive(Clone)]
pub(crate) enum Endpoint {
    Upload(Arc<dyn UploadSource>),
    Download(Arc<dyn DownloadSink>),
}

/// Immutable description of one upload or download.
#[derive(Clone)]
pub struct TransferRequest {
    target: ObjectTarget,
    endpoint: Endpoint,
    range: Option<ByteRange>,
    metadata: BTreeMap<String, String>,
    overwrite: bool,
    progress: Option<UnboundedSender<Progress>>,
    resume_key: Option<String>,
    completed_parts: Vec<CompletedPart>,
}

impl fmt::Debug for TransferRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferRequest")
            .field("direction", &self.direction())
            .field("target", &self.target)
            .field("range", &self.range)
            .field("metadata", &self.metadata)
            .field("overwrite", &self.overwrite)
            .field("resume_key", &self.resume_key)
            .field("completed_parts", &self.completed_parts.len())
            .finish_non_exhaustive()
    }
}

impl TransferRequest {
    /// Upload `source` to `target`.
    pub fn upload(target: ObjectTarget, source: impl UploadSource + 'static) -> Self {
        Self::with_endpoint(target, Endpoint::Upload(Arc::new(source)))
    }

    /// Download `target` into `sink`.
    pub fn download(target: ObjectTarget, sink: impl DownloadSink + 'static) -> Self {
        Self::with_endpoint(target, Endpoint::Download(Arc::new(sink)))
    }

    fn with_endpoint(target: ObjectTarget, endpoint: Endpoint) -> Self {
        Self {
            target,
            endpoint,
            range: None,
            metadata: BTreeMap::new(),
            overwrite: false,
            progress: None,
            resume_key: None,
            completed_parts: Vec::new(),
        }
    }

    /// Restricts a download to a byte range.
    #[must_use]
    pub fn with_range(mut self, range: ByteRange) -> Self {
        self.range = Some(range);
        self
    }

    /// Adds a custom metadata entry sent with the upload.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Replaces an existing object instead of failing with a conflict.
    #[must_use]
    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    /// Sends every progress update to `sender` as well as the task's watch channel.
    #[must_use]
    pub fn with_progress(mut self, sender: UnboundedSender<Progress>) -> Self {
        self.progress = Some(sender);
        self
    }

    /// Continues an upload session saved by an earlier process.
    #[must_use]
    pub fn resume_with_key(mut self, confirmation_key: impl Into<String>) -> Self {
        self.resume_key = Some(confirmation_key.into());
        self
    }

    /// Skips download parts already written to the sink by an earlier process.
    #[must_use]
    pub fn with_completed_parts(mut self, parts: Vec<CompletedPart>) -> Self {
        self.completed_parts = parts;
        self
    }

    /// Direction of the transfer.
    #[must_use]
    pub fn direction(&self) -> Direction {
        match self.endpoint {
            Endpoint::Upload(_) => Direction::Upload,
            Endpoint::Download(_) => Direction::Download,
        }
    }

    /// Identifier used for deduplication.
    #[must_use]
    pub fn task_id(&self) -> TaskId {
        TaskId::derive(self.direction(), &self.target, self.range.as_ref())
    }

    /// Remote object.
    #[must_use]
    pub fn target(&self) -> &ObjectTarget {
        &self.target
    }

    /// Requested byte range.
    #[must_use]
    pub fn range(&self) -> Option<&ByteRange> {
        self.range.as_ref()
    }

    /// Custom metadata.
    #[must_use]
    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    /// Whether an existing object may be replaced.
    #[must_use]
    pub fn is_overwrite(&self) -> bool {
        self.overwrite
    }

    /// Externally saved confirmation key.
    #[must_use]
    pub fn resume_key(&self) -> Option<&str> {
        self.resume_key.as_deref()
    }

    /// Externally saved download manifest.
    #[must_use]
    pub fn completed_parts(&self) -> &[CompletedPart] {
        &self.completed_parts
    }

    pub(crate) fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub(crate) fn progress_sender(&self) -> Option<&UnboundedSender<Progress>> {
        self.progress.as_ref()
    }
}
