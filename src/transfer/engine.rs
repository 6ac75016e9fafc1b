//! Transfer engine: owns the transport, the configuration and the task registry.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use transfer_core::api::{HttpApiConfig, HttpTransferApi};
//! use transfer_core::request::{FileSource, ObjectTarget, TransferRequest};
//! use transfer_core::transfer::{EngineConfig, TransferEngine};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let api = HttpTransferApi::new(
//!     HttpApiConfig::new("https://storage.example.com", "lib", "space").with_access_token("t"),
//! )?;
//! let engine = TransferEngine::new(Arc::new(api), EngineConfig::default())?;
//!
//! let request = TransferRequest::upload(
//!     ObjectTarget::new("report.pdf").in_scope("docs"),
//!     FileSource::new("./report.pdf"),
//! );
//! let task = engine.start(request);
//! let outcome = task.wait().await?;
//! println!("{outcome:?}");
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use futures_util::StreamExt;
use tracing::{debug, info, instrument};

use super::handshake;
use super::planner::{ChunkPlanner, DEFAULT_PART_SIZE};
use super::registry::TaskRegistry;
use super::retry::RetryPolicy;
use super::session::DownloadSession;
use super::task::{TaskState, TransferTask};
use super::TransferError;
use crate::api::{ByteStream, TransferApi};
use crate::request::{ByteRange, ObjectTarget, TaskId, TransferRequest};

/// Minimum allowed concurrency value.
const MIN_CONCURRENCY: usize = 1;

/// Maximum allowed concurrency value.
const MAX_CONCURRENCY: usize = 32;

/// Default number of parts in flight per task.
pub const DEFAULT_CONCURRENCY: usize = 3;

/// Smallest accepted part size (64 KiB).
const MIN_PART_SIZE: u64 = 64 * 1024;

/// Largest accepted part size (5 GiB).
const MAX_PART_SIZE: u64 = 5 * 1024 * 1024 * 1024;

/// Error type for engine construction.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Invalid concurrency value provided.
    #[error(
        "invalid concurrency value {value}: must be between {MIN_CONCURRENCY} and {MAX_CONCURRENCY}"
    )]
    InvalidConcurrency {
        /// The invalid value that was provided.
        value: usize,
    },

    /// Invalid part size provided.
    #[error("invalid part size {value}: must be between {MIN_PART_SIZE} and {MAX_PART_SIZE} bytes")]
    InvalidPartSize {
        /// The invalid value that was provided.
        value: u64,
    },
}

/// Settings shared by every task of an engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Bytes per part.
    pub part_size: u64,
    /// Parts in flight per task.
    pub concurrency: usize,
    /// Retry behaviour for transient part failures.
    pub retry_policy: RetryPolicy,
    /// Check part tags against local MD5 digests and whole objects against
    /// the service's CRC64.
    pub verify_integrity: bool,
    /// Skip uploads whose bytes already match the stored object's CRC64.
    pub quick_upload: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            part_size: DEFAULT_PART_SIZE,
            concurrency: DEFAULT_CONCURRENCY,
            retry_policy: RetryPolicy::default(),
            verify_integrity: true,
            quick_upload: true,
        }
    }
}

impl EngineConfig {
    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] naming the first out-of-range value.
    pub fn validate(&self) -> Result<(), EngineError> {
        if !(MIN_CONCURRENCY..=MAX_CONCURRENCY).contains(&self.concurrency) {
            return Err(EngineError::InvalidConcurrency {
                value: self.concurrency,
            });
        }
        if !(MIN_PART_SIZE..=MAX_PART_SIZE).contains(&self.part_size) {
            return Err(EngineError::InvalidPartSize {
                value: self.part_size,
            });
        }
        Ok(())
    }
}

/// Entry point for uploads and downloads.
///
/// Dropping the engine cancels every running task. Paused uploads are left
/// alone so their session can still be resumed by confirmation key.
pub struct TransferEngine {
    api: Arc<dyn TransferApi>,
    config: EngineConfig,
    registry: TaskRegistry,
}

impl TransferEngine {
    /// Creates an engine.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] if the configuration is out of range.
    pub fn new(api: Arc<dyn TransferApi>, config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        info!(
            part_size = config.part_size,
            concurrency = config.concurrency,
            max_attempts = config.retry_policy.max_attempts(),
            "transfer engine created"
        );
        Ok(Self {
            api,
            config,
            registry: TaskRegistry::new(),
        })
    }

    /// Returns the task for `request`, creating it if no identical transfer is active.
    ///
    /// The task is not started.
    #[instrument(skip(self, request), fields(task_id = %request.task_id()))]
    pub fn submit(&self, request: TransferRequest) -> TransferTask {
        let api = Arc::clone(&self.api);
        let config = self.config.clone();
        let (task, created) = self
            .registry
            .get_or_insert_with(request.task_id(), move |handle| {
                TransferTask::new(request, api, config, handle)
            });
        if created {
            debug!("task registered");
        }
        task
    }

    /// Like [`submit`](Self::submit), then starts the task if it has not been started.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self, request: TransferRequest) -> TransferTask {
        let task = self.submit(request);
        task.start();
        task
    }

    /// The active task with identifier `id`.
    #[must_use]
    pub fn task(&self, id: &TaskId) -> Option<TransferTask> {
        self.registry.get(id)
    }

    /// Cancels every active task.
    pub fn cancel_all(&self) {
        let active = self.registry.len();
        if active > 0 {
            info!(active, "canceling all tasks");
        }
        self.registry.cancel_all();
    }

    /// Resolves `target` and opens its body as a stream instead of writing to a sink.
    ///
    /// Without range support the stream carries the whole object, whatever
    /// `range` asked for; check [`DownloadSession::range_supported`].
    ///
    /// # Errors
    ///
    /// Returns the handshake or fetch error.
    #[instrument(skip(self), fields(key = %target.key()))]
    pub async fn open_stream(
        &self,
        target: &ObjectTarget,
        range: Option<ByteRange>,
    ) -> Result<(DownloadSession, ByteStream), TransferError> {
        let session = handshake::resolve_download(
            self.api.as_ref(),
            target,
            range.as_ref(),
            &[],
            ChunkPlanner::new(u64::MAX),
        )
        .await?;

        let stream = match session.parts().first() {
            Some(part) => {
                self.api
                    .fetch_range(session.url(), part.offset, session.fetch_length(part))
                    .await?
            }
            None => futures_util::stream::empty().boxed(),
        };
        Ok((session, stream))
    }

    /// The task registry.
    #[must_use]
    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    /// The configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

impl Drop for TransferEngine {
    fn drop(&mut self) {
        for id in self.registry.ids() {
            let Some(task) = self.registry.get(&id) else {
                continue;
            };
            if task.state() != TaskState::Paused {
                task.cancel();
            }
        }
    }
}
