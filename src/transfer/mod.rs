//! Multipart transfer engine.
//!
//! Uploads are split into parts, sent concurrently against a multipart
//! session and confirmed once every part is acknowledged. Downloads are
//! resolved to a fetch URL and pulled in ranges into a sink. Both run as
//! [`TransferTask`]s with explicit states, progress channels and a single
//! terminal outcome.
//!
//! # Features
//!
//! - Bounded part concurrency per task (semaphore-gated)
//! - Transient failures retried per part with exponential backoff
//! - Resume from a saved confirmation key or part manifest
//! - Whole-object CRC64 checks and quick upload of unchanged objects
//! - Pause/resume for uploads, cancellation for everything
//! - Deduplication of identical in-flight requests

mod checksum;
mod engine;
mod error;
mod handshake;
mod planner;
mod progress;
mod registry;
mod retry;
mod session;
mod task;
mod transmitter;

pub use checksum::{crc64, format_crc64, parse_crc64};
pub use engine::{DEFAULT_CONCURRENCY, EngineConfig, EngineError, TransferEngine};
pub use error::{Rejection, TransferError};
pub use planner::{ChunkPlanner, CompletedPart, DEFAULT_PART_SIZE, PartDescriptor, PartState};
pub use progress::{Progress, ProgressTracker};
pub use registry::TaskRegistry;
pub use retry::{DEFAULT_MAX_RETRIES, FailureType, RetryDecision, RetryPolicy, classify_error};
pub use session::{DownloadSession, UploadSession};
pub use task::{TaskResult, TaskState, TransferOutcome, TransferTask};
pub use transmitter::{PartTransmitter, md5_hex};
