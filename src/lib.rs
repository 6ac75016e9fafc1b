//! Transfer Engine Core Library
//!
//! Resumable multipart uploads and ranged downloads against an
//! object-storage service.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`request`] - Transfer requests, targets, ranges, sources and sinks
//! - [`api`] - The remote storage contract and its HTTP implementation
//! - [`transfer`] - Planner, part transmitter, tasks, registry and engine

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod api;
pub mod request;
pub mod transfer;

mod user_agent;

// Re-export commonly used types
pub use api::{HttpApiConfig, HttpTransferApi, TransferApi};
pub use request::{
    ByteRange, DownloadSink, FileSink, FileSource, MemorySink, MemorySource, ObjectTarget,
    TaskId, TransferRequest, UploadSource,
};
pub use transfer::{
    DEFAULT_CONCURRENCY, DEFAULT_MAX_RETRIES, EngineConfig, EngineError, Progress, RetryPolicy,
    TaskState, TransferEngine, TransferError, TransferOutcome, TransferTask,
};
