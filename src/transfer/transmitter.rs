//! Moves one part over the wire, retrying transient failures.

use std::sync::Arc;

use futures_util::StreamExt;
use md5::{Digest, Md5};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use super::planner::PartDescriptor;
use super::progress::ProgressTracker;
use super::retry::{FailureType, RetryDecision, RetryPolicy, classify_error, server_retry_after};
use super::session::DownloadSession;
use super::TransferError;
use crate::api::TransferApi;
use crate::request::{DownloadSink, UploadSource};

/// Lowercase hex MD5 of `bytes`.
#[must_use]
pub fn md5_hex(bytes: &[u8]) -> String {
    hex::encode(Md5::digest(bytes))
}

/// Returns the tag as an MD5 hex digest if it is one (quotes stripped, lowercased).
pub(crate) fn as_md5_tag(tag: &str) -> Option<String> {
    let tag = tag.trim().trim_matches('"');
    (tag.len() == 32 && tag.bytes().all(|b| b.is_ascii_hexdigit()))
        .then(|| tag.to_ascii_lowercase())
}

/// Executes single-part exchanges for one task.
///
/// Every remote call races the task's cancellation token, so a canceled
/// task releases its connections without waiting for in-flight parts.
#[derive(Clone)]
pub struct PartTransmitter {
    api: Arc<dyn TransferApi>,
    retry_policy: RetryPolicy,
    verify_integrity: bool,
    cancel: CancellationToken,
}

impl PartTransmitter {
    /// Creates a transmitter bound to `cancel`.
    pub fn new(
        api: Arc<dyn TransferApi>,
        retry_policy: RetryPolicy,
        verify_integrity: bool,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            api,
            retry_policy,
            verify_integrity,
            cancel,
        }
    }

    /// Uploads `part` of `source` and returns the tag the service assigned.
    ///
    /// Progress advances by the whole part once the service acknowledges it;
    /// bytes of a part still in flight are not reported.
    ///
    /// # Errors
    ///
    /// Returns the last error once retries are exhausted, or the first
    /// non-transient one.
    #[instrument(skip(self, source, progress), fields(part_index = part.index, bytes = part.length))]
    pub async fn upload_part(
        &self,
        confirmation_key: &str,
        part: &PartDescriptor,
        source: &dyn UploadSource,
        progress: &ProgressTracker,
    ) -> Result<String, TransferError> {
        let bytes = self
            .cancellable(source.read_range(part.offset, part.length))
            .await?;
        let local_digest = md5_hex(&bytes);

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            debug!(attempt, "uploading part");

            let result = self
                .cancellable(self.api.upload_part(confirmation_key, part.index, bytes.clone()))
                .await
                .and_then(|tag| self.verify_upload_tag(part.index, &local_digest, tag));

            match result {
                Ok(tag) => {
                    progress.record(part.index, part.length);
                    return Ok(tag);
                }
                Err(e) => self.backoff(e, attempt, part.index).await?,
            }
        }
    }

    /// Fetches `part` of `session` into `sink`.
    ///
    /// # Errors
    ///
    /// Returns the last error once retries are exhausted, or the first
    /// non-transient one.
    #[instrument(skip(self, session, sink, progress), fields(part_index = part.index, bytes = part.length))]
    pub async fn download_part(
        &self,
        session: &DownloadSession,
        part: &PartDescriptor,
        sink: &dyn DownloadSink,
        progress: &ProgressTracker,
    ) -> Result<(), TransferError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            debug!(attempt, "fetching part");

            match self.try_download(session, part, sink, progress).await {
                Ok(()) => return Ok(()),
                Err(e) => self.backoff(e, attempt, part.index).await?,
            }
        }
    }

    async fn try_download(
        &self,
        session: &DownloadSession,
        part: &PartDescriptor,
        sink: &dyn DownloadSink,
        progress: &ProgressTracker,
    ) -> Result<(), TransferError> {
        let mut stream = self
            .cancellable(
                self.api
                    .fetch_range(session.url(), part.offset, session.fetch_length(part)),
            )
            .await?;

        let base = session.sink_offset(part);
        let mut received = 0u64;
        loop {
            let next = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Err(TransferError::Canceled),
                next = stream.next() => next,
            };
            let Some(chunk) = next else { break };
            let chunk = chunk?;

            let end = received + chunk.len() as u64;
            if end > part.length {
                return Err(TransferError::integrity(
                    part.index,
                    format!("{} bytes", part.length),
                    format!("at least {end} bytes"),
                ));
            }
            sink.write_at(base + received, &chunk).await?;
            received = end;
            progress.record(part.index, received);
        }

        if received != part.length {
            return Err(TransferError::integrity(
                part.index,
                format!("{} bytes", part.length),
                format!("{received} bytes"),
            ));
        }
        Ok(())
    }

    fn verify_upload_tag(
        &self,
        part_index: u32,
        local_digest: &str,
        tag: String,
    ) -> Result<String, TransferError> {
        if self.verify_integrity
            && let Some(remote) = as_md5_tag(&tag)
            && remote != local_digest
        {
            return Err(TransferError::integrity(part_index, local_digest, remote));
        }
        Ok(tag)
    }

    /// Sleeps before the next attempt, or returns the error if it should not be retried.
    async fn backoff(
        &self,
        error: TransferError,
        attempt: u32,
        part_index: u32,
    ) -> Result<(), TransferError> {
        let failure_type = classify_error(&error);
        match self.retry_policy.should_retry(failure_type, attempt) {
            RetryDecision::Retry {
                delay: backoff_delay,
                attempt: next_attempt,
            } => {
                let retry_after = server_retry_after(&error);
                let delay = retry_after.unwrap_or(backoff_delay);
                debug!(
                    part_index,
                    attempt = next_attempt,
                    max_attempts = self.retry_policy.max_attempts(),
                    delay_ms = delay.as_millis(),
                    using_retry_after = retry_after.is_some(),
                    error = %error,
                    "retrying part"
                );
                tokio::select! {
                    biased;
                    () = self.cancel.cancelled() => Err(TransferError::Canceled),
                    () = tokio::time::sleep(delay) => Ok(()),
                }
            }
            RetryDecision::DoNotRetry { reason } => {
                if failure_type == FailureType::Transient {
                    warn!(part_index, attempt, error = %error, "retries exhausted");
                } else {
                    debug!(part_index, %reason, "not retrying part");
                }
                Err(error)
            }
        }
    }

    async fn cancellable<T>(
        &self,
        operation: impl Future<Output = Result<T, TransferError>>,
    ) -> Result<T, TransferError> {
        until_canceled(&self.cancel, operation).await
    }
}

/// Runs `operation` unless `cancel` fires first.
pub(crate) async fn until_canceled<T>(
    cancel: &CancellationToken,
    operation: impl Future<Output = Result<T, TransferError>>,
) -> Result<T, TransferError> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(TransferError::Canceled),
        result = operation => result,
    }
}
