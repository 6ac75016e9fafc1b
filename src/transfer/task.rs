//! Transfer task: one upload or download from handshake to terminal result.
//!
//! A [`TransferTask`] is a cheap handle; clones share the same state, so
//! every caller attached through the registry observes the same progress
//! and the same terminal outcome.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::engine::EngineConfig;
use super::handshake;
use super::planner::{ChunkPlanner, CompletedPart, PartDescriptor, PartState};
use super::progress::{Progress, ProgressTracker};
use super::registry::RegistryHandle;
use super::session::{DownloadSession, UploadSession};
use super::transmitter::{PartTransmitter, until_canceled};
use super::checksum::{format_crc64, parse_crc64, sink_crc64, source_crc64};
use super::TransferError;
use crate::api::{ConfirmedObject, RemoteMetadata, TransferApi};
use crate::request::{Direction, Endpoint, TaskId, TransferRequest};

/// Lifecycle of a transfer task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    /// Built but not started.
    Created,
    /// Running the handshake.
    Initiating,
    /// Moving parts.
    Transferring,
    /// Confirming the upload or finishing the sink.
    Finalizing,
    /// Upload stopped by [`TransferTask::pause`]; resumable.
    Paused,
    /// Terminal success.
    Completed,
    /// Terminal: canceled by the caller.
    Canceled,
    /// Terminal: a non-retryable error occurred.
    Failed,
}

impl TaskState {
    /// Whether no further transition is possible.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Canceled | Self::Failed)
    }

    /// Whether the machine allows moving from `self` to `next`.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use TaskState::{
            Canceled, Completed, Created, Failed, Finalizing, Initiating, Paused, Transferring,
        };
        matches!(
            (self, next),
            (Created, Initiating | Canceled)
                | (Initiating, Transferring | Paused | Canceled | Failed)
                | (Transferring, Finalizing | Paused | Canceled | Failed)
                | (Finalizing, Completed | Canceled | Failed)
                | (Paused, Initiating | Canceled)
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Initiating => "initiating",
            Self::Transferring => "transferring",
            Self::Finalizing => "finalizing",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Canceled => "canceled",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// What a successful transfer produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    /// The object was committed.
    Uploaded {
        /// Committed object.
        object: ConfirmedObject,
        /// Size of the uploaded object.
        bytes: u64,
        /// Whether an identical object was already stored and no bytes were sent.
        quick: bool,
    },
    /// The requested bytes are in the sink.
    Downloaded {
        /// Bytes written to the sink.
        bytes: u64,
        /// Remote object metadata.
        metadata: RemoteMetadata,
    },
}

/// Terminal result of a task.
pub type TaskResult = Result<TransferOutcome, TransferError>;

#[derive(Default)]
struct Control {
    cancel: CancellationToken,
    pause_requested: bool,
}

#[derive(Default)]
struct Sessions {
    upload: Option<UploadSession>,
    download: Option<DownloadSession>,
}

struct TaskShared {
    id: TaskId,
    request: TransferRequest,
    api: Arc<dyn TransferApi>,
    config: EngineConfig,
    state_tx: watch::Sender<TaskState>,
    outcome_tx: watch::Sender<Option<TaskResult>>,
    progress: ProgressTracker,
    control: Mutex<Control>,
    sessions: Mutex<Sessions>,
    registry: RegistryHandle,
}

/// Handle to a transfer task.
#[derive(Clone)]
pub struct TransferTask {
    shared: Arc<TaskShared>,
}

impl fmt::Debug for TransferTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferTask")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .field("progress", &self.progress())
            .finish_non_exhaustive()
    }
}

impl TransferTask {
    pub(crate) fn new(
        request: TransferRequest,
        api: Arc<dyn TransferApi>,
        config: EngineConfig,
        registry: RegistryHandle,
    ) -> Self {
        let (state_tx, _) = watch::channel(TaskState::Created);
        let (outcome_tx, _) = watch::channel(None);
        let progress = ProgressTracker::new(request.progress_sender().cloned());
        Self {
            shared: Arc::new(TaskShared {
                id: request.task_id(),
                request,
                api,
                config,
                state_tx,
                outcome_tx,
                progress,
                control: Mutex::new(Control::default()),
                sessions: Mutex::new(Sessions::default()),
                registry,
            }),
        }
    }

    /// Task identifier.
    #[must_use]
    pub fn id(&self) -> &TaskId {
        &self.shared.id
    }

    /// Upload or download.
    #[must_use]
    pub fn direction(&self) -> Direction {
        self.shared.request.direction()
    }

    /// The request this task carries out.
    #[must_use]
    pub fn request(&self) -> &TransferRequest {
        &self.shared.request
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> TaskState {
        *self.shared.state_tx.borrow()
    }

    /// Receiver notified on every state change.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<TaskState> {
        self.shared.state_tx.subscribe()
    }

    /// Latest progress snapshot.
    #[must_use]
    pub fn progress(&self) -> Progress {
        self.shared.progress.snapshot()
    }

    /// Receiver notified on every progress update.
    #[must_use]
    pub fn watch_progress(&self) -> watch::Receiver<Progress> {
        self.shared.progress.subscribe()
    }

    /// Confirmation key of the upload session, once initiated.
    ///
    /// Persist it with [`completed_parts`](Self::completed_parts) to resume
    /// from another process via [`TransferRequest::resume_with_key`].
    #[must_use]
    pub fn confirmation_key(&self) -> Option<String> {
        self.sessions()
            .upload
            .as_ref()
            .map(|s| s.confirmation_key().to_string())
    }

    /// Parts done so far.
    #[must_use]
    pub fn completed_parts(&self) -> Vec<CompletedPart> {
        let sessions = self.sessions();
        if let Some(upload) = &sessions.upload {
            return upload.completed_parts();
        }
        sessions.download.as_ref().map_or_else(Vec::new, |download| {
            download
                .parts
                .iter()
                .filter_map(PartDescriptor::as_completed)
                .collect()
        })
    }

    /// Whether two handles refer to the same task.
    #[must_use]
    pub fn same_task(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Starts the task. Returns false if it was already started or has ended.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> bool {
        let control = self.control();
        if !self.transition(TaskState::Created, TaskState::Initiating) {
            return false;
        }
        info!(task_id = %self.id(), "task started");
        self.spawn_run(control.cancel.clone());
        true
    }

    /// Requests cancellation.
    ///
    /// A running task stops scheduling parts, interrupts in-flight ones and
    /// resolves to [`TransferError::Canceled`]; an unstarted or paused task
    /// is canceled immediately. Has no effect on a finished task.
    pub fn cancel(&self) {
        let mut control = self.control();
        match self.state() {
            TaskState::Created => {
                if self.transition(TaskState::Created, TaskState::Canceled) {
                    drop(control);
                    info!(task_id = %self.id(), "task canceled before start");
                    self.settle(Err(TransferError::Canceled));
                }
            }
            TaskState::Paused => {
                if self.transition(TaskState::Paused, TaskState::Canceled) {
                    drop(control);
                    info!(task_id = %self.id(), "paused task canceled");
                    if let Some(key) = self.abortable_key() {
                        self.spawn_abort(key);
                    }
                    self.settle(Err(TransferError::Canceled));
                }
            }
            state if state.is_terminal() => {}
            _ => {
                debug!(task_id = %self.id(), "cancellation requested");
                control.pause_requested = false;
                control.cancel.cancel();
            }
        }
    }

    /// Pauses a running upload; the session is kept so [`resume`](Self::resume)
    /// can continue it.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::InvalidRequest`] for downloads and for tasks
    /// that are not initiating or transferring.
    pub fn pause(&self) -> Result<(), TransferError> {
        if self.direction() != Direction::Upload {
            return Err(TransferError::invalid_request(
                "only uploads can be paused",
            ));
        }
        let mut control = self.control();
        match self.state() {
            TaskState::Initiating | TaskState::Transferring => {
                debug!(task_id = %self.id(), "pause requested");
                control.pause_requested = true;
                control.cancel.cancel();
                Ok(())
            }
            state => Err(TransferError::invalid_request(format!(
                "cannot pause a task that is {state}"
            ))),
        }
    }

    /// Resumes a paused upload by re-listing the parts of its session.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::InvalidRequest`] if the task is not paused.
    pub fn resume(&self) -> Result<(), TransferError> {
        let mut control = self.control();
        if !self.transition(TaskState::Paused, TaskState::Initiating) {
            return Err(TransferError::invalid_request(format!(
                "cannot resume a task that is {}",
                self.state()
            )));
        }
        info!(task_id = %self.id(), "task resumed");
        control.cancel = CancellationToken::new();
        control.pause_requested = false;
        self.spawn_run(control.cancel.clone());
        Ok(())
    }

    /// Waits for the terminal outcome.
    ///
    /// A task that is never started (and never canceled) never resolves.
    pub async fn wait(&self) -> TaskResult {
        let mut rx = self.shared.outcome_tx.subscribe();
        match rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone().unwrap_or(Err(TransferError::Canceled)),
            // The sender lives as long as `self.shared`.
            Err(_) => Err(TransferError::Canceled),
        }
    }

    fn spawn_run(&self, cancel: CancellationToken) {
        let task = self.clone();
        tokio::spawn(async move {
            let result = match task.direction() {
                Direction::Upload => task.run_upload(&cancel).await,
                Direction::Download => task.run_download(&cancel).await,
            };
            task.finish(result).await;
        });
    }

    #[instrument(skip_all, fields(task_id = %self.id()))]
    async fn run_upload(&self, cancel: &CancellationToken) -> TaskResult {
        let shared = &self.shared;
        let Endpoint::Upload(source) = shared.request.endpoint() else {
            return Err(TransferError::invalid_request("upload task without a source"));
        };
        let known_key = self
            .confirmation_key()
            .or_else(|| shared.request.resume_key().map(ToString::to_string));

        let total = until_canceled(cancel, source.len()).await?;
        let checksum = if shared.config.verify_integrity || shared.config.quick_upload {
            Some(until_canceled(cancel, source_crc64(source.as_ref(), total)).await?)
        } else {
            None
        };

        if shared.config.quick_upload
            && let Some(local) = checksum
            && let Some(object) = until_canceled(cancel, async {
                Ok(handshake::find_identical(
                    shared.api.as_ref(),
                    shared.request.target(),
                    local,
                    total,
                )
                .await)
            })
            .await?
        {
            shared.progress.begin(total, total);
            self.advance(TaskState::Initiating, TaskState::Transferring, cancel)?;
            self.advance(TaskState::Transferring, TaskState::Finalizing, cancel)?;
            return Ok(TransferOutcome::Uploaded {
                object,
                bytes: total,
                quick: true,
            });
        }

        let session = until_canceled(
            cancel,
            handshake::prepare_upload(
                shared.api.as_ref(),
                &shared.request,
                source.as_ref(),
                total,
                ChunkPlanner::new(shared.config.part_size),
                known_key.as_deref(),
                shared.config.verify_integrity,
            ),
        )
        .await?;

        let key = session.confirmation_key().to_string();
        let pending: Vec<PartDescriptor> = super::planner::pending(session.parts())
            .cloned()
            .collect();
        shared.progress.begin(total, session.bytes_done());
        self.sessions().upload = Some(session);
        self.advance(TaskState::Initiating, TaskState::Transferring, cancel)?;

        let transmitter = self.transmitter(cancel);
        let part_source = Arc::clone(source);
        let task = self.clone();
        self.drive_parts(pending, cancel, move |part| {
            let transmitter = transmitter.clone();
            let source = Arc::clone(&part_source);
            let key = key.clone();
            let task = task.clone();
            async move {
                transmitter
                    .upload_part(&key, &part, source.as_ref(), &task.shared.progress)
                    .await
            }
        })
        .await?;

        self.advance(TaskState::Transferring, TaskState::Finalizing, cancel)?;
        if shared.config.verify_integrity
            && let Some(expected) = checksum
        {
            let actual = until_canceled(cancel, source_crc64(source.as_ref(), total)).await?;
            if actual != expected {
                warn!(expected, actual, "source changed while uploading");
                return Err(TransferError::checksum_mismatch(expected, actual));
            }
        }
        let key = {
            let mut sessions = self.sessions();
            let session = sessions.upload.as_mut().ok_or_else(|| {
                TransferError::invalid_request("upload session missing at confirm")
            })?;
            session.consume()?;
            session.confirmation_key().to_string()
        };
        let crc64 = checksum.map(format_crc64);
        let object =
            handshake::confirm_upload(shared.api.as_ref(), &key, crc64.as_deref()).await?;
        Ok(TransferOutcome::Uploaded {
            object,
            bytes: total,
            quick: false,
        })
    }

    #[instrument(skip_all, fields(task_id = %self.id()))]
    async fn run_download(&self, cancel: &CancellationToken) -> TaskResult {
        let shared = &self.shared;
        let Endpoint::Download(sink) = shared.request.endpoint() else {
            return Err(TransferError::invalid_request("download task without a sink"));
        };

        let session = until_canceled(
            cancel,
            handshake::resolve_download(
                shared.api.as_ref(),
                shared.request.target(),
                shared.request.range(),
                shared.request.completed_parts(),
                ChunkPlanner::new(shared.config.part_size),
            ),
        )
        .await?;

        let length = session.transfer_len();
        let pending: Vec<PartDescriptor> = super::planner::pending(&session.parts)
            .cloned()
            .collect();
        let already_done = length - pending.iter().map(|p| p.length).sum::<u64>();
        let metadata = session.metadata.clone();
        let whole_object = session.start == 0 && session.end == session.total_size;
        let view = Arc::new(session.clone());
        self.sessions().download = Some(session);

        until_canceled(cancel, sink.prepare(length)).await?;
        shared.progress.begin(length, already_done);
        self.advance(TaskState::Initiating, TaskState::Transferring, cancel)?;

        let transmitter = self.transmitter(cancel);
        let part_sink = Arc::clone(sink);
        let tag = metadata.tag.clone().unwrap_or_default();
        let task = self.clone();
        self.drive_parts(pending, cancel, move |part| {
            let transmitter = transmitter.clone();
            let sink = Arc::clone(&part_sink);
            let view = Arc::clone(&view);
            let task = task.clone();
            let tag = tag.clone();
            async move {
                transmitter
                    .download_part(&view, &part, sink.as_ref(), &task.shared.progress)
                    .await
                    .map(|()| tag)
            }
        })
        .await?;

        self.advance(TaskState::Transferring, TaskState::Finalizing, cancel)?;
        sink.finish().await?;
        if shared.config.verify_integrity
            && whole_object
            && let Some(expected) = metadata.crc64.as_deref().and_then(parse_crc64)
        {
            match until_canceled(cancel, sink_crc64(sink.as_ref(), length)).await? {
                Some(actual) if actual != expected => {
                    warn!(expected, actual, "downloaded object failed its checksum");
                    return Err(TransferError::checksum_mismatch(expected, actual));
                }
                Some(_) => debug!("downloaded object checksum verified"),
                None => debug!("sink cannot be read back, checksum skipped"),
            }
        }
        Ok(TransferOutcome::Downloaded {
            bytes: length,
            metadata,
        })
    }

    /// Runs `transmit` for every pending part, at most `concurrency` at a time.
    ///
    /// Stops scheduling on cancellation or on the first part that fails for
    /// good; that error interrupts the remaining in-flight parts and is the
    /// one returned.
    async fn drive_parts<F, Fut>(
        &self,
        pending: Vec<PartDescriptor>,
        cancel: &CancellationToken,
        transmit: F,
    ) -> Result<(), TransferError>
    where
        F: Fn(PartDescriptor) -> Fut,
        Fut: Future<Output = Result<String, TransferError>> + Send + 'static,
    {
        let semaphore = Arc::new(Semaphore::new(self.shared.config.concurrency));
        let mut queue = pending.into_iter().peekable();
        let mut in_flight = JoinSet::new();
        let mut first_error: Option<TransferError> = None;

        loop {
            while first_error.is_none() && !cancel.is_cancelled() && queue.peek().is_some() {
                let Ok(permit) = Arc::clone(&semaphore).try_acquire_owned() else {
                    break;
                };
                let Some(part) = queue.next() else { break };
                debug!(part_index = part.index, offset = part.offset, "scheduling part");
                self.update_part(part.index, |p| p.state = PartState::InFlight);

                let index = part.index;
                let exchange = transmit(part);
                in_flight.spawn(async move {
                    // Held until the part finishes.
                    let _permit = permit;
                    (index, exchange.await)
                });
            }

            let Some(joined) = in_flight.join_next().await else {
                break;
            };
            match joined {
                Ok((index, Ok(tag))) => {
                    debug!(part_index = index, "part done");
                    self.update_part(index, |p| p.complete(tag));
                }
                Ok((index, Err(TransferError::Canceled))) => {
                    self.update_part(index, |p| p.state = PartState::Pending);
                }
                Ok((index, Err(e))) => {
                    warn!(part_index = index, error = %e, "part failed");
                    self.update_part(index, |p| p.state = PartState::Failed);
                    if first_error.is_none() {
                        first_error = Some(e);
                        in_flight.abort_all();
                    }
                }
                Err(join_error) if join_error.is_cancelled() => {}
                Err(join_error) => {
                    if first_error.is_none() {
                        first_error = Some(TransferError::io(
                            "running a part exchange",
                            std::io::Error::other(join_error.to_string()),
                        ));
                        in_flight.abort_all();
                    }
                }
            }
        }

        if let Some(error) = first_error {
            return Err(error);
        }
        if cancel.is_cancelled() {
            return Err(TransferError::Canceled);
        }
        Ok(())
    }

    /// Records the terminal (or paused) result of a run.
    async fn finish(&self, result: TaskResult) {
        let id = self.id().clone();
        match result {
            Ok(outcome) => {
                self.shared.progress.complete();
                self.force_transition(TaskState::Completed);
                info!(task_id = %id, "task completed");
                self.settle(Ok(outcome));
            }
            Err(TransferError::Canceled) => {
                let paused = {
                    let control = self.control();
                    control.pause_requested
                        && self.transition(self.state(), TaskState::Paused)
                };
                if paused {
                    self.reset_in_flight_parts();
                    info!(task_id = %id, "task paused");
                    return;
                }
                self.force_transition(TaskState::Canceled);
                info!(task_id = %id, "task canceled");
                if let Some(key) = self.abortable_key() {
                    abort_quietly(self.shared.api.as_ref(), &key).await;
                }
                self.settle(Err(TransferError::Canceled));
            }
            Err(e) => {
                self.force_transition(TaskState::Failed);
                warn!(task_id = %id, error = %e, "task failed");
                self.settle(Err(e));
            }
        }
    }

    /// Leaves the registry, then publishes the terminal outcome.
    fn settle(&self, result: TaskResult) {
        self.shared.registry.remove(self);
        self.shared.outcome_tx.send_replace(Some(result));
    }

    fn advance(
        &self,
        from: TaskState,
        to: TaskState,
        cancel: &CancellationToken,
    ) -> Result<(), TransferError> {
        if cancel.is_cancelled() || !self.transition(from, to) {
            return Err(TransferError::Canceled);
        }
        debug!(task_id = %self.id(), state = %to, "state changed");
        Ok(())
    }

    /// Moves `from -> to` if the task is in `from` and the move is legal.
    fn transition(&self, from: TaskState, to: TaskState) -> bool {
        let mut current = from;
        let moved = self.shared.state_tx.send_if_modified(|state| {
            current = *state;
            if *state == from && from.can_transition_to(to) {
                *state = to;
                true
            } else {
                false
            }
        });
        if !moved && current == from {
            warn!(task_id = %self.id(), from = %from, to = %to, "refused state transition");
        } else if !moved {
            debug!(task_id = %self.id(), state = %current, to = %to, "transition skipped");
        }
        moved
    }

    /// Moves from whatever the current state is to the terminal `to`, if legal.
    fn force_transition(&self, to: TaskState) {
        let current = self.state();
        self.transition(current, to);
    }

    fn reset_in_flight_parts(&self) {
        let mut sessions = self.sessions();
        if let Some(upload) = sessions.upload.as_mut() {
            for index in upload.missing_parts() {
                upload.set_state(index, PartState::Pending);
            }
        }
    }

    fn update_part(&self, index: u32, update: impl FnOnce(&mut PartDescriptor)) {
        let mut guard = self.sessions();
        let sessions = &mut *guard;
        let parts = match (&mut sessions.upload, &mut sessions.download) {
            (Some(upload), _) => upload.parts_mut(),
            (None, Some(download)) => download.parts.as_mut_slice(),
            (None, None) => return,
        };
        if let Some(part) = parts.iter_mut().find(|p| p.index == index) {
            update(part);
        }
    }

    fn abortable_key(&self) -> Option<String> {
        self.sessions()
            .upload
            .as_ref()
            .filter(|s| !s.is_consumed())
            .map(|s| s.confirmation_key().to_string())
    }

    fn spawn_abort(&self, key: String) {
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let api = Arc::clone(&self.shared.api);
            runtime.spawn(async move { abort_quietly(api.as_ref(), &key).await });
        }
    }

    fn transmitter(&self, cancel: &CancellationToken) -> PartTransmitter {
        PartTransmitter::new(
            Arc::clone(&self.shared.api),
            self.shared.config.retry_policy.clone(),
            self.shared.config.verify_integrity,
            cancel.child_token(),
        )
    }

    fn control(&self) -> MutexGuard<'_, Control> {
        self.shared
            .control
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn sessions(&self) -> MutexGuard<'_, Sessions> {
        self.shared
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

async fn abort_quietly(api: &dyn TransferApi, key: &str) {
    match api.abort_upload(key).await {
        Ok(()) => debug!(confirmation_key = key, "upload session aborted"),
        Err(e) => warn!(confirmation_key = key, error = %e, "failed to abort upload session"),
    }
}
