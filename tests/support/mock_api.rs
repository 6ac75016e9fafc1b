//! Scripted in-memory `TransferApi` for engine tests.
//!
//! Keeps upload sessions and committed objects in memory, counts every call,
//! and can inject transient failures or hold part uploads in flight.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::Semaphore;
use transfer_core::api::{
    ByteStream, ConfirmedObject, InitiatedUpload, ObjectInfo, PartManifest, RemoteMetadata,
    ResolvedDownload, TransferApi,
};
use transfer_core::request::{ByteRange, ObjectTarget};
use transfer_core::transfer::{
    CompletedPart, Rejection, TransferError, crc64, format_crc64, md5_hex,
};

/// Size of the chunks `fetch_range` streams.
const STREAM_CHUNK: usize = 16 * 1024;

#[derive(Debug, Default)]
struct MockSession {
    key: String,
    parts: BTreeMap<u32, Vec<u8>>,
    confirmed: Option<ConfirmedObject>,
}

#[derive(Debug, Default)]
struct State {
    next_session: u32,
    sessions: HashMap<String, MockSession>,
    objects: HashMap<String, Vec<u8>>,
    part_failures: HashMap<u32, usize>,
    fetch_failures: usize,
    aborted: HashSet<String>,
    reported_crc64: Option<String>,
    confirm_crc64: Vec<Option<String>>,
}

/// Call counters.
#[derive(Debug, Default)]
pub struct Calls {
    pub initiate: AtomicUsize,
    pub list: AtomicUsize,
    pub upload_part: AtomicUsize,
    pub confirm: AtomicUsize,
    pub abort: AtomicUsize,
    pub info: AtomicUsize,
    pub resolve: AtomicUsize,
    pub fetch: AtomicUsize,
}

/// In-memory storage service.
#[derive(Debug)]
pub struct MockApi {
    state: Mutex<State>,
    pub calls: Calls,
    range_supported: AtomicBool,
    wrong_tags: AtomicBool,
    hold_after: Mutex<Option<usize>>,
    gate: Semaphore,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Default for MockApi {
    fn default() -> Self {
        Self::new()
    }
}

impl MockApi {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            calls: Calls::default(),
            range_supported: AtomicBool::new(true),
            wrong_tags: AtomicBool::new(false),
            hold_after: Mutex::new(None),
            gate: Semaphore::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    // ==================== Scripting ====================

    /// Stores a committed object at `key`.
    pub fn put_object(&self, key: &str, bytes: Vec<u8>) {
        self.state().objects.insert(key.to_string(), bytes);
    }

    /// Fails the next `times` uploads of part `index` with a transport error.
    pub fn fail_part(&self, index: u32, times: usize) {
        self.state().part_failures.insert(index, times);
    }

    /// Fails the next `times` range fetches with a transport error.
    pub fn fail_fetches(&self, times: usize) {
        self.state().fetch_failures = times;
    }

    pub fn set_range_supported(&self, supported: bool) {
        self.range_supported.store(supported, Ordering::SeqCst);
    }

    /// Reports `value` as every object's CRC64 instead of the real checksum.
    pub fn report_crc64(&self, value: &str) {
        self.state().reported_crc64 = Some(value.to_string());
    }

    /// Makes `upload_part` return tags that do not match the bytes.
    pub fn return_wrong_tags(&self) {
        self.wrong_tags.store(true, Ordering::SeqCst);
    }

    /// Part uploads after the first `count` wait for [`open_gate`](Self::open_gate).
    pub fn hold_after(&self, count: usize) {
        *self.hold_after.lock().unwrap() = Some(count);
    }

    /// Lets every held and future part upload through.
    pub fn open_gate(&self) {
        *self.hold_after.lock().unwrap() = None;
        self.gate.add_permits(Semaphore::MAX_PERMITS / 2);
    }

    // ==================== Inspection ====================

    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.state().objects.get(key).cloned()
    }

    pub fn stored_parts(&self, confirmation_key: &str) -> Vec<u32> {
        self.state()
            .sessions
            .get(confirmation_key)
            .map(|s| s.parts.keys().copied().collect())
            .unwrap_or_default()
    }

    /// CRC64 values sent with each confirm, in call order.
    pub fn confirm_checksums(&self) -> Vec<Option<String>> {
        self.state().confirm_crc64.clone()
    }

    pub fn was_aborted(&self, confirmation_key: &str) -> bool {
        self.state().aborted.contains(confirmation_key)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    fn metadata_of(state: &State, object: &[u8]) -> RemoteMetadata {
        RemoteMetadata {
            tag: Some(md5_hex(object)),
            crc64: Some(
                state
                    .reported_crc64
                    .clone()
                    .unwrap_or_else(|| format_crc64(crc64(object))),
            ),
            ..RemoteMetadata::default()
        }
    }

    fn session_missing(operation: &'static str) -> TransferError {
        TransferError::rejected(operation, 404, Rejection::SessionNotFound)
    }

    async fn pass_gate(&self, call: usize) {
        let hold = *self.hold_after.lock().unwrap();
        if hold.is_some_and(|count| call >= count) {
            if let Ok(permit) = self.gate.acquire().await {
                permit.forget();
            }
        }
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize, max: &AtomicUsize) -> Self {
        let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
        max.fetch_max(now, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl TransferApi for MockApi {
    async fn initiate_upload(
        &self,
        target: &ObjectTarget,
        _metadata: &BTreeMap<String, String>,
        overwrite: bool,
    ) -> Result<InitiatedUpload, TransferError> {
        self.calls.initiate.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state();
        let key = target.key();
        if !overwrite && state.objects.contains_key(&key) {
            return Err(TransferError::conflict("initiate_upload"));
        }
        state.next_session += 1;
        let confirmation_key = format!("ck-{}", state.next_session);
        state.sessions.insert(
            confirmation_key.clone(),
            MockSession {
                key,
                parts: BTreeMap::new(),
                confirmed: None,
            },
        );
        Ok(InitiatedUpload {
            confirmation_key,
            existing_parts: Vec::new(),
        })
    }

    async fn list_upload_parts(
        &self,
        confirmation_key: &str,
    ) -> Result<PartManifest, TransferError> {
        self.calls.list.fetch_add(1, Ordering::SeqCst);
        let state = self.state();
        let session = state
            .sessions
            .get(confirmation_key)
            .ok_or_else(|| Self::session_missing("list_upload_parts"))?;
        let parts = session
            .parts
            .iter()
            .map(|(index, bytes)| CompletedPart {
                index: *index,
                size: bytes.len() as u64,
                tag: format!("\"{}\"", md5_hex(bytes)),
            })
            .collect();
        Ok(PartManifest {
            path: Some(session.key.clone()),
            confirmed: session.confirmed.is_some(),
            part_size: None,
            parts,
        })
    }

    async fn upload_part(
        &self,
        confirmation_key: &str,
        index: u32,
        bytes: Vec<u8>,
    ) -> Result<String, TransferError> {
        let call = self.calls.upload_part.fetch_add(1, Ordering::SeqCst);
        let _in_flight = InFlight::enter(&self.in_flight, &self.max_in_flight);
        self.pass_gate(call).await;
        tokio::task::yield_now().await;

        let mut state = self.state();
        if let Some(remaining) = state.part_failures.get_mut(&index)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(TransferError::transport("upload_part", "connection reset"));
        }
        let session = state
            .sessions
            .get_mut(confirmation_key)
            .filter(|s| s.confirmed.is_none())
            .ok_or_else(|| Self::session_missing("upload_part"))?;
        let tag = if self.wrong_tags.load(Ordering::SeqCst) {
            format!("\"{}\"", md5_hex(b"something else"))
        } else {
            format!("\"{}\"", md5_hex(&bytes))
        };
        session.parts.insert(index, bytes);
        Ok(tag)
    }

    async fn confirm_upload(
        &self,
        confirmation_key: &str,
        crc64_value: Option<&str>,
    ) -> Result<ConfirmedObject, TransferError> {
        self.calls.confirm.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state();
        state.confirm_crc64.push(crc64_value.map(str::to_string));
        let session = state
            .sessions
            .get(confirmation_key)
            .ok_or_else(|| Self::session_missing("confirm_upload"))?;
        if let Some(confirmed) = &session.confirmed {
            return Ok(confirmed.clone());
        }
        let expected: Vec<u32> = (1..).take(session.parts.len()).collect();
        let listed: Vec<u32> = session.parts.keys().copied().collect();
        if listed != expected {
            let missing = expected.into_iter().filter(|i| !listed.contains(i)).collect();
            return Err(TransferError::incomplete_session("confirm_upload", 409, missing));
        }
        let body: Vec<u8> = session.parts.values().flatten().copied().collect();
        if let Some(sent) = crc64_value
            && sent != format_crc64(crc64(&body))
        {
            return Err(TransferError::rejected(
                "confirm_upload",
                400,
                Rejection::Other("crc64 mismatch".into()),
            ));
        }
        let key = session.key.clone();
        let confirmed = ConfirmedObject {
            object_id: key.clone(),
            tag: Some(md5_hex(&body)),
            size: Some(body.len() as u64),
        };
        if let Some(session) = state.sessions.get_mut(confirmation_key) {
            session.confirmed = Some(confirmed.clone());
        }
        state.objects.insert(key, body);
        Ok(confirmed)
    }

    async fn abort_upload(&self, confirmation_key: &str) -> Result<(), TransferError> {
        self.calls.abort.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state();
        state.sessions.remove(confirmation_key);
        state.aborted.insert(confirmation_key.to_string());
        Ok(())
    }

    async fn object_info(
        &self,
        target: &ObjectTarget,
    ) -> Result<Option<ObjectInfo>, TransferError> {
        self.calls.info.fetch_add(1, Ordering::SeqCst);
        let state = self.state();
        Ok(state.objects.get(&target.key()).map(|object| ObjectInfo {
            size: Some(object.len() as u64),
            metadata: Self::metadata_of(&state, object),
        }))
    }

    async fn resolve_download(
        &self,
        target: &ObjectTarget,
        _range: Option<&ByteRange>,
    ) -> Result<ResolvedDownload, TransferError> {
        self.calls.resolve.fetch_add(1, Ordering::SeqCst);
        let key = target.key();
        let state = self.state();
        let object = state.objects.get(&key).ok_or_else(|| {
            TransferError::rejected("resolve_download", 404, Rejection::NotFound)
        })?;
        Ok(ResolvedDownload {
            url: format!("mock://{key}"),
            total_size: object.len() as u64,
            metadata: Self::metadata_of(&state, object),
            range_supported: self.range_supported.load(Ordering::SeqCst),
        })
    }

    async fn fetch_range(
        &self,
        url: &str,
        offset: u64,
        length: Option<u64>,
    ) -> Result<ByteStream, TransferError> {
        self.calls.fetch.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state();
        if state.fetch_failures > 0 {
            state.fetch_failures -= 1;
            return Err(TransferError::transport("fetch_range", "connection reset"));
        }
        let key = url.trim_start_matches("mock://");
        let object = state
            .objects
            .get(key)
            .ok_or_else(|| TransferError::rejected("fetch_range", 404, Rejection::NotFound))?;

        let body = if self.range_supported.load(Ordering::SeqCst) {
            let start = usize::try_from(offset).unwrap();
            let end = length.map_or(object.len(), |len| {
                (start + usize::try_from(len).unwrap()).min(object.len())
            });
            object[start..end].to_vec()
        } else {
            object.clone()
        };
        let chunks: Vec<Result<Vec<u8>, TransferError>> = body
            .chunks(STREAM_CHUNK)
            .map(|chunk| Ok(chunk.to_vec()))
            .collect();
        Ok(futures_util::stream::iter(chunks).boxed())
    }
}
