//! Per-task session state produced by the handshakes.

use std::collections::BTreeMap;

use super::planner::{CompletedPart, PartDescriptor, PartState};
use super::{Rejection, TransferError};
use crate::api::RemoteMetadata;
use crate::request::ByteRange;

/// State of one multipart upload.
#[derive(Debug, Clone)]
pub struct UploadSession {
    confirmation_key: String,
    parts: Vec<PartDescriptor>,
    part_size: u64,
    total_size: u64,
    metadata: BTreeMap<String, String>,
    consumed: bool,
}

impl UploadSession {
    pub(crate) fn new(
        confirmation_key: String,
        parts: Vec<PartDescriptor>,
        part_size: u64,
        total_size: u64,
        metadata: BTreeMap<String, String>,
    ) -> Self {
        Self {
            confirmation_key,
            parts,
            part_size,
            total_size,
            metadata,
            consumed: false,
        }
    }

    /// Token identifying the session on the remote side.
    #[must_use]
    pub fn confirmation_key(&self) -> &str {
        &self.confirmation_key
    }

    /// Parts in index order.
    #[must_use]
    pub fn parts(&self) -> &[PartDescriptor] {
        &self.parts
    }

    /// Part size the session was planned with.
    #[must_use]
    pub fn part_size(&self) -> u64 {
        self.part_size
    }

    /// Size of the object being uploaded.
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Metadata sent with the upload.
    #[must_use]
    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    /// Whether confirm has been issued for this session.
    #[must_use]
    pub fn is_consumed(&self) -> bool {
        self.consumed
    }

    /// Indices of parts that are not done.
    #[must_use]
    pub fn missing_parts(&self) -> Vec<u32> {
        self.parts
            .iter()
            .filter(|p| p.state != PartState::Done)
            .map(|p| p.index)
            .collect()
    }

    /// Bytes covered by done parts.
    #[must_use]
    pub fn bytes_done(&self) -> u64 {
        self.parts
            .iter()
            .filter(|p| p.state == PartState::Done)
            .map(|p| p.length)
            .sum()
    }

    /// Manifest of done parts, for persisting a resumable upload.
    #[must_use]
    pub fn completed_parts(&self) -> Vec<CompletedPart> {
        self.parts.iter().filter_map(PartDescriptor::as_completed).collect()
    }

    pub(crate) fn parts_mut(&mut self) -> &mut [PartDescriptor] {
        &mut self.parts
    }

    pub(crate) fn set_state(&mut self, index: u32, state: PartState) {
        if let Some(part) = self.part_mut(index) {
            part.state = state;
        }
    }

    pub(crate) fn complete_part(&mut self, index: u32, tag: String) {
        if let Some(part) = self.part_mut(index) {
            part.complete(tag);
        }
    }

    /// Marks the session consumed; fails if it already was or if parts are missing.
    pub(crate) fn consume(&mut self) -> Result<(), TransferError> {
        if self.consumed {
            return Err(TransferError::rejected(
                "confirm_upload",
                0,
                Rejection::SessionNotFound,
            ));
        }
        let missing = self.missing_parts();
        if !missing.is_empty() {
            return Err(TransferError::incomplete_session("confirm_upload", 0, missing));
        }
        self.consumed = true;
        Ok(())
    }

    fn part_mut(&mut self, index: u32) -> Option<&mut PartDescriptor> {
        let slot = usize::try_from(index).ok()?.checked_sub(1)?;
        self.parts.get_mut(slot)
    }
}

/// State of one resolved download.
#[derive(Debug, Clone)]
pub struct DownloadSession {
    pub(crate) url: String,
    pub(crate) total_size: u64,
    pub(crate) metadata: RemoteMetadata,
    pub(crate) range: Option<ByteRange>,
    pub(crate) start: u64,
    pub(crate) end: u64,
    pub(crate) range_supported: bool,
    pub(crate) parts: Vec<PartDescriptor>,
}

impl DownloadSession {
    /// Resolved fetch URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Size of the whole remote object.
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Remote object metadata.
    #[must_use]
    pub fn metadata(&self) -> &RemoteMetadata {
        &self.metadata
    }

    /// Range the caller asked for.
    #[must_use]
    pub fn requested_range(&self) -> Option<&ByteRange> {
        self.range.as_ref()
    }

    /// Whether the body is fetched in ranges.
    #[must_use]
    pub fn range_supported(&self) -> bool {
        self.range_supported
    }

    /// Number of bytes this download writes to the sink.
    #[must_use]
    pub fn transfer_len(&self) -> u64 {
        self.end - self.start
    }

    /// Planned parts with absolute object offsets.
    #[must_use]
    pub fn parts(&self) -> &[PartDescriptor] {
        &self.parts
    }

    /// Where `part` lands in the sink.
    #[must_use]
    pub fn sink_offset(&self, part: &PartDescriptor) -> u64 {
        part.offset - self.start
    }

    /// Length to request for `part`; `None` fetches the whole body.
    #[must_use]
    pub fn fetch_length(&self, part: &PartDescriptor) -> Option<u64> {
        self.range_supported.then_some(part.length)
    }
}
