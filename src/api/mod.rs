//! Remote storage operations the engine is built on.
//!
//! [`TransferApi`] is the seam between the engine and whatever transport
//! talks to the storage service. [`HttpTransferApi`] is the reqwest-based
//! implementation; tests plug in scripted in-memory implementations.

mod http;
mod wire;

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures_util::stream::BoxStream;

pub use http::{HttpApiConfig, HttpTransferApi};

use crate::request::{ByteRange, ObjectTarget};
use crate::transfer::{CompletedPart, TransferError};

/// Body chunks of a fetched range.
pub type ByteStream = BoxStream<'static, Result<Vec<u8>, TransferError>>;

/// Result of starting a multipart upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitiatedUpload {
    /// Token identifying the upload session.
    pub confirmation_key: String,
    /// Parts the service already holds for this session, if it resumed one.
    pub existing_parts: Vec<CompletedPart>,
}

/// Parts uploaded so far in a session.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PartManifest {
    /// Object key the session uploads to, when the service reports it.
    pub path: Option<String>,
    /// Whether the session has already been confirmed.
    pub confirmed: bool,
    /// Part size the session was started with, when the service reports it.
    pub part_size: Option<u64>,
    /// Uploaded parts.
    pub parts: Vec<CompletedPart>,
}

/// The committed object after a successful confirm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmedObject {
    /// Canonical identity (path) of the object.
    pub object_id: String,
    /// Entity tag of the whole object, if reported.
    pub tag: Option<String>,
    /// Size of the object, if reported.
    pub size: Option<u64>,
}

/// Metadata reported for a remote object.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RemoteMetadata {
    /// MIME type.
    pub content_type: Option<String>,
    /// Entity tag.
    pub tag: Option<String>,
    /// CRC64 checksum as reported by the service.
    pub crc64: Option<String>,
    /// Creation time as reported by the service.
    pub creation_time: Option<String>,
    /// Last modification time as reported by the service.
    pub modification_time: Option<String>,
    /// Custom key/value metadata.
    pub custom: BTreeMap<String, String>,
}

/// An existing object as reported by a metadata lookup.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ObjectInfo {
    /// Size in bytes, if reported.
    pub size: Option<u64>,
    /// Object metadata.
    pub metadata: RemoteMetadata,
}

/// A download resolved to a fetchable location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedDownload {
    /// URL to fetch the body from.
    pub url: String,
    /// Size of the whole object.
    pub total_size: u64,
    /// Object metadata.
    pub metadata: RemoteMetadata,
    /// Whether the URL honours `Range` requests.
    pub range_supported: bool,
}

/// Remote operations needed for multipart uploads and ranged downloads.
#[async_trait]
pub trait TransferApi: Send + Sync {
    /// Starts (or resumes) a multipart upload to `target`.
    ///
    /// Fails with [`Rejection::Conflict`](crate::transfer::Rejection::Conflict)
    /// when `overwrite` is false and the object exists.
    async fn initiate_upload(
        &self,
        target: &ObjectTarget,
        metadata: &BTreeMap<String, String>,
        overwrite: bool,
    ) -> Result<InitiatedUpload, TransferError>;

    /// Lists the parts already uploaded in a session.
    async fn list_upload_parts(&self, confirmation_key: &str)
    -> Result<PartManifest, TransferError>;

    /// Uploads one part and returns its integrity tag.
    async fn upload_part(
        &self,
        confirmation_key: &str,
        index: u32,
        bytes: Vec<u8>,
    ) -> Result<String, TransferError>;

    /// Commits a session whose parts are all uploaded.
    ///
    /// `crc64` is the CRC64 of the whole local object (decimal), for the
    /// service to check against what it assembled.
    async fn confirm_upload(
        &self,
        confirmation_key: &str,
        crc64: Option<&str>,
    ) -> Result<ConfirmedObject, TransferError>;

    /// Discards a session. The default does nothing.
    async fn abort_upload(&self, confirmation_key: &str) -> Result<(), TransferError> {
        let _ = confirmation_key;
        Ok(())
    }

    /// Looks up the object at `target`; `Ok(None)` when there is none.
    ///
    /// Used to skip uploads of unchanged objects. The default reports
    /// nothing, which disables that shortcut.
    async fn object_info(
        &self,
        target: &ObjectTarget,
    ) -> Result<Option<ObjectInfo>, TransferError> {
        let _ = target;
        Ok(None)
    }

    /// Resolves `target` to a fetch URL and metadata.
    async fn resolve_download(
        &self,
        target: &ObjectTarget,
        range: Option<&ByteRange>,
    ) -> Result<ResolvedDownload, TransferError>;

    /// Fetches `length` bytes from `offset`, or the whole body when `length` is `None`
    /// and `offset` is zero.
    async fn fetch_range(
        &self,
        url: &str,
        offset: u64,
        length: Option<u64>,
    ) -> Result<ByteStream, TransferError>;
}
