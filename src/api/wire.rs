//! JSON bodies exchanged with the storage service.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{ConfirmedObject, InitiatedUpload, ObjectInfo, PartManifest, RemoteMetadata};
use crate::transfer::CompletedPart;

#[derive(Debug, Deserialize)]
pub(super) struct UploadedPart {
    #[serde(rename = "PartNumber")]
    part_number: u32,
    #[serde(rename = "ETag")]
    etag: String,
    #[serde(rename = "Size")]
    size: u64,
}

impl From<UploadedPart> for CompletedPart {
    fn from(part: UploadedPart) -> Self {
        Self {
            index: part.part_number,
            size: part.size,
            tag: part.etag,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct InitUploadBody {
    confirm_key: String,
    #[serde(default)]
    parts: Vec<UploadedPart>,
}

impl From<InitUploadBody> for InitiatedUpload {
    fn from(body: InitUploadBody) -> Self {
        Self {
            confirmation_key: body.confirm_key,
            existing_parts: body.parts.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct UploadSessionBody {
    #[serde(default)]
    path: Vec<String>,
    #[serde(default)]
    confirmed: Option<bool>,
    #[serde(default)]
    part_size: Option<u64>,
    #[serde(default)]
    parts: Vec<UploadedPart>,
}

impl From<UploadSessionBody> for PartManifest {
    fn from(body: UploadSessionBody) -> Self {
        Self {
            path: (!body.path.is_empty()).then(|| body.path.join("/")),
            confirmed: body.confirmed.unwrap_or(false),
            part_size: body.part_size,
            parts: body.parts.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Serialize)]
pub(super) struct ConfirmRequestBody<'a> {
    pub(super) crc64: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct ConfirmBody {
    path: Vec<String>,
    #[serde(default)]
    e_tag: Option<String>,
    #[serde(default)]
    size: Option<u64>,
}

impl From<ConfirmBody> for ConfirmedObject {
    fn from(body: ConfirmBody) -> Self {
        Self {
            object_id: body.path.join("/"),
            tag: body.e_tag,
            size: body.size,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct FileInfoBody {
    pub(super) cos_url: String,
    #[serde(default)]
    pub(super) size: Option<u64>,
    #[serde(default)]
    e_tag: Option<String>,
    #[serde(default)]
    crc64: Option<String>,
    #[serde(default)]
    content_type: Option<String>,
    #[serde(default)]
    creation_time: Option<String>,
    #[serde(default)]
    modification_time: Option<String>,
    #[serde(default)]
    meta_data: BTreeMap<String, String>,
}

impl From<FileInfoBody> for ObjectInfo {
    fn from(body: FileInfoBody) -> Self {
        Self {
            size: body.size,
            metadata: body.metadata(),
        }
    }
}

impl FileInfoBody {
    pub(super) fn metadata(&self) -> RemoteMetadata {
        RemoteMetadata {
            content_type: self.content_type.clone(),
            tag: self.e_tag.clone(),
            crc64: self.crc64.clone(),
            creation_time: self.creation_time.clone(),
            modification_time: self.modification_time.clone(),
            custom: self.meta_data.clone(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub(super) struct ErrorBody {
    #[serde(default)]
    pub(super) code: Option<String>,
    #[serde(default)]
    pub(super) message: Option<String>,
}

impl ErrorBody {
    pub(super) fn describe(&self, fallback: &str) -> String {
        match (&self.code, &self.message) {
            (Some(code), Some(message)) => format!("{code}: {message}"),
            (Some(code), None) => code.clone(),
            (None, Some(message)) => message.clone(),
            (None, None) => fallback.to_string(),
        }
    }
}
