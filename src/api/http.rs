//! reqwest-based [`TransferApi`] for the file storage REST service.
//!
//! Routes are rooted at `{base}/api/v1/file/{library}/{space}/`. Upload
//! sessions are addressed by their confirmation key, objects by their key.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{
    ACCEPT_RANGES, CONTENT_LENGTH, ETAG, HeaderName, HeaderValue, RANGE, RETRY_AFTER,
};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use tracing::{debug, instrument, warn};
use url::Url;

use super::wire::{
    ConfirmBody, ConfirmRequestBody, ErrorBody, FileInfoBody, InitUploadBody, UploadSessionBody,
};
use super::{
    ByteStream, ConfirmedObject, InitiatedUpload, ObjectInfo, PartManifest, ResolvedDownload,
    TransferApi,
};
use crate::request::{ByteRange, ObjectTarget};
use crate::transfer::{Rejection, TransferError};
use crate::user_agent;

/// Default connect timeout (30 seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default per-request timeout (5 minutes, enough for one large part).
pub const READ_TIMEOUT_SECS: u64 = 300;

const METADATA_HEADER_PREFIX: &str = "x-smh-meta-";

/// Error code the service uses when confirm is called on an incomplete session.
const INCOMPLETE_UPLOAD_CODE: &str = "IncompleteUpload";

/// Connection settings for [`HttpTransferApi`].
#[derive(Debug, Clone)]
pub struct HttpApiConfig {
    /// Service root, e.g. `https://api.example.com`.
    pub base_url: String,
    /// Library the space belongs to.
    pub library_id: String,
    /// Space holding the objects.
    pub space_id: String,
    /// Access token appended to every request.
    pub access_token: Option<String>,
    /// User on whose behalf requests are made.
    pub user_id: Option<String>,
    /// TCP connect timeout.
    pub connect_timeout: Duration,
    /// Whole-request timeout.
    pub read_timeout: Duration,
}

impl HttpApiConfig {
    /// Settings with default timeouts and no credentials.
    pub fn new(
        base_url: impl Into<String>,
        library_id: impl Into<String>,
        space_id: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            library_id: library_id.into(),
            space_id: space_id.into(),
            access_token: None,
            user_id: None,
            connect_timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
            read_timeout: Duration::from_secs(READ_TIMEOUT_SECS),
        }
    }

    /// Sets the access token.
    #[must_use]
    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    /// Sets the user id.
    #[must_use]
    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

/// HTTP implementation of [`TransferApi`].
///
/// Create once and share; the inner client pools connections.
#[derive(Debug, Clone)]
pub struct HttpTransferApi {
    client: Client,
    config: HttpApiConfig,
    base: Url,
}

impl HttpTransferApi {
    /// Builds the client.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::InvalidRequest`] when the base URL does not
    /// parse and [`TransferError::Transport`] when the client cannot be built.
    pub fn new(config: HttpApiConfig) -> Result<Self, TransferError> {
        let base = Url::parse(&config.base_url).map_err(|e| {
            TransferError::invalid_request(format!("invalid base URL {}: {e}", config.base_url))
        })?;
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.read_timeout)
            .gzip(true)
            .user_agent(user_agent::default_user_agent())
            .build()
            .map_err(|e| TransferError::transport("build_client", e.to_string()))?;
        Ok(Self {
            client,
            config,
            base,
        })
    }

    /// The settings this client was built with.
    #[must_use]
    pub fn config(&self) -> &HttpApiConfig {
        &self.config
    }

    /// URL of `key` under the space with a leading query flag such as `multipart`.
    fn file_url(&self, key: &str, flag: &str) -> Result<Url, TransferError> {
        let mut url = self.base.clone();
        {
            let mut segments = url.path_segments_mut().map_err(|()| {
                TransferError::invalid_request(format!(
                    "base URL {} cannot carry a path",
                    self.config.base_url
                ))
            })?;
            segments
                .pop_if_empty()
                .extend(["api", "v1", "file"])
                .push(&self.config.library_id)
                .push(&self.config.space_id)
                .extend(key.split('/').filter(|s| !s.is_empty()));
        }
        url.set_query(Some(flag));
        {
            let mut pairs = url.query_pairs_mut();
            if let Some(token) = &self.config.access_token {
                pairs.append_pair("access_token", token);
            }
            if let Some(user_id) = &self.config.user_id {
                pairs.append_pair("user_id", user_id);
            }
        }
        Ok(url)
    }

    async fn send(
        &self,
        operation: &'static str,
        request: RequestBuilder,
    ) -> Result<Response, TransferError> {
        let response = request
            .send()
            .await
            .map_err(|e| request_error(operation, &e))?;
        if response.status().is_success() {
            Ok(response)
        } else {
            Err(status_error(operation, response).await)
        }
    }

    async fn json<T: serde::de::DeserializeOwned>(
        operation: &'static str,
        response: Response,
    ) -> Result<T, TransferError> {
        let status = response.status().as_u16();
        response.json::<T>().await.map_err(|e| {
            if e.is_decode() {
                TransferError::rejected(
                    operation,
                    status,
                    Rejection::Other(format!("malformed response body: {e}")),
                )
            } else {
                request_error(operation, &e)
            }
        })
    }

    async fn check_range_support(&self, url: &str) -> (bool, Option<u64>) {
        match self.client.head(url).send().await {
            Ok(response) if response.status().is_success() => {
                let headers = response.headers();
                let ranges = headers
                    .get(ACCEPT_RANGES)
                    .and_then(|v| v.to_str().ok())
                    .is_some_and(|v| v.eq_ignore_ascii_case("bytes"));
                let length = headers
                    .get(CONTENT_LENGTH)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse().ok());
                (ranges, length)
            }
            Ok(response) => {
                debug!(status = response.status().as_u16(), "HEAD request refused");
                (false, None)
            }
            Err(e) => {
                debug!(error = %e, "HEAD request failed");
                (false, None)
            }
        }
    }
}

#[async_trait]
impl TransferApi for HttpTransferApi {
    #[instrument(skip(self, metadata), fields(key = %target.key()))]
    async fn initiate_upload(
        &self,
        target: &ObjectTarget,
        metadata: &BTreeMap<String, String>,
        overwrite: bool,
    ) -> Result<InitiatedUpload, TransferError> {
        let mut url = self.file_url(&target.key(), "multipart")?;
        url.query_pairs_mut().append_pair(
            "conflict_resolution_strategy",
            if overwrite { "overwrite" } else { "ask" },
        );
        let mut request = self.client.post(url);
        for (key, value) in metadata {
            let (name, value) = metadata_header(key, value)?;
            request = request.header(name, value);
        }
        let response = self.send("initiate_upload", request).await?;
        let body: InitUploadBody = Self::json("initiate_upload", response).await?;
        Ok(body.into())
    }

    #[instrument(skip(self))]
    async fn list_upload_parts(
        &self,
        confirmation_key: &str,
    ) -> Result<PartManifest, TransferError> {
        let url = self.file_url(confirmation_key, "upload")?;
        let response = self
            .send("list_upload_parts", self.client.get(url))
            .await?;
        let body: UploadSessionBody = Self::json("list_upload_parts", response).await?;
        Ok(body.into())
    }

    #[instrument(skip(self, bytes), fields(bytes = bytes.len()))]
    async fn upload_part(
        &self,
        confirmation_key: &str,
        index: u32,
        bytes: Vec<u8>,
    ) -> Result<String, TransferError> {
        let url = self.file_url(confirmation_key, &format!("part={index}"))?;
        let response = self
            .send("upload_part", self.client.put(url).body(bytes))
            .await?;
        response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string)
            .ok_or_else(|| {
                TransferError::rejected(
                    "upload_part",
                    response.status().as_u16(),
                    Rejection::Other("response carried no ETag".to_string()),
                )
            })
    }

    #[instrument(skip(self))]
    async fn confirm_upload(
        &self,
        confirmation_key: &str,
        crc64: Option<&str>,
    ) -> Result<ConfirmedObject, TransferError> {
        let url = self.file_url(confirmation_key, "confirm")?;
        let mut request = self.client.post(url);
        if let Some(crc64) = crc64 {
            request = request.json(&ConfirmRequestBody { crc64 });
        }
        let response = self.send("confirm_upload", request).await?;
        let body: ConfirmBody = Self::json("confirm_upload", response).await?;
        Ok(body.into())
    }

    #[instrument(skip(self))]
    async fn abort_upload(&self, confirmation_key: &str) -> Result<(), TransferError> {
        let url = self.file_url(confirmation_key, "upload")?;
        self.send("abort_upload", self.client.delete(url)).await?;
        Ok(())
    }

    #[instrument(skip(self), fields(key = %target.key()))]
    async fn object_info(
        &self,
        target: &ObjectTarget,
    ) -> Result<Option<ObjectInfo>, TransferError> {
        let url = self.file_url(&target.key(), "info")?;
        match self.send("object_info", self.client.get(url)).await {
            Ok(response) => {
                let info: FileInfoBody = Self::json("object_info", response).await?;
                Ok(Some(info.into()))
            }
            Err(e) if e.rejection() == Some(&Rejection::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self), fields(key = %target.key(), range = ?range))]
    async fn resolve_download(
        &self,
        target: &ObjectTarget,
        range: Option<&ByteRange>,
    ) -> Result<ResolvedDownload, TransferError> {
        let url = self.file_url(&target.key(), "info")?;
        let response = self.send("resolve_download", self.client.get(url)).await?;
        let info: FileInfoBody = Self::json("resolve_download", response).await?;

        let (range_supported, head_length) = self.check_range_support(&info.cos_url).await;
        let total_size = info.size.or(head_length).ok_or_else(|| {
            TransferError::rejected(
                "resolve_download",
                200,
                Rejection::Other("object size was not reported".to_string()),
            )
        })?;
        debug!(total_size, range_supported, "download resolved");

        Ok(ResolvedDownload {
            metadata: info.metadata(),
            url: info.cos_url,
            total_size,
            range_supported,
        })
    }

    #[instrument(skip(self, url))]
    async fn fetch_range(
        &self,
        url: &str,
        offset: u64,
        length: Option<u64>,
    ) -> Result<ByteStream, TransferError> {
        let range = match length {
            Some(0) => return Ok(futures_util::stream::empty().boxed()),
            Some(length) => Some(ByteRange::new(offset, Some(offset + length))?),
            None if offset > 0 => Some(ByteRange::from_offset(offset)),
            None => None,
        };

        let mut request = self.client.get(url);
        if let Some(range) = &range {
            request = request.header(RANGE, range.header_value());
        }
        let response = self.send("fetch_range", request).await?;

        if range.is_some() && response.status() != StatusCode::PARTIAL_CONTENT {
            warn!(
                status = response.status().as_u16(),
                "server ignored range request"
            );
            return Err(TransferError::rejected(
                "fetch_range",
                response.status().as_u16(),
                Rejection::Other("server ignored the range request".to_string()),
            ));
        }

        let stream = response.bytes_stream().map(|chunk| {
            chunk
                .map(|bytes| bytes.to_vec())
                .map_err(|e| request_error("fetch_range", &e))
        });
        Ok(stream.boxed())
    }
}

fn metadata_header(key: &str, value: &str) -> Result<(HeaderName, HeaderValue), TransferError> {
    let name = HeaderName::from_bytes(format!("{METADATA_HEADER_PREFIX}{key}").as_bytes())
        .map_err(|_| TransferError::invalid_request(format!("invalid metadata key {key:?}")))?;
    let value = HeaderValue::from_str(value)
        .map_err(|_| TransferError::invalid_request(format!("invalid metadata value for {key:?}")))?;
    Ok((name, value))
}

fn request_error(operation: &'static str, error: &reqwest::Error) -> TransferError {
    if error.is_timeout() {
        TransferError::transport(operation, "request timed out")
    } else {
        TransferError::transport(operation, error.to_string())
    }
}

async fn status_error(operation: &'static str, response: Response) -> TransferError {
    let status = response.status();
    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_retry_after);
    let text = response.text().await.unwrap_or_default();
    let body: ErrorBody = serde_json::from_str(&text).unwrap_or_default();
    let description = body.describe(&format!("HTTP {}", status.as_u16()));

    if is_retryable_status(status) {
        return TransferError::transport_with_retry_after(operation, description, retry_after);
    }
    TransferError::rejected(
        operation,
        status.as_u16(),
        classify_rejection(operation, status, &body, description),
    )
}

fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
}

fn classify_rejection(
    operation: &str,
    status: StatusCode,
    body: &ErrorBody,
    description: String,
) -> Rejection {
    let session_operation = matches!(
        operation,
        "list_upload_parts" | "upload_part" | "confirm_upload" | "abort_upload"
    );
    if body.code.as_deref() == Some(INCOMPLETE_UPLOAD_CODE)
        || (operation == "confirm_upload" && status == StatusCode::CONFLICT)
    {
        return Rejection::IncompleteSession {
            missing: Vec::new(),
        };
    }
    match status {
        StatusCode::CONFLICT => Rejection::Conflict,
        StatusCode::NOT_FOUND if session_operation => Rejection::SessionNotFound,
        StatusCode::NOT_FOUND => Rejection::NotFound,
        _ => Rejection::Other(description),
    }
}

/// Parses a `Retry-After` value given either in seconds or as an HTTP date.
fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let date = httpdate::parse_http_date(value).ok()?;
    Some(
        date.duration_since(std::time::SystemTime::now())
            .unwrap_or(Duration::ZERO),
    )
}
