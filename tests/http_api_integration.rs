//! Integration tests for the HTTP transport against a mock storage service.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use transfer_core::api::{HttpApiConfig, HttpTransferApi, TransferApi};
use transfer_core::request::{FileSink, MemorySource, ObjectTarget, TransferRequest};
use transfer_core::transfer::{
    EngineConfig, Rejection, RetryPolicy, TransferEngine, TransferError, TransferOutcome, crc64,
    format_crc64, md5_hex,
};
use wiremock::matchers::{body_json, header, header_exists, method, path, query_param};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

mod support;
use support::socket_guard::{socket_skip_return, start_mock_server_or_skip};

macro_rules! require_mock_server {
    () => {{
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return socket_skip_return();
        };
        mock_server
    }};
}

const PART: usize = 64 * 1024;
const FILE_ROOT: &str = "/api/v1/file/lib/space";

// ==================== Helper Functions ====================

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 256) as u8).collect()
}

fn create_api(server: &MockServer) -> HttpTransferApi {
    HttpTransferApi::new(
        HttpApiConfig::new(server.uri(), "lib", "space")
            .with_access_token("tok")
            .with_user_id("u-1"),
    )
    .unwrap()
}

fn create_engine(server: &MockServer) -> TransferEngine {
    let config = EngineConfig {
        part_size: PART as u64,
        concurrency: 2,
        retry_policy: RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(5), 2.0)
            .without_jitter(),
        verify_integrity: true,
        quick_upload: true,
    };
    TransferEngine::new(Arc::new(create_api(server)), config).unwrap()
}

/// Answers part uploads with the MD5 of the received body as ETag.
struct EchoDigest;

impl Respond for EchoDigest {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        ResponseTemplate::new(200).insert_header("ETag", format!("\"{}\"", md5_hex(&request.body)))
    }
}

/// Serves `body` honouring `Range: bytes=a-b` and `bytes=a-`.
struct RangeResponder {
    body: Vec<u8>,
}

impl Respond for RangeResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let Some(range) = request
            .headers
            .get("range")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("bytes="))
        else {
            return ResponseTemplate::new(200).set_body_bytes(self.body.clone());
        };
        let (start, end) = range.split_once('-').unwrap();
        let start: usize = start.parse().unwrap();
        let end: usize = if end.is_empty() {
            self.body.len() - 1
        } else {
            end.parse().unwrap()
        };
        ResponseTemplate::new(206)
            .insert_header(
                "Content-Range",
                format!("bytes {start}-{end}/{}", self.body.len()),
            )
            .set_body_bytes(self.body[start..=end].to_vec())
    }
}

async fn mount_download(server: &MockServer, key: &str, body: &[u8], accept_ranges: bool) {
    mount_download_reporting(server, key, body, accept_ranges, &format_crc64(crc64(body))).await;
}

async fn mount_download_reporting(
    server: &MockServer,
    key: &str,
    body: &[u8],
    accept_ranges: bool,
    reported_crc64: &str,
) {
    let blob = format!("/blob/{key}");
    Mock::given(method("GET"))
        .and(path(format!("{FILE_ROOT}/{key}")))
        .and(query_param("access_token", "tok"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "cosUrl": format!("{}{blob}", server.uri()),
            "size": body.len(),
            "eTag": "\"whole\"",
            "crc64": reported_crc64,
            "contentType": "application/octet-stream",
            "metaData": { "owner": "ops" }
        })))
        .mount(server)
        .await;

    let head = if accept_ranges {
        ResponseTemplate::new(200).insert_header("Accept-Ranges", "bytes")
    } else {
        ResponseTemplate::new(200)
    };
    Mock::given(method("HEAD"))
        .and(path(blob.clone()))
        .respond_with(head)
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path(blob))
        .respond_with(RangeResponder {
            body: body.to_vec(),
        })
        .mount(server)
        .await;
}

// ==================== End-to-End Tests ====================

#[tokio::test]
async fn test_http_upload_end_to_end() {
    let mock_server = require_mock_server!();
    let data = payload(2 * PART + 10);

    Mock::given(method("POST"))
        .and(path(format!("{FILE_ROOT}/docs/a.bin")))
        .and(query_param("conflict_resolution_strategy", "ask"))
        .and(query_param("access_token", "tok"))
        .and(query_param("user_id", "u-1"))
        .and(header("x-smh-meta-owner", "ops"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({ "confirmKey": "ck-9" })),
        )
        .expect(1)
        .mount(&mock_server)
        .await;
    Mock::given(method("PUT"))
        .and(path(format!("{FILE_ROOT}/ck-9")))
        .respond_with(EchoDigest)
        .expect(3)
        .mount(&mock_server)
        .await;
    Mock::given(method("POST"))
        .and(path(format!("{FILE_ROOT}/ck-9")))
        .and(query_param("access_token", "tok"))
        .and(body_json(serde_json::json!({ "crc64": format_crc64(crc64(&data)) })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "path": ["docs", "a.bin"],
            "eTag": "\"final\"",
            "size": data.len()
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let engine = create_engine(&mock_server);
    let request = TransferRequest::upload(
        ObjectTarget::new("a.bin").in_scope("docs"),
        MemorySource::new(data.clone()),
    )
    .with_metadata("owner", "ops");
    let outcome = engine.start(request).wait().await.unwrap();

    let TransferOutcome::Uploaded { object, bytes, quick } = outcome else {
        panic!("expected an upload outcome");
    };
    assert!(!quick);
    assert_eq!(object.object_id, "docs/a.bin");
    assert_eq!(object.tag.as_deref(), Some("\"final\""));
    assert_eq!(bytes, data.len() as u64);
}

#[tokio::test]
async fn test_http_quick_upload_skips_identical_object() {
    let mock_server = require_mock_server!();
    let data = payload(PART + 10);
    Mock::given(method("GET"))
        .and(path(format!("{FILE_ROOT}/same.bin")))
        .and(query_param("info", ""))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "cosUrl": format!("{}/blob/same.bin", mock_server.uri()),
            "size": data.len(),
            "eTag": "\"same\"",
            "crc64": format_crc64(crc64(&data))
        })))
        .expect(1)
        .mount(&mock_server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&mock_server)
        .await;

    let engine = create_engine(&mock_server);
    let request = TransferRequest::upload(ObjectTarget::new("same.bin"), MemorySource::new(data));
    let outcome = engine.start(request).wait().await.unwrap();

    let TransferOutcome::Uploaded { object, quick, .. } = outcome else {
        panic!("expected an upload outcome");
    };
    assert!(quick);
    assert_eq!(object.tag.as_deref(), Some("\"same\""));
}

#[tokio::test]
async fn test_http_object_info_missing_is_none() {
    let mock_server = require_mock_server!();
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&mock_server)
        .await;

    let info = create_api(&mock_server)
        .object_info(&ObjectTarget::new("absent.bin"))
        .await
        .unwrap();

    assert!(info.is_none());
}

#[tokio::test]
async fn test_http_download_ranges_end_to_end() {
    let mock_server = require_mock_server!();
    let data = payload(2 * PART + 300);
    mount_download(&mock_server, "big.bin", &data, true).await;

    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("out").join("big.bin");
    let engine = create_engine(&mock_server);
    let request = TransferRequest::download(ObjectTarget::new("big.bin"), FileSink::new(&local));
    let outcome = engine.start(request).wait().await.unwrap();

    let TransferOutcome::Downloaded { bytes, metadata } = outcome else {
        panic!("expected a download outcome");
    };
    assert_eq!(bytes, data.len() as u64);
    assert_eq!(metadata.tag.as_deref(), Some("\"whole\""));
    assert_eq!(metadata.custom.get("owner").map(String::as_str), Some("ops"));
    assert_eq!(std::fs::read(&local).unwrap(), data);

    let ranged = mock_server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.headers.contains_key("range"))
        .count();
    assert_eq!(ranged, 3);
}

#[tokio::test]
async fn test_http_download_checksum_mismatch_fails() {
    let mock_server = require_mock_server!();
    let data = payload(PART + 5);
    mount_download_reporting(&mock_server, "bad.bin", &data, true, "1").await;

    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("bad.bin");
    let engine = create_engine(&mock_server);
    let request = TransferRequest::download(ObjectTarget::new("bad.bin"), FileSink::new(&local));
    let err = engine.start(request).wait().await.unwrap_err();

    assert!(matches!(err, TransferError::IntegrityMismatch { part_index: 0, .. }), "{err:?}");
}

#[tokio::test]
async fn test_http_download_without_accept_ranges_fetches_once() {
    let mock_server = require_mock_server!();
    let data = payload(2 * PART);
    mount_download(&mock_server, "plain.bin", &data, false).await;

    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("plain.bin");
    let engine = create_engine(&mock_server);
    let request = TransferRequest::download(ObjectTarget::new("plain.bin"), FileSink::new(&local));
    engine.start(request).wait().await.unwrap();

    assert_eq!(std::fs::read(&local).unwrap(), data);
    let fetches = mock_server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.method.as_str() == "GET" && r.url.path() == "/blob/plain.bin")
        .count();
    assert_eq!(fetches, 1);
}

// ==================== Error Mapping Tests ====================

#[tokio::test]
async fn test_http_retryable_status_carries_retry_after() {
    let mock_server = require_mock_server!();
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(503).insert_header("Retry-After", "2"))
        .mount(&mock_server)
        .await;

    let err = create_api(&mock_server)
        .upload_part("ck", 1, b"abc".to_vec())
        .await
        .unwrap_err();

    assert!(
        matches!(
            err,
            TransferError::Transport {
                operation: "upload_part",
                retry_after: Some(delay),
                ..
            } if delay == Duration::from_secs(2)
        ),
        "{err:?}"
    );
}

#[tokio::test]
async fn test_http_conflict_on_initiate() {
    let mock_server = require_mock_server!();
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(409).set_body_json(serde_json::json!({
            "code": "SameNameFileExists",
            "message": "file already exists"
        })))
        .mount(&mock_server)
        .await;

    let err = create_api(&mock_server)
        .initiate_upload(&ObjectTarget::new("a.bin"), &BTreeMap::new(), false)
        .await
        .unwrap_err();

    assert_eq!(err.rejection(), Some(&Rejection::Conflict));
}

#[tokio::test]
async fn test_http_incomplete_upload_on_confirm() {
    let mock_server = require_mock_server!();
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(409).set_body_json(serde_json::json!({
            "code": "IncompleteUpload"
        })))
        .mount(&mock_server)
        .await;

    let err = create_api(&mock_server)
        .confirm_upload("ck", None)
        .await
        .unwrap_err();

    assert!(matches!(
        err.rejection(),
        Some(Rejection::IncompleteSession { .. })
    ));
}

#[tokio::test]
async fn test_http_unknown_session_on_list() {
    let mock_server = require_mock_server!();
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&mock_server)
        .await;

    let err = create_api(&mock_server)
        .list_upload_parts("ck-old")
        .await
        .unwrap_err();

    assert_eq!(err.rejection(), Some(&Rejection::SessionNotFound));
}

#[tokio::test]
async fn test_http_list_parts_parses_manifest() {
    let mock_server = require_mock_server!();
    Mock::given(method("GET"))
        .and(path(format!("{FILE_ROOT}/ck-1")))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "partSize": 65536,
            "parts": [
                { "PartNumber": 1, "ETag": "\"aa\"", "Size": 65536 },
                { "PartNumber": 2, "ETag": "\"bb\"", "Size": 100 }
            ]
        })))
        .mount(&mock_server)
        .await;

    let manifest = create_api(&mock_server)
        .list_upload_parts("ck-1")
        .await
        .unwrap();

    assert_eq!(manifest.part_size, Some(65_536));
    assert_eq!(manifest.parts.len(), 2);
    assert_eq!(manifest.parts[1].index, 2);
    assert_eq!(manifest.parts[1].size, 100);
}

#[tokio::test]
async fn test_http_part_without_etag_rejected() {
    let mock_server = require_mock_server!();
    Mock::given(method("PUT"))
        .and(query_param("part", "4"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&mock_server)
        .await;

    let err = create_api(&mock_server)
        .upload_part("ck", 4, b"abc".to_vec())
        .await
        .unwrap_err();

    assert!(matches!(err.rejection(), Some(Rejection::Other(_))), "{err:?}");
}

#[tokio::test]
async fn test_http_ignored_range_rejected() {
    let mock_server = require_mock_server!();
    Mock::given(method("GET"))
        .and(path("/blob/x"))
        .and(header_exists("range"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"whole body".to_vec()))
        .mount(&mock_server)
        .await;

    let url = format!("{}/blob/x", mock_server.uri());
    let result = create_api(&mock_server).fetch_range(&url, 2, Some(4)).await;

    let Err(err) = result else {
        panic!("expected the ignored range to be rejected");
    };
    assert!(matches!(err, TransferError::ServerRejected { status: 200, .. }));
}

#[tokio::test]
async fn test_http_fetch_range_streams_slice() {
    let mock_server = require_mock_server!();
    let body = payload(1000);
    Mock::given(method("GET"))
        .and(path("/blob/y"))
        .respond_with(RangeResponder { body: body.clone() })
        .mount(&mock_server)
        .await;

    let url = format!("{}/blob/y", mock_server.uri());
    let mut stream = create_api(&mock_server)
        .fetch_range(&url, 100, Some(50))
        .await
        .unwrap();
    let mut received = Vec::new();
    while let Some(chunk) = stream.next().await {
        received.extend(chunk.unwrap());
    }

    assert_eq!(received, body[100..150].to_vec());
}

#[tokio::test]
async fn test_http_abort_sends_delete() {
    let mock_server = require_mock_server!();
    Mock::given(method("DELETE"))
        .and(path(format!("{FILE_ROOT}/ck-5")))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&mock_server)
        .await;

    create_api(&mock_server).abort_upload("ck-5").await.unwrap();
}
