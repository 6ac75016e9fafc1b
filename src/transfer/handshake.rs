//! Remote handshakes that turn a request into a planned session.
//!
//! Uploads go initiate (or re-list a known session) -> plan -> confirm.
//! Downloads resolve the object once and plan the requested range.

use tracing::{debug, info, instrument};

use super::checksum::parse_crc64;
use super::planner::{ChunkPlanner, CompletedPart, PartDescriptor, PartState};
use super::session::{DownloadSession, UploadSession};
use super::transmitter::{as_md5_tag, md5_hex};
use super::TransferError;
use crate::api::{ConfirmedObject, PartManifest, TransferApi};
use crate::request::{ByteRange, ObjectTarget, TransferRequest, UploadSource};

/// Starts or resumes the upload session for `request`.
///
/// With a `known_key` the session's parts are re-listed and the verified
/// prefix is reused. A key the service no longer accepts, or one whose
/// session belongs to another object, is dropped and a fresh session is
/// initiated in its place. A session the service already confirmed comes
/// back with every part done so only the confirm is repeated.
#[instrument(skip_all, fields(key = %request.target().key(), resume = known_key.is_some()))]
pub(crate) async fn prepare_upload(
    api: &dyn TransferApi,
    request: &TransferRequest,
    source: &dyn UploadSource,
    total: u64,
    planner: ChunkPlanner,
    known_key: Option<&str>,
    verify_integrity: bool,
) -> Result<UploadSession, TransferError> {
    if let Some(key) = known_key {
        match api.list_upload_parts(key).await {
            Ok(manifest) if !belongs_to(&manifest, request) => {
                info!(
                    session_path = manifest.path.as_deref().unwrap_or_default(),
                    "upload session belongs to another object, starting a new one"
                );
            }
            Ok(manifest) if manifest.confirmed => {
                info!("upload session already confirmed");
                return Ok(confirmed_session(key.to_string(), planner, total, &manifest, request));
            }
            Ok(manifest) => {
                let planner = manifest
                    .part_size
                    .map_or(planner, ChunkPlanner::new);
                let reused =
                    reusable_prefix(&planner, total, &manifest.parts, source, verify_integrity)
                        .await?;
                info!(
                    listed = manifest.parts.len(),
                    reused = reused.len(),
                    part_size = planner.part_size(),
                    "resuming upload session"
                );
                return Ok(session_for(key.to_string(), planner, total, &reused, request));
            }
            Err(e @ TransferError::ServerRejected { .. }) => {
                info!(error = %e, "upload session no longer valid, starting a new one");
            }
            Err(e) => return Err(e),
        }
    }

    let initiated = api
        .initiate_upload(request.target(), request.metadata(), request.is_overwrite())
        .await?;
    let reused = reusable_prefix(
        &planner,
        total,
        &initiated.existing_parts,
        source,
        verify_integrity,
    )
    .await?;
    debug!(
        existing = initiated.existing_parts.len(),
        reused = reused.len(),
        "upload session initiated"
    );
    Ok(session_for(
        initiated.confirmation_key,
        planner,
        total,
        &reused,
        request,
    ))
}

/// Whether a listed session was opened for the request's target. Sessions
/// that do not report a path are trusted.
fn belongs_to(manifest: &PartManifest, request: &TransferRequest) -> bool {
    manifest.path.as_deref().is_none_or(|path| {
        let listed = path.split('/').filter(|s| !s.is_empty()).collect::<Vec<_>>();
        listed.join("/") == request.target().key()
    })
}

fn confirmed_session(
    key: String,
    planner: ChunkPlanner,
    total: u64,
    manifest: &PartManifest,
    request: &TransferRequest,
) -> UploadSession {
    let planner = manifest.part_size.map_or(planner, ChunkPlanner::new);
    let mut parts = planner.plan(total, &[]);
    for part in &mut parts {
        let tag = manifest
            .parts
            .iter()
            .find(|p| p.index == part.index)
            .map(|p| p.tag.clone())
            .unwrap_or_default();
        part.complete(tag);
    }
    UploadSession::new(
        key,
        parts,
        planner.part_size(),
        total,
        request.metadata().clone(),
    )
}

fn session_for(
    key: String,
    planner: ChunkPlanner,
    total: u64,
    reused: &[CompletedPart],
    request: &TransferRequest,
) -> UploadSession {
    UploadSession::new(
        key,
        planner.plan(total, reused),
        planner.part_size(),
        total,
        request.metadata().clone(),
    )
}

/// Keeps the contiguous run of listed parts 1, 2, ... whose size matches
/// the plan and whose tag matches the local bytes.
async fn reusable_prefix(
    planner: &ChunkPlanner,
    total: u64,
    listed: &[CompletedPart],
    source: &dyn UploadSource,
    verify_integrity: bool,
) -> Result<Vec<CompletedPart>, TransferError> {
    let mut reused = Vec::new();
    for planned in planner.plan(total, &[]) {
        let Some(remote) = listed.iter().find(|p| p.index == planned.index) else {
            break;
        };
        if remote.size != planned.length {
            debug!(part_index = planned.index, "listed part size differs from plan");
            break;
        }
        if verify_integrity && !matches_local(&planned, remote, source).await? {
            debug!(part_index = planned.index, "listed part does not match local bytes");
            break;
        }
        reused.push(remote.clone());
    }
    Ok(reused)
}

async fn matches_local(
    planned: &PartDescriptor,
    remote: &CompletedPart,
    source: &dyn UploadSource,
) -> Result<bool, TransferError> {
    let Some(remote_digest) = as_md5_tag(&remote.tag) else {
        return Ok(false);
    };
    let bytes = source.read_range(planned.offset, planned.length).await?;
    Ok(md5_hex(&bytes) == remote_digest)
}

/// Commits the session; the caller has already checked that every part is done.
#[instrument(skip(api))]
pub(crate) async fn confirm_upload(
    api: &dyn TransferApi,
    confirmation_key: &str,
    crc64: Option<&str>,
) -> Result<ConfirmedObject, TransferError> {
    let confirmed = api.confirm_upload(confirmation_key, crc64).await?;
    info!(object = %confirmed.object_id, "upload confirmed");
    Ok(confirmed)
}

/// Looks up an existing object at `target` whose CRC64 equals `local_crc64`.
///
/// Lookup failures other than cancellation are treated as "no such object"
/// so the caller falls back to a regular upload.
#[instrument(skip(api), fields(key = %target.key()))]
pub(crate) async fn find_identical(
    api: &dyn TransferApi,
    target: &ObjectTarget,
    local_crc64: u64,
    total: u64,
) -> Option<ConfirmedObject> {
    let info = match api.object_info(target).await {
        Ok(Some(info)) => info,
        Ok(None) => return None,
        Err(e) => {
            debug!(error = %e, "object lookup failed, uploading normally");
            return None;
        }
    };
    let remote = info.metadata.crc64.as_deref().and_then(parse_crc64)?;
    if remote != local_crc64 || info.size.is_some_and(|size| size != total) {
        debug!(remote, local = local_crc64, "existing object differs");
        return None;
    }
    info!("identical object already stored, skipping upload");
    Some(ConfirmedObject {
        object_id: target.key(),
        tag: info.metadata.tag,
        size: Some(total),
    })
}

/// Resolves the object and plans the parts to fetch.
///
/// Without range support the whole object becomes a single part, whatever
/// range was requested. Completed parts recorded against a different entity
/// tag than the object now has are fetched again.
#[instrument(skip(api, completed), fields(key = %target.key()))]
pub(crate) async fn resolve_download(
    api: &dyn TransferApi,
    target: &ObjectTarget,
    range: Option<&ByteRange>,
    completed: &[CompletedPart],
    planner: ChunkPlanner,
) -> Result<DownloadSession, TransferError> {
    let resolved = api.resolve_download(target, range).await?;
    let total = resolved.total_size;

    let (start, end, parts) = if resolved.range_supported {
        let (start, end) = match range {
            Some(range) => range.resolve(total)?,
            None => (0, total),
        };
        let current: Vec<CompletedPart> = match resolved.metadata.tag.as_deref() {
            Some(tag) => completed.iter().filter(|p| p.tag == tag).cloned().collect(),
            None => Vec::new(),
        };
        if current.len() < completed.len() {
            info!(
                stale = completed.len() - current.len(),
                "object changed since parts were recorded, fetching them again"
            );
        }
        let parts = planner.plan_range(start, end, &current);
        (start, end, parts)
    } else {
        if range.is_some() {
            info!("range requests unsupported, fetching the whole object");
        }
        (0, total, single_part(total))
    };

    Ok(DownloadSession {
        url: resolved.url,
        total_size: total,
        metadata: resolved.metadata,
        range: range.copied(),
        start,
        end,
        range_supported: resolved.range_supported,
        parts,
    })
}

fn single_part(total: u64) -> Vec<PartDescriptor> {
    if total == 0 {
        return Vec::new();
    }
    vec![PartDescriptor {
        index: 1,
        offset: 0,
        length: total,
        state: PartState::Pending,
        tag: None,
    }]
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::request::{MemorySink, MemorySource};

    fn listed(source: &[u8], part_size: usize, count: usize) -> Vec<CompletedPart> {
        source
            .chunks(part_size)
            .take(count)
            .zip(1u32..)
            .map(|(chunk, index)| CompletedPart {
                index,
                size: chunk.len() as u64,
                tag: format!("\"{}\"", md5_hex(chunk)),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_reusable_prefix_keeps_verified_run() {
        let data: Vec<u8> = (0..50u8).collect();
        let source = MemorySource::new(data.clone());
        let planner = ChunkPlanner::new(10);
        let parts = listed(&data, 10, 3);

        let reused = reusable_prefix(&planner, 50, &parts, &source, true)
            .await
            .unwrap();
        assert_eq!(reused.len(), 3);
    }

    #[tokio::test]
    async fn test_reusable_prefix_stops_at_gap() {
        let data: Vec<u8> = (0..50u8).collect();
        let source = MemorySource::new(data.clone());
        let mut parts = listed(&data, 10, 4);
        parts.remove(1);

        let reused = reusable_prefix(&ChunkPlanner::new(10), 50, &parts, &source, true)
            .await
            .unwrap();
        assert_eq!(reused.iter().map(|p| p.index).collect::<Vec<_>>(), vec![1]);
    }

    #[tokio::test]
    async fn test_reusable_prefix_stops_at_changed_bytes() {
        let data: Vec<u8> = (0..50u8).collect();
        let parts = listed(&data, 10, 3);
        let mut changed = data.clone();
        changed[15] = 0xFF;
        let source = MemorySource::new(changed);

        let reused = reusable_prefix(&ChunkPlanner::new(10), 50, &parts, &source, true)
            .await
            .unwrap();
        assert_eq!(reused.len(), 1);
    }

    #[tokio::test]
    async fn test_reusable_prefix_rejects_opaque_tags_when_verifying() {
        let source = MemorySource::new(vec![0; 20]);
        let parts = vec![CompletedPart { index: 1, size: 10, tag: "opaque-1".into() }];

        let planner = ChunkPlanner::new(10);
        let verified = reusable_prefix(&planner, 20, &parts, &source, true).await.unwrap();
        let trusted = reusable_prefix(&planner, 20, &parts, &source, false).await.unwrap();
        assert!(verified.is_empty());
        assert_eq!(trusted.len(), 1);
    }

    fn manifest_at(path: Option<&str>) -> PartManifest {
        PartManifest {
            path: path.map(str::to_string),
            ..PartManifest::default()
        }
    }

    #[test]
    fn test_session_path_must_match_target() {
        let request = TransferRequest::download(ObjectTarget::new("dir/a.bin"), MemorySink::new());

        assert!(belongs_to(&manifest_at(Some("dir/a.bin")), &request));
        assert!(belongs_to(&manifest_at(Some("/dir//a.bin/")), &request));
        assert!(belongs_to(&manifest_at(None), &request));
        assert!(!belongs_to(&manifest_at(Some("dir/b.bin")), &request));
    }

    #[test]
    fn test_confirmed_session_has_nothing_pending() {
        let request = TransferRequest::download(ObjectTarget::new("a.bin"), MemorySink::new());
        let manifest = PartManifest {
            part_size: Some(10),
            confirmed: true,
            ..PartManifest::default()
        };

        let session = confirmed_session("ck".into(), ChunkPlanner::new(4), 25, &manifest, &request);
        assert_eq!(session.part_size(), 10);
        assert_eq!(session.parts().len(), 3);
        assert!(session.missing_parts().is_empty());
    }

    #[test]
    fn test_single_part_covers_object() {
        assert!(single_part(0).is_empty());
        let parts = single_part(42);
        assert_eq!(parts.len(), 1);
        assert_eq!((parts[0].offset, parts[0].length), (0, 42));
    }
}
