//! Freeze: replicate a local artifact to cold object storage.
//!
//! A freeze never deletes anything — eviction is a separate, later
//! decision. Exactly one terminal event is emitted per freeze:
//! `SyncComplete` on success, `FreezeComplete(status=failed)` on error.

use super::candidates::FreezeCandidate;
use super::hls::{parse_media_manifest, EventManifest};
use super::transfer::content_type_for;
use super::{sidecar_path, DiskProbe, StorageEngine, StorageError};
use crate::control::OrchestratorLink;
use helm_protocol::{
    AssetType, ControlPayload, FreezeComplete, FreezePermissionRequest, FreezePermissionResponse,
    FreezeProgress, LifecycleState, SyncComplete,
};
use std::path::Path;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

/// What a successful upload pass reports.
struct UploadOutcome {
    size_bytes: u64,
    dtsh_included: bool,
}

impl<L: OrchestratorLink, D: DiskProbe> StorageEngine<L, D> {
    /// Freeze one artifact: ask permission, upload, announce lifecycle.
    ///
    /// At most one freeze per asset hash may be in flight; concurrent calls
    /// for the same hash fail fast with `Busy`.
    pub async fn freeze_asset(&self, candidate: &FreezeCandidate) -> Result<(), StorageError> {
        self.claim_freeze(&candidate.asset_hash)?;
        let result = self.freeze_locked(candidate).await;
        self.release_freeze(&candidate.asset_hash);
        result
    }

    async fn freeze_locked(&self, candidate: &FreezeCandidate) -> Result<(), StorageError> {
        let request_id = Uuid::new_v4().to_string();
        let filenames = enumerate_filenames(candidate)?;

        let response = self
            .link()
            .freeze_permission(FreezePermissionRequest {
                request_id: request_id.clone(),
                asset_type: candidate.asset_type,
                asset_hash: candidate.asset_hash.clone(),
                local_path: candidate.local_path.display().to_string(),
                size_bytes: candidate.size_bytes,
                filenames,
                node_id: self.link().node_id(),
            })
            .await?;

        if !response.approved {
            info!(
                asset_hash = %candidate.asset_hash,
                reason = %response.reason,
                "freeze not approved"
            );
            return Err(StorageError::Rejected(response.reason));
        }

        self.emit_lifecycle(
            &candidate.asset_hash,
            candidate.asset_type,
            LifecycleState::SyncStarted,
            None,
            None,
        )
        .await;

        let outcome = match candidate.asset_type {
            AssetType::Clip | AssetType::Vod => {
                self.upload_single(candidate, &request_id, &response).await
            }
            AssetType::Dvr => self.upload_dvr(candidate, &request_id, &response).await,
            AssetType::DvrSegment => Err(StorageError::Rejected(
                "segment sync is driven by the DVR manager".to_owned(),
            )),
        };

        match outcome {
            Ok(done) => {
                self.emit_lifecycle(
                    &candidate.asset_hash,
                    candidate.asset_type,
                    LifecycleState::Synced,
                    None,
                    None,
                )
                .await;
                let _ = self
                    .link()
                    .send(ControlPayload::SyncComplete(SyncComplete {
                        request_id,
                        asset_hash: candidate.asset_hash.clone(),
                        status: "success".to_owned(),
                        size_bytes: done.size_bytes,
                        dtsh_included: done.dtsh_included,
                    }))
                    .await;
                info!(asset_hash = %candidate.asset_hash, "freeze complete");
                Ok(())
            }
            Err(e) => {
                self.emit_lifecycle(
                    &candidate.asset_hash,
                    candidate.asset_type,
                    LifecycleState::Synced,
                    Some(e.to_string()),
                    None,
                )
                .await;
                let _ = self
                    .link()
                    .send(ControlPayload::FreezeComplete(FreezeComplete {
                        request_id,
                        asset_hash: candidate.asset_hash.clone(),
                        status: "failed".to_owned(),
                        error: Some(e.to_string()),
                    }))
                    .await;
                Err(e)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Clip / VOD upload
    // -----------------------------------------------------------------------

    async fn upload_single(
        &self,
        candidate: &FreezeCandidate,
        request_id: &str,
        response: &FreezePermissionResponse,
    ) -> Result<UploadOutcome, StorageError> {
        let primary_name = file_name(&candidate.local_path);
        let url = response
            .presigned_put_url
            .clone()
            .or_else(|| response.segment_urls.get(&primary_name).cloned())
            .ok_or_else(|| {
                StorageError::Transfer(format!("no presigned URL for {primary_name}"))
            })?;

        let (progress_tx, task) =
            self.spawn_freeze_progress(request_id, &candidate.asset_hash, candidate.size_bytes);
        let size_bytes = self
            .transfer()
            .put_file(&url, &candidate.local_path, Some(progress_tx))
            .await?;
        task.await.ok();

        // Best-effort sidecar.
        let mut dtsh_included = false;
        let sidecar = sidecar_path(&candidate.local_path);
        if sidecar.exists() {
            let sidecar_name = file_name(&sidecar);
            if let Some(sidecar_url) = response.segment_urls.get(&sidecar_name) {
                match self.transfer().put_file(sidecar_url, &sidecar, None).await {
                    Ok(_) => dtsh_included = true,
                    Err(e) => {
                        warn!(asset_hash = %candidate.asset_hash, error = %e, "sidecar upload failed")
                    }
                }
            }
        }

        Ok(UploadOutcome {
            size_bytes,
            dtsh_included,
        })
    }

    // -----------------------------------------------------------------------
    // DVR streaming upload
    // -----------------------------------------------------------------------

    /// Upload a DVR recording with a monotone remote manifest: the remote
    /// playlist only ever references segments whose PUT already succeeded,
    /// so partial playback works mid-freeze.
    async fn upload_dvr(
        &self,
        candidate: &FreezeCandidate,
        request_id: &str,
        response: &FreezePermissionResponse,
    ) -> Result<UploadOutcome, StorageError> {
        let dir = &candidate.local_path;
        let manifest_name = format!("{}.m3u8", candidate.asset_hash);
        let manifest_path = dir.join(&manifest_name);
        let manifest_text = tokio::fs::read_to_string(&manifest_path).await?;
        let parsed = parse_media_manifest(&manifest_text)?;

        let manifest_url = response.segment_urls.get(&manifest_name).ok_or_else(|| {
            StorageError::Transfer(format!("no presigned URL for {manifest_name}"))
        })?;

        // Initial EVENT playlist first, so playback can begin before the
        // freeze completes.
        let mut remote = EventManifest::new(parsed.target_duration);
        self.transfer()
            .put_bytes(
                manifest_url,
                remote.as_str().as_bytes().to_vec(),
                content_type_for(&manifest_name),
            )
            .await?;

        let mut uploaded: u64 = 0;
        for (index, segment) in parsed.segments.iter().enumerate() {
            let segment_name = segment.file_name().to_owned();
            let url = response.segment_urls.get(&segment_name).ok_or_else(|| {
                StorageError::Transfer(format!("no presigned URL for {segment_name}"))
            })?;
            let size = self
                .transfer()
                .put_file(url, &dir.join(&segment.uri), None)
                .await?;
            uploaded += size;

            remote.append_segment(segment.duration, &segment.uri);
            self.transfer()
                .put_bytes(
                    manifest_url,
                    remote.as_str().as_bytes().to_vec(),
                    content_type_for(&manifest_name),
                )
                .await?;

            let percent = ((index + 1) * 100 / parsed.segments.len().max(1)) as u8;
            let _ = self
                .link()
                .send(ControlPayload::FreezeProgress(FreezeProgress {
                    request_id: request_id.to_owned(),
                    asset_hash: candidate.asset_hash.clone(),
                    percent,
                    bytes_uploaded: uploaded,
                }))
                .await;
        }

        // Sidecars after all media.
        let mut dtsh_included = false;
        for dtsh in dtsh_files(dir) {
            let name = file_name(&dtsh);
            if let Some(url) = response.segment_urls.get(&name) {
                match self.transfer().put_file(url, &dtsh, None).await {
                    Ok(_) => dtsh_included = true,
                    Err(e) => {
                        warn!(asset_hash = %candidate.asset_hash, error = %e, "sidecar upload failed")
                    }
                }
            }
        }

        remote.finalize();
        self.transfer()
            .put_bytes(
                manifest_url,
                remote.as_str().as_bytes().to_vec(),
                content_type_for(&manifest_name),
            )
            .await?;

        Ok(UploadOutcome {
            size_bytes: uploaded,
            dtsh_included,
        })
    }

    // -----------------------------------------------------------------------
    // Progress reporting
    // -----------------------------------------------------------------------

    /// Forward chunk sizes from the transfer stream as `FreezeProgress`
    /// messages until the sender side is dropped.
    fn spawn_freeze_progress(
        &self,
        request_id: &str,
        asset_hash: &str,
        total_bytes: u64,
    ) -> (mpsc::UnboundedSender<u64>, tokio::task::JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<u64>();
        let link = std::sync::Arc::clone(self.link_arc());
        let request_id = request_id.to_owned();
        let asset_hash = asset_hash.to_owned();
        let task = tokio::spawn(async move {
            let mut uploaded: u64 = 0;
            while let Some(chunk) = rx.recv().await {
                uploaded += chunk;
                let percent = if total_bytes == 0 {
                    100
                } else {
                    ((uploaded.min(total_bytes)) * 100 / total_bytes) as u8
                };
                let _ = link
                    .send(ControlPayload::FreezeProgress(FreezeProgress {
                        request_id: request_id.clone(),
                        asset_hash: asset_hash.clone(),
                        percent,
                        bytes_uploaded: uploaded,
                    }))
                    .await;
            }
        });
        (tx, task)
    }
}

// ---------------------------------------------------------------------------
// Filename enumeration
// ---------------------------------------------------------------------------

/// The complete upload set for a candidate, in upload order.
fn enumerate_filenames(candidate: &FreezeCandidate) -> Result<Vec<String>, StorageError> {
    match candidate.asset_type {
        AssetType::Clip | AssetType::Vod => {
            let mut names = vec![file_name(&candidate.local_path)];
            let sidecar = sidecar_path(&candidate.local_path);
            if sidecar.exists() {
                names.push(file_name(&sidecar));
            }
            Ok(names)
        }
        AssetType::Dvr => {
            let manifest_name = format!("{}.m3u8", candidate.asset_hash);
            let manifest_path = candidate.local_path.join(&manifest_name);
            let text = std::fs::read_to_string(&manifest_path)?;
            let parsed = parse_media_manifest(&text)?;
            let mut names = vec![manifest_name];
            for segment in &parsed.segments {
                names.push(segment.file_name().to_owned());
            }
            for dtsh in dtsh_files(&candidate.local_path) {
                names.push(file_name(&dtsh));
            }
            Ok(names)
        }
        AssetType::DvrSegment => Err(StorageError::Rejected(
            "segment sync is driven by the DVR manager".to_owned(),
        )),
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn dtsh_files(dir: &Path) -> Vec<std::path::PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut out: Vec<_> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "dtsh"))
        .collect();
    out.sort();
    out
}
