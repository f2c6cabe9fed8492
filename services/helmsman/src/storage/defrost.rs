//! Defrost: re-hydrate a cold-stored artifact into the local cache.
//!
//! Concurrent defrost callers coalesce onto one job per asset hash; every
//! waiter observes the same local path and size. DVR defrosts persist a
//! `.defrost.json` progress file so a restart resumes instead of starting
//! over; a parse error in that file means "no resume", never a failure.

use super::hls::{parse_media_manifest, EventManifest};
use super::{DefrostDone, DefrostJob, DiskProbe, StorageEngine, StorageError};
use crate::control::OrchestratorLink;
use helm_protocol::{
    AssetType, ControlPayload, DefrostComplete, DefrostProgress, DefrostRequest, LifecycleState,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const RESUME_FILE: &str = ".defrost.json";

// ---------------------------------------------------------------------------
// Resume state
// ---------------------------------------------------------------------------

/// Forward-compatible resume record. Unknown fields are ignored.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct DefrostResume {
    #[serde(default)]
    pub completed_segments: Vec<String>,
}

/// Load resume state; any read or parse failure means "no resume".
pub fn load_resume(dir: &Path) -> Option<DefrostResume> {
    let text = std::fs::read_to_string(dir.join(RESUME_FILE)).ok()?;
    match serde_json::from_str(&text) {
        Ok(resume) => Some(resume),
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "unreadable defrost resume state, restarting");
            None
        }
    }
}

fn store_resume(dir: &Path, resume: &DefrostResume) -> Result<(), StorageError> {
    let text = serde_json::to_string(resume)
        .map_err(|e| StorageError::Transfer(format!("resume encode: {e}")))?;
    std::fs::write(dir.join(RESUME_FILE), text)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Engine entry points
// ---------------------------------------------------------------------------

impl<L: OrchestratorLink, D: DiskProbe> StorageEngine<L, D> {
    /// Dispatcher entry: run the defrost and answer the orchestrator.
    pub async fn handle_defrost(&self, request: DefrostRequest) {
        let request_id = request.request_id.clone();
        let asset_hash = request.asset_hash.clone();
        let complete = match self.defrost(request).await {
            Ok(done) => DefrostComplete {
                request_id,
                asset_hash,
                status: "success".to_owned(),
                local_path: Some(done.local_path.display().to_string()),
                size_bytes: done.size_bytes,
                error: None,
            },
            Err(e) => DefrostComplete {
                request_id,
                asset_hash,
                status: "failed".to_owned(),
                local_path: None,
                size_bytes: 0,
                error: Some(e.to_string()),
            },
        };
        if let Err(e) = self
            .link()
            .send(ControlPayload::DefrostComplete(complete))
            .await
        {
            warn!(error = %e, "defrost completion not delivered");
        }
    }

    /// Defrost with per-hash coalescing.
    pub async fn defrost(&self, request: DefrostRequest) -> Result<DefrostDone, StorageError> {
        let (job, is_leader) = self.join_or_create_job(&request)?;

        if !is_leader {
            debug!(asset_hash = %request.asset_hash, "attaching to in-flight defrost");
            let mut rx = job.done.subscribe();
            let outcome = rx
                .wait_for(|v| v.is_some())
                .await
                .map_err(|_| StorageError::Transfer("defrost job vanished".to_owned()))?
                .clone()
                .expect("checked Some");
            return outcome.map_err(StorageError::Transfer);
        }

        let result = match request.asset_type {
            AssetType::Dvr => self.defrost_dvr(&request).await,
            AssetType::Clip | AssetType::Vod | AssetType::DvrSegment => {
                self.defrost_single_file(&request).await
            }
        };

        // Publish to waiters, then drop the job entry.
        job.done
            .send_replace(Some(result.as_ref().map(Clone::clone).map_err(ToString::to_string)));
        self.remove_defrost_job(&request.asset_hash);
        let waiters = job.waiters.load(std::sync::atomic::Ordering::Relaxed);
        if waiters > 0 {
            debug!(
                request_id = %job.request_id,
                asset_hash = %request.asset_hash,
                waiters,
                "woke defrost waiters"
            );
        }
        result
    }

    fn join_or_create_job(
        &self,
        request: &DefrostRequest,
    ) -> Result<(Arc<DefrostJob>, bool), StorageError> {
        let mut jobs = self.defrosts_lock();
        if let Some(existing) = jobs.get(&request.asset_hash) {
            existing
                .waiters
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            return Ok((Arc::clone(existing), false));
        }
        // No concurrent freeze and defrost of the same hash.
        if self.is_freezing(&request.asset_hash) {
            return Err(StorageError::Busy(format!(
                "freeze in flight: {}",
                request.asset_hash
            )));
        }
        let (done, _) = tokio::sync::watch::channel(None);
        let job = Arc::new(DefrostJob {
            request_id: request.request_id.clone(),
            waiters: std::sync::atomic::AtomicU32::new(0),
            done,
        });
        jobs.insert(request.asset_hash.clone(), Arc::clone(&job));
        Ok((job, true))
    }

    // -----------------------------------------------------------------------
    // Single file (clip / vod)
    // -----------------------------------------------------------------------

    async fn defrost_single_file(
        &self,
        request: &DefrostRequest,
    ) -> Result<DefrostDone, StorageError> {
        let dest = PathBuf::from(&request.local_path);

        // Already warm: short-circuit.
        if dest.exists() {
            let size_bytes = std::fs::metadata(&dest)?.len();
            self.emit_lifecycle(
                &request.asset_hash,
                request.asset_type,
                LifecycleState::Cached,
                None,
                None,
            )
            .await;
            return Ok(DefrostDone {
                local_path: dest,
                size_bytes,
            });
        }

        let url = request.presigned_get_url.clone().ok_or_else(|| {
            StorageError::Transfer(format!("no presigned URL for {}", request.asset_hash))
        })?;

        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        self.emit_lifecycle(
            &request.asset_hash,
            request.asset_type,
            LifecycleState::CacheStarted,
            None,
            None,
        )
        .await;

        // Optional sidecar first; failure is non-fatal.
        let file_name = dest
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let sidecar_name = format!("{file_name}.dtsh");
        if let Some(sidecar_url) = request.segment_urls.get(&sidecar_name) {
            let sidecar_dest = super::sidecar_path(&dest);
            if let Err(e) = self
                .transfer()
                .get_to_file(sidecar_url, &sidecar_dest, None)
                .await
            {
                warn!(asset_hash = %request.asset_hash, error = %e, "sidecar download failed");
            }
        }

        let (progress_tx, task) = self.spawn_defrost_progress(request);
        let size_bytes = self
            .transfer()
            .get_to_file(&url, &dest, Some(progress_tx))
            .await?;
        task.await.ok();

        self.access.record_access(&request.asset_hash);
        self.emit_lifecycle(
            &request.asset_hash,
            request.asset_type,
            LifecycleState::Cached,
            None,
            None,
        )
        .await;
        info!(asset_hash = %request.asset_hash, size_bytes, "defrost complete");
        Ok(DefrostDone {
            local_path: dest,
            size_bytes,
        })
    }

    // -----------------------------------------------------------------------
    // DVR (HLS-aware, resumable)
    // -----------------------------------------------------------------------

    async fn defrost_dvr(&self, request: &DefrostRequest) -> Result<DefrostDone, StorageError> {
        let dir = PathBuf::from(&request.local_path);
        let manifest_name = format!("{}.m3u8", request.asset_hash);
        let manifest_path = dir.join(&manifest_name);

        // A finalized local manifest means the recording is already warm.
        if let Ok(text) = std::fs::read_to_string(&manifest_path) {
            if parse_media_manifest(&text).map(|m| m.ended).unwrap_or(false) {
                let size_bytes = super::candidates::dir_size(&dir);
                self.emit_lifecycle(
                    &request.asset_hash,
                    AssetType::Dvr,
                    LifecycleState::Cached,
                    None,
                    None,
                )
                .await;
                return Ok(DefrostDone {
                    local_path: dir,
                    size_bytes,
                });
            }
        }

        let manifest_url = request
            .segment_urls
            .get(&manifest_name)
            .or(request.presigned_get_url.as_ref())
            .ok_or_else(|| {
                StorageError::Transfer(format!("no presigned URL for {manifest_name}"))
            })?;
        let manifest_bytes = self.transfer().get_bytes(manifest_url).await?;
        let manifest_text = String::from_utf8_lossy(&manifest_bytes);
        let parsed = parse_media_manifest(&manifest_text)?;

        std::fs::create_dir_all(dir.join("segments"))?;
        self.emit_lifecycle(
            &request.asset_hash,
            AssetType::Dvr,
            LifecycleState::CacheStarted,
            None,
            None,
        )
        .await;

        // Segments already on disk from an interrupted run are skipped.
        let mut resume = load_resume(&dir).unwrap_or_default();
        let completed: HashSet<String> = resume.completed_segments.iter().cloned().collect();

        // Local EVENT manifest grows as each segment lands, so a local
        // player can begin playback before the defrost completes.
        let mut local = EventManifest::new(parsed.target_duration);
        let total = parsed.segments.len().max(1);
        for (index, segment) in parsed.segments.iter().enumerate() {
            let name = segment.file_name().to_owned();
            let seg_path = dir.join(&segment.uri);
            let already = completed.contains(&name) && seg_path.exists();
            if !already {
                let url = request.segment_urls.get(&name).ok_or_else(|| {
                    StorageError::Transfer(format!("no presigned URL for {name}"))
                })?;
                self.transfer().get_to_file(url, &seg_path, None).await?;
                resume.completed_segments.push(name.clone());
                store_resume(&dir, &resume)?;
            }

            local.append_segment(segment.duration, &segment.uri);
            std::fs::write(&manifest_path, local.as_str())?;

            let percent = ((index + 1) * 100 / total) as u8;
            let _ = self
                .link()
                .send(ControlPayload::DefrostProgress(DefrostProgress {
                    request_id: request.request_id.clone(),
                    asset_hash: request.asset_hash.clone(),
                    percent,
                    bytes_downloaded: super::candidates::dir_size(&dir),
                }))
                .await;
        }

        // Sidecars are best-effort.
        for (name, url) in &request.segment_urls {
            if name.ends_with(".dtsh") {
                if let Err(e) = self.transfer().get_to_file(url, &dir.join(name), None).await {
                    warn!(asset_hash = %request.asset_hash, error = %e, "sidecar download failed");
                }
            }
        }

        local.finalize();
        std::fs::write(&manifest_path, local.as_str())?;
        let _ = std::fs::remove_file(dir.join(RESUME_FILE));

        let size_bytes = super::candidates::dir_size(&dir);
        self.access.record_access(&request.asset_hash);
        self.emit_lifecycle(
            &request.asset_hash,
            AssetType::Dvr,
            LifecycleState::Cached,
            None,
            None,
        )
        .await;
        info!(asset_hash = %request.asset_hash, size_bytes, "DVR defrost complete");
        Ok(DefrostDone {
            local_path: dir,
            size_bytes,
        })
    }

    fn spawn_defrost_progress(
        &self,
        request: &DefrostRequest,
    ) -> (
        tokio::sync::mpsc::UnboundedSender<u64>,
        tokio::task::JoinHandle<()>,
    ) {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<u64>();
        let link = Arc::clone(self.link_arc());
        let request_id = request.request_id.clone();
        let asset_hash = request.asset_hash.clone();
        let task = tokio::spawn(async move {
            let mut downloaded: u64 = 0;
            while let Some(chunk) = rx.recv().await {
                downloaded += chunk;
                let _ = link
                    .send(ControlPayload::DefrostProgress(DefrostProgress {
                        request_id: request_id.clone(),
                        asset_hash: asset_hash.clone(),
                        // Size unknown until the transfer ends.
                        percent: 0,
                        bytes_downloaded: downloaded,
                    }))
                    .await;
            }
        });
        (tx, task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resume_state_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let resume = DefrostResume {
            completed_segments: vec!["0_0.ts".to_owned(), "0_1.ts".to_owned()],
        };
        store_resume(dir.path(), &resume).unwrap();
        let loaded = load_resume(dir.path()).unwrap();
        assert_eq!(loaded.completed_segments, resume.completed_segments);
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(RESUME_FILE),
            r#"{"completed_segments":["0_0.ts"],"future_field":{"nested":true}}"#,
        )
        .unwrap();
        let loaded = load_resume(dir.path()).unwrap();
        assert_eq!(loaded.completed_segments, vec!["0_0.ts"]);
    }

    #[test]
    fn parse_errors_mean_no_resume() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(RESUME_FILE), b"{truncated").unwrap();
        assert!(load_resume(dir.path()).is_none());
    }

    #[test]
    fn missing_file_means_no_resume() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_resume(dir.path()).is_none());
    }
}
