//! DVR push manager.
//!
//! Supervises segmented HLS recording sessions on the upstream video
//! server: starts the push, watches its liveness, recreates it with
//! exponential backoff when it dies, reports progress, and incrementally
//! syncs sealed segments to cold storage while recording continues.

use crate::control::OrchestratorLink;
use crate::mist::{MistApi, MistError, PushEntry};
use crate::storage::hls::parse_media_manifest;
use crate::storage::transfer::Transfer;
use crate::storage::{candidates, DiskProbe, DELETE_THRESHOLD};
use chrono::{DateTime, Utc};
use helm_protocol::{
    AssetType, ControlPayload, DvrProgress, DvrStartRequest, DvrStopped, FreezePermissionRequest,
};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{watch, Notify, RwLock};
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

const PROGRESS_INTERVAL: Duration = Duration::from_secs(30);
const LIVENESS_INTERVAL: Duration = Duration::from_secs(5);
const SYNC_INTERVAL: Duration = Duration::from_secs(10);
const INITIAL_RETRY_DELAY: Duration = Duration::from_secs(5);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);
const MAX_RETRIES: u32 = 10;
const DEFAULT_SEGMENT_DURATION: u32 = 6;
const DEFAULT_RETENTION_SECONDS: u64 = 7200;
const MANIFEST_SYNC_EVERY: u32 = 5;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum DvrError {
    #[error("recording already exists for {0}")]
    AlreadyRecording(String),
    #[error("no recording for {0}")]
    NotFound(String),
    #[error("storage node out of space")]
    DiskFull,
    #[error("upstream server: {0}")]
    Mist(#[from] MistError),
    #[error("control stream: {0}")]
    Control(#[from] crate::control::IngestError),
    #[error("sync rejected: {0}")]
    SyncRejected(String),
    #[error("transfer: {0}")]
    Transfer(String),
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Job state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DvrStatus {
    Starting,
    Recording,
    Stopped,
    Completed,
    Failed,
}

impl DvrStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DvrStatus::Starting => "starting",
            DvrStatus::Recording => "recording",
            DvrStatus::Stopped => "stopped",
            DvrStatus::Completed => "completed",
            DvrStatus::Failed => "failed",
        }
    }

    /// Transitions are monotonic: starting → recording → terminal.
    fn may_become(self, next: DvrStatus) -> bool {
        use DvrStatus::{Completed, Failed, Recording, Starting, Stopped};
        matches!(
            (self, next),
            (Starting, Recording)
                | (Starting | Recording, Stopped | Completed | Failed)
        )
    }
}

pub struct DvrJob {
    pub dvr_hash: String,
    pub stream_id: String,
    pub stream_name: String,
    pub source_url: String,
    pub format: String,
    pub segment_duration: u32,
    pub retention_seconds: u64,
    pub start_time: DateTime<Utc>,
    pub output_dir: PathBuf,
    pub manifest_path: PathBuf,
    pub target_uri: String,
    push_id: AtomicU64,
    status: Mutex<DvrStatus>,
    retry_count: AtomicU32,
    last_push_attempt: Mutex<Option<Instant>>,
    /// Owned by the job so the sync ticker never contends with progress.
    synced_segments: Mutex<HashSet<String>>,
    synced_since_manifest: AtomicU32,
    segment_notify: Notify,
    stop: watch::Sender<bool>,
}

impl DvrJob {
    pub fn status(&self) -> DvrStatus {
        *self.status.lock().expect("status lock poisoned")
    }

    fn set_status(&self, next: DvrStatus) -> bool {
        let mut status = self.status.lock().expect("status lock poisoned");
        if status.may_become(next) {
            *status = next;
            true
        } else {
            false
        }
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count.load(Ordering::Relaxed)
    }

    pub fn synced_segments(&self) -> HashSet<String> {
        self.synced_segments
            .lock()
            .expect("synced set lock poisoned")
            .clone()
    }
}

/// Delay before the n-th push recreation: 5 s doubling, capped at 60 s.
pub fn recreation_delay(retry_count: u32) -> Duration {
    let multiplier = 2u64.saturating_pow(retry_count.min(10));
    (INITIAL_RETRY_DELAY * multiplier as u32).min(MAX_RETRY_DELAY)
}

/// Push target template: segmented TS with a rolling window and an
/// append-only playlist.
pub fn build_target_uri(
    output_dir: &Path,
    dvr_hash: &str,
    segment_duration: u32,
    retention_seconds: u64,
) -> String {
    format!(
        "{}/segments/$minute_$segmentCounter.ts?m3u8=../{}.m3u8&split={}&targetAge={}&append=1&noendlist=1",
        output_dir.display(),
        dvr_hash,
        segment_duration,
        retention_seconds
    )
}

/// Segments listed in the manifest, sealed on disk, and not yet synced —
/// in manifest order.
pub fn segments_needing_sync(
    manifest_segments: &[crate::storage::hls::SegmentRef],
    output_dir: &Path,
    synced: &HashSet<String>,
) -> Vec<String> {
    manifest_segments
        .iter()
        .filter_map(|segment| {
            let name = segment.file_name().to_owned();
            if synced.contains(&name) {
                return None;
            }
            if !output_dir.join(&segment.uri).exists() {
                return None;
            }
            Some(name)
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

pub struct DvrManager<M: MistApi, L: OrchestratorLink, D: DiskProbe> {
    mist: Arc<M>,
    link: Arc<L>,
    probe: Arc<D>,
    root: PathBuf,
    transfer: Transfer,
    jobs: RwLock<HashMap<String, Arc<DvrJob>>>,
}

impl<M: MistApi, L: OrchestratorLink, D: DiskProbe> DvrManager<M, L, D> {
    pub fn new(root: impl Into<PathBuf>, mist: Arc<M>, link: Arc<L>, probe: Arc<D>) -> Self {
        DvrManager {
            mist,
            link,
            probe,
            root: root.into(),
            transfer: Transfer::new(),
            jobs: RwLock::new(HashMap::new()),
        }
    }

    pub async fn job(&self, dvr_hash: &str) -> Option<Arc<DvrJob>> {
        self.jobs.read().await.get(dvr_hash).cloned()
    }

    /// A recording-segment trigger arrived: sync opportunistically.
    pub async fn notify_segment(&self, dvr_hash: &str) {
        if let Some(job) = self.job(dvr_hash).await {
            job.segment_notify.notify_one();
        }
    }

    // -----------------------------------------------------------------------
    // Start
    // -----------------------------------------------------------------------

    /// Start a recording session and spawn its supervisor.
    pub async fn start_recording(self: &Arc<Self>, req: DvrStartRequest) -> Result<(), DvrError> {
        {
            let jobs = self.jobs.read().await;
            if jobs.contains_key(&req.dvr_hash) {
                return Err(DvrError::AlreadyRecording(req.dvr_hash));
            }
        }

        let output_dir = self
            .root
            .join("dvr")
            .join(&req.stream_id)
            .join(&req.dvr_hash);
        std::fs::create_dir_all(output_dir.join("segments"))?;
        self.ensure_headroom()?;

        let segment_duration = if req.segment_duration_seconds == 0 {
            DEFAULT_SEGMENT_DURATION
        } else {
            req.segment_duration_seconds
        };
        let retention_seconds = if req.retention_days == 0 {
            DEFAULT_RETENTION_SECONDS
        } else {
            u64::from(req.retention_days) * 86_400
        };
        let target_uri =
            build_target_uri(&output_dir, &req.dvr_hash, segment_duration, retention_seconds);

        // A stale push from a previous run would double-write segments.
        self.stop_matching_pushes(&req.internal_name, &target_uri)
            .await?;
        self.mist.start_push(&req.internal_name, &target_uri).await?;
        let push_id = self
            .find_push(&req.internal_name, &target_uri)
            .await?
            .map(|p| p.id)
            .unwrap_or(0);

        let (stop, _) = watch::channel(false);
        let job = Arc::new(DvrJob {
            dvr_hash: req.dvr_hash.clone(),
            stream_id: req.stream_id,
            stream_name: req.internal_name,
            source_url: req.source_url,
            format: req.format,
            segment_duration,
            retention_seconds,
            start_time: Utc::now(),
            manifest_path: output_dir.join(format!("{}.m3u8", req.dvr_hash)),
            output_dir,
            target_uri,
            push_id: AtomicU64::new(push_id),
            status: Mutex::new(DvrStatus::Starting),
            retry_count: AtomicU32::new(0),
            last_push_attempt: Mutex::new(Some(Instant::now())),
            synced_segments: Mutex::new(HashSet::new()),
            synced_since_manifest: AtomicU32::new(0),
            segment_notify: Notify::new(),
            stop,
        });
        job.set_status(DvrStatus::Recording);

        let inserted = {
            let mut jobs = self.jobs.write().await;
            if jobs.contains_key(&job.dvr_hash) {
                false
            } else {
                jobs.insert(job.dvr_hash.clone(), Arc::clone(&job));
                true
            }
        };
        if !inserted {
            // Lost a start race; do not leave our duplicate push behind.
            if push_id != 0 {
                let _ = self.mist.stop_push(push_id).await;
            }
            return Err(DvrError::AlreadyRecording(job.dvr_hash.clone()));
        }

        info!(dvr_hash = %job.dvr_hash, stream = %job.stream_name, push_id, "recording started");
        let manager = Arc::clone(self);
        tokio::spawn(async move { manager.supervise(job).await });
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Stop
    // -----------------------------------------------------------------------

    /// Stop a recording. Synchronous from the caller's perspective: the
    /// push is stopped, `DvrStopped` emitted and the job removed before
    /// this returns.
    pub async fn stop_recording(&self, dvr_hash: &str, reason: &str) -> Result<(), DvrError> {
        let job = self
            .job(dvr_hash)
            .await
            .ok_or_else(|| DvrError::NotFound(dvr_hash.to_owned()))?;

        let push_id = job.push_id.load(Ordering::Relaxed);
        if push_id != 0 {
            if let Err(e) = self.mist.stop_push(push_id).await {
                warn!(dvr_hash = %dvr_hash, error = %e, "push stop failed");
            }
        }

        let status = if reason.is_empty() { "stopped" } else { reason };
        job.set_status(DvrStatus::Stopped);
        let _ = job.stop.send(true);
        self.emit_stopped(&job, status).await;
        self.jobs.write().await.remove(dvr_hash);
        info!(dvr_hash = %dvr_hash, status, "recording stopped");
        Ok(())
    }

    async fn emit_stopped(&self, job: &DvrJob, status: &str) {
        let (_, size_bytes) = scan_segments(&job.output_dir);
        let duration_seconds = (Utc::now() - job.start_time).num_seconds().max(0) as u64;
        let stopped = ControlPayload::DvrStopped(DvrStopped {
            dvr_hash: job.dvr_hash.clone(),
            status: status.to_owned(),
            manifest_path: job.manifest_path.display().to_string(),
            duration_seconds,
            size_bytes,
        });
        if let Err(e) = self.link.send(stopped).await {
            warn!(dvr_hash = %job.dvr_hash, error = %e, "DVR stopped event not delivered");
        }
    }

    // -----------------------------------------------------------------------
    // Supervisor
    // -----------------------------------------------------------------------

    async fn supervise(&self, job: Arc<DvrJob>) {
        let mut progress = tokio::time::interval(PROGRESS_INTERVAL);
        let mut liveness = tokio::time::interval(LIVENESS_INTERVAL);
        let mut sync = tokio::time::interval(SYNC_INTERVAL);
        progress.tick().await;
        liveness.tick().await;
        sync.tick().await;
        let mut stop = job.stop.subscribe();

        loop {
            tokio::select! {
                biased;
                _ = stop.changed() => {
                    if *stop.borrow() {
                        return;
                    }
                }
                _ = progress.tick() => {
                    if self.progress_tick(&job).await.is_break() {
                        return;
                    }
                }
                _ = liveness.tick() => {
                    if self.liveness_tick(&job).await.is_break() {
                        return;
                    }
                }
                _ = sync.tick() => {
                    self.sync_job(&job).await;
                }
                () = job.segment_notify.notified() => {
                    self.sync_job(&job).await;
                }
            }
        }
    }

    async fn progress_tick(&self, job: &Arc<DvrJob>) -> std::ops::ControlFlow<()> {
        // Disk-full guard: a full node cannot keep recording.
        if self.ensure_headroom().is_err() {
            warn!(
                dvr_hash = %job.dvr_hash,
                reason = %DvrError::DiskFull,
                "stopping recording"
            );
            let push_id = job.push_id.load(Ordering::Relaxed);
            if push_id != 0 {
                let _ = self.mist.stop_push(push_id).await;
            }
            job.set_status(DvrStatus::Failed);
            self.emit_stopped(job, DvrStatus::Failed.as_str()).await;
            self.jobs.write().await.remove(&job.dvr_hash);
            return std::ops::ControlFlow::Break(());
        }

        let (segment_count, size_bytes) = scan_segments(&job.output_dir);
        let progress = ControlPayload::DvrProgress(DvrProgress {
            dvr_hash: job.dvr_hash.clone(),
            status: job.status().as_str().to_owned(),
            segment_count,
            size_bytes,
        });
        if let Err(e) = self.link.send(progress).await {
            debug!(dvr_hash = %job.dvr_hash, error = %e, "progress not delivered");
        }
        std::ops::ControlFlow::Continue(())
    }

    async fn liveness_tick(&self, job: &Arc<DvrJob>) -> std::ops::ControlFlow<()> {
        let pushes = match self.mist.list_pushes().await {
            Ok(p) => p,
            Err(e) => {
                warn!(dvr_hash = %job.dvr_hash, error = %e, "push list failed");
                return std::ops::ControlFlow::Continue(());
            }
        };
        let ours: Vec<&PushEntry> = pushes
            .iter()
            .filter(|p| p.stream == job.stream_name && p.target == job.target_uri)
            .collect();

        let healthy = ours.iter().any(|p| !p.looks_failed());
        if healthy {
            if let Some(found) = ours.first() {
                job.push_id.store(found.id, Ordering::Relaxed);
            }
            return std::ops::ControlFlow::Continue(());
        }

        if job.retry_count() >= MAX_RETRIES {
            let (segment_count, _) = scan_segments(&job.output_dir);
            let terminal = if segment_count > 0 {
                DvrStatus::Completed
            } else {
                DvrStatus::Failed
            };
            info!(
                dvr_hash = %job.dvr_hash,
                segment_count,
                status = terminal.as_str(),
                "push retries exhausted"
            );
            job.set_status(terminal);
            self.emit_stopped(job, terminal.as_str()).await;
            self.jobs.write().await.remove(&job.dvr_hash);
            return std::ops::ControlFlow::Break(());
        }

        self.recreate_push(job).await;
        std::ops::ControlFlow::Continue(())
    }

    /// Recreate a dead push, rate-limited by exponential backoff.
    async fn recreate_push(&self, job: &Arc<DvrJob>) {
        let delay = recreation_delay(job.retry_count());
        {
            let last = job
                .last_push_attempt
                .lock()
                .expect("push attempt lock poisoned");
            if let Some(prev) = *last {
                if prev.elapsed() < delay {
                    return;
                }
            }
        }

        info!(
            dvr_hash = %job.dvr_hash,
            retry = job.retry_count() + 1,
            "recreating push"
        );
        if let Err(e) = self
            .stop_matching_pushes(&job.stream_name, &job.target_uri)
            .await
        {
            warn!(dvr_hash = %job.dvr_hash, error = %e, "stale push cleanup failed");
        }
        match self.mist.start_push(&job.stream_name, &job.target_uri).await {
            Ok(()) => {
                if let Ok(Some(found)) = self.find_push(&job.stream_name, &job.target_uri).await {
                    job.push_id.store(found.id, Ordering::Relaxed);
                }
            }
            Err(e) => warn!(dvr_hash = %job.dvr_hash, error = %e, "push restart failed"),
        }
        job.retry_count.fetch_add(1, Ordering::Relaxed);
        *job
            .last_push_attempt
            .lock()
            .expect("push attempt lock poisoned") = Some(Instant::now());
    }

    // -----------------------------------------------------------------------
    // Incremental sync
    // -----------------------------------------------------------------------

    /// Sync sealed segments that are not yet in cold storage, in manifest
    /// order, and the manifest itself every few segments.
    pub async fn sync_job(&self, job: &Arc<DvrJob>) {
        let Ok(text) = std::fs::read_to_string(&job.manifest_path) else {
            return; // manifest not written yet
        };
        let parsed = match parse_media_manifest(&text) {
            Ok(p) => p,
            Err(e) => {
                debug!(dvr_hash = %job.dvr_hash, error = %e, "manifest not parseable yet");
                return;
            }
        };

        let synced = job.synced_segments();
        let todo = segments_needing_sync(&parsed.segments, &job.output_dir, &synced);
        for name in todo {
            match self.sync_segment(job, &name).await {
                Ok(()) => {
                    job.synced_segments
                        .lock()
                        .expect("synced set lock poisoned")
                        .insert(name);
                    let count = job.synced_since_manifest.fetch_add(1, Ordering::Relaxed) + 1;
                    if count >= MANIFEST_SYNC_EVERY {
                        job.synced_since_manifest.store(0, Ordering::Relaxed);
                        if let Err(e) = self.sync_manifest(job).await {
                            warn!(dvr_hash = %job.dvr_hash, error = %e, "manifest sync failed");
                        }
                    }
                }
                Err(e) => {
                    warn!(dvr_hash = %job.dvr_hash, segment = %name, error = %e, "segment sync failed");
                    // Manifest order: do not skip ahead of a failed segment.
                    return;
                }
            }
        }
    }

    async fn sync_segment(&self, job: &DvrJob, segment_name: &str) -> Result<(), DvrError> {
        let path = job.output_dir.join("segments").join(segment_name);
        let size = std::fs::metadata(&path)?.len();
        let asset_hash = format!("{}/{}", job.dvr_hash, segment_name);
        self.sync_file(&asset_hash, segment_name, &path, size).await?;
        debug!(dvr_hash = %job.dvr_hash, segment = %segment_name, "segment synced");
        Ok(())
    }

    async fn sync_manifest(&self, job: &DvrJob) -> Result<(), DvrError> {
        let manifest_name = format!("{}.m3u8", job.dvr_hash);
        let size = std::fs::metadata(&job.manifest_path)?.len();
        let asset_hash = format!("{}/{}", job.dvr_hash, manifest_name);
        self.sync_file(&asset_hash, &manifest_name, &job.manifest_path, size)
            .await?;
        debug!(dvr_hash = %job.dvr_hash, "manifest synced");
        Ok(())
    }

    /// Permission-then-PUT for one file of a still-recording DVR.
    async fn sync_file(
        &self,
        asset_hash: &str,
        file_name: &str,
        path: &Path,
        size: u64,
    ) -> Result<(), DvrError> {
        let response = self
            .link
            .freeze_permission(FreezePermissionRequest {
                request_id: Uuid::new_v4().to_string(),
                asset_type: AssetType::DvrSegment,
                asset_hash: asset_hash.to_owned(),
                local_path: path.display().to_string(),
                size_bytes: size,
                filenames: vec![file_name.to_owned()],
                node_id: self.link.node_id(),
            })
            .await?;
        if !response.approved {
            return Err(DvrError::SyncRejected(response.reason));
        }
        let url = response
            .presigned_put_url
            .as_deref()
            .or_else(|| response.segment_urls.get(file_name).map(String::as_str))
            .ok_or_else(|| {
                DvrError::Transfer(format!("no presigned URL for {file_name}"))
            })?;
        self.transfer
            .put_file(url, path, None)
            .await
            .map_err(|e| DvrError::Transfer(e.to_string()))?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn ensure_headroom(&self) -> Result<(), DvrError> {
        let usage = self.probe.usage(&self.root).map_err(DvrError::Io)?;
        if usage.ratio() >= DELETE_THRESHOLD {
            return Err(DvrError::DiskFull);
        }
        Ok(())
    }

    async fn stop_matching_pushes(&self, stream: &str, target: &str) -> Result<(), DvrError> {
        let pushes = self.mist.list_pushes().await?;
        for push in pushes
            .iter()
            .filter(|p| p.stream == stream && p.target == target)
        {
            self.mist.stop_push(push.id).await?;
        }
        Ok(())
    }

    async fn find_push(&self, stream: &str, target: &str) -> Result<Option<PushEntry>, DvrError> {
        let pushes = self.mist.list_pushes().await?;
        Ok(pushes
            .into_iter()
            .find(|p| p.stream == stream && p.target == target))
    }
}

/// Count segments and total bytes under `segments/`.
fn scan_segments(output_dir: &Path) -> (u64, u64) {
    let seg_dir = output_dir.join("segments");
    let Ok(entries) = std::fs::read_dir(&seg_dir) else {
        return (0, candidates::dir_size(output_dir));
    };
    let mut count = 0;
    for entry in entries.flatten() {
        if entry.path().extension().is_some_and(|ext| ext == "ts") {
            count += 1;
        }
    }
    (count, candidates::dir_size(output_dir))
}
