//! Dual-storage cache engine.
//!
//! Owns the on-disk artifact tree and drives the freeze/defrost lifecycle:
//! uploads to cold object storage via orchestrator-issued presigned URLs,
//! evicts by priority under disk pressure, and re-hydrates artifacts on
//! request. All mutations of the artifact tree pass through this engine.
//!
//! # On-disk layout
//! ```text
//! {root}/clips/{stream_name}/{clip_hash}.{format}
//! {root}/clips/{stream_name}/{clip_hash}.{format}.dtsh
//! {root}/vod/{asset_hash}.{format}
//! {root}/dvr/{stream_id}/{dvr_hash}/{dvr_hash}.m3u8
//! {root}/dvr/{stream_id}/{dvr_hash}/segments/{minute}_{counter}.ts
//! {root}/dvr/{stream_id}/{dvr_hash}/.defrost.json
//! ```

pub mod candidates;
pub mod defrost;
pub mod freeze;
pub mod hls;
pub mod transfer;

use crate::control::{IngestError, OrchestratorLink};
use candidates::FreezeCandidate;
use helm_protocol::{ArtifactDeleted, AssetType, ControlPayload, LifecycleState, StorageLifecycle};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use tokio::sync::{watch, Notify};
use tokio::time::{Duration, Instant};
use tracing::{info, warn};

pub const FREEZE_THRESHOLD: f64 = 0.85;
pub const DELETE_THRESHOLD: f64 = 0.95;
pub const TARGET_THRESHOLD: f64 = 0.70;

const PRESSURE_TICK: Duration = Duration::from_secs(300);
const URGENT_DEBOUNCE: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    #[error("transfer: {0}")]
    Transfer(String),
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("control stream: {0}")]
    Control(#[from] IngestError),
    #[error("operation already in flight for {0}")]
    Busy(String),
    #[error("manifest: {0}")]
    Manifest(String),
    #[error("storage node out of space")]
    DiskFull,
}

// ---------------------------------------------------------------------------
// Disk probing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskUsage {
    pub total: u64,
    pub used: u64,
}

impl DiskUsage {
    pub fn ratio(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.used as f64 / self.total as f64
    }

    /// Bytes to free to get back under the target watermark.
    pub fn bytes_over_target(&self, target: f64) -> u64 {
        let target_bytes = (self.total as f64 * target) as u64;
        self.used.saturating_sub(target_bytes)
    }
}

/// Injected so tests can synthesize disk pressure.
pub trait DiskProbe: Send + Sync + 'static {
    fn usage(&self, root: &Path) -> std::io::Result<DiskUsage>;
}

/// Production probe over the filesystem holding the storage root.
pub struct FsProbe;

impl DiskProbe for FsProbe {
    fn usage(&self, root: &Path) -> std::io::Result<DiskUsage> {
        let total = fs2::total_space(root)?;
        let available = fs2::available_space(root)?;
        Ok(DiskUsage {
            total,
            used: total.saturating_sub(available),
        })
    }
}

// ---------------------------------------------------------------------------
// Access ledger
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct AccessRecord {
    pub count: u64,
    pub last_accessed: SystemTime,
}

/// In-memory access tracking feeding the freeze priority formula.
///
/// Artifacts never accessed through the engine fall back to filesystem
/// timestamps with a zero count.
#[derive(Default)]
pub struct AccessLedger {
    inner: Mutex<HashMap<String, AccessRecord>>,
}

impl AccessLedger {
    pub fn record_access(&self, asset_hash: &str) {
        let mut map = self.inner.lock().expect("access ledger lock poisoned");
        let entry = map.entry(asset_hash.to_owned()).or_insert(AccessRecord {
            count: 0,
            last_accessed: SystemTime::now(),
        });
        entry.count += 1;
        entry.last_accessed = SystemTime::now();
    }

    pub fn get(&self, asset_hash: &str) -> Option<AccessRecord> {
        self.inner
            .lock()
            .expect("access ledger lock poisoned")
            .get(asset_hash)
            .copied()
    }

    pub fn forget(&self, asset_hash: &str) {
        self.inner
            .lock()
            .expect("access ledger lock poisoned")
            .remove(asset_hash);
    }
}

// ---------------------------------------------------------------------------
// Defrost job tracking
// ---------------------------------------------------------------------------

/// Result every waiter of a coalesced defrost observes.
#[derive(Debug, Clone)]
pub struct DefrostDone {
    pub local_path: PathBuf,
    pub size_bytes: u64,
}

pub(crate) struct DefrostJob {
    pub request_id: String,
    pub waiters: std::sync::atomic::AtomicU32,
    /// `None` while running; `Some` exactly once on completion.
    pub done: watch::Sender<Option<Result<DefrostDone, String>>>,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct StorageEngine<L: OrchestratorLink, D: DiskProbe> {
    root: PathBuf,
    link: Arc<L>,
    probe: D,
    /// Asset hashes with an upload in flight. Disjoint from `defrosts` keys
    /// at any instant.
    freezing: Mutex<HashSet<String>>,
    defrosts: Mutex<HashMap<String, Arc<DefrostJob>>>,
    pub access: AccessLedger,
    transfer: transfer::Transfer,
    urgent: Notify,
    last_urgent: Mutex<Option<Instant>>,
}

impl<L: OrchestratorLink, D: DiskProbe> StorageEngine<L, D> {
    pub fn new(root: impl Into<PathBuf>, link: Arc<L>, probe: D) -> Self {
        StorageEngine {
            root: root.into(),
            link,
            probe,
            freezing: Mutex::new(HashSet::new()),
            defrosts: Mutex::new(HashMap::new()),
            access: AccessLedger::default(),
            transfer: transfer::Transfer::new(),
            urgent: Notify::new(),
            last_urgent: Mutex::new(None),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub(crate) fn link(&self) -> &L {
        &self.link
    }

    pub(crate) fn link_arc(&self) -> &Arc<L> {
        &self.link
    }

    pub(crate) fn transfer(&self) -> &transfer::Transfer {
        &self.transfer
    }

    /// Current disk usage of the storage root.
    pub fn disk_usage(&self) -> std::io::Result<DiskUsage> {
        self.probe.usage(&self.root)
    }

    /// Request an urgent pressure check (debounced to once per 2 s).
    pub fn notify_pressure(&self) {
        self.urgent.notify_one();
    }

    // -----------------------------------------------------------------------
    // Freeze/defrost exclusivity
    // -----------------------------------------------------------------------

    /// Claim the freeze slot for a hash. Fails when a freeze or defrost of
    /// the same hash is already running.
    pub(crate) fn claim_freeze(&self, asset_hash: &str) -> Result<(), StorageError> {
        if self
            .defrosts
            .lock()
            .expect("defrost map lock poisoned")
            .contains_key(asset_hash)
        {
            return Err(StorageError::Busy(format!("defrost in flight: {asset_hash}")));
        }
        let mut freezing = self.freezing.lock().expect("freeze tracker lock poisoned");
        if !freezing.insert(asset_hash.to_owned()) {
            return Err(StorageError::Busy(format!("freeze in flight: {asset_hash}")));
        }
        Ok(())
    }

    pub(crate) fn defrosts_lock(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<String, Arc<DefrostJob>>> {
        self.defrosts.lock().expect("defrost map lock poisoned")
    }

    pub(crate) fn remove_defrost_job(&self, asset_hash: &str) {
        self.defrosts_lock().remove(asset_hash);
    }

    pub(crate) fn release_freeze(&self, asset_hash: &str) {
        self.freezing
            .lock()
            .expect("freeze tracker lock poisoned")
            .remove(asset_hash);
    }

    pub(crate) fn is_freezing(&self, asset_hash: &str) -> bool {
        self.freezing
            .lock()
            .expect("freeze tracker lock poisoned")
            .contains(asset_hash)
    }

    // -----------------------------------------------------------------------
    // Lifecycle events
    // -----------------------------------------------------------------------

    pub(crate) async fn emit_lifecycle(
        &self,
        asset_hash: &str,
        asset_type: AssetType,
        state: LifecycleState,
        error: Option<String>,
        warm_duration_ms: Option<u64>,
    ) {
        let event = ControlPayload::StorageLifecycle(StorageLifecycle {
            asset_hash: asset_hash.to_owned(),
            asset_type,
            state,
            error,
            warm_duration_ms,
            node_id: self.link.node_id(),
        });
        if let Err(e) = self.link.send(event).await {
            warn!(asset_hash = %asset_hash, error = %e, "lifecycle event not delivered");
        }
    }

    // -----------------------------------------------------------------------
    // Disk-pressure loop
    // -----------------------------------------------------------------------

    /// Run the pressure loop until shutdown: normal tick every 5 minutes,
    /// urgent tick on notify (debounced to at most once per 2 s).
    pub async fn run_pressure_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(PRESSURE_TICK);
        tick.tick().await; // consume the immediate first tick
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = tick.tick() => {
                    self.pressure_cycle().await;
                }
                () = self.urgent.notified() => {
                    if self.urgent_allowed() {
                        self.pressure_cycle().await;
                    }
                }
            }
        }
    }

    fn urgent_allowed(&self) -> bool {
        let mut last = self.last_urgent.lock().expect("urgent debounce lock poisoned");
        let now = Instant::now();
        match *last {
            Some(prev) if now.duration_since(prev) < URGENT_DEBOUNCE => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }

    /// One pressure evaluation.
    pub async fn pressure_cycle(&self) {
        let usage = match self.disk_usage() {
            Ok(u) => u,
            Err(e) => {
                warn!(error = %e, "disk probe failed");
                return;
            }
        };
        let ratio = usage.ratio();

        if ratio >= DELETE_THRESHOLD {
            info!(ratio, "disk pressure critical, entering cleanup");
            self.cleanup_cycle(&usage).await;
        } else if ratio >= FREEZE_THRESHOLD {
            if self.link.is_connected() {
                let bytes_to_free = usage.bytes_over_target(TARGET_THRESHOLD);
                info!(ratio, bytes_to_free, "disk pressure high, freezing candidates");
                self.freeze_cycle(bytes_to_free).await;
            } else {
                // Offline: can still drop anything a prior cycle synced.
                info!(ratio, "disk pressure high while offline, attempting cleanup");
                self.cleanup_cycle(&usage).await;
            }
        }
    }

    async fn freeze_cycle(&self, bytes_to_free: u64) {
        let mut list = self.scan_candidates();
        list.sort_by(|a, b| {
            a.priority()
                .partial_cmp(&b.priority())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let selected = candidates::select_for_freeze(&list, bytes_to_free);
        for candidate in selected {
            if let Err(e) = self.freeze_asset(candidate).await {
                warn!(asset_hash = %candidate.asset_hash, error = %e, "freeze failed");
            }
        }
    }

    /// Emergency cleanup: evict synced artifacts in priority order; freeze
    /// unsynced ones so they become evictable next cycle.
    async fn cleanup_cycle(&self, usage: &DiskUsage) {
        let bytes_to_free = usage.bytes_over_target(TARGET_THRESHOLD);
        let mut list = self.scan_candidates();
        list.sort_by(|a, b| {
            a.priority()
                .partial_cmp(&b.priority())
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut freed: u64 = 0;
        for candidate in &list {
            if freed >= bytes_to_free {
                break;
            }
            match self.link.can_delete(&candidate.asset_hash).await {
                Ok(resp) if resp.safe_to_delete => {
                    match self.evict(candidate, resp.warm_duration_ms).await {
                        Ok(()) => freed += candidate.size_bytes,
                        Err(e) => {
                            warn!(asset_hash = %candidate.asset_hash, error = %e, "eviction failed");
                        }
                    }
                }
                Ok(resp) => {
                    info!(
                        asset_hash = %candidate.asset_hash,
                        reason = %resp.reason,
                        "not safe to delete, freezing instead"
                    );
                    if self.link.is_connected() {
                        if let Err(e) = self.freeze_asset(candidate).await {
                            warn!(asset_hash = %candidate.asset_hash, error = %e, "opportunistic freeze failed");
                        }
                    }
                }
                Err(e) => {
                    warn!(asset_hash = %candidate.asset_hash, error = %e, "can-delete failed");
                }
            }
        }
    }

    fn scan_candidates(&self) -> Vec<FreezeCandidate> {
        candidates::collect_candidates(&self.root, &self.access, SystemTime::now())
    }

    // -----------------------------------------------------------------------
    // Eviction
    // -----------------------------------------------------------------------

    /// Remove a synced artifact's local copy.
    ///
    /// Only called after the orchestrator confirmed `safe_to_delete`.
    pub async fn evict(
        &self,
        candidate: &FreezeCandidate,
        warm_duration_ms: u64,
    ) -> Result<(), StorageError> {
        // Never rip files out from under an in-flight operation.
        if self.is_freezing(&candidate.asset_hash) {
            return Err(StorageError::Busy(candidate.asset_hash.clone()));
        }

        if candidate.local_path.is_dir() {
            std::fs::remove_dir_all(&candidate.local_path)?;
        } else {
            std::fs::remove_file(&candidate.local_path)?;
            let sidecar = sidecar_path(&candidate.local_path);
            if sidecar.exists() {
                std::fs::remove_file(&sidecar)?;
            }
        }
        self.access.forget(&candidate.asset_hash);

        self.emit_lifecycle(
            &candidate.asset_hash,
            candidate.asset_type,
            LifecycleState::Evicted,
            None,
            Some(warm_duration_ms),
        )
        .await;
        let deleted = ControlPayload::ArtifactDeleted(ArtifactDeleted {
            asset_hash: candidate.asset_hash.clone(),
            asset_type: candidate.asset_type,
            reason: "eviction".to_owned(),
            node_id: self.link.node_id(),
        });
        if let Err(e) = self.link.send(deleted).await {
            warn!(asset_hash = %candidate.asset_hash, error = %e, "artifact-deleted event not delivered");
        }
        info!(asset_hash = %candidate.asset_hash, "artifact evicted");
        Ok(())
    }
}

/// `.dtsh` sidecar path next to a media file.
pub(crate) fn sidecar_path(primary: &Path) -> PathBuf {
    let mut name = primary
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push_str(".dtsh");
    primary.with_file_name(name)
}
