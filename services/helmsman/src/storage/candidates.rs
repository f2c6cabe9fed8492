//! Freeze candidate discovery and prioritization.
//!
//! Scans the artifact tree and derives a priority per artifact
//! (lower = first to freeze):
//!
//! ```text
//! priority = (age_hours/24 + size_mb/1000) / ((access_count+1) * recent_access_factor)
//! ```
//!
//! with `recent_access_factor = 10` if accessed within 24 h, `2` within
//! 168 h, else `1`. Artifacts younger than the minimum retention (1 h) are
//! excluded entirely.

use super::{AccessLedger, AccessRecord};
use helm_protocol::AssetType;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::warn;

const MIN_RETENTION_HOURS: f64 = 1.0;

#[derive(Debug, Clone)]
pub struct FreezeCandidate {
    pub asset_type: AssetType,
    pub asset_hash: String,
    /// Clip/VOD: the media file. DVR: the recording directory.
    pub local_path: PathBuf,
    pub size_bytes: u64,
    pub age_hours: f64,
    pub access_count: u64,
    pub hours_since_access: f64,
}

impl FreezeCandidate {
    pub fn priority(&self) -> f64 {
        let recent_access_factor = if self.hours_since_access <= 24.0 {
            10.0
        } else if self.hours_since_access <= 168.0 {
            2.0
        } else {
            1.0
        };
        let size_mb = self.size_bytes as f64 / (1024.0 * 1024.0);
        (self.age_hours / 24.0 + size_mb / 1000.0)
            / ((self.access_count as f64 + 1.0) * recent_access_factor)
    }
}

/// Pick candidates in priority order until `bytes_to_free` is covered.
///
/// `sorted` must already be ascending by priority. Returns the selected
/// prefix; exhausts the list when even that does not cover the goal.
pub fn select_for_freeze(sorted: &[FreezeCandidate], bytes_to_free: u64) -> Vec<&FreezeCandidate> {
    let mut selected = Vec::new();
    let mut covered: u64 = 0;
    for candidate in sorted {
        if covered >= bytes_to_free {
            break;
        }
        covered += candidate.size_bytes;
        selected.push(candidate);
    }
    selected
}

// ---------------------------------------------------------------------------
// Filesystem scan
// ---------------------------------------------------------------------------

/// Walk the artifact tree and build candidates across clips, DVRs and VODs.
///
/// Scan errors on individual entries are logged and skipped; a partially
/// readable tree still produces usable candidates.
pub fn collect_candidates(
    root: &Path,
    ledger: &AccessLedger,
    now: SystemTime,
) -> Vec<FreezeCandidate> {
    let mut out = Vec::new();
    scan_clips(&root.join("clips"), ledger, now, &mut out);
    scan_vod(&root.join("vod"), ledger, now, &mut out);
    scan_dvr(&root.join("dvr"), ledger, now, &mut out);
    out
}

fn scan_clips(dir: &Path, ledger: &AccessLedger, now: SystemTime, out: &mut Vec<FreezeCandidate>) {
    for stream_dir in read_dirs(dir) {
        for file in read_files(&stream_dir) {
            if is_sidecar(&file) {
                continue;
            }
            if let Some(candidate) =
                file_candidate(AssetType::Clip, &file, ledger, now)
            {
                out.push(candidate);
            }
        }
    }
}

fn scan_vod(dir: &Path, ledger: &AccessLedger, now: SystemTime, out: &mut Vec<FreezeCandidate>) {
    for file in read_files(dir) {
        if is_sidecar(&file) {
            continue;
        }
        if let Some(candidate) = file_candidate(AssetType::Vod, &file, ledger, now) {
            out.push(candidate);
        }
    }
}

fn scan_dvr(dir: &Path, ledger: &AccessLedger, now: SystemTime, out: &mut Vec<FreezeCandidate>) {
    for stream_dir in read_dirs(dir) {
        for recording_dir in read_dirs(&stream_dir) {
            let Some(hash) = dir_name(&recording_dir) else {
                continue;
            };
            let size = dir_size(&recording_dir);
            let Some((age_hours, fs_accessed)) = file_times(&recording_dir, now) else {
                continue;
            };
            if age_hours < MIN_RETENTION_HOURS {
                continue;
            }
            let (access_count, hours_since_access) =
                access_view(ledger, &hash, fs_accessed, now);
            out.push(FreezeCandidate {
                asset_type: AssetType::Dvr,
                asset_hash: hash,
                local_path: recording_dir,
                size_bytes: size,
                age_hours,
                access_count,
                hours_since_access,
            });
        }
    }
}

fn file_candidate(
    asset_type: AssetType,
    file: &Path,
    ledger: &AccessLedger,
    now: SystemTime,
) -> Option<FreezeCandidate> {
    let hash = file.file_stem()?.to_string_lossy().into_owned();
    let meta = std::fs::metadata(file).ok()?;
    let (age_hours, fs_accessed) = file_times(file, now)?;
    if age_hours < MIN_RETENTION_HOURS {
        return None;
    }
    let (access_count, hours_since_access) = access_view(ledger, &hash, fs_accessed, now);
    Some(FreezeCandidate {
        asset_type,
        asset_hash: hash,
        local_path: file.to_path_buf(),
        size_bytes: meta.len(),
        age_hours,
        access_count,
        hours_since_access,
    })
}

fn access_view(
    ledger: &AccessLedger,
    hash: &str,
    fs_accessed: SystemTime,
    now: SystemTime,
) -> (u64, f64) {
    match ledger.get(hash) {
        Some(AccessRecord {
            count,
            last_accessed,
        }) => (count, hours_between(last_accessed, now)),
        None => (0, hours_between(fs_accessed, now)),
    }
}

fn file_times(path: &Path, now: SystemTime) -> Option<(f64, SystemTime)> {
    let meta = std::fs::metadata(path).ok()?;
    let modified = meta.modified().ok()?;
    let accessed = meta.accessed().unwrap_or(modified);
    Some((hours_between(modified, now), accessed))
}

fn hours_between(earlier: SystemTime, now: SystemTime) -> f64 {
    now.duration_since(earlier)
        .map(|d| d.as_secs_f64() / 3600.0)
        .unwrap_or(0.0)
}

fn is_sidecar(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "dtsh")
}

fn dir_name(path: &Path) -> Option<String> {
    path.file_name().map(|n| n.to_string_lossy().into_owned())
}

fn read_dirs(dir: &Path) -> Vec<PathBuf> {
    read_entries(dir, true)
}

fn read_files(dir: &Path) -> Vec<PathBuf> {
    read_entries(dir, false)
}

fn read_entries(dir: &Path, dirs: bool) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for entry in entries {
        match entry {
            Ok(e) => {
                let path = e.path();
                if path.is_dir() == dirs {
                    out.push(path);
                }
            }
            Err(e) => warn!(dir = %dir.display(), error = %e, "unreadable directory entry"),
        }
    }
    out.sort();
    out
}

/// Total bytes under a directory, recursively.
pub fn dir_size(dir: &Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    let mut total = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            total += dir_size(&path);
        } else if let Ok(meta) = entry.metadata() {
            total += meta.len();
        }
    }
    total
}
