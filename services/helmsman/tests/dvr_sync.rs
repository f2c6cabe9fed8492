//! DVR manager integration: recording start/stop against a fake upstream
//! server and incremental segment sync into a mock object store.

mod common;

use common::{FakeLink, FakeProbe};
use helm_protocol::{ControlPayload, DvrStartRequest};
use helm_test_utils::MockObjectStore;
use helmsman::dvr::{DvrManager, DvrStatus};
use helmsman::mist::{MistApi, MistError, PushEntry};
use std::sync::{Arc, Mutex};

/// Upstream server double: pushes exist exactly when started and not yet
/// stopped.
#[derive(Default)]
struct FakeMist {
    next_id: Mutex<u64>,
    pushes: Mutex<Vec<PushEntry>>,
    started: Mutex<Vec<(String, String)>>,
    stopped: Mutex<Vec<u64>>,
}

impl MistApi for FakeMist {
    async fn start_push(&self, stream: &str, target: &str) -> Result<(), MistError> {
        let mut next_id = self.next_id.lock().unwrap();
        *next_id += 1;
        self.pushes.lock().unwrap().push(PushEntry {
            id: *next_id,
            stream: stream.to_owned(),
            target: target.to_owned(),
            logs: vec!["push running".to_owned()],
        });
        self.started
            .lock()
            .unwrap()
            .push((stream.to_owned(), target.to_owned()));
        Ok(())
    }

    async fn stop_push(&self, push_id: u64) -> Result<(), MistError> {
        self.pushes.lock().unwrap().retain(|p| p.id != push_id);
        self.stopped.lock().unwrap().push(push_id);
        Ok(())
    }

    async fn list_pushes(&self) -> Result<Vec<PushEntry>, MistError> {
        Ok(self.pushes.lock().unwrap().clone())
    }

    async fn config_backup(&self) -> Result<serde_json::Value, MistError> {
        Ok(serde_json::json!({}))
    }

    async fn apply_config(&self, _partial: serde_json::Value) -> Result<(), MistError> {
        Ok(())
    }

    async fn stop_sessions(&self, _stream_names: &[String]) -> Result<(), MistError> {
        Ok(())
    }
}

fn start_request(dvr_hash: &str) -> DvrStartRequest {
    DvrStartRequest {
        dvr_hash: dvr_hash.to_owned(),
        stream_id: "s1".to_owned(),
        internal_name: "live+s".to_owned(),
        source_url: "rtmp://ingest/live/s".to_owned(),
        retention_days: 0,
        segment_duration_seconds: 0,
        format: "ts".to_owned(),
    }
}

fn write_manifest(dir: &std::path::Path, dvr_hash: &str, segments: &[(&str, bool)]) {
    let mut manifest = String::from(
        "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:6\n#EXT-X-MEDIA-SEQUENCE:0\n",
    );
    for (name, sealed) in segments {
        manifest.push_str(&format!("#EXTINF:6.000,\nsegments/{name}\n"));
        if *sealed {
            std::fs::write(dir.join("segments").join(name), vec![7u8; 128]).unwrap();
        }
    }
    std::fs::write(dir.join(format!("{dvr_hash}.m3u8")), manifest).unwrap();
}

struct Fixture {
    store: MockObjectStore,
    link: Arc<FakeLink>,
    mist: Arc<FakeMist>,
    manager: Arc<DvrManager<FakeMist, FakeLink, FakeProbe>>,
    _root: tempfile::TempDir,
    root_path: std::path::PathBuf,
}

async fn fixture() -> Fixture {
    let store = MockObjectStore::start().await;
    let link = Arc::new(FakeLink::approving(format!("http://{}", store.local_addr())));
    let mist = Arc::new(FakeMist::default());
    let root = tempfile::tempdir().unwrap();
    let root_path = root.path().to_path_buf();
    let manager = Arc::new(DvrManager::new(
        root.path(),
        Arc::clone(&mist),
        Arc::clone(&link),
        Arc::new(FakeProbe::with_ratio(1_000_000, 0.5)),
    ));
    Fixture {
        store,
        link,
        mist,
        manager,
        _root: root,
        root_path,
    }
}

#[tokio::test]
async fn start_recording_starts_a_push_and_rejects_duplicates() {
    let fx = fixture().await;
    fx.manager.start_recording(start_request("d1")).await.unwrap();

    let job = fx.manager.job("d1").await.expect("job registered");
    assert_eq!(job.status(), DvrStatus::Recording);
    assert!(job.target_uri.contains("split=6"), "default segment duration");
    assert!(job.target_uri.contains("targetAge=7200"), "default retention");
    assert!(job.target_uri.ends_with("append=1&noendlist=1"));
    assert_eq!(fx.mist.started.lock().unwrap().len(), 1);

    let duplicate = fx.manager.start_recording(start_request("d1")).await;
    assert!(duplicate.is_err(), "one job per dvr hash");

    fx.manager.stop_recording("d1", "stopped").await.unwrap();
}

#[tokio::test]
async fn incremental_sync_uploads_sealed_segments_in_manifest_order() {
    let fx = fixture().await;
    fx.manager.start_recording(start_request("d1")).await.unwrap();
    let job = fx.manager.job("d1").await.unwrap();

    // Manifest lists three segments; only the first two are sealed.
    write_manifest(
        &job.output_dir,
        "d1",
        &[("0_0.ts", true), ("0_1.ts", true), ("1_0.ts", false)],
    );

    fx.manager.sync_job(&job).await;

    // Permission requests carry the composite segment hashes, in order.
    let hashes: Vec<String> = fx
        .link
        .freeze_requests
        .lock()
        .unwrap()
        .iter()
        .map(|r| r.asset_hash.clone())
        .collect();
    assert_eq!(hashes, vec!["d1/0_0.ts", "d1/0_1.ts"]);

    assert!(fx.store.object("0_0.ts").is_some());
    assert!(fx.store.object("0_1.ts").is_some());
    assert!(fx.store.object("1_0.ts").is_none(), "unsealed segment untouched");

    let synced = job.synced_segments();
    assert!(synced.contains("0_0.ts") && synced.contains("0_1.ts"));
    assert_eq!(synced.len(), 2);

    // A second pass has nothing new to do.
    fx.manager.sync_job(&job).await;
    assert_eq!(fx.link.freeze_requests.lock().unwrap().len(), 2);

    fx.manager.stop_recording("d1", "stopped").await.unwrap();
}

#[tokio::test]
async fn manifest_uploads_every_five_synced_segments() {
    let fx = fixture().await;
    fx.manager.start_recording(start_request("d5")).await.unwrap();
    let job = fx.manager.job("d5").await.unwrap();

    write_manifest(
        &job.output_dir,
        "d5",
        &[
            ("0_0.ts", true),
            ("0_1.ts", true),
            ("0_2.ts", true),
            ("0_3.ts", true),
            ("0_4.ts", true),
        ],
    );
    fx.manager.sync_job(&job).await;

    let manifest_requests = fx
        .link
        .freeze_requests
        .lock()
        .unwrap()
        .iter()
        .filter(|r| r.asset_hash == "d5/d5.m3u8")
        .count();
    assert_eq!(manifest_requests, 1, "manifest synced after the fifth segment");
    assert!(fx.store.object("d5.m3u8").is_some());

    fx.manager.stop_recording("d5", "stopped").await.unwrap();
}

#[tokio::test]
async fn stop_recording_stops_the_push_and_emits_stopped_before_returning() {
    let fx = fixture().await;
    fx.manager.start_recording(start_request("d2")).await.unwrap();
    let job = fx.manager.job("d2").await.unwrap();
    write_manifest(&job.output_dir, "d2", &[("0_0.ts", true)]);

    fx.manager.stop_recording("d2", "deleted").await.unwrap();

    // Synchronous contract: by the time stop returns, the push is gone,
    // the event is emitted and the job is removed.
    assert!(fx.mist.pushes.lock().unwrap().is_empty());
    assert!(fx.manager.job("d2").await.is_none());
    let stopped: Vec<_> = fx
        .link
        .payloads()
        .into_iter()
        .filter_map(|p| match p {
            ControlPayload::DvrStopped(s) => Some(s),
            _ => None,
        })
        .collect();
    assert_eq!(stopped.len(), 1);
    assert_eq!(stopped[0].status, "deleted");
    assert!(stopped[0].manifest_path.ends_with("d2.m3u8"));
    assert!(stopped[0].size_bytes > 0);

    let root_dvr = fx.root_path.join("dvr");
    assert!(root_dvr.join("s1/d2/segments/0_0.ts").exists(), "stop never deletes media");
}

#[tokio::test]
async fn stopping_an_unknown_recording_fails() {
    let fx = fixture().await;
    assert!(fx.manager.stop_recording("nope", "stopped").await.is_err());
}
