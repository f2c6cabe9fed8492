//! Shared fixtures: a scriptable in-process orchestrator link and a
//! synthetic disk probe.
#![allow(dead_code)] // each test binary uses a different subset

use helm_protocol::{
    CanDeleteResponse, ControlPayload, FreezePermissionRequest, FreezePermissionResponse,
    LifecycleState,
};
use helmsman::control::{IngestError, OrchestratorLink};
use helmsman::storage::{DiskProbe, DiskUsage};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

pub type FreezeScript =
    Box<dyn Fn(&FreezePermissionRequest) -> FreezePermissionResponse + Send + Sync>;
pub type CanDeleteScript = Box<dyn Fn(&str) -> CanDeleteResponse + Send + Sync>;

/// In-process orchestrator double. Scripts answer the RPCs; gates make
/// overlap deterministic in concurrency tests.
#[derive(Default)]
pub struct FakeLink {
    pub events: Mutex<Vec<ControlPayload>>,
    pub freeze_requests: Mutex<Vec<FreezePermissionRequest>>,
    pub freeze_script: Mutex<Option<FreezeScript>>,
    pub can_delete_script: Mutex<Option<CanDeleteScript>>,
    /// When set, `freeze_permission` parks until notified.
    pub freeze_gate: Mutex<Option<Arc<Notify>>>,
    /// When set, the `CACHE_STARTED` lifecycle event parks until notified.
    pub cache_started_gate: Mutex<Option<Arc<Notify>>>,
}

impl FakeLink {
    pub fn approving(store_base: String) -> Self {
        let link = FakeLink::default();
        link.set_freeze_script(move |request| {
            let segment_urls = request
                .filenames
                .iter()
                .map(|name| (name.clone(), format!("{store_base}/{name}?sig=test")))
                .collect();
            FreezePermissionResponse {
                request_id: request.request_id.clone(),
                approved: true,
                reason: String::new(),
                presigned_put_url: None,
                segment_urls,
            }
        });
        link
    }

    pub fn set_freeze_script<F>(&self, script: F)
    where
        F: Fn(&FreezePermissionRequest) -> FreezePermissionResponse + Send + Sync + 'static,
    {
        *self.freeze_script.lock().unwrap() = Some(Box::new(script));
    }

    pub fn set_can_delete_script<F>(&self, script: F)
    where
        F: Fn(&str) -> CanDeleteResponse + Send + Sync + 'static,
    {
        *self.can_delete_script.lock().unwrap() = Some(Box::new(script));
    }

    pub fn payloads(&self) -> Vec<ControlPayload> {
        self.events.lock().unwrap().clone()
    }

    /// Lifecycle states recorded for one asset, in emission order.
    pub fn lifecycle_states(&self, asset_hash: &str) -> Vec<LifecycleState> {
        self.payloads()
            .into_iter()
            .filter_map(|p| match p {
                ControlPayload::StorageLifecycle(e) if e.asset_hash == asset_hash => Some(e.state),
                _ => None,
            })
            .collect()
    }
}

impl OrchestratorLink for FakeLink {
    fn node_id(&self) -> String {
        "edge-test".to_owned()
    }

    fn is_connected(&self) -> bool {
        true
    }

    async fn send(&self, payload: ControlPayload) -> Result<(), IngestError> {
        if let ControlPayload::StorageLifecycle(event) = &payload {
            if event.state == LifecycleState::CacheStarted {
                let gate = self.cache_started_gate.lock().unwrap().clone();
                if let Some(gate) = gate {
                    gate.notified().await;
                }
            }
        }
        self.events.lock().unwrap().push(payload);
        Ok(())
    }

    async fn freeze_permission(
        &self,
        request: FreezePermissionRequest,
    ) -> Result<FreezePermissionResponse, IngestError> {
        self.freeze_requests.lock().unwrap().push(request.clone());
        let gate = self.freeze_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let script = self.freeze_script.lock().unwrap();
        match script.as_ref() {
            Some(f) => Ok(f(&request)),
            None => Ok(FreezePermissionResponse {
                request_id: request.request_id.clone(),
                approved: false,
                reason: "no responder scripted".to_owned(),
                presigned_put_url: None,
                segment_urls: Default::default(),
            }),
        }
    }

    async fn can_delete(&self, asset_hash: &str) -> Result<CanDeleteResponse, IngestError> {
        let script = self.can_delete_script.lock().unwrap();
        match script.as_ref() {
            Some(f) => Ok(f(asset_hash)),
            None => Ok(CanDeleteResponse {
                request_id: "unscripted".to_owned(),
                asset_hash: asset_hash.to_owned(),
                safe_to_delete: false,
                reason: "no responder scripted".to_owned(),
                warm_duration_ms: 0,
            }),
        }
    }
}

/// Synthetic disk usage.
pub struct FakeProbe(pub Mutex<DiskUsage>);

impl FakeProbe {
    pub fn with_ratio(total: u64, ratio: f64) -> Self {
        FakeProbe(Mutex::new(DiskUsage {
            total,
            used: (total as f64 * ratio) as u64,
        }))
    }

    pub fn set_ratio(&self, ratio: f64) {
        let mut usage = self.0.lock().unwrap();
        usage.used = (usage.total as f64 * ratio) as u64;
    }
}

impl DiskProbe for FakeProbe {
    fn usage(&self, _root: &Path) -> std::io::Result<DiskUsage> {
        Ok(*self.0.lock().unwrap())
    }
}
