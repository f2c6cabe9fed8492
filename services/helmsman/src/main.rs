// helmsman: Edge-node sidecar.
//
// Maintains the control stream to the orchestrator, serves video-server
// trigger webhooks, supervises DVR recordings, reconciles upstream config,
// and runs the cache freeze/defrost engine.

use helm_protocol::{ControlPayload, Register};
use helmsman::config::HelmsmanConfig;
use helmsman::control::transport::{ControlStream, ControlStreamConfig};
use helmsman::control::triggers::TriggerDispatcher;
use helmsman::dvr::DvrManager;
use helmsman::mist::{MistApi, MistHttp};
use helmsman::reconcile::ConfigReconciler;
use helmsman::storage::{FsProbe, StorageEngine};
use helmsman::webhooks::{self, WebhookState};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "helmsman starting");

    let cfg = match helmsman::config::load_config() {
        Ok(cfg) => {
            info!(
                node_id = %cfg.node.id,
                orchestrator = %cfg.orchestrator.address,
                "config loaded"
            );
            cfg
        }
        Err(e) => {
            eprintln!("FATAL: failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = std::fs::create_dir_all(&cfg.storage.root) {
        eprintln!("FATAL: cannot create storage root '{}': {}", cfg.storage.root, e);
        std::process::exit(1);
    }

    // Control stream to the orchestrator; Register goes out first on every
    // (re)connect.
    let register = build_register(&cfg);
    let (control, mut inbound) = ControlStream::start(
        ControlStreamConfig::new(cfg.orchestrator.address.clone()),
        register,
    );

    let mist = Arc::new(MistHttp::new(
        cfg.mist.url.clone(),
        cfg.mist.api_password.clone(),
    ));
    let engine = Arc::new(StorageEngine::new(
        &cfg.storage.root,
        Arc::new(control.clone()),
        FsProbe,
    ));
    let dvr = Arc::new(DvrManager::new(
        &cfg.storage.root,
        Arc::clone(&mist),
        Arc::new(control.clone()),
        Arc::new(FsProbe),
    ));
    let reconciler = Arc::new(ConfigReconciler::new(
        Arc::clone(&mist),
        cfg.edge.public_url.clone(),
        format!("http://{}/webhooks/mist", cfg.webhook.bind),
        cfg.orchestrator.address.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(Arc::clone(&engine).run_pressure_loop(shutdown_rx));

    // Webhook + health surface.
    let ready = Arc::new(AtomicBool::new(false));
    let dispatcher = TriggerDispatcher::new(control.clone(), cfg.orchestrator.blocking_grace_ms);
    let segment_dvr = Arc::clone(&dvr);
    let state = WebhookState {
        dispatcher,
        control: control.clone(),
        segment_hook: Arc::new(move |segment_path: String| {
            if let Some(dvr_hash) = dvr_hash_from_segment_path(Path::new(&segment_path)) {
                let dvr = Arc::clone(&segment_dvr);
                tokio::spawn(async move { dvr.notify_segment(&dvr_hash).await });
            }
        }),
        ready: Arc::clone(&ready),
    };
    let listener = match tokio::net::TcpListener::bind(&cfg.webhook.bind).await {
        Ok(l) => l,
        Err(e) => {
            eprintln!("FATAL: cannot bind webhook listener on {}: {}", cfg.webhook.bind, e);
            std::process::exit(1);
        }
    };
    info!(bind = %cfg.webhook.bind, "webhook surface listening");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, webhooks::router(state)).await {
            error!(error = %e, "webhook server exited");
        }
    });
    ready.store(true, Ordering::Relaxed);

    // Inbound control messages route to their owning component.
    let dispatch_control = control.clone();
    let dispatch = tokio::spawn(async move {
        while let Some(payload) = inbound.recv().await {
            match payload {
                ControlPayload::ConfigSeed(seed) => {
                    dispatch_control.adopt_node_id(&seed.node_id);
                    if let Err(e) = reconciler.apply(&seed).await {
                        warn!(error = %e, "config seed apply failed");
                    }
                }
                ControlPayload::DefrostRequest(request) => {
                    let engine = Arc::clone(&engine);
                    tokio::spawn(async move { engine.handle_defrost(request).await });
                }
                ControlPayload::DvrStartRequest(request) => {
                    let dvr = Arc::clone(&dvr);
                    tokio::spawn(async move {
                        if let Err(e) = dvr.start_recording(request).await {
                            warn!(error = %e, "DVR start failed");
                        }
                    });
                }
                ControlPayload::DvrStopRequest(request) => {
                    if let Err(e) = dvr.stop_recording(&request.dvr_hash, &request.reason).await {
                        warn!(dvr_hash = %request.dvr_hash, error = %e, "DVR stop failed");
                    }
                }
                ControlPayload::StopSessionsRequest(request) => {
                    info!(
                        tenant_id = %request.tenant_id,
                        reason = %request.reason,
                        streams = request.stream_names.len(),
                        "stopping sessions"
                    );
                    if let Err(e) = mist.stop_sessions(&request.stream_names).await {
                        warn!(error = %e, "stop sessions failed");
                    }
                }
                other => {
                    tracing::debug!(payload = ?other, "unhandled control payload");
                }
            }
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
        _ = dispatch => {
            error!("control dispatcher exited");
        }
    }
    let _ = shutdown_tx.send(true);
}

fn build_register(cfg: &HelmsmanConfig) -> Register {
    let fingerprint = cfg.node.fingerprint.clone().unwrap_or_else(|| {
        let digest = Sha256::digest(format!("node:{}", cfg.node.id).as_bytes());
        hex::encode(&digest[..6])
    });
    let system = sysinfo::System::new_with_specifics(
        sysinfo::RefreshKind::nothing().with_memory(sysinfo::MemoryRefreshKind::everything()),
    );
    let disk_gb = fs2::total_space(Path::new(&cfg.storage.root))
        .map(|b| b / 1_000_000_000)
        .unwrap_or(0);

    Register {
        node_id: cfg.node.id.clone(),
        roles: cfg.node.roles.clone(),
        cap_ingest: cfg.node.cap_ingest,
        cap_edge: cfg.node.cap_edge,
        cap_storage: cfg.node.cap_storage,
        cap_processing: cfg.node.cap_processing,
        storage_local: true,
        storage_bucket: cfg.storage.bucket.clone(),
        storage_prefix: cfg.storage.prefix.clone(),
        enrollment_token: cfg.orchestrator.enrollment_token.clone(),
        fingerprint,
        cpu_cores: std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1),
        memory_gb: system.total_memory() / 1_000_000_000,
        disk_gb,
        requested_mode: cfg.orchestrator.requested_mode.clone(),
    }
}

/// `{root}/dvr/{stream_id}/{dvr_hash}/segments/{file}.ts` → `dvr_hash`.
fn dvr_hash_from_segment_path(segment_path: &Path) -> Option<String> {
    let segments_dir = segment_path.parent()?;
    if segments_dir.file_name()? != "segments" {
        return None;
    }
    Some(segments_dir.parent()?.file_name()?.to_string_lossy().into_owned())
}
