//! Orchestrator capability trait.
//!
//! Storage and DVR components hold the orchestrator as a capability rather
//! than touching the transport directly, so tests can substitute a fake
//! without any global state.

use super::transport::ControlStream;
use super::IngestError;
use helm_protocol::{
    CanDeleteRequest, CanDeleteResponse, ControlPayload, FreezePermissionRequest,
    FreezePermissionResponse,
};
use std::future::Future;
use std::time::Duration;
use uuid::Uuid;

const FREEZE_PERMISSION_TIMEOUT: Duration = Duration::from_secs(30);
const CAN_DELETE_TIMEOUT: Duration = Duration::from_secs(10);

/// What the storage engine and DVR manager need from the orchestrator.
pub trait OrchestratorLink: Send + Sync + 'static {
    /// The node identity to stamp on outbound requests.
    fn node_id(&self) -> String;

    fn is_connected(&self) -> bool;

    /// Fire-and-forget control message (progress, lifecycle, completions).
    fn send(
        &self,
        payload: ControlPayload,
    ) -> impl Future<Output = Result<(), IngestError>> + Send;

    /// Blocking RPC: ask permission (and presigned URLs) to upload.
    fn freeze_permission(
        &self,
        request: FreezePermissionRequest,
    ) -> impl Future<Output = Result<FreezePermissionResponse, IngestError>> + Send;

    /// Blocking RPC: may this artifact be evicted locally?
    fn can_delete(
        &self,
        asset_hash: &str,
    ) -> impl Future<Output = Result<CanDeleteResponse, IngestError>> + Send;
}

impl OrchestratorLink for ControlStream {
    fn node_id(&self) -> String {
        self.current_node_id()
    }

    fn is_connected(&self) -> bool {
        ControlStream::is_connected(self)
    }

    async fn send(&self, payload: ControlPayload) -> Result<(), IngestError> {
        ControlStream::send(self, payload).await
    }

    async fn freeze_permission(
        &self,
        request: FreezePermissionRequest,
    ) -> Result<FreezePermissionResponse, IngestError> {
        let payload = self
            .request(
                request.request_id.clone(),
                ControlPayload::FreezePermissionRequest(request),
                FREEZE_PERMISSION_TIMEOUT,
            )
            .await?;
        match payload {
            ControlPayload::FreezePermissionResponse(r) => Ok(r),
            other => Err(IngestError::Internal(format!(
                "unexpected freeze permission reply: {other:?}"
            ))),
        }
    }

    async fn can_delete(&self, asset_hash: &str) -> Result<CanDeleteResponse, IngestError> {
        let request_id = Uuid::new_v4().to_string();
        let payload = self
            .request(
                request_id.clone(),
                ControlPayload::CanDeleteRequest(CanDeleteRequest {
                    request_id,
                    asset_hash: asset_hash.to_owned(),
                    node_id: self.current_node_id(),
                }),
                CAN_DELETE_TIMEOUT,
            )
            .await?;
        match payload {
            ControlPayload::CanDeleteResponse(r) => Ok(r),
            other => Err(IngestError::Internal(format!(
                "unexpected can-delete reply: {other:?}"
            ))),
        }
    }
}

impl ControlStream {
    /// One request/response exchange on the control stream.
    ///
    /// Registers the request id, frames the request, then races the
    /// response against the current disconnect signal and the deadline. A
    /// disconnect surfaces as `Internal`, a deadline as `Timeout`; in both
    /// cases the pending entry is gone afterwards.
    async fn request(
        &self,
        request_id: String,
        payload: ControlPayload,
        timeout: Duration,
    ) -> Result<ControlPayload, IngestError> {
        let mut disconnects = self.disconnects();
        disconnects.borrow_and_update();

        let rx = self.pending().register(&request_id);
        if let Err(e) = self.send(payload).await {
            self.pending().remove(&request_id);
            return Err(e);
        }

        tokio::select! {
            response = rx => response.map_err(|_| {
                IngestError::Internal("stream disconnected while awaiting response".to_owned())
            }),
            _ = disconnects.changed() => {
                self.pending().remove(&request_id);
                Err(IngestError::Internal(
                    "stream disconnected while awaiting response".to_owned(),
                ))
            }
            _ = tokio::time::sleep(timeout) => {
                self.pending().remove(&request_id);
                Err(IngestError::Timeout)
            }
        }
    }
}
