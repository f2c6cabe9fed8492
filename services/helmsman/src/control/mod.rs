//! Control-plane client: the long-lived bidirectional stream to the
//! orchestrator, request correlation, and trigger dispatch.

pub mod pending;
pub mod rpc;
pub mod transport;
pub mod triggers;

pub use rpc::OrchestratorLink;
pub use transport::{ControlStream, ControlStreamConfig};

/// Errors surfaced by control-plane operations.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("not connected to orchestrator")]
    NotConnected,
    #[error("request timed out")]
    Timeout,
    #[error("control stream failure: {0}")]
    Internal(String),
    #[error("rejected by orchestrator: {0}")]
    Rejected(String),
}
