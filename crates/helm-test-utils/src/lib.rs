// helm-test-utils: Shared test utilities for the edge-node suite.
//
// Provides a scriptable mock orchestrator (WebSocket peer) and a mock
// object store (presigned-style PUT/GET recorder) for integration testing
// of the edge sidecar.

pub mod mock_object_store;
pub mod mock_orchestrator;

pub use mock_object_store::MockObjectStore;
pub use mock_orchestrator::MockOrchestrator;
