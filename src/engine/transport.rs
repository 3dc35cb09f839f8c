//! Protocol seam between sessions and the wire
//!
//! `SessionFactory` and `WorkerSession` only talk to the engine through these
//! traits. The gRPC implementation lives in `client.rs`.

use super::credentials::AuthProof;
use super::error::Result;
use super::proto::SnapshotFrame;
use super::query::{QuerySpec, SnapshotTarget};
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::time::Duration;

/// Snapshot frames as they arrive from the worker
pub type FrameStream = BoxStream<'static, Result<SnapshotFrame>>;

/// Parameters of a transient worker request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerRequest {
    pub name: String,
    pub heap_mb: u32,
    pub operation_timeout: Duration,
    pub client_session_id: String,
}

/// Controller's view of a transient worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerStatus {
    Starting,
    Running { endpoint: String },
    Failed { reason: String },
    Stopped,
}

/// A persistent query known to the controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryInfo {
    pub name: String,
    pub serial: u64,
    pub status: String,
    pub endpoint: String,
}

impl QueryInfo {
    pub fn is_running(&self) -> bool {
        self.status.eq_ignore_ascii_case("running")
    }
}

/// Opens fresh connections to the engine
#[async_trait]
pub trait Connector: Send + Sync {
    /// Endpoint description for log messages
    fn describe(&self) -> String;

    async fn connect(&self) -> Result<Box<dyn EngineConnection>>;
}

/// One connection, exclusively owned by one session attempt
///
/// Implementations report failures with the typed `EngineError` variants:
/// `Authentication` from `authenticate`, `WorkerProvisioning` from
/// `start_worker`, `QueryExecution` from `execute`, and `TableNotFound` or
/// `Snapshot` from `snapshot`.
#[async_trait]
pub trait EngineConnection: Send + Sync {
    /// Fetch a nonce to sign for private-key authentication
    async fn challenge(&mut self) -> Result<Vec<u8>>;

    /// Present credentials; later calls on this connection are authorized
    async fn authenticate(&mut self, proof: &AuthProof) -> Result<()>;

    /// Ask the controller for a new worker, returning its id
    async fn start_worker(&mut self, request: &WorkerRequest) -> Result<String>;

    async fn worker_status(&mut self, worker_id: &str) -> Result<WorkerStatus>;

    async fn stop_worker(&mut self, worker_id: &str) -> Result<()>;

    /// Stop any worker started for the request carrying `client_session_id`.
    /// Used when `start_worker` was abandoned before the worker id arrived.
    async fn cancel_start(&mut self, client_session_id: &str) -> Result<()>;

    /// Look up a persistent query by name; `None` when unknown
    async fn find_query(&mut self, name: &str) -> Result<Option<QueryInfo>>;

    /// Route subsequent table calls to the given worker
    async fn bind_worker(&mut self, endpoint: &str) -> Result<()>;

    /// Create a table, returning its ticket
    async fn execute(&mut self, spec: &QuerySpec) -> Result<String>;

    async fn snapshot(&mut self, target: &SnapshotTarget) -> Result<FrameStream>;

    /// Drop server-side tables created by this connection
    async fn release(&mut self, tickets: &[String]) -> Result<()>;

    /// Close the network connection. Never fails.
    async fn disconnect(&mut self);
}
