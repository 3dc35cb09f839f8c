use std::time::Duration;
use thiserror::Error;

/// Why a transient worker could not be brought up
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProvisioningFailure {
    /// The worker did not report ready before the start timeout elapsed
    #[error("worker not ready within {0:?}")]
    Timeout(Duration),

    /// The request was refused before a worker was started (bad parameters, quota)
    #[error("request rejected: {0}")]
    Rejected(String),

    /// The credential was refused while connecting to start the worker
    #[error("authentication rejected: {0}")]
    AuthenticationRejected(String),

    /// The server ran out of resources to host the worker
    #[error("resources exhausted: {0}")]
    ResourcesExhausted(String),

    /// The worker process started and then died
    #[error("worker failed during startup: {0}")]
    StartupFailed(String),

    /// A live transient worker of this factory already uses the name
    #[error("a worker with this name is already active")]
    DuplicateName,
}

/// Errors that can occur when talking to the remote engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// Server configuration could not be resolved (bad URL, unreachable, malformed JSON)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Credential rejected, or the private key could not be read
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// Transient worker could not be provisioned
    #[error("Worker provisioning error for '{worker}': {reason}")]
    WorkerProvisioning {
        worker: String,
        reason: ProvisioningFailure,
    },

    /// Named persistent query is absent or not running
    #[error("Query not found: {0}")]
    QueryNotFound(String),

    /// Named table is absent from the remote namespace
    #[error("Table not found: {0}")]
    TableNotFound(String),

    /// Remote engine rejected a computation
    #[error("Query execution error: {0}")]
    QueryExecution(String),

    /// Snapshot transfer failed or the stream was malformed
    #[error("Snapshot error: {0}")]
    Snapshot(String),

    /// Operation attempted after the session was closed
    #[error("Session {0} is closed")]
    SessionClosed(String),

    /// Session hit a transport failure earlier and can only be closed
    #[error("Session {session} failed: {cause}")]
    SessionFailed { session: String, cause: String },

    /// A table handle was presented to a session that did not create it
    #[error("Table handle {ticket} belongs to session {owner}, not {session}")]
    InvalidHandle {
        ticket: String,
        owner: String,
        session: String,
    },

    /// A remote call exceeded its deadline
    #[error("{operation} timed out after {timeout:?}")]
    OperationTimeout {
        operation: &'static str,
        timeout: Duration,
    },

    /// Connection could not be established
    #[error("Connection error: {0}")]
    Connection(String),

    /// gRPC status not mapped to a more specific variant
    #[error("gRPC error: {0}")]
    Grpc(Box<tonic::Status>),

    /// gRPC transport error
    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),
}

impl EngineError {
    pub(crate) fn provisioning(worker: &str, reason: ProvisioningFailure) -> Self {
        EngineError::WorkerProvisioning {
            worker: worker.to_string(),
            reason,
        }
    }

    /// Transport-level failures leave the session unusable
    pub(crate) fn is_transport_failure(&self) -> bool {
        match self {
            EngineError::Transport(_) | EngineError::Connection(_) => true,
            EngineError::Grpc(status) => matches!(
                status.code(),
                tonic::Code::Unavailable | tonic::Code::Aborted | tonic::Code::DataLoss
            ),
            _ => false,
        }
    }
}

impl From<tonic::Status> for EngineError {
    fn from(status: tonic::Status) -> Self {
        EngineError::Grpc(Box::new(status))
    }
}

/// Type alias for Results using EngineError
pub type Result<T> = std::result::Result<T, EngineError>;
