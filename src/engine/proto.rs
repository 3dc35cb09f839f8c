//! Engine gRPC message types
//!
//! Declared with prost derives rather than generated by a build script, so the
//! crate builds without `protoc`. Field tags are part of the wire contract.

/// Fully qualified service names
pub const AUTH_SERVICE: &str = "engine.v1.AuthService";
pub const CONTROLLER_SERVICE: &str = "engine.v1.ControllerService";
pub const WORKER_SERVICE: &str = "engine.v1.WorkerService";

// ---------------------------------------------------------------------------
// AuthService
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChallengeRequest {
    #[prost(string, tag = "1")]
    pub client_name: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChallengeResponse {
    #[prost(bytes = "vec", tag = "1")]
    pub nonce: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PasswordProof {
    #[prost(string, tag = "1")]
    pub username: String,
    #[prost(string, tag = "2")]
    pub password: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SignatureProof {
    #[prost(string, tag = "1")]
    pub username: String,
    #[prost(string, tag = "2")]
    pub operate_as: String,
    #[prost(bytes = "vec", tag = "3")]
    pub public_key: Vec<u8>,
    #[prost(bytes = "vec", tag = "4")]
    pub nonce: Vec<u8>,
    #[prost(bytes = "vec", tag = "5")]
    pub signature: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AuthRequest {
    #[prost(string, tag = "1")]
    pub client_name: String,
    #[prost(oneof = "auth_request::Proof", tags = "2, 3")]
    pub proof: Option<auth_request::Proof>,
}

pub mod auth_request {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Proof {
        #[prost(message, tag = "2")]
        Password(super::PasswordProof),
        #[prost(message, tag = "3")]
        Signature(super::SignatureProof),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AuthResponse {
    #[prost(bool, tag = "1")]
    pub accepted: bool,
    #[prost(string, tag = "2")]
    pub token: String,
    #[prost(string, tag = "3")]
    pub reason: String,
}

// ---------------------------------------------------------------------------
// ControllerService
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StartWorkerRequest {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(uint32, tag = "2")]
    pub heap_mb: u32,
    #[prost(uint64, tag = "3")]
    pub operation_timeout_ms: u64,
    #[prost(string, tag = "4")]
    pub client_session_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StartWorkerResponse {
    #[prost(string, tag = "1")]
    pub worker_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WorkerRef {
    #[prost(string, tag = "1")]
    pub worker_id: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum WorkerState {
    Unspecified = 0,
    Starting = 1,
    Running = 2,
    Failed = 3,
    Stopped = 4,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WorkerStatusResponse {
    #[prost(enumeration = "WorkerState", tag = "1")]
    pub state: i32,
    /// Worker gRPC endpoint, set once the worker is running
    #[prost(string, tag = "2")]
    pub endpoint: String,
    #[prost(string, tag = "3")]
    pub message: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StopWorkerResponse {}

/// Stop whatever worker was started for a `StartWorkerRequest`, by its client session id
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CancelStartRequest {
    #[prost(string, tag = "1")]
    pub client_session_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetQueryRequest {
    #[prost(string, tag = "1")]
    pub name: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct QueryInfo {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(uint64, tag = "2")]
    pub serial: u64,
    /// Controller status string, e.g. "Running", "Failed", "Stopped"
    #[prost(string, tag = "3")]
    pub status: String,
    #[prost(string, tag = "4")]
    pub endpoint: String,
}

// ---------------------------------------------------------------------------
// WorkerService
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TableProgram {
    #[prost(oneof = "table_program::Source", tags = "1, 2, 3")]
    pub source: Option<table_program::Source>,
    #[prost(message, repeated, tag = "4")]
    pub ops: Vec<TableOp>,
}

pub mod table_program {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Source {
        #[prost(uint64, tag = "1")]
        EmptySize(u64),
        #[prost(string, tag = "2")]
        ScopeName(String),
        #[prost(string, tag = "3")]
        Ticket(String),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TableOp {
    #[prost(oneof = "table_op::Op", tags = "1, 2, 3")]
    pub op: Option<table_op::Op>,
}

pub mod table_op {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Op {
        #[prost(message, tag = "1")]
        Update(super::UpdateOp),
        #[prost(uint64, tag = "2")]
        Head(u64),
        #[prost(uint64, tag = "3")]
        Tail(u64),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpdateOp {
    #[prost(string, repeated, tag = "1")]
    pub formulas: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ExecuteRequest {
    #[prost(message, optional, tag = "1")]
    pub program: Option<TableProgram>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ExecuteResponse {
    #[prost(string, tag = "1")]
    pub ticket: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SnapshotRequest {
    #[prost(message, optional, tag = "1")]
    pub program: Option<TableProgram>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReleaseRequest {
    #[prost(string, repeated, tag = "1")]
    pub tickets: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReleaseResponse {}

// ---------------------------------------------------------------------------
// Snapshot frames
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ColumnType {
    Unspecified = 0,
    Int64 = 1,
    Float64 = 2,
    Utf8 = 3,
    Bool = 4,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ColumnDef {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(enumeration = "ColumnType", tag = "2")]
    pub column_type: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Schema {
    #[prost(message, repeated, tag = "1")]
    pub columns: Vec<ColumnDef>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Int64Values {
    #[prost(sint64, repeated, tag = "1")]
    pub values: Vec<i64>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Float64Values {
    #[prost(double, repeated, tag = "1")]
    pub values: Vec<f64>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Utf8Values {
    #[prost(string, repeated, tag = "1")]
    pub values: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BoolValues {
    #[prost(bool, repeated, tag = "1")]
    pub values: Vec<bool>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ColumnValues {
    #[prost(oneof = "column_values::Values", tags = "1, 2, 3, 4")]
    pub values: Option<column_values::Values>,
}

pub mod column_values {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Values {
        #[prost(message, tag = "1")]
        Int64(super::Int64Values),
        #[prost(message, tag = "2")]
        Float64(super::Float64Values),
        #[prost(message, tag = "3")]
        Utf8(super::Utf8Values),
        #[prost(message, tag = "4")]
        Bool(super::BoolValues),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Batch {
    #[prost(message, repeated, tag = "1")]
    pub columns: Vec<ColumnValues>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EndOfData {
    #[prost(uint64, tag = "1")]
    pub row_count: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SnapshotFrame {
    #[prost(oneof = "snapshot_frame::Frame", tags = "1, 2, 3")]
    pub frame: Option<snapshot_frame::Frame>,
}

pub mod snapshot_frame {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Frame {
        #[prost(message, tag = "1")]
        Schema(super::Schema),
        #[prost(message, tag = "2")]
        Batch(super::Batch),
        #[prost(message, tag = "3")]
        End(super::EndOfData),
    }
}

impl SnapshotFrame {
    pub fn schema(columns: Vec<ColumnDef>) -> Self {
        SnapshotFrame {
            frame: Some(snapshot_frame::Frame::Schema(Schema { columns })),
        }
    }

    pub fn batch(columns: Vec<ColumnValues>) -> Self {
        SnapshotFrame {
            frame: Some(snapshot_frame::Frame::Batch(Batch { columns })),
        }
    }

    pub fn end(row_count: u64) -> Self {
        SnapshotFrame {
            frame: Some(snapshot_frame::Frame::End(EndOfData { row_count })),
        }
    }
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        ColumnDef {
            name: name.into(),
            column_type: column_type as i32,
        }
    }
}

impl ColumnValues {
    pub fn int64(values: Vec<i64>) -> Self {
        ColumnValues {
            values: Some(column_values::Values::Int64(Int64Values { values })),
        }
    }

    pub fn float64(values: Vec<f64>) -> Self {
        ColumnValues {
            values: Some(column_values::Values::Float64(Float64Values { values })),
        }
    }

    pub fn utf8(values: Vec<String>) -> Self {
        ColumnValues {
            values: Some(column_values::Values::Utf8(Utf8Values { values })),
        }
    }

    pub fn bool(values: Vec<bool>) -> Self {
        ColumnValues {
            values: Some(column_values::Values::Bool(BoolValues { values })),
        }
    }
}
