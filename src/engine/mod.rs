//! Remote table engine client
//!
//! Structure:
//! - `connection.rs`: `connection.json` retrieval and endpoints
//! - `credentials.rs`: credential classification and key-file signing
//! - `factory.rs`: authenticated session creation
//! - `session.rs`: worker sessions and their lifecycle
//! - `query.rs`: table specs and remote handles
//! - `snapshot.rs` / `table.rs`: snapshot transfer into local tables
//! - `transport.rs`: protocol traits, implemented over gRPC in `client.rs`
//! - `error.rs`: Error types

pub mod client;
pub mod connection;
pub mod credentials;
pub mod error;
pub mod factory;
pub mod proto;
pub mod query;
pub mod session;
pub mod snapshot;
pub mod table;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports for convenience
pub use connection::ServerConfig;
pub use credentials::Credential;
pub use error::{EngineError, ProvisioningFailure, Result};
pub use factory::{SessionFactory, SessionSettings};
pub use query::{QuerySpec, RemoteTableHandle, SnapshotTarget};
pub use session::{SessionKind, WorkerSession};
pub use table::LocalTable;
