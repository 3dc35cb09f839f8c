//! Session factory
//!
//! Every session gets its own connection and a full authentication
//! handshake. The factory keeps no connection of its own.

use super::client::GrpcConnector;
use super::connection::ServerConfig;
use super::credentials::{AuthProof, Credential, PrivateKeyFile};
use super::error::{EngineError, ProvisioningFailure, Result};
use super::session::{SessionKind, WorkerSession};
use super::transport::{Connector, EngineConnection, WorkerRequest, WorkerStatus};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Names of the factory's live transient workers
#[derive(Debug, Clone, Default)]
pub(crate) struct WorkerRegistry(Arc<Mutex<HashSet<String>>>);

impl WorkerRegistry {
    /// Claim a name; false if it is already taken
    fn reserve(&self, name: &str) -> bool {
        self.0
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(name.to_string())
    }

    pub(crate) fn release(&self, name: &str) {
        self.0
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(name);
    }
}

/// Connection-level knobs shared by all sessions of a factory
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Delay between worker status polls during startup
    pub poll_interval: Duration,
    pub connect_timeout: Duration,
    /// Deadline for attaching to a persistent query
    pub attach_timeout: Option<Duration>,
    /// Per-call deadline on sessions attached to persistent queries
    pub snapshot_timeout: Option<Duration>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        SessionSettings {
            poll_interval: Duration::from_millis(500),
            connect_timeout: Duration::from_secs(10),
            attach_timeout: None,
            snapshot_timeout: None,
        }
    }
}

/// Creates authenticated worker sessions against one server
pub struct SessionFactory {
    connector: Arc<dyn Connector>,
    credential: Credential,
    settings: SessionSettings,
    workers: WorkerRegistry,
}

impl SessionFactory {
    /// Factory talking gRPC to the servers named in `server`
    pub fn new(server: ServerConfig, credential: Credential, settings: SessionSettings) -> Self {
        let connector = GrpcConnector::new(server, settings.connect_timeout);
        Self::with_connector(Arc::new(connector), credential, settings)
    }

    pub fn with_connector(
        connector: Arc<dyn Connector>,
        credential: Credential,
        settings: SessionSettings,
    ) -> Self {
        SessionFactory {
            connector,
            credential,
            settings,
            workers: WorkerRegistry::default(),
        }
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    /// Start a transient worker and return a session bound to it
    ///
    /// `start_timeout` bounds the whole provisioning wait. A zero start
    /// timeout fails before any network traffic. The worker is stopped when
    /// the session closes, and also when provisioning gives up on it.
    pub async fn new_worker(
        &self,
        name: &str,
        heap_mb: u32,
        start_timeout: Duration,
        operation_timeout: Duration,
    ) -> Result<WorkerSession> {
        let reject = |reason: &str| {
            EngineError::provisioning(name, ProvisioningFailure::Rejected(reason.to_string()))
        };
        if name.trim().is_empty() {
            return Err(reject("worker name must not be empty"));
        }
        if heap_mb == 0 {
            return Err(reject("heap size must be positive"));
        }
        if operation_timeout.is_zero() {
            return Err(reject("operation timeout must be positive"));
        }
        if start_timeout.is_zero() {
            return Err(EngineError::provisioning(
                name,
                ProvisioningFailure::Timeout(start_timeout),
            ));
        }
        if !self.workers.reserve(name) {
            return Err(EngineError::provisioning(
                name,
                ProvisioningFailure::DuplicateName,
            ));
        }

        let provisioned = self
            .provision(name, heap_mb, start_timeout, operation_timeout)
            .await;
        if provisioned.is_err() {
            self.workers.release(name);
        }
        provisioned
    }

    async fn provision(
        &self,
        name: &str,
        heap_mb: u32,
        start_timeout: Duration,
        operation_timeout: Duration,
    ) -> Result<WorkerSession> {
        let deadline = Instant::now() + start_timeout;
        let timed_out = || EngineError::provisioning(name, ProvisioningFailure::Timeout(start_timeout));
        let session_id = Uuid::new_v4().to_string();

        info!(
            "Requesting worker '{}' ({} MB heap) from {}",
            name,
            heap_mb,
            self.connector.describe()
        );
        let mut connection = match timeout_at(deadline, self.open_connection()).await {
            Ok(Ok(connection)) => connection,
            Ok(Err(EngineError::Authentication(reason))) => {
                return Err(EngineError::provisioning(
                    name,
                    ProvisioningFailure::AuthenticationRejected(reason),
                ))
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(timed_out()),
        };

        let request = WorkerRequest {
            name: name.to_string(),
            heap_mb,
            operation_timeout,
            client_session_id: session_id.clone(),
        };
        let worker_id = match timeout_at(deadline, connection.start_worker(&request)).await {
            Ok(Ok(worker_id)) => worker_id,
            Ok(Err(e)) => {
                connection.disconnect().await;
                return Err(e);
            }
            Err(_) => {
                // No worker id came back, but the server may have started one
                warn!("Worker '{}' start request timed out", name);
                match tokio::time::timeout(operation_timeout, connection.cancel_start(&session_id))
                    .await
                {
                    Ok(Ok(())) => debug!("Cancelled start request {}", session_id),
                    Ok(Err(e)) => warn!("Failed to cancel start request {}: {}", session_id, e),
                    Err(_) => warn!("Timed out cancelling start request {}", session_id),
                }
                connection.disconnect().await;
                return Err(timed_out());
            }
        };

        let poll_interval = self.settings.poll_interval;
        let ready = timeout_at(deadline, async {
            let endpoint =
                wait_until_running(connection.as_mut(), name, &worker_id, poll_interval).await?;
            connection.bind_worker(&endpoint).await
        })
        .await
        .unwrap_or_else(|_| Err(timed_out()));

        if let Err(e) = ready {
            warn!("Worker '{}' did not become ready: {}", name, e);
            match tokio::time::timeout(operation_timeout, connection.stop_worker(&worker_id)).await {
                Ok(Ok(())) => debug!("Stopped abandoned worker {}", worker_id),
                Ok(Err(stop)) => warn!("Failed to stop abandoned worker {}: {}", worker_id, stop),
                Err(_) => warn!("Timed out stopping abandoned worker {}", worker_id),
            }
            connection.disconnect().await;
            return Err(e);
        }

        info!("Worker '{}' ready ({})", name, worker_id);
        Ok(WorkerSession::new(
            session_id,
            SessionKind::Transient {
                worker_name: name.to_string(),
                worker_id,
                heap_mb,
                start_timeout,
                operation_timeout,
            },
            connection,
            Some(operation_timeout),
            Some(self.workers.clone()),
        ))
    }

    /// Attach to a running persistent query by name
    pub async fn persistent_query(&self, query_name: &str) -> Result<WorkerSession> {
        let attach = self.attach(query_name);
        match self.settings.attach_timeout {
            Some(timeout) => tokio::time::timeout(timeout, attach)
                .await
                .map_err(|_| EngineError::OperationTimeout {
                    operation: "attach",
                    timeout,
                })?,
            None => attach.await,
        }
    }

    async fn attach(&self, query_name: &str) -> Result<WorkerSession> {
        info!(
            "Attaching to query '{}' on {}",
            query_name,
            self.connector.describe()
        );
        let mut connection = self.open_connection().await?;

        let found = async {
            match connection.find_query(query_name).await? {
                Some(info) if info.is_running() => {
                    connection.bind_worker(&info.endpoint).await?;
                    Ok(info)
                }
                Some(info) => Err(EngineError::QueryNotFound(format!(
                    "query '{}' is not running (status: {})",
                    query_name, info.status
                ))),
                None => Err(EngineError::QueryNotFound(format!(
                    "no query named '{}'",
                    query_name
                ))),
            }
        }
        .await;

        match found {
            Ok(info) => {
                debug!("Attached to query '{}' serial {}", info.name, info.serial);
                Ok(WorkerSession::new(
                    Uuid::new_v4().to_string(),
                    SessionKind::Attached {
                        query_name: query_name.to_string(),
                        serial: info.serial,
                    },
                    connection,
                    self.settings.snapshot_timeout,
                    None,
                ))
            }
            Err(e) => {
                connection.disconnect().await;
                Err(e)
            }
        }
    }

    /// Connect and run the authentication handshake
    async fn open_connection(&self) -> Result<Box<dyn EngineConnection>> {
        let mut connection = self.connector.connect().await?;
        if let Err(e) = authenticate(connection.as_mut(), &self.credential).await {
            connection.disconnect().await;
            return Err(e);
        }
        debug!("Authenticated with {} credential", self.credential.kind());
        Ok(connection)
    }
}

async fn authenticate(connection: &mut dyn EngineConnection, credential: &Credential) -> Result<()> {
    let proof = match credential {
        Credential::Password { username, password } => AuthProof::Password {
            username: username.clone(),
            password: password.clone(),
        },
        Credential::PrivateKey { path } => {
            let key = PrivateKeyFile::load(path).await?;
            let nonce = connection.challenge().await?;
            key.prove(&nonce)
        }
    };
    connection.authenticate(&proof).await
}

async fn wait_until_running(
    connection: &mut dyn EngineConnection,
    name: &str,
    worker_id: &str,
    poll_interval: Duration,
) -> Result<String> {
    let startup_failed =
        |reason: String| EngineError::provisioning(name, ProvisioningFailure::StartupFailed(reason));
    loop {
        match connection.worker_status(worker_id).await? {
            WorkerStatus::Running { endpoint } => return Ok(endpoint),
            WorkerStatus::Failed { reason } => return Err(startup_failed(reason)),
            WorkerStatus::Stopped => {
                return Err(startup_failed("worker stopped before becoming ready".into()))
            }
            WorkerStatus::Starting => {
                debug!("Worker {} still starting", worker_id);
                tokio::time::sleep(poll_interval).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::credentials::tests::generate_key_file;
    use crate::engine::query::QuerySpec;
    use crate::engine::testing::{market_table, FakeEngine};
    use std::io::Write;

    const START: Duration = Duration::from_secs(600);
    const OP: Duration = Duration::from_secs(10);

    fn engine() -> FakeEngine {
        FakeEngine::new()
            .with_password("iris", "iris")
            .with_query("Prices", true)
            .with_table("Prices", "quotes", market_table(250))
            .with_query("Archived", false)
    }

    fn settings() -> SessionSettings {
        SessionSettings {
            poll_interval: Duration::from_millis(1),
            ..SessionSettings::default()
        }
    }

    fn factory_for(engine: &FakeEngine, credential: &str) -> SessionFactory {
        SessionFactory::with_connector(
            Arc::new(engine.clone()),
            Credential::resolve(credential),
            settings(),
        )
    }

    fn provisioning_reason(err: EngineError) -> ProvisioningFailure {
        match err {
            EngineError::WorkerProvisioning { reason, .. } => reason,
            other => panic!("expected provisioning error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_new_worker_generates_table() {
        let engine = engine();
        let factory = factory_for(&engine, "iris:iris");

        let session = factory.new_worker("T", 2, START, OP).await.unwrap();
        assert!(matches!(session.kind(), SessionKind::Transient { worker_name, .. } if worker_name == "T"));

        let spec = QuerySpec::empty(100).update(["RowIdx=ii", "MyCol = randomDouble(0, 1000)"]);
        let handle = session.execute(&spec).await.unwrap();
        let table = session.snapshot_of(&handle).await.unwrap();
        assert_eq!(table.num_rows(), 100);
        assert_eq!(table.column_names(), vec!["RowIdx", "MyCol"]);

        session.close().await.unwrap();
        assert_eq!(engine.live_workers(), 0);
    }

    #[tokio::test]
    async fn test_zero_start_timeout_fails_without_network() {
        let engine = engine();
        let factory = factory_for(&engine, "iris:iris");

        let err = factory
            .new_worker("T", 2, Duration::ZERO, OP)
            .await
            .unwrap_err();
        assert_eq!(
            provisioning_reason(err),
            ProvisioningFailure::Timeout(Duration::ZERO)
        );
        assert_eq!(engine.connections(), 0);
    }

    #[tokio::test]
    async fn test_invalid_parameters_are_rejected() {
        let engine = engine();
        let factory = factory_for(&engine, "iris:iris");

        for (name, heap) in [("", 2), ("T", 0)] {
            let err = factory.new_worker(name, heap, START, OP).await.unwrap_err();
            assert!(matches!(provisioning_reason(err), ProvisioningFailure::Rejected(_)));
        }
        assert_eq!(engine.connections(), 0);

        engine.configure(|k| k.max_heap_mb = 1);
        let err = factory.new_worker("T", 2, START, OP).await.unwrap_err();
        assert!(matches!(provisioning_reason(err), ProvisioningFailure::Rejected(_)));
    }

    #[tokio::test]
    async fn test_wrong_password_fails_provisioning_and_attach() {
        let engine = engine();
        let factory = factory_for(&engine, "iris:wrong");

        let err = factory.new_worker("T", 2, START, OP).await.unwrap_err();
        assert!(matches!(
            provisioning_reason(err),
            ProvisioningFailure::AuthenticationRejected(_)
        ));
        assert_eq!(engine.disconnects(), 1);

        // The name was not kept
        let factory = factory_for(&engine, "iris:iris");
        let session = factory.new_worker("T", 2, START, OP).await.unwrap();
        session.close().await.unwrap();

        let factory = factory_for(&engine, "iris:wrong");

        let err = factory.persistent_query("Prices").await.unwrap_err();
        assert!(matches!(err, EngineError::Authentication(_)));
    }

    #[tokio::test]
    async fn test_private_key_authentication() {
        let (text, public_key) = generate_key_file("alice");
        let mut key_file = tempfile::NamedTempFile::new().unwrap();
        key_file.write_all(text.as_bytes()).unwrap();

        let engine = engine().with_public_key("alice", public_key);
        let credential = key_file.path().to_string_lossy().to_string();
        let factory = factory_for(&engine, &credential);
        assert_eq!(factory.credential().kind(), "private-key");

        let session = factory.persistent_query("Prices").await.unwrap();
        session.close().await.unwrap();

        // A key the server does not know is rejected
        let (other, _) = generate_key_file("alice");
        let mut other_file = tempfile::NamedTempFile::new().unwrap();
        other_file.write_all(other.as_bytes()).unwrap();
        let factory = factory_for(&engine, &other_file.path().to_string_lossy());
        assert!(matches!(
            factory.persistent_query("Prices").await,
            Err(EngineError::Authentication(_))
        ));
    }

    #[tokio::test]
    async fn test_worker_never_ready_times_out_and_is_stopped() {
        let engine = engine();
        engine.configure(|k| k.ready_after_polls = None);
        let factory = factory_for(&engine, "iris:iris");

        let err = factory
            .new_worker("Slow", 2, Duration::from_millis(30), OP)
            .await
            .unwrap_err();
        assert!(matches!(provisioning_reason(err), ProvisioningFailure::Timeout(_)));
        assert_eq!(engine.stopped_workers(), vec!["Slow".to_string()]);
        assert_eq!(engine.live_workers(), 0);

        // The name is free again
        engine.configure(|k| k.ready_after_polls = Some(0));
        let session = factory.new_worker("Slow", 2, START, OP).await.unwrap();
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_stalled_start_request_is_cancelled() {
        let engine = engine();
        engine.configure(|k| k.stall_start_worker = true);
        let factory = factory_for(&engine, "iris:iris");

        let err = factory
            .new_worker("Leaky", 2, Duration::from_millis(30), OP)
            .await
            .unwrap_err();
        assert!(matches!(provisioning_reason(err), ProvisioningFailure::Timeout(_)));
        assert_eq!(engine.live_workers(), 0);
        assert_eq!(engine.stopped_workers(), vec!["Leaky".to_string()]);
        assert_eq!(engine.disconnects(), 1);
    }

    #[tokio::test]
    async fn test_startup_failure_and_exhaustion() {
        let engine = engine();
        let factory = factory_for(&engine, "iris:iris");

        engine.configure(|k| k.startup_failure = Some("out of memory".into()));
        let err = factory.new_worker("T", 2, START, OP).await.unwrap_err();
        assert_eq!(
            provisioning_reason(err),
            ProvisioningFailure::StartupFailed("out of memory".into())
        );
        assert_eq!(engine.live_workers(), 0);

        engine.configure(|k| {
            k.startup_failure = None;
            k.resources_exhausted = true;
        });
        let err = factory.new_worker("T", 2, START, OP).await.unwrap_err();
        assert!(matches!(
            provisioning_reason(err),
            ProvisioningFailure::ResourcesExhausted(_)
        ));
    }

    #[tokio::test]
    async fn test_duplicate_worker_name() {
        let engine = engine();
        let factory = factory_for(&engine, "iris:iris");

        let first = factory.new_worker("T", 2, START, OP).await.unwrap();
        let err = factory.new_worker("T", 2, START, OP).await.unwrap_err();
        assert_eq!(provisioning_reason(err), ProvisioningFailure::DuplicateName);

        first.close().await.unwrap();
        let second = factory.new_worker("T", 2, START, OP).await.unwrap();
        second.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_persistent_query_tail() {
        let engine = engine();
        let factory = factory_for(&engine, "iris:iris");

        let session = factory.persistent_query("Prices").await.unwrap();
        assert!(matches!(
            session.kind(),
            SessionKind::Attached { query_name, .. } if query_name == "Prices"
        ));

        let table = session
            .snapshot_of(QuerySpec::scope("quotes").tail(100))
            .await
            .unwrap();
        assert_eq!(table.num_rows(), 100);
        assert_eq!(table.i64_values("Seq").unwrap()[0], Some(150));
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_or_stopped_query() {
        let engine = engine();
        let factory = factory_for(&engine, "iris:iris");

        for name in ["MissingQuery", "Archived"] {
            let err = factory.persistent_query(name).await.unwrap_err();
            assert!(matches!(err, EngineError::QueryNotFound(_)));
        }
        assert_eq!(engine.disconnects(), 2);
    }

    #[tokio::test]
    async fn test_missing_table_in_query() {
        let engine = engine();
        let factory = factory_for(&engine, "iris:iris");

        let session = factory.persistent_query("Prices").await.unwrap();
        let err = session
            .snapshot_of(QuerySpec::scope("no_such_table"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::TableNotFound(_)));
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_attach_timeout() {
        let engine = engine();
        engine.configure(|k| k.stall_find_query = true);
        let factory = SessionFactory::with_connector(
            Arc::new(engine.clone()),
            Credential::resolve("iris:iris"),
            SessionSettings {
                attach_timeout: Some(Duration::from_millis(20)),
                ..settings()
            },
        );

        let err = factory.persistent_query("Prices").await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::OperationTimeout {
                operation: "attach",
                ..
            }
        ));
    }
}
