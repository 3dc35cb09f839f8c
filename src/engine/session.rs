//! Worker sessions
//!
//! A `WorkerSession` owns one authenticated connection bound to a worker,
//! either a transient worker it started or a persistent query it attached to.
//! Calls on a session are serialized through an async mutex.

use super::error::{EngineError, Result};
use super::factory::WorkerRegistry;
use super::query::{QuerySpec, RemoteTableHandle, SnapshotTarget};
use super::snapshot;
use super::table::LocalTable;
use super::transport::EngineConnection;
use futures::future::BoxFuture;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// What the session is bound to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionKind {
    /// A worker started for this session and stopped when it closes
    Transient {
        worker_name: String,
        worker_id: String,
        heap_mb: u32,
        start_timeout: Duration,
        operation_timeout: Duration,
    },
    /// A long-running query owned by someone else
    Attached { query_name: String, serial: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum State {
    Open,
    Failed(String),
    Closed,
}

struct Inner {
    connection: Box<dyn EngineConnection>,
    state: State,
    // Server-side tables created by `execute`, released on close
    tickets: Vec<String>,
}

impl Inner {
    fn ensure_usable(&self, session: &str) -> Result<()> {
        match &self.state {
            State::Open => Ok(()),
            State::Failed(cause) => Err(EngineError::SessionFailed {
                session: session.to_string(),
                cause: cause.clone(),
            }),
            State::Closed => Err(EngineError::SessionClosed(session.to_string())),
        }
    }

    fn record_failure(&mut self, session: &str, err: EngineError) -> EngineError {
        if err.is_transport_failure() {
            warn!("Session {} lost its connection: {}", session, err);
            self.state = State::Failed(err.to_string());
        }
        err
    }
}

async fn with_deadline<T>(
    timeout: Option<Duration>,
    operation: &'static str,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match timeout {
        Some(timeout) => tokio::time::timeout(timeout, fut)
            .await
            .map_err(|_| EngineError::OperationTimeout { operation, timeout })?,
        None => fut.await,
    }
}

/// A live connection to one worker
pub struct WorkerSession {
    id: String,
    kind: SessionKind,
    operation_timeout: Option<Duration>,
    inner: Arc<Mutex<Inner>>,
    registry: Option<WorkerRegistry>,
}

impl WorkerSession {
    pub(crate) fn new(
        id: String,
        kind: SessionKind,
        connection: Box<dyn EngineConnection>,
        operation_timeout: Option<Duration>,
        registry: Option<WorkerRegistry>,
    ) -> Self {
        WorkerSession {
            id,
            kind,
            operation_timeout,
            inner: Arc::new(Mutex::new(Inner {
                connection,
                state: State::Open,
                tickets: Vec::new(),
            })),
            registry,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> &SessionKind {
        &self.kind
    }

    pub async fn is_open(&self) -> bool {
        self.inner.lock().await.state == State::Open
    }

    fn check_owner(&self, handle: Option<&RemoteTableHandle>) -> Result<()> {
        match handle {
            Some(handle) if handle.session_id() != self.id => Err(EngineError::InvalidHandle {
                ticket: handle.ticket().to_string(),
                owner: handle.session_id().to_string(),
                session: self.id.clone(),
            }),
            _ => Ok(()),
        }
    }

    /// Run a computation on the worker, leaving the result there
    pub async fn execute(&self, spec: &QuerySpec) -> Result<RemoteTableHandle> {
        let mut inner = self.inner.lock().await;
        inner.ensure_usable(&self.id)?;
        self.check_owner(spec.handle())?;

        debug!("Session {}: execute {}", self.id, spec);
        let result = with_deadline(
            self.operation_timeout,
            "execute",
            inner.connection.execute(spec),
        )
        .await;

        match result {
            Ok(ticket) => {
                inner.tickets.push(ticket.clone());
                Ok(RemoteTableHandle::new(self.id.as_str(), ticket))
            }
            Err(e) => Err(inner.record_failure(&self.id, e)),
        }
    }

    /// Copy the current contents of a remote table into local memory
    pub async fn snapshot_of(&self, target: impl Into<SnapshotTarget>) -> Result<LocalTable> {
        let target = target.into();
        let mut inner = self.inner.lock().await;
        inner.ensure_usable(&self.id)?;
        self.check_owner(target.handle())?;

        debug!("Session {}: snapshot {}", self.id, target);
        let connection = &mut inner.connection;
        let transfer = async {
            let frames = connection.snapshot(&target).await?;
            snapshot::collect(frames).await
        };
        let result = with_deadline(self.operation_timeout, "snapshot", transfer).await;

        match result {
            Ok(table) => {
                info!(
                    "Session {}: snapshot of {} has {} rows",
                    self.id,
                    target,
                    table.num_rows()
                );
                Ok(table)
            }
            Err(e) => Err(match inner.record_failure(&self.id, e) {
                e @ (EngineError::Snapshot(_)
                | EngineError::TableNotFound(_)
                | EngineError::QueryExecution(_)
                | EngineError::OperationTimeout { .. }) => e,
                other => EngineError::Snapshot(other.to_string()),
            }),
        }
    }

    /// Release the connection and stop a transient worker
    ///
    /// Safe to call more than once; only the first call does any work.
    pub async fn close(&self) -> Result<()> {
        shutdown(
            &self.id,
            &self.kind,
            &self.inner,
            self.registry.as_ref(),
            self.operation_timeout,
        )
        .await
    }

    /// Run `f` against this session, then close it whatever `f` returned
    ///
    /// An error from `f` takes precedence over an error from closing.
    pub async fn scoped<T, F>(self, f: F) -> Result<T>
    where
        F: for<'s> FnOnce(&'s WorkerSession) -> BoxFuture<'s, Result<T>>,
    {
        let outcome = f(&self).await;
        let closed = self.close().await;
        match (outcome, closed) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), closed) => {
                if let Err(close_err) = closed {
                    warn!("Session {}: close after failure also failed: {}", self.id, close_err);
                }
                Err(e)
            }
        }
    }
}

async fn shutdown(
    id: &str,
    kind: &SessionKind,
    inner: &Mutex<Inner>,
    registry: Option<&WorkerRegistry>,
    timeout: Option<Duration>,
) -> Result<()> {
    let mut inner = inner.lock().await;
    let previous = std::mem::replace(&mut inner.state, State::Closed);
    if previous == State::Closed {
        return Ok(());
    }

    let tickets = std::mem::take(&mut inner.tickets);
    if previous == State::Open && !tickets.is_empty() {
        let released = with_deadline(timeout, "release", inner.connection.release(&tickets)).await;
        if let Err(e) = released {
            debug!("Session {}: releasing {} tables failed: {}", id, tickets.len(), e);
        }
    }

    let mut result = Ok(());
    if let SessionKind::Transient {
        worker_name,
        worker_id,
        ..
    } = kind
    {
        info!("Stopping worker '{}' ({})", worker_name, worker_id);
        let stopped = with_deadline(timeout, "stop worker", inner.connection.stop_worker(worker_id)).await;
        if let Err(e) = stopped {
            warn!("Failed to stop worker '{}': {}", worker_name, e);
            result = Err(e);
        }
        if let Some(registry) = registry {
            registry.release(worker_name);
        }
    }

    inner.connection.disconnect().await;
    info!("Session {} closed", id);
    result
}

impl fmt::Debug for WorkerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerSession")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl Drop for WorkerSession {
    fn drop(&mut self) {
        let closed = match self.inner.try_lock() {
            Ok(inner) => inner.state == State::Closed,
            Err(_) => false,
        };
        if closed {
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(
                "Session {} dropped without close outside a runtime; server resources may linger",
                self.id
            );
            return;
        };

        warn!("Session {} dropped without close; closing in the background", self.id);
        let id = self.id.clone();
        let kind = self.kind.clone();
        let inner = self.inner.clone();
        let registry = self.registry.clone();
        let timeout = self.operation_timeout;
        runtime.spawn(async move {
            if let Err(e) = shutdown(&id, &kind, &inner, registry.as_ref(), timeout).await {
                warn!("Background close of session {} failed: {}", id, e);
            }
        });
    }
}
