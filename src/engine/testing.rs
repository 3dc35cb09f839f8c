//! In-process engine used by the session and factory tests

use super::credentials::AuthProof;
use super::error::{EngineError, ProvisioningFailure, Result};
use super::proto::{ColumnDef, ColumnType, ColumnValues, SnapshotFrame};
use super::query::{QuerySpec, SnapshotTarget, TableOperation, TableSource};
use super::transport::{
    Connector, EngineConnection, FrameStream, QueryInfo, WorkerRequest, WorkerStatus,
};
use async_trait::async_trait;
use futures::{stream, StreamExt};
use ring::signature::{UnparsedPublicKey, ED25519};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum FakeColumn {
    Int64(Vec<i64>),
    Float64(Vec<f64>),
    Utf8(Vec<String>),
}

impl FakeColumn {
    fn slice(&self, start: usize, end: usize) -> FakeColumn {
        match self {
            FakeColumn::Int64(v) => FakeColumn::Int64(v[start..end].to_vec()),
            FakeColumn::Float64(v) => FakeColumn::Float64(v[start..end].to_vec()),
            FakeColumn::Utf8(v) => FakeColumn::Utf8(v[start..end].to_vec()),
        }
    }

    fn def(&self, name: &str) -> ColumnDef {
        let column_type = match self {
            FakeColumn::Int64(_) => ColumnType::Int64,
            FakeColumn::Float64(_) => ColumnType::Float64,
            FakeColumn::Utf8(_) => ColumnType::Utf8,
        };
        ColumnDef::new(name, column_type)
    }

    fn values(&self) -> ColumnValues {
        match self {
            FakeColumn::Int64(v) => ColumnValues::int64(v.clone()),
            FakeColumn::Float64(v) => ColumnValues::float64(v.clone()),
            FakeColumn::Utf8(v) => ColumnValues::utf8(v.clone()),
        }
    }
}

/// Server-side table contents
#[derive(Debug, Clone, PartialEq, Default)]
pub(crate) struct FakeTable {
    pub rows: usize,
    pub columns: Vec<(String, FakeColumn)>,
}

impl FakeTable {
    fn slice(&self, start: usize, end: usize) -> FakeTable {
        FakeTable {
            rows: end - start,
            columns: self
                .columns
                .iter()
                .map(|(name, col)| (name.clone(), col.slice(start, end)))
                .collect(),
        }
    }

    fn set_column(&mut self, name: &str, column: FakeColumn) {
        match self.columns.iter_mut().find(|(n, _)| n == name) {
            Some((_, existing)) => *existing = column,
            None => self.columns.push((name.to_string(), column)),
        }
    }

    fn frames(&self, batch_rows: usize, truncate: bool) -> Vec<SnapshotFrame> {
        let mut frames = vec![SnapshotFrame::schema(
            self.columns
                .iter()
                .map(|(name, col)| col.def(name))
                .collect(),
        )];
        if !self.columns.is_empty() {
            let mut start = 0;
            while start < self.rows {
                let end = (start + batch_rows).min(self.rows);
                let chunk = self.slice(start, end);
                frames.push(SnapshotFrame::batch(
                    chunk.columns.iter().map(|(_, col)| col.values()).collect(),
                ));
                start = end;
            }
        }
        if truncate {
            // Keep the schema and first batch only
            frames.truncate(2);
        } else {
            frames.push(SnapshotFrame::end(self.rows as u64));
        }
        frames
    }
}

/// A table with `Seq` (int64), `Sym` (utf8) and `Price` (float64) columns
pub(crate) fn market_table(rows: usize) -> FakeTable {
    let symbols = ["AAPL", "MSFT", "GOOG"];
    FakeTable {
        rows,
        columns: vec![
            ("Seq".into(), FakeColumn::Int64((0..rows as i64).collect())),
            (
                "Sym".into(),
                FakeColumn::Utf8((0..rows).map(|i| symbols[i % 3].to_string()).collect()),
            ),
            (
                "Price".into(),
                FakeColumn::Float64((0..rows).map(|i| 100.0 + i as f64 * 0.25).collect()),
            ),
        ],
    }
}

#[derive(Debug, Clone)]
struct FakeQuery {
    serial: u64,
    running: bool,
    tables: HashMap<String, FakeTable>,
}

#[derive(Debug, Clone)]
struct FakeWorker {
    name: String,
    client_session_id: String,
    polls_until_ready: Option<u32>,
    stopped: bool,
}

/// Failure and latency knobs
#[derive(Debug, Clone)]
pub(crate) struct Knobs {
    /// Status polls before a worker reports running; `None` never becomes ready
    pub ready_after_polls: Option<u32>,
    pub startup_failure: Option<String>,
    pub resources_exhausted: bool,
    pub max_heap_mb: u32,
    pub truncate_snapshots: bool,
    pub drop_connections: bool,
    pub stall_execute: bool,
    pub stall_find_query: bool,
    /// Register the worker, then never answer `start_worker`
    pub stall_start_worker: bool,
    pub batch_rows: usize,
}

impl Default for Knobs {
    fn default() -> Self {
        Knobs {
            ready_after_polls: Some(2),
            startup_failure: None,
            resources_exhausted: false,
            max_heap_mb: 64 * 1024,
            truncate_snapshots: false,
            drop_connections: false,
            stall_execute: false,
            stall_find_query: false,
            stall_start_worker: false,
            batch_rows: 32,
        }
    }
}

#[derive(Debug, Default)]
struct EngineState {
    passwords: HashMap<String, String>,
    public_keys: HashMap<String, Vec<u8>>,
    queries: HashMap<String, FakeQuery>,
    workers: HashMap<String, FakeWorker>,
    knobs: Knobs,
    next_id: u64,
    connections: usize,
    disconnects: usize,
    stopped: Vec<String>,
    released: Vec<String>,
}

/// Shared fake server; clones observe the same state
#[derive(Debug, Clone, Default)]
pub(crate) struct FakeEngine {
    state: Arc<Mutex<EngineState>>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_password(self, user: &str, password: &str) -> Self {
        self.with_state(|s| {
            s.passwords.insert(user.into(), password.into());
        })
    }

    pub fn with_public_key(self, user: &str, key: Vec<u8>) -> Self {
        self.with_state(|s| {
            s.public_keys.insert(user.into(), key);
        })
    }

    pub fn with_query(self, name: &str, running: bool) -> Self {
        self.with_state(|s| {
            let serial = s.queries.len() as u64 + 1;
            s.queries.insert(
                name.into(),
                FakeQuery {
                    serial,
                    running,
                    tables: HashMap::new(),
                },
            );
        })
    }

    pub fn with_table(self, query: &str, table: &str, contents: FakeTable) -> Self {
        self.with_state(|s| {
            s.queries
                .get_mut(query)
                .expect("query registered before its tables")
                .tables
                .insert(table.into(), contents);
        })
    }

    fn with_state(self, f: impl FnOnce(&mut EngineState)) -> Self {
        f(&mut self.state.lock().unwrap());
        self
    }

    pub fn configure(&self, f: impl FnOnce(&mut Knobs)) {
        f(&mut self.state.lock().unwrap().knobs);
    }

    /// Replace a scope table, as a live query ticking would
    pub fn replace_table(&self, query: &str, table: &str, contents: FakeTable) {
        let mut state = self.state.lock().unwrap();
        state
            .queries
            .get_mut(query)
            .unwrap()
            .tables
            .insert(table.into(), contents);
    }

    pub fn connections(&self) -> usize {
        self.state.lock().unwrap().connections
    }

    pub fn disconnects(&self) -> usize {
        self.state.lock().unwrap().disconnects
    }

    /// Names of stopped workers, in stop order
    pub fn stopped_workers(&self) -> Vec<String> {
        self.state.lock().unwrap().stopped.clone()
    }

    pub fn live_workers(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .workers
            .values()
            .filter(|w| !w.stopped)
            .count()
    }

    pub fn released_tickets(&self) -> Vec<String> {
        self.state.lock().unwrap().released.clone()
    }
}

#[async_trait]
impl Connector for FakeEngine {
    fn describe(&self) -> String {
        "fake engine".into()
    }

    async fn connect(&self) -> Result<Box<dyn EngineConnection>> {
        self.state.lock().unwrap().connections += 1;
        Ok(Box::new(FakeConnection {
            state: self.state.clone(),
            authenticated: false,
            nonce: None,
            binding: None,
            tables: HashMap::new(),
        }))
    }
}

#[derive(Debug, Clone)]
enum Binding {
    Worker,
    Query(String),
}

struct FakeConnection {
    state: Arc<Mutex<EngineState>>,
    authenticated: bool,
    nonce: Option<Vec<u8>>,
    binding: Option<Binding>,
    tables: HashMap<String, FakeTable>,
}

impl FakeConnection {
    fn require_auth(&self) -> Result<()> {
        if self.authenticated {
            Ok(())
        } else {
            Err(EngineError::Authentication("not authenticated".into()))
        }
    }

    fn knobs(&self) -> Knobs {
        self.state.lock().unwrap().knobs.clone()
    }

    fn evaluate(&self, spec: &QuerySpec) -> Result<FakeTable> {
        let mut table = match spec.source() {
            TableSource::Empty { size } => FakeTable {
                rows: *size as usize,
                columns: Vec::new(),
            },
            TableSource::Scope { name } => self.scope_table(name)?,
            TableSource::Handle(handle) => {
                self.tables.get(handle.ticket()).cloned().ok_or_else(|| {
                    EngineError::QueryExecution(format!("unknown ticket {}", handle.ticket()))
                })?
            }
        };

        for op in spec.operations() {
            match op {
                TableOperation::Update { formulas } => {
                    for formula in formulas {
                        let (name, column) = evaluate_formula(formula, table.rows)?;
                        table.set_column(&name, column);
                    }
                }
                TableOperation::Head { rows } => {
                    let end = (*rows as usize).min(table.rows);
                    table = table.slice(0, end);
                }
                TableOperation::Tail { rows } => {
                    let start = table.rows.saturating_sub(*rows as usize);
                    table = table.slice(start, table.rows);
                }
            }
        }
        Ok(table)
    }

    fn scope_table(&self, name: &str) -> Result<FakeTable> {
        let query = match &self.binding {
            Some(Binding::Query(query)) => query.clone(),
            _ => return Err(EngineError::TableNotFound(name.to_string())),
        };
        let state = self.state.lock().unwrap();
        state
            .queries
            .get(&query)
            .and_then(|q| q.tables.get(name))
            .cloned()
            .ok_or_else(|| EngineError::TableNotFound(format!("{} in query {}", name, query)))
    }
}

/// `Name = ii` gives the row index, `Name = randomDouble(lo, hi)` a
/// deterministic spread over `[lo, hi)`
fn evaluate_formula(formula: &str, rows: usize) -> Result<(String, FakeColumn)> {
    let bad = || EngineError::QueryExecution(format!("cannot parse formula '{}'", formula));
    let (name, expr) = formula.split_once('=').ok_or_else(bad)?;
    let (name, expr) = (name.trim(), expr.trim());
    if name.is_empty() {
        return Err(bad());
    }

    if expr == "ii" || expr == "i" {
        return Ok((name.into(), FakeColumn::Int64((0..rows as i64).collect())));
    }

    let args = expr
        .strip_prefix("randomDouble(")
        .and_then(|rest| rest.strip_suffix(')'))
        .ok_or_else(bad)?;
    let (lo, hi) = args.split_once(',').ok_or_else(bad)?;
    let lo: f64 = lo.trim().parse().map_err(|_| bad())?;
    let hi: f64 = hi.trim().parse().map_err(|_| bad())?;
    let values = (0..rows)
        .map(|i| lo + (hi - lo) * ((i * 7919 % 1000) as f64 / 1000.0))
        .collect();
    Ok((name.into(), FakeColumn::Float64(values)))
}

#[async_trait]
impl EngineConnection for FakeConnection {
    async fn challenge(&mut self) -> Result<Vec<u8>> {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let nonce = format!("nonce-{}", state.next_id).into_bytes();
        self.nonce = Some(nonce.clone());
        Ok(nonce)
    }

    async fn authenticate(&mut self, proof: &AuthProof) -> Result<()> {
        let state = self.state.lock().unwrap();
        let accepted = match proof {
            AuthProof::Password { username, password } => {
                state.passwords.get(username) == Some(password)
            }
            AuthProof::Signature {
                username,
                public_key,
                nonce,
                signature,
                ..
            } => {
                let registered = state.public_keys.get(username);
                registered == Some(public_key)
                    && self.nonce.as_ref() == Some(nonce)
                    && UnparsedPublicKey::new(&ED25519, public_key)
                        .verify(nonce, signature)
                        .is_ok()
            }
        };
        drop(state);
        if !accepted {
            return Err(EngineError::Authentication("credentials rejected".into()));
        }
        self.authenticated = true;
        Ok(())
    }

    async fn start_worker(&mut self, request: &WorkerRequest) -> Result<String> {
        self.require_auth()?;
        let (id, stall) = {
            let mut state = self.state.lock().unwrap();
            if state.knobs.resources_exhausted {
                return Err(EngineError::provisioning(
                    &request.name,
                    ProvisioningFailure::ResourcesExhausted("no free hosts".into()),
                ));
            }
            if request.heap_mb > state.knobs.max_heap_mb {
                return Err(EngineError::provisioning(
                    &request.name,
                    ProvisioningFailure::Rejected(format!(
                        "heap {} MB over limit",
                        request.heap_mb
                    )),
                ));
            }
            state.next_id += 1;
            let id = format!("worker-{}", state.next_id);
            let polls_until_ready = state.knobs.ready_after_polls;
            let stall = state.knobs.stall_start_worker;
            state.workers.insert(
                id.clone(),
                FakeWorker {
                    name: request.name.clone(),
                    client_session_id: request.client_session_id.clone(),
                    polls_until_ready,
                    stopped: false,
                },
            );
            drop(state);
            (id, stall)
        };
        if stall {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        Ok(id)
    }

    async fn worker_status(&mut self, worker_id: &str) -> Result<WorkerStatus> {
        self.require_auth()?;
        let mut state = self.state.lock().unwrap();
        let failure = state.knobs.startup_failure.clone();
        let worker = state
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| EngineError::Connection(format!("no worker {}", worker_id)))?;
        if worker.stopped {
            return Ok(WorkerStatus::Stopped);
        }
        if let Some(reason) = failure {
            return Ok(WorkerStatus::Failed { reason });
        }
        Ok(match worker.polls_until_ready.as_mut() {
            None => WorkerStatus::Starting,
            Some(0) => WorkerStatus::Running {
                endpoint: format!("fake://{}", worker_id),
            },
            Some(n) => {
                *n -= 1;
                WorkerStatus::Starting
            }
        })
    }

    async fn stop_worker(&mut self, worker_id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let name = match state.workers.get_mut(worker_id) {
            Some(worker) if !worker.stopped => {
                worker.stopped = true;
                worker.name.clone()
            }
            _ => return Ok(()),
        };
        state.stopped.push(name);
        Ok(())
    }

    async fn cancel_start(&mut self, client_session_id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let names: Vec<String> = state
            .workers
            .values_mut()
            .filter(|w| w.client_session_id == client_session_id && !w.stopped)
            .map(|w| {
                w.stopped = true;
                w.name.clone()
            })
            .collect();
        state.stopped.extend(names);
        Ok(())
    }

    async fn find_query(&mut self, name: &str) -> Result<Option<QueryInfo>> {
        self.require_auth()?;
        if self.knobs().stall_find_query {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        let state = self.state.lock().unwrap();
        Ok(state.queries.get(name).map(|q| QueryInfo {
            name: name.to_string(),
            serial: q.serial,
            status: if q.running { "Running" } else { "Stopped" }.into(),
            endpoint: format!("fake://query/{}", name),
        }))
    }

    async fn bind_worker(&mut self, endpoint: &str) -> Result<()> {
        self.require_auth()?;
        self.binding = Some(match endpoint.strip_prefix("fake://query/") {
            Some(query) => Binding::Query(query.to_string()),
            None => Binding::Worker,
        });
        Ok(())
    }

    async fn execute(&mut self, spec: &QuerySpec) -> Result<String> {
        self.require_auth()?;
        let knobs = self.knobs();
        if knobs.drop_connections {
            return Err(EngineError::Connection("connection reset by peer".into()));
        }
        if knobs.stall_execute {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        let table = self.evaluate(spec)?;
        let ticket = {
            let mut state = self.state.lock().unwrap();
            state.next_id += 1;
            format!("ticket-{}", state.next_id)
        };
        self.tables.insert(ticket.clone(), table);
        Ok(ticket)
    }

    async fn snapshot(&mut self, target: &SnapshotTarget) -> Result<FrameStream> {
        self.require_auth()?;
        let knobs = self.knobs();
        if knobs.drop_connections {
            return Err(EngineError::Connection("connection reset by peer".into()));
        }
        let table = match target {
            SnapshotTarget::Handle(handle) => self.evaluate(&handle.spec())?,
            SnapshotTarget::Spec(spec) => self.evaluate(spec)?,
        };
        let frames = table.frames(knobs.batch_rows.max(1), knobs.truncate_snapshots);
        Ok(stream::iter(frames.into_iter().map(Ok)).boxed())
    }

    async fn release(&mut self, tickets: &[String]) -> Result<()> {
        for ticket in tickets {
            self.tables.remove(ticket);
        }
        self.state
            .lock()
            .unwrap()
            .released
            .extend(tickets.iter().cloned());
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.state.lock().unwrap().disconnects += 1;
    }
}
