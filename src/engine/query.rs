//! Table computation specifications and remote table handles
//!
//! A `QuerySpec` is a source table followed by a chain of operations. It is
//! built locally and has no remote identity until a session executes it.

use std::fmt;

/// Where a computation starts
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableSource {
    /// A table with `size` rows and no columns
    Empty { size: u64 },
    /// A named table in the attached query's namespace
    Scope { name: String },
    /// A table previously created by `execute` on the same session
    Handle(RemoteTableHandle),
}

/// One step applied to the table produced so far
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableOperation {
    /// Add or replace columns, one `Name = expression` formula each
    Update { formulas: Vec<String> },
    Head { rows: u64 },
    Tail { rows: u64 },
}

/// Immutable description of a remote computation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuerySpec {
    source: TableSource,
    operations: Vec<TableOperation>,
}

impl QuerySpec {
    pub fn empty(size: u64) -> Self {
        Self::from_source(TableSource::Empty { size })
    }

    /// Symbolic reference to a table of the attached persistent query
    pub fn scope(name: impl Into<String>) -> Self {
        Self::from_source(TableSource::Scope { name: name.into() })
    }

    fn from_source(source: TableSource) -> Self {
        QuerySpec {
            source,
            operations: Vec::new(),
        }
    }

    pub fn update<I, S>(mut self, formulas: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.operations.push(TableOperation::Update {
            formulas: formulas.into_iter().map(Into::into).collect(),
        });
        self
    }

    pub fn head(mut self, rows: u64) -> Self {
        self.operations.push(TableOperation::Head { rows });
        self
    }

    pub fn tail(mut self, rows: u64) -> Self {
        self.operations.push(TableOperation::Tail { rows });
        self
    }

    pub fn source(&self) -> &TableSource {
        &self.source
    }

    pub fn operations(&self) -> &[TableOperation] {
        &self.operations
    }

    /// The handle this spec reads from, if any
    pub(crate) fn handle(&self) -> Option<&RemoteTableHandle> {
        match &self.source {
            TableSource::Handle(handle) => Some(handle),
            _ => None,
        }
    }
}

impl fmt::Display for QuerySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            TableSource::Empty { size } => write!(f, "empty({})", size)?,
            TableSource::Scope { name } => write!(f, "scope({})", name)?,
            TableSource::Handle(handle) => write!(f, "ticket({})", handle.ticket())?,
        }
        for op in &self.operations {
            match op {
                TableOperation::Update { formulas } => {
                    write!(f, ".update({})", formulas.join(", "))?
                }
                TableOperation::Head { rows } => write!(f, ".head({})", rows)?,
                TableOperation::Tail { rows } => write!(f, ".tail({})", rows)?,
            }
        }
        Ok(())
    }
}

/// Reference to a table living in a remote worker
///
/// Only valid on the session that created it, and only while that session is open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTableHandle {
    session_id: String,
    ticket: String,
}

impl RemoteTableHandle {
    pub(crate) fn new(session_id: impl Into<String>, ticket: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            ticket: ticket.into(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn ticket(&self) -> &str {
        &self.ticket
    }

    /// Start a new spec reading from this table
    pub fn spec(&self) -> QuerySpec {
        QuerySpec::from_source(TableSource::Handle(self.clone()))
    }

    pub fn tail(&self, rows: u64) -> QuerySpec {
        self.spec().tail(rows)
    }

    pub fn head(&self, rows: u64) -> QuerySpec {
        self.spec().head(rows)
    }
}

/// Anything `snapshot_of` accepts
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotTarget {
    Handle(RemoteTableHandle),
    Spec(QuerySpec),
}

impl SnapshotTarget {
    pub(crate) fn handle(&self) -> Option<&RemoteTableHandle> {
        match self {
            SnapshotTarget::Handle(handle) => Some(handle),
            SnapshotTarget::Spec(spec) => spec.handle(),
        }
    }
}

impl From<RemoteTableHandle> for SnapshotTarget {
    fn from(handle: RemoteTableHandle) -> Self {
        SnapshotTarget::Handle(handle)
    }
}

impl From<&RemoteTableHandle> for SnapshotTarget {
    fn from(handle: &RemoteTableHandle) -> Self {
        SnapshotTarget::Handle(handle.clone())
    }
}

impl From<QuerySpec> for SnapshotTarget {
    fn from(spec: QuerySpec) -> Self {
        SnapshotTarget::Spec(spec)
    }
}

impl fmt::Display for SnapshotTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SnapshotTarget::Handle(handle) => write!(f, "ticket({})", handle.ticket()),
            SnapshotTarget::Spec(spec) => spec.fmt(f),
        }
    }
}
