//! Snapshot transfer assembly
//!
//! A transfer is one `Schema` frame, any number of `Batch` frames, then one
//! `End` frame carrying the total row count. Anything else, including a
//! stream that stops before `End`, is a failed snapshot.

use super::error::{EngineError, Result};
use super::proto::{column_values, snapshot_frame, ColumnDef, ColumnType, ColumnValues, SnapshotFrame};
use super::table::LocalTable;
use super::transport::FrameStream;
use futures::StreamExt;
use polars::prelude::*;
use tracing::debug;

/// Per-column accumulation buffer
#[derive(Debug)]
enum ColumnBuffer {
    Int64(Vec<i64>),
    Float64(Vec<f64>),
    Utf8(Vec<String>),
    Bool(Vec<bool>),
}

impl ColumnBuffer {
    fn for_type(column_type: ColumnType) -> Option<Self> {
        match column_type {
            ColumnType::Int64 => Some(ColumnBuffer::Int64(Vec::new())),
            ColumnType::Float64 => Some(ColumnBuffer::Float64(Vec::new())),
            ColumnType::Utf8 => Some(ColumnBuffer::Utf8(Vec::new())),
            ColumnType::Bool => Some(ColumnBuffer::Bool(Vec::new())),
            ColumnType::Unspecified => None,
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            ColumnBuffer::Int64(_) => "int64",
            ColumnBuffer::Float64(_) => "float64",
            ColumnBuffer::Utf8(_) => "utf8",
            ColumnBuffer::Bool(_) => "bool",
        }
    }

    /// Append values, returning how many were added
    fn extend(&mut self, values: column_values::Values) -> std::result::Result<usize, String> {
        use column_values::Values;
        match (self, values) {
            (ColumnBuffer::Int64(buf), Values::Int64(v)) => {
                buf.extend(v.values.iter().copied());
                Ok(v.values.len())
            }
            (ColumnBuffer::Float64(buf), Values::Float64(v)) => {
                buf.extend(v.values.iter().copied());
                Ok(v.values.len())
            }
            (ColumnBuffer::Utf8(buf), Values::Utf8(v)) => {
                let n = v.values.len();
                buf.extend(v.values);
                Ok(n)
            }
            (ColumnBuffer::Bool(buf), Values::Bool(v)) => {
                buf.extend(v.values.iter().copied());
                Ok(v.values.len())
            }
            (buf, _) => Err(format!("expected {} values", buf.type_name())),
        }
    }

    fn into_column(self, name: &str) -> Column {
        let series = match self {
            ColumnBuffer::Int64(v) => Series::new(name.into(), v),
            ColumnBuffer::Float64(v) => Series::new(name.into(), v),
            ColumnBuffer::Utf8(v) => Series::new(name.into(), v),
            ColumnBuffer::Bool(v) => Series::new(name.into(), v),
        };
        series.into_column()
    }
}

/// Incremental snapshot builder, fed one frame at a time
#[derive(Debug, Default)]
pub struct SnapshotAssembler {
    columns: Option<Vec<(String, ColumnBuffer)>>,
    rows: usize,
    finished: bool,
}

impl SnapshotAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows_received(&self) -> usize {
        self.rows
    }

    pub fn push(&mut self, frame: SnapshotFrame) -> Result<()> {
        if self.finished {
            return Err(malformed("frame received after end-of-data"));
        }
        match frame.frame {
            Some(snapshot_frame::Frame::Schema(schema)) => self.on_schema(schema.columns),
            Some(snapshot_frame::Frame::Batch(batch)) => self.on_batch(batch.columns),
            Some(snapshot_frame::Frame::End(end)) => self.on_end(end.row_count),
            None => Err(malformed("empty frame")),
        }
    }

    fn on_schema(&mut self, defs: Vec<ColumnDef>) -> Result<()> {
        if self.columns.is_some() {
            return Err(malformed("duplicate schema frame"));
        }
        let mut columns = Vec::with_capacity(defs.len());
        for def in defs {
            let column_type = ColumnType::try_from(def.column_type).unwrap_or(ColumnType::Unspecified);
            let buffer = ColumnBuffer::for_type(column_type).ok_or_else(|| {
                malformed(&format!("column '{}' has unknown type {}", def.name, def.column_type))
            })?;
            columns.push((def.name, buffer));
        }
        self.columns = Some(columns);
        Ok(())
    }

    fn on_batch(&mut self, values: Vec<ColumnValues>) -> Result<()> {
        let columns = self
            .columns
            .as_mut()
            .ok_or_else(|| malformed("batch frame before schema"))?;
        if values.len() != columns.len() {
            return Err(malformed(&format!(
                "batch has {} columns, schema has {}",
                values.len(),
                columns.len()
            )));
        }

        let mut batch_rows = None;
        for ((name, buffer), column) in columns.iter_mut().zip(values) {
            let values = column
                .values
                .ok_or_else(|| malformed(&format!("column '{}' has no values", name)))?;
            let added = buffer
                .extend(values)
                .map_err(|e| malformed(&format!("column '{}': {}", name, e)))?;
            match batch_rows {
                None => batch_rows = Some(added),
                Some(n) if n != added => {
                    return Err(malformed(&format!(
                        "column '{}' has {} values, expected {}",
                        name, added, n
                    )))
                }
                Some(_) => {}
            }
        }
        self.rows += batch_rows.unwrap_or(0);
        Ok(())
    }

    fn on_end(&mut self, row_count: u64) -> Result<()> {
        if self.columns.is_none() {
            return Err(malformed("end-of-data before schema"));
        }
        // Zero-column tables carry their height only in the end marker
        let has_columns = self.columns.as_ref().is_some_and(|c| !c.is_empty());
        if has_columns && row_count != self.rows as u64 {
            return Err(malformed(&format!(
                "end-of-data reports {} rows, received {}",
                row_count, self.rows
            )));
        }
        self.rows = usize::try_from(row_count).map_err(|_| {
            malformed(&format!("end-of-data reports {} rows, too many to hold", row_count))
        })?;
        self.finished = true;
        Ok(())
    }

    /// Build the local table; fails unless end-of-data was seen
    pub fn finish(self) -> Result<LocalTable> {
        if !self.finished {
            return Err(EngineError::Snapshot(format!(
                "transfer ended without end-of-data marker after {} rows",
                self.rows
            )));
        }
        let columns = self.columns.unwrap_or_default();
        let columns: Vec<Column> = columns
            .into_iter()
            .map(|(name, buffer)| buffer.into_column(&name))
            .collect();
        let frame = DataFrame::new(columns)
            .map_err(|e| EngineError::Snapshot(format!("cannot build table: {}", e)))?;
        Ok(LocalTable::new(frame, self.rows))
    }
}

fn malformed(message: &str) -> EngineError {
    EngineError::Snapshot(format!("malformed transfer: {}", message))
}

/// Drain a frame stream into a `LocalTable`
///
/// Stream errors are returned unchanged so the caller can tell transport
/// failures from malformed data.
pub async fn collect(mut frames: FrameStream) -> Result<LocalTable> {
    let mut assembler = SnapshotAssembler::new();
    while let Some(frame) = frames.next().await {
        assembler.push(frame?)?;
    }
    debug!("Snapshot transfer complete: {} rows", assembler.rows_received());
    assembler.finish()
}
