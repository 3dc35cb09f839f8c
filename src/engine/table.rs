//! Locally materialized snapshot of a remote table

use super::error::{EngineError, Result};
use polars::prelude::*;
use std::fmt;

/// A point-in-time copy of a remote table
///
/// Owns its data: nothing ties it to the session that produced it.
#[derive(Debug, Clone)]
pub struct LocalTable {
    frame: DataFrame,
    // Tracked separately so zero-column tables keep their row count
    rows: usize,
}

impl LocalTable {
    pub(crate) fn new(frame: DataFrame, rows: usize) -> Self {
        LocalTable { frame, rows }
    }

    pub fn num_rows(&self) -> usize {
        self.rows
    }

    pub fn num_columns(&self) -> usize {
        self.frame.width()
    }

    pub fn column_names(&self) -> Vec<String> {
        self.frame
            .get_column_names()
            .iter()
            .map(|name| name.to_string())
            .collect()
    }

    pub fn f64_values(&self, column: &str) -> Result<Vec<Option<f64>>> {
        let series = self.series(column)?;
        let values = series.f64().map_err(|e| type_error(column, e))?;
        Ok(values.into_iter().collect())
    }

    pub fn i64_values(&self, column: &str) -> Result<Vec<Option<i64>>> {
        let series = self.series(column)?;
        let values = series.i64().map_err(|e| type_error(column, e))?;
        Ok(values.into_iter().collect())
    }

    pub fn str_values(&self, column: &str) -> Result<Vec<Option<String>>> {
        let series = self.series(column)?;
        let values = series.str().map_err(|e| type_error(column, e))?;
        Ok(values.into_iter().map(|v| v.map(str::to_string)).collect())
    }

    fn series(&self, column: &str) -> Result<&Series> {
        let col = self
            .frame
            .column(column)
            .map_err(|_| EngineError::TableNotFound(format!("no column '{}' in snapshot", column)))?;
        Ok(col.as_materialized_series())
    }
}

fn type_error(column: &str, e: PolarsError) -> EngineError {
    EngineError::Snapshot(format!("column '{}': {}", column, e))
}

impl fmt::Display for LocalTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.frame.width() == 0 {
            return write!(f, "<{} rows, no columns>", self.rows);
        }
        write!(f, "{}", self.frame)
    }
}
