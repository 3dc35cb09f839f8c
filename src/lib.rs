//! Remote Table Engine Client Library
//!
//! Connects to a remote table engine, provisions transient workers or attaches
//! to persistent queries, and pulls table snapshots into local memory.

pub mod config;
pub mod engine;
pub mod logging;
pub mod pipeline;
