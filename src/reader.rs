//! Source driver contract
//!
//! The orchestrator consumes one trait with two halves:
//! - `source_*` — executed on the ODBC source (network I/O); implemented by
//!   the embedder's driver wrapper
//! - `local_*` / `delta_*` — executed by the lake engine against Delta
//!   paths; [`crate::engine::LocalEngine`] provides a ready implementation
//!   to delegate to
//!
//! All operations are async and sequential within one load; the source is
//! read-only from this crate's perspective.

use async_trait::async_trait;

use crate::destination::Destination;
use crate::error::Result;
use crate::value::Row;

/// Save mode of a Delta write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Overwrite,
    Append,
}

impl WriteMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Overwrite => "overwrite",
            Self::Append => "append",
        }
    }
}

/// Driver contract consumed by the load pipeline
#[async_trait]
pub trait DataSourceReader: Send + Sync {
    /// Execute arbitrary read SQL on the source
    async fn source_query(&self, sql: &str) -> Result<Vec<Row>>;

    /// Stream a source result set directly into a Delta path
    async fn source_write_to_delta(
        &self,
        sql: &str,
        dest: &dyn Destination,
        mode: WriteMode,
    ) -> Result<()>;

    /// Expose a Delta path as a named local view, optionally time-travelled
    async fn local_register_delta_view(
        &self,
        dest: &dyn Destination,
        name: &str,
        version: Option<i64>,
    ) -> Result<()>;

    /// Register a local query as a named view
    async fn local_register_view(&self, sql: &str, name: &str) -> Result<()>;

    /// Execute local SQL, return rows
    async fn local_query(&self, sql: &str) -> Result<Vec<Row>>;

    /// Execute local SQL, write the result to a Delta path
    async fn local_write_to_delta(
        &self,
        sql: &str,
        dest: &dyn Destination,
        mode: WriteMode,
    ) -> Result<()>;

    /// Presence check; `extended` also requires at least one column
    async fn delta_table_exists(&self, dest: &dyn Destination, extended: bool) -> Result<bool>;

    /// Current version of a Delta path
    async fn delta_version(&self, dest: &dyn Destination) -> Result<i64>;

    /// Time-travel restore of a Delta path
    async fn delta_restore(&self, dest: &dyn Destination, version: i64) -> Result<()>;

    /// Vacuum unreferenced files of a Delta path
    async fn delta_vacuum(&self, dest: &dyn Destination) -> Result<()>;
}
