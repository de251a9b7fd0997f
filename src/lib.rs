//! # delta-mirror
//!
//! Incremental SCD2 mirroring of MS SQL Server tables into Delta Lake —
//! full and delta loads, strange-update detection, tombstones, and
//! primary-key manifests, built on [delta-rs](https://github.com/delta-io/delta-rs).
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │                 delta-mirror                  │
//! ├───────────────┬───────────────┬───────────────┤
//! │  Orchestrator │  SQL builder  │   Metadata    │
//! │  (dispatch,   │  (dialect-    │   probes      │
//! │   lock,       │   aware expr  │  (PKs, cols,  │
//! │   rollback)   │   tree)       │   identity)   │
//! ├───────────────┴───────────────┴───────────────┤
//! │               DataSourceReader                │
//! │   source side: embedder's ODBC driver         │
//! │   lake side:   LocalEngine (DataFusion)       │
//! ├───────────────────────────────────────────────┤
//! │             Delta Lake (delta-rs)             │
//! │        Parquet + JSON transaction log         │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use delta_mirror::{write_db_to_delta, LocalDestination, WriteConfig};
//! # use delta_mirror::DataSourceReader;
//! # async fn example(reader: &dyn DataSourceReader) -> delta_mirror::Result<()> {
//! let destination = Arc::new(LocalDestination::new("/data/dbo/user2"));
//! let outcome = write_db_to_delta(
//!     reader,
//!     ("dbo", "user2"),
//!     destination,
//!     WriteConfig::new(),
//! )
//! .await?;
//! println!("load finished as {outcome:?}");
//! # Ok(())
//! # }
//! ```
//!
//! ## What a run leaves behind
//!
//! - `delta/` — the SCD2 fact table; every row carries `__valid_from`,
//!   `__is_deleted` and `__is_full_load`
//! - `delta_load/latest_pk/` — the `(pk..., delta_col)` manifest used by the
//!   next run for delete and strange-update detection
//! - `meta/schema.json` — the captured source column metadata
//! - `meta/load_log.json` — the structured log of the run
//!
//! Deletes are detected by set difference against the previous manifest and
//! appended as tombstones; updates invisible to the watermark (a source
//! restore from backup) are re-fetched through chunked OPENJSON joins or a
//! secondary timestamp load. A TTL lock file serialises runs per
//! destination, and a failed run restores the manifest to its pre-run
//! version.

pub mod config;
pub mod destination;
pub mod engine;
pub mod error;
pub mod layout;
pub mod load;
pub mod lock;
pub mod logger;
pub mod metadata;
pub mod reader;
pub mod sql;
pub mod value;

// Re-exports for convenience
pub use config::{default_target_name, LoadMode, WriteConfig};
pub use destination::{Destination, LocalDestination};
pub use engine::LocalEngine;
pub use error::{MirrorError, Result};
pub use layout::MirrorLayout;
pub use load::{plan_load, prepare, run_load, write_db_to_delta, LoadOutcome, LoadPlan, WriteInfos};
pub use lock::{LoadLock, LOCK_TTL_SECS};
pub use logger::LoadLogger;
pub use metadata::{
    ColumnInfo, GeneratedKind, TableRef, IS_DELETED_COL, IS_FULL_LOAD_COL, VALID_FROM_COL,
};
pub use reader::{DataSourceReader, WriteMode};
pub use value::{Row, Value};
