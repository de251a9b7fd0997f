//! Load orchestration — metadata assembly, mode dispatch, run lifecycle
//!
//! One invocation mirrors one table. The run lifecycle is:
//! capture schema → snapshot the prior manifest version → take the lock →
//! dispatch into full / append-inserts / delta → release the lock and
//! vacuum transients. Any failure after the manifest was overwritten rolls
//! it back to the pre-run version; the lock is removed and the load log
//! flushed on every exit path.

mod delta;
mod full;
mod restore;

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::config::{LoadMode, WriteConfig};
use crate::destination::Destination;
use crate::error::{MirrorError, Result};
use crate::layout::{MirrorLayout, DELTA_1, DELTA_2, LATEST_PK, PRIMARY_KEYS_TS};
use crate::lock::LoadLock;
use crate::logger::LoadLogger;
use crate::metadata::{
    self, ColumnInfo, GeneratedKind, TableRef, IS_DELETED_COL, IS_FULL_LOAD_COL, VALID_FROM_COL,
};
use crate::reader::{DataSourceReader, WriteMode};
use crate::sql::Expr;

/// Terminal state of a successful run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    FullOverwrite,
    FullAppend,
    AppendInserts,
    DeltaSimple,
    DeltaFull,
}

/// Mode selected by the dispatcher before any write happens
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadPlan {
    FullOverwrite,
    FullAppend,
    AppendInserts,
    Delta { simple: bool },
}

/// Select the load plan from configuration and destination state
pub fn plan_load(
    delta_exists: bool,
    load_mode: LoadMode,
    has_pks: bool,
    has_delta_col: bool,
) -> Result<LoadPlan> {
    if load_mode == LoadMode::AppendInserts {
        if !has_delta_col {
            return Err(MirrorError::Config(
                "append_inserts load requires a delta column".into(),
            ));
        }
        return Ok(LoadPlan::AppendInserts);
    }
    if !delta_exists || load_mode == LoadMode::Overwrite {
        return Ok(LoadPlan::FullOverwrite);
    }
    if !has_delta_col
        || !has_pks
        || matches!(load_mode, LoadMode::ForceFull | LoadMode::Append)
    {
        return Ok(LoadPlan::FullAppend);
    }
    Ok(LoadPlan::Delta { simple: load_mode == LoadMode::SimpleDelta })
}

/// Everything one run needs: configuration plus discovered metadata
pub struct WriteInfos {
    pub config: WriteConfig,
    pub table: TableRef,
    pub layout: MirrorLayout,
    pub cols: Vec<ColumnInfo>,
    pub pk_cols: Vec<ColumnInfo>,
    pub delta_col: Option<ColumnInfo>,
    pub logger: LoadLogger,
}

impl WriteInfos {
    pub(crate) fn non_pk_cols(&self) -> Vec<ColumnInfo> {
        self.cols
            .iter()
            .filter(|c| !self.pk_cols.iter().any(|p| p.column_name == c.column_name))
            .cloned()
            .collect()
    }

    pub(crate) fn pk_with_delta(&self, delta_col: &ColumnInfo) -> Vec<ColumnInfo> {
        let mut cols = self.pk_cols.clone();
        cols.push(delta_col.clone());
        cols
    }
}

fn find_column<'a>(cols: &'a [ColumnInfo], name: &str) -> Option<&'a ColumnInfo> {
    cols.iter().find(|c| c.column_name.eq_ignore_ascii_case(name))
}

fn select_delta_col(cols: &[ColumnInfo], config: &WriteConfig) -> Result<Option<ColumnInfo>> {
    if let Some(name) = &config.delta_col {
        return match find_column(cols, name) {
            Some(c) => Ok(Some(c.clone())),
            None => Err(MirrorError::Config(format!(
                "configured delta column {name} does not exist"
            ))),
        };
    }
    if let Some(c) = cols
        .iter()
        .find(|c| matches!(c.data_type.as_str(), "rowversion" | "timestamp"))
    {
        return Ok(Some(c.clone()));
    }
    if let Some(c) = cols
        .iter()
        .find(|c| c.generated_always_type_desc == GeneratedKind::AsRowStart)
    {
        return Ok(Some(c.clone()));
    }
    Ok(None)
}

/// Probe the source and assemble the run's metadata
pub async fn prepare(
    reader: &dyn DataSourceReader,
    table: TableRef,
    destination: Arc<dyn Destination>,
    config: WriteConfig,
) -> Result<WriteInfos> {
    let cols = metadata::get_columns(reader, &table).await?;
    if cols.is_empty() {
        return Err(MirrorError::Metadata(format!("no columns found for {table}")));
    }
    let pk_names = match &config.primary_keys {
        Some(names) => names.clone(),
        None => metadata::get_primary_keys(reader, &table).await?,
    };
    let mut pk_cols = Vec::with_capacity(pk_names.len());
    for name in &pk_names {
        match find_column(&cols, name) {
            Some(c) => pk_cols.push(c.clone()),
            None => {
                return Err(MirrorError::Config(format!(
                    "primary key column {name} does not exist on {table}"
                )))
            }
        }
    }
    let mut delta_col = select_delta_col(&cols, &config)?;
    if config.load_mode == LoadMode::AppendInserts
        && delta_col.is_none()
        && pk_cols.len() == 1
        && pk_cols[0].is_identity
    {
        // identity keys are monotone, good enough for insert-only sources
        delta_col = Some(pk_cols[0].clone());
    }
    let layout = MirrorLayout::new(destination);
    let logger = LoadLogger::new(table.to_string(), Some(layout.load_log_file()));
    Ok(WriteInfos { config, table, layout, cols, pk_cols, delta_col, logger })
}

/// Mirror one table into its destination
pub async fn write_db_to_delta(
    reader: &dyn DataSourceReader,
    table: impl Into<TableRef>,
    destination: Arc<dyn Destination>,
    config: WriteConfig,
) -> Result<LoadOutcome> {
    let infos = prepare(reader, table.into(), destination, config).await?;
    run_load(reader, &infos).await
}

/// Run the load for already-assembled metadata
pub async fn run_load(reader: &dyn DataSourceReader, infos: &WriteInfos) -> Result<LoadOutcome> {
    let layout = &infos.layout;
    layout.meta().mkdir()?;
    layout
        .schema_file()
        .upload_str(&serde_json::to_string_pretty(&infos.cols)?)?;

    let latest_pk = layout.latest_pk();
    let prior_pk_version = if reader.delta_table_exists(&*latest_pk, false).await? {
        match reader.delta_version(&*latest_pk).await {
            Ok(v) => Some(v),
            Err(e) => {
                infos
                    .logger
                    .warn(format!("Could not read last manifest version: {e}"));
                None
            }
        }
    } else {
        None
    };

    let lock = match LoadLock::acquire(layout.lock_file()) {
        Ok(lock) => lock,
        Err(e) => {
            let _ = infos.logger.flush();
            return Err(e);
        }
    };

    match dispatch(reader, infos).await {
        Ok(outcome) => {
            lock.release()?;
            vacuum_transients(reader, infos).await;
            infos.logger.flush()?;
            Ok(outcome)
        }
        Err(e) => {
            rollback_latest_pk(reader, infos, prior_pk_version).await;
            infos.logger.error(format!("Error during load: {e}"));
            drop(lock);
            let _ = infos.logger.flush();
            Err(e)
        }
    }
}

async fn dispatch(reader: &dyn DataSourceReader, infos: &WriteInfos) -> Result<LoadOutcome> {
    let delta_exists = reader
        .delta_table_exists(&*infos.layout.delta(), false)
        .await?;
    let plan = plan_load(
        delta_exists,
        infos.config.load_mode,
        !infos.pk_cols.is_empty(),
        infos.delta_col.is_some(),
    )?;
    match plan {
        LoadPlan::FullOverwrite => {
            infos.layout.delta().mkdir()?;
            full::do_full_load(reader, infos, WriteMode::Overwrite).await?;
            Ok(LoadOutcome::FullOverwrite)
        }
        LoadPlan::FullAppend => {
            full::do_full_load(reader, infos, WriteMode::Append).await?;
            Ok(LoadOutcome::FullAppend)
        }
        LoadPlan::AppendInserts => {
            full::do_append_inserts(reader, infos).await?;
            Ok(LoadOutcome::AppendInserts)
        }
        LoadPlan::Delta { simple } => delta::do_delta_load(reader, infos, simple).await,
    }
}

/// Roll the manifest back to its pre-run version after a failed load
async fn rollback_latest_pk(
    reader: &dyn DataSourceReader,
    infos: &WriteInfos,
    prior_version: Option<i64>,
) {
    let Some(prior) = prior_version else { return };
    let latest_pk = infos.layout.latest_pk();
    let current = match reader.delta_version(&*latest_pk).await {
        Ok(v) => v,
        Err(_) => return,
    };
    if current > prior {
        match reader.delta_restore(&*latest_pk, prior).await {
            Ok(()) => infos
                .logger
                .warn(format!("Restored {LATEST_PK} to version {prior}")),
            Err(e) => infos
                .logger
                .error(format!("Could not restore {LATEST_PK}: {e}")),
        }
    }
}

async fn vacuum_transients(reader: &dyn DataSourceReader, infos: &WriteInfos) {
    for name in [LATEST_PK, DELTA_1, DELTA_2, PRIMARY_KEYS_TS] {
        let path = infos.layout.delta_load(name);
        if let Ok(true) = reader.delta_table_exists(&*path, false).await {
            if let Err(e) = reader.delta_vacuum(&*path).await {
                debug!(path = %path.uri(), error = %e, "Vacuum failed");
            }
        }
    }
}

/// Augmentation flags for a projection
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct SelectFlags {
    pub is_deleted: Option<bool>,
    pub is_full: Option<bool>,
    pub valid_from: bool,
}

/// Wrap a column in a CAST iff the type map covers its source type
pub(crate) fn cast_column(
    name: &str,
    data_type: &str,
    table_alias: Option<&str>,
    type_map: Option<&HashMap<String, String>>,
) -> Expr {
    let col = match table_alias {
        Some(t) => Expr::tcol(t, name),
        None => Expr::col(name),
    };
    match type_map.and_then(|m| m.get(data_type)) {
        Some(ty) => col.cast(ty.clone()),
        None => col,
    }
}

/// `CAST(GETUTCDATE() AS datetime2(6)) AS "__valid_from"`
pub(crate) fn valid_from_expr() -> Expr {
    Expr::func("GETUTCDATE", vec![])
        .cast("datetime2(6)")
        .alias(VALID_FROM_COL)
}

/// Projection of the mirrored columns plus the requested augmentations.
/// `from_lake` reads already-normalised names (a registered view) instead of
/// the source table.
pub(crate) fn cols_select(
    cols: &[ColumnInfo],
    flags: SelectFlags,
    table_alias: Option<&str>,
    from_lake: bool,
    type_map: Option<&HashMap<String, String>>,
    config: &WriteConfig,
) -> Vec<Expr> {
    let mut out: Vec<Expr> = cols
        .iter()
        .map(|c| {
            let source_name = if from_lake {
                config.target_name(c)
            } else {
                c.column_name.clone()
            };
            cast_column(&source_name, &c.data_type, table_alias, type_map)
                .alias(config.target_name(c))
        })
        .collect();
    if flags.valid_from {
        out.push(valid_from_expr());
    }
    if let Some(deleted) = flags.is_deleted {
        out.push(
            Expr::value(i64::from(deleted))
                .cast("bit")
                .alias(IS_DELETED_COL),
        );
    }
    if let Some(full) = flags.is_full {
        out.push(
            Expr::value(i64::from(full))
                .cast("bit")
                .alias(IS_FULL_LOAD_COL),
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::{Dialect, Select};

    #[test]
    fn test_plan_full_overwrite_on_empty_destination() {
        let plan = plan_load(false, LoadMode::Auto, true, true).unwrap();
        assert_eq!(plan, LoadPlan::FullOverwrite);
    }

    #[test]
    fn test_plan_overwrite_mode_forces_rewrite() {
        let plan = plan_load(true, LoadMode::Overwrite, true, true).unwrap();
        assert_eq!(plan, LoadPlan::FullOverwrite);
    }

    #[test]
    fn test_plan_degrades_without_pks_or_delta_col() {
        assert_eq!(
            plan_load(true, LoadMode::Auto, false, true).unwrap(),
            LoadPlan::FullAppend
        );
        assert_eq!(
            plan_load(true, LoadMode::Auto, true, false).unwrap(),
            LoadPlan::FullAppend
        );
        assert_eq!(
            plan_load(true, LoadMode::ForceFull, true, true).unwrap(),
            LoadPlan::FullAppend
        );
        assert_eq!(
            plan_load(true, LoadMode::Append, true, true).unwrap(),
            LoadPlan::FullAppend
        );
    }

    #[test]
    fn test_plan_delta_modes() {
        assert_eq!(
            plan_load(true, LoadMode::Auto, true, true).unwrap(),
            LoadPlan::Delta { simple: false }
        );
        assert_eq!(
            plan_load(true, LoadMode::SimpleDelta, true, true).unwrap(),
            LoadPlan::Delta { simple: true }
        );
    }

    #[test]
    fn test_plan_append_inserts_requires_delta_col() {
        assert_eq!(
            plan_load(false, LoadMode::AppendInserts, true, true).unwrap(),
            LoadPlan::AppendInserts
        );
        assert!(matches!(
            plan_load(true, LoadMode::AppendInserts, true, false),
            Err(MirrorError::Config(_))
        ));
    }

    #[test]
    fn test_cols_select_full_load_shape() {
        let config = WriteConfig::new();
        let cols = vec![
            ColumnInfo::from_name_type("user - id", "bigint"),
            ColumnInfo::from_name_type("time_stamp", "rowversion"),
        ];
        let projections = cols_select(
            &cols,
            SelectFlags { is_deleted: Some(false), is_full: Some(true), valid_from: true },
            None,
            false,
            Some(&config.data_type_map),
            &config,
        );
        let sql = Select::new(projections)
            .from_table(TableRef::from(("dbo", "user2")).factor(None))
            .to_sql(Dialect::Tsql);
        assert_eq!(
            sql,
            "SELECT \"user - id\" AS \"user_-_id\", \
             CAST(\"time_stamp\" AS bigint) AS \"time_stamp\", \
             CAST(GETUTCDATE() AS datetime2(6)) AS \"__valid_from\", \
             CAST(0 AS bit) AS \"__is_deleted\", \
             CAST(1 AS bit) AS \"__is_full_load\" \
             FROM \"dbo\".\"user2\""
        );
    }

    #[test]
    fn test_select_delta_col_priorities() {
        let config = WriteConfig::new();
        let mut row_start = ColumnInfo::from_name_type("sys_start", "datetime2(7)");
        row_start.generated_always_type_desc = GeneratedKind::AsRowStart;
        let cols = vec![
            ColumnInfo::from_name_type("id", "bigint"),
            row_start.clone(),
            ColumnInfo::from_name_type("rv", "rowversion"),
        ];
        // rowversion wins over a generated row-start column
        let picked = select_delta_col(&cols, &config).unwrap().unwrap();
        assert_eq!(picked.column_name, "rv");

        let without_rv = vec![cols[0].clone(), row_start];
        let picked = select_delta_col(&without_rv, &config).unwrap().unwrap();
        assert_eq!(picked.column_name, "sys_start");

        let none = select_delta_col(&[cols[0].clone()], &config).unwrap();
        assert!(none.is_none());

        let explicit = WriteConfig::new().with_delta_col("id");
        let picked = select_delta_col(&cols, &explicit).unwrap().unwrap();
        assert_eq!(picked.column_name, "id");

        let bad = WriteConfig::new().with_delta_col("nope");
        assert!(select_delta_col(&cols, &bad).is_err());
    }
}
