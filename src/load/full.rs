//! Full loader and append-inserts loader
//!
//! A full load materialises every source row with `__is_full_load = 1` and,
//! when a delta column is known, rewrites the PK manifest from the rows it
//! just wrote. Append-inserts only chases the watermark forward and keeps
//! no manifest at all.

use crate::error::{MirrorError, Result};
use crate::layout::DELTA_LOAD_DIR;
use crate::metadata::VALID_FROM_COL;
use crate::reader::{DataSourceReader, WriteMode};
use crate::sql::{Dialect, Expr, Select, TableFactor};
use crate::value::Value;

use super::delta;
use super::{cols_select, SelectFlags, WriteInfos};

pub(crate) async fn do_full_load(
    reader: &dyn DataSourceReader,
    infos: &WriteInfos,
    mode: WriteMode,
) -> Result<()> {
    let config = &infos.config;
    let logger = &infos.logger;
    let delta = infos.layout.delta();
    logger.info(format!("{}: Start full load", infos.table));

    let sql = Select::new(cols_select(
        &infos.cols,
        SelectFlags { is_deleted: Some(false), is_full: Some(true), valid_from: true },
        None,
        false,
        Some(&config.data_type_map),
        config,
    ))
    .from_table(infos.table.factor(None))
    .to_sql(config.dialect);

    let temp = infos.table.temp_view_name();
    // null-vs-present, deliberately: an epoch-zero watermark still counts
    let max_valid_from: Option<Value> = if reader.delta_table_exists(&*delta, true).await? {
        reader.local_register_delta_view(&*delta, &temp, None).await?;
        let query = Select::new(vec![Expr::func("MAX", vec![Expr::col(VALID_FROM_COL)])
            .alias("max_valid_from")])
        .from_table(TableFactor::named(&[&temp], None));
        let rows = reader.local_query(&query.to_sql(Dialect::Lake)).await?;
        rows.first()
            .and_then(|r| r.get("max_valid_from"))
            .filter(|v| !v.is_null())
            .cloned()
    } else {
        None
    };

    logger.info_sql("executing sql", "full", &sql);
    reader.source_write_to_delta(&sql, &*delta, mode).await?;

    let Some(delta_col) = &infos.delta_col else {
        logger.info(format!("{}: Full load done", infos.table));
        return Ok(());
    };
    logger.info(format!(
        "{}: Full load done, write manifest for next delta load",
        infos.table
    ));

    reader.local_register_delta_view(&*delta, &temp, None).await?;
    infos.layout.root().sub(DELTA_LOAD_DIR).mkdir()?;

    let mut projections: Vec<Expr> = infos
        .pk_cols
        .iter()
        .map(|c| Expr::col(config.target_name(c)))
        .collect();
    projections.push(Expr::col(config.target_name(delta_col)));
    let mut query = Select::new(projections).from_table(TableFactor::named(&[&temp], None));
    if let Some(max) = max_valid_from {
        // restrict the manifest to the rows this run appended
        query = query.filter(Expr::col(VALID_FROM_COL).gt(Expr::Lit(max)));
    }
    reader
        .local_write_to_delta(
            &query.to_sql(Dialect::Lake),
            &*infos.layout.latest_pk(),
            WriteMode::Overwrite,
        )
        .await
}

pub(crate) async fn do_append_inserts(
    reader: &dyn DataSourceReader,
    infos: &WriteInfos,
) -> Result<()> {
    let delta_col = infos.delta_col.as_ref().ok_or_else(|| {
        MirrorError::Config("append_inserts load requires a delta column".into())
    })?;
    infos.logger.info(format!(
        "{}: Start append-inserts load with delta column {}",
        infos.table, delta_col.column_name
    ));

    let delta = infos.layout.delta();
    let watermark = if reader.delta_table_exists(&*delta, true).await? {
        delta::get_latest_delta_value(reader, infos, delta_col).await?
    } else {
        None
    };
    let criteria = match watermark {
        Some(watermark) => vec![delta::watermark_criterion(delta_col, watermark, &infos.config)],
        None => Vec::new(),
    };
    let sql = delta::update_sql(&infos.cols, criteria, infos);
    delta::load_updates_to_delta(reader, infos, &sql).await?;

    infos
        .logger
        .info(format!("{}: Append-inserts load done", infos.table));
    Ok(())
}
