//! Delta pipeline — the change-detection steps of one incremental run
//!
//! Step order: snapshot the current source PKs, load rows past the
//! watermark, reconcile the PK snapshot against the previous manifest to
//! catch strange updates (rows whose delta value moved backwards, e.g.
//! after a restore from backup), rewrite the manifest, then derive deletes
//! by set difference and append tombstones.

use crate::config::WriteConfig;
use crate::error::{MirrorError, Result};
use crate::layout::{DELTA_1, DELTA_2, PRIMARY_KEYS_TS};
use crate::metadata::{ColumnInfo, IS_DELETED_COL, IS_FULL_LOAD_COL, VALID_FROM_COL};
use crate::reader::{DataSourceReader, WriteMode};
use crate::sql::{
    count_limit_one, count_star, Dialect, Expr, Join, JoinKind, OpenJsonCol, Select, SetQuery,
    TableFactor, WithQuery,
};
use crate::value::{Row, Value};

use super::full;
use super::restore;
use super::{cast_column, cols_select, LoadOutcome, SelectFlags, WriteInfos};

/// Above this many strange updates the chunked join is abandoned for a
/// secondary timestamp load
const STRANGE_UPDATE_LIMIT: i64 = 1000;
/// Upper bound for a single rendered source statement
const MAX_STATEMENT_CHARS: usize = 7000;
const COLLATION: &str = "Latin1_General_100_BIN";

const LAST_PK_VERSION_VIEW: &str = "last_pk_version";
const ADDITIONAL_UPDATES: &str = "additional_updates";
const REAL_ADDITIONAL_UPDATES: &str = "real_additional_updates";
const DELETES_WITH_SCHEMA: &str = "deletes_with_schema";

pub(crate) async fn do_delta_load(
    reader: &dyn DataSourceReader,
    infos: &WriteInfos,
    simple: bool,
) -> Result<LoadOutcome> {
    let logger = &infos.logger;
    let delta_col = infos
        .delta_col
        .clone()
        .ok_or_else(|| MirrorError::Config("delta load requires a delta column".into()))?;
    let pk_names: Vec<&str> = infos.pk_cols.iter().map(|c| c.column_name.as_str()).collect();
    logger.info(format!(
        "{}: Start {}delta load with delta column {} and pks: {}",
        infos.table,
        if simple { "simple " } else { "" },
        delta_col.column_name,
        pk_names.join(", ")
    ));

    let latest_pk = infos.layout.latest_pk();
    if !simple && !reader.delta_table_exists(&*latest_pk, false).await? {
        logger.warn(format!(
            "{}: Primary key manifest missing, trying to rebuild",
            infos.table
        ));
        let rebuilt = match restore::restore_last_pk(reader, infos, &delta_col).await {
            Ok(ok) => ok,
            Err(e) => {
                logger.warn(format!("{}: Could not rebuild manifest: {e}", infos.table));
                false
            }
        };
        if !rebuilt {
            logger.warn(format!(
                "{}: No primary key manifest, doing a full load",
                infos.table
            ));
            full::do_full_load(reader, infos, WriteMode::Append).await?;
            return Ok(LoadOutcome::FullAppend);
        }
    }
    let old_pk_version = if simple {
        None
    } else {
        Some(reader.delta_version(&*latest_pk).await?)
    };

    let Some(watermark) = get_latest_delta_value(reader, infos, &delta_col).await? else {
        logger.warn(format!("{}: No delta watermark, doing a full load", infos.table));
        full::do_full_load(reader, infos, WriteMode::Append).await?;
        return Ok(LoadOutcome::FullAppend);
    };
    logger.info(format!(
        "{}: Delta step 1, snapshot primary keys. MAX({}) = {:?}",
        infos.table, delta_col.column_name, watermark
    ));
    if !simple {
        retrieve_primary_key_data(reader, infos, &delta_col).await?;
    }

    logger.info(format!("{}: Delta step 2, load updates by timestamp", infos.table));
    let sql = update_sql(
        &infos.cols,
        vec![watermark_criterion(&delta_col, watermark, &infos.config)],
        infos,
    );
    load_updates_to_delta(reader, infos, &sql).await?;

    if simple {
        if latest_pk.exists() {
            latest_pk.remove(true)?;
        }
        logger.info(format!("{}: Simple delta load done", infos.table));
        return Ok(LoadOutcome::DeltaSimple);
    }
    let old_pk_version =
        old_pk_version.ok_or_else(|| MirrorError::Internal("missing manifest version".into()))?;

    handle_additional_updates(reader, infos, &delta_col, old_pk_version).await?;

    logger.info(format!(
        "{}: Delta step 3.5, write manifest for next delta load",
        infos.table
    ));
    write_latest_pk(reader, infos, &delta_col).await?;

    logger.info(format!("{}: Delta step 4.5, write deletes", infos.table));
    do_deletes(reader, infos, old_pk_version).await?;

    logger.info(format!("{}: Delta load done", infos.table));
    Ok(LoadOutcome::DeltaFull)
}

/// Current watermark: `MAX(delta_col)` over the mirrored table
pub(crate) async fn get_latest_delta_value(
    reader: &dyn DataSourceReader,
    infos: &WriteInfos,
    delta_col: &ColumnInfo,
) -> Result<Option<Value>> {
    let temp = infos.table.temp_view_name();
    reader
        .local_register_delta_view(&*infos.layout.delta(), &temp, None)
        .await?;
    let query = Select::new(vec![Expr::func(
        "MAX",
        vec![Expr::col(infos.config.target_name(delta_col))],
    )
    .alias("max_ts")])
    .from_table(TableFactor::named(&[&temp], None));
    let rows = reader.local_query(&query.to_sql(Dialect::Lake)).await?;
    Ok(rows
        .first()
        .and_then(|r| r.get("max_ts"))
        .filter(|v| !v.is_null())
        .cloned())
}

/// `CAST(t.delta_col AS mapped) > <watermark>`
pub(crate) fn watermark_criterion(
    delta_col: &ColumnInfo,
    watermark: Value,
    config: &WriteConfig,
) -> Expr {
    cast_column(
        &delta_col.column_name,
        &delta_col.data_type,
        Some("t"),
        Some(&config.data_type_map),
    )
    .gt(Expr::Lit(watermark))
}

/// Source SELECT of all mirrored columns with update augmentations
pub(crate) fn update_sql(cols: &[ColumnInfo], criteria: Vec<Expr>, infos: &WriteInfos) -> String {
    let config = &infos.config;
    let mut select = Select::new(cols_select(
        cols,
        SelectFlags { is_deleted: Some(false), is_full: Some(false), valid_from: true },
        Some("t"),
        false,
        Some(&config.data_type_map),
        config,
    ))
    .from_table(infos.table.factor(Some("t")));
    for criterion in criteria {
        select = select.filter(criterion);
    }
    select.to_sql(config.dialect)
}

/// Write a source result into `delta_1` and append it to the main table
/// when it has rows
pub(crate) async fn load_updates_to_delta(
    reader: &dyn DataSourceReader,
    infos: &WriteInfos,
    sql: &str,
) -> Result<()> {
    let path = infos.layout.delta_1();
    infos.logger.info_sql("executing sql", DELTA_1, sql);
    reader
        .source_write_to_delta(sql, &*path, WriteMode::Overwrite)
        .await?;
    reader.local_register_delta_view(&*path, DELTA_1, None).await?;
    let rows = reader
        .local_query(&count_limit_one(DELTA_1).to_sql(Dialect::Lake))
        .await?;
    if row_count(&rows) == 0 {
        return Ok(());
    }
    let select = Select::new(vec![Expr::star()]).from_table(TableFactor::named(&[DELTA_1], None));
    reader
        .local_write_to_delta(
            &select.to_sql(Dialect::Lake),
            &*infos.layout.delta(),
            WriteMode::Append,
        )
        .await
}

fn row_count(rows: &[Row]) -> i64 {
    rows.first()
        .and_then(|r| r.get("cnt"))
        .and_then(|v| v.as_i64())
        .unwrap_or(0)
}

/// Snapshot `(pk..., delta_col)` of the current source
async fn retrieve_primary_key_data(
    reader: &dyn DataSourceReader,
    infos: &WriteInfos,
    delta_col: &ColumnInfo,
) -> Result<()> {
    let config = &infos.config;
    let cols = infos.pk_with_delta(delta_col);
    let sql = Select::new(cols_select(
        &cols,
        SelectFlags::default(),
        None,
        false,
        Some(&config.data_type_map),
        config,
    ))
    .from_table(infos.table.factor(None))
    .to_sql(config.dialect);
    infos.logger.info_sql("executing sql", PRIMARY_KEYS_TS, &sql);
    reader
        .source_write_to_delta(&sql, &*infos.layout.primary_keys_ts(), WriteMode::Overwrite)
        .await
}

/// Bytes one PK tuple occupies in the JSON chunk, worst case
pub(crate) fn pk_tuple_char_estimate(pk_cols: &[ColumnInfo]) -> usize {
    pk_cols
        .iter()
        .map(|c| 5 + if c.is_compact_numeric() { 10 } else { 40 })
        .sum()
}

/// How many PK tuples fit one OPENJSON statement
pub(crate) fn chunk_batch_size(pk_cols: &[ColumnInfo]) -> usize {
    std::cmp::max(10, MAX_STATEMENT_CHARS / pk_tuple_char_estimate(pk_cols).max(1))
}

/// Join predicate between the source table and an OPENJSON rowset;
/// character keys get a binary collation
fn openjson_on(infos: &WriteInfos) -> Expr {
    let config = &infos.config;
    Expr::And(
        infos
            .pk_cols
            .iter()
            .map(|c| {
                let left = Expr::tcol("t", c.column_name.clone());
                let left = if c.is_character() { left.collate(COLLATION) } else { left };
                left.eq(Expr::tcol("ttt", config.target_name(c)))
            })
            .collect(),
    )
}

/// Source SELECT joined against a JSON chunk of PK tuples
pub(crate) fn openjson_join_sql(json: &str, infos: &WriteInfos) -> String {
    let config = &infos.config;
    let projections = cols_select(
        &infos.cols,
        SelectFlags { is_deleted: Some(false), is_full: Some(false), valid_from: true },
        Some("t"),
        false,
        Some(&config.data_type_map),
        config,
    );
    let json_cols: Vec<OpenJsonCol> = infos
        .pk_cols
        .iter()
        .enumerate()
        .map(|(i, c)| OpenJsonCol {
            field: format!("p{i}"),
            sql_type: c.sql_type(),
            alias: config.target_name(c),
        })
        .collect();
    Select::new(projections)
        .from_table(infos.table.factor(Some("t")))
        .join(Join {
            kind: JoinKind::Inner,
            factor: TableFactor::OpenJson {
                json: json.to_string(),
                cols: json_cols,
                alias: "ttt".to_string(),
            },
            on: openjson_on(infos),
        })
        .to_sql(config.dialect)
}

fn chunk_json(rows: &[Row]) -> Result<String> {
    let mut array = Vec::with_capacity(rows.len());
    for row in rows {
        let mut object = serde_json::Map::new();
        for (name, value) in row.columns().iter().zip(row.values()) {
            object.insert(name.clone(), value.into());
        }
        array.push(serde_json::Value::Object(object));
    }
    Ok(serde_json::to_string(&array)?)
}

/// Strange updates — updates invisible to the watermark (e.g. after a source restore
/// from backup): `(pk, delta_col)` pairs that changed without exceeding it
async fn handle_additional_updates(
    reader: &dyn DataSourceReader,
    infos: &WriteInfos,
    delta_col: &ColumnInfo,
    old_pk_version: i64,
) -> Result<()> {
    let config = &infos.config;
    let logger = &infos.logger;
    let pk_ts_cols = infos.pk_with_delta(delta_col);

    reader
        .local_register_delta_view(&*infos.layout.primary_keys_ts(), PRIMARY_KEYS_TS, None)
        .await?;
    reader
        .local_register_delta_view(
            &*infos.layout.latest_pk(),
            LAST_PK_VERSION_VIEW,
            Some(old_pk_version),
        )
        .await?;

    let additional = SetQuery::except(
        Select::new(cols_select(&pk_ts_cols, SelectFlags::default(), Some("pk"), true, None, config))
            .from_table(TableFactor::named(&[PRIMARY_KEYS_TS], Some("pk")))
            .into(),
        Select::new(cols_select(&pk_ts_cols, SelectFlags::default(), Some("lpk"), true, None, config))
            .from_table(TableFactor::named(&[LAST_PK_VERSION_VIEW], Some("lpk")))
            .into(),
    );
    reader
        .local_register_view(&additional.to_sql(Dialect::Lake), ADDITIONAL_UPDATES)
        .await?;

    let real = SetQuery::except(
        Select::new(cols_select(&infos.pk_cols, SelectFlags::default(), Some("au"), true, None, config))
            .from_table(TableFactor::named(&[ADDITIONAL_UPDATES], Some("au")))
            .into(),
        Select::new(cols_select(&infos.pk_cols, SelectFlags::default(), Some("d1"), true, None, config))
            .from_table(TableFactor::named(&[DELTA_1], Some("d1")))
            .into(),
    );
    reader
        .local_register_view(&real.to_sql(Dialect::Lake), REAL_ADDITIONAL_UPDATES)
        .await?;

    let rows = reader
        .local_query(&count_star(REAL_ADDITIONAL_UPDATES).to_sql(Dialect::Lake))
        .await?;
    let update_count = row_count(&rows);

    let delta_2 = infos.layout.delta_2();
    if update_count == 0 {
        // an empty join still establishes delta_2 with the right schema
        reader
            .source_write_to_delta(&openjson_join_sql("[]", infos), &*delta_2, WriteMode::Overwrite)
            .await?;
        return Ok(());
    }

    if update_count > STRANGE_UPDATE_LIMIT || config.no_complex_entries_load {
        reader
            .source_write_to_delta(&openjson_join_sql("[]", infos), &*delta_2, WriteMode::Overwrite)
            .await?;
        logger.warn(format!(
            "{}: Delta step 3, loading {update_count} strange updates via secondary timestamp load",
            infos.table
        ));
        let query = Select::new(vec![Expr::func(
            "MIN",
            vec![Expr::col(config.target_name(delta_col))],
        )
        .alias("min_ts")])
        .from_table(TableFactor::named(&[ADDITIONAL_UPDATES], Some("rau")));
        let rows = reader.local_query(&query.to_sql(Dialect::Lake)).await?;
        let Some(min_ts) = rows
            .first()
            .and_then(|r| r.get("min_ts"))
            .filter(|v| !v.is_null())
            .cloned()
        else {
            return Ok(());
        };
        let sql = update_sql(
            &infos.cols,
            vec![watermark_criterion(delta_col, min_ts, config)],
            infos,
        );
        logger.info_sql("executing sql", "delta_1_additional", &sql);
        load_updates_to_delta(reader, infos, &sql).await?;
        return Ok(());
    }

    let batch_size = chunk_batch_size(&infos.pk_cols);
    logger.warn(format!(
        "{}: Delta step 3, loading {update_count} strange updates via batches of size {batch_size}",
        infos.table
    ));
    let pk_projection: Vec<Expr> = infos
        .pk_cols
        .iter()
        .enumerate()
        .map(|(i, c)| Expr::col(config.target_name(c)).alias(format!("p{i}")))
        .collect();
    let pk_rows = reader
        .local_query(
            &Select::new(pk_projection)
                .from_table(TableFactor::named(&[REAL_ADDITIONAL_UPDATES], None))
                .to_sql(Dialect::Lake),
        )
        .await?;

    let mut first = true;
    for chunk in pk_rows.chunks(batch_size) {
        let sql = openjson_join_sql(&chunk_json(chunk)?, infos);
        if sql.len() > MAX_STATEMENT_CHARS {
            // halve the chunk rather than ship an oversized statement
            let split = chunk.len() / 2;
            let first_half = openjson_join_sql(&chunk_json(&chunk[..split])?, infos);
            let second_half = openjson_join_sql(&chunk_json(&chunk[split..])?, infos);
            reader
                .source_write_to_delta(
                    &first_half,
                    &*delta_2,
                    if first { WriteMode::Overwrite } else { WriteMode::Append },
                )
                .await?;
            reader
                .source_write_to_delta(&second_half, &*delta_2, WriteMode::Append)
                .await?;
        } else {
            reader
                .source_write_to_delta(
                    &sql,
                    &*delta_2,
                    if first { WriteMode::Overwrite } else { WriteMode::Append },
                )
                .await?;
        }
        first = false;
    }

    reader.local_register_delta_view(&*delta_2, DELTA_2, None).await?;
    let select = Select::new(vec![Expr::star()]).from_table(TableFactor::named(&[DELTA_2], None));
    reader
        .local_write_to_delta(
            &select.to_sql(Dialect::Lake),
            &*infos.layout.delta(),
            WriteMode::Append,
        )
        .await
}

/// Next-run manifest: delta_2 ∪ (delta_1 ∖ delta_2) ∪
/// (primary_keys_ts ∖ delta_2 ∖ delta_1), projected to `(pk..., delta_col)`
async fn write_latest_pk(
    reader: &dyn DataSourceReader,
    infos: &WriteInfos,
    delta_col: &ColumnInfo,
) -> Result<()> {
    let config = &infos.config;
    reader
        .local_register_delta_view(&*infos.layout.delta_1(), DELTA_1, None)
        .await?;
    reader
        .local_register_delta_view(&*infos.layout.delta_2(), DELTA_2, None)
        .await?;
    reader
        .local_register_delta_view(&*infos.layout.primary_keys_ts(), PRIMARY_KEYS_TS, None)
        .await?;

    let pk_ts_cols = infos.pk_with_delta(delta_col);
    let pk_join = |left: &str, right: &str| {
        Expr::And(
            infos
                .pk_cols
                .iter()
                .map(|c| {
                    Expr::tcol(left, config.target_name(c))
                        .eq(Expr::tcol(right, config.target_name(c)))
                })
                .collect(),
        )
    };

    let query = SetQuery::union_all(vec![
        Select::new(cols_select(&pk_ts_cols, SelectFlags::default(), Some("au"), true, None, config))
            .from_table(TableFactor::named(&[DELTA_2], Some("au")))
            .into(),
        Select::new(cols_select(&pk_ts_cols, SelectFlags::default(), Some("d1"), true, None, config))
            .from_table(TableFactor::named(&[DELTA_1], Some("d1")))
            .join(Join {
                kind: JoinKind::Anti,
                factor: TableFactor::named(&[DELTA_2], Some("au2")),
                on: pk_join("d1", "au2"),
            })
            .into(),
        Select::new(cols_select(&pk_ts_cols, SelectFlags::default(), Some("cpk"), true, None, config))
            .from_table(TableFactor::named(&[PRIMARY_KEYS_TS], Some("cpk")))
            .join(Join {
                kind: JoinKind::Anti,
                factor: TableFactor::named(&[DELTA_2], Some("au3")),
                on: pk_join("cpk", "au3"),
            })
            .join(Join {
                kind: JoinKind::Anti,
                factor: TableFactor::named(&[DELTA_1], Some("au4")),
                on: pk_join("cpk", "au4"),
            })
            .into(),
    ]);
    reader
        .local_write_to_delta(
            &query.to_sql(Dialect::Lake),
            &*infos.layout.latest_pk(),
            WriteMode::Overwrite,
        )
        .await
}

/// Tombstones for PKs that disappeared from the source
async fn do_deletes(
    reader: &dyn DataSourceReader,
    infos: &WriteInfos,
    old_pk_version: i64,
) -> Result<()> {
    let config = &infos.config;
    reader
        .local_register_delta_view(&*infos.layout.primary_keys_ts(), PRIMARY_KEYS_TS, None)
        .await?;
    reader
        .local_register_delta_view(
            &*infos.layout.latest_pk(),
            LAST_PK_VERSION_VIEW,
            Some(old_pk_version),
        )
        .await?;

    let delete_query = SetQuery::except(
        Select::new(cols_select(&infos.pk_cols, SelectFlags::default(), Some("lpk"), true, None, config))
            .from_table(TableFactor::named(&[LAST_PK_VERSION_VIEW], Some("lpk")))
            .into(),
        Select::new(cols_select(&infos.pk_cols, SelectFlags::default(), Some("cpk"), true, None, config))
            .from_table(TableFactor::named(&[PRIMARY_KEYS_TS], Some("cpk")))
            .into(),
    );

    let non_pk_cols = infos.non_pk_cols();
    let tombstone_ts = || {
        Expr::AtTimeZone {
            expr: Box::new(Expr::CurrentTimestamp),
            zone: "UTC".to_string(),
        }
        .alias(VALID_FROM_COL)
    };

    // schema-only branch, 1=0 keeps it empty but pins the non-PK types
    let mut schema_projections =
        cols_select(&infos.pk_cols, SelectFlags::default(), Some("d1"), true, None, config);
    schema_projections.extend(cols_select(
        &non_pk_cols,
        SelectFlags::default(),
        Some("d1"),
        true,
        None,
        config,
    ));
    schema_projections.push(tombstone_ts());
    schema_projections.push(Expr::value(true).alias(IS_DELETED_COL));
    schema_projections.push(Expr::value(false).alias(IS_FULL_LOAD_COL));
    let schema_only = Select::new(schema_projections)
        .from_table(TableFactor::named(&[DELTA_1], Some("d1")))
        .filter(Expr::value(1i64).eq(Expr::value(0i64)));

    let mut delete_projections = vec![Expr::tstar("d")];
    delete_projections.extend(
        non_pk_cols
            .iter()
            .map(|c| Expr::null().alias(config.target_name(c))),
    );
    delete_projections.push(tombstone_ts());
    delete_projections.push(Expr::value(true).alias(IS_DELETED_COL));
    delete_projections.push(Expr::value(false).alias(IS_FULL_LOAD_COL));
    let deletes_select = Select::new(delete_projections)
        .from_table(TableFactor::named(&["deletes"], Some("d")));

    let with_schema = WithQuery {
        ctes: vec![("deletes".to_string(), delete_query)],
        body: SetQuery::union_all(vec![schema_only.into(), deletes_select.into()]),
    };
    reader
        .local_register_view(&with_schema.to_sql(Dialect::Lake), DELETES_WITH_SCHEMA)
        .await?;

    let rows = reader
        .local_query(&count_limit_one(DELETES_WITH_SCHEMA).to_sql(Dialect::Lake))
        .await?;
    if row_count(&rows) == 0 {
        return Ok(());
    }
    let select =
        Select::new(vec![Expr::star()]).from_table(TableFactor::named(&[DELETES_WITH_SCHEMA], None));
    reader
        .local_write_to_delta(
            &select.to_sql(Dialect::Lake),
            &*infos.layout.delta(),
            WriteMode::Append,
        )
        .await
}
