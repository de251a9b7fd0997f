//! PK manifest reconstruction
//!
//! When `latest_pk` is gone (vacuumed too hard, partially copied
//! destination) the manifest can be rebuilt from the SCD2 table itself:
//! per PK tuple the most recent row by `__valid_from` that is not a
//! tombstone carries the delta value the manifest would have recorded.

use crate::error::Result;
use crate::metadata::{ColumnInfo, IS_DELETED_COL, VALID_FROM_COL};
use crate::reader::{DataSourceReader, WriteMode};
use crate::sql::{Dialect, Expr, Select, TableFactor};

use super::WriteInfos;

pub(crate) async fn restore_last_pk(
    reader: &dyn DataSourceReader,
    infos: &WriteInfos,
    delta_col: &ColumnInfo,
) -> Result<bool> {
    let config = &infos.config;
    if infos.pk_cols.is_empty() {
        return Ok(false);
    }
    let delta = infos.layout.delta();
    if !reader.delta_table_exists(&*delta, true).await? {
        return Ok(false);
    }
    let temp = infos.table.temp_view_name();
    reader.local_register_delta_view(&*delta, &temp, None).await?;

    let pk_targets: Vec<Expr> = infos
        .pk_cols
        .iter()
        .map(|c| Expr::col(config.target_name(c)))
        .collect();
    let row_number = Expr::RowNumberOver {
        partition_by: pk_targets.clone(),
        order_by: Box::new(Expr::col(VALID_FROM_COL)),
        descending: true,
    }
    .alias("rn");
    let history = Select::new(vec![Expr::star(), row_number])
        .from_table(TableFactor::named(&[&temp], None));

    let mut projections = pk_targets;
    projections.push(Expr::col(config.target_name(delta_col)));
    let latest = Select::new(projections)
        .from_table(TableFactor::derived(history.into(), "h"))
        .filter(Expr::col("rn").eq(Expr::value(1i64)))
        .filter(Expr::col(IS_DELETED_COL).not());

    reader
        .local_write_to_delta(
            &latest.to_sql(Dialect::Lake),
            &*infos.layout.latest_pk(),
            WriteMode::Overwrite,
        )
        .await?;
    infos.logger.info(format!(
        "{}: Rebuilt primary key manifest from history",
        infos.table
    ));
    Ok(true)
}
