//! LocalEngine — the lake-engine half of the driver contract
//!
//! Runs SQL over Delta paths through DataFusion and writes query results
//! back as Delta commits. Driver implementations delegate the `local_*` and
//! `delta_*` operations of [`crate::reader::DataSourceReader`] here and only
//! implement the two source-side operations themselves.

use std::sync::Arc;

use deltalake::arrow::array::{
    Array, ArrayRef, BooleanArray, Float32Array, Float64Array, Int16Array, Int32Array,
    Int64Array, LargeStringArray, RecordBatch, StringArray, TimestampMicrosecondArray,
    TimestampNanosecondArray,
};
use deltalake::arrow::datatypes::{DataType as ArrowDataType, TimeUnit};
use deltalake::arrow::util::display::array_value_to_string;
use deltalake::datafusion::catalog::TableProvider;
use deltalake::datafusion::prelude::SessionContext;
use deltalake::protocol::SaveMode;
use deltalake::{open_table, open_table_with_version, DeltaOps};
use tracing::debug;
use url::Url;

use crate::destination::Destination;
use crate::error::{MirrorError, Result};
use crate::reader::WriteMode;
use crate::value::{Row, Value};

impl From<WriteMode> for SaveMode {
    fn from(mode: WriteMode) -> Self {
        match mode {
            WriteMode::Overwrite => SaveMode::Overwrite,
            WriteMode::Append => SaveMode::Append,
        }
    }
}

/// DataFusion session with the run's registered Delta views
#[derive(Clone)]
pub struct LocalEngine {
    ctx: SessionContext,
}

impl Default for LocalEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalEngine {
    pub fn new() -> Self {
        Self { ctx: SessionContext::new() }
    }

    fn table_url(dest: &dyn Destination) -> Result<Url> {
        let uri = dest.uri();
        if let Ok(url) = Url::parse(&uri) {
            return Ok(url);
        }
        Url::from_directory_path(&uri)
            .map_err(|_| MirrorError::Config(format!("Invalid table path: {uri}")))
    }

    /// Expose a Delta path as a named view, optionally at a fixed version
    pub async fn register_delta_view(
        &self,
        dest: &dyn Destination,
        name: &str,
        version: Option<i64>,
    ) -> Result<()> {
        let url = Self::table_url(dest)?;
        let table = match version {
            Some(v) => open_table_with_version(url, v).await?,
            None => open_table(url).await?,
        };
        let provider: Arc<dyn TableProvider> = Arc::new(table);
        self.ctx.deregister_table(name)?;
        self.ctx.register_table(name, provider)?;
        debug!(view = name, ?version, "Registered delta view");
        Ok(())
    }

    /// Register a local query as a named view
    pub async fn register_view(&self, sql: &str, name: &str) -> Result<()> {
        let df = self.ctx.sql(sql).await?;
        let view = df.into_view();
        self.ctx.deregister_table(name)?;
        self.ctx.register_table(name, view)?;
        debug!(view = name, "Registered query view");
        Ok(())
    }

    /// Execute local SQL and return the rows
    pub async fn query(&self, sql: &str) -> Result<Vec<Row>> {
        let df = self.ctx.sql(sql).await?;
        let batches = df.collect().await?;
        batches_to_rows(&batches)
    }

    /// Execute local SQL and commit the result to a Delta path
    pub async fn write_to_delta(
        &self,
        sql: &str,
        dest: &dyn Destination,
        mode: WriteMode,
    ) -> Result<()> {
        let df = self.ctx.sql(sql).await?;
        let schema = df.schema().as_arrow().clone();
        let mut batches = df.collect().await?;
        if batches.is_empty() {
            // an empty commit still has to establish the table schema
            batches.push(RecordBatch::new_empty(Arc::new(schema)));
        }
        let ops = DeltaOps::try_from_url(Self::table_url(dest)?).await?;
        ops.write(batches).with_save_mode(mode.into()).await?;
        debug!(dest = %dest.uri(), mode = mode.as_str(), "Wrote query result to delta");
        Ok(())
    }

    /// Presence check; `extended` also requires at least one column
    pub async fn table_exists(&self, dest: &dyn Destination, extended: bool) -> Result<bool> {
        let url = Self::table_url(dest)?;
        match open_table(url).await {
            Ok(table) => {
                if extended {
                    let provider: Arc<dyn TableProvider> = Arc::new(table);
                    Ok(!provider.schema().fields().is_empty())
                } else {
                    Ok(true)
                }
            }
            Err(_) => Ok(false),
        }
    }

    pub async fn version(&self, dest: &dyn Destination) -> Result<i64> {
        let table = open_table(Self::table_url(dest)?).await?;
        Ok(table.version().unwrap_or(0))
    }

    pub async fn restore(&self, dest: &dyn Destination, version: i64) -> Result<()> {
        let table = open_table(Self::table_url(dest)?).await?;
        let (_, _metrics) = DeltaOps(table)
            .restore()
            .with_version_to_restore(version)
            .await?;
        debug!(dest = %dest.uri(), version, "Restored delta table");
        Ok(())
    }

    pub async fn vacuum(&self, dest: &dyn Destination) -> Result<()> {
        let table = open_table(Self::table_url(dest)?).await?;
        let (_, metrics) = table.vacuum().await?;
        debug!(
            dest = %dest.uri(),
            files_deleted = metrics.files_deleted.len(),
            "Vacuumed delta table"
        );
        Ok(())
    }
}

fn batches_to_rows(batches: &[RecordBatch]) -> Result<Vec<Row>> {
    let mut rows = Vec::new();
    for batch in batches {
        let columns: Arc<[String]> = batch
            .schema()
            .fields()
            .iter()
            .map(|f| f.name().clone())
            .collect::<Vec<_>>()
            .into();
        for i in 0..batch.num_rows() {
            let mut values = Vec::with_capacity(batch.num_columns());
            for c in 0..batch.num_columns() {
                values.push(arrow_value(batch.column(c), i)?);
            }
            rows.push(Row::new(columns.clone(), values));
        }
    }
    Ok(rows)
}

fn arrow_value(array: &ArrayRef, index: usize) -> Result<Value> {
    if array.is_null(index) {
        return Ok(Value::Null);
    }
    let any = array.as_any();
    let value = match array.data_type() {
        ArrowDataType::Boolean => any
            .downcast_ref::<BooleanArray>()
            .map(|a| Value::Bool(a.value(index))),
        ArrowDataType::Int16 => any
            .downcast_ref::<Int16Array>()
            .map(|a| Value::Int(a.value(index) as i64)),
        ArrowDataType::Int32 => any
            .downcast_ref::<Int32Array>()
            .map(|a| Value::Int(a.value(index) as i64)),
        ArrowDataType::Int64 => any
            .downcast_ref::<Int64Array>()
            .map(|a| Value::Int(a.value(index))),
        ArrowDataType::Float32 => any
            .downcast_ref::<Float32Array>()
            .map(|a| Value::Float(a.value(index) as f64)),
        ArrowDataType::Float64 => any
            .downcast_ref::<Float64Array>()
            .map(|a| Value::Float(a.value(index))),
        ArrowDataType::Utf8 => any
            .downcast_ref::<StringArray>()
            .map(|a| Value::Text(a.value(index).to_string())),
        ArrowDataType::LargeUtf8 => any
            .downcast_ref::<LargeStringArray>()
            .map(|a| Value::Text(a.value(index).to_string())),
        ArrowDataType::Timestamp(TimeUnit::Microsecond, _) => any
            .downcast_ref::<TimestampMicrosecondArray>()
            .and_then(|a| a.value_as_datetime(index))
            .map(Value::Timestamp),
        ArrowDataType::Timestamp(TimeUnit::Nanosecond, _) => any
            .downcast_ref::<TimestampNanosecondArray>()
            .and_then(|a| a.value_as_datetime(index))
            .map(Value::Timestamp),
        _ => None,
    };
    match value {
        Some(v) => Ok(v),
        // decimals, dates and friends fall back to their display form
        None => Ok(Value::Text(array_value_to_string(array, index)?)),
    }
}
