//! Source table metadata — column info, table references, catalog probes
//!
//! The probes issue vendor-specific SQL against `INFORMATION_SCHEMA` joined
//! to `sys.columns`/`sys.tables`/`sys.schemas` (identity and generated-column
//! info), and `EXEC sp_describe_first_result_set` for ad-hoc queries.

use serde::{Deserialize, Serialize};

use crate::error::{MirrorError, Result};
use crate::reader::DataSourceReader;
use crate::sql::{quote_name, quote_value, Dialect, TableFactor};
use crate::value::{Row, Value};

/// Name of the SCD2 validity timestamp appended to every mirrored row
pub const VALID_FROM_COL: &str = "__valid_from";
/// Name of the tombstone flag appended to every mirrored row
pub const IS_DELETED_COL: &str = "__is_deleted";
/// Name of the full-load flag appended to every mirrored row
pub const IS_FULL_LOAD_COL: &str = "__is_full_load";

/// Generated-column kind as reported by `sys.columns`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GeneratedKind {
    #[default]
    NotApplicable,
    AsRowStart,
    AsRowEnd,
}

impl GeneratedKind {
    fn parse(s: &str) -> Self {
        match s {
            "AS_ROW_START" => Self::AsRowStart,
            "AS_ROW_END" => Self::AsRowEnd,
            _ => Self::NotApplicable,
        }
    }
}

/// One source column, immutable once discovered
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColumnInfo {
    pub column_name: String,
    /// Lowercased SQL type name without arguments (`varchar`, `decimal`, …)
    pub data_type: String,
    pub column_default: Option<String>,
    pub is_nullable: bool,
    /// `-1` means MAX
    pub character_maximum_length: Option<i32>,
    pub numeric_precision: Option<i32>,
    pub numeric_scale: Option<i32>,
    pub datetime_precision: Option<i32>,
    pub generated_always_type_desc: GeneratedKind,
    pub is_identity: bool,
}

impl Default for ColumnInfo {
    fn default() -> Self {
        Self {
            column_name: String::new(),
            data_type: String::new(),
            column_default: None,
            is_nullable: true,
            character_maximum_length: None,
            numeric_precision: None,
            numeric_scale: None,
            datetime_precision: None,
            generated_always_type_desc: GeneratedKind::NotApplicable,
            is_identity: false,
        }
    }
}

impl ColumnInfo {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            column_name: name.into(),
            data_type: data_type.into(),
            ..Default::default()
        }
    }

    /// Parse a `type(args)` declaration, e.g. `varchar(100)` or `decimal(15,4)`
    pub fn from_name_type(name: impl Into<String>, declared: &str) -> Self {
        let (ty, args) = match declared.split_once('(') {
            Some((ty, rest)) => (ty, Some(rest.trim_end_matches(')'))),
            None => (declared, None),
        };
        let ty = ty.trim().to_lowercase();
        let mut info = Self::new(name, ty.clone());
        if let Some(args) = args {
            let mut parts = args.splitn(2, ',').map(|p| p.trim());
            let first = parts.next().and_then(|p| {
                if p.eq_ignore_ascii_case("max") {
                    Some(-1)
                } else {
                    p.parse::<i32>().ok()
                }
            });
            let second = parts.next().and_then(|p| p.parse::<i32>().ok());
            match ty.as_str() {
                "varchar" | "char" | "nvarchar" | "nchar" | "binary" | "varbinary" => {
                    info.character_maximum_length = first;
                }
                "decimal" | "numeric" => {
                    info.numeric_precision = first;
                    info.numeric_scale = second;
                }
                "datetime2" | "datetimeoffset" | "time" => {
                    info.datetime_precision = first;
                }
                _ => {}
            }
        }
        info
    }

    /// Character types that need a binary collation on join predicates
    pub fn is_character(&self) -> bool {
        matches!(
            self.data_type.as_str(),
            "char" | "varchar" | "nchar" | "nvarchar" | "text" | "ntext"
        )
    }

    /// Types whose JSON representation stays short (chunk-size estimation)
    pub fn is_compact_numeric(&self) -> bool {
        matches!(
            self.data_type.as_str(),
            "bit" | "int" | "bigint" | "tinyint" | "bool" | "smallint"
        )
    }

    /// Full SQL type declaration, e.g. for an OPENJSON `WITH` clause
    pub fn sql_type(&self) -> String {
        match self.data_type.as_str() {
            "varchar" | "char" | "nvarchar" | "nchar" | "binary" | "varbinary" => {
                match self.character_maximum_length {
                    Some(-1) => format!("{}(MAX)", self.data_type),
                    Some(n) => format!("{}({})", self.data_type, n),
                    None => self.data_type.clone(),
                }
            }
            "decimal" | "numeric" => format!(
                "{}({},{})",
                self.data_type,
                self.numeric_precision.unwrap_or(18),
                self.numeric_scale.unwrap_or(0)
            ),
            "datetime2" | "datetimeoffset" | "time" => match self.datetime_precision {
                Some(p) => format!("{}({})", self.data_type, p),
                None => self.data_type.clone(),
            },
            _ => self.data_type.clone(),
        }
    }

    /// Column template for [`VALID_FROM_COL`]
    pub fn valid_from() -> Self {
        let mut c = Self::new(VALID_FROM_COL, "datetime2");
        c.datetime_precision = Some(6);
        c.is_nullable = false;
        c
    }

    /// Column template for [`IS_DELETED_COL`]
    pub fn is_deleted() -> Self {
        let mut c = Self::new(IS_DELETED_COL, "bit");
        c.is_nullable = false;
        c
    }

    /// Column template for [`IS_FULL_LOAD_COL`]
    pub fn is_full_load() -> Self {
        let mut c = Self::new(IS_FULL_LOAD_COL, "bit");
        c.is_nullable = false;
        c
    }
}

/// Reference to a source table
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableRef {
    /// Bare name, schema defaults to `dbo`
    Name(String),
    SchemaTable(String, String),
    Full(String, String, String),
}

impl TableRef {
    pub fn database(&self) -> Option<&str> {
        match self {
            TableRef::Full(db, _, _) => Some(db),
            _ => None,
        }
    }

    pub fn schema(&self) -> &str {
        match self {
            TableRef::Name(_) => "dbo",
            TableRef::SchemaTable(s, _) => s,
            TableRef::Full(_, s, _) => s,
        }
    }

    pub fn table(&self) -> &str {
        match self {
            TableRef::Name(t) => t,
            TableRef::SchemaTable(_, t) => t,
            TableRef::Full(_, _, t) => t,
        }
    }

    fn parts(&self) -> Vec<&str> {
        match self {
            TableRef::Name(t) => vec![t],
            TableRef::SchemaTable(s, t) => vec![s, t],
            TableRef::Full(d, s, t) => vec![d, s, t],
        }
    }

    pub fn factor(&self, alias: Option<&str>) -> TableFactor {
        TableFactor::named(&self.parts(), alias)
    }

    /// Name used when the mirrored table is registered as a local view
    pub fn temp_view_name(&self) -> String {
        format!("temp_{}", self.parts().join("_"))
    }
}

impl std::fmt::Display for TableRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let quoted: Vec<String> = self.parts().iter().map(|p| quote_name(p)).collect();
        f.write_str(&quoted.join("."))
    }
}

impl From<&str> for TableRef {
    fn from(t: &str) -> Self {
        TableRef::Name(t.to_string())
    }
}

impl From<(&str, &str)> for TableRef {
    fn from((s, t): (&str, &str)) -> Self {
        TableRef::SchemaTable(s.to_string(), t.to_string())
    }
}

impl From<(&str, &str, &str)> for TableRef {
    fn from((d, s, t): (&str, &str, &str)) -> Self {
        TableRef::Full(d.to_string(), s.to_string(), t.to_string())
    }
}

fn db_prefix(table: &TableRef) -> String {
    match table.database() {
        Some(db) => format!("{}.", quote_name(db)),
        None => String::new(),
    }
}

fn text_lit(s: &str) -> String {
    quote_value(&Value::Text(s.to_string()), Dialect::Tsql)
}

/// Discover the primary-key column names of a table
pub async fn get_primary_keys(
    reader: &dyn DataSourceReader,
    table: &TableRef,
) -> Result<Vec<String>> {
    let db = db_prefix(table);
    let sql = format!(
        "SELECT ccu.COLUMN_NAME \
         FROM {db}INFORMATION_SCHEMA.TABLE_CONSTRAINTS tc WITH(NOLOCK) \
         JOIN {db}INFORMATION_SCHEMA.CONSTRAINT_COLUMN_USAGE ccu WITH(NOLOCK) \
           ON tc.CONSTRAINT_NAME = ccu.CONSTRAINT_NAME \
         WHERE tc.CONSTRAINT_TYPE = 'PRIMARY KEY' \
           AND ccu.TABLE_NAME = {table_lit} AND ccu.TABLE_SCHEMA = {schema_lit}",
        db = db,
        table_lit = text_lit(table.table()),
        schema_lit = text_lit(table.schema()),
    );
    let rows = reader.source_query(&sql).await?;
    Ok(rows
        .iter()
        .filter_map(|r| r.get("COLUMN_NAME").and_then(|v| v.as_str()).map(String::from))
        .collect())
}

/// Discover the full column set of a table
pub async fn get_columns(
    reader: &dyn DataSourceReader,
    table: &TableRef,
) -> Result<Vec<ColumnInfo>> {
    let db = db_prefix(table);
    let sql = format!(
        "SELECT ccu.COLUMN_NAME AS column_name, ccu.COLUMN_DEFAULT AS column_default, \
            CAST(CASE WHEN ccu.IS_NULLABLE = 'YES' THEN 1 ELSE 0 END AS bit) AS is_nullable, \
            ccu.DATA_TYPE AS data_type, \
            ccu.CHARACTER_MAXIMUM_LENGTH AS character_maximum_length, \
            ccu.NUMERIC_PRECISION AS numeric_precision, \
            ccu.NUMERIC_SCALE AS numeric_scale, \
            ccu.DATETIME_PRECISION AS datetime_precision, \
            ci.generated_always_type_desc, \
            COALESCE(ci.is_identity, CONVERT(bit, 0)) AS is_identity \
         FROM {db}INFORMATION_SCHEMA.COLUMNS ccu \
         LEFT JOIN ( \
            SELECT sc.name AS schema_name, t.name AS table_name, c.name AS col_name, \
                   c.generated_always_type_desc, c.is_identity \
            FROM {db}sys.columns c \
            INNER JOIN {db}sys.tables t ON t.object_id = c.object_id \
            INNER JOIN {db}sys.schemas sc ON sc.schema_id = t.schema_id \
         ) ci ON ci.schema_name = ccu.TABLE_SCHEMA \
            AND ci.table_name = ccu.TABLE_NAME AND ci.col_name = ccu.COLUMN_NAME \
         WHERE ccu.TABLE_NAME = {table_lit} AND ccu.TABLE_SCHEMA = {schema_lit}",
        db = db,
        table_lit = text_lit(table.table()),
        schema_lit = text_lit(table.schema()),
    );
    let rows = reader.source_query(&sql).await?;
    Ok(rows.iter().map(column_from_row).collect())
}

fn column_from_row(row: &Row) -> ColumnInfo {
    let text = |name: &str| {
        row.get(name)
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
    };
    let int = |name: &str| row.get(name).and_then(|v| v.as_i64()).map(|i| i as i32);
    let flag = |name: &str| row.get(name).and_then(|v| v.as_bool()).unwrap_or(false);
    ColumnInfo {
        column_name: text("column_name").unwrap_or_default(),
        data_type: text("data_type").unwrap_or_default().to_lowercase(),
        column_default: text("column_default"),
        is_nullable: row
            .get("is_nullable")
            .and_then(|v| v.as_bool())
            .unwrap_or(true),
        character_maximum_length: int("character_maximum_length"),
        numeric_precision: int("numeric_precision"),
        numeric_scale: int("numeric_scale"),
        datetime_precision: int("datetime_precision"),
        generated_always_type_desc: text("generated_always_type_desc")
            .map(|s| GeneratedKind::parse(&s))
            .unwrap_or_default(),
        is_identity: flag("is_identity"),
    }
}

/// Discover the result-set shape of an ad-hoc query via
/// `sp_describe_first_result_set`
pub async fn get_query_columns(
    reader: &dyn DataSourceReader,
    query_sql: &str,
) -> Result<Vec<ColumnInfo>> {
    let sql = format!(
        "EXEC sp_describe_first_result_set @tsql=N'{}'",
        query_sql.replace('\'', "''")
    );
    let rows = reader.source_query(&sql).await?;
    let mut cols = Vec::with_capacity(rows.len());
    for row in &rows {
        let name = row
            .get("name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| MirrorError::Metadata("result set column without a name".into()))?;
        let declared = row
            .get("system_type_name")
            .and_then(|v| v.as_str())
            .unwrap_or("nvarchar");
        let mut col = ColumnInfo::from_name_type(name, declared);
        col.numeric_precision = row
            .get("precision")
            .and_then(|v| v.as_i64())
            .map(|i| i as i32)
            .or(col.numeric_precision);
        col.numeric_scale = row
            .get("scale")
            .and_then(|v| v.as_i64())
            .map(|i| i as i32)
            .or(col.numeric_scale);
        col.is_nullable = row
            .get("is_nullable")
            .and_then(|v| v.as_bool())
            .unwrap_or(true);
        col.is_identity = row
            .get("is_identity_column")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        cols.push(col);
    }
    Ok(cols)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_name_type_varchar() {
        let c = ColumnInfo::from_name_type("LastName", "varchar(100)");
        assert_eq!(c.data_type, "varchar");
        assert_eq!(c.character_maximum_length, Some(100));
        assert_eq!(c.sql_type(), "varchar(100)");
    }

    #[test]
    fn test_from_name_type_varchar_max() {
        let c = ColumnInfo::from_name_type("blob", "nvarchar(MAX)");
        assert_eq!(c.character_maximum_length, Some(-1));
        assert_eq!(c.sql_type(), "nvarchar(MAX)");
    }

    #[test]
    fn test_from_name_type_decimal() {
        let c = ColumnInfo::from_name_type("Age", "decimal(15, 4)");
        assert_eq!(c.numeric_precision, Some(15));
        assert_eq!(c.numeric_scale, Some(4));
        assert_eq!(c.sql_type(), "decimal(15,4)");
    }

    #[test]
    fn test_character_and_numeric_classification() {
        assert!(ColumnInfo::new("n", "nvarchar").is_character());
        assert!(!ColumnInfo::new("n", "int").is_character());
        assert!(ColumnInfo::new("n", "bigint").is_compact_numeric());
        assert!(!ColumnInfo::new("n", "varchar").is_compact_numeric());
    }

    #[test]
    fn test_table_ref_defaults_and_display() {
        let t = TableRef::from("user2");
        assert_eq!(t.schema(), "dbo");
        assert_eq!(t.to_string(), "\"user2\"");
        let t = TableRef::from(("long schema", "long table"));
        assert_eq!(t.to_string(), "\"long schema\".\"long table\"");
        assert_eq!(t.temp_view_name(), "temp_long schema_long table");
        let t = TableRef::from(("db", "s", "t"));
        assert_eq!(t.database(), Some("db"));
    }

    #[test]
    fn test_generated_kind_serde_names() {
        let json = serde_json::to_string(&GeneratedKind::AsRowStart).unwrap();
        assert_eq!(json, "\"AS_ROW_START\"");
        let back: GeneratedKind = serde_json::from_str("\"NOT_APPLICABLE\"").unwrap();
        assert_eq!(back, GeneratedKind::NotApplicable);
    }

    #[test]
    fn test_schema_json_roundtrip() {
        let cols = vec![
            ColumnInfo::from_name_type("id", "bigint"),
            ColumnInfo::from_name_type("name", "nvarchar(50)"),
        ];
        let json = serde_json::to_string_pretty(&cols).unwrap();
        let back: Vec<ColumnInfo> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cols);
    }
}
