//! SQL expression tree and dialect-aware rendering
//!
//! Every statement the pipeline runs — against the source server or the
//! local lake engine — is built from these nodes and rendered exactly once.
//! No ad-hoc string concatenation outside this module, with two sanctioned
//! exceptions: the vendor catalog probes in [`crate::metadata`] and the
//! OPENJSON chunk literals, which pass through [`quote_value`].
//!
//! Rendering rules:
//! - every column reference is double-quoted
//! - `Tsql` is the source dialect (GETUTCDATE, OPENJSON, bit flags,
//!   anti-joins as `LEFT JOIN … IS NULL`)
//! - `Lake` is the local engine dialect (TRUE/FALSE literals,
//!   `LEFT ANTI JOIN`)

use crate::value::Value;

/// Target dialect for rendering
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// MS SQL Server (the source side)
    Tsql,
    /// The local lake query engine
    Lake,
}

/// Double-quote an identifier, doubling embedded quotes
pub fn quote_name(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Render a value as a SQL literal
pub fn quote_value(value: &Value, dialect: Dialect) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => match dialect {
            Dialect::Tsql => if *b { "1" } else { "0" }.to_string(),
            Dialect::Lake => if *b { "TRUE" } else { "FALSE" }.to_string(),
        },
        Value::Int(i) => i.to_string(),
        Value::Float(f) => f.to_string(),
        Value::Text(s) => {
            let escaped = s.replace('\'', "''");
            match dialect {
                Dialect::Tsql => format!("N'{escaped}'"),
                Dialect::Lake => format!("'{escaped}'"),
            }
        }
        Value::Timestamp(t) => format!("'{}'", t.format("%Y-%m-%d %H:%M:%S%.6f")),
    }
}

/// Scalar expression node
#[derive(Debug, Clone)]
pub enum Expr {
    Column { table: Option<String>, name: String },
    Lit(Value),
    Cast { expr: Box<Expr>, ty: String },
    Func { name: String, args: Vec<Expr> },
    Alias { expr: Box<Expr>, alias: String },
    Gt(Box<Expr>, Box<Expr>),
    Eq(Box<Expr>, Box<Expr>),
    And(Vec<Expr>),
    Not(Box<Expr>),
    IsNull(Box<Expr>),
    Collate { expr: Box<Expr>, collation: String },
    AtTimeZone { expr: Box<Expr>, zone: String },
    CurrentTimestamp,
    Star { table: Option<String> },
    RowNumberOver { partition_by: Vec<Expr>, order_by: Box<Expr>, descending: bool },
}

impl Expr {
    pub fn col(name: impl Into<String>) -> Self {
        Expr::Column { table: None, name: name.into() }
    }

    pub fn tcol(table: impl Into<String>, name: impl Into<String>) -> Self {
        Expr::Column { table: Some(table.into()), name: name.into() }
    }

    pub fn value(v: impl Into<Value>) -> Self {
        Expr::Lit(v.into())
    }

    pub fn null() -> Self {
        Expr::Lit(Value::Null)
    }

    pub fn func(name: impl Into<String>, args: Vec<Expr>) -> Self {
        Expr::Func { name: name.into(), args }
    }

    pub fn star() -> Self {
        Expr::Star { table: None }
    }

    pub fn tstar(table: impl Into<String>) -> Self {
        Expr::Star { table: Some(table.into()) }
    }

    pub fn cast(self, ty: impl Into<String>) -> Self {
        Expr::Cast { expr: Box::new(self), ty: ty.into() }
    }

    pub fn alias(self, alias: impl Into<String>) -> Self {
        Expr::Alias { expr: Box::new(self), alias: alias.into() }
    }

    pub fn gt(self, rhs: Expr) -> Self {
        Expr::Gt(Box::new(self), Box::new(rhs))
    }

    pub fn eq(self, rhs: Expr) -> Self {
        Expr::Eq(Box::new(self), Box::new(rhs))
    }

    pub fn not(self) -> Self {
        Expr::Not(Box::new(self))
    }

    pub fn is_null(self) -> Self {
        Expr::IsNull(Box::new(self))
    }

    pub fn collate(self, collation: impl Into<String>) -> Self {
        Expr::Collate { expr: Box::new(self), collation: collation.into() }
    }

    pub fn to_sql(&self, dialect: Dialect) -> String {
        match self {
            Expr::Column { table, name } => match table {
                Some(t) => format!("{}.{}", t, quote_name(name)),
                None => quote_name(name),
            },
            Expr::Lit(v) => quote_value(v, dialect),
            Expr::Cast { expr, ty } => {
                format!("CAST({} AS {})", expr.to_sql(dialect), ty)
            }
            Expr::Func { name, args } => {
                let rendered: Vec<String> = args.iter().map(|a| a.to_sql(dialect)).collect();
                format!("{}({})", name, rendered.join(", "))
            }
            Expr::Alias { expr, alias } => {
                format!("{} AS {}", expr.to_sql(dialect), quote_name(alias))
            }
            Expr::Gt(l, r) => format!("{} > {}", l.to_sql(dialect), r.to_sql(dialect)),
            Expr::Eq(l, r) => format!("{} = {}", l.to_sql(dialect), r.to_sql(dialect)),
            Expr::And(parts) => {
                let rendered: Vec<String> = parts.iter().map(|p| p.to_sql(dialect)).collect();
                rendered.join(" AND ")
            }
            Expr::Not(e) => format!("NOT {}", e.to_sql(dialect)),
            Expr::IsNull(e) => format!("{} IS NULL", e.to_sql(dialect)),
            Expr::Collate { expr, collation } => {
                format!("{} COLLATE {}", expr.to_sql(dialect), collation)
            }
            Expr::AtTimeZone { expr, zone } => {
                format!("{} AT TIME ZONE '{}'", expr.to_sql(dialect), zone)
            }
            Expr::CurrentTimestamp => "CURRENT_TIMESTAMP".to_string(),
            Expr::Star { table } => match table {
                Some(t) => format!("{t}.*"),
                None => "*".to_string(),
            },
            Expr::RowNumberOver { partition_by, order_by, descending } => {
                let parts: Vec<String> =
                    partition_by.iter().map(|p| p.to_sql(dialect)).collect();
                format!(
                    "ROW_NUMBER() OVER (PARTITION BY {} ORDER BY {}{})",
                    parts.join(", "),
                    order_by.to_sql(dialect),
                    if *descending { " DESC" } else { "" }
                )
            }
        }
    }
}

/// Column definition inside an OPENJSON `WITH` clause
#[derive(Debug, Clone)]
pub struct OpenJsonCol {
    /// JSON field name (p0, p1, …)
    pub field: String,
    /// SQL type for the WITH clause, e.g. `varchar(100)`
    pub sql_type: String,
    /// Alias the field is projected under
    pub alias: String,
}

/// FROM/JOIN operand
#[derive(Debug, Clone)]
pub enum TableFactor {
    Table { name: Vec<String>, alias: Option<String> },
    Derived { query: Box<SetQuery>, alias: String },
    /// `(SELECT p0 AS "a", … FROM OPENJSON(<literal>) WITH (p0 <type>, …)) AS alias`
    OpenJson { json: String, cols: Vec<OpenJsonCol>, alias: String },
}

impl TableFactor {
    pub fn named(parts: &[&str], alias: Option<&str>) -> Self {
        TableFactor::Table {
            name: parts.iter().map(|p| p.to_string()).collect(),
            alias: alias.map(|a| a.to_string()),
        }
    }

    pub fn derived(query: SetQuery, alias: impl Into<String>) -> Self {
        TableFactor::Derived { query: Box::new(query), alias: alias.into() }
    }

    fn to_sql(&self, dialect: Dialect) -> String {
        match self {
            TableFactor::Table { name, alias } => {
                let dotted: Vec<String> = name.iter().map(|p| quote_name(p)).collect();
                match alias {
                    Some(a) => format!("{} AS {}", dotted.join("."), quote_name(a)),
                    None => dotted.join("."),
                }
            }
            TableFactor::Derived { query, alias } => {
                format!("({}) AS {}", query.to_sql(dialect), quote_name(alias))
            }
            TableFactor::OpenJson { json, cols, alias } => {
                let projections: Vec<String> = cols
                    .iter()
                    .map(|c| format!("{} AS {}", c.field, quote_name(&c.alias)))
                    .collect();
                let with_defs: Vec<String> =
                    cols.iter().map(|c| format!("{} {}", c.field, c.sql_type)).collect();
                let literal = quote_value(&Value::Text(json.clone()), dialect);
                format!(
                    "(SELECT {} FROM OPENJSON({}) WITH ({})) AS {}",
                    projections.join(", "),
                    literal,
                    with_defs.join(", "),
                    quote_name(alias)
                )
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    /// Keeps left rows with no match on the right
    Anti,
}

#[derive(Debug, Clone)]
pub struct Join {
    pub kind: JoinKind,
    pub factor: TableFactor,
    pub on: Expr,
}

/// Plain SELECT with optional joins, predicates and limit
#[derive(Debug, Clone, Default)]
pub struct Select {
    projections: Vec<Expr>,
    from: Option<TableFactor>,
    joins: Vec<Join>,
    predicates: Vec<Expr>,
    limit: Option<u64>,
}

impl Select {
    pub fn new(projections: Vec<Expr>) -> Self {
        Self { projections, ..Default::default() }
    }

    pub fn from_table(mut self, factor: TableFactor) -> Self {
        self.from = Some(factor);
        self
    }

    pub fn join(mut self, join: Join) -> Self {
        self.joins.push(join);
        self
    }

    pub fn filter(mut self, predicate: Expr) -> Self {
        self.predicates.push(predicate);
        self
    }

    pub fn limit(mut self, n: u64) -> Self {
        self.limit = Some(n);
        self
    }

    pub fn to_sql(&self, dialect: Dialect) -> String {
        let projections: Vec<String> =
            self.projections.iter().map(|p| p.to_sql(dialect)).collect();
        let mut sql = format!("SELECT {}", projections.join(", "));
        if let Some(from) = &self.from {
            sql.push_str(&format!(" FROM {}", from.to_sql(dialect)));
        }
        let mut predicates = self.predicates.clone();
        for join in &self.joins {
            match (join.kind, dialect) {
                (JoinKind::Inner, _) => {
                    sql.push_str(&format!(
                        " INNER JOIN {} ON {}",
                        join.factor.to_sql(dialect),
                        join.on.to_sql(dialect)
                    ));
                }
                (JoinKind::Anti, Dialect::Lake) => {
                    sql.push_str(&format!(
                        " LEFT ANTI JOIN {} ON {}",
                        join.factor.to_sql(dialect),
                        join.on.to_sql(dialect)
                    ));
                }
                (JoinKind::Anti, Dialect::Tsql) => {
                    sql.push_str(&format!(
                        " LEFT JOIN {} ON {}",
                        join.factor.to_sql(dialect),
                        join.on.to_sql(dialect)
                    ));
                    if let Some(probe) = anti_null_probe(&join.on) {
                        predicates.push(probe.is_null());
                    }
                }
            }
        }
        if !predicates.is_empty() {
            let rendered: Vec<String> =
                predicates.iter().map(|p| p.to_sql(dialect)).collect();
            sql.push_str(&format!(" WHERE {}", rendered.join(" AND ")));
        }
        if let Some(n) = self.limit {
            sql.push_str(&format!(" LIMIT {n}"));
        }
        sql
    }
}

/// Right-hand key of the first equality in an ON clause, used to rewrite
/// anti-joins as `LEFT JOIN … IS NULL` where the dialect has no ANTI JOIN.
fn anti_null_probe(on: &Expr) -> Option<Expr> {
    match on {
        Expr::Eq(_, right) => Some((**right).clone()),
        Expr::And(parts) => parts.iter().find_map(anti_null_probe),
        _ => None,
    }
}

/// SELECT / UNION / EXCEPT tree
#[derive(Debug, Clone)]
pub enum SetQuery {
    Select(Select),
    Union { queries: Vec<SetQuery>, distinct: bool },
    Except { left: Box<SetQuery>, right: Box<SetQuery> },
}

impl SetQuery {
    pub fn union_all(queries: Vec<SetQuery>) -> Self {
        SetQuery::Union { queries, distinct: false }
    }

    pub fn except(left: SetQuery, right: SetQuery) -> Self {
        SetQuery::Except { left: Box::new(left), right: Box::new(right) }
    }

    pub fn to_sql(&self, dialect: Dialect) -> String {
        match self {
            SetQuery::Select(s) => s.to_sql(dialect),
            SetQuery::Union { queries, distinct } => {
                let op = if *distinct { " UNION " } else { " UNION ALL " };
                let rendered: Vec<String> =
                    queries.iter().map(|q| q.to_sql(dialect)).collect();
                rendered.join(op)
            }
            SetQuery::Except { left, right } => {
                format!("{} EXCEPT {}", left.to_sql(dialect), right.to_sql(dialect))
            }
        }
    }
}

impl From<Select> for SetQuery {
    fn from(s: Select) -> Self {
        SetQuery::Select(s)
    }
}

/// A set query prefixed with common table expressions
#[derive(Debug, Clone)]
pub struct WithQuery {
    pub ctes: Vec<(String, SetQuery)>,
    pub body: SetQuery,
}

impl WithQuery {
    pub fn to_sql(&self, dialect: Dialect) -> String {
        let ctes: Vec<String> = self
            .ctes
            .iter()
            .map(|(name, q)| format!("{} AS ({})", quote_name(name), q.to_sql(dialect)))
            .collect();
        format!("WITH {} {}", ctes.join(", "), self.body.to_sql(dialect))
    }
}

/// `SELECT COUNT(*) AS "cnt" FROM (SELECT * FROM view LIMIT 1) AS "t"` —
/// a cheap has-rows probe for freshly written transient tables
pub fn count_limit_one(view: &str) -> Select {
    let inner = Select::new(vec![Expr::star()])
        .from_table(TableFactor::named(&[view], None))
        .limit(1);
    Select::new(vec![Expr::func("COUNT", vec![Expr::star()]).alias("cnt")])
        .from_table(TableFactor::derived(inner.into(), "t"))
}

/// `SELECT COUNT(*) AS "cnt" FROM view`
pub fn count_star(view: &str) -> Select {
    Select::new(vec![Expr::func("COUNT", vec![Expr::star()]).alias("cnt")])
        .from_table(TableFactor::named(&[view], None))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_name_doubles_quotes() {
        assert_eq!(quote_name("user - id"), "\"user - id\"");
        assert_eq!(quote_name("a\"b"), "\"a\"\"b\"");
    }

    #[test]
    fn test_quote_value_strings_per_dialect() {
        let v = Value::Text("O'Brien".into());
        assert_eq!(quote_value(&v, Dialect::Tsql), "N'O''Brien'");
        assert_eq!(quote_value(&v, Dialect::Lake), "'O''Brien'");
    }

    #[test]
    fn test_quote_value_bool_per_dialect() {
        assert_eq!(quote_value(&Value::Bool(true), Dialect::Tsql), "1");
        assert_eq!(quote_value(&Value::Bool(true), Dialect::Lake), "TRUE");
    }

    #[test]
    fn test_select_with_cast_and_alias() {
        let sql = Select::new(vec![
            Expr::tcol("t", "Age").cast("decimal(15,4)").alias("Age"),
        ])
        .from_table(TableFactor::named(&["dbo", "user2"], Some("t")))
        .to_sql(Dialect::Tsql);
        assert_eq!(
            sql,
            "SELECT CAST(t.\"Age\" AS decimal(15,4)) AS \"Age\" FROM \"dbo\".\"user2\" AS \"t\""
        );
    }

    #[test]
    fn test_where_and_gt() {
        let sql = Select::new(vec![Expr::star()])
            .from_table(TableFactor::named(&["x"], Some("t")))
            .filter(Expr::tcol("t", "ts").gt(Expr::value(5i64)))
            .to_sql(Dialect::Tsql);
        assert_eq!(sql, "SELECT * FROM \"x\" AS \"t\" WHERE t.\"ts\" > 5");
    }

    #[test]
    fn test_union_all_and_except() {
        let a = Select::new(vec![Expr::col("a")]).from_table(TableFactor::named(&["x"], None));
        let b = Select::new(vec![Expr::col("a")]).from_table(TableFactor::named(&["y"], None));
        let union = SetQuery::union_all(vec![a.clone().into(), b.clone().into()]);
        assert!(union.to_sql(Dialect::Lake).contains(" UNION ALL "));
        let except = SetQuery::except(a.into(), b.into());
        assert!(except.to_sql(Dialect::Lake).contains(" EXCEPT "));
    }

    #[test]
    fn test_anti_join_rendering() {
        let join = Join {
            kind: JoinKind::Anti,
            factor: TableFactor::named(&["d2"], Some("au")),
            on: Expr::tcol("d1", "id").eq(Expr::tcol("au", "id")),
        };
        let select = Select::new(vec![Expr::star()])
            .from_table(TableFactor::named(&["d1"], Some("d1")))
            .join(join);

        let lake = select.to_sql(Dialect::Lake);
        assert!(lake.contains("LEFT ANTI JOIN \"d2\" AS \"au\" ON d1.\"id\" = au.\"id\""));
        assert!(!lake.contains("IS NULL"));

        let tsql = select.to_sql(Dialect::Tsql);
        assert!(tsql.contains("LEFT JOIN"));
        assert!(tsql.ends_with("WHERE au.\"id\" IS NULL"));
    }

    #[test]
    fn test_openjson_factor() {
        let factor = TableFactor::OpenJson {
            json: "[{\"p0\": \"x\"}]".to_string(),
            cols: vec![OpenJsonCol {
                field: "p0".into(),
                sql_type: "varchar(100)".into(),
                alias: "LastName".into(),
            }],
            alias: "ttt".into(),
        };
        let sql = factor.to_sql(Dialect::Tsql);
        assert!(sql.starts_with("(SELECT p0 AS \"LastName\" FROM OPENJSON(N'"));
        assert!(sql.contains("WITH (p0 varchar(100))"));
        assert!(sql.ends_with("AS \"ttt\""));
    }

    #[test]
    fn test_collate_in_join_predicate() {
        let on = Expr::tcol("t", "LastName")
            .collate("Latin1_General_100_BIN")
            .eq(Expr::tcol("ttt", "LastName"));
        assert_eq!(
            on.to_sql(Dialect::Tsql),
            "t.\"LastName\" COLLATE Latin1_General_100_BIN = ttt.\"LastName\""
        );
    }

    #[test]
    fn test_with_query() {
        let deletes = Select::new(vec![Expr::col("id")])
            .from_table(TableFactor::named(&["last"], None));
        let body = Select::new(vec![Expr::star()])
            .from_table(TableFactor::named(&["deletes"], None));
        let q = WithQuery {
            ctes: vec![("deletes".to_string(), deletes.into())],
            body: body.into(),
        };
        let sql = q.to_sql(Dialect::Lake);
        assert!(sql.starts_with("WITH \"deletes\" AS (SELECT \"id\" FROM \"last\")"));
    }

    #[test]
    fn test_count_limit_one_shape() {
        let sql = count_limit_one("delta_1").to_sql(Dialect::Lake);
        assert_eq!(
            sql,
            "SELECT COUNT(*) AS \"cnt\" FROM (SELECT * FROM \"delta_1\" LIMIT 1) AS \"t\""
        );
    }

    #[test]
    fn test_row_number_over() {
        let e = Expr::RowNumberOver {
            partition_by: vec![Expr::col("id")],
            order_by: Box::new(Expr::col("__valid_from")),
            descending: true,
        };
        assert_eq!(
            e.to_sql(Dialect::Lake),
            "ROW_NUMBER() OVER (PARTITION BY \"id\" ORDER BY \"__valid_from\" DESC)"
        );
    }

    #[test]
    fn test_at_time_zone_tombstone_timestamp() {
        let e = Expr::AtTimeZone {
            expr: Box::new(Expr::CurrentTimestamp),
            zone: "UTC".into(),
        }
        .alias("__valid_from");
        assert_eq!(
            e.to_sql(Dialect::Lake),
            "CURRENT_TIMESTAMP AT TIME ZONE 'UTC' AS \"__valid_from\""
        );
    }
}
