//! Test doubles for the orchestrator tests — an in-memory destination and a
//! scripted driver that records every contract call

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use delta_mirror::{
    DataSourceReader, Destination, MirrorError, Result, Row, Value, WriteMode,
};

// ─── MemoryDestination ───

#[derive(Debug, Default)]
struct MemoryState {
    files: HashMap<String, (String, DateTime<Utc>)>,
    dirs: Vec<String>,
}

/// Destination backed by a shared in-memory tree
#[derive(Debug, Clone)]
pub struct MemoryDestination {
    path: String,
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryDestination {
    pub fn root(name: &str) -> Self {
        Self {
            path: format!("mem/{name}"),
            state: Arc::new(Mutex::new(MemoryState::default())),
        }
    }

    /// Same tree, addressed at a relative path
    pub fn file(&self, rel: &str) -> MemoryDestination {
        MemoryDestination {
            path: format!("{}/{}", self.path, rel),
            state: self.state.clone(),
        }
    }

    /// Backdate a file, e.g. to make a lock stale
    pub fn backdate(&self, age: Duration) {
        let mut state = self.state.lock().unwrap();
        if let Some(entry) = state.files.get_mut(&self.path) {
            entry.1 = Utc::now() - age;
        }
    }
}

impl Destination for MemoryDestination {
    fn sub(&self, segment: &str) -> Arc<dyn Destination> {
        Arc::new(MemoryDestination {
            path: format!("{}/{}", self.path, segment),
            state: self.state.clone(),
        })
    }

    fn uri(&self) -> String {
        self.path.clone()
    }

    fn mkdir(&self) -> Result<()> {
        self.state.lock().unwrap().dirs.push(self.path.clone());
        Ok(())
    }

    fn exists(&self) -> bool {
        let state = self.state.lock().unwrap();
        let prefix = format!("{}/", self.path);
        state.files.contains_key(&self.path)
            || state.dirs.iter().any(|d| d == &self.path || d.starts_with(&prefix))
            || state.files.keys().any(|f| f.starts_with(&prefix))
    }

    fn remove(&self, recursive: bool) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.files.remove(&self.path);
        if recursive {
            let prefix = format!("{}/", self.path);
            state.files.retain(|f, _| !f.starts_with(&prefix));
            state.dirs.retain(|d| d != &self.path && !d.starts_with(&prefix));
        }
        Ok(())
    }

    fn upload_str(&self, content: &str) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .files
            .insert(self.path.clone(), (content.to_string(), Utc::now()));
        Ok(())
    }

    fn modified_time(&self) -> Result<DateTime<Utc>> {
        self.state
            .lock()
            .unwrap()
            .files
            .get(&self.path)
            .map(|(_, mtime)| *mtime)
            .ok_or_else(|| MirrorError::Internal(format!("no such file: {}", self.path)))
    }
}

// ─── MockReader ───

/// One recorded contract call
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    SourceQuery(String),
    SourceWrite { sql: String, path: String, mode: WriteMode },
    RegisterDeltaView { path: String, name: String, version: Option<i64> },
    RegisterView { name: String, sql: String },
    LocalQuery(String),
    LocalWrite { sql: String, path: String, mode: WriteMode },
    Restore { path: String, version: i64 },
    Vacuum { path: String },
}

#[derive(Debug, Default)]
struct MockState {
    /// uri → current version; presence doubles as table existence
    delta_tables: HashMap<String, i64>,
    columns_rows: Vec<Row>,
    pk_rows: Vec<Row>,
    watermark: Option<Value>,
    max_valid_from: Option<Value>,
    min_ts: Option<Value>,
    counts: HashMap<String, i64>,
    pk_chunk_rows: Vec<Row>,
    fail_when_sql_contains: Option<String>,
}

/// Scripted driver: canned metadata and aggregate answers, every call
/// recorded for later assertions
pub struct MockReader {
    calls: Mutex<Vec<Call>>,
    state: Mutex<MockState>,
}

impl MockReader {
    pub fn new(columns_rows: Vec<Row>, pk_rows: Vec<Row>) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            state: Mutex::new(MockState { columns_rows, pk_rows, ..Default::default() }),
        }
    }

    pub fn seed_delta_table(&self, uri: &str, version: i64) {
        self.state.lock().unwrap().delta_tables.insert(uri.to_string(), version);
    }

    pub fn set_watermark(&self, value: Option<Value>) {
        self.state.lock().unwrap().watermark = value;
    }

    pub fn set_max_valid_from(&self, value: Option<Value>) {
        self.state.lock().unwrap().max_valid_from = value;
    }

    pub fn set_min_ts(&self, value: Option<Value>) {
        self.state.lock().unwrap().min_ts = value;
    }

    pub fn set_count(&self, view: &str, count: i64) {
        self.state.lock().unwrap().counts.insert(view.to_string(), count);
    }

    pub fn set_pk_chunk_rows(&self, rows: Vec<Row>) {
        self.state.lock().unwrap().pk_chunk_rows = rows;
    }

    pub fn fail_when_sql_contains(&self, needle: &str) {
        self.state.lock().unwrap().fail_when_sql_contains = Some(needle.to_string());
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn version_of(&self, uri: &str) -> Option<i64> {
        self.state.lock().unwrap().delta_tables.get(uri).copied()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn check_failure(&self, sql: &str) -> Result<()> {
        let state = self.state.lock().unwrap();
        if let Some(needle) = &state.fail_when_sql_contains {
            if sql.contains(needle.as_str()) {
                return Err(MirrorError::Engine(format!("injected failure on {needle}")));
            }
        }
        Ok(())
    }

    fn bump_version(&self, uri: &str) {
        let mut state = self.state.lock().unwrap();
        let entry = state.delta_tables.entry(uri.to_string()).or_insert(-1);
        *entry += 1;
    }

    fn answer(&self, sql: &str) -> Vec<Row> {
        let state = self.state.lock().unwrap();
        if sql.contains("AS \"cnt\"") {
            for view in [
                "real_additional_updates",
                "deletes_with_schema",
                "delta_1",
                "delta_2",
            ] {
                if sql.contains(view) {
                    let count = state.counts.get(view).copied().unwrap_or(0);
                    return vec![Row::from_pairs(vec![("cnt", Value::Int(count))])];
                }
            }
            return vec![Row::from_pairs(vec![("cnt", Value::Int(0))])];
        }
        if sql.contains("AS \"max_ts\"") {
            let value = state.watermark.clone().unwrap_or(Value::Null);
            return vec![Row::from_pairs(vec![("max_ts", value)])];
        }
        if sql.contains("AS \"min_ts\"") {
            let value = state.min_ts.clone().unwrap_or(Value::Null);
            return vec![Row::from_pairs(vec![("min_ts", value)])];
        }
        if sql.contains("AS \"max_valid_from\"") {
            let value = state.max_valid_from.clone().unwrap_or(Value::Null);
            return vec![Row::from_pairs(vec![("max_valid_from", value)])];
        }
        if sql.contains("AS \"p0\"") {
            return state.pk_chunk_rows.clone();
        }
        Vec::new()
    }
}

#[async_trait]
impl DataSourceReader for MockReader {
    async fn source_query(&self, sql: &str) -> Result<Vec<Row>> {
        self.record(Call::SourceQuery(sql.to_string()));
        let state = self.state.lock().unwrap();
        if sql.contains("INFORMATION_SCHEMA.COLUMNS") {
            return Ok(state.columns_rows.clone());
        }
        if sql.contains("INFORMATION_SCHEMA.TABLE_CONSTRAINTS") {
            return Ok(state.pk_rows.clone());
        }
        Ok(Vec::new())
    }

    async fn source_write_to_delta(
        &self,
        sql: &str,
        dest: &dyn Destination,
        mode: WriteMode,
    ) -> Result<()> {
        self.check_failure(sql)?;
        self.record(Call::SourceWrite {
            sql: sql.to_string(),
            path: dest.uri(),
            mode,
        });
        self.bump_version(&dest.uri());
        Ok(())
    }

    async fn local_register_delta_view(
        &self,
        dest: &dyn Destination,
        name: &str,
        version: Option<i64>,
    ) -> Result<()> {
        self.record(Call::RegisterDeltaView {
            path: dest.uri(),
            name: name.to_string(),
            version,
        });
        Ok(())
    }

    async fn local_register_view(&self, sql: &str, name: &str) -> Result<()> {
        self.check_failure(sql)?;
        self.record(Call::RegisterView { name: name.to_string(), sql: sql.to_string() });
        Ok(())
    }

    async fn local_query(&self, sql: &str) -> Result<Vec<Row>> {
        self.check_failure(sql)?;
        self.record(Call::LocalQuery(sql.to_string()));
        Ok(self.answer(sql))
    }

    async fn local_write_to_delta(
        &self,
        sql: &str,
        dest: &dyn Destination,
        mode: WriteMode,
    ) -> Result<()> {
        self.check_failure(sql)?;
        self.record(Call::LocalWrite {
            sql: sql.to_string(),
            path: dest.uri(),
            mode,
        });
        self.bump_version(&dest.uri());
        Ok(())
    }

    async fn delta_table_exists(&self, dest: &dyn Destination, _extended: bool) -> Result<bool> {
        Ok(self.state.lock().unwrap().delta_tables.contains_key(&dest.uri()))
    }

    async fn delta_version(&self, dest: &dyn Destination) -> Result<i64> {
        self.state
            .lock()
            .unwrap()
            .delta_tables
            .get(&dest.uri())
            .copied()
            .ok_or_else(|| MirrorError::DeltaTable(format!("no table at {}", dest.uri())))
    }

    async fn delta_restore(&self, dest: &dyn Destination, version: i64) -> Result<()> {
        self.record(Call::Restore { path: dest.uri(), version });
        self.state
            .lock()
            .unwrap()
            .delta_tables
            .insert(dest.uri(), version);
        Ok(())
    }

    async fn delta_vacuum(&self, dest: &dyn Destination) -> Result<()> {
        self.record(Call::Vacuum { path: dest.uri() });
        Ok(())
    }
}

// ─── Row builders for the metadata probes ───

pub fn col_row(name: &str, data_type: &str, max_len: Option<i64>, is_identity: bool) -> Row {
    Row::from_pairs(vec![
        ("column_name", Value::from(name)),
        ("data_type", Value::from(data_type)),
        ("is_nullable", Value::Bool(true)),
        (
            "character_maximum_length",
            max_len.map(Value::Int).unwrap_or(Value::Null),
        ),
        ("generated_always_type_desc", Value::from("NOT_APPLICABLE")),
        ("is_identity", Value::Bool(is_identity)),
    ])
}

pub fn pk_row(name: &str) -> Row {
    Row::from_pairs(vec![("COLUMN_NAME", Value::from(name))])
}
