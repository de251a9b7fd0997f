//! Configuration for a mirror run

use std::collections::HashMap;

use crate::metadata::ColumnInfo;
use crate::sql::Dialect;

/// How the orchestrator loads the table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadMode {
    /// Full load on the first run, delta afterwards
    #[default]
    Auto,
    /// Rewrite the destination from scratch
    Overwrite,
    /// Append a full load
    Append,
    /// Full load even when a delta load would be possible
    ForceFull,
    /// Delta load without delete or strange-update detection
    SimpleDelta,
    /// Watermark-filtered inserts only, no manifest bookkeeping
    AppendInserts,
}

impl LoadMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Overwrite => "overwrite",
            Self::Append => "append",
            Self::ForceFull => "force_full",
            Self::SimpleDelta => "simple_delta",
            Self::AppendInserts => "append_inserts",
        }
    }
}

/// Default destination-name normalisation: characters Delta column names
/// cannot carry become underscores
pub fn default_target_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            ' ' | ',' | ';' | '{' | '}' | '(' | ')' | '\n' | '\t' | '=' => '_',
            other => other,
        })
        .collect()
}

/// Configuration record plumbed through every load step
#[derive(Debug, Clone)]
pub struct WriteConfig {
    pub load_mode: LoadMode,
    /// Source dialect; MS SQL Server is the only supported source
    pub dialect: Dialect,
    /// Source type name → lake type used for CAST wrapping on read
    pub data_type_map: HashMap<String, String>,
    /// Maps a source column name to its destination name
    pub get_target_name: fn(&str) -> String,
    /// Fall back to a secondary timestamp load instead of OPENJSON chunking
    pub no_complex_entries_load: bool,
    /// Override for primary-key discovery
    pub primary_keys: Option<Vec<String>>,
    /// Override for the watermark column
    pub delta_col: Option<String>,
}

impl Default for WriteConfig {
    fn default() -> Self {
        // rowversion watermarks only compare sanely as integers
        let mut data_type_map = HashMap::new();
        data_type_map.insert("rowversion".to_string(), "bigint".to_string());
        data_type_map.insert("timestamp".to_string(), "bigint".to_string());
        Self {
            load_mode: LoadMode::Auto,
            dialect: Dialect::Tsql,
            data_type_map,
            get_target_name: default_target_name,
            no_complex_entries_load: false,
            primary_keys: None,
            delta_col: None,
        }
    }
}

impl WriteConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_load_mode(mut self, mode: LoadMode) -> Self {
        self.load_mode = mode;
        self
    }

    pub fn with_data_type_map(mut self, map: HashMap<String, String>) -> Self {
        self.data_type_map = map;
        self
    }

    pub fn with_target_name(mut self, f: fn(&str) -> String) -> Self {
        self.get_target_name = f;
        self
    }

    pub fn with_no_complex_entries_load(mut self, flag: bool) -> Self {
        self.no_complex_entries_load = flag;
        self
    }

    pub fn with_primary_keys(mut self, pks: Vec<String>) -> Self {
        self.primary_keys = Some(pks);
        self
    }

    pub fn with_delta_col(mut self, col: impl Into<String>) -> Self {
        self.delta_col = Some(col.into());
        self
    }

    /// Destination name of a column
    pub fn target_name(&self, col: &ColumnInfo) -> String {
        (self.get_target_name)(&col.column_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = WriteConfig::new();
        assert_eq!(cfg.load_mode, LoadMode::Auto);
        assert_eq!(cfg.dialect, Dialect::Tsql);
        assert_eq!(cfg.data_type_map.get("rowversion").map(String::as_str), Some("bigint"));
        assert!(!cfg.no_complex_entries_load);
    }

    #[test]
    fn test_builder_pattern() {
        let cfg = WriteConfig::new()
            .with_load_mode(LoadMode::AppendInserts)
            .with_delta_col("time_stamp")
            .with_primary_keys(vec!["user - id".to_string()]);
        assert_eq!(cfg.load_mode, LoadMode::AppendInserts);
        assert_eq!(cfg.delta_col.as_deref(), Some("time_stamp"));
        assert_eq!(cfg.primary_keys.as_deref(), Some(&["user - id".to_string()][..]));
    }

    #[test]
    fn test_default_target_name_normalisation() {
        assert_eq!(default_target_name("user - id"), "user_-_id");
        assert_eq!(default_target_name("a(b)=c"), "a_b__c");
        assert_eq!(default_target_name("plain"), "plain");
    }
}
