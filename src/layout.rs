//! Canonical destination sub-paths of one mirrored table
//!
//! ```text
//! <root>/
//! ├── meta/
//! │   ├── schema.json        captured ColumnInfo[]
//! │   ├── lock.txt           TTL mutex
//! │   └── load_log.json      structured log of the last run
//! ├── delta/                 the SCD2 fact table
//! └── delta_load/
//!     ├── latest_pk/         PK manifest after the last successful run
//!     ├── primary_keys_ts/   PK snapshot of the current source (transient)
//!     ├── delta_1/           rows read by timestamp watermark (transient)
//!     └── delta_2/           rows read to cover strange updates (transient)
//! ```

use std::sync::Arc;

use crate::destination::Destination;

pub const DELTA_DIR: &str = "delta";
pub const DELTA_LOAD_DIR: &str = "delta_load";
pub const LATEST_PK: &str = "latest_pk";
pub const PRIMARY_KEYS_TS: &str = "primary_keys_ts";
pub const DELTA_1: &str = "delta_1";
pub const DELTA_2: &str = "delta_2";
pub const META_DIR: &str = "meta";
pub const SCHEMA_FILE: &str = "schema.json";
pub const LOCK_FILE: &str = "lock.txt";
pub const LOAD_LOG_FILE: &str = "load_log.json";

/// Path layout rooted at a user-chosen destination
#[derive(Debug, Clone)]
pub struct MirrorLayout {
    root: Arc<dyn Destination>,
}

impl MirrorLayout {
    pub fn new(root: Arc<dyn Destination>) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Arc<dyn Destination> {
        &self.root
    }

    /// The SCD2 fact table
    pub fn delta(&self) -> Arc<dyn Destination> {
        self.root.sub(DELTA_DIR)
    }

    /// One of the `delta_load/` sub-tables by name
    pub fn delta_load(&self, name: &str) -> Arc<dyn Destination> {
        self.root.sub(DELTA_LOAD_DIR).sub(name)
    }

    pub fn latest_pk(&self) -> Arc<dyn Destination> {
        self.delta_load(LATEST_PK)
    }

    pub fn primary_keys_ts(&self) -> Arc<dyn Destination> {
        self.delta_load(PRIMARY_KEYS_TS)
    }

    pub fn delta_1(&self) -> Arc<dyn Destination> {
        self.delta_load(DELTA_1)
    }

    pub fn delta_2(&self) -> Arc<dyn Destination> {
        self.delta_load(DELTA_2)
    }

    pub fn meta(&self) -> Arc<dyn Destination> {
        self.root.sub(META_DIR)
    }

    pub fn schema_file(&self) -> Arc<dyn Destination> {
        self.meta().sub(SCHEMA_FILE)
    }

    pub fn lock_file(&self) -> Arc<dyn Destination> {
        self.meta().sub(LOCK_FILE)
    }

    pub fn load_log_file(&self) -> Arc<dyn Destination> {
        self.meta().sub(LOAD_LOG_FILE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::destination::LocalDestination;

    #[test]
    fn test_path_composition() {
        let layout =
            MirrorLayout::new(Arc::new(LocalDestination::new("/data/dbo/user2")));
        assert_eq!(layout.delta().uri(), "/data/dbo/user2/delta");
        assert_eq!(layout.latest_pk().uri(), "/data/dbo/user2/delta_load/latest_pk");
        assert_eq!(
            layout.primary_keys_ts().uri(),
            "/data/dbo/user2/delta_load/primary_keys_ts"
        );
        assert_eq!(layout.lock_file().uri(), "/data/dbo/user2/meta/lock.txt");
        assert_eq!(layout.schema_file().uri(), "/data/dbo/user2/meta/schema.json");
    }
}
