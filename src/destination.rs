//! Destination path abstraction — local filesystem, blob and ADLS backends
//! share one capability set
//!
//! The orchestrator only ever talks to `Arc<dyn Destination>`; the crate
//! ships the local variant, cloud backends implement the same trait.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::Result;

/// Capability set of a destination path
pub trait Destination: Send + Sync + fmt::Debug {
    /// Compose a sub-path
    fn sub(&self, segment: &str) -> Arc<dyn Destination>;

    /// Address understood by the lake engine (local path or URL)
    fn uri(&self) -> String;

    fn mkdir(&self) -> Result<()>;

    fn exists(&self) -> bool;

    /// Remove a file, or a directory tree when `recursive`
    fn remove(&self, recursive: bool) -> Result<()>;

    /// Write a small text file, creating parent directories as needed
    fn upload_str(&self, content: &str) -> Result<()>;

    fn modified_time(&self) -> Result<DateTime<Utc>>;
}

/// Local filesystem destination
#[derive(Debug, Clone)]
pub struct LocalDestination {
    path: PathBuf,
}

impl LocalDestination {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Destination for LocalDestination {
    fn sub(&self, segment: &str) -> Arc<dyn Destination> {
        Arc::new(LocalDestination { path: self.path.join(segment) })
    }

    fn uri(&self) -> String {
        self.path.to_string_lossy().to_string()
    }

    fn mkdir(&self) -> Result<()> {
        std::fs::create_dir_all(&self.path)?;
        Ok(())
    }

    fn exists(&self) -> bool {
        self.path.exists()
    }

    fn remove(&self, recursive: bool) -> Result<()> {
        if !self.path.exists() {
            return Ok(());
        }
        if self.path.is_dir() {
            if recursive {
                std::fs::remove_dir_all(&self.path)?;
            } else {
                std::fs::remove_dir(&self.path)?;
            }
        } else {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }

    fn upload_str(&self, content: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, content)?;
        Ok(())
    }

    fn modified_time(&self) -> Result<DateTime<Utc>> {
        let modified = std::fs::metadata(&self.path)?.modified()?;
        Ok(DateTime::<Utc>::from(modified))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sub_and_upload() {
        let dir = TempDir::new().unwrap();
        let root: Arc<dyn Destination> = Arc::new(LocalDestination::new(dir.path()));
        let file = root.sub("meta").sub("lock.txt");
        assert!(!file.exists());
        file.upload_str("").unwrap();
        assert!(file.exists());
        assert!(file.modified_time().is_ok());
        file.remove(false).unwrap();
        assert!(!file.exists());
    }

    #[test]
    fn test_remove_recursive() {
        let dir = TempDir::new().unwrap();
        let root: Arc<dyn Destination> = Arc::new(LocalDestination::new(dir.path()));
        let sub = root.sub("delta_load");
        sub.sub("latest_pk").mkdir().unwrap();
        sub.sub("latest_pk").sub("part.parquet").upload_str("x").unwrap();
        sub.remove(true).unwrap();
        assert!(!sub.exists());
    }
}
