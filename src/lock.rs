//! Per-destination TTL lock
//!
//! `meta/lock.txt` is a mutex with a one-hour TTL based on its mtime: a
//! fresh lock aborts the run, a stale one is reclaimed. The lock is removed
//! on every exit path; `Drop` is the backstop for panics and early returns.

use std::sync::Arc;

use chrono::Utc;
use tracing::warn;

use crate::destination::Destination;
use crate::error::{MirrorError, Result};

/// Lock staleness threshold in seconds
pub const LOCK_TTL_SECS: i64 = 60 * 60;

/// Held lock on a destination; released explicitly or on drop
#[derive(Debug)]
pub struct LoadLock {
    file: Arc<dyn Destination>,
    released: bool,
}

impl LoadLock {
    /// Reclaim a stale lock, abort on a fresh one, then create the lock file
    pub fn acquire(file: Arc<dyn Destination>) -> Result<Self> {
        if file.exists() {
            let age = (Utc::now() - file.modified_time()?).num_seconds();
            if age >= LOCK_TTL_SECS {
                warn!(lock = %file.uri(), age_secs = age, "Reclaiming stale lock");
                file.remove(false)?;
            } else {
                return Err(MirrorError::Locked {
                    held_for_secs: age,
                    ttl_secs: LOCK_TTL_SECS,
                });
            }
        }
        file.upload_str("")?;
        Ok(Self { file, released: false })
    }

    /// Remove the lock file
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        if self.file.exists() {
            self.file.remove(false)?;
        }
        Ok(())
    }
}

impl Drop for LoadLock {
    fn drop(&mut self) {
        if !self.released && self.file.exists() {
            if let Err(e) = self.file.remove(false) {
                warn!(lock = %self.file.uri(), error = %e, "Could not remove lock file");
            }
        }
    }
}
