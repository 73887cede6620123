//! Single-daemon lockfile at `<home>/.lock`.
//!
//! The lock holds the owner's pid. A lock whose pid no longer names a live
//! process is stale and can be taken over.

use std::path::PathBuf;

use crate::procs;
use crate::settings;

pub struct Lockfile {
    path: PathBuf,
}

impl Lockfile {
    pub fn at_home() -> Lockfile {
        Lockfile {
            path: settings::home().join(".lock"),
        }
    }

    /// The pid currently holding the lock, if that process is alive.
    pub fn holder(&self) -> Option<i32> {
        let pid: i32 = std::fs::read_to_string(&self.path)
            .ok()?
            .trim()
            .parse()
            .ok()?;
        if pid != std::process::id() as i32 && procs::pid_alive(pid) {
            Some(pid)
        } else {
            None
        }
    }

    /// Take the lock for this process. Fails when another live process
    /// holds it; stale locks are replaced.
    pub fn try_acquire(&self) -> bool {
        if self.holder().is_some() {
            return false;
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        std::fs::write(&self.path, std::process::id().to_string()).is_ok()
    }

    pub fn release(&self) {
        if let Ok(text) = std::fs::read_to_string(&self.path) {
            if text.trim() == std::process::id().to_string() {
                std::fs::remove_file(&self.path).ok();
            }
        }
    }
}

/// Whether a daemon currently holds the home lock.
pub fn running() -> bool {
    Lockfile::at_home().holder().is_some()
}

/// Acquire the home lock for this process.
pub fn try_acquire() -> bool {
    Lockfile::at_home().try_acquire()
}
