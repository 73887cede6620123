//! OS process helpers: liveness checks, signals, and orphan cleanup.
//!
//! Child processes are tagged with the `GOSU_NS` environment variable. On
//! daemon startup, any tagged process whose parent is gone belongs to a
//! previous session and is killed.

#[cfg(unix)]
pub use unix::*;

#[cfg(unix)]
mod unix {
    pub fn pid_alive(pid: i32) -> bool {
        if pid <= 0 {
            return false;
        }
        let rc = unsafe { libc::kill(pid, 0) };
        rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }

    pub fn interrupt(pid: i32) {
        unsafe {
            libc::kill(pid, libc::SIGINT);
        }
    }

    pub fn kill(pid: i32) {
        unsafe {
            libc::kill(pid, libc::SIGKILL);
        }
    }

    fn parent_of(pid: i32) -> Option<i32> {
        let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
        // Fields after the parenthesized comm: state, then ppid.
        let (_, rest) = stat.rsplit_once(')')?;
        let mut fields = rest.split_whitespace();
        fields.next()?;
        fields.next()?.parse().ok()
    }

    /// Kill processes tagged with `GOSU_NS` whose parent has exited. Run at
    /// session start to clean up after a crashed daemon.
    pub fn kill_orphans() {
        let own = std::process::id() as i32;
        let Ok(entries) = std::fs::read_dir("/proc") else {
            return;
        };
        for entry in entries.flatten() {
            let Some(pid) = entry
                .file_name()
                .to_str()
                .and_then(|n| n.parse::<i32>().ok())
            else {
                continue;
            };
            if pid == own {
                continue;
            }
            let Ok(environ) = std::fs::read(format!("/proc/{pid}/environ")) else {
                continue;
            };
            let tagged = environ
                .split(|b| *b == 0)
                .any(|var| var.starts_with(b"GOSU_NS="));
            if !tagged {
                continue;
            }
            if let Some(ppid) = parent_of(pid) {
                if pid_alive(ppid) && ppid != 1 {
                    continue;
                }
            }
            tracing::info!(pid, "killing orphaned child process");
            kill(pid);
        }
    }
}

#[cfg(not(unix))]
mod fallback {
    pub fn pid_alive(_pid: i32) -> bool {
        false
    }

    pub fn interrupt(_pid: i32) {}

    pub fn kill(_pid: i32) {}

    pub fn kill_orphans() {}
}

#[cfg(not(unix))]
pub use fallback::*;
