//! Process-tree resource sampling.
//!
//! Builds a [`Report`] for the tree rooted at one pid by walking `/proc`:
//! a single scan collects every process's parent, CPU tick counters, RSS,
//! and start time, then the tree is accumulated depth-first. Non-Linux
//! platforms report nothing.

#[cfg(target_os = "linux")]
pub use linux::inspect_process;

#[cfg(target_os = "linux")]
mod linux {
    use std::collections::HashMap;

    use chrono::{DateTime, TimeZone, Utc};
    use gosu_types::Report;

    struct ProcStat {
        ppid: i32,
        cpu_ticks: u64,
        start_ticks: u64,
        rss_bytes: u64,
        uid: u32,
    }

    fn clock_ticks_per_sec() -> f64 {
        let hz = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
        if hz > 0 {
            hz as f64
        } else {
            100.0
        }
    }

    fn page_size() -> u64 {
        let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if sz > 0 {
            sz as u64
        } else {
            4096
        }
    }

    fn read_stat(pid: i32) -> Option<ProcStat> {
        let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
        let (_, rest) = stat.rsplit_once(')')?;
        let fields: Vec<&str> = rest.split_whitespace().collect();
        // rest[0] = state, [1] = ppid, [11] = utime, [12] = stime,
        // [19] = starttime, [21] = rss pages.
        let ppid = fields.get(1)?.parse().ok()?;
        let utime: u64 = fields.get(11)?.parse().ok()?;
        let stime: u64 = fields.get(12)?.parse().ok()?;
        let start_ticks: u64 = fields.get(19)?.parse().ok()?;
        let rss_pages: i64 = fields.get(21)?.parse().ok()?;

        let uid = std::fs::metadata(format!("/proc/{pid}"))
            .map(|m| {
                use std::os::unix::fs::MetadataExt;
                m.uid()
            })
            .unwrap_or(0);

        Some(ProcStat {
            ppid,
            cpu_ticks: utime + stime,
            start_ticks,
            rss_bytes: rss_pages.max(0) as u64 * page_size(),
            uid,
        })
    }

    fn boot_time() -> Option<i64> {
        let stat = std::fs::read_to_string("/proc/stat").ok()?;
        stat.lines()
            .find_map(|line| line.strip_prefix("btime "))
            .and_then(|v| v.trim().parse().ok())
    }

    fn username_for(uid: u32) -> String {
        let Ok(passwd) = std::fs::read_to_string("/etc/passwd") else {
            return uid.to_string();
        };
        for line in passwd.lines() {
            let mut parts = line.split(':');
            let name = parts.next().unwrap_or("");
            parts.next();
            if parts.next().and_then(|u| u.parse::<u32>().ok()) == Some(uid) {
                return name.to_string();
            }
        }
        uid.to_string()
    }

    fn start_time(stat: &ProcStat, hz: f64) -> Option<DateTime<Utc>> {
        let boot = boot_time()?;
        let secs = boot + (stat.start_ticks as f64 / hz) as i64;
        Utc.timestamp_opt(secs, 0).single()
    }

    /// Snapshot the process tree rooted at `root`.
    pub fn inspect_process(root: i32) -> Report {
        let mut report = Report::default();
        if root <= 0 {
            return report;
        }

        let Ok(entries) = std::fs::read_dir("/proc") else {
            return report;
        };
        let mut stats: HashMap<i32, ProcStat> = HashMap::new();
        let mut children: HashMap<i32, Vec<i32>> = HashMap::new();
        for entry in entries.flatten() {
            let Some(pid) = entry
                .file_name()
                .to_str()
                .and_then(|n| n.parse::<i32>().ok())
            else {
                continue;
            };
            if let Some(stat) = read_stat(pid) {
                children.entry(stat.ppid).or_default().push(pid);
                stats.insert(pid, stat);
            }
        }
        if !stats.contains_key(&root) {
            return report;
        }

        let hz = clock_ticks_per_sec();
        let now = Utc::now();
        let mut queue = vec![root];
        while let Some(pid) = queue.pop() {
            if report.pid.contains(&pid) {
                continue;
            }
            let Some(stat) = stats.get(&pid) else {
                continue;
            };
            report.pid.push(pid);
            report.mem += stat.rss_bytes as f64;

            if let Some(started) = start_time(stat, hz) {
                let elapsed = (now - started).num_milliseconds().max(1) as f64 / 1000.0;
                report.cpu += (stat.cpu_ticks as f64 / hz) / elapsed * 100.0;
                if report.create_time.is_none() {
                    report.create_time = Some(started);
                }
            }
            if report.username.is_empty() {
                report.username = username_for(stat.uid);
            }
            if let Some(kids) = children.get(&pid) {
                queue.extend(kids.iter().copied());
            }
        }
        report
    }
}

#[cfg(not(target_os = "linux"))]
pub fn inspect_process(_root: i32) -> gosu_types::Report {
    gosu_types::Report::default()
}
