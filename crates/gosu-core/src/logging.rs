//! Per-job output logging.
//!
//! Each job owns a [`JobLogger`] that prefixes lines with a namespace and
//! writes them to configurable stdout/stderr sinks: the default daemon
//! streams, a named file, `"null"` to discard, or `"merge"` to fold stderr
//! into stdout. Workers fork the logger per child, extending the namespace.
//!
//! A process-wide hook set observes every formatted line; hooks must be
//! non-blocking. The daemon's `/logs` stream and the foreground daemon
//! console both attach through hooks.

use std::collections::HashMap;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Mutex, RwLock};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    pub fn name(self) -> &'static str {
        match self {
            Stream::Stdout => "stdout",
            Stream::Stderr => "stderr",
        }
    }
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Log configuration carried by a job manifest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogOptions {
    /// File for stdout; `"null"` discards.
    #[serde(rename = "stdout", skip_serializing_if = "String::is_empty")]
    pub output: String,
    /// File for stderr; `"null"` discards, `"merge"` folds into stdout.
    #[serde(rename = "stderr", skip_serializing_if = "String::is_empty")]
    pub error: String,
    /// Timestamp format (chrono strftime) prepended to each line.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub log_time: String,
    /// Namespace prepended to log lines; defaults to the job id.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub log_name: String,
    /// Width reserved for the namespace prefix.
    #[serde(skip_serializing_if = "is_zero")]
    pub pfx_width: usize,
}

fn is_zero(v: &usize) -> bool {
    *v == 0
}

#[derive(Clone)]
enum Sink {
    Console(Stream),
    File(Arc<Mutex<File>>),
    Null,
}

struct Shared {
    sinks: [Sink; 2],
    paths: [Option<PathBuf>; 2],
    timestamp: String,
    pfx_width: usize,
}

/// A namespaced line logger for one job (or one worker subtree).
#[derive(Clone)]
pub struct JobLogger {
    shared: Arc<Shared>,
    namespace: String,
    prefix: String,
}

impl JobLogger {
    /// Logger writing to the daemon's own stdout/stderr, no namespace.
    pub fn console() -> JobLogger {
        JobLogger {
            shared: Arc::new(Shared {
                sinks: [Sink::Console(Stream::Stdout), Sink::Console(Stream::Stderr)],
                paths: [None, None],
                timestamp: String::new(),
                pfx_width: 0,
            }),
            namespace: String::new(),
            prefix: String::new(),
        }
    }

    /// Build a logger from manifest options, opening output files as needed.
    pub fn new(prev: Option<&JobLogger>, opts: &LogOptions) -> std::io::Result<JobLogger> {
        let console = JobLogger::console();
        let prev = prev.unwrap_or(&console);

        let mut pfx_width = opts.pfx_width;
        if pfx_width == 0 {
            pfx_width = prev.shared.pfx_width;
            if pfx_width == 0 {
                pfx_width = prev.namespace.len().max(10);
            }
        }

        let open = |path: &str| -> std::io::Result<Sink> {
            Ok(Sink::File(Arc::new(Mutex::new(
                OpenOptions::new().create(true).append(true).open(path)?,
            ))))
        };

        let mut sinks = prev.shared.sinks.clone();
        let mut paths = prev.shared.paths.clone();
        if !opts.output.is_empty() {
            if opts.output == "null" {
                sinks[0] = Sink::Null;
            } else {
                sinks[0] = open(&opts.output)?;
                paths[0] = Some(PathBuf::from(&opts.output));
            }
        }
        if !opts.error.is_empty() {
            match opts.error.as_str() {
                "null" => sinks[1] = Sink::Null,
                "merge" => {
                    sinks[1] = sinks[0].clone();
                    paths[1] = paths[0].clone();
                }
                path => {
                    sinks[1] = open(path)?;
                    paths[1] = Some(PathBuf::from(path));
                }
            }
        }

        let timestamp = if opts.log_time.is_empty() {
            prev.shared.timestamp.clone()
        } else {
            opts.log_time.clone()
        };

        let shared = Arc::new(Shared {
            sinks,
            paths,
            timestamp,
            pfx_width,
        });
        Ok(JobLogger {
            shared,
            namespace: prev.namespace.clone(),
            prefix: String::new(),
        }
        .fork(&opts.log_name))
    }

    /// Extend the namespace by one segment; an empty segment is a no-op.
    pub fn fork(&self, ns: &str) -> JobLogger {
        let mut out = self.clone();
        if !ns.is_empty() {
            out.namespace = if self.namespace.is_empty() {
                ns.to_string()
            } else {
                format!("{}/{}", self.namespace, ns)
            };
        }
        out.prefix = out.compute_prefix();
        out
    }

    fn compute_prefix(&self) -> String {
        if self.namespace.is_empty() {
            return String::new();
        }
        let mut prefix = self.namespace.clone();
        let width = self.shared.pfx_width;
        if width != 0 {
            let limit = width + 3;
            if prefix.len() > limit {
                prefix = format!("...{}", &prefix[prefix.len() - width..]);
            }
            if prefix.len() < limit {
                prefix.push_str(&" ".repeat(limit - prefix.len()));
            }
        }
        prefix.push_str(" | ");
        prefix
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn path(&self, stream: Stream) -> Option<&PathBuf> {
        self.shared.paths[stream as usize].as_ref()
    }

    /// Write one line to the given stream: prefix it, broadcast it to the
    /// hooks, and append it to the sink.
    pub fn write_line(&self, stream: Stream, text: &str) {
        let mut line = String::new();
        if !self.shared.timestamp.is_empty() {
            line.push_str(&chrono::Local::now().format(&self.shared.timestamp).to_string());
        }
        line.push_str(&self.prefix);
        line.push_str(text.trim_end_matches('\n'));
        line.push('\n');

        broadcast(&self.namespace, &line, stream);

        match &self.shared.sinks[stream as usize] {
            Sink::Console(target) => {
                let _ = match target {
                    Stream::Stdout => std::io::stdout().write_all(line.as_bytes()),
                    Stream::Stderr => std::io::stderr().write_all(line.as_bytes()),
                };
            }
            Sink::File(file) => {
                let _ = file.lock().unwrap().write_all(line.as_bytes());
            }
            Sink::Null => {}
        }
    }

    pub fn line(&self, text: impl fmt::Display) {
        self.write_line(Stream::Stdout, &text.to_string());
    }

    pub fn error_line(&self, text: impl fmt::Display) {
        self.write_line(Stream::Stderr, &text.to_string());
    }

    /// Last `n` lines of the file behind `stream`, if it is file-backed.
    pub fn tail(&self, n: usize, stream: Stream) -> std::io::Result<Vec<String>> {
        let path = self.path(stream).ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "stream is not file-backed")
        })?;
        let text = std::fs::read_to_string(path)?;
        let lines: Vec<&str> = text.lines().collect();
        let start = lines.len().saturating_sub(n);
        Ok(lines[start..].iter().map(|s| s.to_string()).collect())
    }
}

// ------------------------------------------------------------------
// Hooks
// ------------------------------------------------------------------

/// Observer of every formatted log line. Implementations must not block.
pub trait LogHook: Send + Sync {
    fn write(&self, namespace: &str, line: &str, stream: Stream);
}

static HOOKS: LazyLock<RwLock<HashMap<u64, Arc<dyn LogHook>>>> =
    LazyLock::new(|| RwLock::new(HashMap::new()));
static HOOK_SEQ: AtomicU64 = AtomicU64::new(1);

fn broadcast(ns: &str, line: &str, stream: Stream) {
    for hook in HOOKS.read().unwrap().values() {
        hook.write(ns, line, stream);
    }
}

/// Attach a hook; it detaches when the guard drops.
pub fn register_hook(hook: Arc<dyn LogHook>) -> HookGuard {
    let id = HOOK_SEQ.fetch_add(1, Ordering::Relaxed);
    HOOKS.write().unwrap().insert(id, hook);
    HookGuard { id }
}

pub struct HookGuard {
    id: u64,
}

impl Drop for HookGuard {
    fn drop(&mut self) {
        HOOKS.write().unwrap().remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fork_builds_namespace() {
        let root = JobLogger::console();
        let web = root.fork("web");
        let child = web.fork("0");
        assert_eq!(web.namespace(), "web");
        assert_eq!(child.namespace(), "web/0");
    }

    #[test]
    fn file_sink_and_tail() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("job.log");
        let logger = JobLogger::new(
            None,
            &LogOptions {
                output: out.to_string_lossy().into_owned(),
                log_name: "job".into(),
                ..Default::default()
            },
        )
        .unwrap();

        logger.line("first");
        logger.line("second");
        logger.line("third");

        let tail = logger.tail(2, Stream::Stdout).unwrap();
        assert_eq!(tail.len(), 2);
        assert!(tail[0].contains("second"));
        assert!(tail[1].contains("third"));
        assert!(tail[0].contains("job"));
    }

    #[test]
    fn merge_folds_stderr_into_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("merged.log");
        let logger = JobLogger::new(
            None,
            &LogOptions {
                output: out.to_string_lossy().into_owned(),
                error: "merge".into(),
                log_name: "m".into(),
                ..Default::default()
            },
        )
        .unwrap();
        logger.error_line("oops");
        let text = std::fs::read_to_string(&out).unwrap();
        assert!(text.contains("oops"));
    }

    #[test]
    fn null_discards() {
        let logger = JobLogger::new(
            None,
            &LogOptions {
                output: "null".into(),
                error: "null".into(),
                log_name: "quiet".into(),
                ..Default::default()
            },
        )
        .unwrap();
        logger.line("nobody sees this");
    }

    #[test]
    fn hooks_observe_lines() {
        struct Capture(Mutex<Vec<(String, String)>>);
        impl LogHook for Capture {
            fn write(&self, ns: &str, line: &str, _stream: Stream) {
                self.0.lock().unwrap().push((ns.into(), line.into()));
            }
        }

        let capture = Arc::new(Capture(Mutex::new(Vec::new())));
        let guard = register_hook(capture.clone());

        let logger = JobLogger::console().fork("hooked");
        logger.line("ping");

        {
            let seen = capture.0.lock().unwrap();
            assert!(seen
                .iter()
                .any(|(ns, line)| ns == "hooked" && line.contains("ping")));
        }

        drop(guard);
        logger.line("pong");
        let seen = capture.0.lock().unwrap();
        assert!(!seen.iter().any(|(_, line)| line.contains("pong")));
    }
}
