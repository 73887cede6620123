//! Work status taxonomy and status-as-error semantics.
//!
//! A [`Status`] is a small enumerated code carrying three independent flag
//! bits: whether the work is alive, whether it is transitioning between
//! stable states, and whether it terminated in error. Status values double
//! as error identities: a worker's terminal state is always expressible as a
//! [`Cause`], which pairs a status with an optional human-readable detail.

use std::fmt;
use std::sync::Arc;

use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

/// Status code for a unit of work.
///
/// The low bits are an ordinal; the high bits are flags. A status is
/// `Alive` while a process/task exists, `Transition` while moving between
/// stable states, and `Error` when it names a terminal failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Status {
    Idle = 0x00,
    Complete = 0x01,
    Cancelled = 0x02,
    Starting = 0x63,
    Stopping = 0x64,
    Running = 0x45,
    Retrying = 0x46,
    Errored = 0x87,
    TimeoutStop = 0x88,
    TimeoutStart = 0x89,
    TimeoutExec = 0x8a,
}

impl Status {
    pub const FLAG_TRANSITION: u8 = 0x20;
    pub const FLAG_ALIVE: u8 = 0x40;
    pub const FLAG_ERROR: u8 = 0x80;

    const ALL: [Status; 11] = [
        Status::Idle,
        Status::Complete,
        Status::Cancelled,
        Status::Starting,
        Status::Stopping,
        Status::Running,
        Status::Retrying,
        Status::Errored,
        Status::TimeoutStop,
        Status::TimeoutStart,
        Status::TimeoutExec,
    ];

    pub fn is_transition(self) -> bool {
        (self as u8) & Self::FLAG_TRANSITION != 0
    }

    pub fn is_alive(self) -> bool {
        (self as u8) & Self::FLAG_ALIVE != 0
    }

    pub fn is_dead(self) -> bool {
        !self.is_alive()
    }

    pub fn is_error(self) -> bool {
        (self as u8) & Self::FLAG_ERROR != 0
    }

    /// Short name used for marshaling and display.
    pub fn name(self) -> &'static str {
        match self {
            Status::Idle => "idle",
            Status::Complete => "complete",
            Status::Cancelled => "cancelled",
            Status::Starting => "starting",
            Status::Stopping => "stopping",
            Status::Running => "running",
            Status::Retrying => "retrying",
            Status::Errored => "errored",
            Status::TimeoutStop => "timeout-stop",
            Status::TimeoutStart => "timeout-start",
            Status::TimeoutExec => "timeout-exec",
        }
    }

    pub fn icon(self) -> &'static str {
        match self {
            Status::Idle => "➖",
            Status::Complete => "✔️",
            Status::Cancelled => "🚫",
            Status::Starting => "🚀",
            Status::Stopping => "👋",
            Status::Running => "🟢",
            Status::Retrying => "💤",
            Status::Errored => "🔴",
            Status::TimeoutStop | Status::TimeoutStart | Status::TimeoutExec => "🕛",
        }
    }

    /// Error text for error statuses; the plain name otherwise.
    pub fn error_text(self) -> &'static str {
        if !self.is_error() {
            return self.name();
        }
        match self {
            Status::Errored => "task errored",
            Status::TimeoutStop => "task timed out during exit",
            Status::TimeoutStart => "task timed out during launch",
            Status::TimeoutExec => "task execution timed out",
            _ => self.name(),
        }
    }

    /// Recover a status from its raw byte; unknown bytes map to `Idle`.
    /// Used by workers that publish their live state through an atomic.
    pub fn from_byte(byte: u8) -> Status {
        Self::ALL
            .into_iter()
            .find(|s| *s as u8 == byte)
            .unwrap_or(Status::Idle)
    }

    /// Look up a status by its short name. Unknown names map to `Idle`.
    pub fn from_name(name: &str) -> Status {
        Self::ALL
            .into_iter()
            .find(|s| s.name() == name)
            .unwrap_or(Status::Idle)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_error() {
            f.write_str(self.error_text())
        } else {
            f.write_str(self.name())
        }
    }
}

impl std::error::Error for Status {}

impl Serialize for Status {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

impl<'de> Deserialize<'de> for Status {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(Status::from_name(&name))
    }
}

/// Terminal cause of a unit of work: a status plus optional detail text.
///
/// Causes are the error currency of the worker tree. Every cancellation
/// carries one, and the first cause installed into a scope defines the
/// terminal status. The `non_retriable` marker suppresses the retry
/// supervisor after composed failures.
#[derive(Debug, Clone)]
pub struct Cause {
    status: Status,
    detail: Option<Arc<str>>,
    non_retriable: bool,
}

impl Cause {
    pub const fn of(status: Status) -> Cause {
        Cause {
            status,
            detail: None,
            non_retriable: false,
        }
    }

    /// Successful completion.
    pub const fn complete() -> Cause {
        Cause::of(Status::Complete)
    }

    /// An `Errored` cause carrying the given detail text.
    pub fn errored(detail: impl fmt::Display) -> Cause {
        Cause {
            status: Status::Errored,
            detail: Some(detail.to_string().into()),
            non_retriable: false,
        }
    }

    /// Attach detail text to this cause.
    pub fn with_detail(mut self, detail: impl fmt::Display) -> Cause {
        self.detail = Some(detail.to_string().into());
        self
    }

    /// Mark this cause as non-retriable, preventing a retry supervisor from
    /// re-running the work that produced it.
    pub fn non_retriable(mut self) -> Cause {
        self.non_retriable = true;
        self
    }

    /// Classify an arbitrary task result.
    ///
    /// `Ok` maps to `Complete`; a `Cause` keeps its own status. This is the
    /// single place where unrecognized failures become `Errored`.
    pub fn of_result(result: &Result<(), Cause>) -> Status {
        match result {
            Ok(()) => Status::Complete,
            Err(cause) => cause.status,
        }
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn detail(&self) -> Option<&str> {
        self.detail.as_deref()
    }

    pub fn is_ok(&self) -> bool {
        self.status == Status::Complete
    }

    pub fn is_non_retriable(&self) -> bool {
        self.non_retriable
    }

    /// The full error text: for error statuses, the status error text plus
    /// the detail, if any; the bare status name otherwise.
    pub fn error_text(&self) -> String {
        if !self.status.is_error() {
            return self.status.name().to_string();
        }
        match &self.detail {
            Some(detail) => format!("{}: {detail}", self.status.error_text()),
            None => self.status.error_text().to_string(),
        }
    }
}

impl fmt::Display for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.error_text())
    }
}

impl std::error::Error for Cause {}

impl From<Status> for Cause {
    fn from(status: Status) -> Cause {
        Cause::of(status)
    }
}

impl PartialEq<Status> for Cause {
    fn eq(&self, other: &Status) -> bool {
        self.status == *other
    }
}

impl PartialEq for Cause {
    fn eq(&self, other: &Cause) -> bool {
        self.status == other.status && self.detail == other.detail
    }
}

/// Result of running a task or worker to termination.
pub type TaskResult = Result<(), Cause>;
