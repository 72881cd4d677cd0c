use std::path::PathBuf;

use chrono::NaiveDateTime;

use crate::storage::{interval::Interval, pending::PendingSession};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Everything that can go wrong while recording or reading work intervals.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("malformed log line {line:?}: {reason}")]
    MalformedLogLine { line: String, reason: String },

    #[error("invalid interval {start} - {end}: end must be after start")]
    InvalidInterval {
        start: NaiveDateTime,
        end: NaiveDateTime,
    },

    #[error("interval starting at {start} begins before the last logged interval ends ({last_end})")]
    OutOfOrderAppend {
        start: NaiveDateTime,
        last_end: NaiveDateTime,
    },

    #[error("log {} is corrupt at line {line_number}", path.display())]
    CorruptLog {
        path: PathBuf,
        line_number: usize,
        #[source]
        source: Box<Error>,
    },

    #[error("lock file {} can't be read as a pending session", path.display())]
    CorruptLock {
        path: PathBuf,
        #[source]
        source: Box<Error>,
    },

    #[error("a session is already open in {}", path.display())]
    AlreadyOpen { path: PathBuf },

    #[error("project {project} already has a running session")]
    SessionAlreadyRunning {
        project: String,
        /// `None` when the lock exists but its content couldn't be read.
        pending: Option<PendingSession>,
    },

    #[error("no open session in {}", path.display())]
    NoOpenSession { path: PathBuf },

    #[error("project {project} can't be deleted while a session is running")]
    SessionRunning { project: String },

    #[error("failed to record {interval} for project {project}, the session was kept open")]
    CorruptionDetected {
        project: String,
        interval: Interval,
        #[source]
        source: Box<Error>,
    },

    #[error("project {project} not found")]
    ProjectNotFound { project: String },

    #[error("invalid project name {name:?}: {reason}")]
    InvalidProjectName { name: String, reason: &'static str },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn malformed(line: &str, reason: impl Into<String>) -> Self {
        Self::MalformedLogLine {
            line: line.to_owned(),
            reason: reason.into(),
        }
    }
}
