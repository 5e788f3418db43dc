use crate::types::Identity;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("queue is full (capacity {capacity})")]
    Full { capacity: usize },

    #[error("queue unavailable: {0}")]
    Unavailable(String),
}

#[derive(Error, Debug)]
pub enum RecorderError {
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("upstream responded with {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid header {0}")]
    InvalidHeader(String),
}

#[derive(Error, Debug)]
pub enum ListenerError {
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("listener responded with {status}")]
    Status { status: u16 },
}

/// Why a single identity group could not be forwarded.
#[derive(Error, Debug)]
pub enum GroupError {
    #[error(transparent)]
    Recorder(#[from] RecorderError),

    #[error("group task failed: {0}")]
    Task(String),
}

#[derive(Debug)]
pub struct GroupFailure {
    pub identity: Identity,
    pub error: GroupError,
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("failed to pop impressions: {0}")]
    Queue(#[from] QueueError),

    #[error("{} of {total} impression groups failed to sync: {}", .failures.len(), summarize(.failures))]
    Incomplete {
        total: usize,
        failures: Vec<GroupFailure>,
    },
}

impl SyncError {
    /// Number of groups that were not forwarded. Zero for queue failures.
    pub fn failed_groups(&self) -> usize {
        match self {
            SyncError::Queue(_) => 0,
            SyncError::Incomplete { failures, .. } => failures.len(),
        }
    }
}

#[derive(Error, Debug)]
pub enum TaskError {
    #[error("sync task is not running")]
    NotRunning,

    #[error(transparent)]
    Sync(#[from] SyncError),
}

#[derive(Error, Debug)]
pub enum BuildError {
    #[error("invalid sync config: {0}")]
    Config(#[from] crate::config::ValidationError),

    #[error("could not build recorder: {0}")]
    Recorder(#[from] RecorderError),

    #[error("could not build listener: {0}")]
    Listener(#[from] ListenerError),
}

fn summarize(failures: &[GroupFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("[{}/{}] {}", f.identity.machine_name, f.identity.sdk_version, f.error))
        .collect::<Vec<_>>()
        .join("; ")
}
