use crate::events::JobStatus;
use crate::types::JobId;
use std::{io, path::PathBuf, result, time::Duration};
use thiserror;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to spawn subprocess: {0}")]
    Spawn(#[source] io::Error),
    #[error("subprocess i/o failed: {0}")]
    Io(#[from] io::Error),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("invalid status transition {from} -> {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },
    #[error("no such job: {0}")]
    NotFound(JobId),
    #[error("job store failed: {0}")]
    Store(String),
    #[error("failed to bind {path:?}: {source}")]
    Bind {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("protocol version mismatch (expected {expected}, found {found})")]
    VersionMismatch { expected: u16, found: u16 },
    #[error("channel closed")]
    ChannelClosed,
    #[error("callback failed for job {job_id}: {message}")]
    Callback { job_id: JobId, message: String },
}

pub type Result<T> = result::Result<T, Error>;

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "callback panicked".to_string()
    }
}
