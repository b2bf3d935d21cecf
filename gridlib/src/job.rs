use crate::error::{Error, Result};
use crate::events::JobStatus;
use crate::types::{Args, ExitCode, JobId, Pid, Program, StreamName, Tag};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A submitted command-execution request and its lifecycle state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: JobId,
    pub command: Program,
    pub args: Args,
    pub tag: Tag,
    #[serde(default, with = "timeout_secs")]
    pub timeout: Option<Duration>,
    pub stream: Option<StreamName>,
    pub status: JobStatus,
    pub pid: Option<Pid>,
    pub exit_code: Option<ExitCode>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Job {
    /// Apply a partial update, rejecting status changes the lifecycle does not allow.
    pub fn apply(&mut self, update: &JobUpdate) -> Result<()> {
        if let Some(next) = update.status {
            if !self.status.can_transition_to(next) {
                return Err(Error::InvalidTransition {
                    from: self.status,
                    to: next,
                });
            }
            self.status = next;
        }
        if let Some(pid) = update.pid {
            self.pid = Some(pid);
        }
        if let Some(code) = update.exit_code {
            self.exit_code = Some(code);
        }
        if let Some(error) = &update.error {
            self.error = Some(error.clone());
        }
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Partial update of named job fields. Unset fields are left untouched.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub pid: Option<Pid>,
    pub exit_code: Option<ExitCode>,
    pub error: Option<String>,
}

impl JobUpdate {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn pid(pid: Pid) -> Self {
        Self {
            pid: Some(pid),
            ..Self::default()
        }
    }

    pub fn failure(status: JobStatus, error: impl ToString) -> Self {
        Self {
            status: Some(status),
            error: Some(error.to_string()),
            ..Self::default()
        }
    }

    pub fn with_exit_code(mut self, code: Option<ExitCode>) -> Self {
        self.exit_code = code;
        self
    }

    pub fn with_error(mut self, error: Option<String>) -> Self {
        self.error = error;
        self
    }
}

/// What a client hands in to create a job.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submission {
    pub command: Program,
    #[serde(default)]
    pub args: Args,
    #[serde(default)]
    pub tag: Tag,
    #[serde(default, with = "timeout_secs")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub stream: Option<StreamName>,
}

impl Submission {
    pub fn new(command: impl Into<Program>, args: Args) -> Self {
        Self {
            command: command.into(),
            args,
            tag: None,
            timeout: None,
            stream: None,
        }
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn stream(mut self, stream: impl Into<StreamName>) -> Self {
        self.stream = Some(stream.into());
        self
    }

    pub fn into_job(self) -> Job {
        self.into_job_at(Utc::now())
    }

    pub fn into_job_at(self, created_at: DateTime<Utc>) -> Job {
        Job {
            job_id: uuid::Uuid::new_v4(),
            command: self.command,
            args: self.args,
            tag: self.tag,
            timeout: self.timeout,
            stream: self.stream,
            status: JobStatus::Created,
            pid: None,
            exit_code: None,
            error: None,
            created_at,
        }
    }
}

// timeouts travel as fractional seconds
mod timeout_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, ser: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(timeout) => ser.serialize_some(&timeout.as_secs_f64()),
            None => ser.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Option<Duration>, D::Error> {
        let secs = Option::<f64>::deserialize(de)?;
        match secs {
            Some(secs) if secs.is_finite() && secs >= 0.0 => Ok(Some(Duration::from_secs_f64(secs))),
            Some(secs) => Err(serde::de::Error::custom(format!("invalid timeout {}", secs))),
            None => Ok(None),
        }
    }
}
