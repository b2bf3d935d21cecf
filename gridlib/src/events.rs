use crate::job::Job;
use crate::types::{ExitCode, JobId, Pid};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of a job.
///
/// `Created -> Enqueued -> Running -> {Completed | Failed | Error}`. `Enqueued` is only used by
/// the streamer's persisted queue; the dispatcher and runner go straight from `Created` to
/// `Running`. A spawn failure may short-circuit from `Created` or `Enqueued` to `Error`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Created,
    Enqueued,
    Running,
    Completed,
    Failed,
    Error,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Error)
    }

    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        match self {
            Created => matches!(next, Enqueued | Running | Error),
            Enqueued => matches!(next, Running | Error),
            Running => matches!(next, Completed | Failed | Error),
            Completed | Failed | Error => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobStatus::Created => "created",
            JobStatus::Enqueued => "enqueued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Error => "error",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineData {
    pub line_no: u64,
    pub text: String,
}

/// One unit of streamed output. A line without `data` is the job's terminal event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputLine {
    pub job_id: JobId,
    pub tag: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub pid: Option<Pid>,
    pub data: Option<LineData>,
    pub exit_code: Option<ExitCode>,
}

impl OutputLine {
    pub fn line(job: &Job, line_no: u64, text: impl Into<String>) -> Self {
        Self {
            job_id: job.job_id,
            tag: job.tag.clone(),
            timestamp: Utc::now(),
            pid: job.pid,
            data: Some(LineData {
                line_no,
                text: text.into(),
            }),
            exit_code: None,
        }
    }

    pub fn terminal(job: &Job) -> Self {
        Self {
            job_id: job.job_id,
            tag: job.tag.clone(),
            timestamp: Utc::now(),
            pid: job.pid,
            data: None,
            exit_code: job.exit_code,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.data.is_none()
    }
}

/// Terminal summary of one job.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    pub job: Job,
    pub output: Vec<String>,
    pub status: JobStatus,
}

impl JobResult {
    pub fn new(job: Job, output: Vec<String>) -> Self {
        let status = job.status;
        Self {
            job,
            output,
            status,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job.job_id
    }
}

/// Exactly one of a line or a result.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStreamEvent {
    Line(OutputLine),
    Result(JobResult),
}

impl JobStreamEvent {
    pub fn job_id(&self) -> JobId {
        match self {
            JobStreamEvent::Line(line) => line.job_id,
            JobStreamEvent::Result(result) => result.job_id(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStreamEvent::Result(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Submission;

    #[test]
    fn transitions() {
        use JobStatus::*;
        assert!(Created.can_transition_to(Enqueued));
        assert!(Created.can_transition_to(Running));
        assert!(Created.can_transition_to(Error));
        assert!(!Created.can_transition_to(Completed));
        assert!(Enqueued.can_transition_to(Running));
        assert!(!Enqueued.can_transition_to(Created));
        assert!(Running.can_transition_to(Failed));
        assert!(!Running.can_transition_to(Running));
        for terminal in [Completed, Failed, Error] {
            assert!(terminal.is_terminal());
            for next in [Created, Enqueued, Running, Completed, Failed, Error] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn stream_event_is_externally_tagged() {
        let job = Submission::new("echo", vec!["hi".into()]).into_job();
        let event = JobStreamEvent::Line(OutputLine::line(&job, 0, "hi"));
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["line"]["data"]["line_no"], 0);
        assert_eq!(value["line"]["data"]["text"], "hi");
        assert!(value.get("result").is_none());

        let event = JobStreamEvent::Result(JobResult::new(job, vec![]));
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["result"]["status"], "created");
        assert!(value.get("line").is_none());
    }
}
