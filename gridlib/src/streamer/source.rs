use crate::config::{ExitPolicy, StreamerConfig};
use crate::error::Error;
use crate::events::{JobResult, JobStatus, JobStreamEvent, OutputLine};
use crate::job::{Job, JobUpdate};
use crate::process::{self, LineStream};
use crate::store::{record, JobStore};
use crate::types::JobId;
use std::sync::Arc;
use tokio::process::Child;
use tokio_stream::StreamExt;

enum State {
    Streaming { child: Child, lines: LineStream },
    Done,
}

/// Event source of one admitted job: its output lines followed by exactly one result.
pub(crate) struct JobSource {
    job: Job,
    store: Arc<dyn JobStore>,
    exit_policy: ExitPolicy,
    line_no: u64,
    state: State,
}

impl JobSource {
    /// Mark the job running and spawn its subprocess.
    ///
    /// A job that cannot be spawned is recorded as `Error` and comes back as its terminal
    /// event, so it never occupies a running slot.
    pub(crate) async fn start(
        mut job: Job,
        store: Arc<dyn JobStore>,
        config: &StreamerConfig,
    ) -> std::result::Result<Self, JobStreamEvent> {
        record(store.as_ref(), &mut job, JobUpdate::status(JobStatus::Running)).await;
        let mut child = match process::spawn(&job, config.kill_on_disconnect) {
            Ok(child) => child,
            Err(err) => {
                tracing::error!(job_id = %job.job_id, error = %err, "error spawning subprocess");
                let update = JobUpdate::failure(JobStatus::Error, Error::Spawn(err));
                record(store.as_ref(), &mut job, update).await;
                return Err(JobStreamEvent::Result(JobResult::new(job, vec![])));
            }
        };
        if let Some(pid) = child.id() {
            record(store.as_ref(), &mut job, JobUpdate::pid(pid)).await;
        }
        let lines = process::merged_lines(&mut child);
        Ok(Self {
            job,
            store,
            exit_policy: config.exit_policy,
            line_no: 0,
            state: State::Streaming { child, lines },
        })
    }

    pub(crate) fn job_id(&self) -> JobId {
        self.job.job_id
    }

    pub(crate) async fn next_event(&mut self) -> Option<JobStreamEvent> {
        let next = match &mut self.state {
            State::Done => return None,
            State::Streaming { lines, .. } => lines.next().await,
        };
        match next {
            Some(Ok(text)) => {
                let line = OutputLine::line(&self.job, self.line_no, text);
                self.line_no += 1;
                Some(JobStreamEvent::Line(line))
            }
            Some(Err(err)) => {
                tracing::error!(job_id = %self.job.job_id, error = %err, "error reading subprocess output");
                self.stop(JobUpdate::failure(JobStatus::Error, Error::Io(err)))
                    .await;
                Some(self.terminal())
            }
            None => {
                self.finish().await;
                Some(self.terminal())
            }
        }
    }

    /// Pull events until `batch_size` are collected or the job ends. The flag is true once the
    /// terminal event has been handed out.
    pub(crate) async fn next_batch(&mut self, batch_size: usize) -> (Vec<JobStreamEvent>, bool) {
        let mut batch = Vec::new();
        while batch.len() < batch_size {
            match self.next_event().await {
                Some(event) => {
                    let done = event.is_terminal();
                    batch.push(event);
                    if done {
                        return (batch, true);
                    }
                }
                None => return (batch, true),
            }
        }
        (batch, false)
    }

    /// Kill the subprocess of a job nobody is listening to anymore.
    pub(crate) async fn abandon(mut self) {
        if let State::Streaming { .. } = self.state {
            let update = JobUpdate::failure(JobStatus::Error, "stream consumer disconnected");
            self.stop(update).await;
        }
    }

    async fn finish(&mut self) {
        if let State::Streaming { mut child, lines } = std::mem::replace(&mut self.state, State::Done) {
            drop(lines);
            let update = match child.wait().await {
                Ok(status) => {
                    let (code, detail) = process::exit_outcome(status);
                    JobUpdate::status(self.exit_policy.status_for(code))
                        .with_exit_code(code)
                        .with_error(detail)
                }
                Err(err) => JobUpdate::failure(JobStatus::Error, Error::Io(err)),
            };
            record(self.store.as_ref(), &mut self.job, update).await;
        }
    }

    async fn stop(&mut self, update: JobUpdate) {
        if let State::Streaming { mut child, lines } = std::mem::replace(&mut self.state, State::Done) {
            drop(lines);
            if let Err(err) = child.kill().await {
                tracing::warn!(job_id = %self.job.job_id, error = %err, "failed to kill subprocess");
            }
            let code = child.try_wait().ok().flatten().and_then(|status| status.code());
            record(self.store.as_ref(), &mut self.job, update.with_exit_code(code)).await;
        }
    }

    fn terminal(&self) -> JobStreamEvent {
        JobStreamEvent::Result(JobResult::new(self.job.clone(), vec![]))
    }
}
