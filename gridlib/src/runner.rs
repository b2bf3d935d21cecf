use crate::config::RunnerConfig;
use crate::error::Error;
use crate::events::{JobResult, JobStatus};
use crate::job::{Job, JobUpdate};
use crate::process;
use crate::store::{record, JobStore};
use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::process::Child;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;

type Captured = Arc<Mutex<Vec<String>>>;

/// Runs exactly one job to completion and returns its aggregated result.
pub struct Runner {
    config: RunnerConfig,
    store: Arc<dyn JobStore>,
}

impl Runner {
    pub fn new(config: RunnerConfig, store: Arc<dyn JobStore>) -> Self {
        Self { config, store }
    }

    /// Spawn the job, wait for it (at most `job.timeout`), and collect its merged output.
    ///
    /// Every failure is recorded on the returned job; nothing is raised.
    pub async fn run(&self, mut job: Job) -> JobResult {
        let store = self.store.as_ref();
        record(store, &mut job, JobUpdate::status(JobStatus::Running)).await;

        let mut child = match process::spawn(&job, self.config.kill_on_timeout) {
            Ok(child) => child,
            Err(err) => {
                tracing::error!(job_id = %job.job_id, error = %err, "error spawning subprocess");
                let update = JobUpdate::failure(JobStatus::Error, Error::Spawn(err));
                record(store, &mut job, update).await;
                return JobResult::new(job, vec![]);
            }
        };
        if let Some(pid) = child.id() {
            record(store, &mut job, JobUpdate::pid(pid)).await;
        }

        let captured: Captured = Arc::default();
        let mut reader = capture(&mut child, captured.clone());

        // the deadline covers the exit and the end of its output, grandchildren may hold the pipes
        let finished = async {
            let status = child.wait().await?;
            Ok::<_, io::Error>((status, (&mut reader).await))
        };
        let outcome = match job.timeout {
            Some(timeout) => tokio::time::timeout(timeout, finished).await.ok(),
            None => Some(finished.await),
        };

        match outcome {
            None => {
                let timeout = job.timeout.unwrap_or_default();
                tracing::warn!(job_id = %job.job_id, ?timeout, "job timed out");
                let exited = child.try_wait().ok().flatten();
                if self.config.kill_on_timeout {
                    if exited.is_none() {
                        if let Err(err) = child.kill().await {
                            tracing::warn!(job_id = %job.job_id, error = %err, "failed to kill job");
                        }
                    }
                    reader.abort();
                } else if exited.is_none() {
                    tokio::spawn(async move {
                        let _ = child.wait().await;
                    });
                }
                let update = JobUpdate::failure(JobStatus::Failed, Error::Timeout(timeout))
                    .with_exit_code(exited.and_then(|status| status.code()));
                record(store, &mut job, update).await;
            }
            Some(Ok((status, read))) => {
                let (code, detail) = process::exit_outcome(status);
                let update = match read {
                    Ok(Ok(())) => JobUpdate::status(self.config.exit_policy.status_for(code))
                        .with_exit_code(code)
                        .with_error(detail),
                    Ok(Err(err)) => {
                        tracing::error!(job_id = %job.job_id, error = %err, "error reading job output");
                        JobUpdate::failure(JobStatus::Error, Error::Io(err)).with_exit_code(code)
                    }
                    Err(err) => JobUpdate::failure(JobStatus::Error, err).with_exit_code(code),
                };
                record(store, &mut job, update).await;
            }
            Some(Err(err)) => {
                tracing::error!(job_id = %job.job_id, error = %err, "error in subprocess");
                reader.abort();
                let update = JobUpdate::failure(JobStatus::Error, Error::Io(err));
                record(store, &mut job, update).await;
            }
        }

        let output = captured
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        JobResult::new(job, output)
    }
}

/// Copy the child's merged output into `captured` as it arrives.
fn capture(child: &mut Child, captured: Captured) -> JoinHandle<io::Result<()>> {
    let mut lines = process::merged_lines(child);
    tokio::spawn(async move {
        while let Some(line) = lines.next().await {
            let line = line?;
            captured
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(line);
        }
        Ok(())
    })
}
