mod buffer;

pub use buffer::OutputBuffer;

use crate::config::DispatcherConfig;
use crate::error::Error;
use crate::events::{JobStatus, OutputLine};
use crate::job::{Job, JobUpdate};
use crate::process;
use crate::store::{record, JobStore};
use std::future::Future;
use std::sync::Arc;
use tokio::{sync::Semaphore, task::JoinHandle};
use tokio_stream::StreamExt;

/// A `Dispatcher` runs jobs in a bounded worker pool, fire-and-forget, and collects every
/// job's output into one shared `OutputBuffer`.
///
/// Cloning is cheap; clones share the pool and the buffer.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

struct Inner {
    config: DispatcherConfig,
    store: Arc<dyn JobStore>,
    pool: Semaphore,
    pool_size: usize,
    buffer: Arc<OutputBuffer>,
}

impl Dispatcher {
    pub fn new(config: DispatcherConfig, store: Arc<dyn JobStore>) -> Self {
        let buffer = Arc::new(OutputBuffer::new(config.buffer_capacity));
        Self::with_buffer(config, store, buffer)
    }

    /// Build a dispatcher that writes into an externally owned buffer.
    pub fn with_buffer(
        config: DispatcherConfig,
        store: Arc<dyn JobStore>,
        buffer: Arc<OutputBuffer>,
    ) -> Self {
        let pool_size = config.pool_size();
        Self {
            inner: Arc::new(Inner {
                config,
                store,
                pool: Semaphore::new(pool_size),
                pool_size,
                buffer,
            }),
        }
    }

    pub fn pool_size(&self) -> usize {
        self.inner.pool_size
    }

    pub fn buffer(&self) -> Arc<OutputBuffer> {
        self.inner.buffer.clone()
    }

    pub fn has_output(&self) -> bool {
        !self.inner.buffer.is_empty()
    }

    /// Submit a job to the pool and return immediately.
    ///
    /// Failures are recorded on the job and in the buffer, never returned. The handle resolves
    /// to the job's final state; dropping it detaches the work. Must be called from within a
    /// tokio runtime.
    pub fn dispatch(&self, job: Job) -> JoinHandle<Job> {
        let inner = self.inner.clone();
        tokio::spawn(async move { inner.execute(job).await })
    }

    /// Drain the buffer, handing each line to `callback`. Returns the number of lines consumed.
    pub fn consume<F>(&self, mut callback: F) -> usize
    where
        F: FnMut(OutputLine),
    {
        let mut consumed = 0;
        while let Some(line) = self.inner.buffer.pop() {
            callback(line);
            consumed += 1;
        }
        consumed
    }

    pub async fn consume_async<F, Fut>(&self, mut callback: F) -> usize
    where
        F: FnMut(OutputLine) -> Fut,
        Fut: Future<Output = ()>,
    {
        let mut consumed = 0;
        while let Some(line) = self.inner.buffer.pop() {
            callback(line).await;
            consumed += 1;
        }
        consumed
    }
}

impl Inner {
    async fn execute(&self, mut job: Job) -> Job {
        let _permit = self.pool.acquire().await.ok();
        let store = self.store.as_ref();

        record(store, &mut job, JobUpdate::status(JobStatus::Running)).await;
        tracing::info!(job_id = %job.job_id, command = %job.command, "spawning subprocess");

        let mut child = match process::spawn(&job, false) {
            Ok(child) => child,
            Err(err) => {
                tracing::error!(job_id = %job.job_id, error = %err, "failed to spawn subprocess");
                let update = JobUpdate::failure(JobStatus::Error, Error::Spawn(err));
                record(store, &mut job, update).await;
                self.buffer.push(OutputLine::terminal(&job)).await;
                return job;
            }
        };
        if let Some(pid) = child.id() {
            record(store, &mut job, JobUpdate::pid(pid)).await;
        }
        tracing::info!(job_id = %job.job_id, pid = ?job.pid, "running job");

        let mut read_error = None;
        {
            let mut lines = process::merged_lines(&mut child);
            let mut line_no = 0;
            while let Some(line) = lines.next().await {
                match line {
                    Ok(text) => {
                        self.buffer.push(OutputLine::line(&job, line_no, text)).await;
                        line_no += 1;
                    }
                    Err(err) => {
                        read_error = Some(err);
                        break;
                    }
                }
            }
        }
        if read_error.is_some() {
            if let Err(err) = child.start_kill() {
                tracing::warn!(job_id = %job.job_id, error = %err, "failed to kill subprocess");
            }
        }

        let update = match (read_error, child.wait().await) {
            (Some(err), waited) => {
                tracing::error!(job_id = %job.job_id, error = %err, "error reading job output");
                let code = waited.ok().and_then(|status| status.code());
                JobUpdate::failure(JobStatus::Error, Error::Io(err)).with_exit_code(code)
            }
            (None, Ok(status)) => {
                let (code, detail) = process::exit_outcome(status);
                JobUpdate::status(self.config.exit_policy.status_for(code))
                    .with_exit_code(code)
                    .with_error(detail)
            }
            (None, Err(err)) => {
                tracing::error!(job_id = %job.job_id, error = %err, "error waiting for job");
                JobUpdate::failure(JobStatus::Error, Error::Io(err))
            }
        };
        record(store, &mut job, update).await;
        tracing::info!(
            job_id = %job.job_id,
            status = %job.status,
            exit_code = ?job.exit_code,
            "job finished"
        );

        self.buffer.push(OutputLine::terminal(&job)).await;
        job
    }
}
