use crate::error::{panic_message, Error};
use crate::events::JobResult;
use crate::ipc::Subscription;
use crate::types::BoxError;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;

/// User hooks invoked for every job result a `Consumer` receives.
pub trait ResultHandler: Send + Sync + 'static {
    fn on_result(&self, result: &JobResult) -> Result<(), BoxError>;

    /// Called when `on_result` fails or panics.
    fn on_exception(&self, error: &Error) -> Result<(), BoxError> {
        let _ = error;
        Ok(())
    }
}

impl<F> ResultHandler for F
where
    F: Fn(&JobResult) -> Result<(), BoxError> + Send + Sync + 'static,
{
    fn on_result(&self, result: &JobResult) -> Result<(), BoxError> {
        self(result)
    }
}

type Output = Arc<Mutex<VecDeque<JobResult>>>;

/// Drains a result subscription in the background, handing every result to a `ResultHandler`.
///
/// A failing handler is logged and reported through `on_exception`; it never stops the loop.
pub struct Consumer {
    output: Option<Output>,
    task: JoinHandle<()>,
}

impl Consumer {
    /// Start consuming. With `keep_output` the results are also retained for `drain`.
    pub fn spawn<H: ResultHandler>(
        subscription: Subscription<JobResult>,
        handler: H,
        keep_output: bool,
    ) -> Self {
        let output: Option<Output> = keep_output.then(Arc::default);
        let task = tokio::spawn(consume(subscription, handler, output.clone()));
        Self { output, task }
    }

    /// Take every retained result, oldest first. Always empty without `keep_output`.
    pub fn drain(&self) -> Vec<JobResult> {
        match &self.output {
            Some(output) => output
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .drain(..)
                .collect(),
            None => vec![],
        }
    }

    pub async fn shutdown(mut self) {
        self.task.abort();
        let _ = (&mut self.task).await;
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn consume<H: ResultHandler>(
    mut subscription: Subscription<JobResult>,
    handler: H,
    output: Option<Output>,
) {
    while let Some(result) = subscription.recv().await {
        if let Some(output) = &output {
            output
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push_back(result.clone());
        }

        let message = match catch_unwind(AssertUnwindSafe(|| handler.on_result(&result))) {
            Ok(Ok(())) => continue,
            Ok(Err(err)) => err.to_string(),
            Err(panic) => panic_message(panic.as_ref()),
        };
        tracing::error!(job_id = %result.job_id(), error = %message, "error while handling job result");

        let error = Error::Callback {
            job_id: result.job_id(),
            message,
        };
        match catch_unwind(AssertUnwindSafe(|| handler.on_exception(&error))) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::warn!(error = %err, "exception handler failed"),
            Err(panic) => {
                tracing::warn!(error = %panic_message(panic.as_ref()), "exception handler panicked")
            }
        }
    }
}
