use crate::events::OutputLine;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::Semaphore;

/// Bounded FIFO of output lines shared by every job of a dispatcher.
///
/// Many workers append, one or more consumers drain. A worker that finds the buffer full
/// waits for a slot; consumers never wait.
pub struct OutputBuffer {
    queue: Mutex<VecDeque<OutputLine>>,
    slots: Semaphore,
    capacity: usize,
}

impl OutputBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            queue: Mutex::new(VecDeque::new()),
            slots: Semaphore::new(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.queue().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue().is_empty()
    }

    /// Append a line, waiting for room if the buffer is full.
    pub async fn push(&self, line: OutputLine) {
        match self.slots.acquire().await {
            Ok(permit) => permit.forget(),
            // the semaphore is never closed
            Err(_) => return,
        }
        self.queue().push_back(line);
    }

    /// Append a line if there is room for it.
    pub fn try_push(&self, line: OutputLine) -> bool {
        match self.slots.try_acquire() {
            Ok(permit) => {
                permit.forget();
                self.queue().push_back(line);
                true
            }
            Err(_) => false,
        }
    }

    pub fn pop(&self) -> Option<OutputLine> {
        let line = self.queue().pop_front();
        if line.is_some() {
            self.slots.add_permits(1);
        }
        line
    }

    fn queue(&self) -> MutexGuard<'_, VecDeque<OutputLine>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Submission;

    #[tokio::test]
    async fn bounded_fifo() {
        let job = Submission::new("true", vec![]).into_job();
        let buffer = OutputBuffer::new(2);
        assert!(buffer.try_push(OutputLine::line(&job, 0, "a")));
        buffer.push(OutputLine::line(&job, 1, "b")).await;
        assert!(!buffer.try_push(OutputLine::line(&job, 2, "c")));
        assert_eq!(buffer.len(), 2);

        let first = buffer.pop().unwrap();
        assert_eq!(first.data.unwrap().text, "a");
        assert!(buffer.try_push(OutputLine::terminal(&job)));

        assert_eq!(buffer.pop().unwrap().data.unwrap().text, "b");
        assert!(buffer.pop().unwrap().is_terminal());
        assert!(buffer.pop().is_none());
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn full_buffer_waits_for_consumer() {
        let job = Submission::new("true", vec![]).into_job();
        let buffer = std::sync::Arc::new(OutputBuffer::new(1));
        buffer.push(OutputLine::line(&job, 0, "a")).await;

        let producer = {
            let buffer = buffer.clone();
            let job = job.clone();
            tokio::spawn(async move { buffer.push(OutputLine::line(&job, 1, "b")).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!producer.is_finished());

        assert!(buffer.pop().is_some());
        producer.await.unwrap();
        assert_eq!(buffer.pop().unwrap().data.unwrap().line_no, 1);
    }
}
