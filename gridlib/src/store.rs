//! Persistence boundary for job records.
//!
//! The core never manages a schema. It reads pending jobs in FIFO order and writes partial
//! updates by id; anything that can do that can back the engines. `MemoryStore` is the
//! in-process implementation used by the CLI and the tests.

use crate::error::{Error, Result};
use crate::events::JobStatus;
use crate::job::{Job, JobUpdate, Submission};
use crate::types::JobId;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert(&self, job: Job) -> Result<()>;

    async fn get(&self, job_id: JobId) -> Result<Option<Job>>;

    /// Jobs with status `created` (bound to `stream` when given), oldest first.
    async fn pending(&self, stream: Option<&str>) -> Result<Vec<Job>>;

    /// Atomically fetch the pending jobs and mark each one `enqueued`.
    async fn claim_pending(&self, stream: Option<&str>) -> Result<Vec<Job>>;

    async fn update(&self, job_id: JobId, update: JobUpdate) -> Result<()>;
}

/// Create a job from a submission and persist it.
pub async fn submit(store: &dyn JobStore, submission: Submission) -> Result<Job> {
    let job = submission.into_job();
    store.insert(job.clone()).await?;
    Ok(job)
}

/// Apply `update` to the engine's copy of the job and persist it.
///
/// Store failures are logged, never propagated: a job keeps running even if its record
/// cannot be written.
pub(crate) async fn record(store: &dyn JobStore, job: &mut Job, update: JobUpdate) {
    if let Err(err) = job.apply(&update) {
        tracing::error!(job_id = %job.job_id, error = %err, "rejected job update");
        return;
    }
    if let Err(err) = store.update(job.job_id, update).await {
        tracing::warn!(job_id = %job.job_id, error = %err, "failed to persist job update");
    }
}

struct Entry {
    seq: u64,
    job: Job,
}

#[derive(Default)]
struct Inner {
    next_seq: u64,
    jobs: HashMap<JobId, Entry>,
}

impl Inner {
    fn pending(&self, stream: Option<&str>) -> Vec<&Entry> {
        let mut entries: Vec<&Entry> = self
            .jobs
            .values()
            .filter(|entry| entry.job.status == JobStatus::Created)
            .filter(|entry| match stream {
                Some(name) => entry.job.stream.as_deref() == Some(name),
                None => true,
            })
            .collect();
        entries.sort_by_key(|entry| (entry.job.created_at, entry.seq));
        entries
    }
}

/// In-memory job table.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.jobs.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn insert(&self, job: Job) -> Result<()> {
        let mut inner = self.inner.write().await;
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.jobs.insert(job.job_id, Entry { seq, job });
        Ok(())
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>> {
        let inner = self.inner.read().await;
        Ok(inner.jobs.get(&job_id).map(|entry| entry.job.clone()))
    }

    async fn pending(&self, stream: Option<&str>) -> Result<Vec<Job>> {
        let inner = self.inner.read().await;
        Ok(inner
            .pending(stream)
            .into_iter()
            .map(|entry| entry.job.clone())
            .collect())
    }

    async fn claim_pending(&self, stream: Option<&str>) -> Result<Vec<Job>> {
        // one write lock for the whole read-modify-write
        let mut inner = self.inner.write().await;
        let ids: Vec<JobId> = inner
            .pending(stream)
            .into_iter()
            .map(|entry| entry.job.job_id)
            .collect();
        let claim = JobUpdate::status(JobStatus::Enqueued);
        let mut claimed = Vec::with_capacity(ids.len());
        for job_id in ids {
            if let Some(entry) = inner.jobs.get_mut(&job_id) {
                entry.job.apply(&claim)?;
                claimed.push(entry.job.clone());
            }
        }
        Ok(claimed)
    }

    async fn update(&self, job_id: JobId, update: JobUpdate) -> Result<()> {
        let mut inner = self.inner.write().await;
        match inner.jobs.get_mut(&job_id) {
            Some(entry) => entry.job.apply(&update),
            None => Err(Error::NotFound(job_id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn job_at(stream: &str, offset_ms: i64) -> Job {
        Submission::new("true", vec![])
            .stream(stream)
            .into_job_at(Utc::now() + Duration::milliseconds(offset_ms))
    }

    #[tokio::test]
    async fn pending_is_fifo_per_stream() {
        let store = MemoryStore::new();
        let late = job_at("a", 20);
        let early = job_at("a", 0);
        let other = job_at("b", 10);
        for job in [late.clone(), other.clone(), early.clone()] {
            store.insert(job).await.unwrap();
        }

        let pending = store.pending(Some("a")).await.unwrap();
        let ids: Vec<JobId> = pending.iter().map(|job| job.job_id).collect();
        assert_eq!(ids, vec![early.job_id, late.job_id]);

        let all = store.pending(None).await.unwrap();
        let ids: Vec<JobId> = all.iter().map(|job| job.job_id).collect();
        assert_eq!(ids, vec![early.job_id, other.job_id, late.job_id]);
    }

    #[tokio::test]
    async fn claim_marks_enqueued_once() {
        let store = MemoryStore::new();
        let job = job_at("a", 0);
        store.insert(job.clone()).await.unwrap();

        let claimed = store.claim_pending(Some("a")).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].status, JobStatus::Enqueued);
        assert!(store.claim_pending(Some("a")).await.unwrap().is_empty());

        let stored = store.get(job.job_id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Enqueued);
    }

    #[tokio::test]
    async fn update_unknown_job() {
        let store = MemoryStore::new();
        let err = store
            .update(uuid::Uuid::new_v4(), JobUpdate::status(JobStatus::Running))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn submit_persists() {
        let store = MemoryStore::new();
        let job = submit(&store, Submission::new("echo", vec!["hi".into()]))
            .await
            .unwrap();
        assert_eq!(store.get(job.job_id).await.unwrap(), Some(job));
    }
}
