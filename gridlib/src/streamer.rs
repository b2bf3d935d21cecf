//! Multiplexes the output of many concurrently running jobs of one named stream.
//!
//! Jobs are claimed from the store in FIFO order, at most `max_concurrency` of them run at
//! once, and their events are pulled in a fixed rotation, one batch per job per turn. Each
//! batch is encoded as a JSON array of `JobStreamEvent`s and handed to the transport.

mod source;

use crate::config::StreamerConfig;
use crate::error::Result;
use crate::events::{JobStatus, JobStreamEvent};
use crate::job::{Job, JobUpdate};
use crate::store::{record, JobStore};
use crate::types::{Frame, JobId, StreamName};
use source::JobSource;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

/// The transport stopped pulling batches.
struct Disconnected;

pub struct Streamer {
    name: StreamName,
    store: Arc<dyn JobStore>,
    config: StreamerConfig,
    queue: VecDeque<Job>,
    active: Vec<JobSource>,
}

impl Streamer {
    pub fn new(store: Arc<dyn JobStore>, name: impl Into<StreamName>, mut config: StreamerConfig) -> Self {
        config.batch_size = config.batch_size.max(1);
        config.max_concurrency = config.max_concurrency.max(1);
        config.channel_capacity = config.channel_capacity.max(1);
        Self {
            name: name.into(),
            store,
            config,
            queue: VecDeque::new(),
            active: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stream encoded batches until every pending job of the stream has finished.
    ///
    /// Dropping the returned stream counts as a disconnect.
    pub fn generate(self) -> ReceiverStream<Frame> {
        self.spawn(None)
    }

    /// Like `generate`, but keep polling the store for new jobs every `poll_interval`.
    ///
    /// Cancelling `shutdown` ends the stream at the next idle point.
    pub fn follow(self, shutdown: CancellationToken) -> ReceiverStream<Frame> {
        self.spawn(Some(shutdown))
    }

    fn spawn(self, shutdown: Option<CancellationToken>) -> ReceiverStream<Frame> {
        let (tx, rx) = mpsc::channel(self.config.channel_capacity);
        tokio::spawn(self.pump(tx, shutdown));
        ReceiverStream::new(rx)
    }

    async fn pump(mut self, tx: mpsc::Sender<Frame>, shutdown: Option<CancellationToken>) {
        tracing::info!(stream = %self.name, "starting stream");
        let mut sink = Some(tx);
        loop {
            if sink.is_some() {
                if let Err(err) = self.enqueue_jobs().await {
                    tracing::warn!(stream = %self.name, error = %err, "failed to claim pending jobs");
                }
            }
            if self.admit(sink.as_ref()).await.is_err() && self.disconnect(&mut sink).await {
                return;
            }

            if self.active.is_empty() {
                let (Some(tx), Some(token)) = (sink.as_ref(), shutdown.as_ref()) else {
                    break;
                };
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tx.closed() => break,
                    _ = tokio::time::sleep(self.config.poll_interval) => continue,
                }
            }

            if self.tick(sink.as_ref()).await.is_err() && self.disconnect(&mut sink).await {
                return;
            }
        }
        tracing::info!(stream = %self.name, "stream drained");
    }

    /// Claim the stream's pending jobs and append them to the FIFO queue.
    async fn enqueue_jobs(&mut self) -> Result<usize> {
        let jobs = self.store.claim_pending(Some(&self.name)).await?;
        let claimed = jobs.len();
        if claimed > 0 {
            tracing::debug!(stream = %self.name, claimed, "enqueued jobs");
        }
        self.queue.extend(jobs);
        Ok(claimed)
    }

    /// Start queued jobs until every slot is taken. A job that fails to spawn frees its slot
    /// at once and its terminal event goes out in a batch of its own.
    async fn admit(&mut self, sink: Option<&mpsc::Sender<Frame>>) -> std::result::Result<(), Disconnected> {
        let mut outcome = Ok(());
        while self.active.len() < self.config.max_concurrency {
            let Some(job) = self.queue.pop_front() else {
                break;
            };
            tracing::info!(stream = %self.name, job_id = %job.job_id, "admitting job");
            let terminal = match JobSource::start(job, self.store.clone(), &self.config).await {
                Ok(source) => {
                    self.active.push(source);
                    continue;
                }
                Err(terminal) => terminal,
            };
            let Some(tx) = sink else { continue };
            if outcome.is_err() {
                continue;
            }
            match encode_batch(std::slice::from_ref(&terminal)) {
                Ok(frame) => {
                    if tx.send(frame).await.is_err() {
                        outcome = Err(Disconnected);
                    }
                }
                Err(err) => {
                    tracing::error!(
                        stream = %self.name,
                        job_id = %terminal.job_id(),
                        error = %err,
                        "failed to encode batch, dropping it"
                    );
                }
            }
        }
        outcome
    }

    /// Forget the transport. Returns true when the pump should stop right away.
    async fn disconnect(&mut self, sink: &mut Option<mpsc::Sender<Frame>>) -> bool {
        tracing::info!(stream = %self.name, "stream consumer disconnected");
        *sink = None;
        if self.config.kill_on_disconnect {
            self.abandon().await;
            return true;
        }
        false
    }

    /// Visit every active job once. Jobs that finish during the turn are removed after it.
    async fn tick(&mut self, sink: Option<&mpsc::Sender<Frame>>) -> std::result::Result<(), Disconnected> {
        let mut finished: HashSet<JobId> = HashSet::new();
        let mut outcome = Ok(());
        for source in self.active.iter_mut() {
            let (batch, done) = source.next_batch(self.config.batch_size).await;
            if done {
                finished.insert(source.job_id());
            }
            let Some(tx) = sink else { continue };
            if batch.is_empty() || outcome.is_err() {
                continue;
            }
            match encode_batch(&batch) {
                Ok(frame) => {
                    if tx.send(frame).await.is_err() {
                        outcome = Err(Disconnected);
                    }
                }
                Err(err) => {
                    tracing::error!(
                        stream = %self.name,
                        job_id = %source.job_id(),
                        error = %err,
                        "failed to encode batch, dropping it"
                    );
                }
            }
        }
        self.active.retain(|source| !finished.contains(&source.job_id()));
        outcome
    }

    async fn abandon(&mut self) {
        for source in self.active.drain(..) {
            source.abandon().await;
        }
        for mut job in self.queue.drain(..) {
            let update = JobUpdate::failure(JobStatus::Error, "stream consumer disconnected");
            record(self.store.as_ref(), &mut job, update).await;
        }
    }
}

fn encode_batch(batch: &[JobStreamEvent]) -> Result<Frame> {
    Ok(serde_json::to_vec(batch)?.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Submission;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, Utc};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio_stream::StreamExt;

    /// Store that tracks how many jobs are running at once and the admission order.
    #[derive(Default)]
    struct CountingStore {
        inner: MemoryStore,
        running: AtomicUsize,
        peak: AtomicUsize,
        admitted: Mutex<Vec<JobId>>,
    }

    #[async_trait]
    impl JobStore for CountingStore {
        async fn insert(&self, job: Job) -> Result<()> {
            self.inner.insert(job).await
        }

        async fn get(&self, job_id: JobId) -> Result<Option<Job>> {
            self.inner.get(job_id).await
        }

        async fn pending(&self, stream: Option<&str>) -> Result<Vec<Job>> {
            self.inner.pending(stream).await
        }

        async fn claim_pending(&self, stream: Option<&str>) -> Result<Vec<Job>> {
            self.inner.claim_pending(stream).await
        }

        async fn update(&self, job_id: JobId, update: JobUpdate) -> Result<()> {
            match update.status {
                Some(JobStatus::Running) => {
                    let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
                    self.peak.fetch_max(now, Ordering::SeqCst);
                    self.admitted.lock().unwrap().push(job_id);
                }
                Some(status) if status.is_terminal() => {
                    self.running.fetch_sub(1, Ordering::SeqCst);
                }
                _ => {}
            }
            self.inner.update(job_id, update).await
        }
    }

    async fn add_jobs(store: &dyn JobStore, stream: &str, scripts: &[&str]) -> Vec<Job> {
        let base = Utc::now();
        let mut jobs = vec![];
        for (i, script) in scripts.iter().enumerate() {
            let job = Submission::new("sh", vec!["-c".into(), script.to_string()])
                .stream(stream)
                .into_job_at(base + ChronoDuration::milliseconds(i as i64));
            store.insert(job.clone()).await.unwrap();
            jobs.push(job);
        }
        jobs
    }

    async fn collect(stream: ReceiverStream<Frame>) -> Vec<Vec<JobStreamEvent>> {
        stream
            .map(|frame| serde_json::from_slice::<Vec<JobStreamEvent>>(&frame).unwrap())
            .collect()
            .await
    }

    fn check_sequences(batches: &[Vec<JobStreamEvent>]) -> HashMap<JobId, Vec<JobStreamEvent>> {
        let mut per_job: HashMap<JobId, Vec<JobStreamEvent>> = HashMap::new();
        for event in batches.iter().flatten() {
            per_job.entry(event.job_id()).or_default().push(event.clone());
        }
        for events in per_job.values() {
            let (last, body) = events.split_last().unwrap();
            assert!(last.is_terminal());
            for (expected, event) in body.iter().enumerate() {
                match event {
                    JobStreamEvent::Line(line) => {
                        assert_eq!(line.data.as_ref().unwrap().line_no, expected as u64)
                    }
                    JobStreamEvent::Result(_) => panic!("result before the end of a job"),
                }
            }
        }
        per_job
    }

    #[tokio::test]
    async fn concurrency_bound_and_fifo_admission() {
        let store = Arc::new(CountingStore::default());
        let scripts = vec!["echo start; sleep 0.2; echo done"; 10];
        let jobs = add_jobs(store.as_ref(), "builds", &scripts).await;

        let streamer = Streamer::new(store.clone(), "builds", StreamerConfig::default());
        let batches = collect(streamer.generate()).await;

        let per_job = check_sequences(&batches);
        assert_eq!(per_job.len(), 10);
        for events in per_job.values() {
            assert_eq!(events.len(), 3);
        }
        assert!(store.peak.load(Ordering::SeqCst) <= 4);
        assert_eq!(store.running.load(Ordering::SeqCst), 0);

        let created: Vec<JobId> = jobs.iter().map(|job| job.job_id).collect();
        assert_eq!(*store.admitted.lock().unwrap(), created);
        for job in jobs {
            let stored = store.get(job.job_id).await.unwrap().unwrap();
            assert_eq!(stored.status, JobStatus::Completed);
        }
    }

    #[tokio::test]
    async fn batches_are_bounded() {
        let store = Arc::new(MemoryStore::new());
        add_jobs(store.as_ref(), "s", &["seq 1 250"]).await;

        let streamer = Streamer::new(store.clone(), "s", StreamerConfig::default());
        let batches = collect(streamer.generate()).await;
        let sizes: Vec<usize> = batches.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![100, 100, 51]);
        check_sequences(&batches);
    }

    #[tokio::test]
    async fn round_robin_alternates_jobs() {
        let store = Arc::new(MemoryStore::new());
        let jobs = add_jobs(store.as_ref(), "s", &["seq 1 300", "seq 1 300"]).await;

        let config = StreamerConfig {
            batch_size: 100,
            ..Default::default()
        };
        let batches = collect(Streamer::new(store.clone(), "s", config).generate()).await;
        let order: Vec<JobId> = batches.iter().map(|batch| batch[0].job_id()).collect();
        let (a, b) = (jobs[0].job_id, jobs[1].job_id);
        assert_eq!(order, vec![a, b, a, b, a, b, a, b]);
        check_sequences(&batches);
    }

    #[tokio::test]
    async fn spawn_failure_does_not_disturb_others() {
        let store = Arc::new(MemoryStore::new());
        add_jobs(store.as_ref(), "s", &["echo fine"]).await;
        let broken = Submission::new("no-such-command-for-grid-tests", vec![])
            .stream("s")
            .into_job();
        store.insert(broken.clone()).await.unwrap();

        let batches = collect(Streamer::new(store.clone(), "s", StreamerConfig::default()).generate()).await;
        let per_job = check_sequences(&batches);
        assert_eq!(per_job.len(), 2);

        let events = &per_job[&broken.job_id];
        assert_eq!(events.len(), 1);
        match &events[0] {
            JobStreamEvent::Result(result) => {
                assert_eq!(result.status, JobStatus::Error);
                assert!(result.job.pid.is_none());
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn ignores_other_streams() {
        let store = Arc::new(MemoryStore::new());
        add_jobs(store.as_ref(), "mine", &["echo mine"]).await;
        let theirs = add_jobs(store.as_ref(), "theirs", &["echo theirs"]).await;

        let batches = collect(Streamer::new(store.clone(), "mine", StreamerConfig::default()).generate()).await;
        assert_eq!(check_sequences(&batches).len(), 1);
        let untouched = store.get(theirs[0].job_id).await.unwrap().unwrap();
        assert_eq!(untouched.status, JobStatus::Created);
    }

    #[tokio::test]
    async fn disconnect_kills_active_jobs() {
        let store = Arc::new(MemoryStore::new());
        let jobs = add_jobs(store.as_ref(), "s", &["while true; do echo tick; sleep 0.01; done"]).await;

        let config = StreamerConfig {
            batch_size: 1,
            channel_capacity: 1,
            ..Default::default()
        };
        let mut stream = Streamer::new(store.clone(), "s", config).generate();
        assert!(stream.next().await.is_some());
        drop(stream);

        let job_id = jobs[0].job_id;
        let mut status = JobStatus::Running;
        for _ in 0..100 {
            status = store.get(job_id).await.unwrap().unwrap().status;
            if status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(status, JobStatus::Error);
        let job = store.get(job_id).await.unwrap().unwrap();
        assert_eq!(job.error.as_deref(), Some("stream consumer disconnected"));
    }

    async fn wait_terminal(store: &dyn JobStore, job_id: JobId) -> Job {
        for _ in 0..100 {
            let job = store.get(job_id).await.unwrap().unwrap();
            if job.status.is_terminal() {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("job {} never finished", job_id);
    }

    #[tokio::test]
    async fn spawn_failure_frees_its_slot() {
        let store = Arc::new(MemoryStore::new());
        let base = Utc::now();
        let slow = Submission::new("sh", vec!["-c".into(), "sleep 1; echo a".into()])
            .stream("s")
            .into_job_at(base);
        let broken = Submission::new("no-such-command-for-grid-tests", vec![])
            .stream("s")
            .into_job_at(base + ChronoDuration::milliseconds(1));
        let quick = Submission::new("sh", vec!["-c".into(), "echo c".into()])
            .stream("s")
            .into_job_at(base + ChronoDuration::milliseconds(2));
        for job in [&slow, &broken, &quick] {
            store.insert(job.clone()).await.unwrap();
        }

        let config = StreamerConfig {
            max_concurrency: 2,
            ..Default::default()
        };
        let mut stream = Streamer::new(store.clone(), "s", config).generate();

        // the failed job is reported before the slow one produces anything
        let frame = tokio::time::timeout(Duration::from_millis(500), stream.next())
            .await
            .unwrap()
            .unwrap();
        let batch: Vec<JobStreamEvent> = serde_json::from_slice(&frame).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].job_id(), broken.job_id);
        assert!(batch[0].is_terminal());

        tokio::time::sleep(Duration::from_millis(200)).await;
        let stored = store.get(quick.job_id).await.unwrap().unwrap();
        assert_ne!(stored.status, JobStatus::Enqueued);
        assert!(stored.pid.is_some());
        let stored = store.get(broken.job_id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Error);

        let rest = collect(stream).await;
        let per_job = check_sequences(&rest);
        assert_eq!(per_job.len(), 2);
        assert_eq!(per_job[&quick.job_id].len(), 2);
        assert_eq!(per_job[&slow.job_id].len(), 2);
    }

    #[tokio::test]
    async fn unreadable_output_fails_only_that_job() {
        let store = Arc::new(MemoryStore::new());
        let jobs = add_jobs(store.as_ref(), "s", &["printf 'ok\\n\\377\\n'; sleep 5", "echo fine"]).await;

        let started = std::time::Instant::now();
        let batches = collect(Streamer::new(store.clone(), "s", StreamerConfig::default()).generate()).await;
        assert!(started.elapsed() < Duration::from_secs(4));

        let per_job = check_sequences(&batches);
        assert_eq!(per_job.len(), 2);
        let garbled = store.get(jobs[0].job_id).await.unwrap().unwrap();
        assert_eq!(garbled.status, JobStatus::Error);
        assert!(garbled.error.is_some());
        match per_job[&jobs[0].job_id].last().unwrap() {
            JobStreamEvent::Result(result) => assert_eq!(result.status, JobStatus::Error),
            other => panic!("unexpected event {:?}", other),
        }
        let fine = store.get(jobs[1].job_id).await.unwrap().unwrap();
        assert_eq!(fine.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn detached_jobs_finish_after_disconnect() {
        let store = Arc::new(MemoryStore::new());
        let jobs = add_jobs(
            store.as_ref(),
            "s",
            &["echo first; sleep 0.3; echo last", "echo queued"],
        )
        .await;

        let config = StreamerConfig {
            max_concurrency: 1,
            batch_size: 1,
            channel_capacity: 1,
            kill_on_disconnect: false,
            ..Default::default()
        };
        let mut stream = Streamer::new(store.clone(), "s", config).generate();
        assert!(stream.next().await.is_some());
        drop(stream);

        for job in &jobs {
            let finished = wait_terminal(store.as_ref(), job.job_id).await;
            assert_eq!(finished.status, JobStatus::Completed);
            assert!(finished.error.is_none());
        }
    }

    #[tokio::test]
    async fn follow_picks_up_new_jobs() {
        let store = Arc::new(MemoryStore::new());
        let shutdown = CancellationToken::new();
        let config = StreamerConfig {
            poll_interval: Duration::from_millis(10),
            ..Default::default()
        };
        let mut stream = Streamer::new(store.clone(), "live", config).follow(shutdown.clone());

        tokio::time::sleep(Duration::from_millis(50)).await;
        add_jobs(store.as_ref(), "live", &["echo late"]).await;

        let frame = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .unwrap()
            .unwrap();
        let batch: Vec<JobStreamEvent> = serde_json::from_slice(&frame).unwrap();
        assert_eq!(batch.len(), 2);
        assert!(batch[1].is_terminal());

        shutdown.cancel();
        let end = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .unwrap();
        assert!(end.is_none());
    }
}
