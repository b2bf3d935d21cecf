use crate::error::{Error, Result};
use crate::events::JobStatus;
use crate::types::ExitCode;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// How a process exit maps onto a terminal status.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitPolicy {
    /// Any normal exit is `completed`, whatever the exit code.
    #[default]
    Complete,
    /// A non-zero exit code, or death by signal, is `failed`.
    FailOnNonZero,
}

impl ExitPolicy {
    pub fn status_for(self, exit_code: Option<ExitCode>) -> JobStatus {
        match (self, exit_code) {
            (ExitPolicy::Complete, _) => JobStatus::Completed,
            (ExitPolicy::FailOnNonZero, Some(0)) => JobStatus::Completed,
            (ExitPolicy::FailOnNonZero, _) => JobStatus::Failed,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Worker pool size. Defaults to `max(4, 2 * available cores)`.
    pub max_workers: Option<usize>,
    /// Capacity of the shared output buffer.
    pub buffer_capacity: usize,
    pub exit_policy: ExitPolicy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_workers: None,
            buffer_capacity: 10_000,
            exit_policy: ExitPolicy::default(),
        }
    }
}

impl DispatcherConfig {
    pub fn pool_size(&self) -> usize {
        match self.max_workers {
            Some(workers) => workers.max(1),
            None => {
                let cores = std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1);
                (cores * 2).max(4)
            }
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub exit_policy: ExitPolicy,
    /// Kill the child when its timeout expires. When false the child is left running and
    /// reaped in the background.
    pub kill_on_timeout: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            exit_policy: ExitPolicy::default(),
            kill_on_timeout: true,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct StreamerConfig {
    pub max_concurrency: usize,
    pub batch_size: usize,
    /// Encoded batches buffered ahead of the transport.
    pub channel_capacity: usize,
    #[serde(with = "millis")]
    pub poll_interval: Duration,
    /// Kill active subprocesses when the transport stops pulling. When false they are
    /// drained in the background until they exit.
    pub kill_on_disconnect: bool,
    pub exit_policy: ExitPolicy,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            batch_size: 100,
            channel_capacity: 16,
            poll_interval: Duration::from_millis(50),
            kill_on_disconnect: true,
            exit_policy: ExitPolicy::default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct IpcConfig {
    /// Delay between attempts of a subscription to reach its publisher.
    #[serde(with = "millis")]
    pub reconnect_interval: Duration,
    /// Upper bound on a client's wait for a reply. `None` waits forever.
    #[serde(with = "millis_opt")]
    pub request_timeout: Option<Duration>,
    /// Values queued per connected subscriber on the publishing side, and buffered by a
    /// subscription. A publisher drops new values for a subscriber whose queue is full.
    pub high_water_mark: usize,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            reconnect_interval: Duration::from_millis(100),
            request_timeout: None,
            high_water_mark: 1000,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    pub dispatcher: DispatcherConfig,
    pub runner: RunnerConfig,
    pub streamer: StreamerConfig,
    pub ipc: IpcConfig,
}

impl GridConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read(path.as_ref())?;
        serde_json::from_slice(&raw).map_err(Error::Encoding)
    }
}

mod millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        u64::deserialize(de).map(Duration::from_millis)
    }
}

mod millis_opt {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(de)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = GridConfig::default();
        assert!(config.dispatcher.pool_size() >= 4);
        assert_eq!(config.streamer.max_concurrency, 4);
        assert_eq!(config.streamer.batch_size, 100);
        assert!(config.runner.kill_on_timeout);
    }

    #[test]
    fn explicit_pool_size_wins() {
        let config = DispatcherConfig {
            max_workers: Some(2),
            ..Default::default()
        };
        assert_eq!(config.pool_size(), 2);
    }

    #[test]
    fn partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grid.json");
        std::fs::write(
            &path,
            r#"{"streamer": {"max_concurrency": 2, "poll_interval": 10},
                "runner": {"exit_policy": "fail_on_non_zero"},
                "ipc": {"request_timeout": 250, "high_water_mark": 8}}"#,
        )
        .unwrap();
        let config = GridConfig::from_file(&path).unwrap();
        assert_eq!(config.streamer.max_concurrency, 2);
        assert_eq!(config.streamer.batch_size, 100);
        assert_eq!(config.streamer.poll_interval, Duration::from_millis(10));
        assert_eq!(config.runner.exit_policy, ExitPolicy::FailOnNonZero);
        assert_eq!(config.ipc.request_timeout, Some(Duration::from_millis(250)));
        assert_eq!(config.ipc.high_water_mark, 8);
        assert_eq!(config.ipc.reconnect_interval, Duration::from_millis(100));
    }

    #[test]
    fn exit_policy() {
        assert_eq!(ExitPolicy::Complete.status_for(Some(3)), JobStatus::Completed);
        assert_eq!(ExitPolicy::FailOnNonZero.status_for(Some(0)), JobStatus::Completed);
        assert_eq!(ExitPolicy::FailOnNonZero.status_for(Some(3)), JobStatus::Failed);
        assert_eq!(ExitPolicy::FailOnNonZero.status_for(None), JobStatus::Failed);
    }
}
