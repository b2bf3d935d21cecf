use super::broadcaster::BroadcasterHandle;
use super::frame::{self, Body};
use super::subscription::{Callback, Subscription};
use crate::config::IpcConfig;
use crate::error::{Error, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::marker::PhantomData;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use tokio::net::UnixListener;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;

/// A typed publish/subscribe channel over a Unix socket.
///
/// The publishing side binds lazily, on the first `bind` or `publish`. Any number of
/// subscriptions may connect, before or after that.
pub struct Channel<T> {
    endpoint: PathBuf,
    config: IpcConfig,
    publisher: OnceCell<Publisher>,
    _marker: PhantomData<fn() -> T>,
}

struct Publisher {
    broadcaster: BroadcasterHandle,
    accept_task: JoinHandle<()>,
    actor_task: JoinHandle<()>,
}

impl<T> Channel<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + 'static,
{
    pub fn new(endpoint: impl Into<PathBuf>) -> Self {
        Self::with_config(endpoint, IpcConfig::default())
    }

    pub fn with_config(endpoint: impl Into<PathBuf>, config: IpcConfig) -> Self {
        Self {
            endpoint: endpoint.into(),
            config,
            publisher: OnceCell::new(),
            _marker: PhantomData,
        }
    }

    pub fn endpoint(&self) -> &Path {
        &self.endpoint
    }

    /// Bind the publishing side now instead of on the first publish.
    pub async fn bind(&self) -> Result<()> {
        self.publisher().await.map(|_| ())
    }

    /// Send `value` to every currently connected subscriber. Returns how many there were.
    pub async fn publish(&self, value: &T) -> Result<usize> {
        let encoded = frame::encode(Body::Message(value))?;
        let publisher = self.publisher().await?;
        let delivered = publisher.broadcaster.publish(encoded).await?;
        tracing::trace!(endpoint = %self.endpoint.display(), delivered, "published");
        Ok(delivered)
    }

    pub fn subscribe(&self) -> Subscription<T> {
        Subscription::spawn(self.endpoint.clone(), self.config.clone(), None)
    }

    pub fn subscribe_with(&self, callback: Callback<T>) -> Subscription<T> {
        Subscription::spawn(self.endpoint.clone(), self.config.clone(), Some(callback))
    }

    /// Stop publishing. Connected subscriptions lose their connection and start reconnecting.
    pub async fn close(mut self) {
        if let Some(publisher) = self.publisher.take() {
            publisher.stop();
            let _ = publisher.accept_task.await;
            let _ = publisher.actor_task.await;
            remove_socket(&self.endpoint);
        }
    }

    async fn publisher(&self) -> Result<&Publisher> {
        self.publisher
            .get_or_try_init(|| Publisher::bind(&self.endpoint, self.config.high_water_mark))
            .await
    }
}

impl<T> Drop for Channel<T> {
    fn drop(&mut self) {
        if let Some(publisher) = self.publisher.get() {
            publisher.stop();
            remove_socket(&self.endpoint);
        }
    }
}

impl Publisher {
    async fn bind(endpoint: &Path, high_water_mark: usize) -> Result<Self> {
        remove_stale_socket(endpoint);
        let listener = UnixListener::bind(endpoint).map_err(|source| Error::Bind {
            path: endpoint.to_path_buf(),
            source,
        })?;
        let (broadcaster, actor_task) = BroadcasterHandle::spawn(high_water_mark);
        let accept_task = tokio::spawn(accept(listener, broadcaster.clone()));
        tracing::info!(endpoint = %endpoint.display(), "channel bound");
        Ok(Self {
            broadcaster,
            accept_task,
            actor_task,
        })
    }

    fn stop(&self) {
        self.accept_task.abort();
        self.actor_task.abort();
    }
}

async fn accept(listener: UnixListener, broadcaster: BroadcasterHandle) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => broadcaster.attach(stream),
            Err(err) => {
                tracing::warn!(error = %err, "failed to accept subscriber");
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            }
        }
    }
}

/// Remove a socket file left behind by a process that is gone. A socket somebody still listens
/// on, or any other kind of file, stays put and makes the following bind fail.
pub(crate) fn remove_stale_socket(endpoint: &Path) {
    let Ok(metadata) = std::fs::symlink_metadata(endpoint) else {
        return;
    };
    if !metadata.file_type().is_socket() {
        return;
    }
    if std::os::unix::net::UnixStream::connect(endpoint).is_ok() {
        return;
    }
    tracing::debug!(endpoint = %endpoint.display(), "removing stale socket file");
    remove_socket(endpoint);
}

pub(crate) fn remove_socket(endpoint: &Path) {
    if let Err(err) = std::fs::remove_file(endpoint) {
        if err.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(endpoint = %endpoint.display(), error = %err, "failed to remove socket file");
        }
    }
}
