use super::frame::{self, Body};
use crate::config::IpcConfig;
use crate::error::{panic_message, Error, Result};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UnixStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::codec::{FramedRead, LengthDelimitedCodec};

/// Invoked on the receive task for every value, after it has been buffered.
pub enum Callback<T> {
    Value(Arc<dyn Fn(T) + Send + Sync>),
    /// Receives the value as a JSON object instead of the typed record.
    Fields(Arc<dyn Fn(Map<String, Value>) + Send + Sync>),
}

impl<T> Callback<T> {
    pub fn value(callback: impl Fn(T) + Send + Sync + 'static) -> Self {
        Callback::Value(Arc::new(callback))
    }

    pub fn fields(callback: impl Fn(Map<String, Value>) + Send + Sync + 'static) -> Self {
        Callback::Fields(Arc::new(callback))
    }
}

impl<T> Clone for Callback<T> {
    fn clone(&self) -> Self {
        match self {
            Callback::Value(callback) => Callback::Value(callback.clone()),
            Callback::Fields(callback) => Callback::Fields(callback.clone()),
        }
    }
}

impl<T: Serialize> Callback<T> {
    fn invoke(&self, value: T) {
        let outcome = match self {
            Callback::Value(callback) => catch_unwind(AssertUnwindSafe(|| callback(value))),
            Callback::Fields(callback) => match serde_json::to_value(&value) {
                Ok(Value::Object(fields)) => catch_unwind(AssertUnwindSafe(|| callback(fields))),
                Ok(_) => {
                    tracing::warn!("value is not an object; fields callback skipped");
                    Ok(())
                }
                Err(err) => {
                    tracing::warn!(error = %err, "failed to convert value for fields callback");
                    Ok(())
                }
            },
        };
        if let Err(panic) = outcome {
            tracing::error!(error = %panic_message(panic.as_ref()), "subscription callback panicked");
        }
    }
}

/// The receiving end of a `Channel`.
///
/// A background task keeps a connection to the publisher, reconnecting whenever it is lost, and
/// appends every received value to an ordered buffer of `high_water_mark` values. While the
/// buffer is full the task stops reading, so the publisher starts dropping values for this
/// subscriber. Values published while disconnected are never seen.
pub struct Subscription<T> {
    buffer: mpsc::Receiver<T>,
    connected: watch::Receiver<bool>,
    task: JoinHandle<()>,
}

impl<T> Subscription<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + 'static,
{
    pub(crate) fn spawn(endpoint: PathBuf, config: IpcConfig, callback: Option<Callback<T>>) -> Self {
        let (buffer_tx, buffer) = mpsc::channel(config.high_water_mark.max(1));
        let (connected_tx, connected) = watch::channel(false);
        let task = tokio::spawn(receive(endpoint, config, buffer_tx, connected_tx, callback));
        Self {
            buffer,
            connected,
            task,
        }
    }

    /// Wait until the publisher has registered this subscriber.
    pub async fn connected(&self) -> Result<()> {
        let mut connected = self.connected.clone();
        loop {
            if *connected.borrow_and_update() {
                return Ok(());
            }
            connected.changed().await.map_err(|_| Error::ChannelClosed)?;
        }
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Wait for the next value. `None` once the subscription has been closed.
    pub async fn recv(&mut self) -> Option<T> {
        self.buffer.recv().await
    }

    /// Wait at most `timeout` for the next value.
    pub async fn receive(&mut self, timeout: Duration) -> Option<T> {
        tokio::time::timeout(timeout, self.buffer.recv())
            .await
            .ok()
            .flatten()
    }

    pub fn try_receive(&mut self) -> Option<T> {
        self.buffer.try_recv().ok()
    }

    /// Take everything buffered so far, oldest first.
    pub fn drain(&mut self) -> Vec<T> {
        let mut values = vec![];
        while let Ok(value) = self.buffer.try_recv() {
            values.push(value);
        }
        values
    }

    pub async fn close(mut self) {
        self.task.abort();
        let _ = (&mut self.task).await;
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn receive<T>(
    endpoint: PathBuf,
    config: IpcConfig,
    buffer: mpsc::Sender<T>,
    connected: watch::Sender<bool>,
    callback: Option<Callback<T>>,
) where
    T: Serialize + DeserializeOwned + Clone + Send + 'static,
{
    loop {
        let stream = match UnixStream::connect(&endpoint).await {
            Ok(stream) => stream,
            Err(err) => {
                tracing::trace!(endpoint = %endpoint.display(), error = %err, "publisher not reachable");
                tokio::time::sleep(config.reconnect_interval).await;
                continue;
            }
        };
        tracing::debug!(endpoint = %endpoint.display(), "connected to publisher");

        let mut frames = FramedRead::new(stream, LengthDelimitedCodec::new());
        while let Some(received) = frames.next().await {
            let raw = match received {
                Ok(raw) => raw,
                Err(err) => {
                    tracing::warn!(error = %err, "subscription connection failed");
                    break;
                }
            };
            match frame::decode::<T>(&raw) {
                Ok(Body::Ready) => {
                    let _ = connected.send(true);
                }
                Ok(Body::Message(value)) => {
                    if buffer.send(value.clone()).await.is_err() {
                        return;
                    }
                    if let Some(callback) = &callback {
                        callback.invoke(value);
                    }
                }
                Err(err) => tracing::warn!(error = %err, "dropping undecodable frame"),
            }
        }

        let _ = connected.send(false);
        tracing::debug!(endpoint = %endpoint.display(), "publisher connection lost");
        tokio::time::sleep(config.reconnect_interval).await;
    }
}
