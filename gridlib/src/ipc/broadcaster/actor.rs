use super::messages::Message;
use crate::ipc::frame;
use crate::types::Frame;

use futures::SinkExt;
use tokio::net::UnixStream;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedWrite, LengthDelimitedCodec};

pub struct Actor {
    inbox: mpsc::UnboundedReceiver<Message>,
    subscribers: Vec<mpsc::Sender<Frame>>,
    high_water_mark: usize,
}

impl Actor {
    pub fn spawn(inbox: mpsc::UnboundedReceiver<Message>, high_water_mark: usize) -> JoinHandle<()> {
        let actor = Actor {
            inbox,
            subscribers: Vec::new(),
            high_water_mark,
        };
        tokio::spawn(async move { actor.run().await })
    }

    async fn run(mut self) {
        while let Some(msg) = self.inbox.recv().await {
            use self::Message::*;
            match msg {
                Attach { stream } => self.attach(stream),
                Publish { frame, response } => {
                    let delivered = self.publish(frame);
                    let _ = response.send(delivered);
                }
            }
        }
        tracing::debug!("broadcaster inbox closed");
    }

    /// Offer `frame` to every subscriber without waiting on any of them.
    fn publish(&mut self, frame: Frame) -> usize {
        let mut delivered = 0;
        let mut dropped = 0;
        self.subscribers.retain(|sub| match sub.try_send(frame.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                dropped += 1;
                true
            }
            // writer gone, the subscriber disconnected
            Err(TrySendError::Closed(_)) => false,
        });
        if dropped > 0 {
            tracing::warn!(
                dropped,
                high_water_mark = self.high_water_mark,
                "subscriber queue full, frame dropped"
            );
        }
        delivered
    }

    fn attach(&mut self, stream: UnixStream) {
        let (frame_tx, frame_rx) = mpsc::channel(self.high_water_mark);
        tokio::spawn(write_frames(stream, frame_rx));
        self.subscribers.push(frame_tx);
        tracing::debug!(subscribers = self.subscribers.len(), "subscriber attached");
    }
}

/// Greet the subscriber with `Ready`, then forward published frames until either side goes away.
async fn write_frames(stream: UnixStream, mut frames: mpsc::Receiver<Frame>) {
    let mut sink = FramedWrite::new(stream, LengthDelimitedCodec::new());
    let ready = match frame::ready() {
        Ok(ready) => ready,
        Err(err) => {
            tracing::error!(error = %err, "failed to encode ready frame");
            return;
        }
    };
    if sink.send(ready).await.is_err() {
        return;
    }
    while let Some(frame) = frames.recv().await {
        if let Err(err) = sink.send(frame).await {
            tracing::debug!(error = %err, "subscriber went away");
            break;
        }
    }
}
