mod actor;
mod messages;
use crate::error::{Error, Result};
use crate::types::Frame;
use actor::Actor;
use messages::Message;

use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// A `Broadcaster` owns the connected subscribers of one channel and fans every published frame
/// out to all of them.
///
/// This struct is actually an actor handle. The real work is done in the actor spawned by
/// `BroadcasterHandle::spawn`; each subscriber gets its own writer task fed through a queue of
/// `high_water_mark` frames. A slow reader never stalls the others, it only misses frames
/// published while its queue is full.
#[derive(Clone)]
pub(crate) struct BroadcasterHandle {
    sender: mpsc::UnboundedSender<Message>,
}

impl BroadcasterHandle {
    pub fn spawn(high_water_mark: usize) -> (Self, JoinHandle<()>) {
        let (sender, inbox) = mpsc::unbounded_channel();
        let task = Actor::spawn(inbox, high_water_mark.max(1));
        (Self { sender }, task)
    }

    pub fn attach(&self, stream: UnixStream) {
        let _ = self.sender.send(Message::Attach { stream });
    }

    /// Queue `frame` for every attached subscriber and return how many accepted it.
    pub async fn publish(&self, frame: Frame) -> Result<usize> {
        let (response, delivered) = oneshot::channel();
        self.sender
            .send(Message::Publish { frame, response })
            .map_err(|_| Error::ChannelClosed)?;
        delivered.await.map_err(|_| Error::ChannelClosed)
    }
}
