use crate::types::Frame;
use tokio::net::UnixStream;
use tokio::sync::oneshot;

#[derive(Debug)]
pub enum Message {
    Attach {
        stream: UnixStream,
    },
    Publish {
        frame: Frame,
        response: oneshot::Sender<usize>,
    },
}
