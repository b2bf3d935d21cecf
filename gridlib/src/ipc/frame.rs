use crate::error::{Error, Result};
use crate::types::Frame;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::net::UnixStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

/// Version stamped on every frame. Receivers reject anything else.
pub const PROTOCOL_VERSION: u16 = 1;

#[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub(crate) enum Body<T> {
    /// Sent by a publisher once a subscriber is registered.
    Ready,
    Message(T),
}

#[derive(Serialize, Deserialize)]
struct Envelope<T> {
    version: u16,
    body: Body<T>,
}

#[derive(Deserialize)]
struct VersionHeader {
    version: u16,
}

pub(crate) type Transport = Framed<UnixStream, LengthDelimitedCodec>;

pub(crate) fn transport(stream: UnixStream) -> Transport {
    Framed::new(stream, LengthDelimitedCodec::new())
}

pub(crate) fn encode<T: Serialize>(body: Body<&T>) -> Result<Frame> {
    let envelope = Envelope {
        version: PROTOCOL_VERSION,
        body,
    };
    Ok(serde_json::to_vec(&envelope)?.into())
}

pub(crate) fn ready() -> Result<Frame> {
    encode::<()>(Body::Ready)
}

pub(crate) fn decode<T: DeserializeOwned>(frame: &[u8]) -> Result<Body<T>> {
    let header: VersionHeader = serde_json::from_slice(frame)?;
    if header.version != PROTOCOL_VERSION {
        return Err(Error::VersionMismatch {
            expected: PROTOCOL_VERSION,
            found: header.version,
        });
    }
    let envelope: Envelope<T> = serde_json::from_slice(frame)?;
    Ok(envelope.body)
}
