use super::channel::{remove_socket, remove_stale_socket};
use super::frame::{self, Body, Transport};
use crate::config::IpcConfig;
use crate::error::{panic_message, Error, Result};
use futures::SinkExt;
use serde::{de::DeserializeOwned, Serialize};
use std::marker::PhantomData;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::{UnixListener, UnixStream};
use tokio::task::{JoinHandle, JoinSet};
use tokio_stream::StreamExt;

type Matcher<Req> = Box<dyn Fn(&Req) -> bool + Send + Sync>;
type Handler<Req, Resp> = Box<dyn Fn(&Req) -> Resp + Send + Sync>;

struct Route<Req, Resp> {
    matcher: Matcher<Req>,
    handler: Handler<Req, Resp>,
}

/// Request/reply endpoint. Each request is answered by the first route whose matcher accepts
/// it, or with an empty reply when none does.
pub struct Service<Req, Resp> {
    endpoint: PathBuf,
    routes: Vec<Route<Req, Resp>>,
}

impl<Req, Resp> Service<Req, Resp>
where
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
{
    pub fn new(endpoint: impl Into<PathBuf>) -> Self {
        Self {
            endpoint: endpoint.into(),
            routes: vec![],
        }
    }

    pub fn endpoint(&self) -> &Path {
        &self.endpoint
    }

    /// Append a route. Routes are tried in registration order.
    pub fn route<M, H>(mut self, matcher: M, handler: H) -> Self
    where
        M: Fn(&Req) -> bool + Send + Sync + 'static,
        H: Fn(&Req) -> Resp + Send + Sync + 'static,
    {
        self.routes.push(Route {
            matcher: Box::new(matcher),
            handler: Box::new(handler),
        });
        self
    }

    pub fn respond(&self, request: &Req) -> Option<Resp> {
        self.routes
            .iter()
            .find(|route| (route.matcher)(request))
            .map(|route| (route.handler)(request))
    }

    /// Bind the endpoint and serve requests until the returned handle is shut down or dropped.
    pub fn spawn(self) -> Result<ServiceHandle> {
        remove_stale_socket(&self.endpoint);
        let listener = UnixListener::bind(&self.endpoint).map_err(|source| Error::Bind {
            path: self.endpoint.clone(),
            source,
        })?;
        tracing::info!(endpoint = %self.endpoint.display(), routes = self.routes.len(), "service listening");
        let endpoint = self.endpoint.clone();
        let task = tokio::spawn(serve(listener, Arc::new(self)));
        Ok(ServiceHandle { endpoint, task })
    }

    fn respond_isolated(&self, request: &Req) -> Option<Resp> {
        match catch_unwind(AssertUnwindSafe(|| self.respond(request))) {
            Ok(reply) => reply,
            Err(panic) => {
                tracing::error!(error = %panic_message(panic.as_ref()), "route handler panicked");
                None
            }
        }
    }
}

/// A running `Service`. Dropping it stops the service.
pub struct ServiceHandle {
    endpoint: PathBuf,
    task: JoinHandle<()>,
}

impl ServiceHandle {
    pub fn endpoint(&self) -> &Path {
        &self.endpoint
    }

    pub async fn shutdown(mut self) {
        self.task.abort();
        let _ = (&mut self.task).await;
    }
}

impl Drop for ServiceHandle {
    fn drop(&mut self) {
        self.task.abort();
        remove_socket(&self.endpoint);
    }
}

async fn serve<Req, Resp>(listener: UnixListener, service: Arc<Service<Req, Resp>>)
where
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
{
    // aborting this task drops the set, which aborts every open connection
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    connections.spawn(handle_connection(stream, service.clone()));
                }
                Err(err) => {
                    tracing::warn!(error = %err, "failed to accept client");
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
}

async fn handle_connection<Req, Resp>(stream: UnixStream, service: Arc<Service<Req, Resp>>)
where
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
{
    let mut transport = frame::transport(stream);
    while let Some(received) = transport.next().await {
        let raw = match received {
            Ok(raw) => raw,
            Err(err) => {
                tracing::warn!(error = %err, "client connection failed");
                return;
            }
        };
        let reply = match frame::decode::<Req>(&raw) {
            Ok(Body::Message(request)) => service.respond_isolated(&request),
            Ok(Body::Ready) => None,
            Err(err) => {
                tracing::warn!(error = %err, "rejecting undecodable request");
                None
            }
        };
        let encoded = match frame::encode(Body::Message(&reply)) {
            Ok(encoded) => encoded,
            Err(err) => {
                tracing::error!(error = %err, "failed to encode reply");
                match frame::encode::<Option<Resp>>(Body::Message(&None)) {
                    Ok(encoded) => encoded,
                    Err(_) => return,
                }
            }
        };
        if let Err(err) = transport.send(encoded).await {
            tracing::warn!(error = %err, "failed to send reply");
            return;
        }
    }
}

/// Client side of a `Service`: one outstanding request at a time, each answered by one reply.
pub struct Client<Req, Resp> {
    endpoint: PathBuf,
    request_timeout: Option<std::time::Duration>,
    transport: Option<Transport>,
    _marker: PhantomData<fn(&Req) -> Resp>,
}

impl<Req, Resp> Client<Req, Resp>
where
    Req: Serialize,
    Resp: DeserializeOwned,
{
    pub async fn connect(endpoint: impl Into<PathBuf>) -> Result<Self> {
        Self::connect_with(endpoint, &IpcConfig::default()).await
    }

    pub async fn connect_with(endpoint: impl Into<PathBuf>, config: &IpcConfig) -> Result<Self> {
        let endpoint = endpoint.into();
        let stream = UnixStream::connect(&endpoint).await?;
        Ok(Self {
            endpoint,
            request_timeout: config.request_timeout,
            transport: Some(frame::transport(stream)),
            _marker: PhantomData,
        })
    }

    /// Send `request` and wait for its reply. `None` means no route matched.
    ///
    /// After a timeout the connection is dropped, so a late reply can never be mistaken for the
    /// answer to the next request.
    pub async fn request(&mut self, request: &Req) -> Result<Option<Resp>> {
        let encoded = frame::encode(Body::Message(request))?;
        let mut transport = match self.transport.take() {
            Some(transport) => transport,
            None => frame::transport(UnixStream::connect(&self.endpoint).await?),
        };
        transport.send(encoded).await?;

        let reply = match self.request_timeout {
            Some(timeout) => tokio::time::timeout(timeout, transport.next())
                .await
                .map_err(|_| Error::Timeout(timeout))?,
            None => transport.next().await,
        };
        let raw = reply.ok_or(Error::ChannelClosed)??;
        let reply = match frame::decode::<Option<Resp>>(&raw)? {
            Body::Message(reply) => reply,
            Body::Ready => None,
        };
        self.transport = Some(transport);
        Ok(reply)
    }
}
