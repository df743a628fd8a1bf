//! Transport Contract
//!
//! The server core is transport-agnostic: it binds a listener for incoming
//! requests and opens connections to peers through these traits. Frames are
//! the encoded bytes of [`Request`]/[`Response`]; the transport moves bytes,
//! the codec defines them.
//!
//! [`LocalTransport`] is the in-process implementation: a shared registry of
//! address → channel. It still round-trips every message through the binary
//! codec, so anything that works over it is wire-ready. Tests and the demo
//! binary run whole clusters on it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use copycat_core::{Address, Request, Response};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no listener at {0}")]
    Unreachable(Address),

    #[error("connection closed")]
    Closed,

    #[error("address {0} is already bound")]
    AlreadyBound(Address),

    #[error("codec error: {0}")]
    Codec(#[from] copycat_core::Error),
}

/// An incoming request paired with its reply slot.
pub type Incoming = (Request, oneshot::Sender<Response>);

/// A stream of incoming requests for a bound address.
pub type Listener = mpsc::UnboundedReceiver<Incoming>;

/// An open connection to one remote address.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Send a request and await its response.
    async fn send(&self, request: Request) -> Result<Response, TransportError>;
}

/// Factory for listeners and connections.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Bind a listener for `address`.
    async fn bind(&self, address: &Address) -> Result<Listener, TransportError>;

    /// Open a connection to `address`.
    async fn connect(&self, address: &Address) -> Result<Box<dyn Connection>, TransportError>;
}

type FrameSender = mpsc::UnboundedSender<(Bytes, oneshot::Sender<Bytes>)>;

/// In-process transport: a registry of bound addresses delivering encoded
/// frames over channels.
#[derive(Clone, Default)]
pub struct LocalTransport {
    registry: Arc<Mutex<HashMap<Address, FrameSender>>>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop the listener registration for `address`, making the endpoint
    /// unreachable. Used by tests to partition or kill servers.
    pub fn unbind(&self, address: &Address) {
        self.registry
            .lock()
            .expect("transport registry poisoned")
            .remove(address);
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn bind(&self, address: &Address) -> Result<Listener, TransportError> {
        let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<(Bytes, oneshot::Sender<Bytes>)>();
        {
            let mut registry = self.registry.lock().expect("transport registry poisoned");
            if registry.contains_key(address) {
                return Err(TransportError::AlreadyBound(address.clone()));
            }
            registry.insert(address.clone(), frame_tx);
        }

        let (request_tx, request_rx) = mpsc::unbounded_channel::<Incoming>();
        let bound = address.clone();
        tokio::spawn(async move {
            while let Some((frame, reply_frame)) = frame_rx.recv().await {
                let request = match Request::decode(frame) {
                    Ok(request) => request,
                    Err(error) => {
                        debug!(address = %bound, %error, "dropping undecodable frame");
                        continue;
                    }
                };
                let (reply_tx, reply_rx) = oneshot::channel();
                if request_tx.send((request, reply_tx)).is_err() {
                    // The server went away; stop pumping frames.
                    break;
                }
                tokio::spawn(async move {
                    if let Ok(response) = reply_rx.await {
                        let _ = reply_frame.send(response.encode());
                    }
                });
            }
        });

        Ok(request_rx)
    }

    async fn connect(&self, address: &Address) -> Result<Box<dyn Connection>, TransportError> {
        let sender = self
            .registry
            .lock()
            .expect("transport registry poisoned")
            .get(address)
            .cloned()
            .ok_or_else(|| TransportError::Unreachable(address.clone()))?;
        Ok(Box::new(LocalConnection { sender }))
    }
}

struct LocalConnection {
    sender: FrameSender,
}

#[async_trait]
impl Connection for LocalConnection {
    async fn send(&self, request: Request) -> Result<Response, TransportError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender
            .send((request.encode(), reply_tx))
            .map_err(|_| TransportError::Closed)?;
        let frame = reply_rx.await.map_err(|_| TransportError::Closed)?;
        Ok(Response::decode(frame)?)
    }
}
