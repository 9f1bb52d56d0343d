//! Async link plumbing used by callers to move raw frames between a stream and a peer.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time;
use tracing::debug;

use crate::stream::FrameTransport;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("link closed")]
    Closed,
    #[error("recv timeout after {0:?}")]
    Timeout(Duration),
    #[error("io error: {0}")]
    Io(String),
}

/// Bidirectional raw-frame link.
#[async_trait]
pub trait LinkTransport {
    async fn send(&mut self, frame: Vec<u8>) -> Result<(), TransportError>;
    async fn recv(&mut self) -> Result<Vec<u8>, TransportError>;
}

/// In-process link built on unbounded tokio channels.
#[derive(Debug)]
pub struct PipeTransport {
    tx: UnboundedSender<Vec<u8>>,
    rx: UnboundedReceiver<Vec<u8>>,
}

impl PipeTransport {
    /// Two connected ends: frames sent on one are received on the other.
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            Self { tx: a_tx, rx: b_rx },
            Self { tx: b_tx, rx: a_rx },
        )
    }

    /// Synchronous handle for the outbound direction.
    pub fn writer(&self) -> PipeWriter {
        PipeWriter {
            tx: self.tx.clone(),
        }
    }
}

#[async_trait]
impl LinkTransport for PipeTransport {
    async fn send(&mut self, frame: Vec<u8>) -> Result<(), TransportError> {
        self.tx.send(frame).map_err(|_| TransportError::Closed)
    }

    async fn recv(&mut self) -> Result<Vec<u8>, TransportError> {
        self.rx.recv().await.ok_or(TransportError::Closed)
    }
}

/// Clonable sender half of a [`PipeTransport`]; usable from synchronous stream code.
#[derive(Debug, Clone)]
pub struct PipeWriter {
    tx: UnboundedSender<Vec<u8>>,
}

impl FrameTransport for PipeWriter {
    fn send_frame(&self, bytes: &[u8]) -> Result<(), TransportError> {
        self.tx
            .send(bytes.to_vec())
            .map_err(|_| TransportError::Closed)
    }
}

/// Wrapper that enforces per-message timeouts on recv.
#[derive(Debug)]
pub struct TimeoutTransport<T> {
    inner: T,
    recv_timeout: Duration,
}

impl<T> TimeoutTransport<T> {
    pub fn new(inner: T, recv_timeout: Duration) -> Self {
        Self {
            inner,
            recv_timeout,
        }
    }

    pub fn into_inner(self) -> T {
        self.inner
    }
}

#[async_trait]
impl<T> LinkTransport for TimeoutTransport<T>
where
    T: LinkTransport + Send,
{
    async fn send(&mut self, frame: Vec<u8>) -> Result<(), TransportError> {
        self.inner.send(frame).await
    }

    async fn recv(&mut self) -> Result<Vec<u8>, TransportError> {
        match time::timeout(self.recv_timeout, self.inner.recv()).await {
            Ok(res) => res,
            Err(_) => Err(TransportError::Timeout(self.recv_timeout)),
        }
    }
}

/// Feeds every received frame to `on_frame` until the link fails; returns the failure.
pub async fn pump_inbound<T, F>(transport: &mut T, mut on_frame: F) -> TransportError
where
    T: LinkTransport + Send,
    F: FnMut(Vec<u8>) + Send,
{
    loop {
        match transport.recv().await {
            Ok(frame) => {
                debug!(len = frame.len(), "inbound frame");
                on_frame(frame);
            }
            Err(err) => {
                debug!(error = %err, "inbound pump stopped");
                return err;
            }
        }
    }
}
