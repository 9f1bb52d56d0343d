use std::io;
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;

use crate::messages::{DeviceMessage, OperationType};
use crate::transport::TransportError;

pub mod length_prefixed;
pub mod packet;

pub use length_prefixed::LengthPrefixedStream;
pub use packet::PacketStream;

/// Raw outbound sink for serialized frames (BLE characteristic, socket, pipe).
pub trait FrameTransport: Send + Sync {
    /// Sends the provided serialized frame.
    fn send_frame(&self, bytes: &[u8]) -> Result<(), TransportError>;
}

impl<T: FrameTransport + ?Sized> FrameTransport for Arc<T> {
    fn send_frame(&self, bytes: &[u8]) -> Result<(), TransportError> {
        (**self).send_frame(bytes)
    }
}

/// Receives reassembled logical messages from a [`DeviceMessageStream`].
pub trait StreamListener: Send + Sync {
    fn on_message_received(&self, message: DeviceMessage, operation: OperationType);
    fn on_message_received_error(&self, error: StreamError);
}

/// Duplex logical-message channel to a remote peer. Framing is entirely the stream's concern.
pub trait DeviceMessageStream: Send + Sync {
    fn write_message(
        &self,
        message: DeviceMessage,
        operation: OperationType,
    ) -> Result<(), StreamError>;

    /// Replaces the listener; `None` detaches it.
    fn set_listener(&self, listener: Option<Arc<dyn StreamListener>>);
}

/// Errors emitted by the framing layers.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("encode: {0}")]
    Encode(String),
    #[error("decode: {0}")]
    Decode(String),
    #[error("max write size {0} cannot fit a packet header")]
    WriteSizeTooSmall(usize),
    #[error("packet {got} of message {message_id} received out of order, expected {expected}")]
    OutOfOrder {
        message_id: u32,
        expected: u32,
        got: u32,
    },
    #[error("peer does not support messaging v{messaging} / security v{security}")]
    UnsupportedVersion { messaging: u32, security: u32 },
    #[error("message of {len} bytes exceeds limit of {max}")]
    MessageTooLarge { len: usize, max: usize },
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Single listener slot shared by the stream implementations.
#[derive(Default)]
pub(crate) struct ListenerSlot {
    listener: RwLock<Option<Arc<dyn StreamListener>>>,
}

impl ListenerSlot {
    pub(crate) fn set(&self, listener: Option<Arc<dyn StreamListener>>) {
        *self.listener.write() = listener;
    }

    fn current(&self) -> Option<Arc<dyn StreamListener>> {
        self.listener.read().clone()
    }

    pub(crate) fn message(&self, message: DeviceMessage, operation: OperationType) {
        if let Some(listener) = self.current() {
            listener.on_message_received(message, operation);
        }
    }

    pub(crate) fn error(&self, error: StreamError) {
        if let Some(listener) = self.current() {
            listener.on_message_received_error(error);
        }
    }
}
