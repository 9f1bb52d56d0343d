//! Stream for byte-oriented links (RFCOMM, serial) where each logical message is preceded
//! by its length as a 4-byte little-endian integer.

use std::sync::Arc;

use bytes::{Buf, BufMut, BytesMut};
use parking_lot::Mutex;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, error, warn};

use super::{DeviceMessageStream, FrameTransport, ListenerSlot, StreamError, StreamListener};
use crate::config::ChannelConfig;
use crate::messages::{DeviceMessage, OperationType, StreamMessage};

const LENGTH_BYTES: usize = 4;

/// Length-prefix framing with a bound on the declared length.
#[derive(Debug, Clone)]
pub struct LengthPrefixCodec {
    max_message_size: usize,
}

impl LengthPrefixCodec {
    pub fn new(max_message_size: usize) -> Self {
        Self { max_message_size }
    }
}

impl Decoder for LengthPrefixCodec {
    type Item = Vec<u8>;
    type Error = StreamError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LENGTH_BYTES {
            return Ok(None);
        }
        let mut prefix = [0u8; LENGTH_BYTES];
        prefix.copy_from_slice(&src[..LENGTH_BYTES]);
        let len = u32::from_le_bytes(prefix) as usize;
        if len > self.max_message_size {
            return Err(StreamError::MessageTooLarge {
                len,
                max: self.max_message_size,
            });
        }
        if src.len() < LENGTH_BYTES + len {
            src.reserve(LENGTH_BYTES + len - src.len());
            return Ok(None);
        }
        src.advance(LENGTH_BYTES);
        Ok(Some(src.split_to(len).to_vec()))
    }
}

impl Encoder<&[u8]> for LengthPrefixCodec {
    type Error = StreamError;

    fn encode(&mut self, item: &[u8], dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.len() > self.max_message_size {
            return Err(StreamError::MessageTooLarge {
                len: item.len(),
                max: self.max_message_size,
            });
        }
        let len = u32::try_from(item.len()).map_err(|_| StreamError::MessageTooLarge {
            len: item.len(),
            max: u32::MAX as usize,
        })?;
        dst.reserve(LENGTH_BYTES + item.len());
        dst.put_u32_le(len);
        dst.put_slice(item);
        Ok(())
    }
}

struct ReadState {
    codec: LengthPrefixCodec,
    buffer: BytesMut,
    /// Set once a length prefix is rejected; message boundaries are lost from then on.
    desynced: bool,
}

/// [`DeviceMessageStream`] over a byte stream that may split or merge writes arbitrarily.
pub struct LengthPrefixedStream<T: FrameTransport> {
    transport: T,
    codec: LengthPrefixCodec,
    read: Mutex<ReadState>,
    listener: ListenerSlot,
}

impl<T: FrameTransport> LengthPrefixedStream<T> {
    pub fn new(transport: T, config: &ChannelConfig) -> Self {
        let codec = LengthPrefixCodec::new(config.max_message_size);
        Self {
            transport,
            read: Mutex::new(ReadState {
                codec: codec.clone(),
                buffer: BytesMut::new(),
                desynced: false,
            }),
            codec,
            listener: ListenerSlot::default(),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Feeds raw link bytes; every completed message is delivered to the listener.
    ///
    /// After a rejected length prefix the stream drops all further input; the link has to be
    /// torn down and reopened.
    pub fn on_data_received(&self, data: &[u8]) {
        let mut frames = Vec::new();
        let mut failure = None;
        {
            let mut read = self.read.lock();
            let ReadState {
                codec,
                buffer,
                desynced,
            } = &mut *read;
            if *desynced {
                warn!(len = data.len(), "dropping bytes on desynchronised stream");
                return;
            }
            buffer.extend_from_slice(data);
            loop {
                match codec.decode(buffer) {
                    Ok(Some(frame)) => frames.push(frame),
                    Ok(None) => break,
                    Err(err) => {
                        buffer.clear();
                        *desynced = true;
                        failure = Some(err);
                        break;
                    }
                }
            }
        }

        for frame in frames {
            match StreamMessage::decode(&frame) {
                Ok(message) => {
                    let (message, operation) = message.into_device_message();
                    debug!(len = frame.len(), ?operation, "message received");
                    self.listener.message(message, operation);
                }
                Err(err) => {
                    error!(error = %err, "cannot parse device message");
                    self.listener.error(err);
                }
            }
        }
        if let Some(err) = failure {
            error!(error = %err, "discarding inbound buffer");
            self.listener.error(err);
        }
    }
}

impl<T: FrameTransport> DeviceMessageStream for LengthPrefixedStream<T> {
    fn write_message(
        &self,
        message: DeviceMessage,
        operation: OperationType,
    ) -> Result<(), StreamError> {
        let bytes = StreamMessage::from_device_message(&message, operation).encode()?;
        let mut frame = BytesMut::new();
        self.codec.clone().encode(&bytes[..], &mut frame)?;
        self.transport.send_frame(&frame)?;
        Ok(())
    }

    fn set_listener(&self, listener: Option<Arc<dyn StreamListener>>) {
        self.listener.set(listener);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(payload: &[u8]) -> Vec<u8> {
        let mut out = BytesMut::new();
        LengthPrefixCodec::new(1024).encode(payload, &mut out).unwrap();
        out.to_vec()
    }

    #[test]
    fn prefix_is_little_endian() {
        assert_eq!(frame(&[9, 9, 9]), vec![3, 0, 0, 0, 9, 9, 9]);
    }

    #[test]
    fn decodes_split_and_merged_reads() {
        let mut codec = LengthPrefixCodec::new(1024);
        let mut wire = frame(b"first");
        wire.extend(frame(b"second"));

        let mut buf = BytesMut::from(&wire[..3]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(&wire[3..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(b"first".to_vec()));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(b"second".to_vec()));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    struct Sink;

    impl FrameTransport for Sink {
        fn send_frame(&self, _bytes: &[u8]) -> Result<(), crate::transport::TransportError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct Capture {
        messages: Mutex<Vec<DeviceMessage>>,
        errors: Mutex<usize>,
    }

    impl StreamListener for Capture {
        fn on_message_received(&self, message: DeviceMessage, _operation: OperationType) {
            self.messages.lock().push(message);
        }

        fn on_message_received_error(&self, _error: StreamError) {
            *self.errors.lock() += 1;
        }
    }

    #[test]
    fn rejected_prefix_stops_the_stream() {
        let config = ChannelConfig {
            max_message_size: 64,
            ..ChannelConfig::default()
        };
        let stream = LengthPrefixedStream::new(Sink, &config);
        let capture = Arc::new(Capture::default());
        stream.set_listener(Some(capture.clone()));

        stream.on_data_received(&[0xff, 0xff, 0, 0]);
        let valid = StreamMessage::from_device_message(
            &DeviceMessage::new(None, false, vec![1]),
            OperationType::ClientMessage,
        )
        .encode()
        .unwrap();
        stream.on_data_received(&frame(&valid));

        assert_eq!(*capture.errors.lock(), 1);
        assert!(capture.messages.lock().is_empty());
    }

    #[test]
    fn oversized_length_is_rejected() {
        let mut codec = LengthPrefixCodec::new(8);
        let mut buf = BytesMut::from(&[100u8, 0, 0, 0][..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(StreamError::MessageTooLarge { len: 100, max: 8 })
        ));
    }
}
