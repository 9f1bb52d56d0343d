//! Packetized stream for links with a small maximum write size (BLE GATT characteristics).
//!
//! Every packet starts with a 12-byte big-endian header:
//!
//! ```text
//! | message_id u32 | packet_number u32 (1-based) | total_packets u32 | payload ... |
//! ```
//!
//! The first inbound frame on a link is a [`VersionExchange`]; packets flow only after it.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, warn};

use super::{DeviceMessageStream, FrameTransport, ListenerSlot, StreamError, StreamListener};
use crate::config::ChannelConfig;
use crate::messages::{
    DeviceMessage, OperationType, StreamMessage, VersionExchange, MESSAGING_VERSION,
    SECURITY_VERSION,
};

pub const PACKET_HEADER_BYTES: usize = 12;

/// Partially received messages kept at once; the oldest is dropped to make room.
pub const MAX_PENDING_MESSAGES: usize = 4;

/// One chunk of a logical message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub message_id: u32,
    pub packet_number: u32,
    pub total_packets: u32,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(PACKET_HEADER_BYTES + self.payload.len());
        out.extend_from_slice(&self.message_id.to_be_bytes());
        out.extend_from_slice(&self.packet_number.to_be_bytes());
        out.extend_from_slice(&self.total_packets.to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, StreamError> {
        if bytes.len() < PACKET_HEADER_BYTES {
            return Err(StreamError::Decode(format!(
                "packet of {} bytes is shorter than its header",
                bytes.len()
            )));
        }
        let word = |i: usize| {
            let mut raw = [0u8; 4];
            raw.copy_from_slice(&bytes[i * 4..i * 4 + 4]);
            u32::from_be_bytes(raw)
        };
        let packet = Self {
            message_id: word(0),
            packet_number: word(1),
            total_packets: word(2),
            payload: bytes[PACKET_HEADER_BYTES..].to_vec(),
        };
        if packet.packet_number == 0 || packet.packet_number > packet.total_packets {
            return Err(StreamError::Decode(format!(
                "packet number {} outside 1..={}",
                packet.packet_number, packet.total_packets
            )));
        }
        Ok(packet)
    }
}

/// Splits `data` into packets no larger than `max_write_size` bytes each.
pub fn make_packets(
    data: &[u8],
    message_id: u32,
    max_write_size: usize,
) -> Result<Vec<Packet>, StreamError> {
    if max_write_size <= PACKET_HEADER_BYTES {
        return Err(StreamError::WriteSizeTooSmall(max_write_size));
    }
    let chunk = max_write_size - PACKET_HEADER_BYTES;
    let count = data.len().div_ceil(chunk).max(1);
    let total_packets = u32::try_from(count).map_err(|_| StreamError::MessageTooLarge {
        len: data.len(),
        max: chunk.saturating_mul(u32::MAX as usize),
    })?;
    if data.is_empty() {
        return Ok(vec![Packet {
            message_id,
            packet_number: 1,
            total_packets,
            payload: Vec::new(),
        }]);
    }
    Ok(data
        .chunks(chunk)
        .zip(1u32..)
        .map(|(payload, packet_number)| Packet {
            message_id,
            packet_number,
            total_packets,
            payload: payload.to_vec(),
        })
        .collect())
}

/// Which end of the version exchange this stream plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionRole {
    /// Waits for the peer's versions and answers with its own.
    Responder,
    /// Sends its versions first via [`PacketStream::begin_version_exchange`].
    Initiator,
}

#[derive(Debug, Default)]
struct Outbound {
    next_message_id: u32,
    queue: VecDeque<Vec<u8>>,
    in_flight: bool,
}

#[derive(Debug)]
struct Reassembly {
    next_packet: u32,
    data: Vec<u8>,
    started: u64,
}

#[derive(Debug, Default)]
struct Inbound {
    version_exchanged: bool,
    pending: HashMap<u32, Reassembly>,
    started: u64,
    last_completed: Option<(u32, u32)>,
}

impl Inbound {
    fn evict_oldest(&mut self) {
        let oldest = self
            .pending
            .iter()
            .min_by_key(|(_, r)| r.started)
            .map(|(id, _)| *id);
        if let Some(id) = oldest {
            warn!(message_id = id, "dropping stale partial message");
            self.pending.remove(&id);
        }
    }
}

enum PacketOutcome {
    Partial,
    Duplicate,
    Complete(Vec<u8>),
}

/// Chunking [`DeviceMessageStream`] with one packet in flight at a time.
///
/// The link must call [`PacketStream::send_completed`] after each frame is acknowledged
/// and [`PacketStream::on_data_received`] for every inbound frame.
pub struct PacketStream<T: FrameTransport> {
    transport: T,
    role: VersionRole,
    max_write_size: AtomicUsize,
    max_message_size: usize,
    outbound: Mutex<Outbound>,
    inbound: Mutex<Inbound>,
    listener: ListenerSlot,
}

impl<T: FrameTransport> PacketStream<T> {
    pub fn new(transport: T, config: &ChannelConfig) -> Result<Self, StreamError> {
        Self::with_role(transport, config, VersionRole::Responder)
    }

    pub fn with_role(
        transport: T,
        config: &ChannelConfig,
        role: VersionRole,
    ) -> Result<Self, StreamError> {
        if config.max_write_size <= PACKET_HEADER_BYTES {
            return Err(StreamError::WriteSizeTooSmall(config.max_write_size));
        }
        Ok(Self {
            transport,
            role,
            max_write_size: AtomicUsize::new(config.max_write_size),
            max_message_size: config.max_message_size,
            outbound: Mutex::new(Outbound::default()),
            inbound: Mutex::new(Inbound::default()),
            listener: ListenerSlot::default(),
        })
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Updates the packet size after MTU negotiation.
    pub fn set_max_write_size(&self, max_write_size: usize) -> Result<(), StreamError> {
        if max_write_size <= PACKET_HEADER_BYTES {
            return Err(StreamError::WriteSizeTooSmall(max_write_size));
        }
        self.max_write_size.store(max_write_size, Ordering::Relaxed);
        Ok(())
    }

    /// Initiator only: sends the supported versions to the peer.
    pub fn begin_version_exchange(&self) -> Result<(), StreamError> {
        let bytes = VersionExchange::supported().encode()?;
        self.transport.send_frame(&bytes)?;
        debug!("sent supported versions");
        Ok(())
    }

    pub fn is_version_exchanged(&self) -> bool {
        self.inbound.lock().version_exchanged
    }

    /// Marks the in-flight packet as delivered and sends the next queued one.
    pub fn send_completed(&self) {
        self.outbound.lock().in_flight = false;
        if let Err(err) = self.write_next() {
            error!(error = %err, "failed to send queued packet");
            self.listener.error(err);
        }
    }

    /// Entry point for every frame read from the link.
    pub fn on_data_received(&self, data: &[u8]) {
        let exchanged = self.inbound.lock().version_exchanged;
        if !exchanged {
            if let Err(err) = self.process_version_exchange(data) {
                error!(error = %err, "version exchange failed");
                self.listener.error(err);
            }
            return;
        }

        let result = Packet::parse(data).and_then(|packet| self.process_packet(packet));
        match result {
            Ok(PacketOutcome::Complete(bytes)) => match StreamMessage::decode(&bytes) {
                Ok(message) => {
                    let (message, operation) = message.into_device_message();
                    self.listener.message(message, operation);
                }
                Err(err) => {
                    error!(error = %err, "cannot parse device message");
                    self.listener.error(err);
                }
            },
            Ok(PacketOutcome::Partial) | Ok(PacketOutcome::Duplicate) => {}
            Err(err) => {
                error!(error = %err, "dropping inbound packet");
                self.listener.error(err);
            }
        }
    }

    fn process_version_exchange(&self, data: &[u8]) -> Result<(), StreamError> {
        let peer = VersionExchange::decode(data)?;
        if !peer.is_compatible() {
            return Err(StreamError::UnsupportedVersion {
                messaging: MESSAGING_VERSION,
                security: SECURITY_VERSION,
            });
        }
        if self.role == VersionRole::Responder {
            let ours = VersionExchange::supported().encode()?;
            self.transport.send_frame(&ours)?;
        }
        self.inbound.lock().version_exchanged = true;
        debug!(role = ?self.role, "version exchange complete");
        Ok(())
    }

    fn process_packet(&self, packet: Packet) -> Result<PacketOutcome, StreamError> {
        let mut inbound = self.inbound.lock();
        let id = packet.message_id;
        let expected = inbound.pending.get(&id).map_or(1, |r| r.next_packet);

        let is_last_dup = inbound.last_completed == Some((id, packet.packet_number));
        if is_last_dup || (expected > 1 && packet.packet_number == expected - 1) {
            warn!(message_id = id, packet = packet.packet_number, "duplicate packet ignored");
            return Ok(PacketOutcome::Duplicate);
        }
        if packet.packet_number != expected {
            inbound.pending.remove(&id);
            return Err(StreamError::OutOfOrder {
                message_id: id,
                expected,
                got: packet.packet_number,
            });
        }

        if !inbound.pending.contains_key(&id) {
            while inbound.pending.len() >= MAX_PENDING_MESSAGES {
                inbound.evict_oldest();
            }
            inbound.started += 1;
        }
        let started = inbound.started;
        let reassembly = inbound.pending.entry(id).or_insert_with(|| Reassembly {
            next_packet: 1,
            data: Vec::new(),
            started,
        });
        let len = reassembly.data.len() + packet.payload.len();
        if len > self.max_message_size {
            inbound.pending.remove(&id);
            return Err(StreamError::MessageTooLarge {
                len,
                max: self.max_message_size,
            });
        }
        reassembly.data.extend_from_slice(&packet.payload);
        reassembly.next_packet = packet.packet_number + 1;

        if packet.packet_number != packet.total_packets {
            return Ok(PacketOutcome::Partial);
        }
        let data = inbound
            .pending
            .remove(&id)
            .map(|r| r.data)
            .unwrap_or_default();
        inbound.last_completed = Some((id, packet.packet_number));
        debug!(message_id = id, len = data.len(), "message reassembled");
        Ok(PacketOutcome::Complete(data))
    }

    fn write_next(&self) -> Result<(), StreamError> {
        let frame = {
            let mut outbound = self.outbound.lock();
            if outbound.in_flight {
                return Ok(());
            }
            match outbound.queue.pop_front() {
                Some(frame) => {
                    outbound.in_flight = true;
                    frame
                }
                None => return Ok(()),
            }
        };
        if let Err(err) = self.transport.send_frame(&frame) {
            self.outbound.lock().in_flight = false;
            return Err(err.into());
        }
        Ok(())
    }
}

impl<T: FrameTransport> DeviceMessageStream for PacketStream<T> {
    fn write_message(
        &self,
        message: DeviceMessage,
        operation: OperationType,
    ) -> Result<(), StreamError> {
        let bytes = StreamMessage::from_device_message(&message, operation).encode()?;
        if bytes.len() > self.max_message_size {
            return Err(StreamError::MessageTooLarge {
                len: bytes.len(),
                max: self.max_message_size,
            });
        }
        {
            let mut outbound = self.outbound.lock();
            let message_id = outbound.next_message_id;
            outbound.next_message_id = message_id.wrapping_add(1);
            let packets =
                make_packets(&bytes, message_id, self.max_write_size.load(Ordering::Relaxed))?;
            debug!(message_id, packets = packets.len(), ?operation, "queued message");
            outbound
                .queue
                .extend(packets.iter().map(Packet::to_bytes));
        }
        self.write_next()
    }

    fn set_listener(&self, listener: Option<Arc<dyn StreamListener>>) {
        self.listener.set(listener);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportError;

    #[derive(Default)]
    struct Sink(Mutex<Vec<Vec<u8>>>);

    impl FrameTransport for Sink {
        fn send_frame(&self, bytes: &[u8]) -> Result<(), TransportError> {
            self.0.lock().push(bytes.to_vec());
            Ok(())
        }
    }

    #[derive(Default)]
    struct Capture {
        messages: Mutex<Vec<(DeviceMessage, OperationType)>>,
        errors: Mutex<Vec<String>>,
    }

    impl StreamListener for Capture {
        fn on_message_received(&self, message: DeviceMessage, operation: OperationType) {
            self.messages.lock().push((message, operation));
        }

        fn on_message_received_error(&self, error: StreamError) {
            self.errors.lock().push(error.to_string());
        }
    }

    fn exchanged_stream(write_size: usize) -> (PacketStream<Arc<Sink>>, Arc<Sink>, Arc<Capture>) {
        let sink = Arc::new(Sink::default());
        let config = ChannelConfig {
            max_write_size: write_size,
            ..ChannelConfig::default()
        };
        let stream = PacketStream::new(sink.clone(), &config).unwrap();
        let capture = Arc::new(Capture::default());
        stream.set_listener(Some(capture.clone()));
        stream.on_data_received(&VersionExchange::supported().encode().unwrap());
        assert!(stream.is_version_exchanged());
        (stream, sink, capture)
    }

    #[test]
    fn chunks_respect_write_size() {
        let packets = make_packets(&[7u8; 25], 3, 22).unwrap();
        assert_eq!(packets.len(), 3);
        assert!(packets.iter().all(|p| p.to_bytes().len() <= 22));
        assert_eq!(packets[2].packet_number, 3);
        assert_eq!(packets[2].total_packets, 3);
        assert_eq!(packets[2].payload.len(), 5);
        assert!(matches!(
            make_packets(&[1], 0, PACKET_HEADER_BYTES),
            Err(StreamError::WriteSizeTooSmall(12))
        ));
    }

    #[test]
    fn responder_answers_version_exchange() {
        let (_, sink, capture) = exchanged_stream(185);
        let sent = sink.0.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(
            VersionExchange::decode(&sent[0]).unwrap(),
            VersionExchange::supported()
        );
        assert!(capture.errors.lock().is_empty());
    }

    #[test]
    fn incompatible_versions_are_reported() {
        let sink = Arc::new(Sink::default());
        let stream = PacketStream::new(sink.clone(), &ChannelConfig::default()).unwrap();
        let capture = Arc::new(Capture::default());
        stream.set_listener(Some(capture.clone()));
        let old = VersionExchange {
            min_messaging_version: 1,
            max_messaging_version: 1,
            ..VersionExchange::supported()
        };
        stream.on_data_received(&old.encode().unwrap());
        assert!(!stream.is_version_exchanged());
        assert!(sink.0.lock().is_empty());
        assert_eq!(capture.errors.lock().len(), 1);
    }

    #[test]
    fn one_packet_in_flight_until_completed() {
        let (stream, sink, _) = exchanged_stream(20);
        sink.0.lock().clear();
        let message = DeviceMessage::new(None, false, vec![1u8; 40]);
        stream
            .write_message(message, OperationType::ClientMessage)
            .unwrap();
        assert_eq!(sink.0.lock().len(), 1);
        stream.send_completed();
        assert_eq!(sink.0.lock().len(), 2);
    }

    #[test]
    fn reassembles_and_ignores_duplicates() {
        let (stream, _, capture) = exchanged_stream(185);
        let message = DeviceMessage::new(None, true, vec![5u8; 64]);
        let bytes = StreamMessage::from_device_message(&message, OperationType::EncryptionHandshake)
            .encode()
            .unwrap();
        let packets = make_packets(&bytes, 9, 32).unwrap();
        assert!(packets.len() > 2);

        stream.on_data_received(&packets[0].to_bytes());
        stream.on_data_received(&packets[0].to_bytes());
        for packet in &packets[1..] {
            stream.on_data_received(&packet.to_bytes());
        }
        stream.on_data_received(&packets[packets.len() - 1].to_bytes());

        let received = capture.messages.lock();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0], (message, OperationType::EncryptionHandshake));
        assert!(capture.errors.lock().is_empty());
    }

    #[test]
    fn out_of_order_packet_is_an_error() {
        let (stream, _, capture) = exchanged_stream(185);
        let packets = make_packets(&[1u8; 100], 4, 32).unwrap();
        stream.on_data_received(&packets[0].to_bytes());
        stream.on_data_received(&packets[2].to_bytes());
        assert!(capture.messages.lock().is_empty());
        let errors = capture.errors.lock();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("out of order"));
    }

    #[test]
    fn abandoned_messages_do_not_accumulate() {
        let (stream, _, capture) = exchanged_stream(185);
        let message = DeviceMessage::new(None, false, vec![3u8; 64]);
        let bytes = StreamMessage::from_device_message(&message, OperationType::ClientMessage)
            .encode()
            .unwrap();
        for id in 0..32u32 {
            let packets = make_packets(&bytes, id, 32).unwrap();
            stream.on_data_received(&packets[0].to_bytes());
        }
        assert_eq!(stream.inbound.lock().pending.len(), MAX_PENDING_MESSAGES);

        // The newest partial message is still completed.
        let packets = make_packets(&bytes, 31, 32).unwrap();
        for packet in &packets[1..] {
            stream.on_data_received(&packet.to_bytes());
        }
        assert!(capture.errors.lock().is_empty());
        assert_eq!(capture.messages.lock().len(), 1);

        // The oldest one was dropped, so its continuation is out of order.
        let packets = make_packets(&bytes, 0, 32).unwrap();
        stream.on_data_received(&packets[1].to_bytes());
        assert_eq!(capture.errors.lock().len(), 1);
        assert_eq!(stream.inbound.lock().pending.len(), MAX_PENDING_MESSAGES - 1);
    }

    #[test]
    fn message_ids_wrap() {
        let (stream, sink, _) = exchanged_stream(185);
        stream.outbound.lock().next_message_id = u32::MAX;
        for _ in 0..2 {
            stream
                .write_message(DeviceMessage::new(None, false, vec![1]), OperationType::ClientMessage)
                .unwrap();
            stream.send_completed();
        }
        let sent = sink.0.lock();
        assert_eq!(Packet::parse(&sent[1]).unwrap().message_id, u32::MAX);
        assert_eq!(Packet::parse(&sent[2]).unwrap().message_id, 0);
    }
}
