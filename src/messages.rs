//! Logical messages exchanged with a companion device.
//!
//! A [`DeviceMessage`] is what the secure channel and its callers see. On the wire every
//! message travels inside a [`StreamMessage`] envelope tagged with an [`OperationType`], encoded
//! as CBOR.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::stream::StreamError;

/// Only messaging version 2 is supported.
pub const MESSAGING_VERSION: u32 = 2;
/// Only security version 2 is supported.
pub const SECURITY_VERSION: u32 = 2;

/// Distinguishes handshake control frames from application traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationType {
    EncryptionHandshake,
    ClientMessage,
}

/// A message to or from a remote device.
///
/// The payload is never mutated in place; encryption and decryption produce a new value via
/// [`DeviceMessage::with_payload`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceMessage {
    recipient: Option<Uuid>,
    encrypted: bool,
    payload: Vec<u8>,
}

impl DeviceMessage {
    pub fn new(recipient: Option<Uuid>, encrypted: bool, payload: Vec<u8>) -> Self {
        Self {
            recipient,
            encrypted,
            payload,
        }
    }

    /// Recipient feature id, if any. Handshake frames never carry one.
    pub fn recipient(&self) -> Option<Uuid> {
        self.recipient
    }

    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Returns a copy of this message carrying `payload` and the given encryption flag.
    #[must_use]
    pub fn with_payload(&self, encrypted: bool, payload: Vec<u8>) -> Self {
        Self {
            recipient: self.recipient,
            encrypted,
            payload,
        }
    }
}

/// Wire envelope for a [`DeviceMessage`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamMessage {
    pub operation: OperationType,
    pub recipient: Option<Uuid>,
    pub is_payload_encrypted: bool,
    pub payload: Vec<u8>,
}

impl StreamMessage {
    pub fn from_device_message(message: &DeviceMessage, operation: OperationType) -> Self {
        Self {
            operation,
            recipient: message.recipient(),
            is_payload_encrypted: message.is_encrypted(),
            payload: message.payload().to_vec(),
        }
    }

    pub fn into_device_message(self) -> (DeviceMessage, OperationType) {
        (
            DeviceMessage::new(self.recipient, self.is_payload_encrypted, self.payload),
            self.operation,
        )
    }

    pub fn encode(&self) -> Result<Vec<u8>, StreamError> {
        serde_cbor::to_vec(self).map_err(|e| StreamError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StreamError> {
        serde_cbor::from_slice(bytes).map_err(|e| StreamError::Decode(e.to_string()))
    }
}

/// First message exchanged on a packet stream; both sides advertise the version ranges they
/// support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionExchange {
    pub min_messaging_version: u32,
    pub max_messaging_version: u32,
    pub min_security_version: u32,
    pub max_security_version: u32,
}

impl VersionExchange {
    /// The single version pair this build speaks.
    pub fn supported() -> Self {
        Self {
            min_messaging_version: MESSAGING_VERSION,
            max_messaging_version: MESSAGING_VERSION,
            min_security_version: SECURITY_VERSION,
            max_security_version: SECURITY_VERSION,
        }
    }

    pub fn is_compatible(&self) -> bool {
        self.min_messaging_version <= MESSAGING_VERSION
            && self.max_messaging_version >= MESSAGING_VERSION
            && self.min_security_version <= SECURITY_VERSION
            && self.max_security_version >= SECURITY_VERSION
    }

    pub fn encode(&self) -> Result<Vec<u8>, StreamError> {
        serde_cbor::to_vec(self).map_err(|e| StreamError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StreamError> {
        serde_cbor::from_slice(bytes).map_err(|e| StreamError::Decode(e.to_string()))
    }
}
