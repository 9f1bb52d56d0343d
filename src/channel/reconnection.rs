//! Reconnection of a previously associated device.
//!
//! ```text
//! Unknown (unverified) ──challenge response ‖ device challenge──► Unknown (verified)
//! Unknown (verified) ──init──► InProgress ──continue──► ResumingSession
//! ResumingSession ──resume proof──► Finished + Established (key rotated)
//! ```

use subtle::ConstantTimeEq;
use tracing::{debug, error};

use super::{engine_failure, ChannelErrorCode, ChannelKind, Event, Inner, SecureChannel, Step};
use crate::handshake::HandshakeState;

impl SecureChannel {
    pub(super) fn process_reconnection(
        &self,
        inner: &mut Inner,
        payload: &[u8],
        events: &mut Vec<Event>,
    ) -> Step {
        let verified = match &inner.kind {
            ChannelKind::Reconnection {
                has_verified_device,
                ..
            } => *has_verified_device,
            ChannelKind::Association { .. } => return Err(ChannelErrorCode::InvalidState),
        };
        match inner.handshake_state {
            HandshakeState::Unknown if !verified => self.verify_device(inner, payload),
            HandshakeState::Unknown => self.reconnection_init(inner, payload),
            HandshakeState::InProgress => self.reconnection_continue(inner, payload),
            HandshakeState::ResumingSession => self.resume_session(inner, payload, events),
            state => {
                error!(?state, "unexpected reconnection frame");
                Err(ChannelErrorCode::InvalidState)
            }
        }
    }

    /// Checks the peer's challenge response, then proves our own knowledge of the challenge
    /// secret by hashing the challenge the peer issued.
    fn verify_device(&self, inner: &mut Inner, payload: &[u8]) -> Step {
        let (device_id, n) = match &inner.kind {
            ChannelKind::Reconnection {
                device_id,
                expected_challenge_response: Some(expected),
                ..
            } => {
                let n = expected.len();
                // A short frame is treated as a failed response, not a parse error.
                let matched =
                    payload.len() >= n && bool::from(payload[..n].ct_eq(expected.as_slice()));
                if !matched {
                    error!(device = %device_id, "challenge response mismatch");
                    return Err(ChannelErrorCode::InvalidEncryptionKey);
                }
                (*device_id, n)
            }
            _ => return Err(ChannelErrorCode::InvalidState),
        };
        let challenge = &payload[n..];

        let proof = self
            .store
            .hash_with_challenge_secret(&device_id, challenge)
            .map_err(|err| {
                error!(device = %device_id, error = %err, "cannot answer device challenge");
                ChannelErrorCode::StorageError
            })?;
        self.send_handshake(inner, &proof, false)?;

        if let ChannelKind::Reconnection {
            has_verified_device,
            ..
        } = &mut inner.kind
        {
            *has_verified_device = true;
        }
        debug!(device = %device_id, "device verified");
        Ok(())
    }

    fn reconnection_init(&self, inner: &mut Inner, payload: &[u8]) -> Step {
        let reply = inner
            .runner
            .respond_to_init_request(payload)
            .map_err(|err| engine_failure("init", err, ChannelErrorCode::InvalidHandshake))?;
        self.advance(inner, reply.state)?;
        let next = reply.next_message.ok_or(ChannelErrorCode::InvalidMsg)?;
        self.send_handshake(inner, &next, false)
    }

    /// The engine decides between verification and resumption; its state is stored as-is.
    fn reconnection_continue(&self, inner: &mut Inner, payload: &[u8]) -> Step {
        let reply = inner
            .runner
            .continue_handshake(payload)
            .map_err(|err| engine_failure("continue", err, ChannelErrorCode::InvalidHandshake))?;
        self.advance(inner, reply.state)?;
        match reply.next_message {
            Some(next) => self.send_handshake(inner, &next, false),
            None => Ok(()),
        }
    }

    /// Authenticates the resumed session with the stored key and rotates it.
    fn resume_session(&self, inner: &mut Inner, payload: &[u8], events: &mut Vec<Event>) -> Step {
        let device_id = match &inner.kind {
            ChannelKind::Reconnection { device_id, .. } => *device_id,
            ChannelKind::Association { .. } => return Err(ChannelErrorCode::InvalidState),
        };
        let previous = self
            .store
            .encryption_key(&device_id)
            .map_err(|err| {
                error!(device = %device_id, error = %err, "cannot load previous key");
                ChannelErrorCode::StorageError
            })?
            .ok_or_else(|| {
                error!(device = %device_id, "no previous key stored");
                ChannelErrorCode::InvalidEncryptionKey
            })?;

        let reply = inner
            .runner
            .authenticate_reconnection(payload, &previous)
            .map_err(|err| engine_failure("resume", err, ChannelErrorCode::InvalidHandshake))?;
        if reply.state != HandshakeState::Finished {
            error!(state = ?reply.state, "reconnection did not finish the handshake");
            return Err(ChannelErrorCode::InvalidState);
        }
        let key = reply.key.ok_or(ChannelErrorCode::InvalidEncryptionKey)?;
        let next = reply.next_message.ok_or(ChannelErrorCode::InvalidMsg)?;

        self.store
            .save_encryption_key(&device_id, key.as_bytes())
            .map_err(|err| {
                error!(device = %device_id, error = %err, "failed to persist rotated key");
                ChannelErrorCode::StorageError
            })?;
        self.advance(inner, HandshakeState::Finished)?;
        self.set_encryption_key(inner, key)?;
        self.send_handshake(inner, &next, false)?;
        debug!(device = %device_id, "session resumed");
        self.establish(inner, events)
    }
}
