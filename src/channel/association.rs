//! First-time association.
//!
//! ```text
//! Unknown ──init──► InProgress ──continue──► VerificationNeeded ──user accepts──► Finished
//!                                   └──────► OobVerificationNeeded ──peer code──┘
//! Finished ──(device id ‖ challenge secret)──► Established
//! ```

use subtle::ConstantTimeEq;
use tracing::{debug, error};
use uuid::Uuid;
use zeroize::Zeroizing;

use super::{
    engine_failure, ChannelErrorCode, ChannelKind, Event, Inner, SecureChannel, Step,
    Verification,
};
use crate::handshake::HandshakeState;

const DEVICE_ID_BYTES: usize = 16;

impl SecureChannel {
    pub(super) fn process_association(
        &self,
        inner: &mut Inner,
        payload: &[u8],
        events: &mut Vec<Event>,
    ) -> Step {
        match inner.handshake_state {
            HandshakeState::Unknown => self.association_init(inner, payload),
            HandshakeState::InProgress => self.association_continue(inner, payload, events),
            HandshakeState::OobVerificationNeeded => self.association_peer_code(inner, payload),
            HandshakeState::Finished => self.association_final(inner, payload, events),
            state => {
                error!(?state, "unexpected association frame");
                Err(ChannelErrorCode::InvalidState)
            }
        }
    }

    fn association_init(&self, inner: &mut Inner, payload: &[u8]) -> Step {
        let reply = inner
            .runner
            .respond_to_init_request(payload)
            .map_err(|err| engine_failure("init", err, ChannelErrorCode::InvalidHandshake))?;
        self.advance(inner, reply.state)?;
        let next = reply.next_message.ok_or(ChannelErrorCode::InvalidMsg)?;
        self.send_handshake(inner, &next, false)
    }

    fn association_continue(
        &self,
        inner: &mut Inner,
        payload: &[u8],
        events: &mut Vec<Event>,
    ) -> Step {
        let reply = inner
            .runner
            .continue_handshake(payload)
            .map_err(|err| engine_failure("continue", err, ChannelErrorCode::InvalidHandshake))?;
        let out_of_band = matches!(
            inner.kind,
            ChannelKind::Association {
                verification: Verification::OutOfBand { .. },
                ..
            }
        );

        if !out_of_band {
            if reply.state != HandshakeState::VerificationNeeded {
                error!(state = ?reply.state, "expected verification to be needed");
                return Err(ChannelErrorCode::InvalidState);
            }
            let code = reply
                .verification_code
                .ok_or(ChannelErrorCode::InvalidVerification)?;
            let listener = self.code_listener.read().clone().ok_or_else(|| {
                error!("no listener to show the verification code");
                ChannelErrorCode::InvalidState
            })?;
            self.advance(inner, reply.state)?;
            events.push(Event::ShowCode(listener, code));
            return Ok(());
        }

        if reply.state != HandshakeState::OobVerificationNeeded {
            error!(state = ?reply.state, "expected out-of-band verification to be needed");
            return Err(ChannelErrorCode::InvalidState);
        }
        let code = Zeroizing::new(
            reply
                .oob_verification_code
                .ok_or(ChannelErrorCode::InvalidVerification)?,
        );
        let encrypted = match &mut inner.kind {
            ChannelKind::Association {
                verification: Verification::OutOfBand { cipher, code: slot },
                ..
            } => {
                let encrypted = cipher.encrypt_code(&code).map_err(|err| {
                    error!(error = %err, "cannot encrypt verification code");
                    ChannelErrorCode::InvalidHandshake
                })?;
                *slot = Some(code);
                encrypted
            }
            _ => return Err(ChannelErrorCode::InvalidState),
        };
        self.advance(inner, reply.state)?;
        self.send_handshake(inner, &encrypted, false)
    }

    /// Compares the peer's encrypted out-of-band code with ours and accepts on a match.
    fn association_peer_code(&self, inner: &mut Inner, payload: &[u8]) -> Step {
        let matched = match &inner.kind {
            ChannelKind::Association {
                verification: Verification::OutOfBand { cipher, code: Some(code) },
                ..
            } => {
                let peer = Zeroizing::new(cipher.decrypt_code(payload).map_err(|err| {
                    error!(error = %err, "cannot decrypt peer verification code");
                    ChannelErrorCode::InvalidHandshake
                })?);
                bool::from(peer.as_slice().ct_eq(code.as_slice()))
            }
            _ => return Err(ChannelErrorCode::InvalidState),
        };
        if !matched {
            error!("out-of-band verification codes differ");
            return Err(ChannelErrorCode::InvalidVerification);
        }
        self.accept_verification(inner)
    }

    /// Runs the engine's verify step and sends our unique id, encrypted, to the peer.
    pub(super) fn accept_verification(&self, inner: &mut Inner) -> Step {
        let reply = inner
            .runner
            .verify_pin()
            .map_err(|err| engine_failure("verify", err, ChannelErrorCode::InvalidVerification))?;
        if reply.state != HandshakeState::Finished {
            error!(state = ?reply.state, "verification did not finish the handshake");
            return Err(ChannelErrorCode::InvalidState);
        }
        let key = reply.key.ok_or(ChannelErrorCode::InvalidEncryptionKey)?;
        self.advance(inner, HandshakeState::Finished)?;
        self.set_encryption_key(inner, key.clone())?;
        if let ChannelKind::Association { pending_key, .. } = &mut inner.kind {
            *pending_key = Some(key);
        }
        let unique_id = self.store.unique_id();
        debug!("verification accepted, sending unique id");
        self.send_handshake(inner, unique_id.as_bytes(), true)
    }

    /// Final frame: the peer's device id followed by the challenge secret.
    fn association_final(&self, inner: &mut Inner, payload: &[u8], events: &mut Vec<Event>) -> Step {
        let device_id = parse_device_id(payload)?;
        let secret = Zeroizing::new(payload[DEVICE_ID_BYTES..].to_vec());

        let key = match &mut inner.kind {
            ChannelKind::Association { pending_key, .. } => pending_key.take(),
            ChannelKind::Reconnection { .. } => None,
        }
        .ok_or(ChannelErrorCode::InvalidEncryptionKey)?;

        self.store
            .save_encryption_key(&device_id, key.as_bytes())
            .map_err(|err| {
                error!(error = %err, "failed to persist encryption key");
                ChannelErrorCode::StorageError
            })?;
        self.store
            .save_challenge_secret(&device_id, &secret)
            .map_err(|err| {
                error!(error = %err, "failed to persist challenge secret");
                ChannelErrorCode::StorageError
            })?;

        if let ChannelKind::Association { device_id: slot, .. } = &mut inner.kind {
            *slot = Some(device_id);
        }
        debug!(device = %device_id, "association device id received");
        events.push(Event::DeviceId(device_id));
        self.establish(inner, events)
    }
}

/// First 16 bytes of the final frame; a nil id is as malformed as a short one.
fn parse_device_id(payload: &[u8]) -> Result<Uuid, ChannelErrorCode> {
    if payload.len() < DEVICE_ID_BYTES {
        error!(len = payload.len(), "final frame too short for a device id");
        return Err(ChannelErrorCode::InvalidDeviceId);
    }
    let id = Uuid::from_slice(&payload[..DEVICE_ID_BYTES])
        .map_err(|_| ChannelErrorCode::InvalidDeviceId)?;
    if id.is_nil() {
        error!("final frame carries a nil device id");
        return Err(ChannelErrorCode::InvalidDeviceId);
    }
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_id_requires_sixteen_bytes() {
        assert_eq!(
            parse_device_id(&[1u8; 15]),
            Err(ChannelErrorCode::InvalidDeviceId)
        );
        assert_eq!(
            parse_device_id(&[0u8; 48]),
            Err(ChannelErrorCode::InvalidDeviceId)
        );
        let id = Uuid::new_v4();
        let mut payload = id.as_bytes().to_vec();
        payload.extend_from_slice(&[7u8; 32]);
        assert_eq!(parse_device_id(&payload), Ok(id));
    }
}
