//! Secure channel over a [`DeviceMessageStream`].
//!
//! A channel drives an [`EncryptionRunner`] with inbound handshake frames until a session key
//! is agreed, then encrypts outbound client messages and decrypts inbound ones. The handshake
//! itself depends on the [`ChannelKind`]: first-time association or reconnection of a known
//! device.
//!
//! # Threading
//! All state-machine work for one channel runs under a single mutex, so frames are processed
//! strictly in arrival order. Callbacks are dispatched after the mutex is released; listeners
//! may call back into the channel. Streams must not deliver inbound frames synchronously from
//! inside [`DeviceMessageStream::write_message`].

use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tracing::{debug, error, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::crypto::{CryptoError, OobChannel, OobCipher, OobError, SessionKey};
use crate::handshake::{EncryptionRunner, HandshakeError, HandshakeState};
use crate::messages::{DeviceMessage, OperationType};
use crate::storage::SecretStore;
use crate::stream::{DeviceMessageStream, StreamError, StreamListener};

mod association;
pub mod callbacks;
mod reconnection;
pub mod state;

pub use callbacks::ThreadSafeCallbacks;
pub use state::ChannelPhase;

/// Reason a handshake was abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelErrorCode {
    /// A handshake frame arrived in a state that does not expect it.
    InvalidState,
    /// The engine could not produce or confirm a verification code.
    InvalidVerification,
    /// The device id prefix of the final association frame is malformed.
    InvalidDeviceId,
    /// Secret persistence failed.
    StorageError,
    /// No usable key, or the peer failed the challenge.
    InvalidEncryptionKey,
    /// An expected outbound message was missing or could not be sent.
    InvalidMsg,
    /// The engine rejected a handshake frame.
    InvalidHandshake,
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("secure channel has no encryption key yet")]
    NotEstablished,
    #[error("failed to encrypt message: {0}")]
    Encryption(CryptoError),
    #[error("failed to decrypt message: {0}")]
    Decryption(CryptoError),
    #[error("received unencrypted client message")]
    UnencryptedMessage,
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error("secure channel closed")]
    Closed,
    #[error("secure channel failed: {0:?}")]
    Failed(ChannelErrorCode),
}

/// Lifecycle events of a secure channel. Every method defaults to a no-op.
pub trait SecureChannelCallback: Send + Sync {
    fn on_secure_channel_established(&self) {}
    fn on_establish_secure_channel_failure(&self, _code: ChannelErrorCode) {}
    fn on_message_received(&self, _message: &DeviceMessage) {}
    fn on_message_received_error(&self, _error: &ChannelError) {}
    fn on_device_id_received(&self, _device_id: Uuid) {}
}

/// Displays the association verification code to the user.
pub trait ShowVerificationCodeListener: Send + Sync {
    fn show_verification_code(&self, code: &str);
}

impl<F> ShowVerificationCodeListener for F
where
    F: Fn(&str) + Send + Sync,
{
    fn show_verification_code(&self, code: &str) {
        self(code)
    }
}

/// How the user confirms a first-time association.
pub enum Verification {
    /// A 6-digit code shown to the user and confirmed on both devices.
    Visual,
    /// Codes swapped over the link, encrypted with a token delivered out of band.
    OutOfBand {
        cipher: OobCipher,
        code: Option<Zeroizing<Vec<u8>>>,
    },
}

/// Handshake flavour with its variant-specific state.
pub enum ChannelKind {
    Association {
        verification: Verification,
        pending_key: Option<SessionKey>,
        device_id: Option<Uuid>,
    },
    Reconnection {
        device_id: Uuid,
        expected_challenge_response: Option<Zeroizing<Vec<u8>>>,
        has_verified_device: bool,
    },
}

impl ChannelKind {
    fn name(&self) -> &'static str {
        match self {
            ChannelKind::Association { .. } => "association",
            ChannelKind::Reconnection { .. } => "reconnection",
        }
    }
}

pub(crate) struct Inner {
    runner: Box<dyn EncryptionRunner>,
    kind: ChannelKind,
    handshake_state: HandshakeState,
    phase: ChannelPhase,
    encryption_key: Option<SessionKey>,
}

/// Callback work collected under the channel lock and delivered after it is released.
pub(crate) enum Event {
    Established,
    Failed(ChannelErrorCode),
    Message(DeviceMessage),
    MessageError(ChannelError),
    DeviceId(Uuid),
    ShowCode(Arc<dyn ShowVerificationCodeListener>, String),
}

pub(crate) type Step = Result<(), ChannelErrorCode>;

/// Engine failures keep their sequencing meaning; anything else becomes `fallback`.
pub(crate) fn engine_failure(
    step: &'static str,
    err: HandshakeError,
    fallback: ChannelErrorCode,
) -> ChannelErrorCode {
    error!(step, error = %err, "key exchange engine failed");
    match err {
        HandshakeError::InvalidState(_) => ChannelErrorCode::InvalidState,
        _ => fallback,
    }
}

pub struct SecureChannel {
    stream: Arc<dyn DeviceMessageStream>,
    store: Arc<dyn SecretStore>,
    inner: Mutex<Inner>,
    callbacks: ThreadSafeCallbacks<dyn SecureChannelCallback>,
    code_listener: RwLock<Option<Arc<dyn ShowVerificationCodeListener>>>,
}

impl SecureChannel {
    /// First-time association confirmed by a code shown to the user.
    pub fn association(
        stream: Arc<dyn DeviceMessageStream>,
        store: Arc<dyn SecretStore>,
        runner: Box<dyn EncryptionRunner>,
    ) -> Arc<Self> {
        Self::build(
            stream,
            store,
            runner,
            ChannelKind::Association {
                verification: Verification::Visual,
                pending_key: None,
                device_id: None,
            },
        )
    }

    /// First-time association confirmed through an out-of-band token.
    ///
    /// The token is generated and pushed to `oob_channel` before the channel is returned.
    pub fn oob_association(
        stream: Arc<dyn DeviceMessageStream>,
        store: Arc<dyn SecretStore>,
        runner: Box<dyn EncryptionRunner>,
        oob_channel: &dyn OobChannel,
    ) -> Result<Arc<Self>, OobError> {
        let cipher = OobCipher::start_exchange(oob_channel)?;
        Ok(Self::build(
            stream,
            store,
            runner,
            ChannelKind::Association {
                verification: Verification::OutOfBand { cipher, code: None },
                pending_key: None,
                device_id: None,
            },
        ))
    }

    /// Reconnection of `device_id`, whose key and challenge secret are already stored.
    ///
    /// Without an `expected_challenge_response` the device verification step is skipped.
    pub fn reconnection(
        stream: Arc<dyn DeviceMessageStream>,
        store: Arc<dyn SecretStore>,
        mut runner: Box<dyn EncryptionRunner>,
        device_id: Uuid,
        expected_challenge_response: Option<Vec<u8>>,
    ) -> Arc<Self> {
        runner.set_is_reconnect(true);
        let has_verified_device = expected_challenge_response.is_none();
        if has_verified_device {
            warn!(device = %device_id, "reconnecting without device verification");
        }
        Self::build(
            stream,
            store,
            runner,
            ChannelKind::Reconnection {
                device_id,
                expected_challenge_response: expected_challenge_response.map(Zeroizing::new),
                has_verified_device,
            },
        )
    }

    fn build(
        stream: Arc<dyn DeviceMessageStream>,
        store: Arc<dyn SecretStore>,
        runner: Box<dyn EncryptionRunner>,
        kind: ChannelKind,
    ) -> Arc<Self> {
        debug!(kind = kind.name(), "creating secure channel");
        let channel = Arc::new(Self {
            stream: stream.clone(),
            store,
            inner: Mutex::new(Inner {
                runner,
                kind,
                handshake_state: HandshakeState::Unknown,
                phase: ChannelPhase::Handshaking,
                encryption_key: None,
            }),
            callbacks: ThreadSafeCallbacks::new(),
            code_listener: RwLock::new(None),
        });
        stream.set_listener(Some(Arc::new(ChannelStreamListener {
            channel: Arc::downgrade(&channel),
        })));
        channel
    }

    pub fn register_callback(&self, callback: Arc<dyn SecureChannelCallback>) -> bool {
        self.callbacks.register(callback)
    }

    pub fn unregister_callback(&self, callback: &Arc<dyn SecureChannelCallback>) -> bool {
        self.callbacks.unregister(callback)
    }

    /// Replaces the verification code listener; `None` clears it.
    pub fn set_show_verification_code_listener(
        &self,
        listener: Option<Arc<dyn ShowVerificationCodeListener>>,
    ) {
        *self.code_listener.write() = listener;
    }

    pub fn handshake_state(&self) -> HandshakeState {
        self.inner.lock().handshake_state
    }

    pub fn phase(&self) -> ChannelPhase {
        self.inner.lock().phase
    }

    pub fn is_established(&self) -> bool {
        self.phase() == ChannelPhase::Established
    }

    pub fn encryption_key(&self) -> Option<SessionKey> {
        self.inner.lock().encryption_key.clone()
    }

    /// The peer's device id: known up front for reconnections, after the final frame for
    /// associations.
    pub fn device_id(&self) -> Option<Uuid> {
        match &self.inner.lock().kind {
            ChannelKind::Association { device_id, .. } => *device_id,
            ChannelKind::Reconnection { device_id, .. } => Some(*device_id),
        }
    }

    pub fn has_verified_device(&self) -> bool {
        match &self.inner.lock().kind {
            ChannelKind::Association { .. } => false,
            ChannelKind::Reconnection {
                has_verified_device,
                ..
            } => *has_verified_device,
        }
    }

    /// Encrypts `message` with the session key and writes it to the stream.
    ///
    /// Sending before a key is agreed is a caller bug: the channel fails with
    /// [`ChannelErrorCode::InvalidState`] and [`ChannelError::NotEstablished`] is returned.
    pub fn send_client_message(&self, message: DeviceMessage) -> Result<(), ChannelError> {
        let mut events = Vec::new();
        let result = {
            let mut inner = self.inner.lock();
            self.send_client_locked(&mut inner, message, &mut events)
        };
        self.dispatch(events);
        result
    }

    fn send_client_locked(
        &self,
        inner: &mut Inner,
        message: DeviceMessage,
        events: &mut Vec<Event>,
    ) -> Result<(), ChannelError> {
        match inner.phase {
            ChannelPhase::Closed => return Err(ChannelError::Closed),
            ChannelPhase::Failed(code) => return Err(ChannelError::Failed(code)),
            _ => {}
        }
        let key = match &inner.encryption_key {
            Some(key) => key,
            None => {
                error!("client message sent before the encryption key was set");
                self.fail(inner, ChannelErrorCode::InvalidState, events);
                return Err(ChannelError::NotEstablished);
            }
        };
        let encrypted = key
            .encrypt_data(message.payload())
            .map_err(ChannelError::Encryption)?;
        self.stream
            .write_message(message.with_payload(true, encrypted), OperationType::ClientMessage)?;
        Ok(())
    }

    /// Confirms the verification code was accepted by the user.
    ///
    /// Finalizes the key, then sends this device's unique id to the peer, encrypted.
    pub fn notify_out_of_band_accepted(&self) {
        let mut events = Vec::new();
        {
            let mut inner = self.inner.lock();
            if !inner.phase.is_handshaking() {
                warn!(phase = ?inner.phase, "verification accepted on inactive channel");
            } else if !matches!(inner.kind, ChannelKind::Association { .. })
                || !matches!(
                    inner.handshake_state,
                    HandshakeState::VerificationNeeded | HandshakeState::OobVerificationNeeded
                )
            {
                self.fail(&mut inner, ChannelErrorCode::InvalidState, &mut events);
            } else if let Err(code) = self.accept_verification(&mut inner) {
                self.fail(&mut inner, code, &mut events);
            }
        }
        self.dispatch(events);
    }

    /// Tears the channel down: key material is wiped, callbacks and the stream listener are
    /// detached and no further callbacks fire.
    pub fn close(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.phase.transition(ChannelPhase::Closed).is_err() {
                return;
            }
            wipe_secrets(&mut inner);
            debug!(kind = inner.kind.name(), "secure channel closed");
        }
        self.callbacks.clear();
        *self.code_listener.write() = None;
        self.stream.set_listener(None);
    }

    fn on_stream_message(&self, message: DeviceMessage, operation: OperationType) {
        let mut events = Vec::new();
        {
            let mut inner = self.inner.lock();
            match operation {
                OperationType::EncryptionHandshake => {
                    self.on_handshake_frame(&mut inner, message, &mut events)
                }
                OperationType::ClientMessage => {
                    self.on_client_frame(&mut inner, message, &mut events)
                }
            }
        }
        self.dispatch(events);
    }

    fn on_stream_error(&self, err: StreamError) {
        if self.phase() == ChannelPhase::Closed {
            return;
        }
        warn!(error = %err, "stream reported an error");
        self.dispatch(vec![Event::MessageError(ChannelError::Stream(err))]);
    }

    fn on_handshake_frame(&self, inner: &mut Inner, message: DeviceMessage, events: &mut Vec<Event>) {
        if !inner.phase.is_handshaking() {
            warn!(phase = ?inner.phase, "ignoring handshake frame");
            return;
        }
        let payload = if message.is_encrypted() {
            // Before a key exists an encrypted frame is out of sequence.
            let decrypted = match &inner.encryption_key {
                Some(key) => key
                    .decrypt_data(message.payload())
                    .map_err(|err| (ChannelError::Decryption(err), ChannelErrorCode::InvalidHandshake)),
                None => Err((ChannelError::NotEstablished, ChannelErrorCode::InvalidState)),
            };
            match decrypted {
                Ok(payload) => payload,
                Err((err, code)) => {
                    error!(error = %err, "cannot read encrypted handshake frame");
                    events.push(Event::MessageError(err));
                    self.fail(inner, code, events);
                    return;
                }
            }
        } else {
            message.into_payload()
        };

        let step = match inner.kind {
            ChannelKind::Association { .. } => self.process_association(inner, &payload, events),
            ChannelKind::Reconnection { .. } => self.process_reconnection(inner, &payload, events),
        };
        if let Err(code) = step {
            self.fail(inner, code, events);
        }
    }

    fn on_client_frame(&self, inner: &mut Inner, message: DeviceMessage, events: &mut Vec<Event>) {
        match inner.phase {
            ChannelPhase::Closed => return,
            ChannelPhase::Failed(code) => {
                warn!(error = ?code, "dropping client message on failed channel");
                events.push(Event::MessageError(ChannelError::Failed(code)));
                return;
            }
            _ => {}
        }
        if !message.is_encrypted() {
            warn!("dropping unencrypted client message");
            events.push(Event::MessageError(ChannelError::UnencryptedMessage));
            return;
        }
        let key = match &inner.encryption_key {
            Some(key) => key,
            None => {
                warn!("client message received before the encryption key was set");
                events.push(Event::MessageError(ChannelError::NotEstablished));
                return;
            }
        };
        match key.decrypt_data(message.payload()) {
            Ok(plain) => events.push(Event::Message(message.with_payload(false, plain))),
            Err(err) => {
                error!(error = %err, "failed to decrypt client message");
                events.push(Event::MessageError(ChannelError::Decryption(err)));
            }
        }
    }

    /// Moves to `next` unless that would regress the handshake.
    fn advance(&self, inner: &mut Inner, next: HandshakeState) -> Step {
        if !inner.handshake_state.can_advance_to(next) {
            error!(from = ?inner.handshake_state, to = ?next, "handshake state regression");
            return Err(ChannelErrorCode::InvalidState);
        }
        debug!(from = ?inner.handshake_state, to = ?next, "handshake state");
        inner.handshake_state = next;
        Ok(())
    }

    /// Sets the session key; a channel never holds two different keys.
    fn set_encryption_key(&self, inner: &mut Inner, key: SessionKey) -> Step {
        if inner.encryption_key.is_some() {
            error!("encryption key already set");
            return Err(ChannelErrorCode::InvalidState);
        }
        inner.encryption_key = Some(key);
        Ok(())
    }

    /// Sends a handshake frame with no recipient, encrypted with the session key if asked.
    fn send_handshake(&self, inner: &Inner, bytes: &[u8], encrypt: bool) -> Step {
        let payload = if encrypt {
            let key = inner
                .encryption_key
                .as_ref()
                .ok_or(ChannelErrorCode::InvalidEncryptionKey)?;
            key.encrypt_data(bytes)
                .map_err(|_| ChannelErrorCode::InvalidEncryptionKey)?
        } else {
            bytes.to_vec()
        };
        self.stream
            .write_message(
                DeviceMessage::new(None, encrypt, payload),
                OperationType::EncryptionHandshake,
            )
            .map_err(|err| {
                error!(error = %err, "failed to send handshake frame");
                ChannelErrorCode::InvalidMsg
            })
    }

    fn establish(&self, inner: &mut Inner, events: &mut Vec<Event>) -> Step {
        inner
            .phase
            .transition(ChannelPhase::Established)
            .map_err(|_| ChannelErrorCode::InvalidState)?;
        debug!(kind = inner.kind.name(), "secure channel established");
        events.push(Event::Established);
        Ok(())
    }

    /// Terminal failure; reported at most once per channel. Key material is dropped with it.
    fn fail(&self, inner: &mut Inner, code: ChannelErrorCode, events: &mut Vec<Event>) {
        match inner.phase.transition(ChannelPhase::Failed(code)) {
            Ok(()) => {
                error!(error = ?code, kind = inner.kind.name(), "secure channel failed");
                wipe_secrets(inner);
                events.push(Event::Failed(code));
            }
            Err(_) => {
                debug!(error = ?code, phase = ?inner.phase, "failure after channel ended");
            }
        }
    }

    fn dispatch(&self, events: Vec<Event>) {
        for event in events {
            match event {
                Event::Established => self
                    .callbacks
                    .for_each(|cb| cb.on_secure_channel_established()),
                Event::Failed(code) => self
                    .callbacks
                    .for_each(|cb| cb.on_establish_secure_channel_failure(code)),
                Event::Message(message) => {
                    self.callbacks.for_each(|cb| cb.on_message_received(&message))
                }
                Event::MessageError(err) => self
                    .callbacks
                    .for_each(|cb| cb.on_message_received_error(&err)),
                Event::DeviceId(id) => self.callbacks.for_each(|cb| cb.on_device_id_received(id)),
                Event::ShowCode(listener, code) => listener.show_verification_code(&code),
            }
        }
    }
}

impl std::fmt::Debug for SecureChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("SecureChannel")
            .field("kind", &inner.kind.name())
            .field("handshake_state", &inner.handshake_state)
            .field("phase", &inner.phase)
            .finish_non_exhaustive()
    }
}

/// Drops every key and verification secret the channel holds.
fn wipe_secrets(inner: &mut Inner) {
    inner.encryption_key = None;
    match &mut inner.kind {
        ChannelKind::Association {
            pending_key,
            verification,
            ..
        } => {
            *pending_key = None;
            if let Verification::OutOfBand { code, .. } = verification {
                *code = None;
            }
        }
        ChannelKind::Reconnection {
            expected_challenge_response,
            ..
        } => *expected_challenge_response = None,
    }
}

/// Stream listener holding a weak reference, so a dropped channel stops receiving.
struct ChannelStreamListener {
    channel: Weak<SecureChannel>,
}

impl StreamListener for ChannelStreamListener {
    fn on_message_received(&self, message: DeviceMessage, operation: OperationType) {
        match self.channel.upgrade() {
            Some(channel) => channel.on_stream_message(message, operation),
            None => debug!("message for dropped channel"),
        }
    }

    fn on_message_received_error(&self, error: StreamError) {
        if let Some(channel) = self.channel.upgrade() {
            channel.on_stream_error(error);
        }
    }
}
