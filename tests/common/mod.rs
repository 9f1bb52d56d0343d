#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use companion::{
    ChannelError, ChannelErrorCode, DeviceMessage, DeviceMessageStream, EncryptionRunner,
    HandshakeError, HandshakeMessage, InMemorySecretStore, OperationType, SecretStore,
    SecureChannelCallback, ShowVerificationCodeListener, StorageError, StreamError,
    StreamListener,
};
use uuid::Uuid;
use zeroize::Zeroizing;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Init(Vec<u8>),
    Continue(Vec<u8>),
    Verify,
    Reconnect { message: Vec<u8>, previous_key: Vec<u8> },
}

type Reply = Result<HandshakeMessage, HandshakeError>;

/// Replies queued per engine operation, plus a log of every call.
#[derive(Default)]
pub struct Script {
    pub init: VecDeque<Reply>,
    pub continue_handshake: VecDeque<Reply>,
    pub verify: VecDeque<Reply>,
    pub reconnect: VecDeque<Reply>,
    pub calls: Vec<Call>,
    pub is_reconnect: bool,
}

fn next(queue: &mut VecDeque<Reply>) -> Reply {
    queue
        .pop_front()
        .unwrap_or_else(|| Err(HandshakeError::Protocol("unscripted call".into())))
}

/// Engine whose replies are fixed by the test.
pub struct ScriptedRunner(pub Arc<Mutex<Script>>);

impl ScriptedRunner {
    pub fn new() -> (Box<Self>, Arc<Mutex<Script>>) {
        let script = Arc::new(Mutex::new(Script::default()));
        (Box::new(Self(script.clone())), script)
    }
}

impl EncryptionRunner for ScriptedRunner {
    fn respond_to_init_request(&mut self, message: &[u8]) -> Reply {
        let mut script = self.0.lock().unwrap();
        script.calls.push(Call::Init(message.to_vec()));
        next(&mut script.init)
    }

    fn continue_handshake(&mut self, message: &[u8]) -> Reply {
        let mut script = self.0.lock().unwrap();
        script.calls.push(Call::Continue(message.to_vec()));
        next(&mut script.continue_handshake)
    }

    fn verify_pin(&mut self) -> Reply {
        let mut script = self.0.lock().unwrap();
        script.calls.push(Call::Verify);
        next(&mut script.verify)
    }

    fn authenticate_reconnection(&mut self, message: &[u8], previous_key: &[u8]) -> Reply {
        let mut script = self.0.lock().unwrap();
        script.calls.push(Call::Reconnect {
            message: message.to_vec(),
            previous_key: previous_key.to_vec(),
        });
        next(&mut script.reconnect)
    }

    fn set_is_reconnect(&mut self, is_reconnect: bool) {
        self.0.lock().unwrap().is_reconnect = is_reconnect;
    }
}

/// Stream that records writes and lets the test inject inbound frames.
#[derive(Default)]
pub struct RecordingStream {
    pub written: Mutex<Vec<(DeviceMessage, OperationType)>>,
    listener: Mutex<Option<Arc<dyn StreamListener>>>,
    pub fail_writes: AtomicBool,
}

impl RecordingStream {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn deliver(&self, message: DeviceMessage, operation: OperationType) {
        let listener = self.listener.lock().unwrap().clone();
        if let Some(listener) = listener {
            listener.on_message_received(message, operation);
        }
    }

    pub fn deliver_handshake(&self, payload: &[u8]) {
        self.deliver(
            DeviceMessage::new(None, false, payload.to_vec()),
            OperationType::EncryptionHandshake,
        );
    }

    pub fn deliver_error(&self, error: StreamError) {
        let listener = self.listener.lock().unwrap().clone();
        if let Some(listener) = listener {
            listener.on_message_received_error(error);
        }
    }

    pub fn has_listener(&self) -> bool {
        self.listener.lock().unwrap().is_some()
    }

    pub fn written(&self) -> Vec<(DeviceMessage, OperationType)> {
        self.written.lock().unwrap().clone()
    }

    pub fn last_written(&self) -> Option<(DeviceMessage, OperationType)> {
        self.written.lock().unwrap().last().cloned()
    }
}

impl DeviceMessageStream for RecordingStream {
    fn write_message(
        &self,
        message: DeviceMessage,
        operation: OperationType,
    ) -> Result<(), StreamError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StreamError::Encode("write refused".into()));
        }
        self.written.lock().unwrap().push((message, operation));
        Ok(())
    }

    fn set_listener(&self, listener: Option<Arc<dyn StreamListener>>) {
        *self.listener.lock().unwrap() = listener;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observed {
    Established,
    Failure(ChannelErrorCode),
    Message(DeviceMessage),
    MessageError(String),
    DeviceId(Uuid),
}

#[derive(Default)]
pub struct RecordingCallback {
    pub events: Mutex<Vec<Observed>>,
}

impl RecordingCallback {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<Observed> {
        self.events.lock().unwrap().clone()
    }

    pub fn failures(&self) -> Vec<ChannelErrorCode> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Observed::Failure(code) => Some(code),
                _ => None,
            })
            .collect()
    }
}

impl SecureChannelCallback for RecordingCallback {
    fn on_secure_channel_established(&self) {
        self.events.lock().unwrap().push(Observed::Established);
    }

    fn on_establish_secure_channel_failure(&self, code: ChannelErrorCode) {
        self.events.lock().unwrap().push(Observed::Failure(code));
    }

    fn on_message_received(&self, message: &DeviceMessage) {
        self.events
            .lock()
            .unwrap()
            .push(Observed::Message(message.clone()));
    }

    fn on_message_received_error(&self, error: &ChannelError) {
        self.events
            .lock()
            .unwrap()
            .push(Observed::MessageError(error.to_string()));
    }

    fn on_device_id_received(&self, device_id: Uuid) {
        self.events.lock().unwrap().push(Observed::DeviceId(device_id));
    }
}

#[derive(Default)]
pub struct CodeCapture {
    pub codes: Mutex<Vec<String>>,
}

impl ShowVerificationCodeListener for CodeCapture {
    fn show_verification_code(&self, code: &str) {
        self.codes.lock().unwrap().push(code.to_string());
    }
}

/// In-memory store whose writes can be made to fail.
#[derive(Default)]
pub struct FlakyStore {
    pub inner: InMemorySecretStore,
    pub fail_key_writes: AtomicBool,
    pub fail_secret_writes: AtomicBool,
}

impl FlakyStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl SecretStore for FlakyStore {
    fn unique_id(&self) -> Uuid {
        self.inner.unique_id()
    }

    fn encryption_key(&self, device_id: &Uuid) -> Result<Option<Zeroizing<Vec<u8>>>, StorageError> {
        self.inner.encryption_key(device_id)
    }

    fn save_encryption_key(&self, device_id: &Uuid, key: &[u8]) -> Result<(), StorageError> {
        if self.fail_key_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Corrupt("disk full".into()));
        }
        self.inner.save_encryption_key(device_id, key)
    }

    fn challenge_secret(
        &self,
        device_id: &Uuid,
    ) -> Result<Option<Zeroizing<Vec<u8>>>, StorageError> {
        self.inner.challenge_secret(device_id)
    }

    fn save_challenge_secret(&self, device_id: &Uuid, secret: &[u8]) -> Result<(), StorageError> {
        if self.fail_secret_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Corrupt("disk full".into()));
        }
        self.inner.save_challenge_secret(device_id, secret)
    }

    fn forget_device(&self, device_id: &Uuid) -> Result<(), StorageError> {
        self.inner.forget_device(device_id)
    }
}
