//! X25519 key agreement with commitment, in the shape of UKEY2.
//!
//! ```text
//! phone (initiator)                          car (runner)
//!   ClientInit { SHA256(pk_c), r_c }   ->
//!                                      <-    ServerInit { pk_s, r_s }           InProgress
//!   ClientFinished { pk_c }            ->                                       VerificationNeeded
//!                                                                               | OobVerificationNeeded
//!                                                                               | ResumingSession
//! ```
//!
//! Both sides derive an auth string from the DH output salted with the transcript hash. A
//! first-time association turns it into a 6-digit code for the user; a reconnection instead
//! proves knowledge of the previously stored key with HMACs over the auth string.

use hkdf::Hkdf;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use x25519_dalek::{EphemeralSecret, PublicKey};
use zeroize::Zeroizing;

use super::{EncryptionRunner, HandshakeError, HandshakeMessage, HandshakeState};
use crate::crypto::{hmac_sha256, random_bytes, verify_hmac_sha256, SessionKey, KEY_BYTES};

const PUBLIC_KEY_BYTES: usize = 32;
const RANDOM_BYTES: usize = 32;
const AUTH_STRING_BYTES: usize = 32;
const VERIFICATION_CODE_MODULUS: u32 = 1_000_000;

const AUTH_INFO: &[u8] = b"companion auth string";
const SESSION_KEY_INFO: &[u8] = b"companion session key";
const RESUMED_KEY_INFO: &[u8] = b"companion resumed key";
const CLIENT_PREFIX: &[u8] = b"CLIENT";
const SERVER_PREFIX: &[u8] = b"SERVER";

#[derive(Debug, Serialize, Deserialize)]
struct ClientInit {
    commitment: Vec<u8>,
    random: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ServerInit {
    public_key: Vec<u8>,
    random: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ClientFinished {
    public_key: Vec<u8>,
}

/// Key material shared by both ends once the DH completes.
struct Agreement {
    shared: Zeroizing<[u8; 32]>,
    salt: [u8; 32],
    auth_string: Zeroizing<Vec<u8>>,
}

impl Agreement {
    fn derive(secret: EphemeralSecret, peer: &[u8], transcript: &[u8]) -> Result<Self, HandshakeError> {
        let peer = public_key(peer)?;
        let shared = secret.diffie_hellman(&peer);
        if !shared.was_contributory() {
            return Err(HandshakeError::Crypto("non-contributory public key".into()));
        }
        let shared = Zeroizing::new(*shared.as_bytes());
        let salt: [u8; 32] = Sha256::digest(transcript).into();
        let auth_string = expand(&salt, &shared[..], AUTH_INFO, AUTH_STRING_BYTES)?;
        Ok(Self {
            shared,
            salt,
            auth_string,
        })
    }

    fn verification_code(&self) -> String {
        let mut head = [0u8; 4];
        head.copy_from_slice(&self.auth_string[..4]);
        format!("{:06}", u32::from_be_bytes(head) % VERIFICATION_CODE_MODULUS)
    }

    fn session_key(&self) -> Result<SessionKey, HandshakeError> {
        let okm = expand(&self.salt, &self.shared[..], SESSION_KEY_INFO, KEY_BYTES)?;
        SessionKey::from_bytes(&okm).map_err(|e| HandshakeError::Crypto(e.to_string()))
    }

    fn resumed_key(&self, previous_key: &[u8]) -> Result<SessionKey, HandshakeError> {
        let mut ikm = Zeroizing::new(Vec::with_capacity(previous_key.len() + 32));
        ikm.extend_from_slice(previous_key);
        ikm.extend_from_slice(&self.shared[..]);
        let okm = expand(&self.auth_string, &ikm, RESUMED_KEY_INFO, KEY_BYTES)?;
        SessionKey::from_bytes(&okm).map_err(|e| HandshakeError::Crypto(e.to_string()))
    }

    fn client_auth(&self, previous_key: &[u8]) -> Vec<u8> {
        hmac_sha256(previous_key, &[CLIENT_PREFIX, &self.auth_string[..]])
    }

    fn server_auth(&self, previous_key: &[u8]) -> Vec<u8> {
        hmac_sha256(previous_key, &[SERVER_PREFIX, &self.auth_string[..]])
    }
}

fn expand(salt: &[u8], ikm: &[u8], info: &[u8], len: usize) -> Result<Zeroizing<Vec<u8>>, HandshakeError> {
    let mut okm = Zeroizing::new(vec![0u8; len]);
    Hkdf::<Sha256>::new(Some(salt), ikm)
        .expand(info, &mut okm)
        .map_err(|e| HandshakeError::Crypto(e.to_string()))?;
    Ok(okm)
}

fn public_key(bytes: &[u8]) -> Result<PublicKey, HandshakeError> {
    let raw: [u8; PUBLIC_KEY_BYTES] = bytes
        .try_into()
        .map_err(|_| HandshakeError::Protocol(format!("public key length {}", bytes.len())))?;
    Ok(PublicKey::from(raw))
}

fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, HandshakeError> {
    serde_cbor::from_slice(bytes).map_err(|e| HandshakeError::Protocol(format!("decode: {}", e)))
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, HandshakeError> {
    serde_cbor::to_vec(value).map_err(|e| HandshakeError::Protocol(format!("encode: {}", e)))
}

/// Responder side of the exchange, driven by the secure channel.
pub struct X25519Runner {
    state: HandshakeState,
    is_reconnect: bool,
    out_of_band: bool,
    secret: Option<EphemeralSecret>,
    commitment: Vec<u8>,
    transcript: Vec<u8>,
    agreement: Option<Agreement>,
}

impl X25519Runner {
    /// Runner for the visual-code association flow.
    pub fn new() -> Self {
        Self {
            state: HandshakeState::Unknown,
            is_reconnect: false,
            out_of_band: false,
            secret: None,
            commitment: Vec::new(),
            transcript: Vec::new(),
            agreement: None,
        }
    }

    /// Runner that reports [`HandshakeState::OobVerificationNeeded`] with a raw code.
    pub fn out_of_band() -> Self {
        Self {
            out_of_band: true,
            ..Self::new()
        }
    }

    /// Runner preconfigured for the reconnection flow.
    pub fn reconnect() -> Self {
        Self {
            is_reconnect: true,
            ..Self::new()
        }
    }

    fn expect_state(&self, allowed: &[HandshakeState]) -> Result<(), HandshakeError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(HandshakeError::InvalidState(self.state))
        }
    }

    fn agreement(&self) -> Result<&Agreement, HandshakeError> {
        self.agreement
            .as_ref()
            .ok_or(HandshakeError::InvalidState(self.state))
    }
}

impl Default for X25519Runner {
    fn default() -> Self {
        Self::new()
    }
}

impl EncryptionRunner for X25519Runner {
    fn respond_to_init_request(&mut self, message: &[u8]) -> Result<HandshakeMessage, HandshakeError> {
        self.expect_state(&[HandshakeState::Unknown])?;
        let init: ClientInit = decode(message)?;
        if init.commitment.len() != 32 || init.random.len() != RANDOM_BYTES {
            return Err(HandshakeError::Protocol("malformed client init".into()));
        }

        let secret = EphemeralSecret::random_from_rng(OsRng);
        let response = encode(&ServerInit {
            public_key: PublicKey::from(&secret).as_bytes().to_vec(),
            random: random_bytes(RANDOM_BYTES),
        })?;

        self.secret = Some(secret);
        self.commitment = init.commitment;
        self.transcript.extend_from_slice(message);
        self.transcript.extend_from_slice(&response);
        self.state = HandshakeState::InProgress;
        Ok(HandshakeMessage::new(self.state).with_next_message(response))
    }

    fn continue_handshake(&mut self, message: &[u8]) -> Result<HandshakeMessage, HandshakeError> {
        self.expect_state(&[HandshakeState::InProgress])?;
        let finished: ClientFinished = decode(message)?;
        let digest = Sha256::digest(&finished.public_key);
        if !bool::from(digest.as_slice().ct_eq(&self.commitment)) {
            return Err(HandshakeError::Authentication("commitment mismatch".into()));
        }
        let secret = self
            .secret
            .take()
            .ok_or(HandshakeError::InvalidState(self.state))?;
        self.transcript.extend_from_slice(message);
        let agreement = Agreement::derive(secret, &finished.public_key, &self.transcript)?;

        let reply = if self.is_reconnect {
            self.state = HandshakeState::ResumingSession;
            HandshakeMessage::new(self.state)
        } else if self.out_of_band {
            self.state = HandshakeState::OobVerificationNeeded;
            HandshakeMessage::new(self.state)
                .with_oob_verification_code(agreement.auth_string.to_vec())
        } else {
            self.state = HandshakeState::VerificationNeeded;
            HandshakeMessage::new(self.state).with_verification_code(agreement.verification_code())
        };
        self.agreement = Some(agreement);
        Ok(reply)
    }

    fn verify_pin(&mut self) -> Result<HandshakeMessage, HandshakeError> {
        self.expect_state(&[
            HandshakeState::VerificationNeeded,
            HandshakeState::OobVerificationNeeded,
        ])?;
        let key = self.agreement()?.session_key()?;
        self.state = HandshakeState::Finished;
        Ok(HandshakeMessage::new(self.state).with_key(key))
    }

    fn authenticate_reconnection(
        &mut self,
        message: &[u8],
        previous_key: &[u8],
    ) -> Result<HandshakeMessage, HandshakeError> {
        self.expect_state(&[HandshakeState::ResumingSession])?;
        let agreement = self.agreement()?;
        if !verify_hmac_sha256(previous_key, &[CLIENT_PREFIX, &agreement.auth_string[..]], message) {
            return Err(HandshakeError::Authentication(
                "client reconnection proof rejected".into(),
            ));
        }
        let key = agreement.resumed_key(previous_key)?;
        let server_auth = agreement.server_auth(previous_key);
        self.state = HandshakeState::Finished;
        Ok(HandshakeMessage::new(self.state)
            .with_key(key)
            .with_next_message(server_auth))
    }

    fn set_is_reconnect(&mut self, is_reconnect: bool) {
        self.is_reconnect = is_reconnect;
    }
}

/// Initiator side of the exchange, as run by the companion device.
pub struct X25519Initiator {
    secret: Option<EphemeralSecret>,
    public: PublicKey,
    transcript: Vec<u8>,
    agreement: Option<Agreement>,
}

impl X25519Initiator {
    pub fn new() -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self {
            secret: Some(secret),
            public,
            transcript: Vec::new(),
            agreement: None,
        }
    }

    /// First frame of the exchange.
    pub fn init_message(&mut self) -> Result<Vec<u8>, HandshakeError> {
        if !self.transcript.is_empty() {
            return Err(HandshakeError::InvalidState(HandshakeState::InProgress));
        }
        let bytes = encode(&ClientInit {
            commitment: Sha256::digest(self.public.as_bytes()).to_vec(),
            random: random_bytes(RANDOM_BYTES),
        })?;
        self.transcript.extend_from_slice(&bytes);
        Ok(bytes)
    }

    /// Consumes the runner's response and returns the continuation frame.
    pub fn handle_server_init(&mut self, message: &[u8]) -> Result<Vec<u8>, HandshakeError> {
        let secret = self
            .secret
            .take()
            .ok_or(HandshakeError::InvalidState(HandshakeState::Finished))?;
        let server: ServerInit = decode(message)?;
        let finished = encode(&ClientFinished {
            public_key: self.public.as_bytes().to_vec(),
        })?;
        self.transcript.extend_from_slice(message);
        self.transcript.extend_from_slice(&finished);
        self.agreement = Some(Agreement::derive(secret, &server.public_key, &self.transcript)?);
        Ok(finished)
    }

    fn agreement(&self) -> Result<&Agreement, HandshakeError> {
        self.agreement
            .as_ref()
            .ok_or(HandshakeError::InvalidState(HandshakeState::InProgress))
    }

    pub fn verification_code(&self) -> Result<String, HandshakeError> {
        Ok(self.agreement()?.verification_code())
    }

    pub fn oob_verification_code(&self) -> Result<Vec<u8>, HandshakeError> {
        Ok(self.agreement()?.auth_string.to_vec())
    }

    /// Key for a first-time association, once the user accepted the code.
    pub fn session_key(&self) -> Result<SessionKey, HandshakeError> {
        self.agreement()?.session_key()
    }

    /// Proof of the previous key sent while the runner is resuming the session.
    pub fn reconnection_message(&self, previous_key: &[u8]) -> Result<Vec<u8>, HandshakeError> {
        Ok(self.agreement()?.client_auth(previous_key))
    }

    /// Checks the runner's proof and returns the rotated key.
    pub fn verify_server_auth(
        &self,
        message: &[u8],
        previous_key: &[u8],
    ) -> Result<SessionKey, HandshakeError> {
        let agreement = self.agreement()?;
        let expected = agreement.server_auth(previous_key);
        if !bool::from(expected.as_slice().ct_eq(message)) {
            return Err(HandshakeError::Authentication(
                "server reconnection proof rejected".into(),
            ));
        }
        agreement.resumed_key(previous_key)
    }
}

impl Default for X25519Initiator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agree(runner: &mut X25519Runner) -> (X25519Initiator, HandshakeMessage) {
        let mut phone = X25519Initiator::new();
        let init = phone.init_message().unwrap();
        let response = runner.respond_to_init_request(&init).unwrap();
        assert_eq!(response.state, HandshakeState::InProgress);
        let finished = phone
            .handle_server_init(response.next_message.as_deref().unwrap())
            .unwrap();
        let reply = runner.continue_handshake(&finished).unwrap();
        (phone, reply)
    }

    #[test]
    fn association_codes_and_keys_match() {
        let mut runner = X25519Runner::new();
        let (phone, reply) = agree(&mut runner);
        assert_eq!(reply.state, HandshakeState::VerificationNeeded);
        let code = reply.verification_code.unwrap();
        assert_eq!(code.len(), 6);
        assert_eq!(code, phone.verification_code().unwrap());

        let done = runner.verify_pin().unwrap();
        assert_eq!(done.state, HandshakeState::Finished);
        assert_eq!(done.key.unwrap(), phone.session_key().unwrap());
    }

    #[test]
    fn reconnection_rotates_key() {
        let previous = SessionKey::generate();
        let mut runner = X25519Runner::reconnect();
        let (phone, reply) = agree(&mut runner);
        assert_eq!(reply.state, HandshakeState::ResumingSession);

        let proof = phone.reconnection_message(previous.as_bytes()).unwrap();
        let done = runner
            .authenticate_reconnection(&proof, previous.as_bytes())
            .unwrap();
        let server_auth = done.next_message.unwrap();
        let phone_key = phone
            .verify_server_auth(&server_auth, previous.as_bytes())
            .unwrap();
        let new_key = done.key.unwrap();
        assert_eq!(new_key, phone_key);
        assert_ne!(new_key, previous);
    }

    #[test]
    fn wrong_previous_key_is_rejected() {
        let mut runner = X25519Runner::reconnect();
        let (phone, _) = agree(&mut runner);
        let proof = phone.reconnection_message(&[7u8; 32]).unwrap();
        let err = runner
            .authenticate_reconnection(&proof, &[9u8; 32])
            .unwrap_err();
        assert!(matches!(err, HandshakeError::Authentication(_)));
    }

    #[test]
    fn out_of_sequence_calls_fail() {
        let mut runner = X25519Runner::new();
        assert_eq!(
            runner.verify_pin().unwrap_err(),
            HandshakeError::InvalidState(HandshakeState::Unknown)
        );
        assert!(matches!(
            runner.continue_handshake(b"junk").unwrap_err(),
            HandshakeError::InvalidState(HandshakeState::Unknown)
        ));
    }

    #[test]
    fn commitment_must_match_revealed_key() {
        let mut runner = X25519Runner::new();
        let mut phone = X25519Initiator::new();
        let init = phone.init_message().unwrap();
        runner.respond_to_init_request(&init).unwrap();
        let forged = encode(&ClientFinished {
            public_key: vec![9u8; 32],
        })
        .unwrap();
        assert!(matches!(
            runner.continue_handshake(&forged).unwrap_err(),
            HandshakeError::Authentication(_)
        ));
    }
}
