//! Pairwise session engine.
//!
//! Double-ratchet sessions are kept per `(remote user, remote device curve
//! key)`. The curve25519 identity key is 1:1 with a device and is the only
//! device identifier present on incoming envelopes, so it doubles as the
//! session key.
//!
//! A device may hold several sessions with the same peer: two devices that
//! contact each other before either has received anything each create an
//! outbound session, and both stay decryptable. Sessions are ordered most
//! recently used first and the front one is used for sending.
//!
//! Sessions are never copied or rolled back. Every encrypt or decrypt runs
//! under the peer's slot lock and persists the advanced state before the
//! ciphertext or plaintext is handed back.

use futures::future::join_all;
use tracing::{debug, info, warn};
use vodozemac::{
    Curve25519PublicKey,
    olm::{OlmMessage, PreKeyMessage, Session, SessionConfig, SessionPickle},
};

use crate::{
    env::Environment,
    envelope::{DeviceCiphertext, EncryptedEnvelope, MessageType},
    error::CryptoError,
    identity::Device,
    session_table::SessionTable,
    store::namespace,
    types::{ClaimedPrekey, DeviceId, UserId},
};

/// Sessions kept per remote device. The least recently used is dropped.
const MAX_SESSIONS_PER_DEVICE: usize = 8;

/// A device that was left out of an envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceWarning {
    /// Owner of the device
    pub user_id: UserId,
    /// Device that was skipped
    pub device_id: DeviceId,
    /// Why it was skipped
    pub error: CryptoError,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SessionKey {
    user_id: UserId,
    device_key: String,
}

impl SessionKey {
    fn new(user_id: UserId, device_key: &str) -> Self {
        Self { user_id, device_key: device_key.to_string() }
    }

    fn record_key(&self) -> Vec<u8> {
        let mut key = Vec::with_capacity(16 + self.device_key.len());
        key.extend_from_slice(self.user_id.as_bytes());
        key.extend_from_slice(self.device_key.as_bytes());
        key
    }
}

/// Pairwise sessions of the loaded device.
pub(crate) struct PairwiseEngine {
    sessions: SessionTable<SessionKey, Vec<Session>>,
}

impl PairwiseEngine {
    pub(crate) fn new() -> Self {
        Self { sessions: SessionTable::new() }
    }

    /// Encrypt `plaintext` for every target device.
    ///
    /// Targets are processed concurrently. A target that cannot be encrypted
    /// for is left out of the envelope and reported as a warning.
    pub(crate) async fn encrypt_for<E: Environment>(
        &self,
        device: &Device<E>,
        targets: Vec<ClaimedPrekey>,
        plaintext: &[u8],
    ) -> (EncryptedEnvelope, Vec<DeviceWarning>) {
        let results =
            join_all(targets.iter().map(|target| self.encrypt_one(device, target, plaintext)))
                .await;

        let mut envelope = EncryptedEnvelope {
            sender_key: device.curve_key().to_string(),
            ..EncryptedEnvelope::default()
        };
        let mut warnings = Vec::new();

        for (target, result) in targets.iter().zip(results) {
            match result {
                Ok(ciphertext) => {
                    envelope
                        .recipients
                        .entry(target.user_id)
                        .or_default()
                        .insert(target.device_id, ciphertext);
                },
                Err(error) => {
                    warn!(
                        user_id = %target.user_id,
                        device_id = %target.device_id,
                        %error,
                        "skipping device"
                    );
                    warnings.push(DeviceWarning {
                        user_id: target.user_id,
                        device_id: target.device_id,
                        error,
                    });
                },
            }
        }

        (envelope, warnings)
    }

    /// Decrypt a pairwise ciphertext from `(sender_user_id, sender_key)`.
    ///
    /// A `PreKey` message is decrypted by the stored session it names, or
    /// establishes a new inbound session (consuming one of our prekeys) when
    /// none does. A `Normal` message is tried against every stored session.
    pub(crate) async fn decrypt<E: Environment>(
        &self,
        device: &Device<E>,
        sender_user_id: UserId,
        sender_key: &str,
        message_type: MessageType,
        ciphertext: &str,
    ) -> Result<Vec<u8>, CryptoError> {
        let their_key = parse_key(sender_key)?;
        let message = OlmMessage::from_parts(message_type.as_tag(), ciphertext)
            .map_err(|e| CryptoError::Codec(e.to_string()))?;

        let key = SessionKey::new(sender_user_id, sender_key);
        let slot = self.sessions.slot(&key);
        let mut guard = slot.lock().await;
        let sessions = match guard.take() {
            Some(sessions) => sessions,
            None => load_sessions(device, &key)?,
        };
        let sessions = guard.insert(sessions);

        let plaintext = match &message {
            OlmMessage::PreKey(pre_key) => match sessions
                .iter()
                .position(|session| session.session_id() == pre_key.session_id())
            {
                Some(index) => {
                    let plaintext = decrypt_with(&mut sessions[index], &message)?;
                    promote(sessions, index);
                    plaintext
                },
                None => {
                    let (session, plaintext) =
                        establish_inbound(device, their_key, pre_key).await?;
                    info!(
                        user_id = %sender_user_id,
                        known = sessions.len(),
                        "established inbound pairwise session"
                    );
                    sessions.insert(0, session);
                    sessions.truncate(MAX_SESSIONS_PER_DEVICE);
                    plaintext
                },
            },
            OlmMessage::Normal(_) => decrypt_any(sessions, &message)?,
        };

        save_sessions(device, &key, sessions)?;
        Ok(plaintext)
    }

    /// True if a session with `(user_id, device_key)` exists in memory or in
    /// the key store.
    pub(crate) async fn has_session<E: Environment>(
        &self,
        device: &Device<E>,
        user_id: UserId,
        device_key: &str,
    ) -> Result<bool, CryptoError> {
        let key = SessionKey::new(user_id, device_key);
        if let Some(slot) = self.sessions.existing(&key) {
            if let Some(sessions) = slot.lock().await.as_ref() {
                return Ok(!sessions.is_empty());
            }
        }
        Ok(!load_sessions(device, &key)?.is_empty())
    }

    /// Forget every cached session.
    pub(crate) fn clear(&self) {
        self.sessions.clear();
    }

    async fn encrypt_one<E: Environment>(
        &self,
        device: &Device<E>,
        target: &ClaimedPrekey,
        plaintext: &[u8],
    ) -> Result<DeviceCiphertext, CryptoError> {
        let key = SessionKey::new(target.user_id, &target.identity_key_curve25519);
        let slot = self.sessions.slot(&key);
        let mut guard = slot.lock().await;
        let sessions = match guard.take() {
            Some(sessions) => sessions,
            None => load_sessions(device, &key)?,
        };
        let sessions = guard.insert(sessions);

        if sessions.is_empty() {
            let session = establish_outbound(device, target).await?;
            sessions.push(session);
        }
        let message =
            sessions.first_mut().ok_or(CryptoError::NoMatchingSession)?.encrypt(plaintext);
        save_sessions(device, &key, sessions)?;

        let (tag, ciphertext) = message.to_parts();
        let message_type = MessageType::from_tag(tag)
            .ok_or_else(|| CryptoError::Codec(format!("unknown pairwise message type {tag}")))?;
        debug!(
            user_id = %target.user_id,
            device_id = %target.device_id,
            ?message_type,
            "encrypted for device"
        );

        Ok(DeviceCiphertext { message_type, ciphertext })
    }
}

fn parse_key(key: &str) -> Result<Curve25519PublicKey, CryptoError> {
    Curve25519PublicKey::from_base64(key).map_err(|e| CryptoError::InvalidKey(e.to_string()))
}

fn load_sessions<E: Environment>(
    device: &Device<E>,
    key: &SessionKey,
) -> Result<Vec<Session>, CryptoError> {
    let pickles =
        device.store.load::<Vec<SessionPickle>>(namespace::PAIRWISE, &key.record_key())?;
    Ok(pickles.unwrap_or_default().into_iter().map(Session::from_pickle).collect())
}

fn save_sessions<E: Environment>(
    device: &Device<E>,
    key: &SessionKey,
    sessions: &[Session],
) -> Result<(), CryptoError> {
    let pickles: Vec<SessionPickle> = sessions.iter().map(Session::pickle).collect();
    Ok(device.store.save(namespace::PAIRWISE, &key.record_key(), &pickles)?)
}

/// Move the session at `index` to the front.
fn promote(sessions: &mut [Session], index: usize) {
    sessions[..=index].rotate_right(1);
}

/// First session that decrypts `message` wins and becomes the send session.
/// Failed attempts leave every session untouched.
fn decrypt_any(sessions: &mut [Session], message: &OlmMessage) -> Result<Vec<u8>, CryptoError> {
    let mut failure = CryptoError::NoMatchingSession;
    let mut decrypted = None;
    for (index, session) in sessions.iter_mut().enumerate() {
        match decrypt_with(session, message) {
            Ok(plaintext) => {
                decrypted = Some((index, plaintext));
                break;
            },
            Err(error) => failure = error,
        }
    }

    let (index, plaintext) = decrypted.ok_or(failure)?;
    promote(sessions, index);
    Ok(plaintext)
}

fn decrypt_with(session: &mut Session, message: &OlmMessage) -> Result<Vec<u8>, CryptoError> {
    session.decrypt(message).map_err(|e| CryptoError::DecryptionFailed(e.to_string()))
}

async fn establish_outbound<E: Environment>(
    device: &Device<E>,
    target: &ClaimedPrekey,
) -> Result<Session, CryptoError> {
    let Some(prekey) = &target.one_time_prekey else {
        return Err(CryptoError::NoMatchingSession);
    };
    let identity_key = parse_key(&target.identity_key_curve25519)?;
    let one_time_key = parse_key(&prekey.public_key)?;

    let account = device.account.lock().await;
    let session = account.account.create_outbound_session(
        SessionConfig::version_2(),
        identity_key,
        one_time_key,
    );
    info!(
        user_id = %target.user_id,
        device_id = %target.device_id,
        "established outbound pairwise session"
    );
    Ok(session)
}

async fn establish_inbound<E: Environment>(
    device: &Device<E>,
    their_key: Curve25519PublicKey,
    pre_key: &PreKeyMessage,
) -> Result<(Session, Vec<u8>), CryptoError> {
    let mut account = device.account.lock().await;
    let result = account
        .account
        .create_inbound_session(their_key, pre_key)
        .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))?;

    account.consume_prekey(&pre_key.one_time_key());
    account.persist(&device.store)?;
    Ok((result.session, result.plaintext))
}
