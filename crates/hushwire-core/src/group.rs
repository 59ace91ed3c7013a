//! Group session engine.
//!
//! One outbound session per conversation for sending, and one inbound session
//! per `(conversation, sender key)` for receiving. Each session is a
//! forward-only [`SymmetricRatchet`] tagged with a random session id.
//!
//! The exported session key is a snapshot of the outbound ratchet. Moving it
//! to the other members is the router's job; this engine only produces and
//! consumes it.
//!
//! # Sender authentication
//!
//! The symmetric chain key is shared with every member, so it cannot tell
//! members apart. Each outbound session therefore also carries an ed25519
//! signing key. The public half travels with the exported key, the secret
//! half never leaves the sender, and every group ciphertext is signed over
//! its session id, generation, nonce and ciphertext. Receivers check the
//! signature before the ratchet moves.
//!
//! # Replay protection
//!
//! Inbound ratchets only move forward. A message at or behind the consumed
//! position is rejected without touching state. Decryption runs on a scratch
//! copy of the ratchet that is committed only after authentication succeeds,
//! so a forged generation cannot burn keys either.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use hushwire_crypto::{
    EncryptedGroupMessage, GroupSessionId, RatchetSnapshot, SymmetricRatchet, decrypt_message,
    encrypt_message,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use vodozemac::{Ed25519PublicKey, Ed25519SecretKey, Ed25519Signature};
use zeroize::Zeroize;

use crate::{
    env::Environment,
    envelope::{from_cbor, to_cbor},
    error::CryptoError,
    identity::Device,
    session_table::SessionTable,
    store::namespace,
    types::ConversationId,
};

/// Ratchet position, as exported to members and as persisted.
#[derive(Serialize, Deserialize)]
struct GroupSessionRecord {
    session_id: GroupSessionId,
    generation: u32,
    chain_key: [u8; 32],
    signing_key: [u8; 32],
    /// Only in the sender's own outbound record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    signing_secret: Option<[u8; 32]>,
}

impl GroupSessionRecord {
    fn encode(&self) -> Result<String, CryptoError> {
        Ok(BASE64.encode(to_cbor(self)?))
    }

    fn decode(exported: &str) -> Result<Self, CryptoError> {
        let bytes = BASE64.decode(exported).map_err(|e| CryptoError::Codec(e.to_string()))?;
        from_cbor(&bytes)
    }
}

impl Drop for GroupSessionRecord {
    fn drop(&mut self) {
        self.chain_key.zeroize();
        self.signing_secret.zeroize();
    }
}

/// Group ciphertext as carried in an envelope.
#[derive(Serialize, Deserialize)]
struct GroupCiphertext {
    session_id: GroupSessionId,
    generation: u32,
    nonce: [u8; 24],
    ciphertext: Vec<u8>,
    signature: Vec<u8>,
}

impl GroupCiphertext {
    fn signed(message: EncryptedGroupMessage, signer: &Ed25519SecretKey) -> Self {
        let mut signed = Self {
            session_id: message.session_id,
            generation: message.generation,
            nonce: message.nonce,
            ciphertext: message.ciphertext,
            signature: Vec::new(),
        };
        signed.signature = signer.sign(&signed.signed_bytes()).to_bytes().to_vec();
        signed
    }

    fn signed_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(
            self.session_id.len() + 4 + self.nonce.len() + self.ciphertext.len(),
        );
        bytes.extend_from_slice(&self.session_id);
        bytes.extend_from_slice(&self.generation.to_be_bytes());
        bytes.extend_from_slice(&self.nonce);
        bytes.extend_from_slice(&self.ciphertext);
        bytes
    }

    fn verify(&self, signing_key: &Ed25519PublicKey) -> Result<(), CryptoError> {
        let signature = Ed25519Signature::from_slice(&self.signature)
            .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))?;
        signing_key
            .verify(&self.signed_bytes(), &signature)
            .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))
    }
}

impl From<GroupCiphertext> for EncryptedGroupMessage {
    fn from(message: GroupCiphertext) -> Self {
        Self {
            session_id: message.session_id,
            generation: message.generation,
            nonce: message.nonce,
            ciphertext: message.ciphertext,
        }
    }
}

/// One sender ratchet, outbound or inbound. Only outbound sessions hold a
/// signer.
struct GroupSession {
    session_id: GroupSessionId,
    ratchet: SymmetricRatchet,
    signing_key: Ed25519PublicKey,
    signer: Option<Ed25519SecretKey>,
}

impl GroupSession {
    /// Public record, safe to hand to members.
    fn record(&self) -> GroupSessionRecord {
        let snapshot = self.ratchet.snapshot();
        GroupSessionRecord {
            session_id: self.session_id,
            generation: snapshot.generation(),
            chain_key: *snapshot.chain_key(),
            signing_key: *self.signing_key.as_bytes(),
            signing_secret: None,
        }
    }

    /// Record including the signing secret, for our own key store only.
    fn outbound_record(&self) -> GroupSessionRecord {
        let mut record = self.record();
        record.signing_secret = self.signer.as_ref().map(|signer| *signer.to_bytes());
        record
    }

    fn from_record(record: &GroupSessionRecord) -> Result<Self, CryptoError> {
        let snapshot = RatchetSnapshot::from_parts(&record.chain_key, record.generation)?;
        let signing_key = Ed25519PublicKey::from_slice(&record.signing_key)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let signer = record.signing_secret.as_ref().map(Ed25519SecretKey::from_slice);
        if signer.as_ref().is_some_and(|signer| signer.public_key() != signing_key) {
            return Err(CryptoError::InvalidKey("group signing key mismatch".to_string()));
        }

        Ok(Self {
            session_id: record.session_id,
            ratchet: SymmetricRatchet::from_snapshot(&snapshot),
            signing_key,
            signer,
        })
    }
}

type InboundKey = (ConversationId, String);

/// Group sessions of the loaded device.
pub(crate) struct GroupEngine {
    outbound: SessionTable<ConversationId, GroupSession>,
    inbound: SessionTable<InboundKey, GroupSession>,
}

impl GroupEngine {
    pub(crate) fn new() -> Self {
        Self { outbound: SessionTable::new(), inbound: SessionTable::new() }
    }

    /// Start a new outbound session for `conversation_id`, replacing any
    /// existing one, and return its exported key.
    pub(crate) async fn create_outbound_session<E: Environment>(
        &self,
        device: &Device<E>,
        conversation_id: ConversationId,
    ) -> Result<String, CryptoError> {
        let slot = self.outbound.slot(&conversation_id);
        let mut guard = slot.lock().await;

        let session = self.start_session(device, conversation_id).await?;
        let exported = session.record().encode()?;
        *guard = Some(session);
        Ok(exported)
    }

    /// Make sure an outbound session exists, creating one if needed.
    pub(crate) async fn ensure_outbound<E: Environment>(
        &self,
        device: &Device<E>,
        conversation_id: ConversationId,
    ) -> Result<(), CryptoError> {
        let slot = self.outbound.slot(&conversation_id);
        let mut guard = slot.lock().await;
        load_into(&mut guard, device, namespace::GROUP_OUTBOUND, conversation_id.as_bytes())?;

        if guard.is_none() {
            *guard = Some(self.start_session(device, conversation_id).await?);
        }
        Ok(())
    }

    /// Exported key of the current outbound session.
    pub(crate) async fn export<E: Environment>(
        &self,
        device: &Device<E>,
        conversation_id: ConversationId,
    ) -> Result<String, CryptoError> {
        let slot = self.outbound.slot(&conversation_id);
        let mut guard = slot.lock().await;
        load_into(&mut guard, device, namespace::GROUP_OUTBOUND, conversation_id.as_bytes())?;

        let session = guard.as_ref().ok_or(CryptoError::NoOutboundSession(conversation_id))?;
        session.record().encode()
    }

    /// True if an outbound session exists for `conversation_id`.
    pub(crate) async fn has_outbound_session<E: Environment>(
        &self,
        device: &Device<E>,
        conversation_id: ConversationId,
    ) -> Result<bool, CryptoError> {
        let slot = self.outbound.slot(&conversation_id);
        let mut guard = slot.lock().await;
        load_into(&mut guard, device, namespace::GROUP_OUTBOUND, conversation_id.as_bytes())?;
        Ok(guard.is_some())
    }

    /// Encrypt `plaintext` with the outbound session of `conversation_id`.
    pub(crate) async fn encrypt_group<E: Environment>(
        &self,
        device: &Device<E>,
        conversation_id: ConversationId,
        plaintext: &[u8],
    ) -> Result<String, CryptoError> {
        let slot = self.outbound.slot(&conversation_id);
        let mut guard = slot.lock().await;
        load_into(&mut guard, device, namespace::GROUP_OUTBOUND, conversation_id.as_bytes())?;

        let session = guard.as_mut().ok_or(CryptoError::NoOutboundSession(conversation_id))?;
        let Some(signer) = session.signer.as_ref() else {
            return Err(CryptoError::NoOutboundSession(conversation_id));
        };
        let message_key = session.ratchet.advance()?;
        let nonce_suffix = device.env.random_array();
        let encrypted = encrypt_message(plaintext, &message_key, &session.session_id, nonce_suffix);
        let record = session.outbound_record();
        device.store.save(namespace::GROUP_OUTBOUND, conversation_id.as_bytes(), &record)?;

        let generation = encrypted.generation;
        let signed = GroupCiphertext::signed(encrypted, signer);
        debug!(%conversation_id, generation, "encrypted group message");
        Ok(BASE64.encode(to_cbor(&signed)?))
    }

    /// Install the inbound session `(conversation_id, sender_key)` from an
    /// exported key.
    ///
    /// Importing the session already held is a no-op, so a re-delivered key
    /// never moves a ratchet backwards. A different session id replaces the
    /// stored session (the sender rotated). Returns true if state changed.
    pub(crate) async fn add_inbound_session<E: Environment>(
        &self,
        device: &Device<E>,
        conversation_id: ConversationId,
        sender_key: &str,
        exported: &str,
    ) -> Result<bool, CryptoError> {
        let record = GroupSessionRecord::decode(exported)?;
        let key = (conversation_id, sender_key.to_string());
        let slot = self.inbound.slot(&key);
        let mut guard = slot.lock().await;
        load_into(&mut guard, device, namespace::GROUP_INBOUND, &inbound_record_key(&key))?;

        if guard.as_ref().is_some_and(|existing| existing.session_id == record.session_id) {
            debug!(%conversation_id, "group session already installed");
            return Ok(false);
        }

        let session = GroupSession::from_record(&record)?;
        device.store.save(namespace::GROUP_INBOUND, &inbound_record_key(&key), &session.record())?;
        *guard = Some(session);

        info!(%conversation_id, generation = record.generation, "installed inbound group session");
        Ok(true)
    }

    /// Decrypt a group ciphertext from `sender_key`.
    ///
    /// # Errors
    ///
    /// - `NoMatchingSession` if no inbound session exists for the sender, or
    ///   the message belongs to a session we have not received
    /// - `ReplayRejected` if the message index was already consumed
    /// - `DecryptionFailed` on a bad signature, authentication failure or a
    ///   too distant index
    pub(crate) async fn decrypt_group<E: Environment>(
        &self,
        device: &Device<E>,
        conversation_id: ConversationId,
        sender_key: &str,
        ciphertext: &str,
    ) -> Result<Vec<u8>, CryptoError> {
        let bytes = BASE64.decode(ciphertext).map_err(|e| CryptoError::Codec(e.to_string()))?;
        let signed = from_cbor::<GroupCiphertext>(&bytes)?;

        let key = (conversation_id, sender_key.to_string());
        let slot = self.inbound.slot(&key);
        let mut guard = slot.lock().await;
        load_into(&mut guard, device, namespace::GROUP_INBOUND, &inbound_record_key(&key))?;

        let session = guard.as_mut().ok_or(CryptoError::NoMatchingSession)?;
        if session.session_id != signed.session_id {
            return Err(CryptoError::NoMatchingSession);
        }
        signed.verify(&session.signing_key)?;

        let message = EncryptedGroupMessage::from(signed);
        let mut scratch = session.ratchet.clone();
        let message_key = scratch.advance_to(message.generation)?;
        let plaintext = decrypt_message(&message, &message_key)?;

        session.ratchet = scratch;
        device.store.save(namespace::GROUP_INBOUND, &inbound_record_key(&key), &session.record())?;

        debug!(%conversation_id, generation = message.generation, "decrypted group message");
        Ok(plaintext)
    }

    /// Forget every cached session.
    pub(crate) fn clear(&self) {
        self.outbound.clear();
        self.inbound.clear();
    }

    /// Fresh ratchet for `conversation_id`, persisted together with the
    /// matching inbound session for our own sender key.
    async fn start_session<E: Environment>(
        &self,
        device: &Device<E>,
        conversation_id: ConversationId,
    ) -> Result<GroupSession, CryptoError> {
        let mut seed: [u8; 32] = device.env.random_array();
        let mut signing_seed: [u8; 32] = device.env.random_array();
        let signer = Ed25519SecretKey::from_slice(&signing_seed);
        let session = GroupSession {
            session_id: device.env.random_array(),
            ratchet: SymmetricRatchet::new(&seed),
            signing_key: signer.public_key(),
            signer: Some(signer),
        };
        seed.zeroize();
        signing_seed.zeroize();

        let record = session.record();
        let own = GroupSession::from_record(&record)?;
        let own_key = (conversation_id, device.curve_key().to_string());
        let own_slot = self.inbound.slot(&own_key);
        let mut own_guard = own_slot.lock().await;

        let outbound = session.outbound_record();
        device.store.save(namespace::GROUP_OUTBOUND, conversation_id.as_bytes(), &outbound)?;
        device.store.save(namespace::GROUP_INBOUND, &inbound_record_key(&own_key), &record)?;
        *own_guard = Some(own);

        info!(%conversation_id, "started outbound group session");
        Ok(session)
    }
}

fn inbound_record_key((conversation_id, sender_key): &InboundKey) -> Vec<u8> {
    let mut key = Vec::with_capacity(16 + sender_key.len());
    key.extend_from_slice(conversation_id.as_bytes());
    key.extend_from_slice(sender_key.as_bytes());
    key
}

/// Fill an empty slot from the key store.
fn load_into<E: Environment>(
    slot: &mut Option<GroupSession>,
    device: &Device<E>,
    namespace: &str,
    record_key: &[u8],
) -> Result<(), CryptoError> {
    if slot.is_none() {
        if let Some(record) = device.store.load::<GroupSessionRecord>(namespace, record_key)? {
            *slot = Some(GroupSession::from_record(&record)?);
        }
    }
    Ok(())
}
