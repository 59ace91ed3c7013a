//! Wire envelopes placed in the `content` of an encrypted message record.
//!
//! Envelopes are CBOR-encoded. Ciphertexts inside them are base64 strings so
//! the same structures can be mirrored into JSON by the transport unchanged.

use std::collections::HashMap;

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{
    error::CryptoError,
    types::{ConversationId, DeviceId, UserId},
};

/// Pairwise message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// First message(s) of a session; carries what the receiver needs to
    /// establish it
    PreKey,
    /// Message on an established session
    Normal,
}

impl MessageType {
    /// Numeric tag used by the pairwise primitive.
    pub fn as_tag(self) -> usize {
        match self {
            Self::PreKey => 0,
            Self::Normal => 1,
        }
    }

    /// Parse the primitive's numeric tag.
    pub fn from_tag(tag: usize) -> Option<Self> {
        match tag {
            0 => Some(Self::PreKey),
            1 => Some(Self::Normal),
            _ => None,
        }
    }
}

/// Ciphertext addressed to one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCiphertext {
    /// Pairwise message type
    pub message_type: MessageType,
    /// Base64 ciphertext
    pub ciphertext: String,
}

/// Pairwise fan-out envelope: one ciphertext per recipient device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedEnvelope {
    /// Sender device's curve25519 identity key (base64)
    pub sender_key: String,
    /// `user_id -> device_id -> ciphertext`
    pub recipients: HashMap<UserId, HashMap<DeviceId, DeviceCiphertext>>,
}

impl EncryptedEnvelope {
    /// Ciphertext addressed to `(user_id, device_id)`, if any.
    pub fn ciphertext_for(
        &self,
        user_id: UserId,
        device_id: DeviceId,
    ) -> Option<&DeviceCiphertext> {
        self.recipients.get(&user_id).and_then(|devices| devices.get(&device_id))
    }

    /// Total number of addressed devices.
    pub fn device_count(&self) -> usize {
        self.recipients.values().map(HashMap::len).sum()
    }
}

/// Group envelope: one ciphertext readable by every member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedGroupEnvelope {
    /// Conversation the group session belongs to
    pub conversation_id: ConversationId,
    /// Sender device's curve25519 identity key (base64)
    pub sender_key: String,
    /// Base64 group ciphertext
    pub ciphertext: String,
}

/// Every envelope the router produces or accepts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Envelope {
    /// Per-device pairwise ciphertexts
    Pairwise(EncryptedEnvelope),
    /// Single group ciphertext
    Group(EncryptedGroupEnvelope),
}

impl Envelope {
    /// Encode for the message record's `content` field.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CryptoError> {
        to_cbor(self)
    }

    /// Decode from a message record's `content` field.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        from_cbor(bytes)
    }

    /// Sender device's curve25519 key.
    pub fn sender_key(&self) -> &str {
        match self {
            Self::Pairwise(envelope) => &envelope.sender_key,
            Self::Group(envelope) => &envelope.sender_key,
        }
    }
}

/// Plaintext carried inside a pairwise ciphertext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairwisePayload {
    /// A chat message
    Text {
        /// Message body
        body: String,
    },
    /// Group session key for a conversation, delivered to each member device
    GroupSessionKey {
        /// Conversation the key belongs to
        conversation_id: ConversationId,
        /// Exported session key
        session_key: String,
    },
}

impl PairwisePayload {
    /// Encode for encryption.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CryptoError> {
        to_cbor(self)
    }

    /// Decode after decryption.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        from_cbor(bytes)
    }
}

pub(crate) fn to_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>, CryptoError> {
    let mut bytes = Vec::new();
    ciborium::into_writer(value, &mut bytes).map_err(|e| CryptoError::Codec(e.to_string()))?;
    Ok(bytes)
}

pub(crate) fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CryptoError> {
    ciborium::from_reader(bytes).map_err(|e| CryptoError::Codec(e.to_string()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn sample_pairwise() -> Envelope {
        let user = UserId::from_u128(1);
        let device = DeviceId::from_u128(2);
        let mut devices = HashMap::new();
        devices.insert(
            device,
            DeviceCiphertext { message_type: MessageType::PreKey, ciphertext: "AAEC".to_string() },
        );
        let mut recipients = HashMap::new();
        recipients.insert(user, devices);

        Envelope::Pairwise(EncryptedEnvelope { sender_key: "c2VuZGVy".to_string(), recipients })
    }

    #[test]
    fn envelope_cbor_roundtrip() {
        let envelope = sample_pairwise();
        let decoded = Envelope::from_bytes(&envelope.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn ciphertext_lookup() {
        let Envelope::Pairwise(envelope) = sample_pairwise() else {
            unreachable!("sample is pairwise");
        };

        assert!(envelope.ciphertext_for(UserId::from_u128(1), DeviceId::from_u128(2)).is_some());
        assert!(envelope.ciphertext_for(UserId::from_u128(1), DeviceId::from_u128(3)).is_none());
        assert_eq!(envelope.device_count(), 1);
    }

    #[test]
    fn garbage_is_codec_error() {
        assert!(matches!(Envelope::from_bytes(&[0xff, 0x00, 0x13]), Err(CryptoError::Codec(_))));
    }

    #[test]
    fn message_type_tags() {
        assert_eq!(MessageType::from_tag(MessageType::PreKey.as_tag()), Some(MessageType::PreKey));
        assert_eq!(MessageType::from_tag(MessageType::Normal.as_tag()), Some(MessageType::Normal));
        assert_eq!(MessageType::from_tag(7), None);
    }

    #[test]
    fn payload_variants_are_distinct() {
        let key = PairwisePayload::GroupSessionKey {
            conversation_id: ConversationId::from_u128(9),
            session_key: "a2V5".to_string(),
        };
        let decoded = PairwisePayload::from_bytes(&key.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, key);
    }
}
