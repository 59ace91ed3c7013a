//! Key derivation for the local key store using HKDF and HMAC

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::Zeroize;

type HmacSha256 = Hmac<Sha256>;

/// Domain separator for every store subkey
const STORE_KEY_LABEL: &[u8] = b"hushwireStoreV1";

/// Derive a 32-byte subkey from the store master key.
///
/// `label` separates purposes (sealing, record naming). Deterministic: same
/// master and label always produce the same subkey.
pub fn derive_subkey(master: &[u8], label: &[u8]) -> [u8; 32] {
    let hkdf = Hkdf::<Sha256>::new(None, master);

    let mut info = Vec::with_capacity(STORE_KEY_LABEL.len() + label.len());
    info.extend_from_slice(STORE_KEY_LABEL);
    info.extend_from_slice(label);

    let mut key = [0u8; 32];
    let Ok(()) = hkdf.expand(&info, &mut key) else {
        unreachable!("32 bytes is a valid HKDF-SHA256 output length");
    };

    key
}

/// Keyed hash for record names.
///
/// The store indexes records by `HMAC(name_key, namespace || key)` so user
/// and device ids never appear on disk in the clear.
pub struct RecordNamer {
    key: [u8; 32],
}

impl RecordNamer {
    /// Create a namer from a 32-byte naming key.
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Opaque name for `key` within `namespace`.
    ///
    /// Both parts are length-prefixed, so ("ab", "c") and ("a", "bc") differ.
    pub fn name(&self, namespace: &str, key: &[u8]) -> [u8; 32] {
        let Ok(mut mac) = HmacSha256::new_from_slice(&self.key) else {
            unreachable!("HMAC-SHA256 accepts any key size");
        };
        mac.update(&(namespace.len() as u64).to_be_bytes());
        mac.update(namespace.as_bytes());
        mac.update(&(key.len() as u64).to_be_bytes());
        mac.update(key);

        let mut name = [0u8; 32];
        name.copy_from_slice(&mac.finalize().into_bytes());
        name
    }
}

impl Drop for RecordNamer {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_is_deterministic() {
        let master = b"store master key material_______";
        assert_eq!(derive_subkey(master, b"seal"), derive_subkey(master, b"seal"));
    }

    #[test]
    fn different_labels_produce_different_keys() {
        let master = b"store master key material_______";
        assert_ne!(derive_subkey(master, b"seal"), derive_subkey(master, b"names"));
    }

    #[test]
    fn different_masters_produce_different_keys() {
        assert_ne!(derive_subkey(b"master a", b"seal"), derive_subkey(b"master b", b"seal"));
    }

    #[test]
    fn works_with_empty_master() {
        let key = derive_subkey(&[], b"seal");
        assert_eq!(key.len(), 32);
    }

    #[test]
    fn names_are_stable() {
        let namer = RecordNamer::new([7; 32]);
        assert_eq!(namer.name("session", b"alice"), namer.name("session", b"alice"));
    }

    #[test]
    fn namespaces_are_separated() {
        let namer = RecordNamer::new([7; 32]);
        assert_ne!(namer.name("session", b"alice"), namer.name("group", b"alice"));
        assert_ne!(namer.name("ab", b"c"), namer.name("a", b"bc"));
    }

    #[test]
    fn different_keys_produce_different_names() {
        let a = RecordNamer::new([1; 32]);
        let b = RecordNamer::new([2; 32]);
        assert_ne!(a.name("session", b"alice"), b.name("session", b"alice"));
    }
}
