//! In-memory software backend standing in for secure hardware.
//!
//! Used on platforms without a hardware keystore and as the backend for
//! tests. Key material lives in process memory only, so the store reports
//! [`SecurityLevel::SoftwareOnly`] unless configured otherwise; the
//! hardware-backing policy decides whether that is acceptable.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use p256::ecdsa::signature::RandomizedSigner;
use p256::ecdsa::Signature;
use p256::ecdsa::SigningKey;
use p256::pkcs8::EncodePublicKey;
use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroizing;

use crate::alias::KeyAlias;
use crate::error::KeyStoreError;
use crate::security_level::SecurityLevel;

use super::encryption::open_cbc_chunked;
use super::encryption::open_gcm;
use super::encryption::seal_cbc_chunked;
use super::encryption::seal_gcm;
use super::encryption::EncryptionMode;
use super::EncryptionKeyBridge;
use super::KeyStoreBridge;
use super::SigningKeyBridge;

/// The framing mode is captured per key at creation so payloads produced
/// under one framing are never decrypted under the other.
enum SoftwareKeyEntry {
    Signing(SigningKey),
    Encryption {
        key: Zeroizing<[u8; 32]>,
        mode: EncryptionMode,
    },
}

/// Software keystore keeping all key material in process memory.
pub struct SoftwareKeyStore {
    keys: Mutex<HashMap<KeyAlias, SoftwareKeyEntry>>,
    reported_level: SecurityLevel,
    encryption_mode: EncryptionMode,
    locked: AtomicBool,
}

impl SoftwareKeyStore {
    /// Creates an empty store reporting [`SecurityLevel::SoftwareOnly`] and
    /// using GCM framing for new encryption keys.
    #[must_use]
    pub fn new() -> Self {
        Self {
            keys: Mutex::new(HashMap::new()),
            reported_level: SecurityLevel::SoftwareOnly,
            encryption_mode: EncryptionMode::Gcm,
            locked: AtomicBool::new(false),
        }
    }

    /// Overrides the security level reported for keys in this store.
    #[must_use]
    pub fn with_reported_security_level(mut self, level: SecurityLevel) -> Self {
        self.reported_level = level;
        self
    }

    /// Overrides the framing mode used for newly created encryption keys.
    #[must_use]
    pub fn with_encryption_mode(mut self, mode: EncryptionMode) -> Self {
        self.encryption_mode = mode;
        self
    }

    /// Simulates the device lock state.
    pub fn set_device_locked(&self, locked: bool) {
        self.locked.store(locked, Ordering::SeqCst);
    }
}

impl Default for SoftwareKeyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SoftwareKeyStore {
    // Key material is deliberately omitted.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftwareKeyStore")
            .field("keys", &self.keys.lock().len())
            .field("reported_level", &self.reported_level)
            .field("encryption_mode", &self.encryption_mode)
            .field("locked", &self.locked.load(Ordering::SeqCst))
            .finish()
    }
}

impl KeyStoreBridge for SoftwareKeyStore {
    fn device_locked(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }

    fn key_exists(&self, alias: &KeyAlias) -> Result<bool, KeyStoreError> {
        Ok(self.keys.lock().contains_key(alias))
    }

    fn security_level(&self, alias: &KeyAlias) -> Result<SecurityLevel, KeyStoreError> {
        if !self.keys.lock().contains_key(alias) {
            return Err(KeyStoreError::fetch_key(format!(
                "no key found under alias {alias}"
            )));
        }

        Ok(self.reported_level)
    }

    fn delete(&self, alias: &KeyAlias) -> Result<(), KeyStoreError> {
        self.keys.lock().remove(alias);
        Ok(())
    }

    fn aliases(&self) -> Result<Vec<KeyAlias>, KeyStoreError> {
        Ok(self.keys.lock().keys().cloned().collect())
    }
}

impl SigningKeyBridge for SoftwareKeyStore {
    fn generate_signing_key(&self, alias: &KeyAlias) -> Result<(), KeyStoreError> {
        let key = SigningKey::random(&mut OsRng);
        self.keys
            .lock()
            .insert(alias.clone(), SoftwareKeyEntry::Signing(key));
        Ok(())
    }

    fn public_key(&self, alias: &KeyAlias) -> Result<Vec<u8>, KeyStoreError> {
        let keys = self.keys.lock();
        let Some(SoftwareKeyEntry::Signing(key)) = keys.get(alias) else {
            return Err(KeyStoreError::fetch_key(format!(
                "no signing key found under alias {alias}"
            )));
        };

        let der = key
            .verifying_key()
            .to_public_key_der()
            .map_err(|err| KeyStoreError::derive_key(format!("public key export failed: {err}")))?;

        Ok(der.into_vec())
    }

    fn sign(&self, alias: &KeyAlias, payload: &[u8]) -> Result<Vec<u8>, KeyStoreError> {
        let keys = self.keys.lock();
        let Some(SoftwareKeyEntry::Signing(key)) = keys.get(alias) else {
            return Err(KeyStoreError::fetch_key(format!(
                "no signing key found under alias {alias}"
            )));
        };

        // Randomized rather than deterministic ECDSA, matching hardware
        // keystore behavior.
        let signature: Signature = key
            .try_sign_with_rng(&mut OsRng, payload)
            .map_err(|err| KeyStoreError::sign_key(format!("ECDSA signing failed: {err}")))?;

        Ok(signature.to_der().as_bytes().to_vec())
    }
}

impl EncryptionKeyBridge for SoftwareKeyStore {
    fn generate_encryption_key(&self, alias: &KeyAlias) -> Result<(), KeyStoreError> {
        let mut key = Zeroizing::new([0_u8; 32]);
        OsRng.fill_bytes(key.as_mut());

        self.keys.lock().insert(
            alias.clone(),
            SoftwareKeyEntry::Encryption {
                key,
                mode: self.encryption_mode,
            },
        );
        Ok(())
    }

    fn encrypt(&self, alias: &KeyAlias, plaintext: &[u8]) -> Result<Vec<u8>, KeyStoreError> {
        let keys = self.keys.lock();
        let Some(SoftwareKeyEntry::Encryption { key, mode }) = keys.get(alias) else {
            return Err(KeyStoreError::fetch_key(format!(
                "no encryption key found under alias {alias}"
            )));
        };

        match mode {
            EncryptionMode::Gcm => seal_gcm(key, plaintext),
            EncryptionMode::LegacyCbc => seal_cbc_chunked(key, plaintext),
        }
    }

    fn decrypt(&self, alias: &KeyAlias, ciphertext: &[u8]) -> Result<Vec<u8>, KeyStoreError> {
        let keys = self.keys.lock();
        let Some(SoftwareKeyEntry::Encryption { key, mode }) = keys.get(alias) else {
            return Err(KeyStoreError::fetch_key(format!(
                "no encryption key found under alias {alias}"
            )));
        };

        match mode {
            EncryptionMode::Gcm => open_gcm(key, ciphertext),
            EncryptionMode::LegacyCbc => open_cbc_chunked(key, ciphertext),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::alias::alias;
    use crate::alias::KeyKind;
    use crate::error::KeyStoreError;
    use crate::keystore::EncryptionKeyBridge;
    use crate::keystore::KeyStoreBridge;
    use crate::keystore::SigningKeyBridge;
    use crate::security_level::SecurityLevel;

    use super::SoftwareKeyStore;

    #[test]
    fn reports_configured_security_level_only_for_existing_keys() {
        let store =
            SoftwareKeyStore::new().with_reported_security_level(SecurityLevel::TrustedEnvironment);
        let key_alias = alias(KeyKind::Signing, "present");

        assert!(matches!(
            store.security_level(&key_alias).unwrap_err(),
            KeyStoreError::FetchKey { .. }
        ));

        store.generate_signing_key(&key_alias).unwrap();
        assert_eq!(
            store.security_level(&key_alias).unwrap(),
            SecurityLevel::TrustedEnvironment
        );
    }

    #[test]
    fn signing_operations_reject_an_encryption_alias() {
        let store = SoftwareKeyStore::new();
        let key_alias = alias(KeyKind::Encryption, "aes-key");
        store.generate_encryption_key(&key_alias).unwrap();

        assert!(matches!(
            store.sign(&key_alias, b"payload").unwrap_err(),
            KeyStoreError::FetchKey { .. }
        ));
        assert!(matches!(
            store.public_key(&key_alias).unwrap_err(),
            KeyStoreError::FetchKey { .. }
        ));
    }

    #[test]
    fn delete_is_idempotent_and_aliases_track_contents() {
        let store = SoftwareKeyStore::new();
        let key_alias = alias(KeyKind::Signing, "tracked");

        store.generate_signing_key(&key_alias).unwrap();
        assert_eq!(store.aliases().unwrap(), vec![key_alias.clone()]);

        store.delete(&key_alias).unwrap();
        store.delete(&key_alias).unwrap();
        assert!(store.aliases().unwrap().is_empty());
    }
}
