//! Get-or-create, signing and public-key export for P-256 signing keys.

use std::sync::Arc;

use tracing::debug;

use crate::alias::alias;
use crate::alias::KeyAlias;
use crate::alias::KeyKind;
use crate::error::KeyStoreError;
use crate::policy::HardwareBackingPolicy;
use crate::security_level::SecurityLevel;
use crate::task;

use super::clean_kind;
use super::create_validated;
use super::ensure_exists;
use super::ensure_unlocked;
use super::SigningKeyBridge;

/// Identifier-keyed lifecycle and operations for hardware signing keys.
///
/// Built once at process start with an explicit platform bridge; no hidden
/// global state is involved. All operations resolve the key freshly, so a
/// deleted or revoked store entry is noticed on the next call.
#[derive(Debug)]
pub struct SigningKeyService<B> {
    bridge: Arc<B>,
    policy: HardwareBackingPolicy,
}

impl<B> SigningKeyService<B>
where
    B: SigningKeyBridge + 'static,
{
    /// Creates a service over the given platform bridge.
    pub const fn new(bridge: Arc<B>, policy: HardwareBackingPolicy) -> Self {
        Self { bridge, policy }
    }

    /// Returns a handle for the signing key named by `identifier`, creating
    /// the key inside secure hardware if no entry exists yet.
    ///
    /// A freshly generated key is validated against the hardware-backing
    /// policy before it is accepted; already existing keys are not
    /// re-validated.
    ///
    /// # Errors
    ///
    /// Returns [`KeyStoreError::DeviceLocked`] while the device is locked,
    /// [`KeyStoreError::CreateKey`] on generation failure and
    /// [`KeyStoreError::MissingHardware`] if validation rejects the new key.
    pub async fn get_or_create(&self, identifier: &str) -> Result<SigningKeyHandle<B>, KeyStoreError> {
        let key_alias = alias(KeyKind::Signing, identifier);
        debug!(alias = %key_alias, "resolving signing key");

        let bridge = Arc::clone(&self.bridge);
        let policy = self.policy;
        let task_alias = key_alias.clone();
        task::blocking(move || {
            ensure_unlocked(bridge.as_ref())?;

            if !bridge.key_exists(&task_alias)? {
                create_validated(bridge.as_ref(), &task_alias, policy, |bridge, alias| {
                    bridge.generate_signing_key(alias)
                })?;
            }

            Ok::<_, KeyStoreError>(())
        })
        .await?;

        Ok(SigningKeyHandle {
            bridge: Arc::clone(&self.bridge),
            alias: key_alias,
        })
    }

    /// Exports the DER-encoded `SubjectPublicKeyInfo` for an existing key.
    ///
    /// # Errors
    ///
    /// Returns [`KeyStoreError::FetchKey`] if no key exists under the
    /// identifier or [`KeyStoreError::DeriveKey`] if export fails.
    pub async fn public_key(&self, identifier: &str) -> Result<Vec<u8>, KeyStoreError> {
        self.resolve(identifier).await?.public_key().await
    }

    /// Signs `payload` with an existing key, returning a DER-encoded ECDSA
    /// signature over SHA-256 of the payload.
    ///
    /// ECDSA nonce randomization makes repeated signatures over the same
    /// payload differ while all of them verify.
    ///
    /// # Errors
    ///
    /// Returns [`KeyStoreError::FetchKey`] if the key cannot be retrieved or
    /// [`KeyStoreError::SignKey`] if the signing operation fails.
    pub async fn sign(&self, identifier: &str, payload: &[u8]) -> Result<Vec<u8>, KeyStoreError> {
        self.resolve(identifier).await?.sign(payload).await
    }

    /// Removes the signing key named by `identifier`, if present.
    ///
    /// # Errors
    ///
    /// Returns [`KeyStoreError::Delete`] if an existing entry cannot be
    /// removed.
    pub async fn delete(&self, identifier: &str) -> Result<(), KeyStoreError> {
        let key_alias = alias(KeyKind::Signing, identifier);
        let bridge = Arc::clone(&self.bridge);
        task::blocking(move || bridge.delete(&key_alias)).await
    }

    /// Removes every signing key, leaving other kinds untouched.
    ///
    /// Destructive and irreversible; only meant for caller-initiated reset
    /// and teardown flows.
    ///
    /// # Errors
    ///
    /// Returns [`KeyStoreError::Delete`] if an entry cannot be removed.
    pub async fn clean(&self) -> Result<(), KeyStoreError> {
        let bridge = Arc::clone(&self.bridge);
        task::blocking(move || clean_kind(bridge.as_ref(), KeyKind::Signing)).await
    }

    async fn resolve(&self, identifier: &str) -> Result<SigningKeyHandle<B>, KeyStoreError> {
        let key_alias = alias(KeyKind::Signing, identifier);

        let bridge = Arc::clone(&self.bridge);
        let task_alias = key_alias.clone();
        task::blocking(move || ensure_exists(bridge.as_ref(), &task_alias)).await?;

        Ok(SigningKeyHandle {
            bridge: Arc::clone(&self.bridge),
            alias: key_alias,
        })
    }
}

/// One signing key resident in secure hardware.
///
/// Handles are cheap alias wrappers and are not meant to be cached across
/// operations; resolve them per call so store-level revocation is observed.
#[derive(Debug)]
pub struct SigningKeyHandle<B> {
    bridge: Arc<B>,
    alias: KeyAlias,
}

impl<B> SigningKeyHandle<B>
where
    B: SigningKeyBridge + 'static,
{
    /// The storage alias this handle refers to.
    #[must_use]
    pub const fn alias(&self) -> &KeyAlias {
        &self.alias
    }

    /// Exports the public key as DER-encoded `SubjectPublicKeyInfo`.
    ///
    /// # Errors
    ///
    /// Returns [`KeyStoreError::DeriveKey`] if the hardware cannot export it.
    pub async fn public_key(&self) -> Result<Vec<u8>, KeyStoreError> {
        let bridge = Arc::clone(&self.bridge);
        let alias = self.alias.clone();
        task::blocking(move || bridge.public_key(&alias)).await
    }

    /// Produces a DER-encoded ECDSA signature over SHA-256 of `payload`.
    ///
    /// # Errors
    ///
    /// Returns [`KeyStoreError::SignKey`] if the signing operation fails.
    pub async fn sign(&self, payload: &[u8]) -> Result<Vec<u8>, KeyStoreError> {
        let bridge = Arc::clone(&self.bridge);
        let alias = self.alias.clone();
        let payload = payload.to_vec();
        task::blocking(move || bridge.sign(&alias, &payload)).await
    }

    /// The security level the platform currently reports for this key.
    ///
    /// # Errors
    ///
    /// Returns [`KeyStoreError::FetchKey`] if the key no longer exists.
    pub async fn security_level(&self) -> Result<SecurityLevel, KeyStoreError> {
        let bridge = Arc::clone(&self.bridge);
        let alias = self.alias.clone();
        task::blocking(move || bridge.security_level(&alias)).await
    }

    /// Removes the key from the store, consuming the handle.
    ///
    /// # Errors
    ///
    /// Returns [`KeyStoreError::Delete`] if the entry cannot be removed.
    pub async fn delete(self) -> Result<(), KeyStoreError> {
        let bridge = Arc::clone(&self.bridge);
        let alias = self.alias;
        task::blocking(move || bridge.delete(&alias)).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use p256::ecdsa::signature::Verifier;
    use p256::ecdsa::Signature;
    use p256::ecdsa::VerifyingKey;
    use p256::pkcs8::DecodePublicKey;

    use super::SigningKeyService;
    use crate::error::KeyStoreError;
    use crate::keystore::SoftwareKeyStore;
    use crate::policy::HardwareBackingPolicy;
    use crate::policy::RuntimeEnvironment;
    use crate::security_level::SecurityLevel;

    fn emulator_service() -> SigningKeyService<SoftwareKeyStore> {
        SigningKeyService::new(
            Arc::new(SoftwareKeyStore::new()),
            HardwareBackingPolicy::new(RuntimeEnvironment::emulator_debug()),
        )
    }

    #[tokio::test]
    async fn get_or_create_is_idempotent_per_identifier() {
        let service = emulator_service();

        let first = service.get_or_create("account").await.unwrap();
        let second = service.get_or_create("account").await.unwrap();

        assert_eq!(
            first.public_key().await.unwrap(),
            second.public_key().await.unwrap()
        );
    }

    #[tokio::test]
    async fn different_identifiers_yield_independent_keys() {
        let service = emulator_service();

        service.get_or_create("first").await.unwrap();
        service.get_or_create("second").await.unwrap();

        assert_ne!(
            service.public_key("first").await.unwrap(),
            service.public_key("second").await.unwrap()
        );
    }

    #[tokio::test]
    async fn signatures_are_randomized_and_both_verify() {
        let service = emulator_service();
        let payload = b"payload to be signed twice";

        service.get_or_create("signer").await.unwrap();
        let sig1 = service.sign("signer", payload).await.unwrap();
        let sig2 = service.sign("signer", payload).await.unwrap();

        // ECDSA nonce randomization: identical payloads, distinct signatures.
        assert_ne!(sig1, sig2);

        let public_key = service.public_key("signer").await.unwrap();
        let verifying_key = VerifyingKey::from_public_key_der(&public_key).unwrap();
        for sig in [&sig1, &sig2] {
            let signature = Signature::from_der(sig).unwrap();
            verifying_key.verify(payload, &signature).unwrap();
        }
    }

    #[tokio::test]
    async fn signing_an_unknown_identifier_is_a_fetch_error() {
        let service = emulator_service();

        let err = service.sign("never-created", b"payload").await.unwrap_err();
        assert!(matches!(err, KeyStoreError::FetchKey { .. }));
    }

    #[tokio::test]
    async fn deleted_key_is_gone_until_recreated() {
        let service = emulator_service();

        service.get_or_create("short-lived").await.unwrap();
        service.delete("short-lived").await.unwrap();

        let err = service.public_key("short-lived").await.unwrap_err();
        assert!(matches!(err, KeyStoreError::FetchKey { .. }));

        // Deleting again is not an error.
        service.delete("short-lived").await.unwrap();
    }

    #[tokio::test]
    async fn locked_device_blocks_key_creation() {
        let store = Arc::new(SoftwareKeyStore::new());
        let service = SigningKeyService::new(
            Arc::clone(&store),
            HardwareBackingPolicy::new(RuntimeEnvironment::emulator_debug()),
        );

        store.set_device_locked(true);
        let err = service.get_or_create("locked-out").await.unwrap_err();
        assert!(matches!(err, KeyStoreError::DeviceLocked));

        store.set_device_locked(false);
        service.get_or_create("locked-out").await.unwrap();
    }

    #[tokio::test]
    async fn software_only_key_is_rejected_in_production() {
        let store = Arc::new(SoftwareKeyStore::new());
        let service = SigningKeyService::new(
            Arc::clone(&store),
            HardwareBackingPolicy::new(RuntimeEnvironment::production()),
        );

        let err = service.get_or_create("rejected").await.unwrap_err();
        assert!(matches!(
            err,
            KeyStoreError::MissingHardware {
                level: SecurityLevel::SoftwareOnly
            }
        ));

        // The rejected key must not linger in the store.
        let err = service.public_key("rejected").await.unwrap_err();
        assert!(matches!(err, KeyStoreError::FetchKey { .. }));
    }

    #[tokio::test]
    async fn hardware_backed_key_is_accepted_in_production() {
        let store = Arc::new(
            SoftwareKeyStore::new().with_reported_security_level(SecurityLevel::StrongBox),
        );
        let service = SigningKeyService::new(
            store,
            HardwareBackingPolicy::new(RuntimeEnvironment::production()),
        );

        let handle = service.get_or_create("strongbox-backed").await.unwrap();
        assert_eq!(
            handle.security_level().await.unwrap(),
            SecurityLevel::StrongBox
        );
    }

    #[tokio::test]
    async fn clean_removes_all_signing_keys() {
        let service = emulator_service();

        let before_a = service.get_or_create("a").await.unwrap().public_key().await.unwrap();
        service.get_or_create("b").await.unwrap();
        service.clean().await.unwrap();

        assert!(matches!(
            service.public_key("a").await.unwrap_err(),
            KeyStoreError::FetchKey { .. }
        ));
        assert!(matches!(
            service.public_key("b").await.unwrap_err(),
            KeyStoreError::FetchKey { .. }
        ));

        // After clean, the identifier behaves as freshly created.
        let after_a = service.get_or_create("a").await.unwrap().public_key().await.unwrap();
        assert_ne!(before_a, after_a);
    }
}
