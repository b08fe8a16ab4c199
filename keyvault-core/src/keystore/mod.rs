//! Store-backed signing and encryption keys.
//!
//! Platforms with a persistent, inspectable keystore (Android Keystore, the
//! Apple Secure Enclave behind Keychain queries) are driven through the
//! bridge traits below. A platform backend supplies existence checks, key
//! creation, the raw cryptographic operations and security-level
//! introspection; the services in [`signing`] and [`encryption`] layer the
//! alias scheme, the hardware-backing policy and the lifecycle contract on
//! top. Every platform failure is translated into [`KeyStoreError`] before
//! it reaches a caller.

pub mod encryption;
pub mod signing;
pub mod software;

pub use encryption::EncryptionKeyHandle;
pub use encryption::EncryptionKeyService;
pub use encryption::EncryptionMode;
pub use signing::SigningKeyHandle;
pub use signing::SigningKeyService;
pub use software::SoftwareKeyStore;

use tracing::info;
use tracing::warn;

use crate::alias::KeyAlias;
use crate::alias::KeyKind;
use crate::error::KeyStoreError;
use crate::policy::HardwareBackingPolicy;
use crate::security_level::SecurityLevel;

/// Operations every store-backed platform bridge supplies, independent of
/// key kind. All methods are blocking; the services ship them off the async
/// runtime before calling.
pub trait KeyStoreBridge: Send + Sync {
    /// Whether the device is currently locked. Key material is inaccessible
    /// on a locked device on some platforms.
    fn device_locked(&self) -> bool;

    /// Whether an entry exists under `alias`.
    ///
    /// # Errors
    ///
    /// Returns [`KeyStoreError::FetchKey`] if the store cannot be queried.
    fn key_exists(&self, alias: &KeyAlias) -> Result<bool, KeyStoreError>;

    /// The security level the platform reports for the key under `alias`.
    ///
    /// # Errors
    ///
    /// Returns [`KeyStoreError::FetchKey`] if no key exists under `alias`.
    fn security_level(&self, alias: &KeyAlias) -> Result<SecurityLevel, KeyStoreError>;

    /// Removes the entry under `alias`. Deleting a missing entry is not an
    /// error, matching platform store behavior.
    ///
    /// # Errors
    ///
    /// Returns [`KeyStoreError::Delete`] if an existing entry cannot be
    /// removed.
    fn delete(&self, alias: &KeyAlias) -> Result<(), KeyStoreError>;

    /// All aliases currently present in the store, across kinds.
    ///
    /// # Errors
    ///
    /// Returns [`KeyStoreError::FetchKey`] if the store cannot be enumerated.
    fn aliases(&self) -> Result<Vec<KeyAlias>, KeyStoreError>;
}

/// Platform operations for P-256 ECDSA signing keys.
pub trait SigningKeyBridge: KeyStoreBridge {
    /// Generates a new P-256 key pair under `alias` inside secure hardware,
    /// requesting the strongest tier the device offers.
    ///
    /// # Errors
    ///
    /// Returns [`KeyStoreError::CreateKey`] on generation failure.
    fn generate_signing_key(&self, alias: &KeyAlias) -> Result<(), KeyStoreError>;

    /// Exports the public key as DER-encoded X.509 `SubjectPublicKeyInfo`.
    ///
    /// # Errors
    ///
    /// Returns [`KeyStoreError::DeriveKey`] if the hardware cannot export it.
    fn public_key(&self, alias: &KeyAlias) -> Result<Vec<u8>, KeyStoreError>;

    /// Produces a DER-encoded ECDSA signature over SHA-256 of `payload`.
    ///
    /// # Errors
    ///
    /// Returns [`KeyStoreError::FetchKey`] if the key cannot be retrieved or
    /// [`KeyStoreError::SignKey`] if the signing operation fails.
    fn sign(&self, alias: &KeyAlias, payload: &[u8]) -> Result<Vec<u8>, KeyStoreError>;
}

/// Platform operations for AES-256 encryption keys.
///
/// The payload framing (IV prefix, authentication tag, chunked legacy mode)
/// is specified in [`encryption`]; backends produce and consume exactly that
/// layout.
pub trait EncryptionKeyBridge: KeyStoreBridge {
    /// Generates a new AES-256 key under `alias` inside secure hardware.
    ///
    /// # Errors
    ///
    /// Returns [`KeyStoreError::CreateKey`] on generation failure.
    fn generate_encryption_key(&self, alias: &KeyAlias) -> Result<(), KeyStoreError>;

    /// Encrypts `plaintext` under the key stored at `alias`.
    ///
    /// # Errors
    ///
    /// Returns [`KeyStoreError::FetchKey`] or [`KeyStoreError::Encrypt`].
    fn encrypt(&self, alias: &KeyAlias, plaintext: &[u8]) -> Result<Vec<u8>, KeyStoreError>;

    /// Decrypts and, in authenticated mode, verifies `ciphertext`.
    ///
    /// # Errors
    ///
    /// Returns [`KeyStoreError::FetchKey`] or [`KeyStoreError::Decrypt`];
    /// the latter covers authentication failures.
    fn decrypt(&self, alias: &KeyAlias, ciphertext: &[u8]) -> Result<Vec<u8>, KeyStoreError>;
}

/// Fails with [`KeyStoreError::DeviceLocked`] while the device is locked.
pub(crate) fn ensure_unlocked<B: KeyStoreBridge + ?Sized>(bridge: &B) -> Result<(), KeyStoreError> {
    if bridge.device_locked() {
        return Err(KeyStoreError::DeviceLocked);
    }

    Ok(())
}

/// Resolves an existing entry, failing with [`KeyStoreError::FetchKey`] if
/// the alias is absent. Handles are resolved freshly on every operation so
/// revocation and locked-device states are observed.
pub(crate) fn ensure_exists<B: KeyStoreBridge + ?Sized>(
    bridge: &B,
    alias: &KeyAlias,
) -> Result<(), KeyStoreError> {
    ensure_unlocked(bridge)?;

    if !bridge.key_exists(alias)? {
        return Err(KeyStoreError::fetch_key(format!(
            "no key found under alias {alias}"
        )));
    }

    Ok(())
}

/// Generates a key via `generate` and validates its hardware backing.
///
/// A key that fails validation is removed again so no unusable alias
/// lingers in the store; the policy error is returned either way.
pub(crate) fn create_validated<B, F>(
    bridge: &B,
    alias: &KeyAlias,
    policy: HardwareBackingPolicy,
    generate: F,
) -> Result<(), KeyStoreError>
where
    B: KeyStoreBridge + ?Sized,
    F: FnOnce(&B, &KeyAlias) -> Result<(), KeyStoreError>,
{
    generate(bridge, alias)?;

    let level = bridge.security_level(alias)?;
    if let Err(validation_err) = policy.validate(level) {
        if let Err(delete_err) = bridge.delete(alias) {
            warn!(%alias, %delete_err, "could not remove key that failed hardware-backing validation");
        }
        return Err(validation_err);
    }

    info!(%alias, %level, "created key in secure hardware");

    Ok(())
}

/// Removes every alias belonging to `kind`, leaving other kinds untouched.
pub(crate) fn clean_kind<B: KeyStoreBridge + ?Sized>(
    bridge: &B,
    kind: KeyKind,
) -> Result<(), KeyStoreError> {
    for alias in bridge.aliases()? {
        if alias.has_kind(kind) {
            bridge.delete(&alias)?;
            info!(%alias, "deleted key during clean");
        }
    }

    Ok(())
}
