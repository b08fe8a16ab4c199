//! Error taxonomy for store-backed key operations.
//!
//! Platform-specific failures are translated into [`KeyStoreError`] at the
//! bridge boundary; no platform error type crosses into the wallet core.
//! Attestation has its own taxonomy in [`crate::attested_key`].

use thiserror::Error;

use crate::security_level::SecurityLevel;

/// Errors that can occur while creating or using signing and encryption keys.
#[derive(Debug, Error)]
pub enum KeyStoreError {
    /// Key generation inside secure hardware failed.
    #[error("could not create key in secure hardware: {reason}")]
    CreateKey {
        /// Description of the platform failure.
        reason: String,
    },

    /// An existing key could not be retrieved, e.g. the store entry
    /// disappeared after a hardware reset or OS-level revocation.
    #[error("could not fetch key from secure hardware: {reason}")]
    FetchKey {
        /// Description of the platform failure.
        reason: String,
    },

    /// The public key could not be exported from secure hardware.
    #[error("could not derive public key: {reason}")]
    DeriveKey {
        /// Description of the platform failure.
        reason: String,
    },

    /// The signing operation itself failed.
    #[error("could not sign payload: {reason}")]
    SignKey {
        /// Description of the platform failure.
        reason: String,
    },

    /// The platform could not produce the key's certificate chain.
    #[error("could not obtain certificate chain: {reason}")]
    CertificateChain {
        /// Description of the platform failure.
        reason: String,
    },

    /// A freshly generated key failed hardware-backing validation.
    ///
    /// This is always fatal to the creation attempt; outside the explicit
    /// debug/emulator exception there is no software fallback.
    #[error("key is not hardware backed, observed security level: {level}")]
    MissingHardware {
        /// The security level the platform reported for the rejected key.
        level: SecurityLevel,
    },

    /// Encryption failed.
    #[error("could not encrypt payload: {reason}")]
    Encrypt {
        /// Description of the failure.
        reason: String,
    },

    /// Decryption or authentication failed: tampered ciphertext, a truncated
    /// payload, or a key that changed under the alias since encryption.
    #[error("could not decrypt payload: {reason}")]
    Decrypt {
        /// Description of the failure.
        reason: String,
    },

    /// The store entry could not be removed.
    #[error("could not delete key: {reason}")]
    Delete {
        /// Description of the platform failure.
        reason: String,
    },

    /// The device is locked and key material is inaccessible.
    #[error("device is locked, secure hardware keys are inaccessible")]
    DeviceLocked,
}

impl KeyStoreError {
    /// Creates a [`KeyStoreError::CreateKey`].
    pub fn create_key<S: Into<String>>(reason: S) -> Self {
        Self::CreateKey {
            reason: reason.into(),
        }
    }

    /// Creates a [`KeyStoreError::FetchKey`].
    pub fn fetch_key<S: Into<String>>(reason: S) -> Self {
        Self::FetchKey {
            reason: reason.into(),
        }
    }

    /// Creates a [`KeyStoreError::DeriveKey`].
    pub fn derive_key<S: Into<String>>(reason: S) -> Self {
        Self::DeriveKey {
            reason: reason.into(),
        }
    }

    /// Creates a [`KeyStoreError::SignKey`].
    pub fn sign_key<S: Into<String>>(reason: S) -> Self {
        Self::SignKey {
            reason: reason.into(),
        }
    }

    /// Creates a [`KeyStoreError::Encrypt`].
    pub fn encrypt<S: Into<String>>(reason: S) -> Self {
        Self::Encrypt {
            reason: reason.into(),
        }
    }

    /// Creates a [`KeyStoreError::Decrypt`].
    pub fn decrypt<S: Into<String>>(reason: S) -> Self {
        Self::Decrypt {
            reason: reason.into(),
        }
    }

    /// Creates a [`KeyStoreError::Delete`].
    pub fn delete<S: Into<String>>(reason: S) -> Self {
        Self::Delete {
            reason: reason.into(),
        }
    }
}
