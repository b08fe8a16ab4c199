//! Device-attested keys behind an opaque platform attestation service.
//!
//! Attestation platforms do not expose a persistent, inspectable keystore.
//! Keys are created by the platform under an opaque identifier and proven
//! genuine by binding them to a server-issued challenge. The two ecosystems
//! are structurally different:
//!
//! * **Apple** (App Attest): the key is created by `generate`, attestation
//!   produces a single evidence blob, and signing yields an *assertion*
//!   rather than a raw ECDSA signature. Public-key export and deletion are
//!   not offered by the platform.
//! * **Google** (Keystore attestation plus Play Integrity): `generate` only
//!   picks an identifier; the key is created during `attest`, which yields a
//!   certificate chain and an integrity token. The key supports raw ECDSA
//!   signing, public-key export and deletion.
//!
//! That asymmetry is carried in the types: [`AttestedKey`] and
//! [`KeyWithAttestation`] are enums whose Apple variant only signs
//! assertions while the Google variant carries the full capability set. The
//! uniform [`AttestedKeyBridge`] trait still reports
//! [`AttestedKeyError::MethodUnsupported`] where a platform lacks an
//! operation, for callers that go through the bridge directly.

pub mod service;
pub mod software;

pub use service::AppleAttestedKeyHandle;
pub use service::AttestedKeyService;
pub use service::AttestedKeyServiceError;
pub use service::GoogleAttestedKeyHandle;
pub use software::SoftwareAttestedKeyStore;

use std::error::Error;

use strum::Display;
use thiserror::Error;

/// The attestation ecosystem a platform backend targets. Exactly one per
/// build; reported by the backend so it stays the single source of truth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum AttestedKeyType {
    /// Apple App Attest.
    Apple,
    /// Android Keystore key attestation with a Play Integrity token.
    Google,
}

/// Failures reported by an attestation platform backend.
#[derive(Debug, Clone, Error)]
pub enum AttestedKeyError {
    /// The device or OS version cannot perform key and app attestation.
    #[error("key and app attestation is not supported on this device")]
    AttestationNotSupported,
    /// The attestation server could not be reached. Retryable with the same
    /// identifier.
    #[error("attestation server could not be reached: {details}")]
    ServerUnreachable {
        /// Description of the connectivity failure.
        details: String,
    },
    /// The platform does not offer this operation for attested keys.
    #[error("attested key operation {operation} is not supported on this platform")]
    MethodUnsupported {
        /// Name of the unavailable operation.
        operation: String,
    },
    /// Any other platform failure. Fatal; the caller must discard the
    /// identifier and start over with a fresh one.
    #[error("could not perform attested key operation: {reason}")]
    Other {
        /// Description of the platform failure.
        reason: String,
    },
}

impl AttestedKeyError {
    pub(crate) fn other<S: Into<String>>(reason: S) -> Self {
        Self::Other {
            reason: reason.into(),
        }
    }

    pub(crate) fn unsupported_method<S: Into<String>>(operation: S) -> Self {
        Self::MethodUnsupported {
            operation: operation.into(),
        }
    }
}

/// Wrapper for errors encountered during attestation that carries an
/// explicit `retryable` flag: when set, the caller should retry the
/// attestation with the *same* identifier; otherwise the identifier must be
/// discarded.
#[derive(Debug, Error)]
#[error("could not perform key/app attestation (retryable: {retryable}): {error}")]
pub struct AttestationError<E>
where
    E: Error,
{
    /// The underlying failure.
    #[source]
    pub error: E,
    /// Whether retrying with the same identifier can succeed.
    pub retryable: bool,
}

impl<E> AttestationError<E>
where
    E: Error,
{
    /// Wraps an error the caller should retry with the same identifier.
    pub const fn new_retryable(error: E) -> Self {
        Self {
            error,
            retryable: true,
        }
    }

    /// Wraps a fatal error; the identifier must be discarded.
    pub const fn new_unretryable(error: E) -> Self {
        Self {
            error,
            retryable: false,
        }
    }
}

/// Platform-specific attestation evidence, produced by a successful
/// [`AttestedKeyBridge::attest`] call. Opaque to this layer; the consumer
/// forwards it to its own verification service.
#[derive(Debug, Clone)]
pub enum AttestationData {
    /// Apple App Attest evidence.
    Apple {
        /// The attestation object covering the key and the challenge.
        attestation_data: Vec<u8>,
    },
    /// Android evidence.
    Google {
        /// X.509 attestation certificate chain, leaf first.
        certificate_chain: Vec<Vec<u8>>,
        /// Play Integrity token bound to the challenge.
        app_attestation_token: Vec<u8>,
    },
}

/// Either a generic Apple or Google attested key.
#[derive(Debug)]
pub enum AttestedKey<A, G> {
    /// An Apple attested key, capable of assertion signing only.
    Apple(A),
    /// A Google attested key with the full capability set.
    Google(G),
}

/// Either a generic Apple or Google attested key, together with the
/// platform-specific attestation evidence that proves it genuine.
#[derive(Debug)]
pub enum KeyWithAttestation<A, G> {
    /// An Apple attested key and its attestation object.
    Apple {
        /// The attested key.
        key: A,
        /// The attestation object covering the key and the challenge.
        attestation_data: Vec<u8>,
    },
    /// A Google attested key and its evidence.
    Google {
        /// The attested key.
        key: G,
        /// X.509 attestation certificate chain, leaf first.
        certificate_chain: Vec<Vec<u8>>,
        /// Play Integrity token bound to the challenge.
        app_attestation_token: Vec<u8>,
    },
}

/// An assertion produced by an Apple attested key. Opaque bytes until
/// received by the verifying server; notably not a raw ECDSA signature.
#[derive(Debug, Clone)]
pub struct AppleAssertion(Vec<u8>);

impl AppleAssertion {
    /// The raw assertion bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Consumes the assertion, returning the raw bytes.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl From<Vec<u8>> for AppleAssertion {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for AppleAssertion {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Operations an attestation platform backend supplies. All methods are
/// blocking; [`AttestedKeyService`] ships them off the async runtime.
pub trait AttestedKeyBridge: Send + Sync {
    /// The attestation ecosystem this backend targets.
    fn key_type(&self) -> AttestedKeyType;

    /// Obtains a fresh opaque key identifier. On Apple this creates the key
    /// as well; on Google only the identifier is chosen and the key is
    /// created during [`Self::attest`].
    ///
    /// # Errors
    ///
    /// Returns [`AttestedKeyError::AttestationNotSupported`] if the device
    /// lacks the capability.
    fn generate(&self) -> Result<String, AttestedKeyError>;

    /// Binds the key under `identifier` to a server-issued `challenge`,
    /// producing platform attestation evidence.
    ///
    /// # Errors
    ///
    /// Returns [`AttestedKeyError::ServerUnreachable`] on connectivity
    /// failures (retryable with the same identifier) or
    /// [`AttestedKeyError::Other`] on fatal failures, after which the
    /// identifier must be discarded.
    fn attest(&self, identifier: &str, challenge: &[u8]) -> Result<AttestationData, AttestedKeyError>;

    /// Signs `payload` with the attested key. Produces a platform assertion
    /// on Apple and a DER-encoded ECDSA signature on Google.
    ///
    /// # Errors
    ///
    /// Returns [`AttestedKeyError::Other`] if the identifier is unknown or
    /// the key has not been attested yet.
    fn sign(&self, identifier: &str, payload: &[u8]) -> Result<Vec<u8>, AttestedKeyError>;

    /// Exports the public key as DER-encoded `SubjectPublicKeyInfo`.
    ///
    /// # Errors
    ///
    /// Returns [`AttestedKeyError::MethodUnsupported`] on platforms without
    /// addressable public keys (Apple).
    fn public_key(&self, identifier: &str) -> Result<Vec<u8>, AttestedKeyError>;

    /// Removes the attested key from the platform.
    ///
    /// # Errors
    ///
    /// Returns [`AttestedKeyError::MethodUnsupported`] on platforms that do
    /// not offer deletion (Apple).
    fn delete(&self, identifier: &str) -> Result<(), AttestedKeyError>;
}
