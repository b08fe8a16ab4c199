//! Attestation flow and per-process identifier guarding.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::info;
use tracing::warn;

use crate::task;

use super::AppleAssertion;
use super::AttestationData;
use super::AttestationError;
use super::AttestedKey;
use super::AttestedKeyBridge;
use super::AttestedKeyError;
use super::AttestedKeyType;
use super::KeyWithAttestation;

use guard::ClaimedKey;
use guard::LiveIdentifiers;

mod guard {
    use std::collections::HashSet;
    use std::fmt;
    use std::sync::Arc;

    use parking_lot::Mutex;

    use crate::attested_key::AttestedKeyBridge;
    use crate::attested_key::AttestedKeyError;
    use crate::task;

    pub(super) type LiveIdentifiers = Arc<Mutex<HashSet<String>>>;

    /// An attested key that has claimed its identifier for as long as the
    /// value lives. Only one claimed key per identifier can exist within the
    /// process, so a key can never be used after another instance deleted
    /// it. Contained in its own submodule so that [`ClaimedKey::claim`] is
    /// the only way of constructing the type.
    pub(super) struct ClaimedKey<B> {
        bridge: Arc<B>,
        live: LiveIdentifiers,
        identifier: String,
    }

    impl<B> ClaimedKey<B> {
        pub(super) fn claim(bridge: Arc<B>, live: LiveIdentifiers, identifier: String) -> Option<Self> {
            let mut identifiers = live.lock();
            if identifiers.contains(&identifier) {
                return None;
            }
            identifiers.insert(identifier.clone());
            drop(identifiers);

            Some(Self {
                bridge,
                live,
                identifier,
            })
        }

        pub(super) fn identifier(&self) -> &str {
            &self.identifier
        }
    }

    impl<B> ClaimedKey<B>
    where
        B: AttestedKeyBridge + 'static,
    {
        pub(super) async fn sign(&self, payload: &[u8]) -> Result<Vec<u8>, AttestedKeyError> {
            let bridge = Arc::clone(&self.bridge);
            let identifier = self.identifier.clone();
            let payload = payload.to_vec();
            task::blocking(move || bridge.sign(&identifier, &payload)).await
        }

        pub(super) async fn public_key(&self) -> Result<Vec<u8>, AttestedKeyError> {
            let bridge = Arc::clone(&self.bridge);
            let identifier = self.identifier.clone();
            task::blocking(move || bridge.public_key(&identifier)).await
        }

        // The identifier is released by `Drop` once the value goes away.
        pub(super) async fn delete(self) -> Result<(), AttestedKeyError> {
            let bridge = Arc::clone(&self.bridge);
            let identifier = self.identifier.clone();
            task::blocking(move || bridge.delete(&identifier)).await
        }
    }

    impl<B> Drop for ClaimedKey<B> {
        fn drop(&mut self) {
            self.live.lock().remove(&self.identifier);
        }
    }

    impl<B> fmt::Debug for ClaimedKey<B> {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("ClaimedKey")
                .field("identifier", &self.identifier)
                .finish_non_exhaustive()
        }
    }
}

/// Failures of the attested key service, either from the platform backend
/// or from the per-process identifier uniqueness check.
#[derive(Debug, Error)]
pub enum AttestedKeyServiceError {
    /// Another live key instance already holds this identifier.
    #[error("identifier is already in use in this process: {0}")]
    IdentifierInUse(String),
    /// The platform backend reported a failure.
    #[error("could not perform attested key operation in platform code: {0}")]
    Platform(#[source] AttestedKeyError),
}

impl From<AttestedKeyError> for AttestedKeyServiceError {
    fn from(value: AttestedKeyError) -> Self {
        Self::Platform(value)
    }
}

impl From<AttestedKeyError> for AttestationError<AttestedKeyServiceError> {
    fn from(value: AttestedKeyError) -> Self {
        match value {
            AttestedKeyError::ServerUnreachable { .. } => Self::new_retryable(value.into()),
            _ => Self::new_unretryable(value.into()),
        }
    }
}

impl<B> KeyWithAttestation<AppleAttestedKeyHandle<B>, GoogleAttestedKeyHandle<B>>
where
    B: AttestedKeyBridge + 'static,
{
    fn new(inner: ClaimedKey<B>, attestation_data: AttestationData) -> Self {
        match attestation_data {
            AttestationData::Apple { attestation_data } => Self::Apple {
                key: AppleAttestedKeyHandle(inner),
                attestation_data,
            },
            AttestationData::Google {
                certificate_chain,
                app_attestation_token,
            } => Self::Google {
                key: GoogleAttestedKeyHandle(inner),
                certificate_chain,
                app_attestation_token,
            },
        }
    }
}

const DEFAULT_ATTEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Creates and instantiates device-attested keys over an injected platform
/// bridge. Built once at process start and passed to whatever initializes
/// the cryptographic core; no hidden global state is involved.
///
/// The service enforces that only one live key instance exists per
/// identifier within the process. Dropping the instance releases the
/// identifier again.
pub struct AttestedKeyService<B> {
    bridge: Arc<B>,
    live: LiveIdentifiers,
    attest_timeout: Duration,
}

impl<B> AttestedKeyService<B>
where
    B: AttestedKeyBridge + 'static,
{
    /// Creates a service over the given platform bridge with the default
    /// attestation timeout of 30 seconds.
    #[must_use]
    pub fn new(bridge: Arc<B>) -> Self {
        Self {
            bridge,
            live: Arc::new(Mutex::new(HashSet::new())),
            attest_timeout: DEFAULT_ATTEST_TIMEOUT,
        }
    }

    /// Overrides the timeout applied to the attestation network round-trip.
    #[must_use]
    pub const fn with_attest_timeout(mut self, timeout: Duration) -> Self {
        self.attest_timeout = timeout;
        self
    }

    /// The attestation ecosystem the underlying platform targets.
    pub fn key_type(&self) -> AttestedKeyType {
        self.bridge.key_type()
    }

    /// Obtains a fresh opaque key identifier from the platform. Callers must
    /// persist the identifier themselves; this layer does not track it.
    ///
    /// # Errors
    ///
    /// Returns [`AttestedKeyError::AttestationNotSupported`] (wrapped) if
    /// the device lacks the capability.
    pub async fn generate(&self) -> Result<String, AttestedKeyServiceError> {
        let bridge = Arc::clone(&self.bridge);
        let identifier = task::blocking(move || bridge.generate()).await?;

        Ok(identifier)
    }

    /// Performs key and app attestation for `identifier` against a
    /// server-issued `challenge`, claiming the identifier for the returned
    /// key instance.
    ///
    /// A timeout elapsing during the platform call is reported as a
    /// retryable error; retrying with the same identifier is then valid.
    /// The platform call itself is not cancelled by the timeout: it keeps
    /// running on the blocking pool and its eventual result is discarded,
    /// so the platform may still have completed the attestation in the
    /// background. Retrying with the same identifier covers that case.
    ///
    /// # Errors
    ///
    /// Returns an [`AttestationError`] whose `retryable` flag tells the
    /// caller whether to retry with the same identifier (server unreachable,
    /// timeout) or to discard it (all other failures). An identifier already
    /// claimed in this process fails unretryably with
    /// [`AttestedKeyServiceError::IdentifierInUse`].
    pub async fn attest(
        &self,
        identifier: &str,
        challenge: &[u8],
    ) -> Result<
        KeyWithAttestation<AppleAttestedKeyHandle<B>, GoogleAttestedKeyHandle<B>>,
        AttestationError<AttestedKeyServiceError>,
    > {
        // Claim the identifier up front; if attestation fails below, the
        // guard's Drop releases it again so a retry can re-claim it.
        let Some(inner) = ClaimedKey::claim(
            Arc::clone(&self.bridge),
            Arc::clone(&self.live),
            identifier.to_owned(),
        ) else {
            return Err(AttestationError::new_unretryable(
                AttestedKeyServiceError::IdentifierInUse(identifier.to_owned()),
            ));
        };

        let bridge = Arc::clone(&self.bridge);
        let task_identifier = identifier.to_owned();
        let challenge = challenge.to_vec();
        let outcome = tokio::time::timeout(
            self.attest_timeout,
            task::blocking(move || bridge.attest(&task_identifier, &challenge)),
        )
        .await;

        let attestation_data = match outcome {
            Ok(result) => result.map_err(AttestationError::from)?,
            Err(_elapsed) => {
                warn!(identifier, timeout = ?self.attest_timeout, "attestation timed out");
                return Err(AttestedKeyError::ServerUnreachable {
                    details: format!(
                        "attestation did not complete within {:?}",
                        self.attest_timeout
                    ),
                }
                .into());
            }
        };

        info!(identifier, "key and app attestation completed");

        Ok(KeyWithAttestation::new(inner, attestation_data))
    }

    /// Instantiates a previously attested key by its identifier. Meant to be
    /// used after attestation, but this is not checked on instantiation;
    /// using an unattested key results in an error on the operation itself.
    ///
    /// # Errors
    ///
    /// Returns [`AttestedKeyServiceError::IdentifierInUse`] if another live
    /// instance holds the identifier.
    pub fn attested_key(
        &self,
        identifier: &str,
    ) -> Result<
        AttestedKey<AppleAttestedKeyHandle<B>, GoogleAttestedKeyHandle<B>>,
        AttestedKeyServiceError,
    > {
        let inner = ClaimedKey::claim(
            Arc::clone(&self.bridge),
            Arc::clone(&self.live),
            identifier.to_owned(),
        )
        .ok_or_else(|| AttestedKeyServiceError::IdentifierInUse(identifier.to_owned()))?;

        // The platform is the single source of truth for the key type.
        let key = match self.bridge.key_type() {
            AttestedKeyType::Apple => AttestedKey::Apple(AppleAttestedKeyHandle(inner)),
            AttestedKeyType::Google => AttestedKey::Google(GoogleAttestedKeyHandle(inner)),
        };

        Ok(key)
    }
}

impl<B> fmt::Debug for AttestedKeyService<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttestedKeyService")
            .field("attest_timeout", &self.attest_timeout)
            .finish_non_exhaustive()
    }
}

/// An Apple attested key. Signing produces a platform assertion; public-key
/// export and deletion are not offered by the platform.
#[derive(Debug)]
pub struct AppleAttestedKeyHandle<B>(ClaimedKey<B>);

impl<B> AppleAttestedKeyHandle<B>
where
    B: AttestedKeyBridge + 'static,
{
    /// The opaque identifier this key is stored under.
    #[must_use]
    pub fn identifier(&self) -> &str {
        self.0.identifier()
    }

    /// Generates an assertion over `payload` proving possession of the
    /// attested key.
    ///
    /// # Errors
    ///
    /// Returns [`AttestedKeyServiceError::Platform`] on platform failure.
    pub async fn sign(&self, payload: &[u8]) -> Result<AppleAssertion, AttestedKeyServiceError> {
        let assertion = self.0.sign(payload).await?;

        Ok(AppleAssertion::from(assertion))
    }
}

/// A Google attested key with the full capability set: raw ECDSA signing,
/// public-key export and deletion.
#[derive(Debug)]
pub struct GoogleAttestedKeyHandle<B>(ClaimedKey<B>);

impl<B> GoogleAttestedKeyHandle<B>
where
    B: AttestedKeyBridge + 'static,
{
    /// The opaque identifier this key is stored under.
    #[must_use]
    pub fn identifier(&self) -> &str {
        self.0.identifier()
    }

    /// Produces a DER-encoded ECDSA signature over SHA-256 of `payload`.
    ///
    /// # Errors
    ///
    /// Returns [`AttestedKeyServiceError::Platform`] on platform failure.
    pub async fn sign(&self, payload: &[u8]) -> Result<Vec<u8>, AttestedKeyServiceError> {
        let signature = self.0.sign(payload).await?;

        Ok(signature)
    }

    /// Exports the public key as DER-encoded `SubjectPublicKeyInfo`.
    ///
    /// # Errors
    ///
    /// Returns [`AttestedKeyServiceError::Platform`] on platform failure.
    pub async fn public_key(&self) -> Result<Vec<u8>, AttestedKeyServiceError> {
        let public_key = self.0.public_key().await?;

        Ok(public_key)
    }

    /// Deletes the attested key from the platform, consuming the instance
    /// and releasing its identifier.
    ///
    /// # Errors
    ///
    /// Returns [`AttestedKeyServiceError::Platform`] on platform failure.
    pub async fn delete(self) -> Result<(), AttestedKeyServiceError> {
        self.0.delete().await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use p256::ecdsa::signature::Verifier;
    use p256::ecdsa::Signature;
    use p256::ecdsa::VerifyingKey;
    use p256::pkcs8::DecodePublicKey;

    use crate::attested_key::software::AttestationScenario;
    use crate::attested_key::AttestedKey;
    use crate::attested_key::AttestedKeyError;
    use crate::attested_key::AttestedKeyType;
    use crate::attested_key::KeyWithAttestation;
    use crate::attested_key::SoftwareAttestedKeyStore;
    use crate::retry::retry;
    use crate::retry::RetryPolicy;

    use super::AttestedKeyService;
    use super::AttestedKeyServiceError;

    fn google_service() -> AttestedKeyService<SoftwareAttestedKeyStore> {
        AttestedKeyService::new(Arc::new(SoftwareAttestedKeyStore::new(
            AttestedKeyType::Google,
        )))
    }

    #[tokio::test]
    async fn google_attestation_flow_yields_a_usable_key() {
        let service = google_service();

        let identifier = service.generate().await.unwrap();
        let key_with_attestation = service.attest(&identifier, b"server challenge").await.unwrap();

        let KeyWithAttestation::Google {
            key,
            certificate_chain,
            app_attestation_token,
        } = key_with_attestation
        else {
            panic!("expected the Google variant");
        };

        assert!(!certificate_chain.is_empty());
        assert!(!app_attestation_token.is_empty());

        // The leaf certificate covers the attested key's public key.
        let public_key = key.public_key().await.unwrap();
        assert_eq!(certificate_chain[0], public_key);

        let payload = b"attested payload";
        let signature_bytes = key.sign(payload).await.unwrap();
        let verifying_key = VerifyingKey::from_public_key_der(&public_key).unwrap();
        let signature = Signature::from_der(&signature_bytes).unwrap();
        verifying_key.verify(payload, &signature).unwrap();

        key.delete().await.unwrap();
    }

    #[tokio::test]
    async fn apple_attestation_flow_signs_assertions_only() {
        let service = AttestedKeyService::new(Arc::new(SoftwareAttestedKeyStore::new(
            AttestedKeyType::Apple,
        )));

        let identifier = service.generate().await.unwrap();
        let key_with_attestation = service.attest(&identifier, b"server challenge").await.unwrap();

        let KeyWithAttestation::Apple {
            key,
            attestation_data,
        } = key_with_attestation
        else {
            panic!("expected the Apple variant");
        };

        assert!(!attestation_data.is_empty());

        let assertion = key.sign(b"payload to assert").await.unwrap();
        assert!(!assertion.as_bytes().is_empty());
    }

    #[tokio::test]
    async fn one_live_instance_per_identifier() {
        let service = google_service();

        let identifier = service.generate().await.unwrap();
        let key_with_attestation = service.attest(&identifier, b"challenge").await.unwrap();

        let err = service.attested_key(&identifier).unwrap_err();
        assert!(matches!(err, AttestedKeyServiceError::IdentifierInUse(id) if id == identifier));

        // Dropping the live instance releases the identifier.
        drop(key_with_attestation);
        let key = service.attested_key(&identifier).unwrap();
        assert!(matches!(key, AttestedKey::Google(_)));
    }

    #[tokio::test]
    async fn retryable_failures_keep_the_identifier_valid() {
        let service = AttestedKeyService::new(Arc::new(
            SoftwareAttestedKeyStore::new(AttestedKeyType::Google)
                .with_scenario(AttestationScenario::UnreachableTimes(2)),
        ));

        let identifier = service.generate().await.unwrap();

        for _ in 0..2 {
            let err = service.attest(&identifier, b"challenge").await.unwrap_err();
            assert!(err.retryable);
        }

        // The same identifier succeeds once the server is reachable again.
        service.attest(&identifier, b"challenge").await.unwrap();
    }

    #[tokio::test]
    async fn attestation_combines_with_the_retry_helper() {
        let service = AttestedKeyService::new(Arc::new(
            SoftwareAttestedKeyStore::new(AttestedKeyType::Google)
                .with_scenario(AttestationScenario::UnreachableTimes(2)),
        ));
        let identifier = service.generate().await.unwrap();

        let policy = RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            ..RetryPolicy::default()
        };
        let key_with_attestation = retry(&policy, "attest", || {
            service.attest(&identifier, b"challenge")
        })
        .await
        .unwrap();

        assert!(matches!(
            key_with_attestation,
            KeyWithAttestation::Google { .. }
        ));
    }

    #[tokio::test]
    async fn fatal_failure_discards_the_key() {
        let service = AttestedKeyService::new(Arc::new(
            SoftwareAttestedKeyStore::new(AttestedKeyType::Google)
                .with_scenario(AttestationScenario::EvidenceFailure),
        ));

        let identifier = service.generate().await.unwrap();
        let err = service.attest(&identifier, b"challenge").await.unwrap_err();
        assert!(!err.retryable);

        // The backend removed the half-created key, so the identifier no
        // longer resolves to anything signable.
        let AttestedKey::Google(key) = service.attested_key(&identifier).unwrap() else {
            panic!("expected the Google variant");
        };
        let err = key.sign(b"payload").await.unwrap_err();
        assert!(matches!(
            err,
            AttestedKeyServiceError::Platform(AttestedKeyError::Other { .. })
        ));
    }

    #[tokio::test]
    async fn attestation_timeout_is_retryable() {
        let service = AttestedKeyService::new(Arc::new(
            SoftwareAttestedKeyStore::new(AttestedKeyType::Google)
                .with_scenario(AttestationScenario::Delay(Duration::from_millis(250))),
        ))
        .with_attest_timeout(Duration::from_millis(10));

        let identifier = service.generate().await.unwrap();
        let err = service.attest(&identifier, b"challenge").await.unwrap_err();

        assert!(err.retryable);
        assert!(matches!(
            err.error,
            AttestedKeyServiceError::Platform(AttestedKeyError::ServerUnreachable { .. })
        ));
    }

    #[tokio::test]
    async fn unsupported_device_fails_generation() {
        let service = AttestedKeyService::new(Arc::new(
            SoftwareAttestedKeyStore::new(AttestedKeyType::Google)
                .with_scenario(AttestationScenario::Unsupported),
        ));

        let err = service.generate().await.unwrap_err();
        assert!(matches!(
            err,
            AttestedKeyServiceError::Platform(AttestedKeyError::AttestationNotSupported)
        ));
    }
}
