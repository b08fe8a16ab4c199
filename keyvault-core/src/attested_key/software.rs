//! In-memory attestation backend standing in for the platform service.
//!
//! Drives the `Generated -> Attested` state machine with real ECDSA keys so
//! host-side tests can verify signatures end to end. Failure behavior is
//! injectable through [`AttestationScenario`] to exercise the retryable
//! versus fatal error paths of callers.

use std::collections::HashMap;
use std::time::Duration;

use p256::ecdsa::signature::RandomizedSigner;
use p256::ecdsa::Signature;
use p256::ecdsa::SigningKey;
use p256::pkcs8::EncodePublicKey;
use parking_lot::Mutex;
use rand::rngs::OsRng;
use sha2::Digest;
use sha2::Sha256;
use uuid::Uuid;

use super::AttestationData;
use super::AttestedKeyBridge;
use super::AttestedKeyError;
use super::AttestedKeyType;

/// Injectable failure behavior for [`SoftwareAttestedKeyStore`].
#[derive(Debug, Clone, Copy)]
pub enum AttestationScenario {
    /// All operations succeed.
    Succeed,
    /// The next N attestation calls fail as server-unreachable, after which
    /// attestation succeeds.
    UnreachableTimes(u32),
    /// Evidence assembly fails after key creation; the half-created key is
    /// removed and the failure is fatal.
    EvidenceFailure,
    /// The device lacks attestation capability entirely.
    Unsupported,
    /// Attestation calls block for the given duration before succeeding,
    /// for exercising caller-side timeouts.
    Delay(Duration),
}

enum AttestedKeyState {
    Generated,
    Attested { signing_key: SigningKey },
}

/// Software attestation backend keeping key state in process memory.
pub struct SoftwareAttestedKeyStore {
    key_type: AttestedKeyType,
    keys: Mutex<HashMap<String, AttestedKeyState>>,
    scenario: Mutex<AttestationScenario>,
}

impl SoftwareAttestedKeyStore {
    /// Creates an empty store targeting the given attestation ecosystem,
    /// with all operations succeeding.
    #[must_use]
    pub fn new(key_type: AttestedKeyType) -> Self {
        Self {
            key_type,
            keys: Mutex::new(HashMap::new()),
            scenario: Mutex::new(AttestationScenario::Succeed),
        }
    }

    /// Overrides the failure behavior.
    #[must_use]
    pub fn with_scenario(self, scenario: AttestationScenario) -> Self {
        *self.scenario.lock() = scenario;
        self
    }

    fn spki_der(signing_key: &SigningKey) -> Result<Vec<u8>, AttestedKeyError> {
        let der = signing_key
            .verifying_key()
            .to_public_key_der()
            .map_err(|err| AttestedKeyError::other(format!("public key export failed: {err}")))?;

        Ok(der.into_vec())
    }
}

impl std::fmt::Debug for SoftwareAttestedKeyStore {
    // Key material is deliberately omitted.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftwareAttestedKeyStore")
            .field("key_type", &self.key_type)
            .field("keys", &self.keys.lock().len())
            .field("scenario", &*self.scenario.lock())
            .finish()
    }
}

impl AttestedKeyBridge for SoftwareAttestedKeyStore {
    fn key_type(&self) -> AttestedKeyType {
        self.key_type
    }

    fn generate(&self) -> Result<String, AttestedKeyError> {
        if matches!(*self.scenario.lock(), AttestationScenario::Unsupported) {
            return Err(AttestedKeyError::AttestationNotSupported);
        }

        let identifier = Uuid::new_v4().to_string();
        self.keys
            .lock()
            .insert(identifier.clone(), AttestedKeyState::Generated);

        Ok(identifier)
    }

    fn attest(&self, identifier: &str, challenge: &[u8]) -> Result<AttestationData, AttestedKeyError> {
        match *self.scenario.lock() {
            AttestationScenario::Unsupported => {
                return Err(AttestedKeyError::AttestationNotSupported);
            }
            AttestationScenario::Delay(duration) => std::thread::sleep(duration),
            _ => {}
        }

        if let AttestationScenario::UnreachableTimes(remaining) = &mut *self.scenario.lock() {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(AttestedKeyError::ServerUnreachable {
                    details: "connection refused".to_owned(),
                });
            }
        }

        let mut keys = self.keys.lock();
        if !keys.contains_key(identifier) {
            return Err(AttestedKeyError::other(format!(
                "unknown key identifier {identifier}"
            )));
        }

        let signing_key = SigningKey::random(&mut OsRng);

        if matches!(*self.scenario.lock(), AttestationScenario::EvidenceFailure) {
            // Undo the key creation, like a platform backend cleaning up a
            // half-attested key; the identifier is no longer usable.
            keys.remove(identifier);
            return Err(AttestedKeyError::other(
                "failed to assemble attestation evidence",
            ));
        }

        let spki = Self::spki_der(&signing_key)?;
        let attestation_data = match self.key_type {
            AttestedKeyType::Apple => {
                let digest = Sha256::new()
                    .chain_update(challenge)
                    .chain_update(&spki)
                    .finalize();
                AttestationData::Apple {
                    attestation_data: digest.to_vec(),
                }
            }
            AttestedKeyType::Google => AttestationData::Google {
                certificate_chain: vec![spki],
                app_attestation_token: Sha256::digest(challenge).to_vec(),
            },
        };

        keys.insert(identifier.to_owned(), AttestedKeyState::Attested { signing_key });

        Ok(attestation_data)
    }

    fn sign(&self, identifier: &str, payload: &[u8]) -> Result<Vec<u8>, AttestedKeyError> {
        let keys = self.keys.lock();
        match keys.get(identifier) {
            Some(AttestedKeyState::Attested { signing_key }) => {
                let signature: Signature = signing_key
                    .try_sign_with_rng(&mut OsRng, payload)
                    .map_err(|err| AttestedKeyError::other(format!("signing failed: {err}")))?;

                Ok(signature.to_der().as_bytes().to_vec())
            }
            Some(AttestedKeyState::Generated) => Err(AttestedKeyError::other(format!(
                "key {identifier} has not been attested yet"
            ))),
            None => Err(AttestedKeyError::other(format!(
                "unknown key identifier {identifier}"
            ))),
        }
    }

    fn public_key(&self, identifier: &str) -> Result<Vec<u8>, AttestedKeyError> {
        if self.key_type == AttestedKeyType::Apple {
            return Err(AttestedKeyError::unsupported_method("public_key"));
        }

        let keys = self.keys.lock();
        match keys.get(identifier) {
            Some(AttestedKeyState::Attested { signing_key }) => Self::spki_der(signing_key),
            Some(AttestedKeyState::Generated) => Err(AttestedKeyError::other(format!(
                "key {identifier} has not been attested yet"
            ))),
            None => Err(AttestedKeyError::other(format!(
                "unknown key identifier {identifier}"
            ))),
        }
    }

    fn delete(&self, identifier: &str) -> Result<(), AttestedKeyError> {
        if self.key_type == AttestedKeyType::Apple {
            return Err(AttestedKeyError::unsupported_method("delete"));
        }

        self.keys.lock().remove(identifier);

        Ok(())
    }
}
