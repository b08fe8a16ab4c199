//! Hardware-backed key management for a wallet's cryptographic core.
//!
//! Abstracts over device secure-hardware key storage so the core can create,
//! use, attest and destroy keys without touching platform security APIs.
//! Two structurally different platform models are covered:
//!
//! * Store-based platforms with a persistent, inspectable keystore are
//!   driven through [`keystore`]: get-or-create P-256 signing keys and
//!   AES-256 encryption keys addressed by caller-chosen identifier, with a
//!   [`HardwareBackingPolicy`] that refuses software-only keys outside an
//!   explicit debug/emulator exception.
//! * Attestation-based platforms where keys are opaque identities proven
//!   genuine against a server challenge are driven through [`attested_key`].
//!
//! Platform backends are injected as bridge trait implementations; backends
//! are built once at process start and passed explicitly, with no global
//! singletons. All platform failures are translated into the typed errors of
//! this crate at the bridge boundary. [`retry`](retry()) supplies a bounded
//! exponential-backoff discipline for the transient ones.

pub mod attested_key;
pub mod keystore;

mod alias;
pub use alias::*;

mod error;
pub use error::*;

mod policy;
pub use policy::*;

mod retry;
pub use retry::*;

mod security_level;
pub use security_level::*;

mod storage_path;
pub use storage_path::*;

// private modules
mod task;
