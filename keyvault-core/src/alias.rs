//! Namespaced storage aliases derived from caller identifiers.
//!
//! Callers address keys by a logical identifier such as `"account-signing-key"`.
//! Inside the platform store every key kind gets its own namespace, so the same
//! identifier can name a signing key, an encryption key and an attested key
//! without any of them colliding. Deletion and enumeration by kind operate on
//! the kind's prefix only.

use std::fmt;

/// The three families of keys managed by this layer.
///
/// The kind determines the alias prefix, the algorithm family and which
/// operations the key supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyKind {
    /// P-256 ECDSA signing key pair.
    Signing,
    /// AES-256 symmetric encryption key.
    Encryption,
    /// Platform-attested key referenced by an opaque identity.
    Attested,
}

impl KeyKind {
    /// The storage namespace prefix for this kind.
    ///
    /// No prefix is a prefix of another, which makes [`alias`] collision-free
    /// across kinds for any identifier.
    #[must_use]
    pub const fn prefix(self) -> &'static str {
        match self {
            Self::Signing => "ecdsa-",
            Self::Encryption => "aes-",
            Self::Attested => "attested-",
        }
    }
}

/// A fully namespaced storage name: kind prefix plus caller identifier.
///
/// Identifiers are passed through verbatim, so the mapping from
/// `(kind, identifier)` to alias is deterministic and injective per kind.
/// Identifiers should stick to ASCII alphanumerics plus `-`, `_` and `.`;
/// other characters are not rewritten here and may be rejected by the
/// platform store at creation time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyAlias(String);

impl KeyAlias {
    /// The alias as a string slice, suitable for platform store APIs.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Reconstructs an alias from a raw store name, e.g. while enumerating
    /// existing entries. Returns `None` if the name carries no known prefix.
    #[must_use]
    pub fn from_store_name(name: &str) -> Option<Self> {
        [KeyKind::Signing, KeyKind::Encryption, KeyKind::Attested]
            .into_iter()
            .any(|kind| name.starts_with(kind.prefix()))
            .then(|| Self(name.to_string()))
    }

    /// The kind this alias belongs to. Prefixes are mutually
    /// non-overlapping, so at most one kind can match.
    #[must_use]
    pub fn kind(&self) -> Option<KeyKind> {
        [KeyKind::Signing, KeyKind::Encryption, KeyKind::Attested]
            .into_iter()
            .find(|kind| self.0.starts_with(kind.prefix()))
    }

    /// Whether this alias belongs to the given kind's namespace.
    #[must_use]
    pub fn has_kind(&self, kind: KeyKind) -> bool {
        self.0.starts_with(kind.prefix())
    }
}

impl fmt::Display for KeyAlias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derives the storage alias for a key of `kind` named by `identifier`.
///
/// Pure data transformation; there are no error conditions.
#[must_use]
pub fn alias(kind: KeyKind, identifier: &str) -> KeyAlias {
    KeyAlias(format!("{}{identifier}", kind.prefix()))
}

#[cfg(test)]
mod tests {
    use super::alias;
    use super::KeyAlias;
    use super::KeyKind;

    #[test]
    fn kinds_never_collide_for_the_same_identifier() {
        let signing = alias(KeyKind::Signing, "wallet-key");
        let encryption = alias(KeyKind::Encryption, "wallet-key");
        let attested = alias(KeyKind::Attested, "wallet-key");

        assert_ne!(signing, encryption);
        assert_ne!(signing, attested);
        assert_ne!(encryption, attested);
    }

    #[test]
    fn derivation_is_deterministic_and_injective() {
        assert_eq!(
            alias(KeyKind::Signing, "account"),
            alias(KeyKind::Signing, "account")
        );
        assert_ne!(
            alias(KeyKind::Signing, "account-1"),
            alias(KeyKind::Signing, "account-2")
        );
    }

    #[test]
    fn identifier_resembling_another_prefix_stays_in_its_namespace() {
        // An identifier that happens to start like a different kind's prefix
        // must still land in its own namespace.
        let a = alias(KeyKind::Encryption, "ecdsa-account");
        assert!(a.has_kind(KeyKind::Encryption));
        assert!(!a.has_kind(KeyKind::Signing));
        assert_eq!(a.kind(), Some(KeyKind::Encryption));
    }

    #[test]
    fn store_name_round_trip() {
        let a = alias(KeyKind::Attested, "identity");
        let restored = KeyAlias::from_store_name(a.as_str()).unwrap();
        assert_eq!(a, restored);

        assert!(KeyAlias::from_store_name("unrelated-entry").is_none());
    }
}
