//! Classification of where a key physically resides.

use strum::Display;
use strum::EnumString;

/// Where the platform reports a key to be held.
///
/// Store-backed platforms can be asked where a key lives after it has been
/// created; the answer drives the hardware-backing policy. `StrongBox` covers
/// both Android StrongBox and the Apple Secure Enclave, which are the
/// dedicated-chip tiers of their respective platforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum SecurityLevel {
    /// The platform could not or would not report a level.
    Unknown,
    /// Key material lives in regular process-accessible memory.
    SoftwareOnly,
    /// Key material is held by a trusted execution environment.
    TrustedEnvironment,
    /// Key material is held by a dedicated security chip.
    StrongBox,
}

impl SecurityLevel {
    /// Whether this level counts as secure-hardware residency.
    #[must_use]
    pub const fn is_hardware_backed(self) -> bool {
        matches!(self, Self::TrustedEnvironment | Self::StrongBox)
    }
}

#[cfg(test)]
mod tests {
    use super::SecurityLevel;

    #[test]
    fn hardware_backed_levels() {
        assert!(SecurityLevel::TrustedEnvironment.is_hardware_backed());
        assert!(SecurityLevel::StrongBox.is_hardware_backed());
        assert!(!SecurityLevel::SoftwareOnly.is_hardware_backed());
        assert!(!SecurityLevel::Unknown.is_hardware_backed());
    }

    #[test]
    fn display_is_snake_case() {
        assert_eq!(SecurityLevel::TrustedEnvironment.to_string(), "trusted_environment");
        assert_eq!(SecurityLevel::SoftwareOnly.to_string(), "software_only");
    }
}
