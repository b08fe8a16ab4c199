//! Hardware-backing validation for freshly generated keys.
//!
//! A key is only accepted when the platform reports it as resident in a
//! trusted execution environment or a dedicated security chip. The single
//! exception is a debug build running on an emulator, where no secure
//! hardware exists at all; that acceptance is logged so it never happens
//! silently. Validation runs when a key is freshly generated, not on every
//! fetch of an already-validated key.

use tracing::warn;

use crate::error::KeyStoreError;
use crate::security_level::SecurityLevel;

/// The runtime context the policy decides under.
///
/// Built explicitly at process start and handed to the services; nothing in
/// this layer tries to detect the build profile or emulator state itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeEnvironment {
    /// Whether this is a non-production build.
    pub debug_build: bool,
    /// Whether the process runs on an emulator or simulator.
    pub emulator: bool,
}

impl RuntimeEnvironment {
    /// Production context: hardware backing is mandatory.
    #[must_use]
    pub const fn production() -> Self {
        Self {
            debug_build: false,
            emulator: false,
        }
    }

    /// Debug build on an emulator: the only context in which a
    /// software-only key is acceptable.
    #[must_use]
    pub const fn emulator_debug() -> Self {
        Self {
            debug_build: true,
            emulator: true,
        }
    }
}

/// Decides whether a freshly generated key may be kept.
#[derive(Debug, Clone, Copy)]
pub struct HardwareBackingPolicy {
    environment: RuntimeEnvironment,
}

impl HardwareBackingPolicy {
    /// Creates a policy for the given runtime context.
    #[must_use]
    pub const fn new(environment: RuntimeEnvironment) -> Self {
        Self { environment }
    }

    /// Validates the security level the platform reported for a new key.
    ///
    /// # Errors
    ///
    /// Returns [`KeyStoreError::MissingHardware`] carrying the observed level
    /// whenever the key is not hardware backed, unless the runtime context is
    /// both a debug build and an emulator and the level is `SoftwareOnly`.
    pub fn validate(&self, level: SecurityLevel) -> Result<(), KeyStoreError> {
        if level.is_hardware_backed() {
            return Ok(());
        }

        if level == SecurityLevel::SoftwareOnly
            && self.environment.debug_build
            && self.environment.emulator
        {
            warn!(
                %level,
                "accepting software-only key: debug build on emulator has no secure hardware"
            );
            return Ok(());
        }

        Err(KeyStoreError::MissingHardware { level })
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::HardwareBackingPolicy;
    use super::RuntimeEnvironment;
    use crate::error::KeyStoreError;
    use crate::security_level::SecurityLevel;

    #[test_case(SecurityLevel::TrustedEnvironment)]
    #[test_case(SecurityLevel::StrongBox)]
    fn hardware_levels_pass_in_production(level: SecurityLevel) {
        let policy = HardwareBackingPolicy::new(RuntimeEnvironment::production());
        policy.validate(level).unwrap();
    }

    #[test_case(SecurityLevel::SoftwareOnly)]
    #[test_case(SecurityLevel::Unknown)]
    fn non_hardware_levels_fail_in_production(level: SecurityLevel) {
        let policy = HardwareBackingPolicy::new(RuntimeEnvironment::production());
        let err = policy.validate(level).unwrap_err();

        match err {
            KeyStoreError::MissingHardware { level: observed } => assert_eq!(observed, level),
            other => panic!("expected MissingHardware, got {other:?}"),
        }
    }

    #[test]
    fn software_only_passes_on_emulator_debug() {
        let policy = HardwareBackingPolicy::new(RuntimeEnvironment::emulator_debug());
        policy.validate(SecurityLevel::SoftwareOnly).unwrap();
    }

    #[test]
    fn unknown_level_fails_even_on_emulator_debug() {
        let policy = HardwareBackingPolicy::new(RuntimeEnvironment::emulator_debug());
        policy.validate(SecurityLevel::Unknown).unwrap_err();
    }

    #[test]
    fn debug_build_on_real_device_still_requires_hardware() {
        let policy = HardwareBackingPolicy::new(RuntimeEnvironment {
            debug_build: true,
            emulator: false,
        });
        policy.validate(SecurityLevel::SoftwareOnly).unwrap_err();
    }

    #[test]
    fn emulator_release_build_still_requires_hardware() {
        let policy = HardwareBackingPolicy::new(RuntimeEnvironment {
            debug_build: false,
            emulator: true,
        });
        policy.validate(SecurityLevel::SoftwareOnly).unwrap_err();
    }
}
