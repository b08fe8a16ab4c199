//! Accessor for the application-private storage directory.

use std::path::PathBuf;

use thiserror::Error;

/// The storage directory could not be resolved.
#[derive(Debug, Error)]
#[error("could not determine application storage path: {reason}")]
pub struct StoragePathError {
    /// Description of the platform failure.
    pub reason: String,
}

/// Supplies the application-private directory for the current platform.
///
/// The returned path may change across app moves and reinstalls, so callers
/// must only persist paths relative to it, never the absolute value.
pub trait StoragePathProvider: Send + Sync {
    /// Resolves the application-private storage directory.
    ///
    /// # Errors
    ///
    /// Returns [`StoragePathError`] if the platform cannot supply a
    /// directory, e.g. before platform initialization has completed.
    fn storage_path(&self) -> Result<PathBuf, StoragePathError>;
}
