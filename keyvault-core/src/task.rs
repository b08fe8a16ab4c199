//! Shipping blocking secure-hardware calls off the async runtime.

/// Runs a blocking platform call on the blocking thread pool.
///
/// Key generation and attestation can block for perceptible amounts of time,
/// so they must never run on the async executor threads directly.
pub(crate) async fn blocking<F, R>(f: F) -> R
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .expect("blocking secure hardware task panicked")
}
