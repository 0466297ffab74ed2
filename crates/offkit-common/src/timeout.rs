//! Timeout utilities.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

use crate::OffKitError;

/// Run an operation with an optional upper bound.
///
/// `None` waits for as long as the operation takes.
pub async fn with_timeout<T, F, Fut>(
    timeout: Option<Duration>,
    operation: F,
) -> Result<T, OffKitError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    match timeout {
        Some(bound) => tokio::time::timeout(bound, operation())
            .await
            .map_err(|_| {
                debug!(?bound, "Operation exceeded its bound");
                OffKitError::Timeout(bound)
            }),
        None => Ok(operation().await),
    }
}
