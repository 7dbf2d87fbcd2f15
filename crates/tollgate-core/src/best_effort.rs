//! Side effects whose failure must never reach the caller
//!
//! Cache fills, alert delivery and ledger writes made after a reply go
//! through these helpers: errors are logged at `warn` and dropped.

use std::fmt::Display;
use std::future::Future;

/// Log and discard the error of a completed side effect
pub fn log_failure<E: Display>(operation: &'static str, result: Result<(), E>) {
    if let Err(e) = result {
        tracing::warn!(error = %e, operation, "best-effort operation failed");
    }
}

/// Run a side effect in the background without awaiting it
///
/// Panics inside `future` are contained by the spawned task.
pub fn spawn<F, E>(operation: &'static str, future: F)
where
    F: Future<Output = Result<(), E>> + Send + 'static,
    E: Display + Send + 'static,
{
    tokio::spawn(async move {
        log_failure(operation, future.await);
    });
}
