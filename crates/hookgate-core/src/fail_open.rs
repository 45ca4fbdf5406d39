//! Fail-open utilities for best-effort work
//!
//! Advisory hooks (pressure sampling, context tracking, audit writes) must
//! never take the dispatcher down with them. These helpers turn their
//! failures into a logged `None`.
//!
//! DO NOT use fail-open for:
//! - Policy decisions on before channels (those must block)
//! - Loop state mutations whose outcome decides whether to re-inject

use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::{HookgateError, Result};

/// Execute an operation that should fail open
///
/// Logs the error via `tracing::warn!` on failure and returns `None`.
///
/// # Usage
///
/// ```no_run
/// use hookgate_core::fail_open::fail_open;
/// use hookgate_core::Result;
///
/// async fn append_audit_line() -> Result<()> {
///     Ok(())
/// }
///
/// async fn example() {
///     let written = fail_open("audit", || append_audit_line()).await;
///     // written is None if the append failed
/// }
/// ```
pub async fn fail_open<F, Fut, T>(operation_name: &str, f: F) -> Option<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match f().await {
        Ok(val) => Some(val),
        Err(e) => {
            warn!("{} failed (fail-open): {}", operation_name, e);
            None
        }
    }
}

/// Bound a fallible future by `limit`
///
/// Elapsed time maps to [`HookgateError::Timeout`] naming the operation, so
/// callers can treat a hung child process like any other sampling failure.
pub async fn with_timeout<Fut, T>(operation_name: &str, limit: Duration, fut: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(HookgateError::Timeout(format!(
            "{} exceeded {}ms",
            operation_name,
            limit.as_millis()
        ))),
    }
}
