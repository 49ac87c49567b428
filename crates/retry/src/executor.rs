//! Drives a fallible async operation through a [`Policy`], stopping at the
//! first permanent classification, attempt exhaustion, or cancellation.

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::classify::Classification;
use crate::policy::Policy;

/// Outcome of [`run`] when the loop did not produce a value.
#[derive(Debug)]
pub enum RetryError<E> {
    /// The operation failed and every attempt was exhausted or the last
    /// failure was classified permanent; carries the final error.
    Exhausted(E),
    /// The cancellation token fired while waiting between attempts.
    Cancelled,
}

/// Runs `op` up to `policy.max_attempts` times. `classify` determines whether
/// a given error is worth retrying; `cancel`, if given, aborts the wait
/// between attempts (an in-flight attempt itself is not interrupted here —
/// callers that need that wrap `op` with their own cancellation-aware call).
pub async fn run<T, E, F, Fut>(
    policy: &Policy,
    cancel: Option<&CancellationToken>,
    mut classify: impl FnMut(&E) -> Classification,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
{
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => {
                let permanent = classify(&error) == Classification::Permanent;
                if permanent {
                    warn!(attempt, "retry loop aborting: permanent classification");
                    return Err(RetryError::Exhausted(error));
                }
                if attempt >= policy.max_attempts {
                    warn!(attempt, "retry loop exhausted all attempts");
                    return Err(RetryError::Exhausted(error));
                }

                let delay = policy.delay_for_attempt(attempt);
                debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying after delay");

                if let Some(cancel) = cancel {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                    }
                } else {
                    tokio::time::sleep(delay).await;
                }

                attempt += 1;
            }
        }
    }
}
