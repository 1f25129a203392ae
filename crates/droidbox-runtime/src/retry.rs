//! Bounded poll-until helper.
//!
//! Every wait in the system (sandbox boot, readiness after start) runs
//! through [`poll_until`], which polls at a fixed interval and converts an
//! exceeded deadline into a typed timeout error instead of looping forever.

use std::future::Future;
use std::time::Duration;

use droidbox_error::CommonError;
use tokio::time::Instant;

/// Polls `op` every `interval` until it yields a value or `timeout` elapses.
///
/// `op` returning `None` means "not ready yet". The first poll happens
/// immediately.
///
/// # Errors
///
/// Returns [`CommonError::Timeout`] naming `what` when the deadline passes
/// without a successful poll.
pub async fn poll_until<T, F, Fut>(
    what: &str,
    timeout: Duration,
    interval: Duration,
    mut op: F,
) -> Result<T, CommonError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(value) = op().await {
            return Ok(value);
        }
        if Instant::now() + interval > deadline {
            return Err(CommonError::timeout(format!(
                "{what} after {}s",
                timeout.as_secs()
            )));
        }
        tokio::time::sleep(interval).await;
    }
}
