use crate::error::{
    ChainError,
    ChainResult,
};

use std::{
    future::Future,
    time::Duration,
};
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Runs `op` until it returns something other than a transient backend error, sleeping
/// `interval` between attempts. Semantic errors are returned as is. Returns
/// [`ChainError::Cancelled`] once `cancel` fires.
pub async fn until_succeeds<T, F, Fut>(
    cancel: &CancellationToken,
    interval: Duration,
    mut op: F,
) -> ChainResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ChainResult<T>>,
{
    let mut attempt = 0u64;
    loop {
        if cancel.is_cancelled() {
            return Err(ChainError::Cancelled);
        }
        match op().await {
            Err(err) if err.is_transient() => {
                attempt += 1;
                warn!(target: "assertion_chain::retry", %err, attempt, "Transient error, retrying");
            }
            result => return result,
        }
        if !super::sleep_or_cancelled(cancel, interval).await {
            return Err(ChainError::Cancelled);
        }
    }
}
