pub mod retry;
pub mod write_once;

pub use retry::until_succeeds;
pub use write_once::WriteOnce;

use crate::primitives::B256;

use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Shortened hex form of a hash for log lines, e.g. `0x1234ab..`.
pub fn trunc(hash: &B256) -> String {
    format!("0x{}..", alloy::hex::encode(&hash[..4]))
}

/// Sleeps for `duration`, returning false if `cancel` fired first.
pub async fn sleep_or_cancelled(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
