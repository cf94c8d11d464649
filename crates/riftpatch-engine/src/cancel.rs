use std::time::{Duration, Instant};

use riftpatch_core::UpdateError;
pub use tokio_util::sync::CancellationToken;

const SLEEP_SLICE: Duration = Duration::from_millis(25);

pub fn ensure_active(cancel: &CancellationToken) -> Result<(), UpdateError> {
    if cancel.is_cancelled() {
        return Err(UpdateError::Cancelled);
    }
    Ok(())
}

/// Blocks for `duration`, waking early with `Cancelled` once the token fires.
pub fn sleep_or_cancel(cancel: &CancellationToken, duration: Duration) -> Result<(), UpdateError> {
    let deadline = Instant::now() + duration;
    loop {
        ensure_active(cancel)?;
        let now = Instant::now();
        if now >= deadline {
            return Ok(());
        }
        std::thread::sleep(SLEEP_SLICE.min(deadline - now));
    }
}
