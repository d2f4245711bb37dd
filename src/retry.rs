use std::fmt::Display;
use std::time::Duration;

use tracing::warn;

use crate::config::RetryConfig;

impl RetryConfig {
    /// Backoff before retry number `attempt` (1-based), doubling up to the cap.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << shift)
            .min(self.max_backoff)
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// policy's attempts are used up. Sleeps the calling thread between attempts.
pub fn with_retries<T, E, F, R>(policy: &RetryConfig, what: &str, mut op: F, retryable: R) -> Result<T, E>
where
    E: Display,
    F: FnMut() -> Result<T, E>,
    R: Fn(&E) -> bool,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match op() {
            Ok(v) => return Ok(v),
            Err(e) if attempt < max_attempts && retryable(&e) => {
                let delay = policy.backoff(attempt);
                warn!(
                    operation = what,
                    attempt,
                    max_attempts,
                    delay = ?delay,
                    error = %e,
                    "transient failure, retrying",
                );
                std::thread::sleep(delay);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
