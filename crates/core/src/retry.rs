//! Capped exponential backoff for transient failures.
//!
//! Only errors classified [`Error::is_transient`] are retried; everything
//! else propagates immediately. Used inside the WAL append and network
//! I/O paths.

use rand::Rng;
use std::time::Duration;

use crate::error::{Error, Result};

/// Backoff policy: exponential growth from `base` capped at `cap`, with
/// up to 50% random jitter added per attempt.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub max_attempts: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff {
            max_attempts: 5,
            base: Duration::from_millis(2),
            cap: Duration::from_millis(250),
        }
    }
}

impl Backoff {
    /// Delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self.base.saturating_mul(1u32 << attempt.min(16));
        let capped = exp.min(self.cap);
        let jitter = rand::thread_rng().gen_range(0..=capped.as_millis() as u64 / 2);
        capped + Duration::from_millis(jitter)
    }
}

/// Run `op`, retrying transient failures per `policy`. The final error
/// is returned unchanged once attempts are exhausted.
pub fn retry_transient<T>(policy: Backoff, mut op: impl FnMut() -> Result<T>) -> Result<T> {
    let mut attempt = 0;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt + 1 < policy.max_attempts => {
                std::thread::sleep(policy.delay(attempt));
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retries_transient_until_success() {
        let mut calls = 0;
        let result = retry_transient(
            Backoff {
                max_attempts: 5,
                base: Duration::from_millis(1),
                cap: Duration::from_millis(2),
            },
            || {
                calls += 1;
                if calls < 3 {
                    Err(Error::Transient("again".into()))
                } else {
                    Ok(calls)
                }
            },
        );
        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn non_transient_fails_fast() {
        let mut calls = 0;
        let result: Result<()> = retry_transient(Backoff::default(), || {
            calls += 1;
            Err(Error::EngineClosed)
        });
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[test]
    fn exhausts_attempts() {
        let mut calls = 0;
        let result: Result<()> = retry_transient(
            Backoff {
                max_attempts: 3,
                base: Duration::from_millis(1),
                cap: Duration::from_millis(1),
            },
            || {
                calls += 1;
                Err(Error::Transient("never".into()))
            },
        );
        assert!(result.is_err());
        assert_eq!(calls, 3);
    }
}
