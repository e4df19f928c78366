use std::thread;
use std::time::Duration;

use receipt_ledger_store_sqlite::StoreError;
use tracing::debug;

/// Bounded retry schedule for transient storage failures. Attempt `n` sleeps
/// for `base_delay * 2^(n-1)` before trying again.
pub(crate) struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

pub(crate) const WRITE_RETRY: RetryPolicy =
    RetryPolicy { max_attempts: 3, base_delay: Duration::from_millis(20) };

/// Run `op`, retrying under `policy` while it fails transiently. The final
/// error is returned unchanged once the attempt budget runs out, and
/// non-transient errors are never retried.
pub(crate) fn with_retry<T>(
    policy: &RetryPolicy,
    mut op: impl FnMut() -> Result<T, StoreError>,
) -> Result<T, StoreError> {
    let mut attempt = 0_u32;
    loop {
        attempt += 1;
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < policy.max_attempts => {
                let delay = policy.base_delay * 2_u32.saturating_pow(attempt - 1);
                debug!(
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "transient storage failure, backing off"
                );
                thread::sleep(delay);
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn busy_error() -> StoreError {
        StoreError::from(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        ))
    }

    #[test]
    fn transient_failures_are_retried_until_success() {
        let policy = RetryPolicy { max_attempts: 3, base_delay: Duration::from_millis(1) };
        let mut calls = 0_u32;

        let result = with_retry(&policy, || {
            calls += 1;
            if calls < 3 {
                Err(busy_error())
            } else {
                Ok(calls)
            }
        });

        match result {
            Ok(value) => assert_eq!(value, 3),
            Err(err) => panic!("expected success after retries, got {err}"),
        }
    }

    #[test]
    fn attempt_budget_is_bounded() {
        let policy = RetryPolicy { max_attempts: 3, base_delay: Duration::from_millis(1) };
        let mut calls = 0_u32;

        let result: Result<(), StoreError> = with_retry(&policy, || {
            calls += 1;
            Err(busy_error())
        });

        assert!(result.is_err());
        assert_eq!(calls, 3);
    }

    #[test]
    fn non_transient_failures_are_not_retried() {
        let policy = RetryPolicy { max_attempts: 3, base_delay: Duration::from_millis(1) };
        let mut calls = 0_u32;

        let result: Result<(), StoreError> = with_retry(&policy, || {
            calls += 1;
            Err(StoreError::Capacity {
                namespace: "receipts.local".to_string(),
                payload_bytes: 10,
                quota_bytes: 1,
            })
        });

        assert!(result.is_err());
        assert_eq!(calls, 1);
    }
}
