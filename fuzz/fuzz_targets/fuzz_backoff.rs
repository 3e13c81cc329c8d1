//! Fuzz target for retry backoff.
//!
//! Delays must stay within the ceiling for any policy and attempt count.

#![no_main]

use libfuzzer_sys::fuzz_target;
use std::time::Duration;
use sync_queue::RetryPolicy;

fuzz_target!(|data: (u32, u64, u64, f64, u32)| {
    let (max_attempts, initial_ms, max_ms, factor, attempt) = data;
    if !factor.is_finite() || factor < 1.0 {
        return;
    }

    let policy = RetryPolicy {
        max_attempts,
        initial_delay: Duration::from_millis(initial_ms % 86_400_000),
        max_delay: Duration::from_millis(max_ms % 86_400_000),
        backoff_factor: factor,
        request_timeout: Duration::from_secs(1),
    };

    let delay = policy.delay_for_attempt(attempt);
    if attempt > 0 {
        assert!(delay <= policy.max_delay);
    }
    let _ = policy.is_exhausted(attempt);
});
