//! Truncated exponential backoff with full jitter.

/// Source of uniformly-distributed randomness in `[0, 1)`, injectable for deterministic tests.
pub trait JitterSource: Send + Sync {
    /// Returns a value in `[0, 1)`.
    fn uniform(&self) -> f64;
}

/// The real jitter source, backed by [`rand::random`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemJitter;

impl JitterSource for SystemJitter {
    fn uniform(&self) -> f64 {
        rand::random::<f64>()
    }
}

/// Computes the delay, in milliseconds, for the transition from `attempt` to `attempt + 1`.
///
/// `rawDelay = baseDelayMs * 2^attempt`, `cap = min(rawDelay, maxDelayMs)`, and the result is
/// drawn uniformly from `[0, cap)`.
pub fn calculate_backoff_delay_ms(attempt: u32, base_delay_ms: u64, max_delay_ms: u64) -> u64 {
    calculate_backoff_delay_ms_with(&SystemJitter, attempt, base_delay_ms, max_delay_ms)
}

/// Same as [`calculate_backoff_delay_ms`] but with an injectable jitter source, for tests that
/// need to pin the random draw.
pub fn calculate_backoff_delay_ms_with(
    jitter: &dyn JitterSource,
    attempt: u32,
    base_delay_ms: u64,
    max_delay_ms: u64,
) -> u64 {
    let raw_delay = (base_delay_ms as f64) * 2f64.powi(attempt as i32);
    let cap = raw_delay.min(max_delay_ms as f64);
    (jitter.uniform() * cap).floor() as u64
}
