//! Per-call `RetryConfig` resolution from defaults, headers, and the killswitch gate.

use crate::transport::Headers;

/// Header carrying the `"true"` literal that enables retries for a call.
pub const HEADER_ENABLED: &str = "X-Cursor-RetryInterceptor-Enabled";
/// Header overriding [`RetryConfig::max_retries`].
pub const HEADER_MAX_RETRIES: &str = "X-Cursor-RetryInterceptor-MaxRetries";
/// Header overriding [`RetryConfig::base_delay_ms`].
pub const HEADER_BASE_DELAY_MS: &str = "X-Cursor-RetryInterceptor-BaseDelayMs";
/// Header overriding [`RetryConfig::max_delay_ms`].
pub const HEADER_MAX_DELAY_MS: &str = "X-Cursor-RetryInterceptor-MaxDelayMs";

/// Caller-supplied defaults consulted before headers are applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDefaults {
    /// Whether retries are enabled absent an `Enabled` header.
    pub enabled: bool,
    /// The retry budget absent a `MaxRetries` header.
    pub max_retries: u32,
    /// The backoff base delay, in milliseconds, absent a `BaseDelayMs` header.
    pub base_delay_ms: u64,
    /// The backoff cap, in milliseconds, absent a `MaxDelayMs` header.
    pub max_delay_ms: u64,
}

impl Default for RetryDefaults {
    fn default() -> Self {
        Self { enabled: false, max_retries: 1, base_delay_ms: 100, max_delay_ms: 10_000 }
    }
}

/// The fully-resolved retry configuration for one outer call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    /// Whether the engine should retry this call at all.
    pub enabled: bool,
    /// Maximum number of retries; the engine performs at most `max_retries + 1` invocations.
    pub max_retries: u32,
    /// Backoff base delay, in milliseconds.
    pub base_delay_ms: u64,
    /// Backoff cap, in milliseconds.
    pub max_delay_ms: u64,
}

impl RetryConfig {
    /// Resolves a [`RetryConfig`] from `defaults`, then per-call `headers`, then the killswitch.
    ///
    /// Resolution order: start from `defaults`; `Enabled: true` turns retries on (any other
    /// value or absence leaves the default); `MaxRetries`/`BaseDelayMs`/`MaxDelayMs` headers
    /// override their field on successful, non-negative parse (and `BaseDelayMs` additionally
    /// rejects values below `1`); finally, if `killswitch_active` is `true`, `enabled` is forced
    /// to `false` regardless of everything above.
    pub fn resolve(headers: &Headers, defaults: RetryDefaults, killswitch_active: bool) -> Self {
        let mut cfg = RetryConfig {
            enabled: defaults.enabled,
            max_retries: defaults.max_retries,
            base_delay_ms: defaults.base_delay_ms,
            max_delay_ms: defaults.max_delay_ms,
        };

        if headers.get(HEADER_ENABLED).map(String::as_str) == Some("true") {
            cfg.enabled = true;
        }
        if let Some(v) = parse_header(headers, HEADER_MAX_RETRIES) {
            cfg.max_retries = v as u32;
        }
        if let Some(v) = parse_header(headers, HEADER_BASE_DELAY_MS) {
            if v >= 1 {
                cfg.base_delay_ms = v;
            }
        }
        if let Some(v) = parse_header(headers, HEADER_MAX_DELAY_MS) {
            cfg.max_delay_ms = v;
        }
        if killswitch_active {
            cfg.enabled = false;
        }
        cfg
    }
}

/// Parses a header as a non-negative decimal integer. `u64::from_str` rejects both malformed
/// text and a leading `-`, so parse failure and negative values collapse to the same `None`.
/// Deliberately does not trim surrounding whitespace: per spec.md §9, header values are plain
/// ASCII decimal strings, and anything else — including `" 5 "` — is a parse failure like any
/// other, not a value to coerce.
fn parse_header(headers: &Headers, name: &str) -> Option<u64> {
    headers.get(name)?.parse::<u64>().ok()
}
