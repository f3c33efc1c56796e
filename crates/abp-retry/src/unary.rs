//! The Unary Retry Engine: re-invokes a unary call on retryable errors with backoff.

use std::time::Duration;

use crate::backoff::calculate_backoff_delay_ms;
use crate::config::{RetryConfig, RetryDefaults};
use crate::policy::should_retry_on_error;
use crate::telemetry::{InterceptorKind, LogLevel, RetryEventFields, RetryTelemetry};
use crate::transport::{DynamicConfigSource, FeatureGate, Headers, MethodDescriptor, MethodKind, UnaryInvoker};
use crate::ClassifiableError;
use crate::KILLSWITCH_GATE;

/// Wraps a unary transport invocation with retry, backoff, and telemetry.
pub struct UnaryRetryInterceptor<I, G, D, T> {
    inner: I,
    defaults: RetryDefaults,
    feature_gate: G,
    dynamic_config: D,
    telemetry: T,
}

impl<I, G, D, T> UnaryRetryInterceptor<I, G, D, T> {
    /// Builds a new interceptor wrapping `inner`, consulting `feature_gate` for the killswitch
    /// and `dynamic_config` for the retry-rule table, and emitting telemetry via `telemetry`.
    pub fn new(inner: I, defaults: RetryDefaults, feature_gate: G, dynamic_config: D, telemetry: T) -> Self {
        Self { inner, defaults, feature_gate, dynamic_config, telemetry }
    }
}

impl<I, G, D, T> UnaryRetryInterceptor<I, G, D, T>
where
    G: FeatureGate,
    D: DynamicConfigSource,
    T: RetryTelemetry,
{
    /// Invokes `method` through the wrapped transport, retrying on retryable errors.
    ///
    /// Non-unary methods and calls with retries disabled fall through to a single invocation.
    pub async fn call<Req, Res, E>(&self, method: &MethodDescriptor, headers: &Headers, req: Req) -> Result<Res, E>
    where
        I: UnaryInvoker<Req, Res, E>,
        Req: Clone + Send,
        E: ClassifiableError,
    {
        if method.kind != MethodKind::Unary {
            return self.inner.invoke(method, headers, req).await;
        }

        let killswitch = self.feature_gate.is_enabled(KILLSWITCH_GATE).await;
        let cfg = RetryConfig::resolve(headers, self.defaults, killswitch);
        if !cfg.enabled {
            return self.inner.invoke(method, headers, req).await;
        }

        let dynamic = self.dynamic_config.retry_rules().await;
        let mut attempt: u32 = 0;

        loop {
            match self.inner.invoke(method, headers, req.clone()).await {
                Ok(res) => {
                    if attempt > 0 {
                        self.telemetry.debug_log(
                            LogLevel::Info,
                            format!(
                                "Successfully completed after {attempt} retries ({} total requests made)",
                                attempt + 1
                            ),
                        );
                        self.telemetry.structured_event(
                            "Retry succeeded",
                            RetryEventFields::succeeded(InterceptorKind::Unary, method.name.clone(), attempt),
                        );
                    }
                    return Ok(res);
                }
                Err(err) => {
                    let code = err.transport_code();
                    let message = err.error_message();
                    if !should_retry_on_error(code, &message, &method.name, &dynamic) {
                        return Err(err);
                    }
                    if attempt >= cfg.max_retries {
                        self.telemetry.debug_log(
                            LogLevel::Warn,
                            format!("Max retries ({}) exhausted", cfg.max_retries),
                        );
                        self.telemetry.structured_event(
                            "Retry exhausted",
                            RetryEventFields::exhausted(
                                InterceptorKind::Unary,
                                method.name.clone(),
                                code.map(|c| c.as_str().to_string()),
                            ),
                        );
                        return Err(err);
                    }

                    let delay = calculate_backoff_delay_ms(attempt, cfg.base_delay_ms, cfg.max_delay_ms);
                    self.telemetry.debug_log(LogLevel::Info, format!("About to retry {}", method.name));
                    self.telemetry.structured_event(
                        "Retry attempt",
                        RetryEventFields::attempt(InterceptorKind::Unary, method.name.clone(), attempt, delay),
                    );
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    attempt += 1;
                }
            }
        }
    }
}
