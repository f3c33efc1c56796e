//! The Streaming Retry Engine: wraps a bidirectional- or server-streaming call, replaying the
//! request via a [`crate::Rewindable`] iterable and retrying only before the first response
//! element has been observed.

use std::time::Duration;

use futures::StreamExt;

use crate::backoff::calculate_backoff_delay_ms;
use crate::config::{RetryConfig, RetryDefaults};
use crate::policy::{should_retry_on_error, DynamicRetryConfig};
use crate::rewindable::{BoxRewindable, Rewindable};
use crate::telemetry::{InterceptorKind, LogLevel, RetryEventFields, RetryTelemetry};
use crate::transport::{
    BoxResponseStream, DynamicConfigSource, FeatureGate, Headers, MethodDescriptor, MethodKind,
    RequestPayload, StreamingInvoker, StreamingRequest,
};
use crate::ClassifiableError;
use crate::KILLSWITCH_GATE;

/// Wraps a streaming transport invocation with request replay, retry, backoff, and telemetry.
pub struct StreamRetryInterceptor<I, G, D, T> {
    inner: I,
    defaults: RetryDefaults,
    feature_gate: G,
    dynamic_config: D,
    telemetry: T,
}

impl<I, G, D, T> StreamRetryInterceptor<I, G, D, T> {
    /// Builds a new interceptor wrapping `inner`, consulting `feature_gate` for the killswitch
    /// and `dynamic_config` for the retry-rule table, and emitting telemetry via `telemetry`.
    pub fn new(inner: I, defaults: RetryDefaults, feature_gate: G, dynamic_config: D, telemetry: T) -> Self {
        Self { inner, defaults, feature_gate, dynamic_config, telemetry }
    }
}

/// What the engine replays on each attempt: either the caller's single request message
/// (server streaming), reused verbatim, or a rewindable wrapper over the caller's request
/// message stream (bidirectional streaming).
enum Replay<In> {
    Single(In),
    Rewindable(BoxRewindable<In>),
}

enum Decision<E> {
    Retry,
    Fail(E),
}

impl<I, G, D, T> StreamRetryInterceptor<I, G, D, T>
where
    G: FeatureGate,
    D: DynamicConfigSource,
    T: RetryTelemetry,
{
    /// Invokes `method` through the wrapped transport, retrying on retryable errors raised
    /// before the first response element is observed.
    ///
    /// Method kinds other than bidirectional and server streaming, and calls with retries
    /// disabled, fall through to a single invocation.
    pub async fn call<In, Out, E>(
        &self,
        method: &MethodDescriptor,
        headers: &Headers,
        req: StreamingRequest<In>,
    ) -> Result<BoxResponseStream<Out, E>, E>
    where
        I: StreamingInvoker<In, Out, E>,
        In: Clone + Send + 'static,
        Out: Send + 'static,
        E: ClassifiableError + Send + 'static,
    {
        if !matches!(method.kind, MethodKind::BidiStreaming | MethodKind::ServerStreaming) {
            return self.inner.invoke(method, headers, req).await;
        }

        let killswitch = self.feature_gate.is_enabled(KILLSWITCH_GATE).await;
        let cfg = RetryConfig::resolve(headers, self.defaults, killswitch);
        if !cfg.enabled {
            return self.inner.invoke(method, headers, req).await;
        }

        let dynamic = self.dynamic_config.retry_rules().await;
        let mut replay = match req.message {
            RequestPayload::Single(value) => Replay::Single(value),
            RequestPayload::Stream(source) => Replay::Rewindable(Rewindable::new(source)),
        };
        let mut attempt: u32 = 0;

        loop {
            let attempt_req = self.build_request(&replay);

            let mut response = match self.inner.invoke(method, headers, attempt_req).await {
                Ok(stream) => stream,
                Err(err) => {
                    match self.classify_and_maybe_retry(err, &dynamic, &cfg, &mut attempt, method, &replay).await {
                        Decision::Retry => continue,
                        Decision::Fail(err) => return Err(err),
                    }
                }
            };

            match response.next().await {
                None => {
                    self.finish_retries(&replay);
                    if attempt > 0 {
                        self.emit_success(method, attempt);
                    }
                    return Ok(Box::pin(futures::stream::empty()));
                }
                Some(Ok(first)) => {
                    self.finish_retries(&replay);
                    if attempt > 0 {
                        self.emit_success(method, attempt);
                    }
                    return Ok(Box::pin(async_stream::stream! {
                        yield Ok(first);
                        while let Some(item) = response.next().await {
                            yield item;
                        }
                    }));
                }
                Some(Err(err)) => {
                    match self.classify_and_maybe_retry(err, &dynamic, &cfg, &mut attempt, method, &replay).await {
                        Decision::Retry => continue,
                        Decision::Fail(err) => return Err(err),
                    }
                }
            }
        }
    }

    fn build_request<In: Clone + Send + 'static>(&self, replay: &Replay<In>) -> StreamingRequest<In> {
        match replay {
            Replay::Single(value) => StreamingRequest { message: RequestPayload::Single(value.clone()) },
            Replay::Rewindable(r) => {
                let mut reader = r
                    .new_reader()
                    .expect("rewindable iterable already finished: new generation requested after retries were finished");
                let stream = async_stream::stream! {
                    while let Some(item) = reader.next().await {
                        yield item;
                    }
                };
                StreamingRequest { message: RequestPayload::Stream(Box::pin(stream)) }
            }
        }
    }

    fn finish_retries<In>(&self, replay: &Replay<In>) {
        if let Replay::Rewindable(r) = replay {
            r.on_retry_finished();
        }
    }

    fn emit_success(&self, method: &MethodDescriptor, attempt: u32) {
        self.telemetry.debug_log(
            LogLevel::Info,
            format!(
                "Successfully completed after {attempt} retries ({} total requests made)",
                attempt + 1
            ),
        );
        self.telemetry.structured_event(
            "Retry succeeded",
            RetryEventFields::succeeded(InterceptorKind::Stream, method.name.clone(), attempt),
        );
    }

    async fn classify_and_maybe_retry<In, E>(
        &self,
        err: E,
        dynamic: &DynamicRetryConfig,
        cfg: &RetryConfig,
        attempt: &mut u32,
        method: &MethodDescriptor,
        replay: &Replay<In>,
    ) -> Decision<E>
    where
        E: ClassifiableError,
    {
        let code = err.transport_code();
        let message = err.error_message();
        let retryable = should_retry_on_error(code, &message, &method.name, dynamic);

        if !retryable {
            self.finish_retries(replay);
            return Decision::Fail(err);
        }
        if *attempt >= cfg.max_retries {
            self.finish_retries(replay);
            self.telemetry
                .debug_log(LogLevel::Warn, format!("Max retries ({}) exhausted", cfg.max_retries));
            self.telemetry.structured_event(
                "Retry exhausted",
                RetryEventFields::exhausted(
                    InterceptorKind::Stream,
                    method.name.clone(),
                    code.map(|c| c.as_str().to_string()),
                ),
            );
            return Decision::Fail(err);
        }

        let delay = calculate_backoff_delay_ms(*attempt, cfg.base_delay_ms, cfg.max_delay_ms);
        self.telemetry.debug_log(LogLevel::Info, format!("About to retry {}", method.name));
        self.telemetry.structured_event(
            "Retry attempt",
            RetryEventFields::attempt(InterceptorKind::Stream, method.name.clone(), *attempt, delay),
        );
        tokio::time::sleep(Duration::from_millis(delay)).await;
        *attempt += 1;
        Decision::Retry
    }
}
