// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]
#![doc = include_str!("../README.md")]

mod backoff;
mod config;
mod policy;
mod rewindable;
mod streaming;
mod telemetry;
mod transport;
mod unary;

pub use backoff::{calculate_backoff_delay_ms, JitterSource, SystemJitter};
pub use config::{RetryConfig, RetryDefaults};
pub use policy::{
    should_retry_on_error, Code, DynamicRetryConfig, RetryRule, NEVER_RETRYABLE,
};
pub use rewindable::{AlreadyFinished, BoxRewindable, BoxRewindableReader, Rewindable, RewindableReader};
pub use streaming::StreamRetryInterceptor;
pub use telemetry::{
    InterceptorKind, LogLevel, RecordingTelemetry, RetryEventFields, RetryTelemetry,
    TracingTelemetry,
};
pub use transport::{
    BoxMessageStream, BoxResponseStream, ClassifiableError, DynamicConfigSource, FeatureGate,
    Headers, MethodDescriptor, MethodKind, RequestPayload, StaticDynamicConfig,
    StaticFeatureGate, StreamingInvoker, StreamingRequest, TransportError, UnaryInvoker,
};
pub use unary::UnaryRetryInterceptor;

/// Feature gate name consulted to force pass-through behavior for both interceptors.
pub const KILLSWITCH_GATE: &str = "retry_interceptor_disabled";
