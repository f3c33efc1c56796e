//! The two telemetry channels the engines emit on: free-form debug text and structured,
//! `channel = "transport"` events. Both are best-effort and never raise into the engine.

use std::sync::{Arc, Mutex};

/// Severity of a free-form debug log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Informational, e.g. a retry attempt or a successful recovery.
    Info,
    /// A retry budget was exhausted.
    Warn,
    /// Reserved for telemetry sinks that want to surface hard failures distinctly.
    Error,
}

/// Which interceptor emitted a structured event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterceptorKind {
    /// The [`crate::UnaryRetryInterceptor`].
    Unary,
    /// The [`crate::StreamRetryInterceptor`].
    Stream,
}

impl std::fmt::Display for InterceptorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            InterceptorKind::Unary => "UnaryRetryInterceptor",
            InterceptorKind::Stream => "StreamRetryInterceptor",
        })
    }
}

/// Fields attached to a structured `transport` event.
#[derive(Debug, Clone)]
pub struct RetryEventFields {
    /// Which interceptor this event came from.
    pub interceptor: InterceptorKind,
    /// The RPC method name.
    pub method: String,
    /// The 0-based attempt number, present on `Retry attempt` events.
    pub attempt: Option<u32>,
    /// The scheduled backoff delay, present on `Retry attempt` events.
    pub delay_ms: Option<u64>,
    /// The number of retries performed before success, present on `Retry succeeded` events.
    pub retry_attempt_number: Option<u32>,
    /// The underlying error's code, present on `Retry exhausted` events.
    pub error_code: Option<String>,
}

impl RetryEventFields {
    /// Fields for a `Retry attempt` event.
    pub fn attempt(interceptor: InterceptorKind, method: impl Into<String>, attempt: u32, delay_ms: u64) -> Self {
        Self {
            interceptor,
            method: method.into(),
            attempt: Some(attempt),
            delay_ms: Some(delay_ms),
            retry_attempt_number: None,
            error_code: None,
        }
    }

    /// Fields for a `Retry succeeded` event.
    pub fn succeeded(interceptor: InterceptorKind, method: impl Into<String>, retry_attempt_number: u32) -> Self {
        Self {
            interceptor,
            method: method.into(),
            attempt: None,
            delay_ms: None,
            retry_attempt_number: Some(retry_attempt_number),
            error_code: None,
        }
    }

    /// Fields for a `Retry exhausted` event.
    pub fn exhausted(interceptor: InterceptorKind, method: impl Into<String>, error_code: Option<String>) -> Self {
        Self {
            interceptor,
            method: method.into(),
            attempt: None,
            delay_ms: None,
            retry_attempt_number: None,
            error_code,
        }
    }
}

/// The telemetry sink consulted by both interceptors.
pub trait RetryTelemetry: Send + Sync {
    /// Emits a free-form debug text log line.
    fn debug_log(&self, level: LogLevel, message: String);
    /// Emits a structured `(channel = "transport", name, fields)` event.
    fn structured_event(&self, name: &'static str, fields: RetryEventFields);
}

/// The default sink, delegating to [`tracing`].
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTelemetry;

impl RetryTelemetry for TracingTelemetry {
    fn debug_log(&self, level: LogLevel, message: String) {
        match level {
            LogLevel::Info => tracing::info!("{message}"),
            LogLevel::Warn => tracing::warn!("{message}"),
            LogLevel::Error => tracing::error!("{message}"),
        }
    }

    fn structured_event(&self, name: &'static str, fields: RetryEventFields) {
        tracing::info!(
            channel = "transport",
            name,
            interceptor = %fields.interceptor,
            method = %fields.method,
            attempt = fields.attempt,
            delay_ms = fields.delay_ms,
            retry_attempt_number = fields.retry_attempt_number,
            error_code = fields.error_code.as_deref(),
            "transport_event",
        );
    }
}

/// An in-memory recording sink for tests, mirroring the host application's own test doubles.
#[derive(Debug, Default, Clone)]
pub struct RecordingTelemetry {
    logs: Arc<Mutex<Vec<(LogLevel, String)>>>,
    events: Arc<Mutex<Vec<(&'static str, RetryEventFields)>>>,
}

impl RecordingTelemetry {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all debug log lines recorded so far, oldest first.
    pub fn logs(&self) -> Vec<(LogLevel, String)> {
        self.logs.lock().expect("telemetry recorder lock poisoned").clone()
    }

    /// Returns all structured events recorded so far, oldest first.
    pub fn events(&self) -> Vec<(&'static str, RetryEventFields)> {
        self.events.lock().expect("telemetry recorder lock poisoned").clone()
    }
}

impl RetryTelemetry for RecordingTelemetry {
    fn debug_log(&self, level: LogLevel, message: String) {
        self.logs.lock().expect("telemetry recorder lock poisoned").push((level, message));
    }

    fn structured_event(&self, name: &'static str, fields: RetryEventFields) {
        self.events.lock().expect("telemetry recorder lock poisoned").push((name, fields));
    }
}
