//! The opaque transport surface the interceptors wrap: method metadata, headers, and the
//! invoker traits the host application implements over its own Connect-style client.

use std::collections::HashMap;
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::policy::{Code, DynamicRetryConfig};

/// Per-call request headers.
pub type Headers = HashMap<String, String>;

/// A boxed stream of outbound request messages.
pub type BoxMessageStream<T> = Pin<Box<dyn Stream<Item = T> + Send>>;

/// A boxed stream of inbound response messages, each of which may fail.
pub type BoxResponseStream<Out, E> = Pin<Box<dyn Stream<Item = Result<Out, E>> + Send>>;

/// The RPC method kind, as inspected (never interpreted) by the retry engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodKind {
    /// A single request, single response call.
    Unary,
    /// A stream of requests, single response call.
    ClientStreaming,
    /// A single request, stream of responses call.
    ServerStreaming,
    /// A stream of requests, stream of responses call.
    BidiStreaming,
}

/// The opaque method handle consulted by the engines: only its kind and name are inspected.
#[derive(Debug, Clone)]
pub struct MethodDescriptor {
    /// The fully-qualified method name, e.g. `"acme.v1.Widgets/List"`.
    pub name: String,
    /// The method's streaming shape.
    pub kind: MethodKind,
}

/// A structured, classifiable transport error: carries a status code and a free-form message.
pub trait ClassifiableError {
    /// The RPC status code, or `None` if this is not an RPC-style structured error.
    fn transport_code(&self) -> Option<Code>;
    /// The free-form error message consulted by the dynamic rule table.
    fn error_message(&self) -> String;
}

/// A concrete structured transport error, for host applications that do not already have one.
#[derive(Debug, thiserror::Error)]
#[error("{code}: {message}")]
pub struct TransportError {
    /// The RPC status code.
    pub code: Code,
    /// The free-form error message.
    pub message: String,
    /// The underlying cause, if any.
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl TransportError {
    /// Builds a new structured transport error with no underlying cause.
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), source: None }
    }
}

impl ClassifiableError for TransportError {
    fn transport_code(&self) -> Option<Code> {
        Some(self.code)
    }

    fn error_message(&self) -> String {
        self.message.clone()
    }
}

/// Wraps a unary call's underlying invocation: `next(req) -> response`.
#[async_trait]
pub trait UnaryInvoker<Req, Res, E>: Send + Sync
where
    Req: Send,
{
    /// Invokes the transport exactly once for this attempt.
    async fn invoke(&self, method: &MethodDescriptor, headers: &Headers, req: Req) -> Result<Res, E>;
}

/// The request-message payload for a streaming call.
///
/// Bidirectional-streaming requests carry a caller-owned message stream, which the streaming
/// engine wraps in a [`crate::Rewindable`] to replay across retries. Server-streaming requests
/// carry a single message that is reused, identically, on every attempt.
pub enum RequestPayload<In> {
    /// A single request message (server-streaming), reused verbatim on every attempt.
    Single(In),
    /// A stream of request messages (bidirectional streaming).
    Stream(BoxMessageStream<In>),
}

/// A streaming call's request: the payload plus whatever else the host's transport needs.
pub struct StreamingRequest<In> {
    /// The request message payload.
    pub message: RequestPayload<In>,
}

/// Wraps a streaming call's underlying invocation: `next(req) -> response message stream`.
#[async_trait]
pub trait StreamingInvoker<In, Out, E>: Send + Sync
where
    In: Send + 'static,
{
    /// Invokes the transport exactly once for this attempt, returning the response stream.
    async fn invoke(
        &self,
        method: &MethodDescriptor,
        headers: &Headers,
        req: StreamingRequest<In>,
    ) -> Result<BoxResponseStream<Out, E>, E>;
}

/// A read-only boolean feature gate, consulted by the fixed name [`crate::KILLSWITCH_GATE`].
#[async_trait]
pub trait FeatureGate: Send + Sync {
    /// Returns whether the named feature is enabled.
    async fn is_enabled(&self, name: &str) -> bool;
}

/// A feature gate with a fixed answer, useful for tests and simple static deployments.
#[derive(Debug, Clone, Copy)]
pub struct StaticFeatureGate(pub bool);

#[async_trait]
impl FeatureGate for StaticFeatureGate {
    async fn is_enabled(&self, _name: &str) -> bool {
        self.0
    }
}

/// A read-only source of the dynamic retry-rule table.
#[async_trait]
pub trait DynamicConfigSource: Send + Sync {
    /// Returns the current retry-rule table.
    async fn retry_rules(&self) -> DynamicRetryConfig;
}

/// A dynamic-config source with a fixed answer, useful for tests and simple static deployments.
#[derive(Debug, Clone)]
pub struct StaticDynamicConfig(pub DynamicRetryConfig);

impl Default for StaticDynamicConfig {
    fn default() -> Self {
        Self(DynamicRetryConfig::default())
    }
}

#[async_trait]
impl DynamicConfigSource for StaticDynamicConfig {
    async fn retry_rules(&self) -> DynamicRetryConfig {
        self.0.clone()
    }
}
