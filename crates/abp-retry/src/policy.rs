//! Error classification: the closed never-retry set plus the dynamic retry-rule table.

use serde::{Deserialize, Serialize};

/// A Connect/gRPC-style status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Code {
    /// The operation was cancelled, typically by the caller.
    Canceled,
    /// Unknown error.
    Unknown,
    /// The client specified an invalid argument.
    InvalidArgument,
    /// The deadline expired before the operation could complete.
    DeadlineExceeded,
    /// Some requested entity was not found.
    NotFound,
    /// The entity a client attempted to create already exists.
    AlreadyExists,
    /// The caller does not have permission to execute the operation.
    PermissionDenied,
    /// Some resource has been exhausted.
    ResourceExhausted,
    /// The operation was rejected because the system is not in a state required for it.
    FailedPrecondition,
    /// The operation was aborted.
    Aborted,
    /// The operation was attempted past the valid range.
    OutOfRange,
    /// The operation is not implemented or not supported/enabled.
    Unimplemented,
    /// Internal error.
    Internal,
    /// The service is currently unavailable.
    Unavailable,
    /// Unrecoverable data loss or corruption.
    DataLoss,
    /// The request does not have valid authentication credentials.
    Unauthenticated,
}

impl Code {
    /// The canonical wire name for this code, matching the dynamic-config rule encoding.
    pub fn as_str(&self) -> &'static str {
        match self {
            Code::Canceled => "canceled",
            Code::Unknown => "unknown",
            Code::InvalidArgument => "invalid_argument",
            Code::DeadlineExceeded => "deadline_exceeded",
            Code::NotFound => "not_found",
            Code::AlreadyExists => "already_exists",
            Code::PermissionDenied => "permission_denied",
            Code::ResourceExhausted => "resource_exhausted",
            Code::FailedPrecondition => "failed_precondition",
            Code::Aborted => "aborted",
            Code::OutOfRange => "out_of_range",
            Code::Unimplemented => "unimplemented",
            Code::Internal => "internal",
            Code::Unavailable => "unavailable",
            Code::DataLoss => "data_loss",
            Code::Unauthenticated => "unauthenticated",
        }
    }
}

impl std::fmt::Display for Code {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Codes that are never retryable, regardless of dynamic configuration. These are the
/// client-error codes documented by the transport as terminal: retrying them cannot change
/// the outcome because the request itself, not the server's transient state, is at fault.
pub const NEVER_RETRYABLE: &[Code] = &[
    Code::Canceled,
    Code::InvalidArgument,
    Code::NotFound,
    Code::AlreadyExists,
    Code::PermissionDenied,
    Code::Unauthenticated,
    Code::FailedPrecondition,
    Code::Unimplemented,
    Code::OutOfRange,
];

/// A single entry in the dynamic retry-rule table.
///
/// A rule matches an error when every present field matches: `code` always, `error_message`
/// (if present) as a case-sensitive substring of the error's message, `method` (if present) as
/// an exact match of the method name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryRule {
    /// The status code this rule applies to.
    pub code: Code,
    /// Optional case-sensitive substring filter on the error message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Optional exact match on the method name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
}

impl RetryRule {
    /// A rule matching every error of `code`, regardless of message or method.
    pub fn any(code: Code) -> Self {
        Self { code, error_message: None, method: None }
    }

    fn matches(&self, code: Code, message: &str, method: &str) -> bool {
        self.code == code
            && self.error_message.as_deref().is_none_or(|m| message.contains(m))
            && self.method.as_deref().is_none_or(|m| m == method)
    }
}

/// The dynamic-config oracle's retry-rule table, `{ retriableErrors: [...] }`.
///
/// An empty rule list disables retries entirely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DynamicRetryConfig {
    /// The ordered list of retryable-error rules.
    pub retriable_errors: Vec<RetryRule>,
}

impl Default for DynamicRetryConfig {
    /// The conventional retryable set used when the oracle has no override.
    fn default() -> Self {
        Self {
            retriable_errors: vec![
                RetryRule::any(Code::Unavailable),
                RetryRule::any(Code::Internal),
                RetryRule::any(Code::DeadlineExceeded),
            ],
        }
    }
}

/// Decides whether an error should be retried.
///
/// `code` is `None` for a thrown value that is not an RPC-style structured error; such errors
/// are never retryable. Codes in [`NEVER_RETRYABLE`] are rejected before the rule table is
/// consulted. Otherwise the rule list is scanned in order and the first match wins.
pub fn should_retry_on_error(
    code: Option<Code>,
    message: &str,
    method: &str,
    dynamic_config: &DynamicRetryConfig,
) -> bool {
    let Some(code) = code else {
        return false;
    };
    if NEVER_RETRYABLE.contains(&code) {
        return false;
    }
    dynamic_config.retriable_errors.iter().any(|rule| rule.matches(code, message, method))
}
