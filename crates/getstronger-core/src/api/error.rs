use std::fmt;

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use prost::Message;
use serde::Deserialize;
use thiserror::Error;

/// Fully qualified name of the domain error detail attached by the server.
const DOMAIN_DETAIL_TYPE: &str = "api.v1.ErrorDetail";

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

/// Machine-readable status code carried by every remote error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Code {
    Canceled,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
    #[serde(other)]
    Unknown,
}

impl Code {
    pub fn as_str(&self) -> &'static str {
        match self {
            Code::Canceled => "canceled",
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
            Code::Unknown => "unknown",
        }
    }

    /// Code inferred from the HTTP status when the body carries no error JSON.
    pub fn from_http_status(status: u16) -> Self {
        match status {
            400 => Code::Internal,
            401 => Code::Unauthenticated,
            403 => Code::PermissionDenied,
            404 => Code::Unimplemented,
            408 => Code::DeadlineExceeded,
            429 | 502 | 503 | 504 => Code::Unavailable,
            _ => Code::Unknown,
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Domain-specific error reported by the server in an error detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainError {
    EmailNotVerified,
    PasswordsDoNotMatch,
    Other(i32),
}

impl DomainError {
    fn from_number(value: i32) -> Self {
        match value {
            1 => DomainError::EmailNotVerified,
            2 => DomainError::PasswordsDoNotMatch,
            other => DomainError::Other(other),
        }
    }

    /// Fixed human-readable message shown instead of the raw code.
    pub fn user_message(&self) -> Option<&'static str> {
        match self {
            DomainError::EmailNotVerified => Some("You must verify your email before logging in"),
            DomainError::PasswordsDoNotMatch => Some("Passwords do not match"),
            DomainError::Other(_) => None,
        }
    }
}

/// Wire form of `api.v1.ErrorDetail`.
#[derive(Clone, PartialEq, Message)]
struct ErrorDetailProto {
    #[prost(int32, tag = "1")]
    error: i32,
}

/// Structured detail payload attached to a remote error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorDetail {
    Domain(DomainError),
    Opaque { type_name: String, value: Vec<u8> },
}

impl ErrorDetail {
    /// Decode a detail from its type name and base64 protobuf value.
    pub fn decode(type_name: &str, value: &str) -> Self {
        let bytes = STANDARD_NO_PAD
            .decode(value.trim_end_matches('='))
            .unwrap_or_default();

        if type_name == DOMAIN_DETAIL_TYPE {
            if let Ok(detail) = ErrorDetailProto::decode(bytes.as_slice()) {
                return ErrorDetail::Domain(DomainError::from_number(detail.error));
            }
        }

        ErrorDetail::Opaque {
            type_name: type_name.to_string(),
            value: bytes,
        }
    }
}

/// Failure reported by the remote service.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{code}: {message}")]
pub struct RemoteError {
    pub code: Code,
    pub message: String,
    pub details: Vec<ErrorDetail>,
}

impl RemoteError {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: Vec::new(),
        }
    }

    pub fn with_detail(mut self, detail: ErrorDetail) -> Self {
        self.details.push(detail);
        self
    }

    /// Domain errors found in the details, in the order the server sent them.
    pub fn domain_errors(&self) -> impl Iterator<Item = DomainError> + '_ {
        self.details.iter().filter_map(|detail| match detail {
            ErrorDetail::Domain(domain) => Some(*domain),
            ErrorDetail::Opaque { .. } => None,
        })
    }

    /// Build a remote error from a failed HTTP response.
    pub fn from_status(status: u16, body: &str) -> Self {
        match serde_json::from_str::<WireError>(body) {
            Ok(wire) => wire.into_remote(Code::from_http_status(status)),
            Err(_) => RemoteError::new(Code::from_http_status(status), truncate_body(body)),
        }
    }
}

/// JSON error body of the Connect protocol.
#[derive(Debug, Deserialize)]
pub(crate) struct WireError {
    #[serde(default)]
    code: Option<Code>,
    #[serde(default)]
    message: String,
    #[serde(default)]
    details: Vec<WireDetail>,
}

#[derive(Debug, Deserialize)]
struct WireDetail {
    #[serde(rename = "type")]
    type_name: String,
    #[serde(default)]
    value: String,
}

impl WireError {
    pub(crate) fn into_remote(self, fallback: Code) -> RemoteError {
        RemoteError {
            code: self.code.unwrap_or(fallback),
            message: self.message,
            details: self
                .details
                .iter()
                .map(|detail| ErrorDetail::decode(&detail.type_name, &detail.value))
                .collect(),
        }
    }
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    Remote(#[from] RemoteError),

    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Failed to decode message: {0}")]
    Decode(#[from] serde_json::Error),
}

impl ApiError {
    pub fn remote(&self) -> Option<&RemoteError> {
        match self {
            ApiError::Remote(remote) => Some(remote),
            _ => None,
        }
    }

    pub fn code(&self) -> Option<Code> {
        self.remote().map(|remote| remote.code)
    }

    pub fn is_unauthenticated(&self) -> bool {
        self.code() == Some(Code::Unauthenticated)
    }
}

/// Truncate a response body to avoid logging excessive data
fn truncate_body(body: &str) -> String {
    if body.len() <= MAX_ERROR_BODY_LENGTH {
        body.to_string()
    } else {
        let mut end = MAX_ERROR_BODY_LENGTH;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
    }
}
