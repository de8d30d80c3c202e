//! # HTTP Transport Binding
//!
//! Wire-level vocabulary shared by both endpoints: the `x-asmv-*` headers
//! carrying channel coordinates, the JSON error body, the set of wire error
//! kinds with their status codes, and the retryability rule for transport
//! failures.
//!
//! Routing contract:
//!
//! - `POST {base}/invoke/{command}` opens a conversation; success is `204`
//!   with the service half-channel coordinates in response headers.
//! - `POST {base}/channel` (peer id in a header) or
//!   `POST {base}/channel/{channelId}` delivers every subsequent message;
//!   success is `204`.
//! - Failures carry an [`ErrorBody`] which the caller decodes back into the
//!   corresponding typed error.

pub mod client;
pub mod server;

use chrono::{DateTime, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::defaults;

/// Request and response header names.
pub mod headers {
    pub const PROTOCOL_VERSION: &str = "x-asmv-protocol-version";
    pub const CLIENT_CHANNEL_ID: &str = "x-asmv-client-channel-id";
    pub const CLIENT_CHANNEL_URL: &str = "x-asmv-client-channel-url";
    pub const CLIENT_CHANNEL_TOKEN: &str = "x-asmv-client-channel-token";
    pub const SERVICE_CHANNEL_ID: &str = "x-asmv-service-channel-id";
    pub const SERVICE_CHANNEL_URL: &str = "x-asmv-service-channel-url";
    pub const SERVICE_CHANNEL_TOKEN: &str = "x-asmv-service-channel-token";
}

/// Nested cause attached to coerced `UnexpectedError` bodies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NestedError {
    pub name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

/// JSON body of every HTTP error response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub http_status: u16,
    pub error_name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_channel_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_channel_id: Option<String>,
    pub date: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nested_error: Option<NestedError>,
}

/// Error kinds an HTTP endpoint can answer with.
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("{message}")]
    InvalidRequest {
        message: String,
        details: Option<Value>,
    },

    #[error("protocol version `{requested}` is not supported")]
    VersionNotSupported { requested: String },

    #[error("missing or malformed authorization")]
    Unauthorized,

    #[error("channel token does not match")]
    Forbidden,

    #[error("message buffer is full")]
    MessageBufferFull,

    #[error("no session for channel `{0}`")]
    SessionNotFound(String),

    #[error("unknown command `{0}`")]
    CommandNotFound(String),

    #[error("unexpected error: {message}")]
    Unexpected {
        message: String,
        nested: Option<NestedError>,
    },
}

impl HttpError {
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
            details: None,
        }
    }

    pub fn status(&self) -> u16 {
        match self {
            HttpError::InvalidRequest { .. } | HttpError::VersionNotSupported { .. } => 400,
            HttpError::Unauthorized => 401,
            HttpError::Forbidden => 403,
            HttpError::SessionNotFound(_) | HttpError::CommandNotFound(_) => 404,
            HttpError::MessageBufferFull => 429,
            HttpError::Unexpected { .. } => 500,
        }
    }

    pub fn error_name(&self) -> &'static str {
        match self {
            HttpError::InvalidRequest { .. } => "InvalidRequest",
            HttpError::VersionNotSupported { .. } => "VersionNotSupported",
            HttpError::Unauthorized => "Unauthorized",
            HttpError::Forbidden => "Forbidden",
            HttpError::MessageBufferFull => "MessageBufferFull",
            HttpError::SessionNotFound(_) => "SessionNotFound",
            HttpError::CommandNotFound(_) => "CommandNotFound",
            HttpError::Unexpected { .. } => "UnexpectedError",
        }
    }

    fn details(&self) -> Option<Value> {
        match self {
            HttpError::InvalidRequest { details, .. } => details.clone(),
            HttpError::VersionNotSupported { requested } => Some(json!({
                "requestedVersion": requested,
                "supportedVersions": defaults::SUPPORTED_VERSIONS,
            })),
            _ => None,
        }
    }

    /// Render the response body, stamping channel ids when known.
    pub fn to_body(
        &self,
        service_channel_id: Option<&str>,
        client_channel_id: Option<&str>,
    ) -> ErrorBody {
        ErrorBody {
            http_status: self.status(),
            error_name: self.error_name().to_string(),
            message: self.to_string(),
            details: self.details(),
            service_channel_id: service_channel_id.map(str::to_string),
            client_channel_id: client_channel_id.map(str::to_string),
            date: Utc::now(),
            nested_error: match self {
                HttpError::Unexpected { nested, .. } => nested.clone(),
                _ => None,
            },
        }
    }
}

/// Failures of a single outbound POST.
#[derive(Debug, Error)]
pub enum TransportError {
    /// No HTTP response at all (connectivity, DNS, timeout). Retryable.
    #[error("no response from peer: {message}")]
    Unreachable { message: String },

    /// The peer answered with an error status. Retryable iff 5xx.
    #[error("peer rejected message with status {status}: {message}")]
    Rejected {
        status: u16,
        message: String,
        body: Option<ErrorBody>,
    },
}

impl TransportError {
    /// Whether a sender should retry after this failure.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Unreachable { .. } => true,
            TransportError::Rejected { status, .. } => *status >= 500,
        }
    }

    /// Wire error name from the decoded body, when one was present.
    pub fn error_name(&self) -> Option<&str> {
        match self {
            TransportError::Rejected {
                body: Some(body), ..
            } => Some(body.error_name.as_str()),
            _ => None,
        }
    }
}

/// Gate a request's protocol version against the supported `1.x` line.
pub fn check_protocol_version(requested: &str) -> Result<Version, HttpError> {
    let version = Version::parse(requested).map_err(|_| HttpError::VersionNotSupported {
        requested: requested.to_string(),
    })?;
    if version.major != 1 {
        return Err(HttpError::VersionNotSupported {
            requested: requested.to_string(),
        });
    }
    Ok(version)
}
