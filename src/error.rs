//! # Protocol Error Taxonomy
//!
//! Every failure the core can produce is a variant of [`Error`], grouped the
//! way the protocol treats them:
//!
//! - **Message validation** errors reject an inbound message (returned to the
//!   peer as an `InvalidRequest` transport error) or fail a `return_data`
//!   call locally.
//! - **Upcall** errors (timeouts, payment rejection) are raised to the
//!   command handler, which decides whether to retry or fail the command.
//! - **Transport** errors surface HTTP-layer failures after retry handling.
//! - **Contextual** errors flag API misuse (sending on a context that is not
//!   active, touching a disposed context).
//!
//! Each variant carries a stable wire name (see [`Error::name`]) used in
//! HTTP error bodies and nested error details.

use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

use crate::http::TransportError;
use crate::queue::QueueError;
use crate::schema::SchemaViolation;

/// A nested, serializable view of a validation failure.
///
/// Collected under `childErrors` when several independent problems are
/// reported at once (e.g. invoke-time config profile and input validation).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChildError {
    pub name: String,
    pub message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub violations: Vec<SchemaViolation>,
}

/// Errors produced by the protocol core.
#[derive(Debug, Error)]
pub enum Error {
    // Message validation
    #[error("invalid message: {message}")]
    InvalidMessage {
        message: String,
        child_errors: Vec<ChildError>,
    },

    #[error("required config profile `{profile}` was not provided")]
    MissingConfigProfile { profile: String },

    #[error("config profile `{profile}` is not known to this service")]
    UnknownConfigProfile { profile: String },

    #[error("config profile `{profile}` failed schema validation")]
    InvalidConfigProfile {
        profile: String,
        violations: Vec<SchemaViolation>,
    },

    #[error("unknown input type `{input_type}`")]
    UnknownInputType { input_type: String },

    #[error("input `{input_type}` failed schema validation")]
    InvalidInput {
        input_type: String,
        violations: Vec<SchemaViolation>,
    },

    #[error("unknown output type `{output_type}`")]
    UnknownOutputType { output_type: String },

    #[error("output `{output_type}` failed schema validation")]
    InvalidOutput {
        output_type: String,
        violations: Vec<SchemaViolation>,
    },

    #[error("unexpected message: {reason}")]
    UnexpectedMessage { reason: String },

    // Upcalls
    #[error("timed out waiting for input `{input_type}`")]
    InputTimeout { input_type: String },

    #[error("timed out waiting for user confirmation")]
    ConfirmationTimeout,

    #[error("timed out waiting for payment authorization")]
    PaymentTimeout,

    #[error("payment was rejected{}", .reason.as_deref().map(|r| format!(": {r}")).unwrap_or_default())]
    PaymentRejected { reason: Option<String> },

    // Lifecycle / contextual
    #[error("operation was cancelled")]
    Cancelled,

    #[error("context has not been invoked")]
    NotInvoked,

    #[error("context is not active")]
    NotActive,

    #[error("context has already been disposed")]
    AlreadyDisposed,

    #[error("message buffer is full")]
    MessageBufferFull,

    #[error("command does not require config profile `{profile}`")]
    ProfileNotRequired { profile: String },

    // Definition building
    #[error("duplicate type name `{name}`")]
    DuplicateTypeName { name: String },

    #[error("duplicate command `{name}`")]
    DuplicateCommand { name: String },

    #[error("invalid definition: {0}")]
    Definition(String),

    // Transport
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("sending message on channel `{channel}` failed after {retries} attempt(s)")]
    SendMessageFailed {
        channel: String,
        retries: u32,
        #[source]
        cause: Box<TransportError>,
    },

    // Persistence / encoding
    #[error("serialization failed")]
    Serialization(#[from] serde_json::Error),

    #[error("context store failure: {0}")]
    Store(String),
}

impl From<QueueError> for Error {
    fn from(error: QueueError) -> Self {
        match error {
            QueueError::Full => Error::MessageBufferFull,
            QueueError::Closed => Error::NotActive,
            QueueError::Cancelled => Error::Cancelled,
        }
    }
}

impl Error {
    /// Stable wire name for this error kind.
    pub fn name(&self) -> &'static str {
        match self {
            Error::InvalidMessage { .. } => "InvalidMessage",
            Error::MissingConfigProfile { .. } => "MissingConfigProfile",
            Error::UnknownConfigProfile { .. } => "UnknownConfigProfile",
            Error::InvalidConfigProfile { .. } => "InvalidConfigProfile",
            Error::UnknownInputType { .. } => "UnknownInputType",
            Error::InvalidInput { .. } => "InvalidInput",
            Error::UnknownOutputType { .. } => "UnknownOutputType",
            Error::InvalidOutput { .. } => "InvalidOutput",
            Error::UnexpectedMessage { .. } => "UnexpectedMessage",
            Error::InputTimeout { .. } => "InputTimeout",
            Error::ConfirmationTimeout => "ConfirmationTimeout",
            Error::PaymentTimeout => "PaymentTimeout",
            Error::PaymentRejected { .. } => "PaymentRejected",
            Error::Cancelled => "Cancelled",
            Error::NotInvoked => "NotInvoked",
            Error::NotActive => "NotActive",
            Error::AlreadyDisposed => "AlreadyDisposed",
            Error::MessageBufferFull => "MessageBufferFull",
            Error::ProfileNotRequired { .. } => "ProfileNotRequired",
            Error::DuplicateTypeName { .. } => "DuplicateTypeName",
            Error::DuplicateCommand { .. } => "DuplicateCommand",
            Error::Definition(_) => "InvalidDefinition",
            Error::Transport(_) => "MessageTransport",
            Error::SendMessageFailed { .. } => "SendMessageFailed",
            Error::Serialization(_) => "Serialization",
            Error::Store(_) => "Store",
        }
    }

    /// Convert into the nested representation used in `childErrors` lists.
    pub fn to_child(&self) -> ChildError {
        let violations = match self {
            Error::InvalidConfigProfile { violations, .. }
            | Error::InvalidInput { violations, .. }
            | Error::InvalidOutput { violations, .. } => violations.clone(),
            _ => Vec::new(),
        };
        ChildError {
            name: self.name().to_string(),
            message: self.to_string(),
            violations,
        }
    }

    /// Structured detail payload for HTTP error bodies, when one exists.
    pub fn details(&self) -> Option<Value> {
        match self {
            Error::InvalidMessage { child_errors, .. } if !child_errors.is_empty() => {
                Some(json!({ "childErrors": child_errors }))
            }
            Error::InvalidConfigProfile { violations, .. }
            | Error::InvalidInput { violations, .. }
            | Error::InvalidOutput { violations, .. }
                if !violations.is_empty() =>
            {
                Some(json!({ "violations": violations }))
            }
            _ => None,
        }
    }

    /// Build an `InvalidMessage` error from collected child failures.
    pub fn invalid_message(message: impl Into<String>, children: Vec<Error>) -> Self {
        Error::InvalidMessage {
            message: message.into(),
            child_errors: children.iter().map(Error::to_child).collect(),
        }
    }
}
