//! # ASMV Protocol
//!
//! ASMV (Asynchronous Service Interaction Messaging OVerlay) is a
//! bidirectional application-layer protocol that lets an *agent* invoke
//! long-running *commands* on a remote *service*. Commands can make
//! mid-execution upcalls (request more inputs, user confirmation, payment
//! authorization) and can suspend and later resume while preserving state.
//!
//! The crate provides both endpoints:
//!
//! - the service side: [`service::ServiceContext`] driven by an
//!   [`runner::ExecutionRunner`], registered commands in a
//!   [`service_def::ServiceDefinition`], served by
//!   [`http::server::ServiceEndpoint`];
//! - the agent side: [`client::ClientContext`] opened through
//!   [`http::server::AgentEndpoint`].
//!
//! Both sides exchange JSON [`message::Message`]s over paired HTTP
//! half-channels addressed by URL, opaque channel id and bearer token.

pub mod channel;
pub mod client;
pub mod command;
pub mod error;
pub mod http;
pub mod manifest;
pub mod message;
pub mod observer;
pub mod queue;
pub mod runner;
pub mod schema;
pub mod service;
pub mod service_def;
pub mod store;

pub use channel::{Channel, ChannelSide, ChannelTarget, MessageSender};
pub use client::{ClientContext, ClientStatus, MessageStream, RetryOptions};
pub use command::{CommandDefinition, ConfigProfileDefinition, IoTypeDescriptor, ProfileScope};
pub use error::Error;
pub use http::server::{AgentEndpoint, InvokeParams, ServiceEndpoint};
pub use manifest::ServiceManifest;
pub use message::{InputEntry, Message, ReturnItem, UserConfirmation};
pub use observer::{ContextObserver, NoopObserver};
pub use queue::AsyncQueue;
pub use runner::{CommandHandler, ContextManager, ExecutionRunner, FnHandler};
pub use service::{
    ContextStatus, PaymentAuthorization, PaymentRequest, SerializedContext, ServiceContext,
    ServiceContextOptions,
};
pub use service_def::ServiceDefinition;
pub use store::{ContextStore, MemoryContextStore, StoredContext};

/// The current version of the ASMV crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default protocol parameters
pub mod defaults {
    use std::time::Duration;

    /// Protocol version stamped on outgoing requests
    pub const PROTOCOL_VERSION: &str = "1.0.0";

    /// Protocol version lines this implementation accepts
    pub const SUPPORTED_VERSIONS: &[&str] = &["1.x"];

    /// Default number of attempts for one outbound send
    pub const SEND_RETRIES: u32 = 3;

    /// Base delay before the first retry
    pub const SEND_BASE_DELAY: Duration = Duration::from_millis(500);

    /// Backoff multiplier applied per attempt
    pub const SEND_BACKOFF_MULTIPLIER: f64 = 1.5;

    /// Upper bound of the random jitter added to each retry delay
    pub const SEND_MAX_JITTER: Duration = Duration::from_millis(100);

    /// Default budget for one upcall wait
    pub const UPCALL_TIMEOUT: Duration = Duration::from_secs(300);

    /// Capacity bound of each per-context incoming queue
    pub const MESSAGE_BUFFER_CAPACITY: usize = 256;
}
