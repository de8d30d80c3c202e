//! Inbound HTTP: the axum routers hosted by each endpoint.
//!
//! The service side exposes the manifest, the invoke handshake and its
//! channel endpoint; the agent side exposes the symmetric client channel
//! endpoint. Both accept the headers-only (`POST /channel`) and path-based
//! (`POST /channel/{channelId}`) routing schemas.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use dashmap::DashMap;
use http::{HeaderMap, StatusCode};
use serde_json::Value;
use tracing::{debug, warn};

use crate::channel::{
    generate_channel_id, generate_channel_token, Channel, MessageSender,
};
use crate::client::{ClientContext, ClientStatus, RetryOptions};
use crate::defaults;
use crate::error::Error;
use crate::http::client::{HttpMessageSender, ServiceClient};
use crate::http::{check_protocol_version, headers, HttpError, NestedError};
use crate::message::{decode_wire_message, InputEntry, Message, UserConfirmation};
use crate::runner::{ContextManager, ExecutionRunner};
use crate::service::{ServiceContext, ServiceContextOptions};
use crate::service_def::ServiceDefinition;
use crate::store::ContextStore;

/// Map a dispatch failure onto its wire error kind.
fn http_error_from(error: Error) -> HttpError {
    match &error {
        Error::MessageBufferFull => HttpError::MessageBufferFull,
        Error::InvalidMessage { .. }
        | Error::MissingConfigProfile { .. }
        | Error::UnknownConfigProfile { .. }
        | Error::InvalidConfigProfile { .. }
        | Error::UnknownInputType { .. }
        | Error::InvalidInput { .. }
        | Error::UnknownOutputType { .. }
        | Error::InvalidOutput { .. }
        | Error::UnexpectedMessage { .. }
        | Error::NotActive
        | Error::NotInvoked => HttpError::InvalidRequest {
            message: error.to_string(),
            details: error.details(),
        },
        _ => HttpError::Unexpected {
            message: error.to_string(),
            nested: Some(NestedError {
                name: error.name().to_string(),
                message: error.to_string(),
                stack: None,
            }),
        },
    }
}

fn error_response(
    error: &HttpError,
    service_channel_id: Option<&str>,
    client_channel_id: Option<&str>,
) -> Response {
    let status =
        StatusCode::from_u16(error.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = error.to_body(service_channel_id, client_channel_id);
    (status, Json(body)).into_response()
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

fn require_header(headers: &HeaderMap, name: &str) -> Result<String, HttpError> {
    header_value(headers, name)
        .ok_or_else(|| HttpError::invalid_request(format!("missing `{name}` header")))
}

fn bearer_token(headers: &HeaderMap) -> Result<String, HttpError> {
    let value = header_value(headers, "authorization").ok_or(HttpError::Unauthorized)?;
    value
        .strip_prefix("Bearer ")
        .map(str::to_string)
        .ok_or(HttpError::Unauthorized)
}

fn checked_version(headers: &HeaderMap) -> Result<String, HttpError> {
    let requested = require_header(headers, headers::PROTOCOL_VERSION)?;
    check_protocol_version(&requested)?;
    Ok(requested)
}

fn parse_body(body: &Bytes) -> Result<Message, HttpError> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| HttpError::invalid_request(format!("request body is not JSON: {e}")))?;
    decode_wire_message(&value).map_err(http_error_from)
}

// ---------------------------------------------------------------------------
// Service side
// ---------------------------------------------------------------------------

/// The serving half of one ASMV service: definition, live contexts, store
/// and runner wired together behind an axum router.
pub struct ServiceEndpoint {
    definition: Arc<ServiceDefinition>,
    base_url: String,
    manager: Arc<ContextManager>,
    store: Arc<dyn ContextStore>,
    sender: Arc<dyn MessageSender>,
    runner: ExecutionRunner,
    /// Serializes store restores: concurrent deliveries to one suspended
    /// channel must share a single restored context.
    restore_lock: tokio::sync::Mutex<()>,
}

impl ServiceEndpoint {
    /// Wire an endpoint together. `base_url` is the public URL this
    /// endpoint is reachable at (used for channel coordinates and the
    /// manifest).
    pub fn new(
        definition: ServiceDefinition,
        base_url: &str,
        store: Arc<dyn ContextStore>,
    ) -> Arc<Self> {
        Self::with_sender(definition, base_url, store, Arc::new(HttpMessageSender::new()))
    }

    /// Same as [`ServiceEndpoint::new`] with a custom outbound sender.
    pub fn with_sender(
        definition: ServiceDefinition,
        base_url: &str,
        store: Arc<dyn ContextStore>,
        sender: Arc<dyn MessageSender>,
    ) -> Arc<Self> {
        let manager = Arc::new(ContextManager::new());
        let runner = ExecutionRunner::new(store.clone(), manager.clone());
        Arc::new(Self {
            definition: Arc::new(definition),
            base_url: base_url.trim_end_matches('/').to_string(),
            manager,
            store,
            sender,
            runner,
            restore_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn definition(&self) -> &Arc<ServiceDefinition> {
        &self.definition
    }

    pub fn manager(&self) -> &Arc<ContextManager> {
        &self.manager
    }

    fn channel_url(&self) -> String {
        format!("{}/channel", self.base_url)
    }

    /// Router exposing the manifest, invoke and channel endpoints.
    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/manifest.json", get(service_manifest))
            .route("/invoke/:command", post(service_invoke))
            .route("/channel", post(service_channel_by_header))
            .route("/channel/:channel_id", post(service_channel_by_path))
            .with_state(self.clone())
    }

    async fn handle_invoke(
        &self,
        command_name: &str,
        headers: &HeaderMap,
        body: &Bytes,
    ) -> Result<Channel, HttpError> {
        let version = checked_version(headers)?;
        let client_channel_id = require_header(headers, headers::CLIENT_CHANNEL_ID)?;
        let client_channel_url = require_header(headers, headers::CLIENT_CHANNEL_URL)?;
        let client_channel_token = require_header(headers, headers::CLIENT_CHANNEL_TOKEN)?;

        let command = self
            .definition
            .command(command_name)
            .ok_or_else(|| HttpError::CommandNotFound(command_name.to_string()))?;

        let message = parse_body(body)?;
        if !matches!(message, Message::Invoke { .. }) {
            return Err(HttpError::invalid_request(
                "the invoke endpoint accepts `invoke` messages only",
            ));
        }

        let channel = Channel {
            protocol_version: version,
            command_name: Some(command_name.to_string()),
            client_channel_id,
            client_channel_url,
            client_channel_token,
            service_channel_id: Some(generate_channel_id()),
            service_channel_url: Some(self.channel_url()),
            service_channel_token: Some(generate_channel_token()),
        };

        let context = Arc::new(ServiceContext::new(
            self.sender.clone(),
            self.definition.context_options(),
            command.definition.clone(),
            channel.clone(),
        ));
        // A rejected invoke leaves no trace: the context is registered only
        // after dispatch accepted it.
        context
            .handle_incoming_message(message)
            .await
            .map_err(http_error_from)?;

        let key = channel.service_channel_id.clone().unwrap_or_default();
        self.manager.insert(&key, context.clone());
        self.runner.spawn(context, command.handler.clone());
        debug!(command = command_name, channel = %key, "invocation accepted");
        Ok(channel)
    }

    async fn handle_channel_message(
        &self,
        channel_id: &str,
        headers: &HeaderMap,
        body: &Bytes,
    ) -> Result<(), HttpError> {
        checked_version(headers)?;
        let token = bearer_token(headers)?;

        let message = parse_body(body)?;
        if matches!(message, Message::Invoke { .. }) {
            return Err(HttpError::invalid_request(
                "`invoke` is not valid on an open channel",
            ));
        }

        let context = self.lookup_or_restore(channel_id, &token).await?;
        context
            .handle_incoming_message(message)
            .await
            .map_err(http_error_from)
    }

    fn authorize(
        context: &Arc<ServiceContext>,
        token: &str,
    ) -> Result<(), HttpError> {
        if context.channel().service_channel_token.as_deref() != Some(token) {
            return Err(HttpError::Forbidden);
        }
        Ok(())
    }

    /// Find the live context for `channel_id`, restoring it from the store
    /// when none exists.
    ///
    /// Restores are serialized and re-check the manager after acquiring the
    /// lock, so only one caller performs the restore and every concurrent
    /// delivery reuses that context (one live context per service channel
    /// id).
    async fn lookup_or_restore(
        &self,
        channel_id: &str,
        token: &str,
    ) -> Result<Arc<ServiceContext>, HttpError> {
        if let Some(context) = self.manager.get(channel_id) {
            Self::authorize(&context, token)?;
            return Ok(context);
        }

        let _restoring = self.restore_lock.lock().await;
        if let Some(context) = self.manager.get(channel_id) {
            Self::authorize(&context, token)?;
            return Ok(context);
        }
        self.restore_context(channel_id, token).await
    }

    /// Bring a suspended context back to life for `channel_id` and re-enter
    /// its handler. Callers must hold the restore lock.
    async fn restore_context(
        &self,
        channel_id: &str,
        token: &str,
    ) -> Result<Arc<ServiceContext>, HttpError> {
        let record = self
            .store
            .get(channel_id)
            .await
            .map_err(|e| HttpError::Unexpected {
                message: e.to_string(),
                nested: None,
            })?
            .ok_or_else(|| HttpError::SessionNotFound(channel_id.to_string()))?;

        if record.channel.service_channel_token.as_deref() != Some(token) {
            return Err(HttpError::Forbidden);
        }
        let command_name = record.channel.command_name.clone().unwrap_or_default();
        let command = self
            .definition
            .command(&command_name)
            .ok_or_else(|| HttpError::CommandNotFound(command_name.clone()))?;

        let context = Arc::new(ServiceContext::restore(
            self.sender.clone(),
            self.definition.context_options(),
            command.definition.clone(),
            record.channel,
            record.state,
        ));
        self.manager.insert(channel_id, context.clone());
        self.runner.spawn(context.clone(), command.handler.clone());
        debug!(channel = %channel_id, command = %command_name, "context restored");
        Ok(context)
    }
}

async fn service_manifest(State(endpoint): State<Arc<ServiceEndpoint>>) -> Response {
    Json(endpoint.definition.manifest(&endpoint.base_url)).into_response()
}

async fn service_invoke(
    State(endpoint): State<Arc<ServiceEndpoint>>,
    Path(command_name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let client_channel_id = header_value(&headers, headers::CLIENT_CHANNEL_ID);
    match endpoint.handle_invoke(&command_name, &headers, &body).await {
        Ok(channel) => {
            let mut response = StatusCode::NO_CONTENT.into_response();
            let insert = |response: &mut Response, name: &'static str, value: Option<String>| {
                if let Some(value) = value.and_then(|v| v.parse().ok()) {
                    response.headers_mut().insert(name, value);
                }
            };
            insert(
                &mut response,
                headers::SERVICE_CHANNEL_ID,
                channel.service_channel_id,
            );
            insert(
                &mut response,
                headers::SERVICE_CHANNEL_URL,
                channel.service_channel_url,
            );
            insert(
                &mut response,
                headers::SERVICE_CHANNEL_TOKEN,
                channel.service_channel_token,
            );
            response
        }
        Err(error) => {
            warn!(command = %command_name, %error, "invoke rejected");
            error_response(&error, None, client_channel_id.as_deref())
        }
    }
}

async fn service_channel_by_header(
    State(endpoint): State<Arc<ServiceEndpoint>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let channel_id = match require_header(&headers, headers::SERVICE_CHANNEL_ID) {
        Ok(id) => id,
        Err(error) => return error_response(&error, None, None),
    };
    service_channel_dispatch(endpoint, channel_id, headers, body).await
}

async fn service_channel_by_path(
    State(endpoint): State<Arc<ServiceEndpoint>>,
    Path(channel_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    service_channel_dispatch(endpoint, channel_id, headers, body).await
}

async fn service_channel_dispatch(
    endpoint: Arc<ServiceEndpoint>,
    channel_id: String,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match endpoint
        .handle_channel_message(&channel_id, &headers, &body)
        .await
    {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(error) => {
            warn!(channel = %channel_id, %error, "channel message rejected");
            error_response(&error, Some(&channel_id), None)
        }
    }
}

// ---------------------------------------------------------------------------
// Agent side
// ---------------------------------------------------------------------------

/// Invocation parameters for [`AgentEndpoint::invoke`].
#[derive(Debug, Clone, Default)]
pub struct InvokeParams {
    pub config_profiles: HashMap<String, Value>,
    pub inputs: Vec<InputEntry>,
    pub user_confirmation: Option<UserConfirmation>,
}

/// The calling half: hosts client half-channels and opens invocations.
pub struct AgentEndpoint {
    base_url: String,
    sender: Arc<dyn MessageSender>,
    retry: RetryOptions,
    contexts: DashMap<String, Arc<ClientContext>>,
}

impl AgentEndpoint {
    /// `base_url` is the public URL the agent's channel router is served
    /// at; the service POSTs its messages there.
    pub fn new(base_url: &str) -> Arc<Self> {
        Self::with_sender(base_url, Arc::new(HttpMessageSender::new()), RetryOptions::default())
    }

    /// Same as [`AgentEndpoint::new`] with a custom sender and retry policy.
    pub fn with_sender(
        base_url: &str,
        sender: Arc<dyn MessageSender>,
        retry: RetryOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            sender,
            retry,
            contexts: DashMap::new(),
        })
    }

    fn channel_url(&self) -> String {
        format!("{}/channel", self.base_url)
    }

    /// Router exposing the client channel endpoint.
    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/channel", post(agent_channel_by_header))
            .route("/channel/:channel_id", post(agent_channel_by_path))
            .with_state(self.clone())
    }

    /// Open an invocation against `service_base_url` and return the live
    /// client context once the handshake completed.
    pub async fn invoke(
        &self,
        service_base_url: &str,
        command_name: &str,
        params: InvokeParams,
    ) -> Result<Arc<ClientContext>, Error> {
        let channel = Channel {
            protocol_version: defaults::PROTOCOL_VERSION.to_string(),
            command_name: Some(command_name.to_string()),
            client_channel_id: generate_channel_id(),
            client_channel_url: self.channel_url(),
            client_channel_token: generate_channel_token(),
            service_channel_id: None,
            service_channel_url: None,
            service_channel_token: None,
        };
        let client_channel_id = channel.client_channel_id.clone();
        let invoke = Message::Invoke {
            config_profiles: params.config_profiles,
            inputs: params.inputs,
            user_confirmation: params.user_confirmation,
        };

        // Routable before the handshake: the service may start posting to
        // the client channel as soon as it accepts the invoke.
        let context = Arc::new(ClientContext::new(
            channel.clone(),
            self.sender.clone(),
            self.retry.clone(),
        ));
        self.contexts
            .insert(client_channel_id.clone(), context.clone());

        match ServiceClient::new(service_base_url)
            .invoke(command_name, &channel, &invoke)
            .await
        {
            Ok(service_half) => {
                context.complete_handshake(
                    &service_half.channel_id,
                    &service_half.url,
                    &service_half.token,
                );
                debug!(
                    command = command_name,
                    channel = %client_channel_id,
                    "invocation opened"
                );
                Ok(context)
            }
            Err(handshake_error) => {
                self.contexts.remove(&client_channel_id);
                context.dispose();
                Err(Error::Transport(handshake_error))
            }
        }
    }

    /// Live context for a client channel id, if any.
    pub fn context(&self, client_channel_id: &str) -> Option<Arc<ClientContext>> {
        self.contexts
            .get(client_channel_id)
            .map(|entry| entry.value().clone())
    }

    fn handle_channel_message(
        &self,
        channel_id: &str,
        headers: &HeaderMap,
        body: &Bytes,
    ) -> Result<(), HttpError> {
        checked_version(headers)?;
        let token = bearer_token(headers)?;

        let message = parse_body(body)?;
        if matches!(message, Message::Invoke { .. }) {
            return Err(HttpError::invalid_request(
                "`invoke` is not valid on a client channel",
            ));
        }

        let context = self
            .context(channel_id)
            .ok_or_else(|| HttpError::SessionNotFound(channel_id.to_string()))?;
        if context.channel().client_channel_token != token {
            return Err(HttpError::Forbidden);
        }

        context.handle_incoming_message(message).map_err(http_error_from)?;

        // Terminal contexts are no longer routable; the caller's handle
        // keeps draining whatever is already buffered.
        if context.status() != ClientStatus::Invoked {
            self.contexts.remove(channel_id);
        }
        Ok(())
    }
}

async fn agent_channel_by_header(
    State(endpoint): State<Arc<AgentEndpoint>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let channel_id = match require_header(&headers, headers::CLIENT_CHANNEL_ID) {
        Ok(id) => id,
        Err(error) => return error_response(&error, None, None),
    };
    agent_channel_dispatch(endpoint, channel_id, headers, body)
}

async fn agent_channel_by_path(
    State(endpoint): State<Arc<AgentEndpoint>>,
    Path(channel_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    agent_channel_dispatch(endpoint, channel_id, headers, body)
}

fn agent_channel_dispatch(
    endpoint: Arc<AgentEndpoint>,
    channel_id: String,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match endpoint.handle_channel_message(&channel_id, &headers, &body) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(error) => {
            warn!(channel = %channel_id, %error, "client channel message rejected");
            error_response(&error, None, Some(&channel_id))
        }
    }
}
