//! Outbound HTTP: the reqwest-backed message sender and the invoke
//! handshake.

use std::time::Duration;

use async_trait::async_trait;
use http::header::AUTHORIZATION;
use http::StatusCode;
use reqwest::Response;
use tracing::debug;

use crate::channel::{Channel, ChannelSide, ChannelTarget, MessageSender};
use crate::http::{headers, ErrorBody, TransportError};
use crate::message::Message;

/// Per-request timeout; a hung peer becomes a retryable transport error.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

fn build_http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .unwrap_or_default()
}

async fn decode_rejection(response: Response) -> TransportError {
    let status = response.status().as_u16();
    let body = response.json::<ErrorBody>().await.ok();
    let message = body
        .as_ref()
        .map(|b| b.message.clone())
        .unwrap_or_else(|| format!("HTTP {status}"));
    TransportError::Rejected {
        status,
        message,
        body,
    }
}

/// [`MessageSender`] that POSTs messages to the peer half-channel.
pub struct HttpMessageSender {
    http: reqwest::Client,
}

impl Default for HttpMessageSender {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpMessageSender {
    pub fn new() -> Self {
        Self {
            http: build_http_client(),
        }
    }
}

#[async_trait]
impl MessageSender for HttpMessageSender {
    async fn send(&self, target: &ChannelTarget, message: &Message) -> Result<(), TransportError> {
        let id_header = match target.side {
            ChannelSide::Client => headers::CLIENT_CHANNEL_ID,
            ChannelSide::Service => headers::SERVICE_CHANNEL_ID,
        };
        debug!(url = %target.url, kind = message.kind(), "posting message");

        let response = self
            .http
            .post(&target.url)
            .header(headers::PROTOCOL_VERSION, &target.protocol_version)
            .header(id_header, &target.channel_id)
            .header(AUTHORIZATION, format!("Bearer {}", target.token))
            .json(message)
            .send()
            .await
            .map_err(|e| TransportError::Unreachable {
                message: e.to_string(),
            })?;

        if response.status().is_success() {
            return Ok(());
        }
        Err(decode_rejection(response).await)
    }
}

/// Service half-channel coordinates read back from an invoke handshake.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceHalf {
    pub channel_id: String,
    pub url: String,
    pub token: String,
}

/// Raw client for a service's public endpoints (manifest + invoke).
pub struct ServiceClient {
    http: reqwest::Client,
    base_url: String,
}

impl ServiceClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            http: build_http_client(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Fetch and decode the service manifest.
    pub async fn manifest(&self) -> Result<crate::manifest::ServiceManifest, TransportError> {
        let url = format!("{}/manifest.json", self.base_url);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| TransportError::Unreachable {
                message: e.to_string(),
            })?;
        if !response.status().is_success() {
            return Err(decode_rejection(response).await);
        }
        response
            .json()
            .await
            .map_err(|e| TransportError::Unreachable {
                message: format!("manifest does not decode: {e}"),
            })
    }

    /// Perform the invoke handshake.
    ///
    /// Sends the `Invoke` body with the client half-channel coordinates in
    /// request headers; on `204` the service half is read back from the
    /// response headers.
    pub async fn invoke(
        &self,
        command_name: &str,
        channel: &Channel,
        invoke: &Message,
    ) -> Result<ServiceHalf, TransportError> {
        let url = format!("{}/invoke/{}", self.base_url, command_name);
        debug!(%url, "invoking command");

        let response = self
            .http
            .post(&url)
            .header(headers::PROTOCOL_VERSION, &channel.protocol_version)
            .header(headers::CLIENT_CHANNEL_ID, &channel.client_channel_id)
            .header(headers::CLIENT_CHANNEL_URL, &channel.client_channel_url)
            .header(headers::CLIENT_CHANNEL_TOKEN, &channel.client_channel_token)
            .json(invoke)
            .send()
            .await
            .map_err(|e| TransportError::Unreachable {
                message: e.to_string(),
            })?;

        if response.status() != StatusCode::NO_CONTENT {
            return Err(decode_rejection(response).await);
        }

        let header = |name: &str| -> Result<String, TransportError> {
            response
                .headers()
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
                .ok_or_else(|| TransportError::Unreachable {
                    message: format!("handshake response is missing `{name}`"),
                })
        };

        Ok(ServiceHalf {
            channel_id: header(headers::SERVICE_CHANNEL_ID)?,
            url: header(headers::SERVICE_CHANNEL_URL)?,
            token: header(headers::SERVICE_CHANNEL_TOKEN)?,
        })
    }
}
