//! # Channel Model
//!
//! A channel is the ordered pair of half-channels through which a single
//! invocation's messages flow. Each half is addressed by a URL, an opaque
//! random id and a bearer token; the agent hosts the client half, the
//! service hosts the service half. On the agent side the service half is
//! filled in from the invoke handshake response.

use async_trait::async_trait;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::http::TransportError;
use crate::message::Message;

/// Length of generated bearer tokens.
const TOKEN_LENGTH: usize = 32;

/// Which half-channel a message is being delivered to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelSide {
    /// The agent-hosted half (service → agent traffic).
    Client,
    /// The service-hosted half (agent → service traffic).
    Service,
}

/// The coordinates of a single invocation's message flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    pub protocol_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_name: Option<String>,
    pub client_channel_id: String,
    pub client_channel_url: String,
    pub client_channel_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_channel_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_channel_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_channel_token: Option<String>,
}

impl Channel {
    /// Target for service → agent posts.
    pub fn client_target(&self) -> ChannelTarget {
        ChannelTarget {
            url: self.client_channel_url.clone(),
            channel_id: self.client_channel_id.clone(),
            token: self.client_channel_token.clone(),
            protocol_version: self.protocol_version.clone(),
            side: ChannelSide::Client,
        }
    }

    /// Target for agent → service posts, once the handshake filled the
    /// service half in.
    pub fn service_target(&self) -> Option<ChannelTarget> {
        Some(ChannelTarget {
            url: self.service_channel_url.clone()?,
            channel_id: self.service_channel_id.clone()?,
            token: self.service_channel_token.clone()?,
            protocol_version: self.protocol_version.clone(),
            side: ChannelSide::Service,
        })
    }
}

/// Everything a sender needs for one POST to a half-channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelTarget {
    pub url: String,
    pub channel_id: String,
    pub token: String,
    pub protocol_version: String,
    pub side: ChannelSide,
}

/// Generate a random opaque channel id.
pub fn generate_channel_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Generate a random bearer secret.
pub fn generate_channel_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LENGTH)
        .map(char::from)
        .collect()
}

/// Transport-agnostic message delivery used by both context sides.
#[async_trait]
pub trait MessageSender: Send + Sync {
    /// Deliver one message to the peer half-channel.
    async fn send(&self, target: &ChannelTarget, message: &Message) -> Result<(), TransportError>;
}
