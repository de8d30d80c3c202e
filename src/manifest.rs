//! # Service Manifest
//!
//! The static advertisement a service publishes at `/manifest.json`:
//! identity, config profile descriptors, terms, accepted payment schemas
//! and one descriptor per exposed command (with its invoke endpoint URI).

use std::collections::HashMap;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::command::{IoTypeDescriptor, ProfileScope};

/// Static descriptor of one config profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigProfileDescriptor {
    pub name: String,
    pub scope: ProfileScope,
    pub setup_uri: String,
    #[serde(default)]
    pub description: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
}

/// Static descriptor of one command, as advertised to agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: HashMap<String, String>,
    pub endpoint_uri: String,
    #[serde(default)]
    pub required_config_profiles: Vec<String>,
    pub requires_user_confirmation: bool,
    #[serde(default)]
    pub input_types: IndexMap<String, IoTypeDescriptor>,
    #[serde(default)]
    pub output_types: IndexMap<String, IoTypeDescriptor>,
}

/// The manifest document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceManifest {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terms_url: Option<String>,
    #[serde(default)]
    pub accepted_payment_schemas: Vec<String>,
    #[serde(default)]
    pub config_profiles: Vec<ConfigProfileDescriptor>,
    #[serde(default)]
    pub commands: Vec<CommandDescriptor>,
}
