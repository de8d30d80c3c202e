//! # Command and Config Profile Definitions
//!
//! A [`CommandDefinition`] declares what a command consumes and produces:
//! ordered maps of named input and output types, each with a multilingual
//! description and an optional JSON schema compiled at declaration time.
//! Definitions are built once, registered with a service, and never mutated
//! afterwards.
//!
//! A [`ConfigProfileDefinition`] describes a named bag of configuration
//! (credentials, account binding) a command may require; supplied profile
//! values are validated against its schema during invoke handling.

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;
use crate::manifest::{CommandDescriptor, ConfigProfileDescriptor};
use crate::message::InputRequest;
use crate::schema::{CompiledSchema, SchemaViolation};

/// Declared shape of one input or output type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IoTypeDescriptor {
    #[serde(default)]
    pub description: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
    #[serde(default = "IoTypeDescriptor::required_default")]
    pub required: bool,
}

impl IoTypeDescriptor {
    fn required_default() -> bool {
        true
    }

    /// Descriptor with an English description and no schema.
    pub fn text(description: &str) -> Self {
        Self {
            description: HashMap::from([("en".to_string(), description.to_string())]),
            schema: None,
            required: true,
        }
    }

    /// Attach a JSON schema to this descriptor.
    pub fn with_schema(mut self, schema: Value) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }
}

/// A declared type together with its compiled validator.
#[derive(Debug)]
pub struct IoType {
    descriptor: IoTypeDescriptor,
    validator: Option<CompiledSchema>,
}

impl IoType {
    fn from_descriptor(descriptor: IoTypeDescriptor) -> Result<Self, Error> {
        let validator = descriptor
            .schema
            .clone()
            .map(CompiledSchema::compile)
            .transpose()?;
        Ok(Self {
            descriptor,
            validator,
        })
    }

    pub fn descriptor(&self) -> &IoTypeDescriptor {
        &self.descriptor
    }

    /// Violations of `value` against the declared schema (empty when the
    /// type declares no schema).
    pub fn check(&self, value: &Value) -> Vec<SchemaViolation> {
        match &self.validator {
            Some(validator) => validator.validate(value),
            None => Vec::new(),
        }
    }
}

/// Scope a config profile is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfileScope {
    User,
    Organization,
}

/// A named, schematized bag of configuration required by commands.
#[derive(Debug)]
pub struct ConfigProfileDefinition {
    name: String,
    scope: ProfileScope,
    setup_uri: String,
    description: HashMap<String, String>,
    validator: Option<CompiledSchema>,
}

impl ConfigProfileDefinition {
    pub fn new(name: &str, scope: ProfileScope, setup_uri: &str) -> Self {
        Self {
            name: name.to_string(),
            scope,
            setup_uri: setup_uri.to_string(),
            description: HashMap::new(),
            validator: None,
        }
    }

    pub fn describe(mut self, language: &str, text: &str) -> Self {
        self.description
            .insert(language.to_string(), text.to_string());
        self
    }

    pub fn with_schema(mut self, schema: Value) -> Result<Self, Error> {
        self.validator = Some(CompiledSchema::compile(schema)?);
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn scope(&self) -> ProfileScope {
        self.scope
    }

    /// Violations of a supplied profile value (empty without a schema).
    pub fn check(&self, value: &Value) -> Vec<SchemaViolation> {
        match &self.validator {
            Some(validator) => validator.validate(value),
            None => Vec::new(),
        }
    }

    /// Static descriptor for manifest assembly.
    pub fn descriptor(&self) -> ConfigProfileDescriptor {
        ConfigProfileDescriptor {
            name: self.name.clone(),
            scope: self.scope,
            setup_uri: self.setup_uri.clone(),
            description: self.description.clone(),
            schema: self.validator.as_ref().map(|v| v.schema().clone()),
        }
    }
}

/// Registry of everything one command declares.
#[derive(Debug)]
pub struct CommandDefinition {
    name: String,
    description: HashMap<String, String>,
    required_config_profiles: Vec<String>,
    requires_user_confirmation: bool,
    input_types: IndexMap<String, IoType>,
    output_types: IndexMap<String, IoType>,
}

impl CommandDefinition {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            description: HashMap::new(),
            required_config_profiles: Vec::new(),
            requires_user_confirmation: false,
            input_types: IndexMap::new(),
            output_types: IndexMap::new(),
        }
    }

    pub fn describe(mut self, language: &str, text: &str) -> Self {
        self.description
            .insert(language.to_string(), text.to_string());
        self
    }

    pub fn require_config_profile(mut self, profile: &str) -> Self {
        if !self.required_config_profiles.iter().any(|p| p == profile) {
            self.required_config_profiles.push(profile.to_string());
        }
        self
    }

    pub fn require_user_confirmation(mut self) -> Self {
        self.requires_user_confirmation = true;
        self
    }

    /// Declare an input type; a duplicate name fails.
    pub fn input_type(mut self, name: &str, descriptor: IoTypeDescriptor) -> Result<Self, Error> {
        if self.input_types.contains_key(name) {
            return Err(Error::DuplicateTypeName { name: name.into() });
        }
        self.input_types
            .insert(name.to_string(), IoType::from_descriptor(descriptor)?);
        Ok(self)
    }

    /// Declare an output type; a duplicate name fails.
    pub fn output_type(mut self, name: &str, descriptor: IoTypeDescriptor) -> Result<Self, Error> {
        if self.output_types.contains_key(name) {
            return Err(Error::DuplicateTypeName { name: name.into() });
        }
        self.output_types
            .insert(name.to_string(), IoType::from_descriptor(descriptor)?);
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn requires_user_confirmation(&self) -> bool {
        self.requires_user_confirmation
    }

    pub fn required_config_profiles(&self) -> &[String] {
        &self.required_config_profiles
    }

    pub fn requires_config_profile(&self, profile: &str) -> bool {
        self.required_config_profiles.iter().any(|p| p == profile)
    }

    pub fn has_input_type(&self, name: &str) -> bool {
        self.input_types.contains_key(name)
    }

    pub fn input_type_def(&self, name: &str) -> Option<&IoType> {
        self.input_types.get(name)
    }

    pub fn has_output_type(&self, name: &str) -> bool {
        self.output_types.contains_key(name)
    }

    pub fn output_type_def(&self, name: &str) -> Option<&IoType> {
        self.output_types.get(name)
    }

    /// Validate one provided input value against its declared schema.
    pub fn validate_input(&self, name: &str, value: &Value) -> Result<(), Error> {
        let io_type = self
            .input_types
            .get(name)
            .ok_or_else(|| Error::UnknownInputType {
                input_type: name.into(),
            })?;
        let violations = io_type.check(value);
        if violations.is_empty() {
            return Ok(());
        }
        Err(Error::InvalidInput {
            input_type: name.into(),
            violations,
        })
    }

    /// Validate one produced output value against its declared schema.
    pub fn validate_output(&self, name: &str, value: &Value) -> Result<(), Error> {
        let io_type = self
            .output_types
            .get(name)
            .ok_or_else(|| Error::UnknownOutputType {
                output_type: name.into(),
            })?;
        let violations = io_type.check(value);
        if violations.is_empty() {
            return Ok(());
        }
        Err(Error::InvalidOutput {
            output_type: name.into(),
            violations,
        })
    }

    /// Build the `RequestInput` descriptor for one declared input type.
    pub fn input_request(&self, name: &str, min_count: u32) -> Option<InputRequest> {
        let io_type = self.input_types.get(name)?;
        Some(InputRequest {
            description: io_type.descriptor.description.clone(),
            schema: io_type.descriptor.schema.clone(),
            required: Some(io_type.descriptor.required),
            min_count: Some(min_count),
        })
    }

    /// Static descriptor for manifest assembly.
    pub fn descriptor(&self, endpoint_uri: &str) -> CommandDescriptor {
        CommandDescriptor {
            name: self.name.clone(),
            description: self.description.clone(),
            endpoint_uri: endpoint_uri.to_string(),
            required_config_profiles: self.required_config_profiles.clone(),
            requires_user_confirmation: self.requires_user_confirmation,
            input_types: self
                .input_types
                .iter()
                .map(|(name, io_type)| (name.clone(), io_type.descriptor.clone()))
                .collect(),
            output_types: self
                .output_types
                .iter()
                .map(|(name, io_type)| (name.clone(), io_type.descriptor.clone()))
                .collect(),
        }
    }
}

/// Shared handle to an immutable, registered command definition.
pub type SharedCommand = Arc<CommandDefinition>;
