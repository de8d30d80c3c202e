//! # Service Definition
//!
//! The registry a service endpoint is built from: identity, config profile
//! definitions, accepted payment schemas and the set of exposed commands,
//! each paired with its handler. Everything is assembled up front and
//! immutable once the endpoint starts serving.

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;
use semver::Version;

use crate::command::{CommandDefinition, ConfigProfileDefinition};
use crate::error::Error;
use crate::manifest::ServiceManifest;
use crate::runner::CommandHandler;
use crate::service::ServiceContextOptions;

/// One registered command: its declaration plus the handler that runs it.
pub struct ServiceCommand {
    pub definition: Arc<CommandDefinition>,
    pub handler: Arc<dyn CommandHandler>,
}

/// Immutable description of one service.
pub struct ServiceDefinition {
    name: String,
    version: String,
    description: HashMap<String, String>,
    terms_url: Option<String>,
    accepted_payment_schemas: Vec<String>,
    profiles: HashMap<String, Arc<ConfigProfileDefinition>>,
    commands: IndexMap<String, ServiceCommand>,
}

impl ServiceDefinition {
    /// Create a definition; `version` must be a valid semver string.
    pub fn new(name: &str, version: &str) -> Result<Self, Error> {
        Version::parse(version)
            .map_err(|e| Error::Definition(format!("invalid service version `{version}`: {e}")))?;
        Ok(Self {
            name: name.to_string(),
            version: version.to_string(),
            description: HashMap::new(),
            terms_url: None,
            accepted_payment_schemas: Vec::new(),
            profiles: HashMap::new(),
            commands: IndexMap::new(),
        })
    }

    pub fn describe(mut self, language: &str, text: &str) -> Self {
        self.description
            .insert(language.to_string(), text.to_string());
        self
    }

    pub fn terms_url(mut self, url: &str) -> Self {
        self.terms_url = Some(url.to_string());
        self
    }

    pub fn accept_payment_schema(mut self, schema: &str) -> Self {
        self.accepted_payment_schemas.push(schema.to_string());
        self
    }

    /// Declare a config profile; a duplicate name fails.
    pub fn config_profile(mut self, profile: ConfigProfileDefinition) -> Result<Self, Error> {
        let name = profile.name().to_string();
        if self.profiles.contains_key(&name) {
            return Err(Error::Definition(format!(
                "config profile `{name}` is already declared"
            )));
        }
        self.profiles.insert(name, Arc::new(profile));
        Ok(self)
    }

    /// Register a command and its handler.
    ///
    /// Fails on a duplicate command name or when the command requires a
    /// config profile the service does not declare.
    pub fn register_command(
        mut self,
        definition: CommandDefinition,
        handler: Arc<dyn CommandHandler>,
    ) -> Result<Self, Error> {
        let name = definition.name().to_string();
        if self.commands.contains_key(&name) {
            return Err(Error::DuplicateCommand { name });
        }
        for profile in definition.required_config_profiles() {
            if !self.profiles.contains_key(profile) {
                return Err(Error::Definition(format!(
                    "command `{name}` requires undeclared config profile `{profile}`"
                )));
            }
        }
        self.commands.insert(
            name,
            ServiceCommand {
                definition: Arc::new(definition),
                handler,
            },
        );
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn command(&self, name: &str) -> Option<&ServiceCommand> {
        self.commands.get(name)
    }

    pub fn profiles(&self) -> &HashMap<String, Arc<ConfigProfileDefinition>> {
        &self.profiles
    }

    pub fn accepted_payment_schemas(&self) -> &[String] {
        &self.accepted_payment_schemas
    }

    /// Context construction options derived from this definition.
    pub fn context_options(&self) -> ServiceContextOptions {
        ServiceContextOptions {
            accepted_payment_schemas: self.accepted_payment_schemas.clone(),
            profiles: self.profiles.clone(),
            ..Default::default()
        }
    }

    /// Assemble the manifest document advertised at `/manifest.json`.
    pub fn manifest(&self, base_url: &str) -> ServiceManifest {
        let base = base_url.trim_end_matches('/');
        ServiceManifest {
            name: self.name.clone(),
            version: self.version.clone(),
            description: self.description.clone(),
            terms_url: self.terms_url.clone(),
            accepted_payment_schemas: self.accepted_payment_schemas.clone(),
            config_profiles: self
                .profiles
                .values()
                .map(|profile| profile.descriptor())
                .collect(),
            commands: self
                .commands
                .iter()
                .map(|(name, command)| {
                    command
                        .definition
                        .descriptor(&format!("{base}/invoke/{name}"))
                })
                .collect(),
        }
    }
}
