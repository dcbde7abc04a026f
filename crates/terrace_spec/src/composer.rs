//! Environment composition.
//!
//! Merges the shared root configuration into every instance of an
//! environment. Inputs resolve with the precedence
//! instance > environment > environment context > root, tags with
//! module default < root < environment < instance.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{SpecError, SpecResult};
use crate::models::{
    Attributes, BackendConfig, DependencyConfig, EnvironmentConfig, InstanceConfig, InstanceId,
    ProvisionerConfig, RootConfig, Secret, TagSet,
};
use crate::reader::ModuleCatalog;

/// Source of secret values, looked up by variable name.
#[cfg_attr(test, mockall::automock)]
pub trait SecretSource: Send + Sync {
    fn get(&self, variable: &str) -> Option<String>;
}

/// Reads secrets from process environment variables.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvSecretSource;

impl SecretSource for EnvSecretSource {
    fn get(&self, variable: &str) -> Option<String> {
        std::env::var(variable).ok()
    }
}

/// Fixed secrets, mostly for tests and simulations.
#[derive(Debug, Default, Clone)]
pub struct StaticSecretSource(BTreeMap<String, String>);

impl StaticSecretSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, variable: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(variable.into(), value.into());
        self
    }
}

impl SecretSource for StaticSecretSource {
    fn get(&self, variable: &str) -> Option<String> {
        self.0.get(variable).cloned()
    }
}

/// One instance with every layer of configuration applied.
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedInstance {
    pub id: InstanceId,
    pub module: String,
    pub module_version: String,
    pub account_id: Option<String>,
    /// Inputs, possibly still holding dependency references.
    pub inputs: Attributes,
    /// Secret inputs, kept apart so they never serialize.
    pub secrets: BTreeMap<String, Secret>,
    pub sensitive_inputs: BTreeSet<String>,
    pub tags: TagSet,
    pub dependencies: Vec<DependencyConfig>,
    pub declaration_index: usize,
}

impl ResolvedInstance {
    pub fn name(&self) -> &str {
        &self.id.name
    }

    /// Inputs with secret values merged in. Do not log the result.
    pub fn effective_inputs(&self) -> Attributes {
        let mut inputs = self.inputs.clone();
        for (name, secret) in &self.secrets {
            inputs.insert(name.clone(), Value::String(secret.expose().to_string()));
        }
        inputs
    }

    pub fn dependency(&self, alias: &str) -> Option<&DependencyConfig> {
        self.dependencies.iter().find(|d| d.name == alias)
    }
}

/// The fully composed configuration of one environment.
#[derive(Debug, Clone, Serialize)]
pub struct ComposedEnvironment {
    pub name: String,
    pub region: String,
    pub account_id: Option<String>,
    pub backend: BackendConfig,
    pub provisioner: ProvisionerConfig,
    pub instances: Vec<ResolvedInstance>,
    /// Flagged but untouched configuration, e.g. hardcoded resource ids.
    pub warnings: Vec<String>,
}

impl ComposedEnvironment {
    pub fn instance(&self, name: &str) -> Option<&ResolvedInstance> {
        self.instances.iter().find(|i| i.id.name == name)
    }

    pub fn instance_names(&self) -> Vec<&str> {
        self.instances.iter().map(|i| i.id.name.as_str()).collect()
    }
}

/// Composes environments against one immutable root configuration.
pub struct EnvironmentComposer {
    root: Arc<RootConfig>,
    catalog: Arc<ModuleCatalog>,
    secrets: Arc<dyn SecretSource>,
}

impl EnvironmentComposer {
    pub fn new(root: Arc<RootConfig>, catalog: Arc<ModuleCatalog>) -> Self {
        Self {
            root,
            catalog,
            secrets: Arc::new(EnvSecretSource),
        }
    }

    pub fn with_secrets(mut self, secrets: Arc<dyn SecretSource>) -> Self {
        self.secrets = secrets;
        self
    }

    /// Compose `env`. Pure with respect to its inputs: composing twice with
    /// the same configuration and secrets yields identical output.
    pub fn compose(&self, env: &EnvironmentConfig) -> SpecResult<ComposedEnvironment> {
        validate_name(&env.name)?;

        let region = env
            .region
            .clone()
            .or_else(|| self.root.provider.region.clone())
            .ok_or_else(|| SpecError::MissingField(format!("region for environment {}", env.name)))?;
        let account_id = env
            .account_id
            .clone()
            .or_else(|| self.root.provider.account_id.clone());

        info!("Composing environment {} ({})", env.name, region);

        let mut seen = HashSet::new();
        let mut instances = Vec::with_capacity(env.instances.len());
        let mut warnings = Vec::new();

        for (index, instance) in env.instances.iter().enumerate() {
            validate_name(&instance.name)?;
            if !seen.insert(instance.name.as_str()) {
                return Err(SpecError::DuplicateInstance {
                    environment: env.name.clone(),
                    instance: instance.name.clone(),
                });
            }
            for dep in &instance.dependencies {
                validate_name(&dep.name)?;
            }

            warnings.extend(flag_literal_ids(&instance.name, &instance.inputs));

            let resolved =
                self.compose_instance(env, instance, index, &region, account_id.as_deref())?;
            instances.push(resolved);
        }

        for warning in &warnings {
            warn!("{}", warning);
        }

        Ok(ComposedEnvironment {
            name: env.name.clone(),
            region,
            account_id,
            backend: self.root.backend.clone(),
            provisioner: self.root.provisioner.clone(),
            instances,
            warnings,
        })
    }

    fn compose_instance(
        &self,
        env: &EnvironmentConfig,
        instance: &InstanceConfig,
        index: usize,
        region: &str,
        account_id: Option<&str>,
    ) -> SpecResult<ResolvedInstance> {
        let module = self.catalog.get_required(&instance.module)?;
        let id = InstanceId::new(&env.name, region, &instance.name);

        let tags = TagSet::merged([&module.default_tags, &self.root.tags, &env.tags, &instance.tags]);

        let mut context = Attributes::new();
        context.insert("environment".to_string(), Value::String(env.name.clone()));
        context.insert("region".to_string(), Value::String(region.to_string()));
        if let Some(account) = account_id {
            context.insert("account_id".to_string(), Value::String(account.to_string()));
        }
        context.insert("tags".to_string(), tags.to_value());

        // Shared layers only feed inputs the module declares; instance
        // inputs pass through untouched so typos surface as schema errors.
        let mut inputs = Attributes::new();
        for name in module.inputs.keys() {
            let layered = instance
                .inputs
                .get(name)
                .or_else(|| env.inputs.get(name))
                .or_else(|| context.get(name))
                .or_else(|| self.root.inputs.get(name));
            if let Some(value) = layered {
                inputs.insert(name.clone(), value.clone());
            }
        }
        for (name, value) in &instance.inputs {
            inputs.entry(name.clone()).or_insert_with(|| value.clone());
        }

        let mut secret_vars: BTreeMap<&String, &String> = env
            .secrets
            .iter()
            .filter(|(name, _)| module.inputs.contains_key(*name))
            .collect();
        secret_vars.extend(instance.secrets.iter());

        let mut secrets = BTreeMap::new();
        for (input, variable) in secret_vars {
            let value = self
                .secrets
                .get(variable)
                .ok_or_else(|| SpecError::MissingSecret {
                    instance: id.to_string(),
                    input: input.clone(),
                    variable: variable.clone(),
                })?;
            inputs.remove(input);
            secrets.insert(input.clone(), Secret::new(value));
        }

        let mut sensitive_inputs = module.sensitive_inputs();
        sensitive_inputs.extend(secrets.keys().cloned());

        debug!(
            "Composed {} from module {}@{} ({} inputs, {} secrets)",
            id,
            instance.module,
            module.version,
            inputs.len(),
            secrets.len()
        );

        Ok(ResolvedInstance {
            id,
            module: instance.module.clone(),
            module_version: module.version.clone(),
            account_id: account_id.map(str::to_string),
            inputs,
            secrets,
            sensitive_inputs,
            tags,
            dependencies: instance.dependencies.clone(),
            declaration_index: index,
        })
    }
}

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_-]*$").expect("name pattern is valid"))
}

fn literal_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(sg|vpc|subnet|igw|nat|rtb|eni|eipalloc|lt|ami)-[0-9a-f]{8,17}$")
            .expect("literal id pattern is valid")
    })
}

fn validate_name(name: &str) -> SpecResult<()> {
    if name_pattern().is_match(name) {
        Ok(())
    } else {
        Err(SpecError::InvalidName {
            name: name.to_string(),
            reason: "must start with a letter and contain only letters, digits, '_' or '-'"
                .to_string(),
        })
    }
}

/// Hardcoded provider resource ids bypass the dependency graph. They are
/// reported, never rewritten.
fn flag_literal_ids(instance: &str, inputs: &Attributes) -> Vec<String> {
    let mut found = Vec::new();
    for (name, value) in inputs {
        scan_literals(value, name, &mut found);
    }
    found
        .into_iter()
        .map(|(path, literal)| {
            format!(
                "{}: input `{}` hardcodes resource id '{}' instead of referencing a dependency output",
                instance, path, literal
            )
        })
        .collect()
}

fn scan_literals(value: &Value, path: &str, found: &mut Vec<(String, String)>) {
    match value {
        Value::String(s) if literal_id_pattern().is_match(s) => {
            found.push((path.to_string(), s.clone()));
        }
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                scan_literals(item, &format!("{}[{}]", path, i), found);
            }
        }
        Value::Object(map) => {
            for (k, v) in map {
                scan_literals(v, &format!("{}.{}", path, k), found);
            }
        }
        _ => {}
    }
}
