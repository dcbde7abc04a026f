//! Data models for modules, environments and the root configuration.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

/// Attribute and input maps are ordered so every rendered view is deterministic.
pub type Attributes = BTreeMap<String, Value>;

/// The command a run is executing on behalf of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandKind {
    Validate,
    Plan,
    Apply,
    Destroy,
}

impl CommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validate => "validate",
            Self::Plan => "plan",
            Self::Apply => "apply",
            Self::Destroy => "destroy",
        }
    }

    /// Mock outputs may only stand in for real ones on dry runs.
    pub fn allows_mocks(&self) -> bool {
        matches!(self, Self::Validate | Self::Plan)
    }

    /// Whether the command changes external resources or state.
    pub fn mutates(&self) -> bool {
        matches!(self, Self::Apply | Self::Destroy)
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Identity of one module instance: (environment, region, instance name).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceId {
    pub environment: String,
    pub region: String,
    pub name: String,
}

impl InstanceId {
    pub fn new(
        environment: impl Into<String>,
        region: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            environment: environment.into(),
            region: region.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.environment, self.region, self.name)
    }
}

/// String key/value tags attached to every provisioned resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TagSet(BTreeMap<String, String>);

impl TagSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(|v| v.as_str())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    /// Overlay `other` on top of this set; keys in `other` win.
    pub fn overlay(&mut self, other: &TagSet) {
        for (k, v) in &other.0 {
            self.0.insert(k.clone(), v.clone());
        }
    }

    /// Merge layers lowest-precedence first.
    pub fn merged<'a>(layers: impl IntoIterator<Item = &'a TagSet>) -> TagSet {
        let mut merged = TagSet::new();
        for layer in layers {
            merged.overlay(layer);
        }
        merged
    }

    pub fn to_value(&self) -> Value {
        Value::Object(
            self.0
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect(),
        )
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for TagSet {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// A secret value sourced at composition time. Never printed or serialized.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub const REDACTED: &'static str = "<sensitive>";

    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret({})", Self::REDACTED)
    }
}

impl Serialize for Secret {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(Self::REDACTED)
    }
}

// ---------------------------------------------------------------------------
// Module definitions
// ---------------------------------------------------------------------------

/// Declared type of a module input field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldType {
    String,
    Bool,
    Number,
    Any,
    List { items: Box<FieldType> },
    Map { values: Box<FieldType> },
    Object { fields: BTreeMap<String, FieldSpec> },
}

impl FieldType {
    /// Human readable type expression, e.g. `map(object)`.
    pub fn describe(&self) -> String {
        match self {
            Self::String => "string".to_string(),
            Self::Bool => "bool".to_string(),
            Self::Number => "number".to_string(),
            Self::Any => "any".to_string(),
            Self::List { items } => format!("list({})", items.describe()),
            Self::Map { values } => format!("map({})", values.describe()),
            Self::Object { .. } => "object".to_string(),
        }
    }
}

/// One declared input field: its type plus required/optional markers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    #[serde(flatten)]
    pub field_type: FieldType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub sensitive: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl FieldSpec {
    pub fn new(field_type: FieldType) -> Self {
        Self {
            field_type,
            default: None,
            optional: false,
            sensitive: false,
            description: None,
        }
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn sensitive(mut self) -> Self {
        self.sensitive = true;
        self
    }

    /// A field without a default that is not explicitly optional must be supplied.
    pub fn is_required(&self) -> bool {
        !self.optional && self.default.is_none()
    }
}

/// A resource template inside a module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceTemplate {
    #[serde(rename = "type")]
    pub resource_type: String,
    pub name: String,
    /// Expression producing a map or a list of strings; one node per key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub for_each: Option<String>,
    /// Boolean or expression gating the whole template.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<Value>,
    #[serde(default)]
    pub attributes: Attributes,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    /// Explicit ordering against other templates, as `type.name`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
}

impl ResourceTemplate {
    pub fn address(&self) -> String {
        format!("{}.{}", self.resource_type, self.name)
    }
}

/// Collects one attribute across every node of a resource template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectSpec {
    pub resource_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub attribute: String,
    /// Keep only nodes whose logical address contains this substring.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_contains: Option<String>,
    #[serde(default)]
    pub as_map: bool,
}

/// A declared module output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collect: Option<CollectSpec>,
    #[serde(default)]
    pub sensitive: bool,
}

/// A named, versioned resource template with typed inputs and outputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleDefinition {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub inputs: BTreeMap<String, FieldSpec>,
    #[serde(default)]
    pub default_tags: TagSet,
    #[serde(default)]
    pub resources: Vec<ResourceTemplate>,
    #[serde(default)]
    pub outputs: BTreeMap<String, OutputSpec>,
}

fn default_version() -> String {
    "0.1.0".to_string()
}

impl ModuleDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: default_version(),
            description: None,
            inputs: BTreeMap::new(),
            default_tags: TagSet::new(),
            resources: Vec::new(),
            outputs: BTreeMap::new(),
        }
    }

    pub fn input(mut self, name: impl Into<String>, spec: FieldSpec) -> Self {
        self.inputs.insert(name.into(), spec);
        self
    }

    pub fn resource(mut self, template: ResourceTemplate) -> Self {
        self.resources.push(template);
        self
    }

    pub fn output(mut self, name: impl Into<String>, spec: OutputSpec) -> Self {
        self.outputs.insert(name.into(), spec);
        self
    }

    /// Names of inputs declared sensitive.
    pub fn sensitive_inputs(&self) -> BTreeSet<String> {
        self.inputs
            .iter()
            .filter(|(_, spec)| spec.sensitive)
            .map(|(name, _)| name.clone())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Root and environment configuration
// ---------------------------------------------------------------------------

/// Where state records live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Local,
    Memory,
}

/// Remote state backend template shared by every environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default)]
    pub kind: BackendKind,
    #[serde(default = "default_state_path")]
    pub path: PathBuf,
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

fn default_state_path() -> PathBuf {
    PathBuf::from(".terrace/state")
}

fn default_prefix() -> String {
    "terrace".to_string()
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::default(),
            path: default_state_path(),
            prefix: default_prefix(),
        }
    }
}

/// Provider defaults applied to every environment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderDefaults {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
}

/// Which provisioning backend performs resource operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ProvisionerConfig {
    #[default]
    Mock,
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

/// Shared root configuration (`terrace.toml`). Immutable once loaded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RootConfig {
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub provider: ProviderDefaults,
    #[serde(default)]
    pub tags: TagSet,
    #[serde(default)]
    pub inputs: Attributes,
    #[serde(default)]
    pub provisioner: ProvisionerConfig,
}

fn default_mock_commands() -> Vec<CommandKind> {
    vec![CommandKind::Validate, CommandKind::Plan]
}

/// A declared dependency of one instance on another instance's outputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencyConfig {
    /// Alias used in `${dependency.<name>.outputs.<output>}` references.
    pub name: String,
    /// Instance the alias points at; defaults to `name`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(default)]
    pub mock_outputs: Attributes,
    #[serde(default = "default_mock_commands")]
    pub mock_outputs_allowed: Vec<CommandKind>,
}

impl DependencyConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instance: None,
            mock_outputs: Attributes::new(),
            mock_outputs_allowed: default_mock_commands(),
        }
    }

    pub fn on_instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = Some(instance.into());
        self
    }

    pub fn mock(mut self, output: impl Into<String>, value: Value) -> Self {
        self.mock_outputs.insert(output.into(), value);
        self
    }

    pub fn target_instance(&self) -> &str {
        self.instance.as_deref().unwrap_or(&self.name)
    }

    pub fn mock_allowed_for(&self, command: CommandKind) -> bool {
        command.allows_mocks() && self.mock_outputs_allowed.contains(&command)
    }
}

/// One module instantiation declared by an environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub name: String,
    pub module: String,
    #[serde(default)]
    pub inputs: Attributes,
    #[serde(default)]
    pub tags: TagSet,
    /// Input name to environment variable holding the secret.
    #[serde(default)]
    pub secrets: BTreeMap<String, String>,
    #[serde(default)]
    pub dependencies: Vec<DependencyConfig>,
}

impl InstanceConfig {
    pub fn new(name: impl Into<String>, module: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            module: module.into(),
            inputs: Attributes::new(),
            tags: TagSet::new(),
            secrets: BTreeMap::new(),
            dependencies: Vec::new(),
        }
    }

    pub fn input(mut self, name: impl Into<String>, value: Value) -> Self {
        self.inputs.insert(name.into(), value);
        self
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key, value);
        self
    }

    pub fn secret(mut self, input: impl Into<String>, variable: impl Into<String>) -> Self {
        self.secrets.insert(input.into(), variable.into());
        self
    }

    pub fn depends_on(mut self, dependency: DependencyConfig) -> Self {
        self.dependencies.push(dependency);
        self
    }
}

/// A named deployment target (`environments/<name>/env.yaml`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(default)]
    pub tags: TagSet,
    #[serde(default)]
    pub inputs: Attributes,
    #[serde(default)]
    pub secrets: BTreeMap<String, String>,
    #[serde(default)]
    pub instances: Vec<InstanceConfig>,
}

impl EnvironmentConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            region: None,
            account_id: None,
            tags: TagSet::new(),
            inputs: Attributes::new(),
            secrets: BTreeMap::new(),
            instances: Vec::new(),
        }
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_account(mut self, account_id: impl Into<String>) -> Self {
        self.account_id = Some(account_id.into());
        self
    }

    pub fn instance(mut self, instance: InstanceConfig) -> Self {
        self.instances.push(instance);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tag_precedence() {
        let module = TagSet::new().with("Owner", "platform").with("Tier", "base");
        let common = TagSet::new().with("Owner", "infra").with("CostCenter", "42");
        let instance = TagSet::new().with("Tier", "data");

        let merged = TagSet::merged([&module, &common, &instance]);
        assert_eq!(merged.get("Owner"), Some("infra"));
        assert_eq!(merged.get("Tier"), Some("data"));
        assert_eq!(merged.get("CostCenter"), Some("42"));
    }

    #[test]
    fn test_secret_is_redacted() {
        let secret = Secret::new("hunter2");
        assert_eq!(format!("{:?}", secret), "Secret(<sensitive>)");
        assert_eq!(serde_json::to_string(&secret).unwrap(), "\"<sensitive>\"");
        assert_eq!(secret.expose(), "hunter2");
    }

    #[test]
    fn test_field_spec_from_yaml() {
        let yaml = r#"
type: map
values:
  type: object
  fields:
    cidr:
      type: string
    public:
      type: bool
      default: false
"#;
        let spec: FieldSpec = serde_yaml::from_str(yaml).unwrap();
        assert!(spec.is_required());
        assert_eq!(spec.field_type.describe(), "map(object)");

        let FieldType::Map { values } = &spec.field_type else {
            panic!("expected map type");
        };
        let FieldType::Object { fields } = values.as_ref() else {
            panic!("expected object values");
        };
        assert!(fields["cidr"].is_required());
        assert_eq!(fields["public"].default, Some(json!(false)));
    }

    #[test]
    fn test_dependency_mock_policy() {
        let dep = DependencyConfig::new("vpc");
        assert!(dep.mock_allowed_for(CommandKind::Validate));
        assert!(dep.mock_allowed_for(CommandKind::Plan));
        assert!(!dep.mock_allowed_for(CommandKind::Apply));
        assert_eq!(dep.target_instance(), "vpc");
    }
}
