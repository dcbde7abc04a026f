//! Module rendering.
//!
//! Expands a module's resource templates against one instance's fully
//! resolved inputs. The result lists concrete resource nodes ordered so that
//! every node comes after the nodes it references.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use terrace_spec::graph::{Cycle, Dag};
use terrace_spec::models::{
    Attributes, CollectSpec, ModuleDefinition, ResourceTemplate, Secret, TagSet,
};
use terrace_spec::reference::stringify;
use terrace_spec::schema::type_name;
use terrace_spec::validator::check_inputs;

use crate::error::{IacError, IacResult};
use crate::interpolate::{self, ResourceRef, Scope};

/// Environment facts available to module expressions as `${env.*}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvContext {
    pub name: String,
    pub region: String,
    pub account_id: Option<String>,
}

impl EnvContext {
    pub fn new(name: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            region: region.into(),
            account_id: None,
        }
    }

    pub fn with_account(mut self, account_id: Option<String>) -> Self {
        self.account_id = account_id;
        self
    }
}

/// One concrete resource produced by rendering.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceNode {
    pub address: String,
    pub resource_type: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Attribute values; references to other nodes are still placeholders.
    pub attributes: Attributes,
    pub tags: TagSet,
    /// Addresses this node must be applied after.
    pub depends_on: Vec<String>,
    pub sensitive_attributes: BTreeSet<String>,
}

impl ResourceNode {
    /// Attributes with sensitive values masked.
    pub fn redacted_attributes(&self) -> Attributes {
        redact(&self.attributes, &self.sensitive_attributes)
    }
}

pub(crate) fn redact(attributes: &Attributes, sensitive: &BTreeSet<String>) -> Attributes {
    attributes
        .iter()
        .map(|(k, v)| {
            if sensitive.contains(k) {
                (k.clone(), Value::String(Secret::REDACTED.to_string()))
            } else {
                (k.clone(), v.clone())
            }
        })
        .collect()
}

/// A module output awaiting applied resource attributes.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderedOutput {
    Value(Value),
    Collect(CollectSpec),
}

/// Rendered view of one module instance.
#[derive(Debug, Clone, Serialize)]
pub struct RenderedModule {
    pub module: String,
    pub version: String,
    /// Prerequisites first.
    pub nodes: Vec<ResourceNode>,
    pub outputs: BTreeMap<String, RenderedOutput>,
    pub sensitive_outputs: BTreeSet<String>,
}

impl RenderedModule {
    pub fn node(&self, address: &str) -> Option<&ResourceNode> {
        self.nodes.iter().find(|n| n.address == address)
    }

    pub fn addresses(&self) -> Vec<&str> {
        self.nodes.iter().map(|n| n.address.as_str()).collect()
    }

    /// Compute output values from applied resource attributes, keyed by address.
    pub fn resolve_outputs(&self, applied: &BTreeMap<String, Attributes>) -> IacResult<Attributes> {
        let mut outputs = Attributes::new();
        for (name, output) in &self.outputs {
            let value = match output {
                RenderedOutput::Value(value) => interpolate::resolve_refs(value, &mut |r| {
                    applied.get(&r.address)?.get(&r.attribute).cloned()
                })
                .map_err(|r| IacError::UnresolvedReference {
                    context: format!("output {}", name),
                    reference: r.to_string(),
                })?,
                RenderedOutput::Collect(spec) => self.collect(name, spec, applied)?,
            };
            outputs.insert(name.clone(), value);
        }
        Ok(outputs)
    }

    fn collect(
        &self,
        output: &str,
        spec: &CollectSpec,
        applied: &BTreeMap<String, Attributes>,
    ) -> IacResult<Value> {
        let mut list = Vec::new();
        let mut map = serde_json::Map::new();

        for node in self.nodes.iter().filter(|n| collects(spec, n)) {
            let value = applied
                .get(&node.address)
                .and_then(|attrs| attrs.get(&spec.attribute))
                .cloned()
                .ok_or_else(|| IacError::UnresolvedReference {
                    context: format!("output {}", output),
                    reference: format!("{}.{}", node.address, spec.attribute),
                })?;
            if spec.as_map {
                let key = node.key.clone().unwrap_or_else(|| node.address.clone());
                map.insert(key, value);
            } else {
                list.push(value);
            }
        }

        Ok(if spec.as_map {
            Value::Object(map)
        } else {
            Value::Array(list)
        })
    }
}

fn collects(spec: &CollectSpec, node: &ResourceNode) -> bool {
    node.resource_type == spec.resource_type
        && spec.name.as_ref().map_or(true, |n| *n == node.name)
        && spec
            .name_contains
            .as_ref()
            .map_or(true, |s| node.address.contains(s.as_str()))
}

struct Pending {
    node: ResourceNode,
    refs: BTreeSet<ResourceRef>,
    explicit: Vec<String>,
}

/// Renders one module definition.
pub struct ModuleRenderer<'a> {
    module: &'a ModuleDefinition,
    env: &'a EnvContext,
}

impl<'a> ModuleRenderer<'a> {
    pub fn new(module: &'a ModuleDefinition, env: &'a EnvContext) -> Self {
        Self { module, env }
    }

    /// Render the module for fully resolved `inputs`.
    ///
    /// Inputs are validated against the module schema first; a reference
    /// cycle between templates is a render error.
    pub fn render(
        &self,
        inputs: &Attributes,
        sensitive_inputs: &BTreeSet<String>,
        tags: &TagSet,
    ) -> IacResult<RenderedModule> {
        let module = self.module;
        let mut sensitive = module.sensitive_inputs();
        sensitive.extend(sensitive_inputs.iter().cloned());
        let mut vars = check_inputs(&module.name, module, inputs, &sensitive, false)?;
        for name in module.inputs.keys() {
            vars.entry(name.clone()).or_insert(Value::Null);
        }

        let scope = Scope {
            vars: &vars,
            sensitive_vars: &sensitive,
            env: self.env,
            each: None,
        };

        // template address -> rendered node addresses
        let mut templates: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut keyed: HashSet<String> = HashSet::new();
        let mut pending: Vec<Pending> = Vec::new();

        for template in &module.resources {
            let base = template.address();
            if templates.contains_key(&base) {
                return Err(self.error(format!("resource {} is declared twice", base)));
            }
            if template.for_each.is_some() {
                keyed.insert(base.clone());
            }
            if !self.enabled(template, &scope)? {
                debug!("Skipping disabled resource {} in {}", base, module.name);
                templates.insert(base, Vec::new());
                continue;
            }

            let expansions = match &template.for_each {
                Some(expr) => self.expand(&base, expr, &scope)?,
                None => vec![(None, Value::Null)],
            };

            let mut addresses = Vec::with_capacity(expansions.len());
            for (key, each_value) in &expansions {
                let scoped = match key {
                    Some(k) => scope.with_each(k, each_value),
                    None => scope,
                };
                let rendered = self.render_node(template, key.clone(), &scoped, tags)?;
                addresses.push(rendered.node.address.clone());
                pending.push(rendered);
            }
            templates.insert(base, addresses);
        }

        let known: HashSet<String> = pending.iter().map(|p| p.node.address.clone()).collect();
        let mut dag: Dag<String> = Dag::new();
        for p in &pending {
            dag.add_node(p.node.address.clone());
        }

        let mut edges: Vec<(String, String)> = Vec::new();
        for p in &pending {
            for r in &p.refs {
                self.check_ref(r, &known, &keyed, &p.node.address)?;
                edges.push((p.node.address.clone(), r.address.clone()));
            }
            for target in &p.explicit {
                let Some(addresses) = templates.get(target) else {
                    return Err(self.error(format!(
                        "{} depends on unknown resource {}",
                        p.node.address, target
                    )));
                };
                for address in addresses {
                    edges.push((p.node.address.clone(), address.clone()));
                }
            }
        }
        for (dependent, prerequisite) in &edges {
            dag.add_edge(dependent, prerequisite);
        }

        let order = dag.topological_order().map_err(|Cycle(members)| {
            self.error(format!("resource dependency cycle: {}", members.join(" -> ")))
        })?;

        let mut by_address: BTreeMap<String, ResourceNode> = pending
            .into_iter()
            .map(|p| (p.node.address.clone(), p.node))
            .collect();
        let mut nodes = Vec::with_capacity(order.len());
        for address in order {
            if let Some(mut node) = by_address.remove(&address) {
                node.depends_on = dag.prerequisites(&address).into_iter().cloned().collect();
                nodes.push(node);
            }
        }

        let (outputs, sensitive_outputs) = self.render_outputs(&scope, &known, &keyed, &templates)?;

        debug!(
            "Rendered module {}@{}: {} resource(s), {} output(s)",
            module.name,
            module.version,
            nodes.len(),
            outputs.len()
        );

        Ok(RenderedModule {
            module: module.name.clone(),
            version: module.version.clone(),
            nodes,
            outputs,
            sensitive_outputs,
        })
    }

    fn error(&self, message: impl Into<String>) -> IacError {
        IacError::render(&self.module.name, message)
    }

    fn enabled(&self, template: &ResourceTemplate, scope: &Scope<'_>) -> IacResult<bool> {
        let Some(raw) = &template.enabled else {
            return Ok(true);
        };
        let evaluated = scope
            .evaluate(raw)
            .map_err(|e| self.error(format!("{}: {}", template.address(), e)))?;
        match evaluated.value {
            Value::Bool(b) => Ok(b),
            Value::String(s) if s == "true" => Ok(true),
            Value::String(s) if s == "false" => Ok(false),
            other => Err(self.error(format!(
                "{}: enabled must be a bool, got {}",
                template.address(),
                other
            ))),
        }
    }

    /// Keys and values of a `for_each` expression, sorted by key.
    fn expand(
        &self,
        base: &str,
        expr: &str,
        scope: &Scope<'_>,
    ) -> IacResult<Vec<(Option<String>, Value)>> {
        let evaluated = scope
            .evaluate(&Value::String(expr.to_string()))
            .map_err(|e| self.error(format!("{}: {}", base, e)))?;
        if !evaluated.refs.is_empty() {
            return Err(self.error(format!(
                "{}: for_each cannot depend on resource attributes",
                base
            )));
        }
        // Keys become resource addresses, which are logged and persisted.
        if evaluated.sensitive {
            return Err(self.error(format!(
                "{}: for_each cannot use sensitive values",
                base
            )));
        }

        let mut items: Vec<(String, Value)> = match evaluated.value {
            Value::Object(map) => map.into_iter().collect(),
            Value::Array(values) => {
                let mut items = Vec::with_capacity(values.len());
                for value in values {
                    let Value::String(key) = &value else {
                        return Err(self.error(format!(
                            "{}: for_each lists must contain strings",
                            base
                        )));
                    };
                    items.push((key.clone(), value.clone()));
                }
                items
            }
            Value::Null => Vec::new(),
            other => {
                return Err(self.error(format!(
                    "{}: for_each must be a map or a list of strings, got {}",
                    base,
                    type_name(&other)
                )))
            }
        };
        items.sort_by(|a, b| a.0.cmp(&b.0));

        for pair in items.windows(2) {
            if pair[0].0 == pair[1].0 {
                return Err(self.error(format!("{}: duplicate for_each key '{}'", base, pair[0].0)));
            }
        }
        for (key, _) in &items {
            if key.is_empty() || key.contains(|c| matches!(c, '"' | '[' | ']' | '}')) {
                return Err(self.error(format!("{}: invalid for_each key '{}'", base, key)));
            }
        }

        Ok(items.into_iter().map(|(k, v)| (Some(k), v)).collect())
    }

    fn render_node(
        &self,
        template: &ResourceTemplate,
        key: Option<String>,
        scope: &Scope<'_>,
        instance_tags: &TagSet,
    ) -> IacResult<Pending> {
        let address = interpolate::address(&template.resource_type, &template.name, key.as_deref());
        let fail = |e: String| self.error(format!("{}: {}", address, e));

        let mut attributes = Attributes::new();
        let mut sensitive_attributes = BTreeSet::new();
        let mut refs = BTreeSet::new();
        for (name, raw) in &template.attributes {
            let evaluated = scope.evaluate(raw).map_err(&fail)?;
            if evaluated.sensitive {
                sensitive_attributes.insert(name.clone());
            }
            refs.extend(evaluated.refs);
            attributes.insert(name.clone(), evaluated.value);
        }

        let mut tags = instance_tags.clone();
        for (k, raw) in &template.tags {
            let evaluated = scope
                .evaluate(&Value::String(raw.clone()))
                .map_err(&fail)?;
            if !evaluated.refs.is_empty() {
                return Err(fail(format!("tag {} cannot reference resource attributes", k)));
            }
            tags.insert(k.clone(), stringify(&evaluated.value));
        }

        Ok(Pending {
            node: ResourceNode {
                address,
                resource_type: template.resource_type.clone(),
                name: template.name.clone(),
                key,
                attributes,
                tags,
                depends_on: Vec::new(),
                sensitive_attributes,
            },
            refs,
            explicit: template.depends_on.clone(),
        })
    }

    fn check_ref(
        &self,
        r: &ResourceRef,
        known: &HashSet<String>,
        keyed: &HashSet<String>,
        from: &str,
    ) -> IacResult<()> {
        if known.contains(&r.address) {
            return Ok(());
        }
        if keyed.contains(&r.address) {
            return Err(self.error(format!(
                "{} references {} without a key, but it uses for_each",
                from, r.address
            )));
        }
        Err(self.error(format!("{} references unknown resource {}", from, r.address)))
    }

    fn render_outputs(
        &self,
        scope: &Scope<'_>,
        known: &HashSet<String>,
        keyed: &HashSet<String>,
        templates: &BTreeMap<String, Vec<String>>,
    ) -> IacResult<(BTreeMap<String, RenderedOutput>, BTreeSet<String>)> {
        let mut outputs = BTreeMap::new();
        let mut sensitive = BTreeSet::new();

        for (name, spec) in &self.module.outputs {
            let context = format!("output {}", name);
            let rendered = match (&spec.value, &spec.collect) {
                (Some(raw), _) => {
                    let evaluated = scope
                        .evaluate(raw)
                        .map_err(|e| self.error(format!("{}: {}", context, e)))?;
                    for r in &evaluated.refs {
                        self.check_ref(r, known, keyed, &context)?;
                    }
                    if evaluated.sensitive {
                        sensitive.insert(name.clone());
                    }
                    RenderedOutput::Value(evaluated.value)
                }
                (None, Some(collect)) => {
                    let prefix = format!("{}.", collect.resource_type);
                    let declared = templates.keys().any(|t| match &collect.name {
                        Some(n) => *t == format!("{}{}", prefix, n),
                        None => t.starts_with(&prefix),
                    });
                    if !declared {
                        return Err(self.error(format!(
                            "{} collects from undeclared resource type {}",
                            context, collect.resource_type
                        )));
                    }
                    RenderedOutput::Collect(collect.clone())
                }
                (None, None) => {
                    return Err(self.error(format!("{} has neither value nor collect", context)))
                }
            };
            if spec.sensitive {
                sensitive.insert(name.clone());
            }
            outputs.insert(name.clone(), rendered);
        }

        Ok((outputs, sensitive))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use terrace_spec::models::{FieldSpec, FieldType, OutputSpec};

    fn template(rtype: &str, name: &str, attributes: Value) -> ResourceTemplate {
        ResourceTemplate {
            resource_type: rtype.to_string(),
            name: name.to_string(),
            for_each: None,
            enabled: None,
            attributes: attributes
                .as_object()
                .unwrap()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            tags: BTreeMap::new(),
            depends_on: Vec::new(),
        }
    }

    fn output(value: Value) -> OutputSpec {
        OutputSpec {
            description: None,
            value: Some(value),
            collect: None,
            sensitive: false,
        }
    }

    fn vpc_module() -> ModuleDefinition {
        let mut subnet = template(
            "aws_subnet",
            "private",
            json!({
                "vpc_id": "${resource.aws_vpc.main.id}",
                "cidr_block": "${each.value}",
                "availability_zone": "${env.region}${each.key}"
            }),
        );
        subnet.for_each = Some("${var.private_subnets}".to_string());
        subnet.tags.insert("Name".to_string(), "${env.name}-private-${each.key}".to_string());

        let mut nat = template("aws_nat_gateway", "main", json!({"subnet_id": "x"}));
        nat.enabled = Some(json!("${var.enable_nat}"));

        ModuleDefinition::new("vpc")
            .input("cidr", FieldSpec::new(FieldType::String))
            .input(
                "private_subnets",
                FieldSpec::new(FieldType::Map {
                    values: Box::new(FieldType::String),
                }),
            )
            .input(
                "enable_nat",
                FieldSpec::new(FieldType::Bool).with_default(json!(false)),
            )
            // Declared before the VPC it references.
            .resource(subnet)
            .resource(template("aws_vpc", "main", json!({"cidr_block": "${var.cidr}"})))
            .resource(nat)
            .output("vpc_id", output(json!("${resource.aws_vpc.main.id}")))
            .output(
                "private_subnet_ids",
                OutputSpec {
                    description: None,
                    value: None,
                    collect: Some(CollectSpec {
                        resource_type: "aws_subnet".to_string(),
                        name: Some("private".to_string()),
                        attribute: "id".to_string(),
                        name_contains: None,
                        as_map: false,
                    }),
                    sensitive: false,
                },
            )
    }

    fn inputs(value: Value) -> Attributes {
        value
            .as_object()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    #[test]
    fn test_render_orders_and_expands() {
        let module = vpc_module();
        let env = EnvContext::new("qa", "us-east-1");
        let tags = TagSet::new().with("Environment", "qa");
        let rendered = ModuleRenderer::new(&module, &env)
            .render(
                &inputs(json!({
                    "cidr": "10.0.0.0/16",
                    "private_subnets": {"b": "10.0.2.0/24", "a": "10.0.1.0/24"}
                })),
                &BTreeSet::new(),
                &tags,
            )
            .unwrap();

        assert_eq!(
            rendered.addresses(),
            vec![
                "aws_vpc.main",
                "aws_subnet.private[\"a\"]",
                "aws_subnet.private[\"b\"]"
            ]
        );
        let a = rendered.node("aws_subnet.private[\"a\"]").unwrap();
        assert_eq!(a.attributes["availability_zone"], json!("us-east-1a"));
        assert_eq!(a.attributes["cidr_block"], json!("10.0.1.0/24"));
        assert_eq!(a.tags.get("Name"), Some("qa-private-a"));
        assert_eq!(a.tags.get("Environment"), Some("qa"));
        assert_eq!(a.depends_on, vec!["aws_vpc.main"]);

        let applied: BTreeMap<String, Attributes> = [
            ("aws_vpc.main", "vpc-1"),
            ("aws_subnet.private[\"a\"]", "subnet-a"),
            ("aws_subnet.private[\"b\"]", "subnet-b"),
        ]
        .into_iter()
        .map(|(addr, id)| (addr.to_string(), inputs(json!({ "id": id }))))
        .collect();
        let outputs = rendered.resolve_outputs(&applied).unwrap();
        assert_eq!(outputs["vpc_id"], json!("vpc-1"));
        assert_eq!(outputs["private_subnet_ids"], json!(["subnet-a", "subnet-b"]));
    }

    #[test]
    fn test_render_is_deterministic() {
        let module = vpc_module();
        let env = EnvContext::new("qa", "us-east-1");
        let input = inputs(json!({
            "cidr": "10.0.0.0/16",
            "private_subnets": {"b": "10.0.2.0/24", "a": "10.0.1.0/24"},
            "enable_nat": "true"
        }));
        let renderer = ModuleRenderer::new(&module, &env);
        let first = renderer.render(&input, &BTreeSet::new(), &TagSet::new()).unwrap();
        let second = renderer.render(&input, &BTreeSet::new(), &TagSet::new()).unwrap();
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
        assert!(first.node("aws_nat_gateway.main").is_some());
    }

    #[test]
    fn test_intra_module_cycle_is_a_render_error() {
        let module = ModuleDefinition::new("loop")
            .resource(template("aws_a", "x", json!({"peer": "${resource.aws_b.y.id}"})))
            .resource(template("aws_b", "y", json!({"peer": "${resource.aws_a.x.id}"})));
        let env = EnvContext::new("qa", "us-east-1");
        let err = ModuleRenderer::new(&module, &env)
            .render(&Attributes::new(), &BTreeSet::new(), &TagSet::new())
            .unwrap_err();
        assert!(err.to_string().contains("cycle"), "{}", err);
    }

    #[test]
    fn test_schema_errors_surface_before_rendering() {
        let module = vpc_module();
        let env = EnvContext::new("qa", "us-east-1");
        let err = ModuleRenderer::new(&module, &env)
            .render(&inputs(json!({"cidr": 42})), &BTreeSet::new(), &TagSet::new())
            .unwrap_err();
        assert!(matches!(
            err,
            IacError::Spec(terrace_spec::SpecError::Schema { .. })
        ));
    }

    #[test]
    fn test_keyed_reference_without_key_is_rejected() {
        let mut subnet = template("aws_subnet", "s", json!({}));
        subnet.for_each = Some("${var.zones}".to_string());
        let module = ModuleDefinition::new("bad")
            .input(
                "zones",
                FieldSpec::new(FieldType::List {
                    items: Box::new(FieldType::String),
                }),
            )
            .resource(subnet)
            .resource(template("aws_route", "r", json!({"subnet": "${resource.aws_subnet.s.id}"})));
        let env = EnvContext::new("qa", "us-east-1");
        let err = ModuleRenderer::new(&module, &env)
            .render(&inputs(json!({"zones": ["a"]})), &BTreeSet::new(), &TagSet::new())
            .unwrap_err();
        assert!(err.to_string().contains("without a key"), "{}", err);
    }

    #[test]
    fn test_sensitive_attributes_are_redacted() {
        let module = ModuleDefinition::new("db")
            .input("password", FieldSpec::new(FieldType::String).sensitive())
            .resource(template(
                "aws_db_instance",
                "main",
                json!({"password": "${var.password}", "engine": "postgres"}),
            ))
            .output("password", output(json!("${var.password}")));
        let env = EnvContext::new("qa", "us-east-1");
        let rendered = ModuleRenderer::new(&module, &env)
            .render(
                &inputs(json!({"password": "hunter2"})),
                &BTreeSet::new(),
                &TagSet::new(),
            )
            .unwrap();
        let node = rendered.node("aws_db_instance.main").unwrap();
        assert_eq!(node.redacted_attributes()["password"], json!("<sensitive>"));
        assert_eq!(node.redacted_attributes()["engine"], json!("postgres"));
        assert!(rendered.sensitive_outputs.contains("password"));
    }

    #[test]
    fn test_render_errors_mask_secret_inputs() {
        let module = ModuleDefinition::new("db")
            .input("port", FieldSpec::new(FieldType::Number))
            .resource(template("aws_db_instance", "main", json!({"port": "${var.port}"})));
        let env = EnvContext::new("qa", "us-east-1");
        let secret: BTreeSet<String> = ["port".to_string()].into_iter().collect();
        let err = ModuleRenderer::new(&module, &env)
            .render(&inputs(json!({"port": "hunter2"})), &secret, &TagSet::new())
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("port"), "{}", message);
        assert!(!message.contains("hunter2"), "{}", message);
    }

    #[test]
    fn test_for_each_rejects_sensitive_collections() {
        let mut user = template("aws_iam_user", "u", json!({"name": "${each.key}"}));
        user.for_each = Some("${var.users}".to_string());
        let module = ModuleDefinition::new("iam")
            .input(
                "users",
                FieldSpec::new(FieldType::List {
                    items: Box::new(FieldType::String),
                })
                .sensitive(),
            )
            .resource(user);
        let env = EnvContext::new("qa", "us-east-1");
        let err = ModuleRenderer::new(&module, &env)
            .render(
                &inputs(json!({"users": ["alice-secret-handle"]})),
                &BTreeSet::new(),
                &TagSet::new(),
            )
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("sensitive"), "{}", message);
        assert!(!message.contains("alice-secret-handle"), "{}", message);
    }
}

