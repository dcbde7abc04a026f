//! Dependency resolution between module instances.
//!
//! Builds the instance graph of a composed environment from declared
//! dependencies, computes a reproducible apply order and substitutes
//! dependency outputs (real or mocked) into instance inputs.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde_json::Value;
use tracing::{debug, warn};

use terrace_iac::StateRecord;
use terrace_spec::graph::{Cycle, Dag};
use terrace_spec::models::{Attributes, CommandKind};
use terrace_spec::reference::{self, DependencyRef};
use terrace_spec::{ComposedEnvironment, ResolvedInstance};

use crate::error::{CoreError, CoreResult};

/// Instance dependency graph of one environment.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    dag: Dag<String>,
    order: Vec<String>,
}

impl DependencyGraph {
    /// Build the graph and its order.
    ///
    /// Fails on dependencies pointing at unknown instances, references to
    /// undeclared dependency aliases and cycles. Never yields a partial order.
    pub fn build(env: &ComposedEnvironment) -> CoreResult<Self> {
        let mut instances: Vec<&ResolvedInstance> = env.instances.iter().collect();
        instances.sort_by_key(|i| i.declaration_index);

        let mut dag = Dag::new();
        for instance in &instances {
            dag.add_node(instance.name().to_string());
        }

        for instance in &instances {
            let name = instance.name().to_string();
            for dep in &instance.dependencies {
                let target = dep.target_instance().to_string();
                if !dag.add_edge(&name, &target) {
                    return Err(CoreError::UnknownDependency {
                        instance: name,
                        target,
                    });
                }
            }
            for value in instance.inputs.values() {
                for r in reference::find_references(value) {
                    if instance.dependency(&r.dependency).is_none() {
                        return Err(CoreError::UndeclaredDependency {
                            instance: name,
                            reference: r.to_string(),
                        });
                    }
                }
            }
        }

        let order = dag
            .topological_order()
            .map_err(|Cycle(members)| CoreError::Cycle { members })?;
        debug!("Instance order for {}: {}", env.name, order.join(", "));
        Ok(Self { dag, order })
    }

    /// Graph of instances known only from their state records, using the
    /// dependencies each record captured at apply time. Edges to instances
    /// outside `records` are ignored.
    pub fn from_state(records: &[StateRecord]) -> CoreResult<Self> {
        let mut dag = Dag::new();
        for record in records {
            dag.add_node(record.instance.name.clone());
        }
        for record in records {
            for target in &record.depends_on {
                if !dag.add_edge(&record.instance.name, target) {
                    debug!(
                        "{} depended on {}, which has no state here",
                        record.instance, target
                    );
                }
            }
        }

        let order = dag
            .topological_order()
            .map_err(|Cycle(members)| CoreError::Cycle { members })?;
        Ok(Self { dag, order })
    }

    /// Every instance, prerequisites first, ties broken by declaration order.
    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn contains(&self, name: &str) -> bool {
        self.dag.contains(&name.to_string())
    }

    /// Instances `name` depends on directly.
    pub fn prerequisites(&self, name: &str) -> Vec<String> {
        self.dag
            .prerequisites(&name.to_string())
            .into_iter()
            .cloned()
            .collect()
    }

    /// Instances depending on `name` directly.
    pub fn dependents(&self, name: &str) -> Vec<String> {
        self.dag
            .dependents(&name.to_string())
            .into_iter()
            .cloned()
            .collect()
    }

    /// Instances a run of `command` on `targets` touches, in execution order.
    ///
    /// No targets selects everything. Otherwise apply, plan and validate
    /// pull in transitive prerequisites and destroy pulls in transitive
    /// dependents, unless `include_dependencies` is off. Destroy order is
    /// the reverse of apply order.
    pub fn select(
        &self,
        targets: &[String],
        command: CommandKind,
        include_dependencies: bool,
    ) -> CoreResult<Vec<String>> {
        let selected: HashSet<&String> = if targets.is_empty() {
            self.order.iter().collect()
        } else {
            let mut selected = HashSet::new();
            for target in targets {
                let Some(node) = self.order.iter().find(|n| *n == target) else {
                    return Err(CoreError::UnknownInstance(target.clone()));
                };
                selected.insert(node);
                if include_dependencies {
                    let related = if command == CommandKind::Destroy {
                        self.dag.transitive_dependents(node)
                    } else {
                        self.dag.transitive_prerequisites(node)
                    };
                    selected.extend(related);
                }
            }
            selected
        };

        let mut order: Vec<String> = self
            .order
            .iter()
            .filter(|n| selected.contains(n))
            .cloned()
            .collect();
        if command == CommandKind::Destroy {
            order.reverse();
        }
        Ok(order)
    }

    /// Instances in `run` that must finish before `name` starts.
    pub fn blockers(&self, name: &str, command: CommandKind, run: &[String]) -> Vec<String> {
        let related = if command == CommandKind::Destroy {
            self.dependents(name)
        } else {
            self.prerequisites(name)
        };
        related.into_iter().filter(|r| run.contains(r)).collect()
    }
}

/// Outputs of one instance as seen by its dependents.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstanceOutputs {
    pub values: Attributes,
    pub sensitive: BTreeSet<String>,
}

impl From<&StateRecord> for InstanceOutputs {
    fn from(record: &StateRecord) -> Self {
        Self {
            values: record.outputs.clone(),
            sensitive: record.sensitive_outputs.clone(),
        }
    }
}

/// Inputs of one instance with every dependency reference replaced.
#[derive(Debug, Clone, Default)]
pub struct InputResolution {
    /// Effective inputs, secrets included.
    pub inputs: Attributes,
    /// Inputs that received a sensitive dependency output.
    pub sensitive: BTreeSet<String>,
    /// References satisfied by mock outputs.
    pub mocked: Vec<DependencyRef>,
}

/// Substitute dependency outputs into `instance`'s inputs.
///
/// `outputs` holds known outputs keyed by instance name. Real outputs
/// always win over mocks; a mock is used only when the dependency allows
/// it for `command`. Apply never uses mocks: a reference only a mock could
/// satisfy fails with `MockUsedInApply`.
pub fn resolve_inputs(
    instance: &ResolvedInstance,
    command: CommandKind,
    outputs: &BTreeMap<String, InstanceOutputs>,
) -> CoreResult<InputResolution> {
    let mut resolution = InputResolution::default();
    let mut refused_mock: Option<DependencyRef> = None;

    for (input, value) in instance.effective_inputs() {
        let mut sensitive = false;
        let mut lookup = |r: &DependencyRef| -> Option<Value> {
            let dep = instance.dependency(&r.dependency)?;
            if let Some(real) = outputs.get(dep.target_instance()) {
                if let Some(value) = real.values.get(&r.output) {
                    sensitive |= real.sensitive.contains(&r.output);
                    return Some(value.clone());
                }
            }
            let mock = dep.mock_outputs.get(&r.output)?;
            if dep.mock_allowed_for(command) {
                resolution.mocked.push(r.clone());
                Some(mock.clone())
            } else {
                refused_mock = Some(r.clone());
                None
            }
        };

        match reference::substitute(&value, &mut lookup) {
            Ok(resolved) => {
                if sensitive {
                    resolution.sensitive.insert(input.clone());
                }
                resolution.inputs.insert(input, resolved);
            }
            Err(missing) => {
                if refused_mock.as_ref() == Some(&missing) && command == CommandKind::Apply {
                    warn!("{}: refusing mock for {} during apply", instance.id, missing);
                    return Err(CoreError::MockUsedInApply {
                        instance: instance.name().to_string(),
                        dependency: missing.dependency,
                        output: missing.output,
                    });
                }
                return Err(CoreError::UnresolvedOutput {
                    instance: instance.name().to_string(),
                    reference: missing.to_string(),
                });
            }
        }
    }

    resolution.mocked.sort();
    resolution.mocked.dedup();
    if !resolution.mocked.is_empty() {
        debug!(
            "{}: using {} mock output(s) for {}",
            instance.id,
            resolution.mocked.len(),
            command
        );
    }
    Ok(resolution)
}
