//! Per-instance plan, apply and destroy.
//!
//! Nodes are applied one at a time in rendered order. Each node's resource
//! placeholders resolve against attributes of nodes applied before it, so a
//! failure leaves a well-defined set of resources worth persisting.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info, warn};

use terrace_spec::models::{Attributes, InstanceId};

use crate::error::{IacError, IacResult};
use crate::interpolate::{resolve_refs, ResourceRef};
use crate::provider::{ChangeAction, PlanSummary, ProvisioningBackend, ResourceChange, ResourceRequest};
use crate::renderer::{RenderedModule, ResourceNode};
use crate::state::{ResourceState, StateRecord};

/// Result of a fully successful apply.
#[derive(Debug, Clone)]
pub struct ApplyOutcome {
    /// Every resource now existing, in apply order.
    pub resources: Vec<ResourceState>,
    pub outputs: Attributes,
    pub summary: PlanSummary,
}

/// An apply or destroy that stopped part-way.
#[derive(Debug)]
pub struct PartialApply {
    /// Resources known to exist after the failure.
    pub resources: Vec<ResourceState>,
    pub summary: PlanSummary,
    pub error: IacError,
}

fn resolve_attributes(
    attributes: &Attributes,
    applied: &BTreeMap<String, Attributes>,
) -> Result<Attributes, ResourceRef> {
    let mut lookup = |r: &ResourceRef| applied.get(&r.address)?.get(&r.attribute).cloned();
    attributes
        .iter()
        .map(|(k, v)| Ok((k.clone(), resolve_refs(v, &mut lookup)?)))
        .collect()
}

fn changed_attributes(node: &ResourceNode, desired: &Attributes, prior: &ResourceState) -> Vec<String> {
    let mut changed: Vec<String> = desired
        .keys()
        .chain(prior.inputs.keys())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .filter(|k| desired.get(*k) != prior.inputs.get(*k))
        .cloned()
        .collect();
    if node.tags != prior.tags {
        changed.push("tags".to_string());
    }
    changed
}

/// Drives one rendered module against a provisioning backend.
pub struct ModuleApplier<'a> {
    backend: &'a dyn ProvisioningBackend,
    instance: &'a InstanceId,
}

impl<'a> ModuleApplier<'a> {
    pub fn new(backend: &'a dyn ProvisioningBackend, instance: &'a InstanceId) -> Self {
        Self { backend, instance }
    }

    /// Diff the rendered module against prior state without touching anything.
    pub fn plan(rendered: &RenderedModule, prior: Option<&StateRecord>) -> PlanSummary {
        let known = prior.map(StateRecord::applied_attributes).unwrap_or_default();
        let mut summary = PlanSummary::default();

        for node in &rendered.nodes {
            let existing = prior.and_then(|p| p.resource(&node.address));
            let (action, changed) = match existing {
                None => (ChangeAction::Create, Vec::new()),
                Some(prior_resource) => match resolve_attributes(&node.attributes, &known) {
                    Ok(desired) => {
                        let changed = changed_attributes(node, &desired, prior_resource);
                        if changed.is_empty() {
                            (ChangeAction::NoOp, changed)
                        } else {
                            (ChangeAction::Update, changed)
                        }
                    }
                    // Depends on a resource that does not exist yet.
                    Err(r) => (ChangeAction::Update, vec![format!("(known after apply: {})", r)]),
                },
            };
            summary.changes.push(ResourceChange {
                address: node.address.clone(),
                resource_type: node.resource_type.clone(),
                action,
                changed_attributes: changed,
            });
        }

        if let Some(prior) = prior {
            for resource in prior.resources.iter().rev() {
                if rendered.node(&resource.address).is_none() {
                    summary.changes.push(ResourceChange {
                        address: resource.address.clone(),
                        resource_type: resource.resource_type.clone(),
                        action: ChangeAction::Delete,
                        changed_attributes: Vec::new(),
                    });
                }
            }
        }

        summary
    }

    /// [`plan`](Self::plan), then have the backend check every create and
    /// update. Nothing is mutated.
    pub async fn preview(
        &self,
        rendered: &RenderedModule,
        prior: Option<&StateRecord>,
    ) -> IacResult<PlanSummary> {
        let summary = Self::plan(rendered, prior);
        let known = prior.map(StateRecord::applied_attributes).unwrap_or_default();
        let mut lookup = |r: &ResourceRef| known.get(&r.address)?.get(&r.attribute).cloned();

        for change in &summary.changes {
            if !matches!(change.action, ChangeAction::Create | ChangeAction::Update) {
                continue;
            }
            let Some(node) = rendered.node(&change.address) else {
                continue;
            };
            // Unknown values stay as placeholders.
            let attributes = node
                .attributes
                .iter()
                .map(|(k, v)| {
                    let value = resolve_refs(v, &mut lookup).unwrap_or_else(|_| v.clone());
                    (k.clone(), value)
                })
                .collect();
            let request = ResourceRequest {
                instance: self.instance.clone(),
                address: node.address.clone(),
                resource_type: node.resource_type.clone(),
                attributes,
                tags: node.tags.clone(),
                prior: prior
                    .and_then(|p| p.resource(&node.address))
                    .map(|r| r.attributes.clone()),
            };
            self.backend.plan_resource(&request).await?;
        }

        Ok(summary)
    }

    /// Apply every node, then remove resources no longer rendered.
    pub async fn apply(
        &self,
        rendered: &RenderedModule,
        prior: Option<&StateRecord>,
    ) -> Result<ApplyOutcome, PartialApply> {
        let mut applied: BTreeMap<String, Attributes> = BTreeMap::new();
        let mut resources: Vec<ResourceState> = Vec::new();
        let mut summary = PlanSummary::default();

        for node in &rendered.nodes {
            let desired = match resolve_attributes(&node.attributes, &applied) {
                Ok(desired) => desired,
                Err(r) => {
                    let error = IacError::UnresolvedReference {
                        context: node.address.clone(),
                        reference: r.to_string(),
                    };
                    return Err(self.partial(resources, summary, prior, error));
                }
            };
            let existing = prior.and_then(|p| p.resource(&node.address));

            if let Some(current) = existing {
                if changed_attributes(node, &desired, current).is_empty() {
                    debug!("{}: {} unchanged", self.instance, node.address);
                    applied.insert(node.address.clone(), current.attributes.clone());
                    resources.push(current.clone());
                    summary.changes.push(change(node, ChangeAction::NoOp, Vec::new()));
                    continue;
                }
            }

            let (action, changed) = match existing {
                Some(current) => (
                    ChangeAction::Update,
                    changed_attributes(node, &desired, current),
                ),
                None => (ChangeAction::Create, Vec::new()),
            };
            info!(
                "{}: {} {} via {}",
                self.instance,
                action_verb(action),
                node.address,
                self.backend.name()
            );

            let request = ResourceRequest {
                instance: self.instance.clone(),
                address: node.address.clone(),
                resource_type: node.resource_type.clone(),
                attributes: desired.clone(),
                tags: node.tags.clone(),
                prior: existing.map(|r| r.attributes.clone()),
            };
            match self.backend.apply_resource(&request).await {
                Ok(attributes) => {
                    applied.insert(node.address.clone(), attributes.clone());
                    resources.push(ResourceState {
                        address: node.address.clone(),
                        resource_type: node.resource_type.clone(),
                        inputs: desired,
                        attributes,
                        tags: node.tags.clone(),
                        sensitive_attributes: node.sensitive_attributes.clone(),
                    });
                    summary.changes.push(change(node, action, changed));
                }
                Err(e) => {
                    warn!("{}: {} failed: {}", self.instance, node.address, e);
                    let error = IacError::Apply {
                        address: node.address.clone(),
                        message: e.to_string(),
                    };
                    return Err(self.partial(resources, summary, prior, error));
                }
            }
        }

        if let Some(prior) = prior {
            let removed: Vec<&ResourceState> = prior
                .resources
                .iter()
                .rev()
                .filter(|r| rendered.node(&r.address).is_none())
                .collect();
            for (i, resource) in removed.iter().enumerate() {
                info!("{}: destroying {}", self.instance, resource.address);
                if let Err(e) = self.backend.destroy_resource(self.instance, resource).await {
                    resources.extend(removed[i..].iter().map(|r| (*r).clone()));
                    let error = IacError::Destroy {
                        address: resource.address.clone(),
                        message: e.to_string(),
                    };
                    return Err(PartialApply {
                        resources,
                        summary,
                        error,
                    });
                }
                summary.changes.push(ResourceChange {
                    address: resource.address.clone(),
                    resource_type: resource.resource_type.clone(),
                    action: ChangeAction::Delete,
                    changed_attributes: Vec::new(),
                });
            }
        }

        match rendered.resolve_outputs(&applied) {
            Ok(outputs) => Ok(ApplyOutcome {
                resources,
                outputs,
                summary,
            }),
            Err(error) => Err(PartialApply {
                resources,
                summary,
                error,
            }),
        }
    }

    /// Destroy every resource in `prior`, dependents first.
    pub async fn destroy(&self, prior: &StateRecord) -> Result<PlanSummary, PartialApply> {
        let mut summary = PlanSummary::default();
        let total = prior.resources.len();

        for (done, resource) in prior.resources.iter().rev().enumerate() {
            info!("{}: destroying {}", self.instance, resource.address);
            if let Err(e) = self.backend.destroy_resource(self.instance, resource).await {
                warn!("{}: destroy of {} failed: {}", self.instance, resource.address, e);
                return Err(PartialApply {
                    resources: prior.resources[..total - done].to_vec(),
                    summary,
                    error: IacError::Destroy {
                        address: resource.address.clone(),
                        message: e.to_string(),
                    },
                });
            }
            summary.changes.push(ResourceChange {
                address: resource.address.clone(),
                resource_type: resource.resource_type.clone(),
                action: ChangeAction::Delete,
                changed_attributes: Vec::new(),
            });
        }

        Ok(summary)
    }

    /// Applied resources plus every prior resource not yet touched.
    fn partial(
        &self,
        mut resources: Vec<ResourceState>,
        summary: PlanSummary,
        prior: Option<&StateRecord>,
        error: IacError,
    ) -> PartialApply {
        if let Some(prior) = prior {
            for resource in &prior.resources {
                if !resources.iter().any(|r| r.address == resource.address) {
                    resources.push(resource.clone());
                }
            }
        }
        PartialApply {
            resources,
            summary,
            error,
        }
    }
}

fn change(node: &ResourceNode, action: ChangeAction, changed: Vec<String>) -> ResourceChange {
    ResourceChange {
        address: node.address.clone(),
        resource_type: node.resource_type.clone(),
        action,
        changed_attributes: changed,
    }
}

fn action_verb(action: ChangeAction) -> &'static str {
    match action {
        ChangeAction::Create => "creating",
        ChangeAction::Update => "updating",
        ChangeAction::Delete => "destroying",
        ChangeAction::NoOp => "keeping",
    }
}
