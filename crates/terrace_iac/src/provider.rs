//! Provisioning backend abstraction and plan types.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use terrace_spec::models::{Attributes, InstanceId, TagSet};

use crate::error::IacResult;
use crate::state::ResourceState;

/// What applying a node would do to its resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeAction {
    Create,
    Update,
    Delete,
    NoOp,
}

impl ChangeAction {
    pub fn symbol(&self) -> &'static str {
        match self {
            Self::Create => "+",
            Self::Update => "~",
            Self::Delete => "-",
            Self::NoOp => " ",
        }
    }
}

/// One planned resource change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceChange {
    pub address: String,
    pub resource_type: String,
    pub action: ChangeAction,
    /// Attributes that differ from state, empty for creates and deletes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changed_attributes: Vec<String>,
}

/// Planned changes for one instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanSummary {
    pub changes: Vec<ResourceChange>,
}

impl PlanSummary {
    pub fn count(&self, action: ChangeAction) -> usize {
        self.changes.iter().filter(|c| c.action == action).count()
    }

    pub fn has_changes(&self) -> bool {
        self.changes.iter().any(|c| c.action != ChangeAction::NoOp)
    }

    pub fn extend(&mut self, other: PlanSummary) {
        self.changes.extend(other.changes);
    }
}

impl fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Plan: {} to add, {} to change, {} to destroy.",
            self.count(ChangeAction::Create),
            self.count(ChangeAction::Update),
            self.count(ChangeAction::Delete)
        )
    }
}

/// A fully resolved resource handed to a backend.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceRequest {
    pub instance: InstanceId,
    pub address: String,
    pub resource_type: String,
    pub attributes: Attributes,
    pub tags: TagSet,
    /// Attributes from state when the resource already exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prior: Option<Attributes>,
}

/// Performs resource operations against real infrastructure.
///
/// `apply_resource` creates or updates a resource and returns its full
/// attribute set, computed attributes such as `id` included.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProvisioningBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Check a planned create or update without performing it. Attributes
    /// only known after apply are still `${resource...}` placeholders.
    async fn plan_resource(&self, _request: &ResourceRequest) -> IacResult<()> {
        Ok(())
    }

    async fn apply_resource(&self, request: &ResourceRequest) -> IacResult<Attributes>;

    async fn destroy_resource(
        &self,
        instance: &InstanceId,
        resource: &ResourceState,
    ) -> IacResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(address: &str, action: ChangeAction) -> ResourceChange {
        ResourceChange {
            address: address.to_string(),
            resource_type: "aws_vpc".to_string(),
            action,
            changed_attributes: Vec::new(),
        }
    }

    #[test]
    fn test_plan_summary_display() {
        let mut plan = PlanSummary {
            changes: vec![
                change("aws_vpc.a", ChangeAction::Create),
                change("aws_vpc.b", ChangeAction::NoOp),
            ],
        };
        plan.extend(PlanSummary {
            changes: vec![
                change("aws_vpc.c", ChangeAction::Update),
                change("aws_vpc.d", ChangeAction::Delete),
                change("aws_vpc.e", ChangeAction::Create),
            ],
        });
        assert_eq!(plan.to_string(), "Plan: 2 to add, 1 to change, 1 to destroy.");
        assert!(plan.has_changes());
        assert!(!PlanSummary::default().has_changes());
    }
}
