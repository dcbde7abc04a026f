//! Mock provisioning backend for testing and dry simulations.
//!
//! Provides a configurable implementation of [`ProvisioningBackend`] that
//! records every call, keeps an in-memory inventory of live resources and
//! fabricates deterministic computed attributes.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::debug;

use terrace_spec::models::{Attributes, InstanceId};

use crate::error::{IacError, IacResult};
use crate::provider::{ProvisioningBackend, ResourceRequest};
use crate::state::ResourceState;

/// Captured call information for verification.
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedCall {
    pub method: String,
    pub instance: String,
    pub address: String,
}

/// Mock provisioning backend.
#[derive(Clone, Default)]
pub struct MockBackend {
    /// Captured calls for verification.
    captured_calls: Arc<RwLock<Vec<CapturedCall>>>,
    /// Live resources keyed by (instance, address).
    live: Arc<RwLock<BTreeMap<(String, String), Attributes>>>,
    failing_instances: Arc<RwLock<HashSet<String>>>,
    failing_resources: Arc<RwLock<HashSet<String>>>,
    delay: Arc<RwLock<Option<Duration>>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every operation on resources of this instance name.
    pub fn fail_on_instance(self, name: impl Into<String>) -> Self {
        self.failing_instances.write().insert(name.into());
        self
    }

    /// Fail every operation on resources with this address.
    pub fn fail_on_resource(self, address: impl Into<String>) -> Self {
        self.failing_resources.write().insert(address.into());
        self
    }

    /// Sleep this long inside every operation.
    pub fn with_delay(self, delay: Duration) -> Self {
        *self.delay.write() = Some(delay);
        self
    }

    /// Stop failing operations for `name`.
    pub fn heal_instance(&self, name: &str) {
        self.failing_instances.write().remove(name);
    }

    /// Get all captured calls.
    pub fn get_calls(&self) -> Vec<CapturedCall> {
        self.captured_calls.read().clone()
    }

    /// Get calls to a specific method.
    pub fn get_method_calls(&self, method: &str) -> Vec<CapturedCall> {
        self.captured_calls
            .read()
            .iter()
            .filter(|c| c.method == method)
            .cloned()
            .collect()
    }

    pub fn call_count(&self) -> usize {
        self.captured_calls.read().len()
    }

    /// Instances touched by `apply` calls, in first-call order.
    pub fn applied_instances(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for call in self.get_method_calls("apply") {
            if !seen.contains(&call.instance) {
                seen.push(call.instance);
            }
        }
        seen
    }

    pub fn was_destroyed(&self, address: &str) -> bool {
        self.captured_calls
            .read()
            .iter()
            .any(|c| c.method == "destroy" && c.address == address)
    }

    /// Live resources as `instance/address`.
    pub fn live_resources(&self) -> Vec<String> {
        self.live
            .read()
            .keys()
            .map(|(instance, address)| format!("{}/{}", instance, address))
            .collect()
    }

    /// Highest number of operations observed running at once.
    pub fn max_concurrency(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn record_call(&self, method: &str, instance: &InstanceId, address: &str) {
        self.captured_calls.write().push(CapturedCall {
            method: method.to_string(),
            instance: instance.name.clone(),
            address: address.to_string(),
        });
    }

    fn check_failure(&self, instance: &InstanceId, address: &str) -> IacResult<()> {
        if self.failing_instances.read().contains(&instance.name)
            || self.failing_resources.read().contains(address)
        {
            return Err(IacError::Provisioner(format!(
                "simulated failure for {}/{}",
                instance.name, address
            )));
        }
        Ok(())
    }

    async fn enter(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let delay = *self.delay.read();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn leave(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// FNV-1a, enough for stable fake identifiers.
fn fingerprint(text: &str) -> u64 {
    text.bytes().fold(0xcbf2_9ce4_8422_2325, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(0x0100_0000_01b3)
    })
}

fn fake_id(request: &ResourceRequest) -> String {
    let kind = request
        .resource_type
        .strip_prefix("aws_")
        .unwrap_or(&request.resource_type)
        .replace('_', "-");
    let seed = format!("{}/{}", request.instance, request.address);
    format!("{}-{:016x}", kind, fingerprint(&seed))
}

#[async_trait]
impl ProvisioningBackend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    async fn plan_resource(&self, request: &ResourceRequest) -> IacResult<()> {
        self.record_call("plan", &request.instance, &request.address);
        Ok(())
    }

    async fn apply_resource(&self, request: &ResourceRequest) -> IacResult<Attributes> {
        self.record_call("apply", &request.instance, &request.address);
        self.enter().await;
        let result = self.check_failure(&request.instance, &request.address);
        self.leave();
        result?;

        let id = request
            .prior
            .as_ref()
            .and_then(|p| p.get("id"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| fake_id(request));

        let mut attributes = request.attributes.clone();
        attributes.insert(
            "arn".to_string(),
            Value::String(format!(
                "arn:mock:{}:{}:{}",
                request.instance.region, request.resource_type, id
            )),
        );
        attributes.insert("id".to_string(), Value::String(id));

        debug!("mock: applied {}/{}", request.instance, request.address);
        self.live.write().insert(
            (request.instance.name.clone(), request.address.clone()),
            attributes.clone(),
        );
        Ok(attributes)
    }

    async fn destroy_resource(
        &self,
        instance: &InstanceId,
        resource: &ResourceState,
    ) -> IacResult<()> {
        self.record_call("destroy", instance, &resource.address);
        self.enter().await;
        let result = self.check_failure(instance, &resource.address);
        self.leave();
        result?;

        self.live
            .write()
            .remove(&(instance.name.clone(), resource.address.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use terrace_spec::models::TagSet;

    fn request(address: &str) -> ResourceRequest {
        ResourceRequest {
            instance: InstanceId::new("qa", "us-east-1", "vpc"),
            address: address.to_string(),
            resource_type: "aws_vpc".to_string(),
            attributes: [("cidr_block".to_string(), json!("10.0.0.0/16"))]
                .into_iter()
                .collect(),
            tags: TagSet::new(),
            prior: None,
        }
    }

    #[tokio::test]
    async fn test_ids_are_deterministic_and_stable_on_update() {
        let backend = MockBackend::new();
        let first = backend.apply_resource(&request("aws_vpc.main")).await.unwrap();
        let other = MockBackend::new()
            .apply_resource(&request("aws_vpc.main"))
            .await
            .unwrap();
        assert_eq!(first["id"], other["id"]);
        assert!(first["id"].as_str().unwrap().starts_with("vpc-"));

        let mut update = request("aws_vpc.main");
        update.prior = Some(first.clone());
        update.attributes.insert("cidr_block".to_string(), json!("10.1.0.0/16"));
        let updated = backend.apply_resource(&update).await.unwrap();
        assert_eq!(updated["id"], first["id"]);
        assert_eq!(backend.live_resources(), vec!["vpc/aws_vpc.main"]);
    }

    #[tokio::test]
    async fn test_simulated_failures_are_recorded() {
        let backend = MockBackend::new().fail_on_instance("vpc");
        assert!(backend.apply_resource(&request("aws_vpc.main")).await.is_err());
        assert_eq!(backend.call_count(), 1);
        assert!(backend.live_resources().is_empty());

        backend.heal_instance("vpc");
        assert!(backend.apply_resource(&request("aws_vpc.main")).await.is_ok());
        assert_eq!(backend.applied_instances(), vec!["vpc"]);
    }
}
