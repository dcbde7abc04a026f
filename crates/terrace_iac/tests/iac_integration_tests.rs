//! Integration tests for rendering, applying and persisting a module.

use std::collections::BTreeSet;

use serde_json::json;
use tempfile::tempdir;

use terrace_iac::{
    ChangeAction, EnvContext, FileStateStore, LockInfo, MockBackend, ModuleApplier,
    ModuleRenderer, StateLocator, StateRecord, StateStore,
};
use terrace_spec::{Attributes, CommandKind, InstanceId, ModuleDefinition, TagSet};

const SECURITY_GROUPS: &str = r#"
name: security-groups
version: "2.0.0"
inputs:
  vpc_id:
    type: string
  groups:
    type: map
    values:
      type: object
      fields:
        description:
          type: string
        ports:
          type: list
          items:
            type: number
  enable_audit:
    type: bool
    default: false
resources:
  - type: aws_security_group
    name: this
    for_each: "${var.groups}"
    attributes:
      name: "${env.name}-${each.key}"
      vpc_id: "${var.vpc_id}"
      description: "${each.value.description}"
    tags:
      Name: "${env.name}-${each.key}"
  - type: aws_security_group_rule
    name: ingress
    for_each: "${var.groups}"
    attributes:
      security_group_id: "${resource.aws_security_group.this[each.key].id}"
      ports: "${each.value.ports}"
  - type: aws_cloudtrail
    name: audit
    enabled: "${var.enable_audit}"
    attributes:
      region: "${env.region}"
outputs:
  security_group_ids:
    collect:
      resource_type: aws_security_group
      attribute: id
      as_map: true
  web_group_id:
    value: "${resource.aws_security_group.this[\"web\"].id}"
"#;

fn module() -> ModuleDefinition {
    serde_yaml::from_str(SECURITY_GROUPS).unwrap()
}

fn inputs(groups: serde_json::Value) -> Attributes {
    [
        ("vpc_id".to_string(), json!("vpc-0123")),
        ("groups".to_string(), groups),
    ]
    .into_iter()
    .collect()
}

#[tokio::test]
async fn test_render_apply_persist_replan() {
    let module = module();
    let env = EnvContext::new("qa", "eu-west-1");
    let tags = TagSet::new().with("Environment", "qa");
    let id = InstanceId::new("qa", "eu-west-1", "sg");

    let rendered = ModuleRenderer::new(&module, &env)
        .render(
            &inputs(json!({
                "web": {"description": "web", "ports": [80, "443"]},
                "db": {"description": "db", "ports": [5432]}
            })),
            &BTreeSet::new(),
            &tags,
        )
        .unwrap();
    assert_eq!(rendered.nodes.len(), 4);
    assert!(rendered.node("aws_cloudtrail.audit").is_none());
    let rule = rendered
        .node("aws_security_group_rule.ingress[\"web\"]")
        .unwrap();
    assert_eq!(rule.attributes["ports"], json!([80, 443]));
    assert_eq!(rule.depends_on, vec!["aws_security_group.this[\"web\"]"]);

    let backend = MockBackend::new();
    let outcome = ModuleApplier::new(&backend, &id)
        .apply(&rendered, None)
        .await
        .unwrap();
    let groups = &outcome.outputs["security_group_ids"];
    assert_eq!(groups.as_object().unwrap().len(), 2);
    assert_eq!(&outcome.outputs["web_group_id"], &groups["web"]);

    // Persist under a lock.
    let dir = tempdir().unwrap();
    let store = FileStateStore::new(dir.path());
    let key = StateLocator::new("acme").key(&id);
    let lock = LockInfo::new("run-1", CommandKind::Apply);
    store.lock(&key, &lock).await.unwrap();
    let mut record = StateRecord::new(id.clone(), &module.name, &module.version);
    record.serial = 1;
    record.complete = true;
    record.resources = outcome.resources.clone();
    record.outputs = outcome.outputs.clone();
    store.write(&key, &record, &lock).await.unwrap();
    store.unlock(&key, &lock).await.unwrap();

    // A second plan from persisted state is empty.
    let prior = store.read(&key).await.unwrap().unwrap();
    let plan = ModuleApplier::plan(&rendered, Some(&prior));
    assert!(!plan.has_changes(), "{:?}", plan);

    // Dropping a group plans a removal of both its nodes.
    let smaller = ModuleRenderer::new(&module, &env)
        .render(
            &inputs(json!({"web": {"description": "web", "ports": [80, 443]}})),
            &BTreeSet::new(),
            &tags,
        )
        .unwrap();
    let plan = ModuleApplier::plan(&smaller, Some(&prior));
    assert_eq!(plan.count(ChangeAction::Delete), 2);
    assert_eq!(plan.count(ChangeAction::Create), 0);
}

#[test]
fn test_render_error_names_the_field() {
    let module = module();
    let env = EnvContext::new("qa", "eu-west-1");
    let err = ModuleRenderer::new(&module, &env)
        .render(
            &inputs(json!({"web": {"description": "web", "ports": ["http"]}})),
            &BTreeSet::new(),
            &TagSet::new(),
        )
        .unwrap_err();
    assert!(err.to_string().contains("groups.web.ports[0]"), "{}", err);
}
