//! Project loading shared by every command.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use terrace_core::{ApplyOrchestrator, CancelSignal, RunLog};
use terrace_iac::{
    CommandBackend, FileStateStore, MemoryStateStore, MockBackend, ProvisioningBackend,
    StateLocator, StateStore,
};
use terrace_spec::{
    BackendKind, CommandKind, ComposedEnvironment, EnvironmentComposer, Project,
    ProvisionerConfig,
};

use super::{GlobalArgs, UsageError};

/// A loaded project with one composed environment.
pub struct Workspace {
    pub project: Project,
    pub env: ComposedEnvironment,
    pub orchestrator: ApplyOrchestrator,
}

impl Workspace {
    pub fn load(global: &GlobalArgs) -> Result<Self> {
        let name = global.environment.as_deref().ok_or_else(|| {
            UsageError::new("no environment selected: pass --env or set TERRACE_ENV")
        })?;

        let project = Project::open(&global.config_dir)
            .with_context(|| format!("Failed to open project at {:?}", global.config_dir))?;
        let config = project.environment(name)?;

        let catalog = Arc::new(project.catalog.clone());
        let env = EnvironmentComposer::new(Arc::new(project.root.clone()), Arc::clone(&catalog))
            .compose(&config)
            .with_context(|| format!("Failed to compose environment {}", name))?;
        info!(
            "Composed {} ({}) with {} instance(s)",
            env.name,
            env.region,
            env.instances.len()
        );

        let orchestrator = ApplyOrchestrator::new(
            provisioning_backend(&env.provisioner),
            state_store(&project),
            catalog,
            StateLocator::new(env.backend.prefix.clone()),
        )
        .with_runs_dir(project.runs_dir());

        Ok(Self {
            project,
            env,
            orchestrator,
        })
    }

    /// Run log to resume: `latest` picks the newest resumable run of
    /// `command` in this environment.
    pub fn resumable_run(&self, run_id: &str, command: CommandKind) -> Result<RunLog> {
        let runs_dir = self.project.runs_dir();
        let log = if run_id == "latest" {
            RunLog::latest_resumable(&runs_dir, &self.env.name, command)?.ok_or_else(|| {
                UsageError::new(format!(
                    "no resumable {} run found for environment {}",
                    command, self.env.name
                ))
            })?
        } else {
            RunLog::load_run(&runs_dir, run_id)?
        };

        if log.command != command {
            return Err(UsageError::new(format!(
                "run {} was a {} run, not {}",
                log.run_id, log.command, command
            ))
            .into());
        }
        Ok(log)
    }
}

fn provisioning_backend(config: &ProvisionerConfig) -> Arc<dyn ProvisioningBackend> {
    match config {
        ProvisionerConfig::Mock => {
            warn!("Using the mock provisioner: no real resources will be touched");
            Arc::new(MockBackend::new())
        }
        ProvisionerConfig::Command { program, args } => {
            Arc::new(CommandBackend::new(program.clone(), args.clone()))
        }
    }
}

fn state_store(project: &Project) -> Arc<dyn StateStore> {
    match project.root.backend.kind {
        BackendKind::Local => Arc::new(FileStateStore::new(project.state_dir())),
        BackendKind::Memory => Arc::new(MemoryStateStore::new()),
    }
}

/// Cancel the run on Ctrl-C. Instances already changing resources finish
/// their current step; nothing new starts.
pub fn cancel_on_ctrl_c() -> CancelSignal {
    let cancel = CancelSignal::new();
    let signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("⚠️  Interrupt received, finishing in-flight instances...");
            signal.cancel();
        }
    });
    cancel
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;
    use tempfile::tempdir;

    use terrace_core::{InstanceStatus, RunOptions, RunOutcome};

    use crate::commands::LogFormat;

    fn write(dir: &Path, path: &str, content: &str) {
        let path = dir.join(path);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn project(dir: &Path) {
        write(
            dir,
            "terrace.toml",
            r#"
[backend]
kind = "local"
prefix = "acme"

[tags]
Owner = "platform"

[provisioner]
kind = "mock"
"#,
        );
        write(
            dir,
            "modules/network/module.yaml",
            r#"
name: network
version: "1.0.0"
inputs:
  cidr:
    type: string
resources:
  - type: aws_vpc
    name: main
    attributes:
      cidr_block: "${var.cidr}"
outputs:
  vpc_id:
    value: "${resource.aws_vpc.main.id}"
"#,
        );
        write(
            dir,
            "modules/app/module.yaml",
            r#"
name: app
version: "1.0.0"
inputs:
  vpc_id:
    type: string
resources:
  - type: aws_instance
    name: web
    attributes:
      vpc_id: "${var.vpc_id}"
"#,
        );
        write(
            dir,
            "environments/qa/env.yaml",
            r#"
name: qa
region: eu-west-1
instances:
  - name: network
    module: network
    inputs:
      cidr: 10.0.0.0/16
  - name: app
    module: app
    inputs:
      vpc_id: "${dependency.network.outputs.vpc_id}"
    dependencies:
      - name: network
        mock_outputs:
          vpc_id: vpc-mock
"#,
        );
    }

    fn global(dir: &Path, env: Option<&str>) -> GlobalArgs {
        GlobalArgs {
            config_dir: dir.to_path_buf(),
            environment: env.map(str::to_string),
            log_format: LogFormat::Text,
            verbose: false,
            quiet: false,
        }
    }

    #[tokio::test]
    async fn test_apply_persists_state_and_run_log() {
        let dir = tempdir().unwrap();
        project(dir.path());

        let workspace = Workspace::load(&global(dir.path(), Some("qa"))).unwrap();
        let log = workspace
            .orchestrator
            .run(&workspace.env, RunOptions::new(CommandKind::Apply))
            .await
            .unwrap();
        assert_eq!(log.outcome, Some(RunOutcome::Success));
        assert_eq!(log.status("app"), Some(InstanceStatus::Applied));
        assert!(workspace.project.runs_dir().join(format!("{}.json", log.run_id)).is_file());

        // A fresh load sees the recorded outputs.
        let reloaded = Workspace::load(&global(dir.path(), Some("qa"))).unwrap();
        let network = reloaded
            .orchestrator
            .read_state(&reloaded.env, "network")
            .await
            .unwrap()
            .unwrap();
        assert!(network.outputs["vpc_id"].as_str().unwrap().starts_with("vpc-"));
    }

    #[test]
    fn test_missing_environment_is_a_usage_error() {
        let dir = tempdir().unwrap();
        project(dir.path());
        let err = Workspace::load(&global(dir.path(), None)).err().unwrap();
        assert!(err.downcast_ref::<UsageError>().is_some());
    }

    #[test]
    fn test_resume_without_history_is_a_usage_error() {
        let dir = tempdir().unwrap();
        project(dir.path());
        let workspace = Workspace::load(&global(dir.path(), Some("qa"))).unwrap();
        let err = workspace
            .resumable_run("latest", CommandKind::Apply)
            .unwrap_err();
        assert!(err.downcast_ref::<UsageError>().is_some());
    }
}
