//! Apply orchestrator with persistence and resume support.
//!
//! Walks the instance graph of a composed environment and drives each
//! instance through plan, apply or destroy. Instances start only after
//! everything they depend on succeeded; independent branches may run
//! concurrently up to a configured bound. Every transition is written to
//! the run log.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use terrace_iac::{
    ChangeAction, EnvContext, IacError, LockInfo, ModuleApplier, ModuleRenderer, PlanSummary,
    ProvisioningBackend, RenderedModule, ResourceChange, StateKey, StateLocator, StateRecord,
    StateStore,
};
use terrace_spec::models::{CommandKind, InstanceId};
use terrace_spec::{check_inputs, ComposedEnvironment, ConfigValidator, ModuleCatalog, ResolvedInstance};

use crate::error::{CoreError, CoreResult};
use crate::log::{ErrorKind, InstanceStatus, RunLog, RunOutcome};
use crate::resolver::{resolve_inputs, DependencyGraph, InputResolution, InstanceOutputs};

/// Run log target recorded for orphan cleanup runs.
pub const ORPHAN_TARGET: &str = "<orphans>";

/// What happens to the rest of a run when an instance fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Skip transitive dependents of the failed instance; independent
    /// branches keep going.
    ContinueIndependent,
    /// Skip every instance that has not started yet.
    Halt,
}

impl Default for FailurePolicy {
    fn default() -> Self {
        Self::ContinueIndependent
    }
}

impl FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "continue-independent" => Ok(Self::ContinueIndependent),
            "halt" => Ok(Self::Halt),
            other => Err(format!(
                "unknown failure policy '{}' (expected continue-independent or halt)",
                other
            )),
        }
    }
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ContinueIndependent => write!(f, "continue-independent"),
            Self::Halt => write!(f, "halt"),
        }
    }
}

/// Cooperative cancellation, checked between instance steps.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal(Arc<AtomicBool>);

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Options for one orchestrator run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub command: CommandKind,
    /// Instances to run; empty means all.
    pub targets: Vec<String>,
    pub include_dependencies: bool,
    pub policy: FailurePolicy,
    pub parallelism: usize,
    pub cancel: CancelSignal,
}

impl RunOptions {
    pub fn new(command: CommandKind) -> Self {
        Self {
            command,
            targets: Vec::new(),
            include_dependencies: true,
            policy: FailurePolicy::default(),
            parallelism: 1,
            cancel: CancelSignal::new(),
        }
    }

    pub fn with_targets(mut self, targets: Vec<String>) -> Self {
        self.targets = targets;
        self
    }

    pub fn without_dependencies(mut self) -> Self {
        self.include_dependencies = false;
        self
    }

    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Drives runs against a provisioning backend and a state store.
pub struct ApplyOrchestrator {
    backend: Arc<dyn ProvisioningBackend>,
    state: Arc<dyn StateStore>,
    catalog: Arc<ModuleCatalog>,
    locator: StateLocator,
    runs_dir: Option<PathBuf>,
}

impl ApplyOrchestrator {
    pub fn new(
        backend: Arc<dyn ProvisioningBackend>,
        state: Arc<dyn StateStore>,
        catalog: Arc<ModuleCatalog>,
        locator: StateLocator,
    ) -> Self {
        Self {
            backend,
            state,
            catalog,
            locator,
            runs_dir: None,
        }
    }

    /// Persist run logs under `dir`.
    pub fn with_runs_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.runs_dir = Some(dir.into());
        self
    }

    pub fn locator(&self) -> &StateLocator {
        &self.locator
    }

    /// Run `options.command` over `env`.
    ///
    /// Configuration errors (cycles, unknown dependencies, schema errors,
    /// colliding state keys) fail the whole run before any instance starts.
    /// Per-instance failures are recorded in the returned log instead.
    pub async fn run(&self, env: &ComposedEnvironment, options: RunOptions) -> CoreResult<RunLog> {
        let (graph, warnings) = self.prepare(env, options.command)?;
        let order = graph.select(&options.targets, options.command, options.include_dependencies)?;

        let mut log = RunLog::new(new_run_id(), &env.name, &env.region, options.command, order);
        log.targets = options.targets.clone();
        log.warnings = warnings;

        let ids = instance_ids(env);
        let blockers = blockers(&graph, &log.order, options.command);
        self.execute(env, ids, blockers, log, &options).await
    }

    /// Resume a failed run: its successes are kept and every other
    /// instance runs again.
    pub async fn resume(
        &self,
        env: &ComposedEnvironment,
        previous: &RunLog,
        options: RunOptions,
    ) -> CoreResult<RunLog> {
        if previous.environment != env.name || previous.region != env.region {
            return Err(CoreError::InvalidState(format!(
                "run {} belongs to {}/{}",
                previous.run_id, previous.environment, previous.region
            )));
        }
        let (graph, _) = self.prepare(env, previous.command)?;
        if let Some(missing) = previous.order.iter().find(|n| !graph.contains(n)) {
            return Err(CoreError::InvalidState(format!(
                "instance {} of run {} is no longer declared",
                missing, previous.run_id
            )));
        }

        let log = previous.prepare_resume(new_run_id())?;
        info!(
            "Resuming run {} as {} ({} instance(s) left)",
            previous.run_id,
            log.run_id,
            log.names_with(InstanceStatus::Pending).len()
        );
        let options = RunOptions {
            command: previous.command,
            ..options
        };
        let ids = instance_ids(env);
        let blockers = blockers(&graph, &log.order, previous.command);
        self.execute(env, ids, blockers, log, &options).await
    }

    /// Instances with state in this environment that the configuration no
    /// longer declares.
    pub async fn find_orphans(&self, env: &ComposedEnvironment) -> CoreResult<Vec<InstanceId>> {
        let prefix = self.locator.environment_prefix(&env.name, &env.region);
        let declared: HashSet<&str> = env.instance_names().into_iter().collect();

        let mut orphans = Vec::new();
        for key in self.state.list(&prefix).await? {
            let id = self.locator.parse(&key)?;
            if id.environment == env.name
                && id.region == env.region
                && !declared.contains(id.name.as_str())
            {
                orphans.push(id);
            }
        }
        debug!("Found {} orphaned state record(s) in {}", orphans.len(), env.name);
        Ok(orphans)
    }

    /// Destroy every orphaned instance of `env` from its state record.
    pub async fn destroy_orphans(
        &self,
        env: &ComposedEnvironment,
        options: RunOptions,
    ) -> CoreResult<RunLog> {
        let mut records = Vec::new();
        for id in self.find_orphans(env).await? {
            match self.state.read(&self.locator.key(&id)).await? {
                Some(record) => records.push(record),
                None => debug!("{} vanished before it could be destroyed", id),
            }
        }

        let graph = DependencyGraph::from_state(&records)?;
        let order = graph.select(&[], CommandKind::Destroy, true)?;
        let blockers = blockers(&graph, &order, CommandKind::Destroy);
        let ids = records
            .into_iter()
            .map(|r| (r.instance.name.clone(), r.instance))
            .collect();

        let mut log = RunLog::new(new_run_id(), &env.name, &env.region, CommandKind::Destroy, order);
        log.targets = vec![ORPHAN_TARGET.to_string()];
        let options = RunOptions {
            command: CommandKind::Destroy,
            ..options
        };
        self.execute(env, ids, blockers, log, &options).await
    }

    /// Release the state lock a crashed run left on instance `name`.
    ///
    /// `lock_id` must name the current holder, so a lock taken by a live
    /// run in the meantime is left alone. The instance need not still be
    /// declared.
    pub async fn force_unlock(
        &self,
        env: &ComposedEnvironment,
        name: &str,
        lock_id: &str,
    ) -> CoreResult<LockInfo> {
        let id = InstanceId::new(&env.name, &env.region, name);
        let released = self.state.force_unlock(&self.locator.key(&id), lock_id).await?;
        warn!("Released {} on {}", released, id);
        Ok(released)
    }

    /// State record of one declared instance.
    pub async fn read_state(
        &self,
        env: &ComposedEnvironment,
        name: &str,
    ) -> CoreResult<Option<StateRecord>> {
        let instance = env
            .instance(name)
            .ok_or_else(|| CoreError::UnknownInstance(name.to_string()))?;
        Ok(self.state.read(&self.locator.key(&instance.id)).await?)
    }

    /// Build the graph and reject invalid configuration, returning the
    /// validator's warnings.
    fn prepare(
        &self,
        env: &ComposedEnvironment,
        command: CommandKind,
    ) -> CoreResult<(DependencyGraph, Vec<String>)> {
        let graph = DependencyGraph::build(env)?;
        self.locator.check_unique(env.instances.iter().map(|i| &i.id))?;

        // Destroy works from state and must not be blocked by configuration drift.
        if command == CommandKind::Destroy {
            return Ok((graph, Vec::new()));
        }
        let report = ConfigValidator::validate_environment(env, &self.catalog);
        if !report.valid {
            return Err(CoreError::Validation(report.errors));
        }
        Ok((graph, report.warnings))
    }

    async fn execute(
        &self,
        env: &ComposedEnvironment,
        ids: BTreeMap<String, InstanceId>,
        blockers: BTreeMap<String, Vec<String>>,
        log: RunLog,
        options: &RunOptions,
    ) -> CoreResult<RunLog> {
        let command = log.command;
        info!(
            "Starting {} run {} on {} ({} instance(s), policy {}, parallelism {})",
            command,
            log.run_id,
            env.name,
            log.order.len(),
            options.policy,
            options.parallelism.max(1)
        );

        let mut succeeded: HashSet<String> = log
            .instances
            .iter()
            .filter(|r| r.status.is_success())
            .map(|r| r.name.clone())
            .collect();
        let mut remaining: Vec<String> = log
            .order
            .iter()
            .filter(|n| !succeeded.contains(*n))
            .cloned()
            .collect();

        let ctx = Arc::new(RunContext {
            env: Arc::new(env.clone()),
            backend: Arc::clone(&self.backend),
            state: Arc::clone(&self.state),
            catalog: Arc::clone(&self.catalog),
            locator: self.locator.clone(),
            command,
            run_id: log.run_id.clone(),
            ids,
            runs_dir: self.runs_dir.clone(),
            cancel: options.cancel.clone(),
            outputs: Mutex::new(BTreeMap::new()),
            log: Mutex::new(log),
        });
        ctx.persist(&ctx.log.lock());

        let parallelism = options.parallelism.max(1);
        let mut unfinished: HashSet<String> = HashSet::new();
        let mut halted_by: Option<String> = None;
        let mut running: JoinSet<(String, Finished)> = JoinSet::new();

        loop {
            if options.cancel.is_cancelled() || halted_by.is_some() {
                let reason = match &halted_by {
                    Some(failed) => format!("run halted after {} failed", failed),
                    None => "run cancelled".to_string(),
                };
                for name in remaining.drain(..) {
                    ctx.skip(&name, &reason);
                    unfinished.insert(name);
                }
            }

            // Remaining is in execution order, so one pass skips whole chains.
            let mut i = 0;
            while i < remaining.len() {
                let failed_blocker = blockers
                    .get(&remaining[i])
                    .and_then(|b| b.iter().find(|d| unfinished.contains(*d)))
                    .cloned();
                match failed_blocker {
                    Some(blocker) => {
                        let name = remaining.remove(i);
                        ctx.skip(&name, &format!("{} did not complete", blocker));
                        unfinished.insert(name);
                    }
                    None => i += 1,
                }
            }

            let mut i = 0;
            while running.len() < parallelism && i < remaining.len() {
                let ready = blockers
                    .get(&remaining[i])
                    .map_or(true, |b| b.iter().all(|d| succeeded.contains(d)));
                if !ready {
                    i += 1;
                    continue;
                }
                let name = remaining.remove(i);
                let task = Arc::clone(&ctx);
                running.spawn(async move {
                    let finished = task.run_instance(&name).await;
                    (name, finished)
                });
            }

            let Some(joined) = running.join_next().await else {
                if remaining.is_empty() {
                    break;
                }
                return Err(CoreError::InvalidState(format!(
                    "no runnable instance among {}",
                    remaining.join(", ")
                )));
            };

            match joined {
                Ok((name, Finished::Succeeded)) => {
                    succeeded.insert(name);
                }
                Ok((name, Finished::Failed)) => {
                    if options.policy == FailurePolicy::Halt && halted_by.is_none() {
                        halted_by = Some(name.clone());
                    }
                    unfinished.insert(name);
                }
                Ok((name, Finished::Cancelled)) => {
                    unfinished.insert(name);
                }
                Err(e) => {
                    return Err(CoreError::InvalidState(format!("instance task aborted: {}", e)));
                }
            }
        }

        let orphans = if command == CommandKind::Plan {
            match self.find_orphans(env).await {
                Ok(orphans) => orphans.into_iter().map(|id| id.name).collect(),
                Err(e) => {
                    warn!("Could not check for orphaned state: {}", e);
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        let mut log = ctx.log.lock().clone();
        log.orphans = orphans;
        let outcome = log.finish(options.cancel.is_cancelled());
        ctx.persist(&log);

        match outcome {
            RunOutcome::Success => info!("Run {} completed successfully", log.run_id),
            other => warn!("Run {} finished with outcome {:?}", log.run_id, other),
        }
        Ok(log)
    }
}

fn new_run_id() -> String {
    let suffix: String = Uuid::new_v4().simple().to_string().chars().take(8).collect();
    format!("{}-{}", Utc::now().format("%Y%m%dT%H%M%SZ"), suffix)
}

fn instance_ids(env: &ComposedEnvironment) -> BTreeMap<String, InstanceId> {
    env.instances
        .iter()
        .map(|i| (i.name().to_string(), i.id.clone()))
        .collect()
}

fn blockers(
    graph: &DependencyGraph,
    order: &[String],
    command: CommandKind,
) -> BTreeMap<String, Vec<String>> {
    order
        .iter()
        .map(|name| (name.clone(), graph.blockers(name, command, order)))
        .collect()
}

/// How one instance task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Finished {
    Succeeded,
    Failed,
    Cancelled,
}

enum Step {
    Done,
    Cancelled,
}

struct InstanceFailure {
    kind: ErrorKind,
    message: String,
    partial: bool,
}

impl From<CoreError> for InstanceFailure {
    fn from(error: CoreError) -> Self {
        let kind = match &error {
            CoreError::Iac(IacError::LockContention { .. }) => ErrorKind::LockContention,
            CoreError::Iac(
                IacError::Apply { .. } | IacError::Destroy { .. } | IacError::Provisioner(_),
            ) => ErrorKind::Apply,
            CoreError::Iac(
                IacError::Render { .. } | IacError::UnresolvedReference { .. } | IacError::Spec(_),
            )
            | CoreError::Spec(_)
            | CoreError::MockUsedInApply { .. }
            | CoreError::UnresolvedOutput { .. }
            | CoreError::UndeclaredDependency { .. }
            | CoreError::UnknownDependency { .. }
            | CoreError::Validation(_) => ErrorKind::Validation,
            _ => ErrorKind::State,
        };
        Self {
            kind,
            message: error.to_string(),
            partial: false,
        }
    }
}

impl From<IacError> for InstanceFailure {
    fn from(error: IacError) -> Self {
        CoreError::from(error).into()
    }
}

impl From<terrace_spec::SpecError> for InstanceFailure {
    fn from(error: terrace_spec::SpecError) -> Self {
        CoreError::from(error).into()
    }
}

/// State shared by the instance tasks of one run.
struct RunContext {
    env: Arc<ComposedEnvironment>,
    backend: Arc<dyn ProvisioningBackend>,
    state: Arc<dyn StateStore>,
    catalog: Arc<ModuleCatalog>,
    locator: StateLocator,
    command: CommandKind,
    run_id: String,
    ids: BTreeMap<String, InstanceId>,
    runs_dir: Option<PathBuf>,
    cancel: CancelSignal,
    /// Outputs produced during this run, keyed by instance name.
    outputs: Mutex<BTreeMap<String, InstanceOutputs>>,
    log: Mutex<RunLog>,
}

impl RunContext {
    fn persist(&self, log: &RunLog) {
        if let Some(dir) = &self.runs_dir {
            if let Err(e) = log.save(dir) {
                warn!("Failed to save run log {}: {}", log.run_id, e);
            }
        }
    }

    fn update<T>(&self, f: impl FnOnce(&mut RunLog) -> CoreResult<T>) -> CoreResult<T> {
        let mut log = self.log.lock();
        let result = f(&mut log)?;
        self.persist(&log);
        Ok(result)
    }

    fn transition(&self, name: &str, status: InstanceStatus) -> Result<(), InstanceFailure> {
        Ok(self.update(|log| log.transition(name, status))?)
    }

    fn skip(&self, name: &str, reason: &str) {
        info!("Skipping {}: {}", name, reason);
        if let Err(e) = self.update(|log| log.skip(name, reason)) {
            error!("Could not mark {} skipped: {}", name, e);
        }
    }

    fn note(&self, name: &str, note: String) {
        if let Err(e) = self.update(|log| log.note(name, note)) {
            warn!("Could not record note for {}: {}", name, e);
        }
    }

    fn set_plan(&self, name: &str, plan: PlanSummary) {
        if let Err(e) = self.update(|log| log.set_plan(name, plan)) {
            warn!("Could not record plan for {}: {}", name, e);
        }
    }

    fn record_mocked(&self, name: &str, resolution: &InputResolution) {
        if resolution.mocked.is_empty() {
            return;
        }
        let mocked = resolution.mocked.iter().map(|r| r.to_string()).collect();
        if let Err(e) = self.update(|log| log.set_mocked(name, mocked)) {
            warn!("Could not record mocks for {}: {}", name, e);
        }
    }

    fn instance(&self, name: &str) -> Result<&ResolvedInstance, InstanceFailure> {
        self.env
            .instance(name)
            .ok_or_else(|| CoreError::UnknownInstance(name.to_string()).into())
    }

    fn id_of(&self, name: &str) -> InstanceId {
        self.ids
            .get(name)
            .cloned()
            .unwrap_or_else(|| InstanceId::new(&self.env.name, &self.env.region, name))
    }

    async fn run_instance(&self, name: &str) -> Finished {
        let result = match self.command {
            CommandKind::Validate => self.validate_instance(name).await,
            CommandKind::Plan => self.plan_instance(name).await,
            CommandKind::Apply => self.apply_instance(name).await,
            CommandKind::Destroy => self.destroy_instance(name).await,
        };

        match result {
            Ok(Step::Done) => Finished::Succeeded,
            Ok(Step::Cancelled) => {
                self.skip(name, "run cancelled before any change");
                Finished::Cancelled
            }
            Err(failure) => {
                error!("{} failed: {}", name, failure.message);
                let recorded = self.update(|log| {
                    log.fail(name, failure.kind, failure.message.clone(), failure.partial)
                });
                if let Err(e) = recorded {
                    error!("Could not mark {} failed: {}", name, e);
                }
                Finished::Failed
            }
        }
    }

    /// Dependency outputs from this run, falling back to stored state.
    async fn dependency_outputs(
        &self,
        instance: &ResolvedInstance,
    ) -> Result<BTreeMap<String, InstanceOutputs>, InstanceFailure> {
        let mut outputs = BTreeMap::new();
        for dep in &instance.dependencies {
            let target = dep.target_instance();
            if outputs.contains_key(target) {
                continue;
            }
            let produced = self.outputs.lock().get(target).cloned();
            let found = match produced {
                Some(found) => Some(found),
                None => {
                    let key = self.locator.key(&self.id_of(target));
                    self.state
                        .read(&key)
                        .await?
                        .map(|record| InstanceOutputs::from(&record))
                }
            };
            if let Some(found) = found {
                outputs.insert(target.to_string(), found);
            }
        }
        Ok(outputs)
    }

    fn render(
        &self,
        instance: &ResolvedInstance,
        resolution: &InputResolution,
    ) -> Result<RenderedModule, InstanceFailure> {
        let module = self.catalog.get_required(&instance.module)?;
        let env = EnvContext::new(&self.env.name, &self.env.region)
            .with_account(instance.account_id.clone());
        let mut sensitive = instance.sensitive_inputs.clone();
        sensitive.extend(resolution.sensitive.iter().cloned());
        Ok(ModuleRenderer::new(module, &env).render(&resolution.inputs, &sensitive, &instance.tags)?)
    }

    fn new_record(&self, instance: &ResolvedInstance, serial: u64) -> StateRecord {
        let mut record = StateRecord::new(
            instance.id.clone(),
            &instance.module,
            &instance.module_version,
        );
        record.serial = serial;
        record.run_id = Some(self.run_id.clone());
        for dep in &instance.dependencies {
            let target = dep.target_instance().to_string();
            if !record.depends_on.contains(&target) {
                record.depends_on.push(target);
            }
        }
        record
    }

    /// Render with mocks; never reads state or calls the backend.
    async fn validate_instance(&self, name: &str) -> Result<Step, InstanceFailure> {
        let instance = self.instance(name)?;
        self.transition(name, InstanceStatus::Planning)?;

        match resolve_inputs(instance, CommandKind::Validate, &BTreeMap::new()) {
            Ok(resolution) => {
                self.record_mocked(name, &resolution);
                self.render(instance, &resolution)?;
            }
            Err(CoreError::UnresolvedOutput { reference, .. }) => {
                let module = self.catalog.get_required(&instance.module)?;
                check_inputs(
                    name,
                    module,
                    &instance.effective_inputs(),
                    &instance.sensitive_inputs,
                    true,
                )?;
                self.note(
                    name,
                    format!("rendering skipped: {} is only known after apply", reference),
                );
            }
            Err(e) => return Err(e.into()),
        }

        self.transition(name, InstanceStatus::Validated)?;
        debug!("{} is valid", instance.id);
        Ok(Step::Done)
    }

    async fn plan_instance(&self, name: &str) -> Result<Step, InstanceFailure> {
        let instance = self.instance(name)?;
        self.transition(name, InstanceStatus::Planning)?;

        let prior = self.state.read(&self.locator.key(&instance.id)).await?;
        let outputs = self.dependency_outputs(instance).await?;
        let resolution = resolve_inputs(instance, CommandKind::Plan, &outputs)?;
        self.record_mocked(name, &resolution);
        let rendered = self.render(instance, &resolution)?;

        let summary = ModuleApplier::new(self.backend.as_ref(), &instance.id)
            .preview(&rendered, prior.as_ref())
            .await?;
        info!("{}: {}", instance.id, summary);
        self.set_plan(name, summary);
        self.transition(name, InstanceStatus::Planned)?;
        Ok(Step::Done)
    }

    async fn apply_instance(&self, name: &str) -> Result<Step, InstanceFailure> {
        let instance = self.instance(name)?;
        self.transition(name, InstanceStatus::Planning)?;

        let key = self.locator.key(&instance.id);
        let lock = LockInfo::new(&self.run_id, CommandKind::Apply);
        self.state.lock(&key, &lock).await?;
        let result = self.apply_locked(name, instance, &key, &lock).await;
        if let Err(e) = self.state.unlock(&key, &lock).await {
            warn!("{}: failed to release lock on {}: {}", instance.id, key, e);
        }
        result
    }

    async fn apply_locked(
        &self,
        name: &str,
        instance: &ResolvedInstance,
        key: &StateKey,
        lock: &LockInfo,
    ) -> Result<Step, InstanceFailure> {
        let prior = self.state.read(key).await?;
        let outputs = self.dependency_outputs(instance).await?;
        let resolution = resolve_inputs(instance, CommandKind::Apply, &outputs)?;
        let rendered = self.render(instance, &resolution)?;

        let plan = ModuleApplier::plan(&rendered, prior.as_ref());
        info!("{}: {}", instance.id, plan);
        self.set_plan(name, plan);

        if self.cancel.is_cancelled() {
            return Ok(Step::Cancelled);
        }
        self.transition(name, InstanceStatus::Applying)?;

        let serial = prior.as_ref().map_or(0, |p| p.serial) + 1;
        let applier = ModuleApplier::new(self.backend.as_ref(), &instance.id);
        match applier.apply(&rendered, prior.as_ref()).await {
            Ok(outcome) => {
                let mut record = self.new_record(instance, serial);
                record.complete = true;
                record.resources = outcome.resources;
                record.outputs = outcome.outputs;
                record.sensitive_outputs = rendered.sensitive_outputs.clone();
                self.state.write(key, &record, lock).await?;

                self.outputs
                    .lock()
                    .insert(name.to_string(), InstanceOutputs::from(&record));
                info!("{}: applied ({})", instance.id, outcome.summary);
                self.set_plan(name, outcome.summary);
                self.transition(name, InstanceStatus::Applied)?;
                Ok(Step::Done)
            }
            Err(partial) => {
                // Keep whatever now exists so the next run can reconcile it.
                let mut record = self.new_record(instance, serial);
                record.resources = partial.resources;
                if let Some(prior) = &prior {
                    record.outputs = prior.outputs.clone();
                    record.sensitive_outputs = prior.sensitive_outputs.clone();
                }
                if let Err(e) = self.state.write(key, &record, lock).await {
                    error!("{}: could not persist partial state: {}", instance.id, e);
                }
                let changed = partial.summary.has_changes();
                self.set_plan(name, partial.summary);
                Err(InstanceFailure {
                    kind: ErrorKind::Apply,
                    message: partial.error.to_string(),
                    partial: changed,
                })
            }
        }
    }

    async fn destroy_instance(&self, name: &str) -> Result<Step, InstanceFailure> {
        let id = self.id_of(name);
        self.transition(name, InstanceStatus::Planning)?;

        let key = self.locator.key(&id);
        let lock = LockInfo::new(&self.run_id, CommandKind::Destroy);
        self.state.lock(&key, &lock).await?;
        let result = self.destroy_locked(name, &id, &key, &lock).await;
        if let Err(e) = self.state.unlock(&key, &lock).await {
            warn!("{}: failed to release lock on {}: {}", id, key, e);
        }
        result
    }

    async fn destroy_locked(
        &self,
        name: &str,
        id: &InstanceId,
        key: &StateKey,
        lock: &LockInfo,
    ) -> Result<Step, InstanceFailure> {
        let Some(prior) = self.state.read(key).await? else {
            self.note(name, "no state recorded, nothing to destroy".to_string());
            self.transition(name, InstanceStatus::Destroyed)?;
            return Ok(Step::Done);
        };

        let plan = PlanSummary {
            changes: prior
                .resources
                .iter()
                .rev()
                .map(|r| ResourceChange {
                    address: r.address.clone(),
                    resource_type: r.resource_type.clone(),
                    action: ChangeAction::Delete,
                    changed_attributes: Vec::new(),
                })
                .collect(),
        };
        info!("{}: {}", id, plan);
        self.set_plan(name, plan);

        if self.cancel.is_cancelled() {
            return Ok(Step::Cancelled);
        }
        self.transition(name, InstanceStatus::Destroying)?;

        match ModuleApplier::new(self.backend.as_ref(), id).destroy(&prior).await {
            Ok(summary) => {
                self.state.delete(key, lock).await?;
                self.outputs.lock().remove(name);
                self.set_plan(name, summary);
                self.transition(name, InstanceStatus::Destroyed)?;
                info!("{}: destroyed", id);
                Ok(Step::Done)
            }
            Err(partial) => {
                let mut record = prior.clone();
                record.serial += 1;
                record.complete = false;
                record.resources = partial.resources;
                record.run_id = Some(self.run_id.clone());
                record.updated_at = Utc::now();
                if let Err(e) = self.state.write(key, &record, lock).await {
                    error!("{}: could not persist partial state: {}", id, e);
                }
                let changed = partial.summary.has_changes();
                self.set_plan(name, partial.summary);
                Err(InstanceFailure {
                    kind: ErrorKind::Apply,
                    message: partial.error.to_string(),
                    partial: changed,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_policy_parsing() {
        assert_eq!(
            "continue-independent".parse::<FailurePolicy>().unwrap(),
            FailurePolicy::ContinueIndependent
        );
        assert_eq!("halt".parse::<FailurePolicy>().unwrap(), FailurePolicy::Halt);
        assert!("retry".parse::<FailurePolicy>().is_err());
        assert_eq!(FailurePolicy::default().to_string(), "continue-independent");
    }

    #[test]
    fn test_cancel_signal_is_shared() {
        let signal = CancelSignal::new();
        let clone = signal.clone();
        assert!(!signal.is_cancelled());
        clone.cancel();
        assert!(signal.is_cancelled());
    }

    #[test]
    fn test_run_ids_are_unique() {
        assert_ne!(new_run_id(), new_run_id());
    }

    #[test]
    fn test_error_kinds() {
        let locked: InstanceFailure = IacError::LockContention {
            key: "k".into(),
            holder: "h".into(),
        }
        .into();
        assert_eq!(locked.kind, ErrorKind::LockContention);

        let mock: InstanceFailure = CoreError::MockUsedInApply {
            instance: "b".into(),
            dependency: "a".into(),
            output: "id".into(),
        }
        .into();
        assert_eq!(mock.kind, ErrorKind::Validation);

        let io: InstanceFailure = IacError::SerialMismatch {
            key: "k".into(),
            expected: 2,
            found: 1,
        }
        .into();
        assert_eq!(io.kind, ErrorKind::State);
    }
}
