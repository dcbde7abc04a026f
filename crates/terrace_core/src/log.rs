//! Persistent run log.
//!
//! Every instance transition is recorded so an operator can see exactly
//! which instances reached a terminal state, and so a failed run can be
//! resumed without repeating work that already succeeded.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use terrace_iac::PlanSummary;
use terrace_spec::models::CommandKind;

use crate::error::{CoreError, CoreResult};

/// Lifecycle of one instance within a run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Pending,
    Planning,
    Applying,
    Destroying,
    /// Validated without touching state or the backend.
    Validated,
    Planned,
    Applied,
    Destroyed,
    Failed,
    Skipped,
}

impl Default for InstanceStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl InstanceStatus {
    /// Terminal and successful.
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            Self::Validated | Self::Planned | Self::Applied | Self::Destroyed
        )
    }

    pub fn is_terminal(&self) -> bool {
        self.is_success() || matches!(self, Self::Failed | Self::Skipped)
    }

    /// Whether moving to `next` is a legal transition.
    ///
    /// Failed and Skipped only leave through an explicit retry, which
    /// returns them to Pending.
    pub fn can_transition_to(&self, next: InstanceStatus) -> bool {
        use InstanceStatus::*;
        matches!(
            (self, next),
            (Pending, Planning)
                | (Pending, Skipped)
                | (Planning, Applying)
                | (Planning, Destroying)
                | (Planning, Validated)
                | (Planning, Planned)
                | (Planning, Destroyed)
                | (Planning, Failed)
                | (Planning, Skipped)
                | (Applying, Applied)
                | (Applying, Failed)
                | (Destroying, Destroyed)
                | (Destroying, Failed)
                | (Failed, Pending)
                | (Skipped, Pending)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Planning => "planning",
            Self::Applying => "applying",
            Self::Destroying => "destroying",
            Self::Validated => "validated",
            Self::Planned => "planned",
            Self::Applied => "applied",
            Self::Destroyed => "destroyed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Why an instance failed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad configuration: schema, render or mock misuse. Nothing was changed.
    Validation,
    /// The provisioning backend failed. Resources may have changed.
    Apply,
    /// State is locked by another run.
    LockContention,
    /// State could not be read or written.
    State,
}

/// Overall result of a run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Success,
    ValidationFailed,
    ApplyFailed,
    /// Some instances changed infrastructure and others failed.
    Partial,
    LockContention,
    Cancelled,
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Success => "success",
            Self::ValidationFailed => "validation failed",
            Self::ApplyFailed => "apply failed",
            Self::Partial => "partially applied",
            Self::LockContention => "lock contention",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{}", text)
    }
}

/// One instance's entry in the run log.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct InstanceRecord {
    pub name: String,
    pub status: InstanceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<PlanSummary>,
    /// Mock outputs used, as `dependency.<name>.outputs.<output>`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mocked: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
    /// Resources changed before a failure.
    #[serde(default)]
    pub partial: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl InstanceRecord {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// Persistent log of one orchestrator run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunLog {
    pub run_id: String,
    pub environment: String,
    pub region: String,
    pub command: CommandKind,
    #[serde(default)]
    pub targets: Vec<String>,
    /// Instances in execution order.
    pub order: Vec<String>,
    pub instances: Vec<InstanceRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    /// State records with no matching instance.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub orphans: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resumed_from: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub outcome: Option<RunOutcome>,
}

impl RunLog {
    pub fn new(
        run_id: impl Into<String>,
        environment: impl Into<String>,
        region: impl Into<String>,
        command: CommandKind,
        order: Vec<String>,
    ) -> Self {
        let instances = order.iter().map(InstanceRecord::new).collect();
        Self {
            run_id: run_id.into(),
            environment: environment.into(),
            region: region.into(),
            command,
            targets: Vec::new(),
            order,
            instances,
            warnings: Vec::new(),
            orphans: Vec::new(),
            resumed_from: None,
            started_at: Utc::now(),
            completed_at: None,
            outcome: None,
        }
    }

    pub fn instance(&self, name: &str) -> Option<&InstanceRecord> {
        self.instances.iter().find(|r| r.name == name)
    }

    pub fn status(&self, name: &str) -> Option<InstanceStatus> {
        self.instance(name).map(|r| r.status)
    }

    fn instance_mut(&mut self, name: &str) -> CoreResult<&mut InstanceRecord> {
        self.instances
            .iter_mut()
            .find(|r| r.name == name)
            .ok_or_else(|| CoreError::UnknownInstance(name.to_string()))
    }

    /// Move `name` to `next`, enforcing the instance state machine.
    pub fn transition(&mut self, name: &str, next: InstanceStatus) -> CoreResult<()> {
        let record = self.instance_mut(name)?;
        if !record.status.can_transition_to(next) {
            return Err(CoreError::InvalidState(format!(
                "{} cannot move from {} to {}",
                name, record.status, next
            )));
        }
        debug!("{}: {} -> {}", name, record.status, next);
        let now = Utc::now();
        if record.status == InstanceStatus::Pending && next != InstanceStatus::Skipped {
            record.started_at = Some(now);
        }
        if next.is_terminal() {
            record.finished_at = Some(now);
        }
        record.status = next;
        Ok(())
    }

    /// Mark `name` Failed with the error that caused it.
    pub fn fail(
        &mut self,
        name: &str,
        kind: ErrorKind,
        error: impl Into<String>,
        partial: bool,
    ) -> CoreResult<()> {
        self.transition(name, InstanceStatus::Failed)?;
        let record = self.instance_mut(name)?;
        record.error_kind = Some(kind);
        record.error = Some(error.into());
        record.partial = partial;
        Ok(())
    }

    /// Mark `name` Skipped, noting why.
    pub fn skip(&mut self, name: &str, reason: impl Into<String>) -> CoreResult<()> {
        self.transition(name, InstanceStatus::Skipped)?;
        self.instance_mut(name)?.notes.push(reason.into());
        Ok(())
    }

    pub fn note(&mut self, name: &str, note: impl Into<String>) -> CoreResult<()> {
        self.instance_mut(name)?.notes.push(note.into());
        Ok(())
    }

    pub fn set_plan(&mut self, name: &str, plan: PlanSummary) -> CoreResult<()> {
        self.instance_mut(name)?.plan = Some(plan);
        Ok(())
    }

    pub fn set_mocked(&mut self, name: &str, mocked: Vec<String>) -> CoreResult<()> {
        self.instance_mut(name)?.mocked = mocked;
        Ok(())
    }

    /// Names currently in `status`, in execution order.
    pub fn names_with(&self, status: InstanceStatus) -> Vec<&str> {
        self.instances
            .iter()
            .filter(|r| r.status == status)
            .map(|r| r.name.as_str())
            .collect()
    }

    /// Derive the run outcome from instance records.
    pub fn compute_outcome(&self, cancelled: bool) -> RunOutcome {
        let failed: Vec<&InstanceRecord> = self
            .instances
            .iter()
            .filter(|r| r.status == InstanceStatus::Failed)
            .collect();

        if failed.is_empty() {
            return if cancelled && self.instances.iter().any(|r| !r.status.is_success()) {
                RunOutcome::Cancelled
            } else {
                RunOutcome::Success
            };
        }
        if failed
            .iter()
            .any(|r| r.error_kind == Some(ErrorKind::LockContention))
        {
            return RunOutcome::LockContention;
        }
        let changed_something = self.command.mutates()
            && self
                .instances
                .iter()
                .any(|r| matches!(r.status, InstanceStatus::Applied | InstanceStatus::Destroyed));
        if changed_something || failed.iter().any(|r| r.partial) {
            return RunOutcome::Partial;
        }
        if failed
            .iter()
            .all(|r| r.error_kind == Some(ErrorKind::Validation))
        {
            RunOutcome::ValidationFailed
        } else {
            RunOutcome::ApplyFailed
        }
    }

    /// Record the final outcome.
    pub fn finish(&mut self, cancelled: bool) -> RunOutcome {
        let outcome = self.compute_outcome(cancelled);
        self.outcome = Some(outcome);
        self.completed_at = Some(Utc::now());
        outcome
    }

    /// A run can be resumed when it ended with anything but success.
    pub fn can_resume(&self) -> bool {
        matches!(self.outcome, Some(o) if o != RunOutcome::Success)
            && self.instances.iter().any(|r| !r.status.is_success())
    }

    /// Continue this run under a new id: everything not finished
    /// successfully returns to Pending, successes are kept.
    pub fn prepare_resume(&self, run_id: impl Into<String>) -> CoreResult<Self> {
        if !self.can_resume() {
            return Err(CoreError::InvalidState(format!(
                "run {} has nothing to resume",
                self.run_id
            )));
        }
        let mut next = self.clone();
        next.run_id = run_id.into();
        next.resumed_from = Some(self.run_id.clone());
        next.started_at = Utc::now();
        next.completed_at = None;
        next.outcome = None;
        next.orphans.clear();
        for record in &mut next.instances {
            if record.status.is_success() {
                continue;
            }
            *record = InstanceRecord::new(record.name.clone());
        }
        Ok(next)
    }

    /// Path of this run's log under `dir`.
    pub fn log_path(&self, dir: &Path) -> PathBuf {
        dir.join(format!("{}.json", self.run_id))
    }

    /// Save the log to disk.
    pub fn save(&self, dir: &Path) -> CoreResult<PathBuf> {
        fs::create_dir_all(dir)?;
        let path = self.log_path(dir);
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| CoreError::Serialization(e.to_string()))?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &path)?;
        debug!("Saved run log to {:?}", path);
        Ok(path)
    }

    /// Load a log from disk.
    pub fn load(path: &Path) -> CoreResult<Self> {
        let content = fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| CoreError::Serialization(e.to_string()))
    }

    /// Load run `run_id` from `dir`.
    pub fn load_run(dir: &Path, run_id: &str) -> CoreResult<Self> {
        let path = dir.join(format!("{}.json", run_id));
        if !path.is_file() {
            return Err(CoreError::RunNotFound(run_id.to_string()));
        }
        Self::load(&path)
    }

    /// Most recent resumable run of `command` in `environment`.
    pub fn latest_resumable(
        dir: &Path,
        environment: &str,
        command: CommandKind,
    ) -> CoreResult<Option<Self>> {
        if !dir.is_dir() {
            return Ok(None);
        }
        let mut latest: Option<Self> = None;
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let log = Self::load(&path)?;
            if log.environment != environment || log.command != command || !log.can_resume() {
                continue;
            }
            if latest.as_ref().map_or(true, |l| log.started_at > l.started_at) {
                latest = Some(log);
            }
        }
        Ok(latest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn log(command: CommandKind) -> RunLog {
        RunLog::new(
            "run-1",
            "qa",
            "us-east-1",
            command,
            vec!["a".to_string(), "b".to_string(), "c".to_string()],
        )
    }

    fn apply(log: &mut RunLog, name: &str) {
        log.transition(name, InstanceStatus::Planning).unwrap();
        log.transition(name, InstanceStatus::Applying).unwrap();
        log.transition(name, InstanceStatus::Applied).unwrap();
    }

    #[test]
    fn test_state_machine() {
        let mut log = log(CommandKind::Apply);
        assert!(log.transition("a", InstanceStatus::Applied).is_err());
        apply(&mut log, "a");
        assert!(log.transition("a", InstanceStatus::Pending).is_err());
        assert!(log.instance("a").unwrap().finished_at.is_some());

        log.transition("b", InstanceStatus::Planning).unwrap();
        log.fail("b", ErrorKind::Apply, "boom", false).unwrap();
        log.transition("b", InstanceStatus::Pending).unwrap();
        assert!(log.transition("zzz", InstanceStatus::Planning).is_err());
    }

    #[test]
    fn test_outcomes() {
        let mut all = log(CommandKind::Apply);
        for name in ["a", "b", "c"] {
            apply(&mut all, name);
        }
        assert_eq!(all.compute_outcome(false), RunOutcome::Success);

        let mut partial = log(CommandKind::Apply);
        apply(&mut partial, "a");
        partial.transition("b", InstanceStatus::Planning).unwrap();
        partial.transition("b", InstanceStatus::Applying).unwrap();
        partial.fail("b", ErrorKind::Apply, "boom", false).unwrap();
        partial.skip("c", "dependency b failed").unwrap();
        assert_eq!(partial.compute_outcome(false), RunOutcome::Partial);

        let mut invalid = log(CommandKind::Apply);
        invalid.transition("a", InstanceStatus::Planning).unwrap();
        invalid.fail("a", ErrorKind::Validation, "bad input", false).unwrap();
        assert_eq!(invalid.compute_outcome(false), RunOutcome::ValidationFailed);

        let mut locked = log(CommandKind::Apply);
        locked.transition("a", InstanceStatus::Planning).unwrap();
        locked.fail("a", ErrorKind::LockContention, "locked", false).unwrap();
        assert_eq!(locked.compute_outcome(false), RunOutcome::LockContention);

        let mut cancelled = log(CommandKind::Apply);
        apply(&mut cancelled, "a");
        cancelled.skip("b", "cancelled").unwrap();
        assert_eq!(cancelled.compute_outcome(true), RunOutcome::Cancelled);
    }

    #[test]
    fn test_save_load_and_resume() {
        let dir = tempdir().unwrap();
        let mut first = log(CommandKind::Apply);
        apply(&mut first, "a");
        first.transition("b", InstanceStatus::Planning).unwrap();
        first.fail("b", ErrorKind::Apply, "boom", true).unwrap();
        first.skip("c", "dependency b failed").unwrap();
        first.finish(false);
        first.save(dir.path()).unwrap();

        let loaded = RunLog::load_run(dir.path(), "run-1").unwrap();
        assert_eq!(loaded.status("b"), Some(InstanceStatus::Failed));
        assert_eq!(loaded.instance("b").unwrap().error.as_deref(), Some("boom"));
        assert_eq!(loaded.outcome, Some(RunOutcome::Partial));

        let latest = RunLog::latest_resumable(dir.path(), "qa", CommandKind::Apply)
            .unwrap()
            .unwrap();
        let resumed = latest.prepare_resume("run-2").unwrap();
        assert_eq!(resumed.resumed_from.as_deref(), Some("run-1"));
        assert_eq!(resumed.status("a"), Some(InstanceStatus::Applied));
        assert_eq!(resumed.status("b"), Some(InstanceStatus::Pending));
        assert_eq!(resumed.status("c"), Some(InstanceStatus::Pending));
        assert!(resumed.instance("b").unwrap().error.is_none());

        assert!(RunLog::latest_resumable(dir.path(), "prod", CommandKind::Apply)
            .unwrap()
            .is_none());
        assert!(matches!(
            RunLog::load_run(dir.path(), "missing"),
            Err(CoreError::RunNotFound(_))
        ));
    }
}
