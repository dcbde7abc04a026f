//! CLI command definitions.
//!
//! This module defines the command structure for the terrace CLI. Each
//! subcommand maps to one orchestrator mode.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use thiserror::Error;

use terrace_core::{FailurePolicy, RunOptions, RunOutcome};
use terrace_spec::CommandKind;

pub mod apply;
pub mod destroy;
pub mod output;
pub mod plan;
pub mod report;
pub mod unlock;
pub mod validate;
pub mod workspace;

/// terrace - layered infrastructure configuration composer
#[derive(Parser)]
#[command(name = "terrace")]
#[command(version, about = "terrace - layered infrastructure configuration composer")]
#[command(long_about = r#"
terrace composes a shared root configuration, a catalog of versioned modules
and per-environment instance declarations into fully resolved module
instances, then validates, plans, applies or destroys them in dependency
order.

COMMANDS:
  validate      → Check schemas and render every instance with mock outputs
  plan          → Show what apply would change, reading recorded state
  apply         → Create or update instances in dependency order
  destroy       → Tear instances down in reverse dependency order
  output        → Print recorded outputs of instances
  force-unlock  → Release a state lock left by a crashed run

EXIT CODES:
  0   - Success
  1   - General error
  2   - Invalid arguments
  3   - Validation failure
  4   - Apply failure
  5   - Partial apply
  6   - Lock contention
  130 - Cancelled
"#)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Commands,
}

/// Options shared by every command.
#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// Project directory holding terrace.toml, modules/ and environments/
    #[arg(short = 'C', long, global = true, env = "TERRACE_CONFIG_DIR", default_value = ".")]
    pub config_dir: PathBuf,

    /// Environment to operate on
    #[arg(short, long = "env", global = true, env = "TERRACE_ENV")]
    pub environment: Option<String>,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress non-essential output
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate configuration and render every instance with mock outputs
    Validate(validate::ValidateArgs),

    /// Show the changes apply would make
    Plan(plan::PlanArgs),

    /// Create or update instances in dependency order
    Apply(apply::ApplyArgs),

    /// Destroy instances in reverse dependency order
    Destroy(destroy::DestroyArgs),

    /// Print recorded outputs
    Output(output::OutputArgs),

    /// Release a state lock left behind by a crashed run
    ForceUnlock(unlock::ForceUnlockArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

/// Report format for command results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Instance selection shared by every run command.
#[derive(Args, Debug, Clone)]
pub struct TargetArgs {
    /// Limit the run to this instance (repeatable)
    #[arg(short, long = "target", value_name = "INSTANCE")]
    pub targets: Vec<String>,

    /// Do not pull in the dependencies of targets (dependents, for destroy)
    #[arg(long, requires = "targets")]
    pub no_deps: bool,
}

/// Scheduling options for plan, apply and destroy.
#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    #[command(flatten)]
    pub selection: TargetArgs,

    /// Maximum number of independent instances running at once
    #[arg(short = 'j', long, env = "TERRACE_PARALLELISM", default_value_t = 1,
          value_parser = clap::value_parser!(u16).range(1..))]
    pub parallelism: u16,

    /// What happens to the rest of the run when an instance fails
    /// (continue-independent, halt)
    #[arg(long, env = "TERRACE_FAILURE_POLICY", default_value = "continue-independent")]
    pub failure_policy: FailurePolicy,

    /// Shorthand for --failure-policy halt
    #[arg(long)]
    pub halt_on_failure: bool,
}

impl TargetArgs {
    pub fn options(&self, command: CommandKind) -> RunOptions {
        let options = RunOptions::new(command).with_targets(self.targets.clone());
        if self.no_deps {
            options.without_dependencies()
        } else {
            options
        }
    }
}

impl RunArgs {
    pub fn options(&self, command: CommandKind) -> RunOptions {
        let policy = if self.halt_on_failure {
            FailurePolicy::Halt
        } else {
            self.failure_policy
        };
        self.selection
            .options(command)
            .with_policy(policy)
            .with_parallelism(usize::from(self.parallelism))
    }
}

/// Bad command line usage that clap cannot catch.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct UsageError(String);

impl UsageError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// A run that finished with anything but success.
#[derive(Debug, Error)]
#[error("run {run_id} finished: {outcome}")]
pub struct RunFailed {
    pub run_id: String,
    pub outcome: RunOutcome,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_flags() {
        let cli = Cli::try_parse_from([
            "terrace",
            "--env",
            "qa",
            "apply",
            "--target",
            "database",
            "--target",
            "app",
            "--no-deps",
            "-j",
            "4",
            "--halt-on-failure",
        ])
        .unwrap();

        assert_eq!(cli.global.environment.as_deref(), Some("qa"));
        let Commands::Apply(args) = cli.command else {
            panic!("expected apply");
        };
        let options = args.run.options(CommandKind::Apply);
        assert_eq!(options.targets, vec!["database", "app"]);
        assert!(!options.include_dependencies);
        assert_eq!(options.parallelism, 4);
        assert_eq!(options.policy, FailurePolicy::Halt);
        assert!(args.resume.is_none());
    }

    #[test]
    fn test_defaults() {
        let cli = Cli::try_parse_from(["terrace", "plan"]).unwrap();
        let Commands::Plan(args) = cli.command else {
            panic!("expected plan");
        };
        let options = args.run.options(CommandKind::Plan);
        assert!(options.targets.is_empty());
        assert!(options.include_dependencies);
        assert_eq!(options.parallelism, 1);
        assert_eq!(options.policy, FailurePolicy::ContinueIndependent);
    }

    #[test]
    fn test_invalid_usage_is_rejected() {
        assert!(Cli::try_parse_from(["terrace", "apply", "--no-deps"]).is_err());
        assert!(Cli::try_parse_from(["terrace", "apply", "-j", "0"]).is_err());
        assert!(Cli::try_parse_from(["terrace", "apply", "--failure-policy", "retry"]).is_err());
    }

    #[test]
    fn test_resume_defaults_to_latest() {
        let cli = Cli::try_parse_from(["terrace", "apply", "--resume"]).unwrap();
        let Commands::Apply(args) = cli.command else {
            panic!("expected apply");
        };
        assert_eq!(args.resume.as_deref(), Some("latest"));

        let cli = Cli::try_parse_from(["terrace", "destroy", "--resume", "20261016T101500Z-1a2b3c4d"])
            .unwrap();
        let Commands::Destroy(args) = cli.command else {
            panic!("expected destroy");
        };
        assert_eq!(args.resume.as_deref(), Some("20261016T101500Z-1a2b3c4d"));
    }

    #[test]
    fn test_force_unlock_needs_instance_and_lock_id() {
        let cli = Cli::try_parse_from(["terrace", "-e", "qa", "force-unlock", "network", "abc-123"])
            .unwrap();
        let Commands::ForceUnlock(args) = cli.command else {
            panic!("expected force-unlock");
        };
        assert_eq!(args.instance, "network");
        assert_eq!(args.lock_id, "abc-123");
        assert!(Cli::try_parse_from(["terrace", "force-unlock", "network"]).is_err());
    }
}

