//! terrace CLI - Main entry point.
//!
//! Exit codes:
//! - 0: Success
//! - 1: General error
//! - 2: Invalid arguments
//! - 3: Validation failure
//! - 4: Apply failure
//! - 5: Partial apply
//! - 6: Lock contention
//! - 130: Cancelled

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod commands;

use commands::{Cli, Commands, LogFormat, RunFailed, UsageError};
use terrace_core::{CoreError, RunOutcome};
use terrace_iac::IacError;
use terrace_spec::SpecError;

/// CI-friendly exit codes
pub struct ExitCodes;

impl ExitCodes {
    pub const SUCCESS: u8 = 0;
    pub const GENERAL_ERROR: u8 = 1;
    pub const INVALID_ARGS: u8 = 2;
    pub const VALIDATION_FAILURE: u8 = 3;
    pub const APPLY_FAILURE: u8 = 4;
    pub const PARTIAL_APPLY: u8 = 5;
    pub const LOCK_CONTENTION: u8 = 6;
    pub const CANCELLED: u8 = 130;
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli);

    let global = cli.global;
    let result = match cli.command {
        Commands::Validate(args) => commands::validate::execute(&global, args).await,
        Commands::Plan(args) => commands::plan::execute(&global, args).await,
        Commands::Apply(args) => commands::apply::execute(&global, args).await,
        Commands::Destroy(args) => commands::destroy::execute(&global, args).await,
        Commands::Output(args) => commands::output::execute(&global, args).await,
        Commands::ForceUnlock(args) => commands::unlock::execute(&global, args).await,
    };

    match result {
        Ok(()) => ExitCode::from(ExitCodes::SUCCESS),
        Err(e) => {
            let exit_code = categorize_error(&e);
            eprintln!("❌ Error: {:#}", e);
            ExitCode::from(exit_code)
        }
    }
}

fn init_logging(cli: &Cli) {
    let default = if cli.global.verbose {
        "terrace=debug,info"
    } else if cli.global.quiet {
        "warn"
    } else {
        "terrace=info,warn"
    };
    let filter = EnvFilter::try_from_env("TERRACE_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default));

    let registry = tracing_subscriber::registry().with(filter);
    let log_result = match cli.global.log_format {
        LogFormat::Text => registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
    };

    if log_result.is_err() {
        // Logging already initialized, continue
    }
}

/// Categorize error to determine exit code
fn categorize_error(e: &anyhow::Error) -> u8 {
    for cause in e.chain() {
        if let Some(failed) = cause.downcast_ref::<RunFailed>() {
            return outcome_exit_code(failed.outcome);
        }
        if cause.downcast_ref::<UsageError>().is_some() {
            return ExitCodes::INVALID_ARGS;
        }
        if let Some(err) = cause.downcast_ref::<CoreError>() {
            return core_exit_code(err);
        }
        if let Some(err) = cause.downcast_ref::<IacError>() {
            return iac_exit_code(err);
        }
        if let Some(err) = cause.downcast_ref::<SpecError>() {
            return spec_exit_code(err);
        }
    }
    ExitCodes::GENERAL_ERROR
}

fn outcome_exit_code(outcome: RunOutcome) -> u8 {
    match outcome {
        RunOutcome::Success => ExitCodes::SUCCESS,
        RunOutcome::ValidationFailed => ExitCodes::VALIDATION_FAILURE,
        RunOutcome::ApplyFailed => ExitCodes::APPLY_FAILURE,
        RunOutcome::Partial => ExitCodes::PARTIAL_APPLY,
        RunOutcome::LockContention => ExitCodes::LOCK_CONTENTION,
        RunOutcome::Cancelled => ExitCodes::CANCELLED,
    }
}

fn core_exit_code(err: &CoreError) -> u8 {
    match err {
        CoreError::Cycle { .. }
        | CoreError::MockUsedInApply { .. }
        | CoreError::UnknownDependency { .. }
        | CoreError::UndeclaredDependency { .. }
        | CoreError::UnresolvedOutput { .. }
        | CoreError::Validation(_) => ExitCodes::VALIDATION_FAILURE,
        CoreError::UnknownInstance(_) | CoreError::RunNotFound(_) => ExitCodes::INVALID_ARGS,
        CoreError::Iac(inner) => iac_exit_code(inner),
        CoreError::Spec(inner) => spec_exit_code(inner),
        _ => ExitCodes::GENERAL_ERROR,
    }
}

fn iac_exit_code(err: &IacError) -> u8 {
    match err {
        IacError::LockContention { .. } | IacError::LockIdMismatch { .. } => {
            ExitCodes::LOCK_CONTENTION
        }
        IacError::Apply { .. } | IacError::Destroy { .. } | IacError::Provisioner(_) => {
            ExitCodes::APPLY_FAILURE
        }
        IacError::Render { .. }
        | IacError::UnresolvedReference { .. }
        | IacError::StateKeyCollision { .. } => ExitCodes::VALIDATION_FAILURE,
        IacError::Spec(inner) => spec_exit_code(inner),
        _ => ExitCodes::GENERAL_ERROR,
    }
}

fn spec_exit_code(err: &SpecError) -> u8 {
    match err {
        SpecError::NotFound(_) | SpecError::EnvironmentNotFound(_) => ExitCodes::INVALID_ARGS,
        SpecError::Io(_) => ExitCodes::GENERAL_ERROR,
        _ => ExitCodes::VALIDATION_FAILURE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_run_outcomes_map_to_distinct_codes() {
        let code = |outcome| {
            categorize_error(&anyhow::Error::new(RunFailed {
                run_id: "r1".to_string(),
                outcome,
            }))
        };
        assert_eq!(code(RunOutcome::ValidationFailed), ExitCodes::VALIDATION_FAILURE);
        assert_eq!(code(RunOutcome::ApplyFailed), ExitCodes::APPLY_FAILURE);
        assert_eq!(code(RunOutcome::Partial), ExitCodes::PARTIAL_APPLY);
        assert_eq!(code(RunOutcome::LockContention), ExitCodes::LOCK_CONTENTION);
        assert_eq!(code(RunOutcome::Cancelled), ExitCodes::CANCELLED);
    }

    #[test]
    fn test_typed_errors_survive_context() {
        let err: anyhow::Result<()> = Err(CoreError::Cycle {
            members: vec!["a".into(), "b".into()],
        })
        .context("Failed to plan qa");
        assert_eq!(categorize_error(&err.unwrap_err()), ExitCodes::VALIDATION_FAILURE);

        let err = anyhow::Error::new(CoreError::Iac(IacError::LockContention {
            key: "k".into(),
            holder: "run-2".into(),
        }));
        assert_eq!(categorize_error(&err), ExitCodes::LOCK_CONTENTION);

        let err = anyhow::Error::new(UsageError::new("no environment selected"));
        assert_eq!(categorize_error(&err), ExitCodes::INVALID_ARGS);

        let err = anyhow::anyhow!("something else");
        assert_eq!(categorize_error(&err), ExitCodes::GENERAL_ERROR);
    }
}
