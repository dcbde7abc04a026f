//! Run log printing and outcome handling.

use anyhow::{Context, Result};

use terrace_core::{CoreError, InstanceStatus, RunLog, RunOutcome};

use super::{OutputFormat, RunFailed};

fn status_icon(status: InstanceStatus) -> &'static str {
    match status {
        InstanceStatus::Validated
        | InstanceStatus::Planned
        | InstanceStatus::Applied
        | InstanceStatus::Destroyed => "✅",
        InstanceStatus::Failed => "❌",
        InstanceStatus::Skipped => "⏭️ ",
        _ => "⏳",
    }
}

/// Print `log` in `format`.
pub fn print_run(log: &RunLog, format: OutputFormat) -> Result<()> {
    if format == OutputFormat::Json {
        let json = serde_json::to_string_pretty(log).context("Failed to serialize run log")?;
        println!("{}", json);
        return Ok(());
    }

    let width = log.order.iter().map(String::len).max().unwrap_or(0);
    println!(
        "📋 {} {}/{} (run {})",
        log.command, log.environment, log.region, log.run_id
    );
    if let Some(previous) = &log.resumed_from {
        println!("   ↪ resumed from {}", previous);
    }
    for warning in &log.warnings {
        println!("   ⚠️  {}", warning);
    }

    for record in &log.instances {
        let detail = match (&record.error, &record.plan) {
            (Some(error), _) => error.clone(),
            (None, Some(plan)) => plan.to_string(),
            (None, None) => record.notes.last().cloned().unwrap_or_default(),
        };
        println!(
            "   {} {:width$}  {:<10} {}",
            status_icon(record.status),
            record.name,
            record.status.as_str(),
            detail,
            width = width
        );
        if record.partial {
            println!("      ⚠️  resources changed before the failure; state records what exists");
        }
        if !record.mocked.is_empty() {
            println!("      🧪 mocked: {}", record.mocked.join(", "));
        }
        if record.error.is_some() || record.plan.is_some() {
            for note in &record.notes {
                println!("      - {}", note);
            }
        }
    }

    if !log.orphans.is_empty() {
        println!();
        println!("🧹 State exists for instances no longer declared:");
        for orphan in &log.orphans {
            println!("      - {}", orphan);
        }
        println!("   Run `terrace destroy --orphans` to remove them.");
    }
    Ok(())
}

/// List configuration errors one per line before handing the error back.
pub fn explain(err: CoreError, format: OutputFormat) -> anyhow::Error {
    if format == OutputFormat::Text {
        match &err {
            CoreError::Validation(errors) => {
                println!("❌ Configuration is invalid:");
                for error in errors {
                    println!("      - {}", error);
                }
            }
            CoreError::Cycle { members } => {
                println!("❌ Dependency cycle: {}", members.join(" -> "));
            }
            _ => {}
        }
    }
    err.into()
}

/// Print the closing line and turn a non-successful outcome into an error.
pub fn finish(log: &RunLog, format: OutputFormat) -> Result<()> {
    let outcome = log.outcome.unwrap_or(RunOutcome::Cancelled);
    if format == OutputFormat::Text {
        println!();
        match outcome {
            RunOutcome::Success => println!("✅ {} completed successfully!", log.command),
            RunOutcome::Cancelled => {
                println!("⚠️  Run cancelled. Resume with --resume {}", log.run_id)
            }
            RunOutcome::LockContention => println!(
                "🔒 State is locked by another run. If that run is gone, release its lock \
                 with `terrace force-unlock <INSTANCE> <LOCK_ID>`."
            ),
            _ if log.command.mutates() => println!(
                "❌ {} {}. Fix the issues above, then resume with --resume {}",
                log.command, outcome, log.run_id
            ),
            _ => println!("❌ {} {}. Please fix the issues above.", log.command, outcome),
        }
    }

    if outcome == RunOutcome::Success {
        Ok(())
    } else {
        Err(RunFailed {
            run_id: log.run_id.clone(),
            outcome,
        }
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use terrace_core::ErrorKind;
    use terrace_spec::CommandKind;

    fn failed_log() -> RunLog {
        let mut log = RunLog::new(
            "r1",
            "qa",
            "eu-west-1",
            CommandKind::Apply,
            vec!["network".to_string(), "app".to_string()],
        );
        log.transition("network", InstanceStatus::Planning).unwrap();
        log.fail("network", ErrorKind::Apply, "boom", false).unwrap();
        log.skip("app", "network did not complete").unwrap();
        log.finish(false);
        log
    }

    #[test]
    fn test_failed_run_becomes_typed_error() {
        let log = failed_log();
        let err = finish(&log, OutputFormat::Json).unwrap_err();
        let failed = err.downcast_ref::<RunFailed>().unwrap();
        assert_eq!(failed.outcome, RunOutcome::ApplyFailed);
        assert_eq!(failed.run_id, "r1");
    }

    #[test]
    fn test_print_run_handles_every_status() {
        print_run(&failed_log(), OutputFormat::Text).unwrap();
        print_run(&failed_log(), OutputFormat::Json).unwrap();
    }
}
