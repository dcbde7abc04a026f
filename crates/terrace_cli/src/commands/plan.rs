//! Plan command - Show what apply would change.

use anyhow::Result;
use clap::Args;
use tracing::info;

use terrace_spec::CommandKind;

use super::report;
use super::workspace::Workspace;
use super::{GlobalArgs, OutputFormat, RunArgs};

#[derive(Args)]
pub struct PlanArgs {
    #[command(flatten)]
    pub run: RunArgs,

    /// Output format (text, json)
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
}

pub async fn execute(global: &GlobalArgs, args: PlanArgs) -> Result<()> {
    let workspace = Workspace::load(global)?;
    info!("Planning environment: {}", workspace.env.name);

    // Plans take no locks and change nothing, so no cancellation handling.
    let options = args.run.options(CommandKind::Plan);
    let log = workspace
        .orchestrator
        .run(&workspace.env, options)
        .await
        .map_err(|e| report::explain(e, args.format))?;

    report::print_run(&log, args.format)?;
    report::finish(&log, args.format)
}
