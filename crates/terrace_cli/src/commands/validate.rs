//! Validate command - Check an environment without touching state.

use anyhow::Result;
use clap::Args;
use tracing::info;

use terrace_spec::CommandKind;

use super::report;
use super::workspace::Workspace;
use super::{GlobalArgs, OutputFormat, TargetArgs};

#[derive(Args)]
pub struct ValidateArgs {
    #[command(flatten)]
    selection: TargetArgs,

    /// Output format (text, json)
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,
}

pub async fn execute(global: &GlobalArgs, args: ValidateArgs) -> Result<()> {
    let workspace = Workspace::load(global)?;
    info!("Validating environment: {}", workspace.env.name);

    if args.format == OutputFormat::Text {
        println!(
            "🔍 Validating {} ({} instance(s), {} module(s))...",
            workspace.env.name,
            workspace.env.instances.len(),
            workspace.project.catalog.len()
        );
    }

    let options = args.selection.options(CommandKind::Validate);
    let log = workspace
        .orchestrator
        .run(&workspace.env, options)
        .await
        .map_err(|e| report::explain(e, args.format))?;

    report::print_run(&log, args.format)?;
    report::finish(&log, args.format)
}
