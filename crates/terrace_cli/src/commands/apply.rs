//! Apply command - Create or update instances in dependency order.

use anyhow::Result;
use clap::Args;
use tracing::info;

use terrace_spec::CommandKind;

use super::report;
use super::workspace::{cancel_on_ctrl_c, Workspace};
use super::{GlobalArgs, OutputFormat, RunArgs};

#[derive(Args)]
pub struct ApplyArgs {
    #[command(flatten)]
    pub run: RunArgs,

    /// Resume a failed apply run (defaults to the latest one)
    #[arg(long, value_name = "RUN_ID", num_args = 0..=1, default_missing_value = "latest",
          conflicts_with = "targets")]
    pub resume: Option<String>,

    /// Output format (text, json)
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
}

pub async fn execute(global: &GlobalArgs, args: ApplyArgs) -> Result<()> {
    let workspace = Workspace::load(global)?;
    let options = args
        .run
        .options(CommandKind::Apply)
        .with_cancel(cancel_on_ctrl_c());

    let result = match &args.resume {
        Some(run_id) => {
            let previous = workspace.resumable_run(run_id, CommandKind::Apply)?;
            info!("Resuming apply run {} on {}", previous.run_id, workspace.env.name);
            if args.format == OutputFormat::Text {
                println!("🔁 Resuming run {}...", previous.run_id);
            }
            workspace
                .orchestrator
                .resume(&workspace.env, &previous, options)
                .await
        }
        None => {
            info!("Applying environment: {}", workspace.env.name);
            if args.format == OutputFormat::Text {
                println!("🚀 Applying {}...", workspace.env.name);
            }
            workspace.orchestrator.run(&workspace.env, options).await
        }
    };
    let log = result.map_err(|e| report::explain(e, args.format))?;

    report::print_run(&log, args.format)?;
    report::finish(&log, args.format)
}
