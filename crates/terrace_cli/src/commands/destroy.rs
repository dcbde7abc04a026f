//! Destroy command - Tear instances down in reverse dependency order.

use anyhow::Result;
use clap::Args;
use tracing::info;

use terrace_spec::CommandKind;

use super::report;
use super::workspace::{cancel_on_ctrl_c, Workspace};
use super::{GlobalArgs, OutputFormat, RunArgs};

#[derive(Args)]
pub struct DestroyArgs {
    #[command(flatten)]
    pub run: RunArgs,

    /// Destroy instances that have state but are no longer declared
    #[arg(long, conflicts_with_all = ["targets", "resume"])]
    pub orphans: bool,

    /// Resume a failed destroy run (defaults to the latest one)
    #[arg(long, value_name = "RUN_ID", num_args = 0..=1, default_missing_value = "latest",
          conflicts_with = "targets")]
    pub resume: Option<String>,

    /// Output format (text, json)
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
}

pub async fn execute(global: &GlobalArgs, args: DestroyArgs) -> Result<()> {
    let workspace = Workspace::load(global)?;
    let options = args
        .run
        .options(CommandKind::Destroy)
        .with_cancel(cancel_on_ctrl_c());
    let text = args.format == OutputFormat::Text;

    let result = if args.orphans {
        let orphans = workspace.orchestrator.find_orphans(&workspace.env).await?;
        if orphans.is_empty() {
            if text {
                println!("✅ No orphaned state in {}", workspace.env.name);
            }
            return Ok(());
        }
        info!("Destroying {} orphaned instance(s)", orphans.len());
        if text {
            println!("🧹 Destroying {} orphaned instance(s)...", orphans.len());
        }
        workspace
            .orchestrator
            .destroy_orphans(&workspace.env, options)
            .await
    } else if let Some(run_id) = &args.resume {
        let previous = workspace.resumable_run(run_id, CommandKind::Destroy)?;
        info!("Resuming destroy run {} on {}", previous.run_id, workspace.env.name);
        if text {
            println!("🔁 Resuming run {}...", previous.run_id);
        }
        workspace
            .orchestrator
            .resume(&workspace.env, &previous, options)
            .await
    } else {
        info!("Destroying environment: {}", workspace.env.name);
        if text {
            println!("💥 Destroying {}...", workspace.env.name);
        }
        workspace.orchestrator.run(&workspace.env, options).await
    };
    let log = result.map_err(|e| report::explain(e, args.format))?;

    report::print_run(&log, args.format)?;
    report::finish(&log, args.format)
}
