//! Force-unlock command - Release a state lock left by a crashed run.

use anyhow::{Context, Result};
use clap::Args;

use super::workspace::Workspace;
use super::GlobalArgs;

#[derive(Args)]
pub struct ForceUnlockArgs {
    /// Instance whose state is locked
    pub instance: String,

    /// Id of the lock to release, as shown in the lock contention error
    pub lock_id: String,
}

pub async fn execute(global: &GlobalArgs, args: ForceUnlockArgs) -> Result<()> {
    let workspace = Workspace::load(global)?;
    let released = workspace
        .orchestrator
        .force_unlock(&workspace.env, &args.instance, &args.lock_id)
        .await
        .with_context(|| format!("Failed to unlock state of {}", args.instance))?;

    println!("🔓 Released {} on {}", released, args.instance);
    println!("   Check the state of {} with `terrace plan` before applying.", args.instance);
    Ok(())
}
