//! Output command - Print recorded outputs of instances.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use clap::Args;
use serde::Serialize;
use tracing::debug;

use terrace_iac::{display_outputs, StateRecord};
use terrace_spec::Attributes;

use super::workspace::Workspace;
use super::{GlobalArgs, OutputFormat};

#[derive(Args)]
pub struct OutputArgs {
    /// Instance to show (all declared instances when omitted)
    instance: Option<String>,

    /// Print sensitive outputs instead of masking them
    #[arg(long)]
    show_sensitive: bool,

    /// Output format (text, json)
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,
}

/// Outputs of one instance as printed.
#[derive(Debug, Serialize)]
struct InstanceOutputView {
    instance: String,
    serial: u64,
    complete: bool,
    outputs: Attributes,
}

fn view(name: &str, record: &StateRecord, show_sensitive: bool) -> InstanceOutputView {
    let outputs = if show_sensitive {
        record.outputs.clone()
    } else {
        record.redacted_outputs()
    };
    InstanceOutputView {
        instance: name.to_string(),
        serial: record.serial,
        complete: record.complete,
        outputs,
    }
}

pub async fn execute(global: &GlobalArgs, args: OutputArgs) -> Result<()> {
    let workspace = Workspace::load(global)?;
    let names: Vec<String> = match &args.instance {
        Some(name) => vec![name.clone()],
        None => workspace
            .env
            .instance_names()
            .into_iter()
            .map(str::to_string)
            .collect(),
    };

    let mut views = Vec::new();
    for name in &names {
        let record = workspace
            .orchestrator
            .read_state(&workspace.env, name)
            .await
            .with_context(|| format!("Failed to read state of {}", name))?;
        match record {
            Some(record) => views.push((view(name, &record, args.show_sensitive), record)),
            None if args.instance.is_some() => {
                anyhow::bail!("{} has not been applied in {}", name, workspace.env.name)
            }
            None => debug!("{} has no state, skipping", name),
        }
    }

    if args.format == OutputFormat::Json {
        let json: Vec<&InstanceOutputView> = views.iter().map(|(v, _)| v).collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&json).context("Failed to serialize outputs")?
        );
        return Ok(());
    }

    if views.is_empty() {
        println!("⚠️  No instance in {} has recorded state", workspace.env.name);
        return Ok(());
    }
    for (view, record) in &views {
        println!("📦 {} (serial {})", view.instance, view.serial);
        if !view.complete {
            println!("   ⚠️  last apply did not complete; outputs may be stale");
        }
        let shown: BTreeMap<String, String> = if args.show_sensitive {
            record
                .outputs
                .iter()
                .map(|(k, v)| (k.clone(), v.to_string()))
                .collect()
        } else {
            display_outputs(record)
        };
        for (key, value) in shown {
            println!("   {} = {}", key, value);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use terrace_spec::InstanceId;

    fn record() -> StateRecord {
        let mut record = StateRecord::new(InstanceId::new("qa", "eu-west-1", "db"), "aurora", "1.0.0");
        record.serial = 3;
        record.complete = true;
        record.outputs.insert("endpoint".to_string(), json!("db.local"));
        record.outputs.insert("password".to_string(), json!("hunter2"));
        record.sensitive_outputs.insert("password".to_string());
        record
    }

    #[test]
    fn test_sensitive_outputs_are_masked_by_default() {
        let masked = view("db", &record(), false);
        assert_eq!(masked.outputs["endpoint"], json!("db.local"));
        assert_ne!(masked.outputs["password"], json!("hunter2"));

        let shown = view("db", &record(), true);
        assert_eq!(shown.outputs["password"], json!("hunter2"));
        assert_eq!(shown.serial, 3);
    }
}
