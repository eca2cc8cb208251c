//! Stack commands: validate, plan, up, outputs.

use super::{load_topology, provision};
use anyhow::Result;
use greenlight_config::RuntimeSettings;
use greenlight_provisioner::{GraphBuilder, ResolvedOutput, StateFile};

pub fn validate(path: &str) -> Result<()> {
    let topology = match load_topology(path) {
        Ok(topology) => topology,
        Err(e) => {
            println!("Configuration error: {:#}", e);
            std::process::exit(1);
        }
    };
    match GraphBuilder::from_topology(&topology).and_then(|g| g.build()) {
        Ok(plan) => {
            println!(
                "Configuration is valid: {} resources, {} grants, {} pipelines",
                plan.len(),
                plan.grants().len(),
                topology.pipelines().count()
            );
            Ok(())
        }
        Err(e) => {
            println!("Configuration error: {}", e);
            std::process::exit(1);
        }
    }
}

pub fn plan(path: &str) -> Result<()> {
    let topology = load_topology(path)?;
    let plan = GraphBuilder::from_topology(&topology)?.build()?;

    println!("Stack: {}", topology.stack);
    for (i, name) in plan.order().into_iter().enumerate() {
        let deps: Vec<String> = plan
            .dependencies_of(name)
            .map(|e| format!("{}.{}", e.provider, e.key))
            .collect();
        if deps.is_empty() {
            println!("{:>3}. {}", i + 1, name);
        } else {
            println!("{:>3}. {} (after {})", i + 1, name, deps.join(", "));
        }
    }
    for grant in plan.grants() {
        println!("     grant {}", grant);
    }
    Ok(())
}

pub async fn up(path: &str, settings: &RuntimeSettings) -> Result<()> {
    let topology = load_topology(path)?;
    let report = provision(&topology, settings).await?;

    print_outputs(&report.resolve_outputs(&topology.operator_outputs()));
    if !report.is_success() {
        anyhow::bail!("{} resources failed", report.failed().count());
    }
    Ok(())
}

pub async fn outputs(settings: &RuntimeSettings) -> Result<()> {
    match StateFile::load(&settings.state_path).await? {
        Some(state) => {
            print_outputs(&state.outputs);
            Ok(())
        }
        None => anyhow::bail!(
            "No state at {}; run `greenlight up` first",
            settings.state_path.display()
        ),
    }
}

fn print_outputs(outputs: &[ResolvedOutput]) {
    println!("\nOutputs:");
    for output in outputs {
        println!("  {} = {}", output.name, output.value);
    }
}
