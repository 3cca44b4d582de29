use crate::output::print_json;
use anyhow::Context;
use cds_core::bootstrap;
use std::path::Path;

pub fn run(root: &Path, json: bool) -> anyhow::Result<()> {
    let report = bootstrap::init(root)
        .with_context(|| format!("failed to initialize cds in {}", root.display()))?;

    if json {
        return print_json(&serde_json::json!({
            "root": root,
            "config_written": report.config_written,
            "actions_created": report.actions_created,
        }));
    }

    println!("Initializing cds in: {}", root.display());
    if report.config_written {
        println!("  created: .cds/config.yaml");
    } else {
        println!("  exists:  .cds/config.yaml");
    }
    for name in &report.actions_created {
        println!("  action:  {name}");
    }
    Ok(())
}
