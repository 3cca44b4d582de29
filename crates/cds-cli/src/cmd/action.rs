use crate::output::{print_json, print_table};
use anyhow::Context;
use cds_core::action::{Action, ActionDocument, ActionId, ActorId};
use cds_core::bootstrap::Installation;
use cds_core::error::{CdsError, NotFoundKind};
use cds_core::registry::LoadOptions;
use clap::Subcommand;
use std::path::{Path, PathBuf};

/// Actor recorded for changes made from the command line.
const CLI_ACTOR: ActorId = 0;

#[derive(Subcommand)]
pub enum ActionSubcommand {
    /// List every action
    List,
    /// Show one action with its parameters and requirements
    Show {
        name: String,
        /// Print password parameters in clear
        #[arg(long)]
        show_passwords: bool,
    },
    /// Create or update an action from a YAML or JSON document
    Import { file: PathBuf },
    /// Delete an action that no pipeline or composite uses
    Delete { name: String },
    /// List the pipelines an action is reachable from
    Usage { name: String },
    /// Show earlier versions of an action (by name, or by id once deleted)
    Audit {
        action: String,
        /// Print password parameters in clear
        #[arg(long)]
        show_passwords: bool,
    },
    /// List every requirement declared by any action
    Requirements,
}

pub fn run(root: &Path, subcmd: ActionSubcommand, json: bool) -> anyhow::Result<()> {
    let installation = Installation::open(root).context("failed to open cds project")?;
    match subcmd {
        ActionSubcommand::List => list(&installation, json),
        ActionSubcommand::Show {
            name,
            show_passwords,
        } => show(&installation, &name, show_passwords, json),
        ActionSubcommand::Import { file } => import(&installation, &file, json),
        ActionSubcommand::Delete { name } => delete(&installation, &name, json),
        ActionSubcommand::Usage { name } => usage(&installation, &name, json),
        ActionSubcommand::Audit {
            action,
            show_passwords,
        } => audit(&installation, &action, show_passwords, json),
        ActionSubcommand::Requirements => requirements(&installation, json),
    }
}

// ---------------------------------------------------------------------------
// list / show
// ---------------------------------------------------------------------------

fn list(installation: &Installation, json: bool) -> anyhow::Result<()> {
    let actions = installation.registry.load_all(LoadOptions::default())?;
    if json {
        return print_json(&actions);
    }
    if actions.is_empty() {
        println!("No actions.");
        return Ok(());
    }
    let rows = actions
        .iter()
        .map(|a| {
            vec![
                a.id.to_string(),
                a.name.clone(),
                a.action_type().to_string(),
                yes_no(a.public),
                yes_no(a.enabled),
                a.description.clone(),
            ]
        })
        .collect();
    print_table(&["ID", "NAME", "TYPE", "PUBLIC", "ENABLED", "DESCRIPTION"], rows);
    Ok(())
}

fn load_options(show_passwords: bool) -> LoadOptions {
    if show_passwords {
        LoadOptions::with_clear_passwords()
    } else {
        LoadOptions::default()
    }
}

fn show(installation: &Installation, name: &str, show_passwords: bool, json: bool) -> anyhow::Result<()> {
    let opts = load_options(show_passwords);
    let action = installation.registry.load_by_name(name, opts)?;
    if json {
        return print_json(&action);
    }
    print_action(installation, &action)
}

fn print_action(installation: &Installation, action: &Action) -> anyhow::Result<()> {
    println!("{} (#{}, {})", action.name, action.id, action.action_type());
    if !action.description.is_empty() {
        println!("  {}", action.description);
    }
    if !action.enabled {
        println!("  disabled");
    }

    let children = action.children();
    if !children.is_empty() {
        println!("\nSteps:");
        for (i, id) in children.iter().enumerate() {
            let child = installation.registry.load(*id, LoadOptions::default())?;
            println!("  {}. {}", i + 1, child.name);
        }
    }
    if !action.parameters.is_empty() {
        println!();
        let rows = action
            .parameters
            .iter()
            .map(|p| {
                vec![
                    p.name.clone(),
                    format!("{:?}", p.kind).to_lowercase(),
                    p.value.clone(),
                ]
            })
            .collect();
        print_table(&["PARAMETER", "TYPE", "VALUE"], rows);
    }
    if !action.requirements.is_empty() {
        println!();
        let rows = action
            .requirements
            .iter()
            .map(|r| {
                vec![
                    r.name.clone(),
                    r.kind.to_string(),
                    r.value.clone(),
                ]
            })
            .collect();
        print_table(&["REQUIREMENT", "TYPE", "VALUE"], rows);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// import / delete
// ---------------------------------------------------------------------------

fn import(installation: &Installation, file: &Path, json: bool) -> anyhow::Result<()> {
    let data = std::fs::read_to_string(file)
        .with_context(|| format!("cannot read {}", file.display()))?;
    let doc = ActionDocument::parse(&data)
        .with_context(|| format!("invalid action document {}", file.display()))?;
    let outcome = installation.registry.import_document(&doc, CLI_ACTOR)?;

    let verb = if outcome.is_created() { "created" } else { "updated" };
    let action = outcome.action();
    if json {
        return print_json(&serde_json::json!({
            "outcome": verb,
            "action": action,
        }));
    }
    println!("{verb} action '{}' (#{})", action.name, action.id);
    Ok(())
}

fn delete(installation: &Installation, name: &str, json: bool) -> anyhow::Result<()> {
    let action = installation
        .registry
        .load_by_name(name, LoadOptions::default())?;
    installation
        .registry
        .delete(action.id, CLI_ACTOR)
        .with_context(|| format!("cannot delete action '{name}'"))?;
    if json {
        print_json(&serde_json::json!({ "deleted": name, "id": action.id }))
    } else {
        println!("deleted action '{name}'");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// usage
// ---------------------------------------------------------------------------

fn usage(installation: &Installation, name: &str, json: bool) -> anyhow::Result<()> {
    let usages = installation.registry.pipelines_referencing(name)?;
    if json {
        return print_json(&usages);
    }
    if usages.is_empty() {
        println!("'{name}' is not used by any pipeline.");
        return Ok(());
    }
    let rows = usages
        .into_iter()
        .map(|u| vec![u.project_key, u.application, u.pipeline, u.stage, u.action])
        .collect();
    print_table(&["PROJECT", "APPLICATION", "PIPELINE", "STAGE", "VIA"], rows);
    Ok(())
}

// ---------------------------------------------------------------------------
// audit / requirements
// ---------------------------------------------------------------------------

/// Resolve by name first; a bare number is taken as the id of an action
/// that may no longer exist.
fn audit_target(installation: &Installation, action: &str) -> anyhow::Result<ActionId> {
    match installation.registry.load_by_name(action, LoadOptions::default()) {
        Ok(found) => Ok(found.id),
        Err(CdsError::NotFound { .. }) => action
            .trim_start_matches('#')
            .parse::<ActionId>()
            .map_err(|_| CdsError::not_found(NotFoundKind::Action, action).into()),
        Err(e) => Err(e.into()),
    }
}

fn audit(installation: &Installation, action: &str, show_passwords: bool, json: bool) -> anyhow::Result<()> {
    let id = audit_target(installation, action)?;
    let entries = installation.registry.audit(id, load_options(show_passwords))?;
    if json {
        return print_json(&entries);
    }
    if entries.is_empty() {
        println!("No recorded changes for '{action}'.");
        return Ok(());
    }
    let rows = entries
        .iter()
        .map(|e| {
            vec![
                e.version.to_string(),
                e.changed_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                e.change.to_string(),
                e.actor.to_string(),
                e.previous.name.clone(),
                e.previous.description.clone(),
            ]
        })
        .collect();
    print_table(
        &["VERSION", "CHANGED", "CHANGE", "ACTOR", "PREVIOUS NAME", "PREVIOUS DESCRIPTION"],
        rows,
    );
    Ok(())
}

fn requirements(installation: &Installation, json: bool) -> anyhow::Result<()> {
    let requirements = installation.registry.all_requirements()?;
    if json {
        return print_json(&requirements);
    }
    if requirements.is_empty() {
        println!("No requirements.");
        return Ok(());
    }
    let rows = requirements
        .into_iter()
        .map(|r| vec![r.name, r.kind.to_string(), r.value])
        .collect();
    print_table(&["NAME", "TYPE", "VALUE"], rows);
    Ok(())
}

fn yes_no(flag: bool) -> String {
    let word = if flag { "yes" } else { "no" };
    word.to_string()
}
