use crate::output::{print_json, print_table};
use anyhow::Context;
use cds_core::bootstrap::Installation;
use cds_core::catalog::{Catalog, CatalogDocument, Project, NO_ENV};
use cds_core::error::{CdsError, NotFoundKind};
use clap::Subcommand;
use std::path::{Path, PathBuf};

#[derive(Subcommand)]
pub enum CatalogSubcommand {
    /// Import projects, pipelines and trigger links from a YAML document
    Import { file: PathBuf },
    /// List projects, or show one project in detail
    Show { project: Option<String> },
    /// List the recorded builds of a pipeline
    Builds {
        project: String,
        application: String,
        pipeline: String,
        /// Environment (default: NoEnv)
        environment: Option<String>,
    },
}

pub fn run(root: &Path, subcmd: CatalogSubcommand, json: bool) -> anyhow::Result<()> {
    let installation = Installation::open(root).context("failed to open cds project")?;
    match subcmd {
        CatalogSubcommand::Import { file } => import(&installation, &file, json),
        CatalogSubcommand::Show { project: None } => list(&installation, json),
        CatalogSubcommand::Show {
            project: Some(key),
        } => show(&installation, &key, json),
        CatalogSubcommand::Builds {
            project,
            application,
            pipeline,
            environment,
        } => builds(
            &installation,
            &project,
            &application,
            &pipeline,
            environment.as_deref().unwrap_or(NO_ENV),
            json,
        ),
    }
}

fn import(installation: &Installation, file: &Path, json: bool) -> anyhow::Result<()> {
    let data = std::fs::read_to_string(file)
        .with_context(|| format!("cannot read {}", file.display()))?;
    let doc = CatalogDocument::parse(&data)
        .with_context(|| format!("invalid catalog document {}", file.display()))?;
    let projects = installation
        .store
        .import_catalog(&doc)
        .with_context(|| format!("cannot import {}", file.display()))?;

    if json {
        return print_json(&projects);
    }
    for p in &projects {
        println!(
            "imported project {}: {} application(s), {} pipeline(s), {} trigger(s)",
            p.key,
            p.applications.len(),
            p.pipelines.len(),
            p.triggers.len()
        );
    }
    Ok(())
}

fn list(installation: &Installation, json: bool) -> anyhow::Result<()> {
    let projects = installation.store.projects()?;
    if json {
        return print_json(&projects);
    }
    if projects.is_empty() {
        println!("No projects. Import one with `cds catalog import <file>`.");
        return Ok(());
    }
    let rows = projects
        .iter()
        .map(|p| {
            vec![
                p.key.clone(),
                p.name.clone(),
                p.applications.len().to_string(),
                p.pipelines.len().to_string(),
            ]
        })
        .collect();
    print_table(&["KEY", "NAME", "APPLICATIONS", "PIPELINES"], rows);
    Ok(())
}

fn show(installation: &Installation, key: &str, json: bool) -> anyhow::Result<()> {
    let project = Catalog::project(installation.store.as_ref(), key)?;
    if json {
        return print_json(&project);
    }
    print_project(installation, &project)
}

fn print_project(installation: &Installation, project: &Project) -> anyhow::Result<()> {
    println!("{} ({})", project.key, project.name);

    println!("\nApplications:");
    for app in &project.applications {
        let pipelines: Vec<&str> = project.pipelines_of(app).map(|p| p.name.as_str()).collect();
        println!("  {}: {}", app.name, pipelines.join(", "));
    }

    println!("\nPipelines:");
    for pipeline in &project.pipelines {
        println!("  {}", pipeline.name);
        for stage in &pipeline.stages {
            let mut names = Vec::with_capacity(stage.actions.len());
            for id in &stage.actions {
                let name = installation
                    .store
                    .action(*id)?
                    .map_or_else(|| format!("#{id}"), |a| a.name);
                names.push(name);
            }
            println!("    {}: {}", stage.name, names.join(", "));
        }
    }

    if !project.environments.is_empty() {
        let envs: Vec<&str> = project.environments.iter().map(|e| e.name.as_str()).collect();
        println!("\nEnvironments: {}", envs.join(", "));
    }

    if !project.triggers.is_empty() {
        println!();
        let rows = project
            .triggers
            .iter()
            .map(|t| {
                let params: Vec<String> = t
                    .parameters
                    .iter()
                    .map(|p| format!("{}={}", p.name, p.value))
                    .collect();
                vec![t.source.to_string(), t.dest.to_string(), params.join(" ")]
            })
            .collect();
        print_table(&["SOURCE", "DESTINATION", "PARAMETERS"], rows);
    }
    Ok(())
}

fn builds(
    installation: &Installation,
    key: &str,
    application: &str,
    pipeline: &str,
    environment: &str,
    json: bool,
) -> anyhow::Result<()> {
    let project = Catalog::project(installation.store.as_ref(), key)?;
    let app = project
        .application(application)
        .ok_or_else(|| CdsError::not_found(NotFoundKind::Application, application))?;
    let pip = project
        .pipelines_of(app)
        .find(|p| p.name == pipeline)
        .ok_or_else(|| {
            CdsError::not_found(NotFoundKind::Pipeline, format!("{application}/{pipeline}"))
        })?;
    let env = project
        .environment(environment)
        .ok_or_else(|| CdsError::not_found(NotFoundKind::Environment, environment))?;
    let builds = installation.store.builds(app.id, pip.id, env.id)?;

    if json {
        return print_json(&builds);
    }
    if builds.is_empty() {
        println!("No builds.");
        return Ok(());
    }
    let rows = builds
        .iter()
        .rev()
        .map(|b| {
            vec![
                b.number.to_string(),
                b.status.to_string(),
                b.started_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                b.parent
                    .as_ref()
                    .map_or_else(String::new, |p| format!("#{}", p.build_number)),
            ]
        })
        .collect();
    print_table(&["NUMBER", "STATUS", "STARTED", "PARENT"], rows);
    Ok(())
}
