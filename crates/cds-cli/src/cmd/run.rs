use crate::output::print_json;
use anyhow::Context;
use cds_core::bootstrap::Installation;
use cds_core::launcher::{LaunchOutcome, Launcher, RunOptions};
use cds_core::trigger::RunTarget;
use clap::Args;
use std::io::Write;
use std::path::Path;

#[derive(Args)]
pub struct RunArgs {
    /// Project key
    pub project: String,
    pub application: String,
    pub pipeline: String,
    /// Environment (default: NoEnv)
    pub environment: Option<String>,

    /// Submit the build without streaming its log
    #[arg(long)]
    pub batch: bool,

    /// Build parameter (repeatable: -p version=1.2 -p branch=main)
    #[arg(long = "parameter", short = 'p', value_name = "NAME=VALUE")]
    pub parameters: Vec<String>,

    /// Upstream build that triggered this run: application/pipeline[/environment]
    #[arg(long)]
    pub parent: Option<String>,

    /// Build number of the parent (0 or omitted: its latest build)
    #[arg(long, allow_negative_numbers = true, requires = "parent")]
    pub parent_build: Option<i64>,
}

impl RunArgs {
    fn into_options(self) -> RunOptions {
        RunOptions {
            target: RunTarget {
                project_key: self.project,
                application: self.application,
                pipeline: self.pipeline,
                environment: self.environment,
            },
            stream: !self.batch,
            parameters: self.parameters,
            parent: self.parent,
            parent_build: self.parent_build,
        }
    }
}

pub fn run(root: &Path, args: RunArgs, json: bool) -> anyhow::Result<()> {
    let opts = args.into_options();
    opts.check_usage()?;
    let installation = Installation::open(root).context("failed to open cds project")?;
    let runner = installation.runner();
    let launcher = Launcher::new(installation.store.as_ref(), &runner);

    // With --json the log table goes to stderr so stdout stays parseable.
    let mut out: Box<dyn Write + Send> = if json {
        Box::new(std::io::stderr())
    } else {
        Box::new(std::io::stdout())
    };

    let rt = tokio::runtime::Runtime::new().context("failed to start async runtime")?;
    let report = rt
        .block_on(launcher.launch(&opts, &mut out))
        .with_context(|| {
            format!(
                "cannot run {}/{}/{}",
                opts.target.project_key, opts.target.application, opts.target.pipeline
            )
        })?;

    if json {
        print_json(&report)?;
    } else if report.outcome == LaunchOutcome::Submitted {
        println!("build #{} submitted", report.build_number);
    }

    if report.outcome == LaunchOutcome::Failed {
        anyhow::bail!("build #{} failed", report.build_number);
    }
    Ok(())
}
