//! Build Chain Launcher.
//!
//! Turns one immutable [`RunOptions`] into a [`RunRequest`] (explicit
//! parameters plus whatever a parent trigger link propagates), submits it to
//! a [`PipelineRunner`], and in streaming mode prints the log stream as it
//! arrives.

use std::io::Write;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::action::Parameter;
use crate::catalog::{BuildParent, Catalog};
use crate::error::{CdsError, Result};
use crate::log::LogRecord;
use crate::trigger::{ParentRef, RunTarget, TriggerResolver};

/// Everything a `run` invocation was asked to do, fixed at parse time.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub target: RunTarget,
    /// Stream the build log (`false` = batch: submit only).
    pub stream: bool,
    /// Raw `name=value` strings, in command-line order.
    pub parameters: Vec<String>,
    /// Raw `application/pipeline[/environment]`.
    pub parent: Option<String>,
    pub parent_build: Option<i64>,
}

impl RunOptions {
    /// Reject malformed parameters, parent references and parent build
    /// numbers. Touches neither the catalog nor the store.
    pub fn check_usage(&self) -> Result<()> {
        parse_parameters(&self.parameters)?;
        if let Some(raw) = &self.parent {
            raw.parse::<ParentRef>()?;
        }
        if self.parent_build.is_some_and(|n| n < 0) {
            return Err(CdsError::WrongUsage("parent build number must not be negative".into()));
        }
        Ok(())
    }
}

/// Payload submitted to the pipeline-run boundary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunRequest {
    pub parameters: Vec<Parameter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<BuildParent>,
}

impl RunRequest {
    pub fn parent_build_number(&self) -> i64 {
        self.parent.as_ref().map_or(0, |p| p.build_number)
    }
}

/// Handle on a submitted build.
#[derive(Debug)]
pub struct RunHandle {
    pub build_number: i64,
    /// Closed by the runner once the build is over.
    pub records: mpsc::UnboundedReceiver<LogRecord>,
}

/// The pipeline-run boundary.
#[async_trait]
pub trait PipelineRunner: Send + Sync {
    /// Start a build of `target`. With `stream` the call returns as soon as
    /// the build is recorded and records arrive while it runs; without it
    /// the call returns after the build has finished.
    async fn run_pipeline(
        &self,
        target: &RunTarget,
        request: &RunRequest,
        stream: bool,
    ) -> Result<RunHandle>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LaunchOutcome {
    /// Batch mode: the build was submitted, its log was not read.
    Submitted,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct LaunchReport {
    pub build_number: i64,
    pub outcome: LaunchOutcome,
    pub request: RunRequest,
}

/// Split `name=value` strings on the first `=`.
pub fn parse_parameters(raw: &[String]) -> Result<Vec<Parameter>> {
    raw.iter()
        .map(|entry| match entry.split_once('=') {
            Some((name, value)) if !name.is_empty() => Ok(Parameter::new(name, value)),
            _ => Err(CdsError::WrongUsage(format!(
                "parameter must be name=value, got '{entry}'"
            ))),
        })
        .collect()
}

pub struct Launcher<'a, C: Catalog + ?Sized, R: PipelineRunner + ?Sized> {
    catalog: &'a C,
    runner: &'a R,
}

impl<'a, C: Catalog + ?Sized, R: PipelineRunner + ?Sized> Launcher<'a, C, R> {
    pub fn new(catalog: &'a C, runner: &'a R) -> Self {
        Self { catalog, runner }
    }

    /// Build the request: inherited parameters first, then explicit ones,
    /// both kept as given (no deduplication).
    pub fn resolve(&self, opts: &RunOptions) -> Result<RunRequest> {
        let explicit = parse_parameters(&opts.parameters)?;

        let (mut parameters, parent) = match &opts.parent {
            Some(raw) => {
                let parent_ref: ParentRef = raw.parse()?;
                let resolved = TriggerResolver::new(self.catalog).resolve(
                    &parent_ref,
                    &opts.target,
                    opts.parent_build,
                )?;
                let lineage = BuildParent {
                    application_id: resolved.application_id,
                    pipeline_id: resolved.pipeline_id,
                    environment_id: resolved.environment_id,
                    build_number: resolved.build_number,
                };
                (resolved.parameters, Some(lineage))
            }
            None => (Vec::new(), None),
        };
        parameters.extend(explicit);
        debug!(count = parameters.len(), parent = parent.is_some(), "run request built");
        Ok(RunRequest { parameters, parent })
    }

    /// Resolve, submit, and (when streaming) print the build log to `out`.
    pub async fn launch<W: Write + Send>(&self, opts: &RunOptions, out: &mut W) -> Result<LaunchReport> {
        let request = self.resolve(opts)?;
        let mut handle = self
            .runner
            .run_pipeline(&opts.target, &request, opts.stream)
            .await?;
        info!(
            project = %opts.target.project_key,
            application = %opts.target.application,
            pipeline = %opts.target.pipeline,
            number = handle.build_number,
            "build submitted"
        );
        let outcome = if opts.stream {
            stream_logs(&mut handle.records, out).await?
        } else {
            LaunchOutcome::Submitted
        };
        Ok(LaunchReport {
            build_number: handle.build_number,
            outcome,
            request,
        })
    }
}

/// Print records in arrival order until the channel closes, flushing after
/// each line. Any terminal failure marker makes the outcome `Failed`.
pub async fn stream_logs<W: Write + Send>(
    records: &mut mpsc::UnboundedReceiver<LogRecord>,
    out: &mut W,
) -> Result<LaunchOutcome> {
    let mut outcome = LaunchOutcome::Succeeded;
    writeln!(out, "{:<19}  {:<24}  LOG", "DATE", "ACTION")?;
    out.flush()?;
    while let Some(record) = records.recv().await {
        writeln!(
            out,
            "{:<19}  {:<24}  {}",
            record.timestamp.format("%Y-%m-%d %H:%M:%S"),
            record.step,
            record.value.trim_end()
        )?;
        out.flush()?;
        if record.is_failure_marker() {
            outcome = LaunchOutcome::Failed;
        }
    }
    Ok(outcome)
}
