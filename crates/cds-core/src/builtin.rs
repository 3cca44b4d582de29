//! Host-registered routines backing `Builtin` actions.

use std::collections::{BTreeMap, HashMap};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::debug;

use crate::action::{Action, ActionKind, Parameter, ParameterType, Requirement};
use crate::executor::BuildContext;
use crate::log::{LogWriter, Status};

/// Name of the shipped shell builtin.
pub const SCRIPT_ACTION: &str = "Script";

#[async_trait]
pub trait BuiltinAction: Send + Sync {
    /// Run once for one build. Problems are reported through `log` and the
    /// returned status, never as errors.
    async fn run(
        &self,
        ctx: &BuildContext,
        step: &str,
        arguments: &BTreeMap<String, String>,
        log: &LogWriter,
    ) -> Status;
}

/// Builtin routines keyed by action name.
#[derive(Clone, Default)]
pub struct BuiltinTable {
    routines: HashMap<String, Arc<dyn BuiltinAction>>,
}

impl BuiltinTable {
    /// Table holding every routine shipped with the host.
    pub fn with_defaults() -> Self {
        let mut table = Self::default();
        table.register(SCRIPT_ACTION, Arc::new(ScriptAction));
        table
    }

    pub fn register(&mut self, name: impl Into<String>, routine: Arc<dyn BuiltinAction>) {
        self.routines.insert(name.into(), routine);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn BuiltinAction>> {
        self.routines.get(name).cloned()
    }
}

// ---------------------------------------------------------------------------
// Script
// ---------------------------------------------------------------------------

/// Runs the `script` argument with `sh -c` in the build workspace.
///
/// Every argument is exported as `CDS_<NAME>` (upper-cased, other
/// characters replaced by `_`) next to the build coordinates.
pub struct ScriptAction;

impl ScriptAction {
    /// Stored definition inserted by bootstrap.
    pub fn definition() -> Action {
        let mut action = Action::new(SCRIPT_ACTION, ActionKind::Builtin)
            .with_parameter(Parameter {
                name: "script".into(),
                kind: ParameterType::Text,
                value: String::new(),
                description: "Shell script run with sh -c in the build workspace".into(),
            })
            .with_requirement(Requirement::binary("sh"));
        action.description = "Run a shell script".into();
        action
    }
}

fn env_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    format!("CDS_{cleaned}")
}

#[async_trait]
impl BuiltinAction for ScriptAction {
    async fn run(
        &self,
        ctx: &BuildContext,
        step: &str,
        arguments: &BTreeMap<String, String>,
        log: &LogWriter,
    ) -> Status {
        let script = match arguments.get("script") {
            Some(s) if !s.trim().is_empty() => s.clone(),
            _ => {
                log.line(step, "no script to run");
                return Status::Fail;
            }
        };
        if let Err(e) = std::fs::create_dir_all(&ctx.workspace) {
            log.line(step, format!("cannot create workspace: {e}"));
            return Status::Fail;
        }

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&script)
            .current_dir(&ctx.workspace)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .env("CDS_PROJECT", &ctx.project_key)
            .env("CDS_APPLICATION", &ctx.application)
            .env("CDS_PIPELINE", &ctx.pipeline)
            .env("CDS_ENVIRONMENT", &ctx.environment)
            .env("CDS_BUILD_NUMBER", ctx.build_number.to_string());
        for (name, value) in arguments {
            cmd.env(env_name(name), value);
        }

        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                log.line(step, format!("failed to spawn sh: {e}"));
                return Status::Fail;
            }
        };
        debug!(step, "script started");

        let out_task = child.stdout.take().map(|stdout| {
            let log = log.clone();
            let step = step.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    log.line(&step, line);
                }
            })
        });
        let err_task = child.stderr.take().map(|stderr| {
            let log = log.clone();
            let step = step.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    log.line(&step, line);
                }
            })
        });
        if let Some(t) = out_task {
            let _ = t.await;
        }
        if let Some(t) = err_task {
            let _ = t.await;
        }

        match child.wait().await {
            Ok(status) if status.success() => Status::Success,
            Ok(status) => {
                let code = status
                    .code()
                    .map_or_else(|| "signal".to_string(), |c| c.to_string());
                log.line(step, format!("script exited with {code}"));
                Status::Fail
            }
            Err(e) => {
                log.line(step, format!("wait failed: {e}"));
                Status::Fail
            }
        }
    }
}
