//! Action Executor: runs one resolved action for one build.
//!
//! Dispatch is on [`ActionKind`]:
//!
//! - `Builtin` looks the action name up in the [`BuiltinTable`]; an unknown
//!   name is a configuration error, not a `Fail`.
//! - `Plugin` spawns a fresh plugin instance, runs it once, and kills it on
//!   every exit path.
//! - `Joined` / `User` run their children in declared order under the
//!   configured [`JoinedFailurePolicy`].
//!
//! Step output goes to a [`LogWriter`]; the return value is the terminal
//! status of the action.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::Duration;

use cds_plugin::{PluginClient, PluginRef, ProgressListener, RunAction, DEFAULT_HANDSHAKE_TIMEOUT};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::action::{Action, ActionKind, ActionType, Parameter};
use crate::builtin::BuiltinTable;
use crate::error::{CdsError, Result};
use crate::log::{LogRecord, LogWriter, Status};
use crate::paths::DEFAULT_PLUGINS_DIR;
use crate::registry::{ActionRegistry, LoadOptions};

/// How long to keep collecting progress entries after a plugin answered.
const PROGRESS_GRACE: Duration = Duration::from_millis(100);

/// What a failing child of a composite action does to its later siblings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinedFailurePolicy {
    /// Skip the remaining children.
    #[default]
    Abort,
    /// Run every child; the composite still reports `Fail`.
    Continue,
}

#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub plugins_dir: PathBuf,
    pub handshake_timeout: Duration,
    /// Caller-side bound on a plugin `run`; the process is killed when it
    /// elapses.
    pub run_timeout: Option<Duration>,
    pub callback_bind: String,
    pub joined_failure: JoinedFailurePolicy,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            plugins_dir: PathBuf::from(DEFAULT_PLUGINS_DIR),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            run_timeout: None,
            callback_bind: "127.0.0.1:0".to_string(),
            joined_failure: JoinedFailurePolicy::default(),
        }
    }
}

/// Build coordinates shared by every action of one build.
#[derive(Debug, Clone)]
pub struct BuildContext {
    /// Also the build id handed to plugins.
    pub build_number: i64,
    pub project_key: String,
    pub application: String,
    pub pipeline: String,
    pub environment: String,
    pub workspace: PathBuf,
    /// Build parameters; they override action parameters of the same name.
    /// Inside a composite they are preceded by the composite's own.
    pub parameters: Vec<Parameter>,
}

impl BuildContext {
    /// Context for the children of `parent`: the composite's parameters sit
    /// between each child's defaults and the build parameters.
    pub fn for_children_of(&self, parent: &Action) -> BuildContext {
        let mut parameters = parent.parameters.clone();
        parameters.extend(self.parameters.iter().cloned());
        BuildContext {
            parameters,
            ..self.clone()
        }
    }
}

/// Status plus every step line an action produced.
#[derive(Debug, Clone)]
pub struct ActionOutcome {
    pub status: Status,
    pub records: Vec<LogRecord>,
}

pub struct ActionExecutor {
    registry: ActionRegistry,
    builtins: BuiltinTable,
    settings: ExecutorSettings,
}

impl ActionExecutor {
    pub fn new(registry: ActionRegistry, builtins: BuiltinTable, settings: ExecutorSettings) -> Self {
        Self {
            registry,
            builtins,
            settings,
        }
    }

    pub fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    pub fn registry(&self) -> &ActionRegistry {
        &self.registry
    }

    /// Run `action`, writing step lines to `log`.
    ///
    /// Returns `Err` only for configuration errors (unknown builtin, missing
    /// child); action failures are a `Status::Fail`.
    pub fn execute<'a>(
        &'a self,
        action: &'a Action,
        ctx: &'a BuildContext,
        log: &'a LogWriter,
    ) -> BoxFuture<'a, Result<Status>> {
        Box::pin(async move {
            if !action.enabled {
                log.line(&action.name, "action disabled, skipped");
                return Ok(Status::Success);
            }
            debug!(action = %action.name, kind = %action.action_type(), "executing action");
            let status = match &action.kind {
                ActionKind::Builtin => {
                    let routine = self
                        .builtins
                        .get(&action.name)
                        .ok_or_else(|| CdsError::UnknownBuiltin(action.name.clone()))?;
                    routine
                        .run(ctx, &action.name, &arguments(action, ctx), log)
                        .await
                }
                ActionKind::Plugin { plugin } => self.run_plugin(action, plugin, ctx, log).await,
                ActionKind::Joined { children } | ActionKind::User { children } => {
                    self.run_children(action, children, ctx, log).await?
                }
            };
            info!(action = %action.name, %status, "action finished");
            Ok(status)
        })
    }

    /// Fail with [`CdsError::UnknownBuiltin`] if `action`, or any enabled
    /// action below it, is a builtin with no registered routine.
    pub fn check_runnable(&self, action: &Action) -> Result<()> {
        let mut pending = vec![action.clone()];
        let mut seen = BTreeSet::new();
        while let Some(current) = pending.pop() {
            if !current.enabled {
                continue;
            }
            let unregistered = current.action_type() == ActionType::Builtin
                && self.builtins.get(&current.name).is_none();
            if unregistered {
                return Err(CdsError::UnknownBuiltin(current.name));
            }
            for &id in current.children() {
                if seen.insert(id) {
                    pending.push(self.registry.load(id, LoadOptions::default())?);
                }
            }
        }
        Ok(())
    }

    /// [`Self::execute`] with the step lines collected in memory.
    pub async fn execute_collect(&self, action: &Action, ctx: &BuildContext) -> Result<ActionOutcome> {
        let (log, mut rx) = LogWriter::channel();
        let status = self.execute(action, ctx, &log).await?;
        drop(log);
        let mut records = Vec::new();
        while let Ok(record) = rx.try_recv() {
            records.push(record);
        }
        Ok(ActionOutcome { status, records })
    }

    async fn run_children(
        &self,
        parent: &Action,
        children: &[i64],
        ctx: &BuildContext,
        log: &LogWriter,
    ) -> Result<Status> {
        let child_ctx = ctx.for_children_of(parent);
        let mut overall = Status::Success;
        for (i, &id) in children.iter().enumerate() {
            let child = self.registry.load(id, LoadOptions::with_clear_passwords())?;
            let status = self.execute(&child, &child_ctx, log).await?;
            overall = overall.worst(status);
            if status == Status::Fail && self.settings.joined_failure == JoinedFailurePolicy::Abort {
                let skipped = children.len() - i - 1;
                if skipped > 0 {
                    log.line(
                        &parent.name,
                        format!("'{}' failed, skipping {skipped} remaining step(s)", child.name),
                    );
                }
                break;
            }
        }
        Ok(overall)
    }

    async fn run_plugin(
        &self,
        action: &Action,
        plugin_name: &str,
        ctx: &BuildContext,
        log: &LogWriter,
    ) -> Status {
        let step = action.name.as_str();
        let plugin = match PluginRef::discover(&self.settings.plugins_dir, plugin_name) {
            Ok(Some(p)) => p,
            Ok(None) => {
                log.line(step, format!("plugin '{plugin_name}' is not installed"));
                return Status::Fail;
            }
            Err(e) => {
                log.line(step, format!("plugin '{plugin_name}' is unusable: {e}"));
                return Status::Fail;
            }
        };
        let mut listener = match ProgressListener::bind(&self.settings.callback_bind).await {
            Ok(l) => l,
            Err(e) => {
                log.line(step, format!("cannot bind progress callback: {e}"));
                return Status::Fail;
            }
        };

        let mut client = PluginClient::new(plugin, Uuid::new_v4().to_string(), listener.address());
        let run = RunAction {
            build_id: ctx.build_number,
            arguments: arguments(action, ctx),
        };
        let status = self
            .drive_plugin(&mut client, &mut listener, &run, step, log)
            .await;
        // Whatever happened above, the instance ends here.
        client.kill().await;
        for entry in listener.settle(PROGRESS_GRACE).await {
            log.progress(&entry);
        }
        status
    }

    async fn drive_plugin(
        &self,
        client: &mut PluginClient,
        listener: &mut ProgressListener,
        run: &RunAction,
        step: &str,
        log: &LogWriter,
    ) -> Status {
        if let Err(e) = client.spawn(self.settings.handshake_timeout).await {
            warn!(plugin = %client.plugin().name, "plugin failed to start: {e}");
            log.line(step, format!("plugin failed to start: {e}"));
            return Status::Fail;
        }

        let run_timeout = self.settings.run_timeout;
        let deadline = async move {
            match run_timeout {
                Some(d) => tokio::time::sleep(d).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(deadline);
        let run_call = client.try_run(run);
        tokio::pin!(run_call);

        loop {
            tokio::select! {
                result = &mut run_call => {
                    return match result {
                        Ok(status) => status.into(),
                        Err(e) => {
                            warn!(step, "plugin run failed: {e}");
                            log.line(step, format!("plugin run failed: {e}"));
                            Status::Fail
                        }
                    };
                }
                Some(entry) = listener.recv() => log.progress(&entry),
                _ = &mut deadline => {
                    log.line(step, "plugin run timed out");
                    return Status::Fail;
                }
            }
        }
    }
}

/// Action parameters, overridden by build parameters of the same name.
fn arguments(action: &Action, ctx: &BuildContext) -> BTreeMap<String, String> {
    let mut args = action.argument_map();
    for p in &ctx.parameters {
        args.insert(p.name.clone(), p.value.clone());
    }
    args
}
