//! In-process pipeline runner: the [`PipelineRunner`] used by the CLI.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};

use crate::catalog::{BuildStatus, Catalog, Pipeline, PipelineBuild};
use crate::error::{CdsError, NotFoundKind, Result};
use crate::executor::{ActionExecutor, BuildContext};
use crate::launcher::{PipelineRunner, RunHandle, RunRequest};
use crate::log::{LogWriter, Status};
use crate::paths;
use crate::registry::LoadOptions;
use crate::store::Store;
use crate::trigger::RunTarget;

/// Runs pipelines on this host: stages in order, actions within a stage in
/// order. A failed stage skips the stages after it; a warning does not.
pub struct LocalRunner {
    store: Arc<Store>,
    executor: Arc<ActionExecutor>,
    workspaces: PathBuf,
}

impl LocalRunner {
    pub fn new(store: Arc<Store>, executor: Arc<ActionExecutor>, workspaces: PathBuf) -> Self {
        Self {
            store,
            executor,
            workspaces,
        }
    }
}

#[async_trait]
impl PipelineRunner for LocalRunner {
    async fn run_pipeline(
        &self,
        target: &RunTarget,
        request: &RunRequest,
        stream: bool,
    ) -> Result<RunHandle> {
        let project = Catalog::project(self.store.as_ref(), &target.project_key)?;
        let application = project.application(&target.application).ok_or_else(|| {
            CdsError::not_found(NotFoundKind::Application, target.application.as_str())
        })?;
        let pipeline = project
            .pipelines_of(application)
            .find(|p| p.name == target.pipeline)
            .cloned()
            .ok_or_else(|| {
                CdsError::not_found(
                    NotFoundKind::Pipeline,
                    format!("{}/{}", target.application, target.pipeline),
                )
            })?;
        let environment = project.environment(target.environment_name()).ok_or_else(|| {
            CdsError::not_found(NotFoundKind::Environment, target.environment_name())
        })?;

        // Configuration errors stop the run before a build number is taken.
        let registry = self.executor.registry();
        for &id in pipeline.stages.iter().flat_map(|s| &s.actions) {
            let action = registry.load(id, LoadOptions::default())?;
            self.executor.check_runnable(&action)?;
        }

        let build = self.store.start_build(&PipelineBuild {
            project_key: project.key.clone(),
            application: application.name.clone(),
            application_id: application.id,
            pipeline: pipeline.name.clone(),
            pipeline_id: pipeline.id,
            environment: environment.name.clone(),
            environment_id: environment.id,
            number: 0,
            status: BuildStatus::Building,
            parameters: request.parameters.clone(),
            parent: request.parent.clone(),
            started_at: Utc::now(),
            finished_at: None,
        })?;

        let ctx = BuildContext {
            build_number: build.number,
            project_key: build.project_key.clone(),
            application: build.application.clone(),
            pipeline: build.pipeline.clone(),
            environment: build.environment.clone(),
            workspace: paths::build_workspace(
                &self.workspaces,
                &build.project_key,
                &build.application,
                &build.pipeline,
                &build.environment,
                build.number,
            ),
            parameters: build.parameters.clone(),
        };
        let (log, records) = LogWriter::channel();
        let build_number = build.number;
        let job = BuildJob {
            store: Arc::clone(&self.store),
            executor: Arc::clone(&self.executor),
            build,
            pipeline,
            ctx,
            log,
        };

        if stream {
            tokio::spawn(job.run());
        } else {
            job.run().await;
        }
        Ok(RunHandle {
            build_number,
            records,
        })
    }
}

/// One build in flight. Dropping it (at the end of `run`) closes the log.
struct BuildJob {
    store: Arc<Store>,
    executor: Arc<ActionExecutor>,
    build: PipelineBuild,
    pipeline: Pipeline,
    ctx: BuildContext,
    log: LogWriter,
}

impl BuildJob {
    async fn run(mut self) {
        let mut status = Status::Success;
        let stages = self.pipeline.stages.len();
        'stages: for (i, stage) in self.pipeline.stages.iter().enumerate() {
            let mut stage_status = Status::Success;
            for &id in &stage.actions {
                match self.run_action(id).await {
                    Ok(s) => stage_status = stage_status.worst(s),
                    Err(e) => {
                        warn!(stage = %stage.name, "build aborted: {e}");
                        self.log.line(
                            &stage.name,
                            format!("configuration error, build aborted: {e}"),
                        );
                        status = Status::Fail;
                        break 'stages;
                    }
                }
            }
            status = status.worst(stage_status);
            if stage_status == Status::Fail {
                let skipped = stages - i - 1;
                if skipped > 0 {
                    self.log.line(
                        &stage.name,
                        format!("stage failed, skipping {skipped} remaining stage(s)"),
                    );
                }
                break;
            }
        }

        self.build.status = status.into();
        self.build.finished_at = Some(Utc::now());
        if let Err(e) = self.store.finish_build(&self.build) {
            warn!(number = self.build.number, "failed to record build result: {e}");
        }
        info!(
            pipeline = %self.build.pipeline,
            number = self.build.number,
            %status,
            "build finished"
        );
        self.log.terminal(status);
    }

    /// `Err` only for configuration errors, which abort the whole build.
    async fn run_action(&self, id: i64) -> Result<Status> {
        let action = self
            .executor
            .registry()
            .load(id, LoadOptions::with_clear_passwords())?;
        self.executor.execute(&action, &self.ctx, &self.log).await
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::action::{Action, ActionKind, Parameter};
    use crate::builtin::{BuiltinAction, BuiltinTable};
    use crate::catalog::{BuildParent, CatalogDocument, NO_ENV_ID};
    use crate::executor::ExecutorSettings;
    use crate::log::LogRecord;
    use crate::registry::ActionRegistry;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    struct Fixed(Status);

    #[async_trait]
    impl BuiltinAction for Fixed {
        async fn run(
            &self,
            ctx: &BuildContext,
            step: &str,
            arguments: &BTreeMap<String, String>,
            log: &LogWriter,
        ) -> Status {
            let who = arguments.get("who").map(String::as_str).unwrap_or("-");
            log.line(step, format!("#{} {who}", ctx.build_number));
            self.0
        }
    }

    const CATALOG: &str = r#"
projects:
  - key: PRJ
    pipelines:
      - name: build
        stages:
          - name: one
            actions: [ok, meh]
          - name: two
            actions: [ok]
      - name: broken
        stages:
          - name: one
            actions: [bad, ok]
          - name: two
            actions: [ok]
    applications:
      - name: api
        pipelines: [build, broken]
"#;

    fn runner() -> (TempDir, Arc<Store>, LocalRunner) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(Store::open(&dir.path().join("cds.redb")).unwrap());
        let registry = ActionRegistry::new(Arc::clone(&store));
        let mut builtins = BuiltinTable::default();
        for (name, status) in [("ok", Status::Success), ("bad", Status::Fail), ("meh", Status::Warning)] {
            builtins.register(name, Arc::new(Fixed(status)));
            registry.insert(&Action::new(name, ActionKind::Builtin), true).unwrap();
        }
        store
            .import_catalog(&CatalogDocument::parse(CATALOG).unwrap())
            .unwrap();
        let executor = ActionExecutor::new(registry, builtins, ExecutorSettings::default());
        let runner = LocalRunner::new(Arc::clone(&store), Arc::new(executor), dir.path().join("ws"));
        (dir, store, runner)
    }

    fn target(pipeline: &str) -> RunTarget {
        RunTarget {
            project_key: "PRJ".into(),
            application: "api".into(),
            pipeline: pipeline.into(),
            environment: None,
        }
    }

    fn request() -> RunRequest {
        RunRequest {
            parameters: vec![Parameter::new("who", "ci")],
            parent: None,
        }
    }

    async fn collect(handle: &mut RunHandle) -> Vec<LogRecord> {
        let mut records = Vec::new();
        while let Some(r) = handle.records.recv().await {
            records.push(r);
        }
        records
    }

    #[tokio::test]
    async fn warning_does_not_stop_later_stages() {
        let (_dir, store, runner) = runner();
        let mut handle = runner
            .run_pipeline(&target("build"), &request(), true)
            .await
            .unwrap();
        assert_eq!(handle.build_number, 1);

        let records = collect(&mut handle).await;
        let lines: Vec<(&str, &str)> = records
            .iter()
            .map(|r| (r.step.as_str(), r.value.as_str()))
            .collect();
        assert_eq!(
            lines,
            vec![
                ("ok", "#1 ci"),
                ("meh", "#1 ci"),
                ("ok", "#1 ci"),
                ("", "status: Warning"),
            ]
        );
        assert_eq!(records.last().unwrap().id, 0);

        let project = Catalog::project(store.as_ref(), "PRJ").unwrap();
        let app = project.application("api").unwrap();
        let pip = project.pipeline("build").unwrap();
        let builds = store.builds(app.id, pip.id, NO_ENV_ID).unwrap();
        assert_eq!(builds[0].status, BuildStatus::Warning);
        assert!(builds[0].finished_at.is_some());
    }

    #[tokio::test]
    async fn failed_stage_skips_the_rest() {
        let (_dir, _store, runner) = runner();
        let mut handle = runner
            .run_pipeline(&target("broken"), &request(), true)
            .await
            .unwrap();
        let records = collect(&mut handle).await;
        let steps: Vec<&str> = records.iter().map(|r| r.step.as_str()).collect();
        // Both members of the failing stage run; stage two does not.
        assert_eq!(steps, vec!["bad", "ok", "one", ""]);
        assert!(records.last().unwrap().is_failure_marker());
    }

    #[tokio::test]
    async fn batch_mode_returns_a_finished_build() {
        let (_dir, _store, runner) = runner();
        let mut handle = runner
            .run_pipeline(&target("build"), &request(), false)
            .await
            .unwrap();
        // Everything is already buffered and the sender is gone.
        let mut count = 0;
        while handle.records.try_recv().is_ok() {
            count += 1;
        }
        assert_eq!(count, 4);
        assert!(handle.records.recv().await.is_none());

        let second = runner
            .run_pipeline(&target("build"), &request(), false)
            .await
            .unwrap();
        assert_eq!(second.build_number, 2);
    }

    #[tokio::test]
    async fn parent_lineage_is_recorded() {
        let (_dir, store, runner) = runner();
        let parent = BuildParent {
            application_id: 1,
            pipeline_id: 1,
            environment_id: NO_ENV_ID,
            build_number: 5,
        };
        let req = RunRequest {
            parameters: vec![],
            parent: Some(parent.clone()),
        };
        let handle = runner.run_pipeline(&target("build"), &req, false).await.unwrap();

        let project = Catalog::project(store.as_ref(), "PRJ").unwrap();
        let app = project.application("api").unwrap();
        let pip = project.pipeline("build").unwrap();
        let builds = store.builds(app.id, pip.id, NO_ENV_ID).unwrap();
        assert_eq!(builds[0].number, handle.build_number);
        assert_eq!(builds[0].parent, Some(parent));
    }

    #[tokio::test]
    async fn unregistered_builtin_is_rejected_before_the_build() {
        let (_dir, store, runner) = runner();
        let registry = ActionRegistry::new(Arc::clone(&store));
        registry
            .insert(&Action::new("Mystery", ActionKind::Builtin), true)
            .unwrap();
        store
            .import_catalog(
                &CatalogDocument::parse(
                    "projects:\n  - key: ODD\n    pipelines:\n      - name: build\n        stages:\n          - name: one\n            actions: [Mystery]\n    applications:\n      - name: api\n        pipelines: [build]\n",
                )
                .unwrap(),
            )
            .unwrap();

        let mut odd = target("build");
        odd.project_key = "ODD".into();
        let err = runner
            .run_pipeline(&odd, &request(), true)
            .await
            .unwrap_err();
        assert!(matches!(err, CdsError::UnknownBuiltin(name) if name == "Mystery"));

        let project = Catalog::project(store.as_ref(), "ODD").unwrap();
        let app = project.application("api").unwrap();
        let pip = project.pipeline("build").unwrap();
        assert!(store.builds(app.id, pip.id, NO_ENV_ID).unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_targets_are_not_found() {
        let (_dir, _store, runner) = runner();
        let err = runner
            .run_pipeline(&target("nope"), &request(), true)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CdsError::NotFound {
                kind: NotFoundKind::Pipeline,
                ..
            }
        ));

        let mut with_env = target("build");
        with_env.environment = Some("prod".into());
        let err = runner
            .run_pipeline(&with_env, &request(), true)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CdsError::NotFound {
                kind: NotFoundKind::Environment,
                ..
            }
        ));
    }
}
