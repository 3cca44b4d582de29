//! Trigger Resolver: turns a parent reference into concrete build lineage
//! and the parameters its trigger link propagates.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use tracing::debug;

use crate::action::Parameter;
use crate::catalog::{Catalog, Endpoint, Environment, NO_ENV};
use crate::error::{CdsError, NotFoundKind, Result};

/// `application/pipeline[/environment]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentRef {
    pub application: String,
    pub pipeline: String,
    pub environment: Option<String>,
}

impl FromStr for ParentRef {
    type Err = CdsError;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split('/').collect();
        if !(2..=3).contains(&parts.len()) || parts.iter().any(|p| p.is_empty()) {
            return Err(CdsError::WrongUsage(format!(
                "parent must be application/pipeline[/environment], got '{s}'"
            )));
        }
        Ok(Self {
            application: parts[0].to_string(),
            pipeline: parts[1].to_string(),
            environment: parts.get(2).map(|e| e.to_string()),
        })
    }
}

impl fmt::Display for ParentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.application, self.pipeline)?;
        if let Some(env) = &self.environment {
            write!(f, "/{env}")?;
        }
        Ok(())
    }
}

/// The pipeline a run is launched for. Environment `None` means [`NO_ENV`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunTarget {
    pub project_key: String,
    pub application: String,
    pub pipeline: String,
    pub environment: Option<String>,
}

impl RunTarget {
    pub fn environment_name(&self) -> &str {
        self.environment.as_deref().unwrap_or(NO_ENV)
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(&self.application, &self.pipeline, self.environment_name())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedParent {
    pub application_id: i64,
    pub pipeline_id: i64,
    pub environment_id: i64,
    pub build_number: i64,
    /// Parameter template of the matched trigger link.
    pub parameters: Vec<Parameter>,
}

pub struct TriggerResolver<'a, C: Catalog + ?Sized> {
    catalog: &'a C,
}

impl<'a, C: Catalog + ?Sized> TriggerResolver<'a, C> {
    pub fn new(catalog: &'a C) -> Self {
        Self { catalog }
    }

    /// Resolve `parent` for a run of `target`.
    ///
    /// `parent_build` of `None` or `Some(0)` selects the latest build of the
    /// parent triple.
    pub fn resolve(
        &self,
        parent: &ParentRef,
        target: &RunTarget,
        parent_build: Option<i64>,
    ) -> Result<ResolvedParent> {
        if parent_build.is_some_and(|n| n < 0) {
            return Err(CdsError::WrongUsage("parent build number must not be negative".into()));
        }
        let project = self.catalog.project(&target.project_key)?;

        let application = project.application(&parent.application).ok_or_else(|| {
            CdsError::not_found(NotFoundKind::Application, parent.application.as_str())
        })?;
        let pipeline = project
            .pipeline(&parent.pipeline)
            .ok_or_else(|| CdsError::not_found(NotFoundKind::Pipeline, parent.pipeline.as_str()))?;
        let environment = match &parent.environment {
            None => Environment::no_env(),
            Some(name) => project
                .environment(name)
                .ok_or_else(|| CdsError::not_found(NotFoundKind::Environment, name.as_str()))?,
        };

        let source = Endpoint::new(&application.name, &pipeline.name, &environment.name);
        let dest = target.endpoint();
        let link = project
            .triggers_from(&source)
            .find(|t| t.dest == dest)
            .ok_or_else(|| CdsError::LinkNotFound {
                from: source.to_string(),
                to: dest.to_string(),
            })?;

        let build_number = match parent_build {
            Some(n) if n > 0 => n,
            _ => self
                .catalog
                .latest_build(application.id, pipeline.id, environment.id)?
                .ok_or_else(|| CdsError::not_found(NotFoundKind::PriorBuild, source.to_string()))?,
        };
        debug!(%source, %dest, build_number, "parent resolved");

        Ok(ResolvedParent {
            application_id: application.id,
            pipeline_id: pipeline.id,
            environment_id: environment.id,
            build_number,
            parameters: link.parameters.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Application, Pipeline, Project, TriggerLink, NO_ENV_ID};

    struct FakeCatalog {
        project: Project,
        latest: Option<i64>,
    }

    impl Catalog for FakeCatalog {
        fn project(&self, key: &str) -> Result<Project> {
            if key == self.project.key {
                Ok(self.project.clone())
            } else {
                Err(CdsError::not_found(NotFoundKind::Project, key))
            }
        }

        fn latest_build(&self, _app: i64, _pip: i64, _env: i64) -> Result<Option<i64>> {
            Ok(self.latest)
        }
    }

    fn catalog(latest: Option<i64>) -> FakeCatalog {
        let project = Project {
            key: "PRJ".into(),
            name: "Project".into(),
            applications: vec![
                Application {
                    id: 10,
                    name: "appX".into(),
                    pipelines: vec![20],
                },
                Application {
                    id: 11,
                    name: "target".into(),
                    pipelines: vec![21],
                },
            ],
            pipelines: vec![
                Pipeline {
                    id: 20,
                    name: "pipY".into(),
                    stages: vec![],
                },
                Pipeline {
                    id: 21,
                    name: "deploy".into(),
                    stages: vec![],
                },
            ],
            environments: vec![Environment {
                id: 30,
                name: "envZ".into(),
            }],
            triggers: vec![
                TriggerLink {
                    source: Endpoint::new("appX", "pipY", "envZ"),
                    dest: Endpoint::new("target", "deploy", NO_ENV),
                    parameters: vec![Parameter::new("k", "v")],
                },
                TriggerLink {
                    source: Endpoint::new("appX", "pipY", NO_ENV),
                    dest: Endpoint::new("target", "deploy", "envZ"),
                    parameters: vec![],
                },
            ],
        };
        FakeCatalog { project, latest }
    }

    fn target(env: Option<&str>) -> RunTarget {
        RunTarget {
            project_key: "PRJ".into(),
            application: "target".into(),
            pipeline: "deploy".into(),
            environment: env.map(str::to_string),
        }
    }

    #[test]
    fn parent_ref_parsing() {
        let two: ParentRef = "app/pip".parse().unwrap();
        assert_eq!(two.environment, None);
        let three: ParentRef = "app/pip/env".parse().unwrap();
        assert_eq!(three.environment.as_deref(), Some("env"));
        assert_eq!(three.to_string(), "app/pip/env");

        for bad in ["app", "app/pip/env/extra", "app//env", "/pip", ""] {
            assert!(
                matches!(bad.parse::<ParentRef>(), Err(CdsError::WrongUsage(_))),
                "expected WrongUsage for '{bad}'"
            );
        }
    }

    #[test]
    fn latest_build_is_used_when_number_is_zero() {
        let cat = catalog(Some(42));
        let parent: ParentRef = "appX/pipY/envZ".parse().unwrap();
        let resolved = TriggerResolver::new(&cat)
            .resolve(&parent, &target(None), Some(0))
            .unwrap();
        assert_eq!(resolved.build_number, 42);
        assert_eq!(resolved.application_id, 10);
        assert_eq!(resolved.pipeline_id, 20);
        assert_eq!(resolved.environment_id, 30);
        assert_eq!(resolved.parameters, vec![Parameter::new("k", "v")]);
    }

    #[test]
    fn explicit_build_number_wins() {
        let cat = catalog(Some(42));
        let parent: ParentRef = "appX/pipY/envZ".parse().unwrap();
        let resolved = TriggerResolver::new(&cat)
            .resolve(&parent, &target(None), Some(7))
            .unwrap();
        assert_eq!(resolved.build_number, 7);
    }

    #[test]
    fn omitted_environment_is_no_env() {
        let cat = catalog(Some(3));
        let parent: ParentRef = "appX/pipY".parse().unwrap();
        let resolved = TriggerResolver::new(&cat)
            .resolve(&parent, &target(Some("envZ")), None)
            .unwrap();
        assert_eq!(resolved.environment_id, NO_ENV_ID);
        assert!(resolved.parameters.is_empty());
    }

    #[test]
    fn missing_entities_are_not_found() {
        let cat = catalog(Some(1));
        let resolver = TriggerResolver::new(&cat);
        let cases = [
            ("nope/pipY", NotFoundKind::Application),
            ("appX/nope", NotFoundKind::Pipeline),
            ("appX/pipY/nope", NotFoundKind::Environment),
        ];
        for (parent, kind) in cases {
            let err = resolver
                .resolve(&parent.parse().unwrap(), &target(None), None)
                .unwrap_err();
            assert!(
                matches!(err, CdsError::NotFound { kind: k, .. } if k == kind),
                "{parent}: {err}"
            );
        }
    }

    #[test]
    fn no_matching_link() {
        let cat = catalog(Some(1));
        let parent: ParentRef = "appX/pipY/envZ".parse().unwrap();
        let err = TriggerResolver::new(&cat)
            .resolve(&parent, &target(Some("envZ")), None)
            .unwrap_err();
        assert!(matches!(err, CdsError::LinkNotFound { .. }), "{err}");
    }

    #[test]
    fn no_prior_build_is_fatal() {
        let cat = catalog(None);
        let parent: ParentRef = "appX/pipY/envZ".parse().unwrap();
        let err = TriggerResolver::new(&cat)
            .resolve(&parent, &target(None), None)
            .unwrap_err();
        assert!(matches!(
            err,
            CdsError::NotFound {
                kind: NotFoundKind::PriorBuild,
                ..
            }
        ));
    }
}
