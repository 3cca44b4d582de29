//! Projects, applications, pipelines, environments, trigger links and
//! builds: the containment hierarchy the orchestration core reads.
//!
//! The catalog is seeded from a YAML [`CatalogDocument`] and persisted by
//! [`crate::store::Store`]. Consumers that only need lookups go through the
//! [`Catalog`] trait.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::action::{ActionId, Parameter};
use crate::error::Result;
use crate::log::Status;

/// Name of the environment used when a pipeline runs without one.
pub const NO_ENV: &str = "NoEnv";
/// Identifier of [`NO_ENV`]; real environments are numbered after it.
pub const NO_ENV_ID: i64 = 1;

// ---------------------------------------------------------------------------
// Containment hierarchy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub key: String,
    pub name: String,
    #[serde(default)]
    pub applications: Vec<Application>,
    #[serde(default)]
    pub pipelines: Vec<Pipeline>,
    #[serde(default)]
    pub environments: Vec<Environment>,
    #[serde(default)]
    pub triggers: Vec<TriggerLink>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Application {
    pub id: i64,
    pub name: String,
    /// Attached pipeline ids.
    #[serde(default)]
    pub pipelines: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub stages: Vec<Stage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    pub id: i64,
    pub name: String,
    /// Member actions, run in this order.
    #[serde(default)]
    pub actions: Vec<ActionId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    pub id: i64,
    pub name: String,
}

impl Environment {
    pub fn no_env() -> Self {
        Self {
            id: NO_ENV_ID,
            name: NO_ENV.to_string(),
        }
    }
}

impl Project {
    pub fn application(&self, name: &str) -> Option<&Application> {
        self.applications.iter().find(|a| a.name == name)
    }

    pub fn pipeline(&self, name: &str) -> Option<&Pipeline> {
        self.pipelines.iter().find(|p| p.name == name)
    }

    pub fn pipeline_by_id(&self, id: i64) -> Option<&Pipeline> {
        self.pipelines.iter().find(|p| p.id == id)
    }

    /// Look up an environment by name; [`NO_ENV`] always resolves.
    pub fn environment(&self, name: &str) -> Option<Environment> {
        if name == NO_ENV {
            return Some(Environment::no_env());
        }
        self.environments.iter().find(|e| e.name == name).cloned()
    }

    /// Pipelines attached to `app`, in attachment order.
    pub fn pipelines_of<'a>(&'a self, app: &'a Application) -> impl Iterator<Item = &'a Pipeline> {
        app.pipelines
            .iter()
            .filter_map(move |id| self.pipeline_by_id(*id))
    }

    /// Trigger links leaving `source`.
    pub fn triggers_from<'a>(&'a self, source: &'a Endpoint) -> impl Iterator<Item = &'a TriggerLink> {
        self.triggers.iter().filter(move |t| &t.source == source)
    }
}

// ---------------------------------------------------------------------------
// Trigger links
// ---------------------------------------------------------------------------

/// One (application, pipeline, environment) triple, by name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub application: String,
    pub pipeline: String,
    #[serde(default = "default_environment")]
    pub environment: String,
}

fn default_environment() -> String {
    NO_ENV.to_string()
}

impl Endpoint {
    pub fn new(
        application: impl Into<String>,
        pipeline: impl Into<String>,
        environment: impl Into<String>,
    ) -> Self {
        Self {
            application: application.into(),
            pipeline: pipeline.into(),
            environment: environment.into(),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.application, self.pipeline, self.environment)
    }
}

/// Fires `dest` when `source` completes, passing `parameters` along.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerLink {
    pub source: Endpoint,
    pub dest: Endpoint,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
}

// ---------------------------------------------------------------------------
// Builds
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BuildStatus {
    Building,
    Success,
    Fail,
    Warning,
}

impl From<Status> for BuildStatus {
    fn from(s: Status) -> Self {
        match s {
            Status::Success => BuildStatus::Success,
            Status::Fail => BuildStatus::Fail,
            Status::Warning => BuildStatus::Warning,
        }
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BuildStatus::Building => "Building",
            BuildStatus::Success => "Success",
            BuildStatus::Fail => "Fail",
            BuildStatus::Warning => "Warning",
        };
        f.write_str(s)
    }
}

/// Lineage of a build started by a trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildParent {
    pub application_id: i64,
    pub pipeline_id: i64,
    pub environment_id: i64,
    pub build_number: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineBuild {
    pub project_key: String,
    pub application: String,
    pub application_id: i64,
    pub pipeline: String,
    pub pipeline_id: i64,
    pub environment: String,
    pub environment_id: i64,
    /// Assigned by the store; 0 before the build is recorded.
    pub number: i64,
    pub status: BuildStatus,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<BuildParent>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Lookup seam
// ---------------------------------------------------------------------------

/// Read access to the catalog and build history.
pub trait Catalog {
    /// Fails with `NotFound { kind: Project }` when `key` is unknown.
    fn project(&self, key: &str) -> Result<Project>;

    /// Highest recorded build number of the triple, if any.
    fn latest_build(&self, application_id: i64, pipeline_id: i64, environment_id: i64)
        -> Result<Option<i64>>;
}

// ---------------------------------------------------------------------------
// CatalogDocument: import format, everything referenced by name
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogDocument {
    #[serde(default)]
    pub projects: Vec<ProjectDocument>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectDocument {
    pub key: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub environments: Vec<String>,
    #[serde(default)]
    pub pipelines: Vec<PipelineDocument>,
    #[serde(default)]
    pub applications: Vec<ApplicationDocument>,
    #[serde(default)]
    pub triggers: Vec<TriggerLink>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDocument {
    pub name: String,
    #[serde(default)]
    pub stages: Vec<StageDocument>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDocument {
    pub name: String,
    /// Action names.
    #[serde(default)]
    pub actions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationDocument {
    pub name: String,
    /// Pipeline names.
    #[serde(default)]
    pub pipelines: Vec<String>,
}

impl CatalogDocument {
    pub fn parse(data: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(data)?)
    }
}
