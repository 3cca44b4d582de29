use std::fmt;

use cds_plugin::PluginError;
use thiserror::Error;

/// What a `NotFound` error failed to find.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotFoundKind {
    Project,
    Application,
    Pipeline,
    Environment,
    Action,
    PriorBuild,
    Plugin,
}

impl fmt::Display for NotFoundKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NotFoundKind::Project => "project",
            NotFoundKind::Application => "application",
            NotFoundKind::Pipeline => "pipeline",
            NotFoundKind::Environment => "environment",
            NotFoundKind::Action => "action",
            NotFoundKind::PriorBuild => "prior build",
            NotFoundKind::Plugin => "plugin",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum CdsError {
    #[error("not initialized: run 'cds init'")]
    NotInitialized,

    #[error("wrong usage: {0}")]
    WrongUsage(String),

    #[error("{kind} '{name}' not found")]
    NotFound { kind: NotFoundKind, name: String },

    #[error("link between parent {from} and child {to} not found")]
    LinkNotFound { from: String, to: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("unknown builtin action '{0}'")]
    UnknownBuiltin(String),

    #[error("action graph would contain a cycle: {0}")]
    Cycle(String),

    #[error("store error: {0}")]
    Store(String),

    #[error(transparent)]
    Plugin(#[from] PluginError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl CdsError {
    pub fn not_found(kind: NotFoundKind, name: impl Into<String>) -> Self {
        CdsError::NotFound {
            kind,
            name: name.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CdsError>;
