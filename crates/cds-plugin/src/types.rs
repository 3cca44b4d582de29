//! Wire types for the plugin protocol and the on-disk plugin layout.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::Result;

/// Environment variable carrying the opaque instance token.
pub const INSTANCE_ENV: &str = "CDS_PLUGIN_INSTANCE";
/// Environment variable carrying the host's progress callback address.
pub const CALLBACK_ENV: &str = "CDS_PLUGIN_CALLBACK";
/// Optional manifest file inside a plugin's installation directory.
pub const MANIFEST_FILE: &str = "plugin.yaml";

/// Declared parameter defaults: name → default value.
pub type Parameters = BTreeMap<String, String>;

// ─── PluginRef ────────────────────────────────────────────────────────────

/// Where a plugin lives and how to start it.
#[derive(Debug, Clone, PartialEq)]
pub struct PluginRef {
    pub name: String,
    /// Installation directory; used as the working directory of the process.
    pub dir: PathBuf,
    pub program: PathBuf,
    pub args: Vec<String>,
}

/// Optional `plugin.yaml` overriding the default executable.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginManifest {
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
}

impl PluginRef {
    /// Plugin executed as `<dir>/<name>` with no arguments.
    pub fn new(name: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        let name = name.into();
        let dir = dir.into();
        Self {
            program: dir.join(&name),
            name,
            dir,
            args: Vec::new(),
        }
    }

    /// Resolve `<plugins_dir>/<name>`, honouring `plugin.yaml` when present.
    ///
    /// Returns `Ok(None)` when the installation directory does not exist.
    pub fn discover(plugins_dir: &Path, name: &str) -> Result<Option<Self>> {
        let dir = plugins_dir.join(name);
        if !dir.is_dir() {
            return Ok(None);
        }
        let mut plugin = Self::new(name, &dir);
        let manifest_path = dir.join(MANIFEST_FILE);
        if manifest_path.exists() {
            let data = std::fs::read_to_string(&manifest_path)?;
            let manifest: PluginManifest = serde_yaml::from_str(&data)?;
            if let Some(command) = manifest.command {
                plugin.program = PathBuf::from(command);
            }
            plugin.args = manifest.args;
        }
        Ok(Some(plugin))
    }
}

// ─── PluginStatus ─────────────────────────────────────────────────────────

/// Terminal status of a plugin `run` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PluginStatus {
    Success,
    Fail,
    Warning,
}

impl PluginStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PluginStatus::Success => "Success",
            PluginStatus::Fail => "Fail",
            PluginStatus::Warning => "Warning",
        }
    }
}

impl fmt::Display for PluginStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Instance state ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    /// Created, process not started (or start in progress).
    Spawning,
    Ready,
    Running,
    Dead,
}

// ─── RPC messages ─────────────────────────────────────────────────────────

/// Argument of a `run` call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunAction {
    pub build_id: i64,
    #[serde(default)]
    pub arguments: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    Name,
    Author,
    Description,
    Parameters,
    Run,
}

#[derive(Debug, Serialize)]
pub(crate) struct Request<'a> {
    pub id: u64,
    pub method: Method,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<&'a RunAction>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Response {
    pub id: u64,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
}

/// First line a plugin writes once it is able to serve calls.
#[derive(Debug, Deserialize)]
pub(crate) struct Ready {
    pub ready: bool,
    #[serde(default)]
    pub instance: String,
}

/// A progress entry pushed by a plugin to the callback address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEntry {
    pub step: String,
    #[serde(default)]
    pub entries: BTreeMap<String, String>,
}
