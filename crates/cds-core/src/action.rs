//! Action data model.
//!
//! An `Action` is a named, reusable unit of pipeline work. Its `kind` says
//! how it runs: a host routine (`Builtin`), an out-of-process plugin
//! (`Plugin`), or an ordered list of child actions (`Joined` for system
//! composites, `User` for user-defined ones). Child lists are the edges of
//! the action DAG.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{CdsError, Result};

pub type ActionId = i64;
pub type ActorId = i64;

/// Value shown instead of a password parameter's secret.
pub const PASSWORD_PLACEHOLDER: &str = "**********";

// ---------------------------------------------------------------------------
// Parameter
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterType {
    #[default]
    String,
    Text,
    Boolean,
    Number,
    List,
    Password,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: ParameterType,
    #[serde(default)]
    pub value: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

impl Parameter {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ParameterType::String,
            value: value.into(),
            description: String::new(),
        }
    }

    pub fn password(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            kind: ParameterType::Password,
            ..Self::new(name, value)
        }
    }

    pub fn is_password(&self) -> bool {
        self.kind == ParameterType::Password
    }
}

// ---------------------------------------------------------------------------
// Requirement
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequirementType {
    Binary,
    Hostname,
    Memory,
    Network,
    Plugin,
    Service,
}

impl fmt::Display for RequirementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RequirementType::Binary => "binary",
            RequirementType::Hostname => "hostname",
            RequirementType::Memory => "memory",
            RequirementType::Network => "network",
            RequirementType::Plugin => "plugin",
            RequirementType::Service => "service",
        })
    }
}

/// A capability the execution host must provide.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Requirement {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: RequirementType,
    pub value: String,
}

impl Requirement {
    pub fn binary(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            value: name.clone(),
            name,
            kind: RequirementType::Binary,
        }
    }
}

// ---------------------------------------------------------------------------
// ActionType / ActionKind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Builtin,
    Plugin,
    Joined,
    User,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::Builtin => "builtin",
            ActionType::Plugin => "plugin",
            ActionType::Joined => "joined",
            ActionType::User => "user",
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an action executes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionKind {
    /// Host routine registered under the action's name.
    Builtin,
    /// Delegated to the named plugin, one process per invocation.
    Plugin { plugin: String },
    /// System composite: children run in declared order.
    Joined { children: Vec<ActionId> },
    /// User-defined composite: children run in declared order.
    User { children: Vec<ActionId> },
}

impl ActionKind {
    pub fn action_type(&self) -> ActionType {
        match self {
            ActionKind::Builtin => ActionType::Builtin,
            ActionKind::Plugin { .. } => ActionType::Plugin,
            ActionKind::Joined { .. } => ActionType::Joined,
            ActionKind::User { .. } => ActionType::User,
        }
    }

    pub fn children(&self) -> &[ActionId] {
        match self {
            ActionKind::Joined { children } | ActionKind::User { children } => children,
            ActionKind::Builtin | ActionKind::Plugin { .. } => &[],
        }
    }
}

// ---------------------------------------------------------------------------
// Action
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    /// Zero until the action has been inserted.
    #[serde(default)]
    pub id: ActionId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(flatten)]
    pub kind: ActionKind,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub public: bool,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
    #[serde(default)]
    pub requirements: Vec<Requirement>,
    #[serde(default = "Utc::now")]
    pub last_modified: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified_by: Option<ActorId>,
}

fn default_true() -> bool {
    true
}

impl Action {
    pub fn new(name: impl Into<String>, kind: ActionKind) -> Self {
        Self {
            id: 0,
            name: name.into(),
            description: String::new(),
            kind,
            enabled: true,
            public: false,
            parameters: Vec::new(),
            requirements: Vec::new(),
            last_modified: Utc::now(),
            last_modified_by: None,
        }
    }

    pub fn action_type(&self) -> ActionType {
        self.kind.action_type()
    }

    pub fn children(&self) -> &[ActionId] {
        self.kind.children()
    }

    pub fn with_parameter(mut self, parameter: Parameter) -> Self {
        self.parameters.push(parameter);
        self
    }

    pub fn with_requirement(mut self, requirement: Requirement) -> Self {
        self.requirements.push(requirement);
        self
    }

    /// Replace every password value with [`PASSWORD_PLACEHOLDER`].
    pub fn mask_passwords(&mut self) {
        for p in self.parameters.iter_mut().filter(|p| p.is_password()) {
            p.value = PASSWORD_PLACEHOLDER.to_string();
        }
    }

    /// Put back stored secrets where `self` still carries the placeholder.
    pub fn restore_passwords(&mut self, stored: &Action) {
        for p in self.parameters.iter_mut() {
            if p.is_password() && p.value == PASSWORD_PLACEHOLDER {
                if let Some(old) = stored.parameters.iter().find(|o| o.name == p.name) {
                    p.value = old.value.clone();
                }
            }
        }
    }

    /// Parameters as a name → value map (later duplicates win).
    pub fn argument_map(&self) -> BTreeMap<String, String> {
        self.parameters
            .iter()
            .map(|p| (p.name.clone(), p.value.clone()))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Audit trail
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditChange {
    Update,
    Delete,
}

impl fmt::Display for AuditChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AuditChange::Update => "update",
            AuditChange::Delete => "delete",
        })
    }
}

/// One recorded change to an action. `previous` is the action as it was
/// before `actor` changed it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionAudit {
    pub action_id: ActionId,
    /// Increases with every change, across all actions.
    pub version: i64,
    pub change: AuditChange,
    pub actor: ActorId,
    pub changed_at: DateTime<Utc>,
    pub previous: Action,
}

// ---------------------------------------------------------------------------
// ActionDocument: import format, children referenced by name
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionDocument {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type", default = "default_document_type")]
    pub action_type: ActionType,
    /// Plugin name, for `type: plugin`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin: Option<String>,
    /// Child action names, for composite types.
    #[serde(default)]
    pub steps: Vec<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
    #[serde(default)]
    pub requirements: Vec<Requirement>,
}

fn default_document_type() -> ActionType {
    ActionType::User
}

impl ActionDocument {
    /// Parse YAML (a superset of JSON, so JSON documents work too).
    pub fn parse(data: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(data)?)
    }
}

// ---------------------------------------------------------------------------
// Name validation
// ---------------------------------------------------------------------------

static NAME_RE: OnceLock<Regex> = OnceLock::new();

fn name_re() -> &'static Regex {
    NAME_RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9 ._\-]*$").unwrap())
}

pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 128 || !name_re().is_match(name) {
        return Err(CdsError::Validation(format!(
            "invalid action name '{name}': letters, digits, spaces, '.', '_' and '-' only"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_names() {
        for name in ["Script", "git-clone", "Go Build", "a", "v1.2_release"] {
            validate_name(name).unwrap_or_else(|_| panic!("expected valid: {name}"));
        }
    }

    #[test]
    fn invalid_names() {
        let long = "x".repeat(129);
        for name in ["", " leading", "-dash", "a/b", "semi;colon", long.as_str()] {
            assert!(validate_name(name).is_err(), "expected invalid: {name}");
        }
    }

    #[test]
    fn mask_and_restore_passwords() {
        let stored = Action::new("deploy", ActionKind::Builtin)
            .with_parameter(Parameter::password("token", "s3cr3t"))
            .with_parameter(Parameter::new("region", "eu"));

        let mut shown = stored.clone();
        shown.mask_passwords();
        assert_eq!(shown.parameters[0].value, PASSWORD_PLACEHOLDER);
        assert_eq!(shown.parameters[1].value, "eu");

        shown.restore_passwords(&stored);
        assert_eq!(shown.parameters[0].value, "s3cr3t");
    }

    #[test]
    fn kind_is_tagged_inline() {
        let action = Action::new("wrap", ActionKind::Joined { children: vec![3, 4] });
        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["type"], "joined");
        assert_eq!(json["children"], serde_json::json!([3, 4]));

        let back: Action = serde_json::from_value(json).unwrap();
        assert_eq!(back.children(), &[3, 4]);
        assert_eq!(back.action_type(), ActionType::Joined);
    }

    #[test]
    fn document_defaults_to_user_type() {
        let doc = ActionDocument::parse(
            "name: build\nsteps: [Script]\nparameters:\n  - name: script\n    type: text\n    value: make\n",
        )
        .unwrap();
        assert_eq!(doc.action_type, ActionType::User);
        assert!(doc.enabled);
        assert_eq!(doc.steps, vec!["Script".to_string()]);
        assert_eq!(doc.parameters[0].kind, ParameterType::Text);
    }
}
