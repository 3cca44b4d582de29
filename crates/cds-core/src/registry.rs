//! Action Registry: the action catalog and its DAG.
//!
//! Mutations go straight to the [`Store`], which makes each one a single
//! transaction. Reads mask password parameters unless the caller asks for
//! clear values with [`LoadOptions::with_clear_passwords`].

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use crate::action::{
    Action, ActionAudit, ActionDocument, ActionId, ActionKind, ActionType, ActorId, Requirement,
    RequirementType,
};
use crate::error::{CdsError, NotFoundKind, Result};
use crate::store::Store;

/// Read options for registry loads.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoadOptions {
    clear_passwords: bool,
}

impl LoadOptions {
    /// Return password parameters in clear text. Reserved for callers that
    /// execute actions.
    pub fn with_clear_passwords() -> Self {
        Self {
            clear_passwords: true,
        }
    }
}

/// Result of an upsert by name.
#[derive(Debug, Clone)]
pub enum ImportOutcome {
    Created(Action),
    Updated(Action),
}

impl ImportOutcome {
    pub fn action(&self) -> &Action {
        match self {
            ImportOutcome::Created(a) | ImportOutcome::Updated(a) => a,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, ImportOutcome::Created(_))
    }
}

/// One pipeline from which an action is reachable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionUsage {
    pub project_key: String,
    pub project_name: String,
    pub application: String,
    pub pipeline: String,
    pub stage: String,
    /// The stage member through which the action is reached.
    pub action: String,
}

#[derive(Clone)]
pub struct ActionRegistry {
    store: Arc<Store>,
}

impl ActionRegistry {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    fn present(mut action: Action, opts: LoadOptions) -> Action {
        if !opts.clear_passwords {
            action.mask_passwords();
        }
        action
    }

    /// Every action, ordered by name.
    pub fn load_all(&self, opts: LoadOptions) -> Result<Vec<Action>> {
        Ok(self
            .store
            .actions()?
            .into_iter()
            .map(|a| Self::present(a, opts))
            .collect())
    }

    /// A public action by exact name.
    pub fn load_public_by_name(&self, name: &str, opts: LoadOptions) -> Result<Action> {
        match self.store.action_by_name(name)? {
            Some(a) if a.public => Ok(Self::present(a, opts)),
            _ => Err(CdsError::not_found(NotFoundKind::Action, name)),
        }
    }

    pub fn load(&self, id: ActionId, opts: LoadOptions) -> Result<Action> {
        self.store
            .action(id)?
            .map(|a| Self::present(a, opts))
            .ok_or_else(|| CdsError::not_found(NotFoundKind::Action, id.to_string()))
    }

    pub fn load_by_name(&self, name: &str, opts: LoadOptions) -> Result<Action> {
        self.store
            .action_by_name(name)?
            .map(|a| Self::present(a, opts))
            .ok_or_else(|| CdsError::not_found(NotFoundKind::Action, name))
    }

    pub fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.store.action_by_name(name)?.is_some())
    }

    pub fn insert(&self, action: &Action, mark_public: bool) -> Result<Action> {
        let mut action = action.clone();
        action.public = mark_public;
        ensure_plugin_requirement(&mut action);
        self.store.insert_action(&action).inspect_err(|e| {
            if matches!(e, CdsError::Conflict(_)) {
                warn!(name = %action.name, "action insert conflict");
            }
        })
    }

    /// Replace the stored action with the same id.
    pub fn update(&self, action: &Action, actor: ActorId) -> Result<Action> {
        let mut action = action.clone();
        action.last_modified_by = Some(actor);
        action.last_modified = Utc::now();
        ensure_plugin_requirement(&mut action);
        self.store.update_action(&action, actor)
    }

    /// Delete an unused action. Fails with `Conflict` if [`Self::used`]
    /// would report true at commit time.
    pub fn delete(&self, id: ActionId, actor: ActorId) -> Result<()> {
        let removed = self.store.delete_action_if_unused(id, actor).inspect_err(|e| {
            if matches!(e, CdsError::Conflict(_)) {
                warn!(id, actor, "refusing to delete action in use");
            }
        })?;
        info!(id, actor, name = %removed.name, "action deleted by actor");
        Ok(())
    }

    pub fn used(&self, id: ActionId) -> Result<bool> {
        self.store.is_action_used(id)
    }

    /// Earlier versions of action `id`, newest first, with who replaced or
    /// deleted each one.
    pub fn audit(&self, id: ActionId, opts: LoadOptions) -> Result<Vec<ActionAudit>> {
        Ok(self
            .store
            .action_audit(id)?
            .into_iter()
            .map(|mut entry| {
                entry.previous = Self::present(entry.previous, opts);
                entry
            })
            .collect())
    }

    /// Every distinct requirement declared by any action, sorted.
    pub fn all_requirements(&self) -> Result<Vec<Requirement>> {
        let requirements: BTreeSet<Requirement> = self
            .store
            .actions()?
            .into_iter()
            .flat_map(|a| a.requirements)
            .collect();
        Ok(requirements.into_iter().collect())
    }

    /// Pipelines from which `name` is reachable, once per
    /// (project, application, pipeline), ordered by project key, application
    /// name and pipeline name.
    pub fn pipelines_referencing(&self, name: &str) -> Result<Vec<ActionUsage>> {
        let action = self.load_public_by_name(name, LoadOptions::default())?;
        let graph = self.store.action_graph()?;
        let mut reaching = graph.ancestors(action.id);
        reaching.insert(action.id);

        let mut usages = Vec::new();
        let mut seen = BTreeSet::new();
        for project in self.store.projects()? {
            for app in &project.applications {
                for pipeline in project.pipelines_of(app) {
                    let hit = pipeline.stages.iter().find_map(|stage| {
                        stage
                            .actions
                            .iter()
                            .find(|id| reaching.contains(*id))
                            .map(|id| (stage, *id))
                    });
                    let Some((stage, member)) = hit else {
                        continue;
                    };
                    let key = (project.key.clone(), app.name.clone(), pipeline.name.clone());
                    if !seen.insert(key) {
                        continue;
                    }
                    let member_name = self
                        .store
                        .action(member)?
                        .map(|a| a.name)
                        .unwrap_or_else(|| member.to_string());
                    usages.push(ActionUsage {
                        project_key: project.key.clone(),
                        project_name: project.name.clone(),
                        application: app.name.clone(),
                        pipeline: pipeline.name.clone(),
                        stage: stage.name.clone(),
                        action: member_name,
                    });
                }
            }
        }
        usages.sort_by(|a, b| {
            (&a.project_key, &a.application, &a.pipeline).cmp(&(
                &b.project_key,
                &b.application,
                &b.pipeline,
            ))
        });
        Ok(usages)
    }

    /// Upsert by name: update in place (id and public flag preserved) or
    /// insert as a new public, enabled action.
    ///
    /// Only user and plugin actions can be created this way. A builtin or
    /// joined document may only update an action of that same type.
    pub fn import(&self, action: &Action, actor: ActorId) -> Result<ImportOutcome> {
        let host_defined = matches!(action.action_type(), ActionType::Builtin | ActionType::Joined);
        match self.store.action_by_name(&action.name)? {
            Some(existing) if host_defined && existing.action_type() != action.action_type() => {
                Err(CdsError::Validation(format!(
                    "cannot turn {} action '{}' into a {} action by import",
                    existing.action_type(),
                    action.name,
                    action.action_type()
                )))
            }
            None if host_defined => Err(CdsError::Validation(format!(
                "cannot create {} action '{}' by import: only user and plugin actions can be imported",
                action.action_type(),
                action.name
            ))),
            Some(existing) => {
                let mut updated = action.clone();
                updated.id = existing.id;
                updated.public = existing.public;
                let stored = self.update(&updated, actor)?;
                info!(name = %stored.name, id = stored.id, "action import updated");
                Ok(ImportOutcome::Updated(stored))
            }
            None => {
                let mut created = action.clone();
                created.enabled = true;
                created.last_modified_by = Some(actor);
                let stored = self.insert(&created, true)?;
                info!(name = %stored.name, id = stored.id, "action import created");
                Ok(ImportOutcome::Created(stored))
            }
        }
    }

    /// Convert a name-referencing document and upsert it.
    pub fn import_document(&self, doc: &ActionDocument, actor: ActorId) -> Result<ImportOutcome> {
        let action = self.action_from_document(doc)?;
        self.import(&action, actor)
    }

    fn action_from_document(&self, doc: &ActionDocument) -> Result<Action> {
        let child_ids = || -> Result<Vec<ActionId>> {
            doc.steps
                .iter()
                .map(|name| {
                    self.store
                        .action_by_name(name)?
                        .map(|a| a.id)
                        .ok_or_else(|| CdsError::not_found(NotFoundKind::Action, name.as_str()))
                })
                .collect()
        };
        let kind = match doc.action_type {
            ActionType::Builtin => ActionKind::Builtin,
            ActionType::Plugin => {
                let plugin = doc.plugin.clone().ok_or_else(|| {
                    CdsError::Validation(format!("plugin action '{}' names no plugin", doc.name))
                })?;
                ActionKind::Plugin { plugin }
            }
            ActionType::Joined => ActionKind::Joined {
                children: child_ids()?,
            },
            ActionType::User => ActionKind::User {
                children: child_ids()?,
            },
        };
        if !doc.steps.is_empty() && kind.children().is_empty() {
            return Err(CdsError::Validation(format!(
                "{} action '{}' cannot have steps",
                doc.action_type, doc.name
            )));
        }
        let mut action = Action::new(doc.name.clone(), kind);
        action.description = doc.description.clone();
        action.enabled = doc.enabled;
        action.parameters = doc.parameters.clone();
        action.requirements = doc.requirements.clone();
        Ok(action)
    }
}

/// Plugin actions always require their plugin on the execution host.
fn ensure_plugin_requirement(action: &mut Action) {
    if let ActionKind::Plugin { plugin } = &action.kind {
        let present = action
            .requirements
            .iter()
            .any(|r| r.kind == RequirementType::Plugin && &r.value == plugin);
        if !present {
            action.requirements.push(Requirement {
                name: plugin.clone(),
                kind: RequirementType::Plugin,
                value: plugin.clone(),
            });
        }
    }
}
