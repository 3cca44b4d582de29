//! Persistent storage for actions, the catalog and build history using redb.
//!
//! # Table design
//!
//! ```text
//! actions       i64 id                          → JSON Action
//! action_names  name                            → i64 id   (uniqueness arbiter)
//! action_edges  [ parent: u64 BE | child: u64 BE ] → u32 ordinal
//! action_audit  [ action: u64 BE | version: u64 BE ] → JSON ActionAudit
//! projects      project key                     → JSON Project
//! builds        [ app | pipeline | env | number ], u64 BE each → JSON PipelineBuild
//! counters      name                            → last allocated i64
//! ```
//!
//! Every mutation runs in a single write transaction. redb serialises
//! writers, so check-then-act sequences (name uniqueness, delete-if-unused,
//! build number allocation) cannot interleave.
//!
//! Because build keys are big-endian, the latest build of a triple is the
//! last entry of a range scan over its 24-byte prefix.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use chrono::Utc;
use redb::{Database, ReadableTable, Table, TableDefinition};
use tracing::{debug, info};

use crate::action::{validate_name, Action, ActionAudit, ActionId, ActorId, AuditChange};
use crate::catalog::{
    Application, Catalog, CatalogDocument, Endpoint, Environment, Pipeline, PipelineBuild, Project,
    ProjectDocument, Stage, NO_ENV, NO_ENV_ID,
};
use crate::error::{CdsError, NotFoundKind, Result};
use crate::graph::ActionGraph;

// ---------------------------------------------------------------------------
// Table definitions
// ---------------------------------------------------------------------------

const ACTIONS: TableDefinition<i64, &[u8]> = TableDefinition::new("actions");
const ACTION_NAMES: TableDefinition<&str, i64> = TableDefinition::new("action_names");
/// Key: 16-byte composite (parent id ++ child id), value: position in the
/// parent's child list.
const ACTION_EDGES: TableDefinition<&[u8], u32> = TableDefinition::new("action_edges");
/// Key: 16-byte composite (action id ++ version). Survives the action.
const ACTION_AUDIT: TableDefinition<&[u8], &[u8]> = TableDefinition::new("action_audit");
const PROJECTS: TableDefinition<&str, &[u8]> = TableDefinition::new("projects");
/// Key: 32-byte composite (application ++ pipeline ++ environment ++ number).
const BUILDS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("builds");
const COUNTERS: TableDefinition<&str, i64> = TableDefinition::new("counters");

fn store_err(e: impl std::fmt::Display) -> CdsError {
    CdsError::Store(e.to_string())
}

// ---------------------------------------------------------------------------
// Key helpers
// ---------------------------------------------------------------------------

fn edge_key(parent: ActionId, child: ActionId) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&(parent as u64).to_be_bytes());
    key[8..].copy_from_slice(&(child as u64).to_be_bytes());
    key
}

fn audit_key(action: ActionId, version: i64) -> [u8; 16] {
    edge_key(action, version)
}

fn read_be(bytes: &[u8]) -> i64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_be_bytes(buf) as i64
}

fn build_key(application_id: i64, pipeline_id: i64, environment_id: i64, number: i64) -> [u8; 32] {
    let mut key = [0u8; 32];
    key[..8].copy_from_slice(&(application_id as u64).to_be_bytes());
    key[8..16].copy_from_slice(&(pipeline_id as u64).to_be_bytes());
    key[16..24].copy_from_slice(&(environment_id as u64).to_be_bytes());
    key[24..].copy_from_slice(&(number as u64).to_be_bytes());
    key
}

/// One persisted `parent → child` edge with its position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Edge {
    parent: ActionId,
    child: ActionId,
    ordinal: u32,
}

// ---------------------------------------------------------------------------
// Table helpers (shared by read and write transactions)
// ---------------------------------------------------------------------------

fn get_action(table: &impl ReadableTable<i64, &'static [u8]>, id: ActionId) -> Result<Option<Action>> {
    match table.get(id).map_err(store_err)? {
        Some(v) => Ok(Some(serde_json::from_slice(v.value())?)),
        None => Ok(None),
    }
}

fn read_edges(table: &impl ReadableTable<&'static [u8], u32>) -> Result<Vec<Edge>> {
    let mut edges = Vec::new();
    for entry in table.iter().map_err(store_err)? {
        let (k, v) = entry.map_err(store_err)?;
        let key = k.value();
        edges.push(Edge {
            parent: read_be(&key[..8]),
            child: read_be(&key[8..]),
            ordinal: v.value(),
        });
    }
    edges.sort_by_key(|e| (e.parent, e.ordinal));
    Ok(edges)
}

fn graph_of(edges: &[Edge]) -> ActionGraph {
    ActionGraph::from_edges(edges.iter().map(|e| (e.parent, e.child)))
}

fn read_projects(table: &impl ReadableTable<&'static str, &'static [u8]>) -> Result<Vec<Project>> {
    let mut projects = Vec::new();
    for entry in table.iter().map_err(store_err)? {
        let (_, v) = entry.map_err(store_err)?;
        projects.push(serde_json::from_slice(v.value())?);
    }
    Ok(projects)
}

fn get_project(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    key: &str,
) -> Result<Option<Project>> {
    match table.get(key).map_err(store_err)? {
        Some(v) => Ok(Some(serde_json::from_slice(v.value())?)),
        None => Ok(None),
    }
}

/// Whether `id` is a stage member anywhere or a child of another action.
fn used_in(
    edges: &impl ReadableTable<&'static [u8], u32>,
    projects: &impl ReadableTable<&'static str, &'static [u8]>,
    id: ActionId,
) -> Result<bool> {
    if graph_of(&read_edges(edges)?).has_parents(id) {
        return Ok(true);
    }
    let in_stage = read_projects(projects)?.iter().any(|p| {
        p.pipelines
            .iter()
            .flat_map(|pip| &pip.stages)
            .any(|s| s.actions.contains(&id))
    });
    Ok(in_stage)
}

fn latest_in(
    table: &impl ReadableTable<&'static [u8], &'static [u8]>,
    application_id: i64,
    pipeline_id: i64,
    environment_id: i64,
) -> Result<Option<i64>> {
    let lo = build_key(application_id, pipeline_id, environment_id, 0);
    let hi = build_key(application_id, pipeline_id, environment_id, i64::MAX);
    let mut range = table
        .range(lo.as_slice()..=hi.as_slice())
        .map_err(store_err)?;
    match range.next_back() {
        Some(entry) => {
            let (k, _) = entry.map_err(store_err)?;
            Ok(Some(read_be(&k.value()[24..])))
        }
        None => Ok(None),
    }
}

fn put_action(table: &mut Table<i64, &'static [u8]>, action: &Action) -> Result<()> {
    let value = serde_json::to_vec(action)?;
    table
        .insert(action.id, value.as_slice())
        .map_err(store_err)?;
    Ok(())
}

fn check_children(table: &impl ReadableTable<i64, &'static [u8]>, children: &[ActionId]) -> Result<()> {
    for &child in children {
        if table.get(child).map_err(store_err)?.is_none() {
            return Err(CdsError::not_found(NotFoundKind::Action, child.to_string()));
        }
    }
    Ok(())
}

fn replace_edges(
    table: &mut Table<&'static [u8], u32>,
    parent: ActionId,
    children: &[ActionId],
) -> Result<()> {
    let lo = edge_key(parent, 0);
    let hi = edge_key(parent, i64::MAX);
    let stale: Vec<Vec<u8>> = {
        let mut keys = Vec::new();
        for entry in table.range(lo.as_slice()..=hi.as_slice()).map_err(store_err)? {
            let (k, _) = entry.map_err(store_err)?;
            keys.push(k.value().to_vec());
        }
        keys
    };
    for key in &stale {
        table.remove(key.as_slice()).map_err(store_err)?;
    }
    for (ordinal, &child) in children.iter().enumerate() {
        table
            .insert(edge_key(parent, child).as_slice(), ordinal as u32)
            .map_err(store_err)?;
    }
    Ok(())
}

/// Allocate the next value of counter `name`; the first value is `floor + 1`.
fn next_counter(table: &mut Table<&'static str, i64>, name: &str, floor: i64) -> Result<i64> {
    let current = table
        .get(name)
        .map_err(store_err)?
        .map(|v| v.value())
        .unwrap_or(floor)
        .max(floor);
    let next = current + 1;
    table.insert(name, next).map_err(store_err)?;
    Ok(next)
}

/// Record `previous` as the state `actor` replaced or removed.
fn put_audit(
    audit: &mut Table<&'static [u8], &'static [u8]>,
    counters: &mut Table<&'static str, i64>,
    change: AuditChange,
    actor: ActorId,
    previous: &Action,
) -> Result<()> {
    let entry = ActionAudit {
        action_id: previous.id,
        version: next_counter(counters, "audit", 0)?,
        change,
        actor,
        changed_at: Utc::now(),
        previous: previous.clone(),
    };
    let value = serde_json::to_vec(&entry)?;
    audit
        .insert(audit_key(entry.action_id, entry.version).as_slice(), value.as_slice())
        .map_err(store_err)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Persistent store behind the action registry, the catalog and builds.
pub struct Store {
    db: Database,
}

impl Store {
    /// Open or create the redb database at `path`, creating every table.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path).map_err(store_err)?;
        let wt = db.begin_write().map_err(store_err)?;
        wt.open_table(ACTIONS).map_err(store_err)?;
        wt.open_table(ACTION_NAMES).map_err(store_err)?;
        wt.open_table(ACTION_EDGES).map_err(store_err)?;
        wt.open_table(ACTION_AUDIT).map_err(store_err)?;
        wt.open_table(PROJECTS).map_err(store_err)?;
        wt.open_table(BUILDS).map_err(store_err)?;
        wt.open_table(COUNTERS).map_err(store_err)?;
        wt.commit().map_err(store_err)?;
        debug!(path = %path.display(), "store opened");
        Ok(Self { db })
    }

    // ---- actions ----------------------------------------------------------

    /// Insert `action` under a freshly allocated id.
    ///
    /// Fails with `Conflict` when the name is taken (including by a
    /// concurrent insert that committed first).
    pub fn insert_action(&self, action: &Action) -> Result<Action> {
        validate_name(&action.name)?;
        let wt = self.db.begin_write().map_err(store_err)?;
        let stored = {
            let mut actions = wt.open_table(ACTIONS).map_err(store_err)?;
            let mut names = wt.open_table(ACTION_NAMES).map_err(store_err)?;
            let mut edges = wt.open_table(ACTION_EDGES).map_err(store_err)?;
            let mut counters = wt.open_table(COUNTERS).map_err(store_err)?;

            if names.get(action.name.as_str()).map_err(store_err)?.is_some() {
                return Err(CdsError::Conflict(format!(
                    "action '{}' already exists",
                    action.name
                )));
            }
            check_children(&actions, action.children())?;

            let mut stored = action.clone();
            stored.id = next_counter(&mut counters, "action", 0)?;
            stored.last_modified = Utc::now();
            put_action(&mut actions, &stored)?;
            names
                .insert(stored.name.as_str(), stored.id)
                .map_err(store_err)?;
            replace_edges(&mut edges, stored.id, stored.children())?;
            stored
        };
        wt.commit().map_err(store_err)?;
        info!(id = stored.id, name = %stored.name, "action inserted");
        Ok(stored)
    }

    /// Replace the action with id `action.id`, keeping that id, and audit
    /// the old version under `actor`.
    ///
    /// Password parameters still carrying the placeholder keep their stored
    /// secret. The child list is checked for existence and cycles.
    pub fn update_action(&self, action: &Action, actor: ActorId) -> Result<Action> {
        validate_name(&action.name)?;
        let wt = self.db.begin_write().map_err(store_err)?;
        let stored = {
            let mut actions = wt.open_table(ACTIONS).map_err(store_err)?;
            let mut names = wt.open_table(ACTION_NAMES).map_err(store_err)?;
            let mut edges = wt.open_table(ACTION_EDGES).map_err(store_err)?;
            let mut audit = wt.open_table(ACTION_AUDIT).map_err(store_err)?;
            let mut counters = wt.open_table(COUNTERS).map_err(store_err)?;

            let old = get_action(&actions, action.id)?
                .ok_or_else(|| CdsError::not_found(NotFoundKind::Action, action.id.to_string()))?;
            let owner = names
                .get(action.name.as_str())
                .map_err(store_err)?
                .map(|v| v.value());
            if owner.is_some_and(|owner| owner != action.id) {
                return Err(CdsError::Conflict(format!(
                    "action '{}' already exists",
                    action.name
                )));
            }
            check_children(&actions, action.children())?;
            if graph_of(&read_edges(&edges)?).would_cycle(action.id, action.children()) {
                return Err(CdsError::Cycle(format!(
                    "'{}' would reach itself through its children",
                    action.name
                )));
            }

            let mut stored = action.clone();
            stored.restore_passwords(&old);
            stored.last_modified = Utc::now();
            put_audit(&mut audit, &mut counters, AuditChange::Update, actor, &old)?;
            put_action(&mut actions, &stored)?;
            if old.name != stored.name {
                names.remove(old.name.as_str()).map_err(store_err)?;
            }
            names
                .insert(stored.name.as_str(), stored.id)
                .map_err(store_err)?;
            replace_edges(&mut edges, stored.id, stored.children())?;
            stored
        };
        wt.commit().map_err(store_err)?;
        info!(id = stored.id, name = %stored.name, "action updated");
        Ok(stored)
    }

    /// Delete the action unless it is in use; the check, the delete and the
    /// audit entry share one transaction.
    pub fn delete_action_if_unused(&self, id: ActionId, actor: ActorId) -> Result<Action> {
        let wt = self.db.begin_write().map_err(store_err)?;
        let removed = {
            let mut actions = wt.open_table(ACTIONS).map_err(store_err)?;
            let mut names = wt.open_table(ACTION_NAMES).map_err(store_err)?;
            let mut edges = wt.open_table(ACTION_EDGES).map_err(store_err)?;
            let mut audit = wt.open_table(ACTION_AUDIT).map_err(store_err)?;
            let mut counters = wt.open_table(COUNTERS).map_err(store_err)?;
            let projects = wt.open_table(PROJECTS).map_err(store_err)?;

            let action = get_action(&actions, id)?
                .ok_or_else(|| CdsError::not_found(NotFoundKind::Action, id.to_string()))?;
            if used_in(&edges, &projects, id)? {
                return Err(CdsError::Conflict(format!(
                    "action '{}' is used by a pipeline or another action",
                    action.name
                )));
            }
            put_audit(&mut audit, &mut counters, AuditChange::Delete, actor, &action)?;
            actions.remove(id).map_err(store_err)?;
            names.remove(action.name.as_str()).map_err(store_err)?;
            replace_edges(&mut edges, id, &[])?;
            action
        };
        wt.commit().map_err(store_err)?;
        info!(id, name = %removed.name, "action deleted");
        Ok(removed)
    }

    pub fn action(&self, id: ActionId) -> Result<Option<Action>> {
        let rt = self.db.begin_read().map_err(store_err)?;
        let actions = rt.open_table(ACTIONS).map_err(store_err)?;
        get_action(&actions, id)
    }

    pub fn action_by_name(&self, name: &str) -> Result<Option<Action>> {
        let rt = self.db.begin_read().map_err(store_err)?;
        let names = rt.open_table(ACTION_NAMES).map_err(store_err)?;
        let id = match names.get(name).map_err(store_err)? {
            Some(v) => v.value(),
            None => return Ok(None),
        };
        let actions = rt.open_table(ACTIONS).map_err(store_err)?;
        get_action(&actions, id)
    }

    /// All actions, ordered by name.
    pub fn actions(&self) -> Result<Vec<Action>> {
        let rt = self.db.begin_read().map_err(store_err)?;
        let actions = rt.open_table(ACTIONS).map_err(store_err)?;
        let mut result: Vec<Action> = Vec::new();
        for entry in actions.iter().map_err(store_err)? {
            let (_, v) = entry.map_err(store_err)?;
            result.push(serde_json::from_slice(v.value())?);
        }
        result.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(result)
    }

    /// Audit entries of action `id`, newest first. Entries outlive the
    /// action itself.
    pub fn action_audit(&self, id: ActionId) -> Result<Vec<ActionAudit>> {
        let rt = self.db.begin_read().map_err(store_err)?;
        let audit = rt.open_table(ACTION_AUDIT).map_err(store_err)?;
        let lo = audit_key(id, 0);
        let hi = audit_key(id, i64::MAX);
        let mut entries = Vec::new();
        for entry in audit
            .range(lo.as_slice()..=hi.as_slice())
            .map_err(store_err)?
            .rev()
        {
            let (_, v) = entry.map_err(store_err)?;
            entries.push(serde_json::from_slice(v.value())?);
        }
        Ok(entries)
    }

    pub fn is_action_used(&self, id: ActionId) -> Result<bool> {
        let rt = self.db.begin_read().map_err(store_err)?;
        let edges = rt.open_table(ACTION_EDGES).map_err(store_err)?;
        let projects = rt.open_table(PROJECTS).map_err(store_err)?;
        used_in(&edges, &projects, id)
    }

    /// Snapshot of the action DAG.
    pub fn action_graph(&self) -> Result<ActionGraph> {
        let rt = self.db.begin_read().map_err(store_err)?;
        let edges = rt.open_table(ACTION_EDGES).map_err(store_err)?;
        Ok(graph_of(&read_edges(&edges)?))
    }

    // ---- catalog ----------------------------------------------------------

    /// Import a catalog document. Each project replaces the stored one with
    /// the same key; ids of entities that keep their name are preserved.
    pub fn import_catalog(&self, doc: &CatalogDocument) -> Result<Vec<Project>> {
        let wt = self.db.begin_write().map_err(store_err)?;
        let imported = {
            let names = wt.open_table(ACTION_NAMES).map_err(store_err)?;
            let mut projects = wt.open_table(PROJECTS).map_err(store_err)?;
            let mut counters = wt.open_table(COUNTERS).map_err(store_err)?;

            let mut imported = Vec::new();
            for pd in &doc.projects {
                let existing = get_project(&projects, &pd.key)?;
                let project = build_project(pd, existing.as_ref(), &names, &mut counters)?;
                let value = serde_json::to_vec(&project)?;
                projects
                    .insert(project.key.as_str(), value.as_slice())
                    .map_err(store_err)?;
                info!(key = %project.key, "project imported");
                imported.push(project);
            }
            imported
        };
        wt.commit().map_err(store_err)?;
        Ok(imported)
    }

    pub fn project(&self, key: &str) -> Result<Option<Project>> {
        let rt = self.db.begin_read().map_err(store_err)?;
        let projects = rt.open_table(PROJECTS).map_err(store_err)?;
        get_project(&projects, key)
    }

    /// All projects, ordered by key.
    pub fn projects(&self) -> Result<Vec<Project>> {
        let rt = self.db.begin_read().map_err(store_err)?;
        let projects = rt.open_table(PROJECTS).map_err(store_err)?;
        read_projects(&projects)
    }

    // ---- builds -----------------------------------------------------------

    /// Record a new build, allocating the next number of its triple.
    pub fn start_build(&self, build: &PipelineBuild) -> Result<PipelineBuild> {
        let wt = self.db.begin_write().map_err(store_err)?;
        let stored = {
            let mut builds = wt.open_table(BUILDS).map_err(store_err)?;
            let latest = latest_in(
                &builds,
                build.application_id,
                build.pipeline_id,
                build.environment_id,
            )?;
            let mut stored = build.clone();
            stored.number = latest.unwrap_or(0) + 1;
            let key = build_key(
                stored.application_id,
                stored.pipeline_id,
                stored.environment_id,
                stored.number,
            );
            let value = serde_json::to_vec(&stored)?;
            builds
                .insert(key.as_slice(), value.as_slice())
                .map_err(store_err)?;
            stored
        };
        wt.commit().map_err(store_err)?;
        info!(
            application = %stored.application,
            pipeline = %stored.pipeline,
            environment = %stored.environment,
            number = stored.number,
            "build started"
        );
        Ok(stored)
    }

    /// Overwrite a recorded build (status, finish time).
    pub fn finish_build(&self, build: &PipelineBuild) -> Result<()> {
        let key = build_key(
            build.application_id,
            build.pipeline_id,
            build.environment_id,
            build.number,
        );
        let value = serde_json::to_vec(build)?;
        let wt = self.db.begin_write().map_err(store_err)?;
        {
            let mut builds = wt.open_table(BUILDS).map_err(store_err)?;
            builds
                .insert(key.as_slice(), value.as_slice())
                .map_err(store_err)?;
        }
        wt.commit().map_err(store_err)?;
        Ok(())
    }

    pub fn latest_build_number(
        &self,
        application_id: i64,
        pipeline_id: i64,
        environment_id: i64,
    ) -> Result<Option<i64>> {
        let rt = self.db.begin_read().map_err(store_err)?;
        let builds = rt.open_table(BUILDS).map_err(store_err)?;
        latest_in(&builds, application_id, pipeline_id, environment_id)
    }

    /// Builds of one triple, oldest first.
    pub fn builds(
        &self,
        application_id: i64,
        pipeline_id: i64,
        environment_id: i64,
    ) -> Result<Vec<PipelineBuild>> {
        let lo = build_key(application_id, pipeline_id, environment_id, 0);
        let hi = build_key(application_id, pipeline_id, environment_id, i64::MAX);
        let rt = self.db.begin_read().map_err(store_err)?;
        let builds = rt.open_table(BUILDS).map_err(store_err)?;
        let mut result = Vec::new();
        for entry in builds
            .range(lo.as_slice()..=hi.as_slice())
            .map_err(store_err)?
        {
            let (_, v) = entry.map_err(store_err)?;
            result.push(serde_json::from_slice(v.value())?);
        }
        Ok(result)
    }
}

impl Catalog for Store {
    fn project(&self, key: &str) -> Result<Project> {
        Store::project(self, key)?.ok_or_else(|| CdsError::not_found(NotFoundKind::Project, key))
    }

    fn latest_build(
        &self,
        application_id: i64,
        pipeline_id: i64,
        environment_id: i64,
    ) -> Result<Option<i64>> {
        self.latest_build_number(application_id, pipeline_id, environment_id)
    }
}

// ---------------------------------------------------------------------------
// Catalog import
// ---------------------------------------------------------------------------

/// Reject a repeated name within one list of the document.
fn ensure_unique<'a>(what: &str, names: impl IntoIterator<Item = &'a str>) -> Result<()> {
    let mut seen = BTreeSet::new();
    for name in names {
        if !seen.insert(name) {
            return Err(CdsError::Conflict(format!("duplicate {what} '{name}'")));
        }
    }
    Ok(())
}

fn build_project(
    doc: &ProjectDocument,
    existing: Option<&Project>,
    action_names: &impl ReadableTable<&'static str, i64>,
    counters: &mut Table<&'static str, i64>,
) -> Result<Project> {
    if doc.key.trim().is_empty() {
        return Err(CdsError::Validation("project key must not be empty".into()));
    }
    ensure_unique("environment", doc.environments.iter().map(String::as_str))?;
    ensure_unique("pipeline", doc.pipelines.iter().map(|p| p.name.as_str()))?;
    ensure_unique("application", doc.applications.iter().map(|a| a.name.as_str()))?;

    let mut environments = Vec::new();
    for name in &doc.environments {
        if name == NO_ENV {
            return Err(CdsError::Validation(format!("environment name '{NO_ENV}' is reserved")));
        }
        let id = match existing.and_then(|p| p.environments.iter().find(|e| &e.name == name)) {
            Some(e) => e.id,
            None => next_counter(counters, "environment", NO_ENV_ID)?,
        };
        environments.push(Environment {
            id,
            name: name.clone(),
        });
    }

    let mut pipelines = Vec::new();
    for pd in &doc.pipelines {
        let old = existing.and_then(|p| p.pipeline(&pd.name));
        let id = match old {
            Some(p) => p.id,
            None => next_counter(counters, "pipeline", 0)?,
        };
        let mut stages = Vec::new();
        for sd in &pd.stages {
            let stage_id = match old.and_then(|p| p.stages.iter().find(|s| s.name == sd.name)) {
                Some(s) => s.id,
                None => next_counter(counters, "stage", 0)?,
            };
            let mut actions = Vec::new();
            for name in &sd.actions {
                let action_id = action_names
                    .get(name.as_str())
                    .map_err(store_err)?
                    .map(|v| v.value())
                    .ok_or_else(|| CdsError::not_found(NotFoundKind::Action, name.as_str()))?;
                actions.push(action_id);
            }
            stages.push(Stage {
                id: stage_id,
                name: sd.name.clone(),
                actions,
            });
        }
        pipelines.push(Pipeline {
            id,
            name: pd.name.clone(),
            stages,
        });
    }
    let pipeline_ids: BTreeMap<&str, i64> =
        pipelines.iter().map(|p| (p.name.as_str(), p.id)).collect();

    let mut applications = Vec::new();
    for ad in &doc.applications {
        let id = match existing.and_then(|p| p.application(&ad.name)) {
            Some(a) => a.id,
            None => next_counter(counters, "application", 0)?,
        };
        let mut attached = Vec::new();
        for name in &ad.pipelines {
            let pid = pipeline_ids
                .get(name.as_str())
                .copied()
                .ok_or_else(|| CdsError::not_found(NotFoundKind::Pipeline, name.as_str()))?;
            attached.push(pid);
        }
        applications.push(Application {
            id,
            name: ad.name.clone(),
            pipelines: attached,
        });
    }

    let project = Project {
        key: doc.key.clone(),
        name: doc.name.clone().unwrap_or_else(|| doc.key.clone()),
        applications,
        pipelines,
        environments,
        triggers: doc.triggers.clone(),
    };

    let mut seen = BTreeSet::new();
    for link in &project.triggers {
        check_endpoint(&project, &link.source)?;
        check_endpoint(&project, &link.dest)?;
        if !seen.insert((&link.source, &link.dest)) {
            return Err(CdsError::Conflict(format!(
                "duplicate trigger {} -> {}",
                link.source, link.dest
            )));
        }
    }
    Ok(project)
}

fn check_endpoint(project: &Project, endpoint: &Endpoint) -> Result<()> {
    let app = project
        .application(&endpoint.application)
        .ok_or_else(|| CdsError::not_found(NotFoundKind::Application, endpoint.application.as_str()))?;
    let attached = project
        .pipelines_of(app)
        .any(|p| p.name == endpoint.pipeline);
    if !attached {
        return Err(CdsError::not_found(
            NotFoundKind::Pipeline,
            format!("{}/{}", endpoint.application, endpoint.pipeline),
        ));
    }
    if project.environment(&endpoint.environment).is_none() {
        return Err(CdsError::not_found(
            NotFoundKind::Environment,
            endpoint.environment.as_str(),
        ));
    }
    Ok(())
}
