//! Project initialisation and the wiring shared by every command.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::info;

use crate::builtin::{BuiltinTable, ScriptAction, SCRIPT_ACTION};
use crate::config::Config;
use crate::error::Result;
use crate::executor::ActionExecutor;
use crate::registry::ActionRegistry;
use crate::runner::LocalRunner;
use crate::store::Store;
use crate::paths;

/// What `init` created on this call.
#[derive(Debug, Clone, Default)]
pub struct InitReport {
    pub config_written: bool,
    pub actions_created: Vec<String>,
}

/// Create `.cds/`, the default config (when missing), the plugin and
/// workspace directories, the database and the builtin actions.
/// Safe to run repeatedly.
pub fn init(root: &Path) -> Result<InitReport> {
    std::fs::create_dir_all(paths::cds_dir(root))?;
    let config_written = !paths::config_path(root).exists();
    if config_written {
        Config::default().save(root)?;
    }

    let config = Config::load(root)?;
    std::fs::create_dir_all(config.plugins_path(root))?;
    std::fs::create_dir_all(config.workspaces_path(root))?;

    let store = Arc::new(Store::open(&config.database_path(root))?);
    let actions_created = ensure_builtin_actions(&ActionRegistry::new(store))?;
    Ok(InitReport {
        config_written,
        actions_created,
    })
}

/// Insert the stored definition of every shipped builtin that is missing.
pub fn ensure_builtin_actions(registry: &ActionRegistry) -> Result<Vec<String>> {
    let mut created = Vec::new();
    for definition in [ScriptAction::definition()] {
        if registry.exists(&definition.name)? {
            continue;
        }
        let stored = registry.insert(&definition, true)?;
        info!(name = %stored.name, "builtin action created");
        created.push(stored.name);
    }
    Ok(created)
}

/// An opened project: config, store and registry.
pub struct Installation {
    pub root: PathBuf,
    pub config: Config,
    pub store: Arc<Store>,
    pub registry: ActionRegistry,
}

impl Installation {
    /// Open an initialised project. Fails with `NotInitialized` when
    /// `.cds/config.yaml` is missing.
    pub fn open(root: &Path) -> Result<Self> {
        let config = Config::load(root)?;
        let store = Arc::new(Store::open(&config.database_path(root))?);
        let registry = ActionRegistry::new(Arc::clone(&store));
        ensure_builtin_actions(&registry)?;
        Ok(Self {
            root: root.to_path_buf(),
            config,
            store,
            registry,
        })
    }

    pub fn executor(&self) -> ActionExecutor {
        ActionExecutor::new(
            self.registry.clone(),
            BuiltinTable::with_defaults(),
            self.config.executor_settings(&self.root),
        )
    }

    pub fn runner(&self) -> LocalRunner {
        LocalRunner::new(
            Arc::clone(&self.store),
            Arc::new(self.executor()),
            self.config.workspaces_path(&self.root),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ActionType;
    use crate::registry::LoadOptions;
    use tempfile::TempDir;

    #[test]
    fn init_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let first = init(dir.path()).unwrap();
        assert!(first.config_written);
        assert_eq!(first.actions_created, vec![SCRIPT_ACTION.to_string()]);

        let second = init(dir.path()).unwrap();
        assert!(!second.config_written);
        assert!(second.actions_created.is_empty());
        assert!(dir.path().join(".cds/plugins").is_dir());
        assert!(dir.path().join(".cds/cds.redb").exists());
    }

    #[test]
    fn open_requires_init() {
        let dir = TempDir::new().unwrap();
        assert!(Installation::open(dir.path()).is_err());

        init(dir.path()).unwrap();
        let inst = Installation::open(dir.path()).unwrap();
        let script = inst
            .registry
            .load_public_by_name(SCRIPT_ACTION, LoadOptions::default())
            .unwrap();
        assert_eq!(script.action_type(), ActionType::Builtin);
        assert_eq!(
            inst.executor().settings().plugins_dir,
            dir.path().join(".cds/plugins")
        );
    }
}
