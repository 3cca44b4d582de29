use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const CDS_DIR: &str = ".cds";
pub const CONFIG_FILE: &str = ".cds/config.yaml";
pub const DEFAULT_DATABASE: &str = ".cds/cds.redb";
pub const DEFAULT_PLUGINS_DIR: &str = ".cds/plugins";
pub const DEFAULT_WORKSPACES_DIR: &str = ".cds/workspaces";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn cds_dir(root: &Path) -> PathBuf {
    root.join(CDS_DIR)
}

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

/// Resolve a configured path: absolute paths are kept, relative ones are
/// taken from the project root.
pub fn resolve(root: &Path, configured: &Path) -> PathBuf {
    if configured.is_absolute() {
        configured.to_path_buf()
    } else {
        root.join(configured)
    }
}

/// Working directory for one build: `<workspaces>/<project>/<app>/<pipeline>/<env>/<number>`.
pub fn build_workspace(
    workspaces: &Path,
    project_key: &str,
    application: &str,
    pipeline: &str,
    environment: &str,
    build_number: i64,
) -> PathBuf {
    workspaces
        .join(project_key)
        .join(application)
        .join(pipeline)
        .join(environment)
        .join(build_number.to_string())
}
