use crate::infrastructure::config::{ensure_default_config, load_config, CoreConfig};
use crate::infrastructure::error::CoreError;
use crate::infrastructure::storage::initialize_database;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub struct BootstrapResult {
    pub workspace_root: PathBuf,
    pub database_path: PathBuf,
    pub config: CoreConfig,
}

pub fn bootstrap_workspace(workspace_root: &Path) -> Result<BootstrapResult, CoreError> {
    let config_dir = workspace_root.join("config");
    let state_dir = workspace_root.join("state");
    let database_path = state_dir.join("blockpact.sqlite");

    fs::create_dir_all(&config_dir)?;
    fs::create_dir_all(&state_dir)?;

    ensure_default_config(&config_dir)?;
    let config = load_config(&config_dir)?;
    initialize_database(&database_path)?;

    Ok(BootstrapResult {
        workspace_root: workspace_root.to_path_buf(),
        database_path,
        config,
    })
}
