use crate::error::{Result, UnionError};
use directories::ProjectDirs;
use std::path::PathBuf;

pub const CONFIG_DIR_ENV: &str = "TWINFS_CONFIG_DIR";

pub fn get_config_dir() -> Result<PathBuf> {
    if let Ok(config_dir) = std::env::var(CONFIG_DIR_ENV) {
        return Ok(PathBuf::from(config_dir));
    }

    let project_dirs = ProjectDirs::from("com", "twinfs", "twinfs")
        .ok_or_else(|| UnionError::Config("Could not determine config directory".to_string()))?;

    Ok(project_dirs.config_dir().to_path_buf())
}

pub fn get_config_path() -> Result<PathBuf> {
    Ok(get_config_dir()?.join("config.toml"))
}
