use crate::error::{Result, UnionError};
use std::path::{Path, PathBuf};

use crate::config::paths::*;
use crate::config::schema::*;

/// Loads `config.toml` from the config directory. A missing file means
/// defaults; nothing is written.
pub fn load_config() -> Result<Config> {
    load_config_from(&get_config_path()?)
}

pub fn load_config_from(config_path: &Path) -> Result<Config> {
    let config = if !config_path.exists() {
        tracing::debug!(
            "No config file at {}, using defaults",
            config_path.display()
        );
        Config::default()
    } else {
        let toml_content = std::fs::read_to_string(config_path)
            .map_err(|e| UnionError::Config(format!("Failed to read config file: {}", e)))?;

        toml::from_str(&toml_content)
            .map_err(|e| UnionError::Config(format!("Failed to parse config: {}", e)))?
    };

    validate_config(&config)?;
    Ok(config)
}

pub fn save_config(config: &Config) -> Result<PathBuf> {
    let config_path = get_config_path()?;
    save_config_to(config, &config_path)?;
    Ok(config_path)
}

pub fn save_config_to(config: &Config, config_path: &Path) -> Result<()> {
    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            UnionError::Config(format!("Failed to create config directory: {}", e))
        })?;
    }
    let toml_str = toml::to_string_pretty(config)
        .map_err(|e| UnionError::Config(format!("Failed to serialize config: {}", e)))?;
    std::fs::write(config_path, toml_str)
        .map_err(|e| UnionError::Config(format!("Failed to write config file: {}", e)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults_without_writing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let config = load_config_from(&path).unwrap();
        assert_eq!(config.get_fuse_ttl_secs(), 1);
        assert!(!path.exists());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.toml");
        let mut config = Config::default();
        config.fuse_ttl_secs = Some(7);
        save_config_to(&config, &path).unwrap();

        assert_eq!(load_config_from(&path).unwrap().get_fuse_ttl_secs(), 7);
    }

    #[test]
    fn test_parse_error_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "fuse_ttl_secs = \"soon\"").unwrap();
        assert!(matches!(
            load_config_from(&path),
            Err(UnionError::Config(_))
        ));
    }
}
