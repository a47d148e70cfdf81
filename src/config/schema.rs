use crate::error::{Result, UnionError};
use crate::overlay::{EngineOptions, MarkerOwner, MountSettings};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const MAX_FUSE_TTL_SECS: u64 = 3600;

/// Identity that owns whiteout markers.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MarkersConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_uid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_gid: Option<u32>,
}

impl MarkersConfig {
    pub fn get_owner_uid(&self) -> u32 {
        self.owner_uid.unwrap_or_else(super::default_marker_uid)
    }

    pub fn get_owner_gid(&self) -> u32 {
        self.owner_gid.unwrap_or_else(super::default_marker_gid)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CopyUpConfig {
    /// Mode for RW directories created without an RO counterpart.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_dir_mode: Option<u32>,
}

impl CopyUpConfig {
    pub fn get_default_dir_mode(&self) -> u32 {
        self.default_dir_mode.unwrap_or_else(super::default_dir_mode)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MountConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_other: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_unmount: Option<bool>,
}

impl MountConfig {
    pub fn get_allow_other(&self) -> bool {
        self.allow_other.unwrap_or_else(super::default_allow_other)
    }

    pub fn get_auto_unmount(&self) -> bool {
        self.auto_unmount.unwrap_or_else(super::default_auto_unmount)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub markers: MarkersConfig,
    #[serde(default)]
    pub copy_up: CopyUpConfig,
    #[serde(default)]
    pub mount: MountConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fuse_ttl_secs: Option<u64>,
}

impl Config {
    pub fn get_fuse_ttl_secs(&self) -> u64 {
        self.fuse_ttl_secs
            .unwrap_or_else(super::default_fuse_ttl_secs)
    }

    /// A fully populated config, as written by `twinfs config init`.
    pub fn with_defaults() -> Self {
        let defaults = Config::default();
        Config {
            markers: MarkersConfig {
                owner_uid: Some(defaults.markers.get_owner_uid()),
                owner_gid: Some(defaults.markers.get_owner_gid()),
            },
            copy_up: CopyUpConfig {
                default_dir_mode: Some(defaults.copy_up.get_default_dir_mode()),
            },
            mount: MountConfig {
                allow_other: Some(defaults.mount.get_allow_other()),
                auto_unmount: Some(defaults.mount.get_auto_unmount()),
            },
            fuse_ttl_secs: Some(defaults.get_fuse_ttl_secs()),
        }
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            marker_owner: MarkerOwner {
                uid: self.markers.get_owner_uid(),
                gid: self.markers.get_owner_gid(),
            },
            default_dir_mode: self.copy_up.get_default_dir_mode(),
        }
    }

    pub fn mount_settings(&self) -> MountSettings {
        MountSettings {
            ttl: Duration::from_secs(self.get_fuse_ttl_secs()),
            allow_other: self.mount.get_allow_other(),
            auto_unmount: self.mount.get_auto_unmount(),
        }
    }
}

pub fn validate_config(config: &Config) -> Result<()> {
    let mode = config.copy_up.get_default_dir_mode();
    if mode & !0o7777 != 0 {
        return Err(UnionError::Config(format!(
            "copy_up.default_dir_mode ({:#o}) has bits outside 0o7777",
            mode
        )));
    }
    if mode & 0o700 != 0o700 {
        tracing::warn!(
            "copy_up.default_dir_mode ({:#o}) denies the owner access; copy-up may fail",
            mode
        );
    }

    let ttl = config.get_fuse_ttl_secs();
    if ttl > MAX_FUSE_TTL_SECS {
        tracing::warn!(
            "fuse_ttl_secs ({}) is above the recommended maximum of {}s; \
             changes made directly on the branches will stay invisible that long",
            ttl,
            MAX_FUSE_TTL_SECS
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.markers.get_owner_uid(), 0);
        assert_eq!(config.markers.get_owner_gid(), 0);
        assert_eq!(config.copy_up.get_default_dir_mode(), 0o755);
        assert_eq!(config.get_fuse_ttl_secs(), 1);
        assert!(!config.mount.get_allow_other());
        assert!(config.mount.get_auto_unmount());
    }

    #[test]
    fn test_sections_parse() {
        let config: Config = toml::from_str(
            r#"
fuse_ttl_secs = 5

[markers]
owner_uid = 1000
owner_gid = 100

[copy_up]
default_dir_mode = 0o750

[mount]
allow_other = true
"#,
        )
        .unwrap();

        let options = config.engine_options();
        assert_eq!(options.marker_owner, MarkerOwner { uid: 1000, gid: 100 });
        assert_eq!(options.default_dir_mode, 0o750);

        let settings = config.mount_settings();
        assert_eq!(settings.ttl, Duration::from_secs(5));
        assert!(settings.allow_other);
        assert!(settings.auto_unmount);
    }

    #[test]
    fn test_validate_rejects_wide_mode() {
        let config = Config {
            copy_up: CopyUpConfig {
                default_dir_mode: Some(0o40755),
            },
            ..Config::default()
        };
        assert!(matches!(
            validate_config(&config),
            Err(UnionError::Config(_))
        ));
        assert!(validate_config(&Config::default()).is_ok());
    }

    #[test]
    fn test_with_defaults_round_trips_through_toml() {
        let written = toml::to_string_pretty(&Config::with_defaults()).unwrap();
        assert!(written.contains("default_dir_mode = 493"));
        let parsed: Config = toml::from_str(&written).unwrap();
        assert_eq!(parsed.engine_options(), Config::default().engine_options());
    }
}
