use crate::cli::ConfigAction;
use twinfs::config::{get_config_path, load_config, save_config, Config};
use twinfs::error::{Result, UnionError};

pub fn handle_config_command(action: Option<ConfigAction>) -> Result<()> {
    match action {
        Some(ConfigAction::Path) => {
            let config_path = get_config_path()?;
            println!("Config location: {}", config_path.display());
        }
        None | Some(ConfigAction::Show) => {
            let config_path = get_config_path()?;
            let config = load_config()?;
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("Config file: {} (not present, defaults)", config_path.display());
            }
            println!();
            println!("Current configuration:");
            println!("  Markers:");
            println!("    owner_uid: {}", config.markers.get_owner_uid());
            println!("    owner_gid: {}", config.markers.get_owner_gid());
            println!("  Copy-up:");
            println!(
                "    default_dir_mode: {:#o}",
                config.copy_up.get_default_dir_mode()
            );
            println!("  Mount:");
            println!("    allow_other: {}", config.mount.get_allow_other());
            println!("    auto_unmount: {}", config.mount.get_auto_unmount());
            println!("  Other:");
            println!("    fuse_ttl_secs: {}", config.get_fuse_ttl_secs());
        }
        Some(ConfigAction::Init { force }) => {
            let config_path = get_config_path()?;
            if config_path.exists() && !force {
                return Err(UnionError::Config(format!(
                    "Config file already exists at {} (use --force to overwrite)",
                    config_path.display()
                )));
            }
            let written = save_config(&Config::with_defaults())?;
            println!("Wrote default config to {}", written.display());
        }
    }
    Ok(())
}
