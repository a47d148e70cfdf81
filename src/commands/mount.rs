use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use twinfs::config::{load_config, BranchSpec};
use twinfs::error::{Result, UnionError};
use twinfs::overlay::{mount_fuse, unmount_fuse, Branches, Union};

/// Mounts the union and blocks until it is unmounted.
pub fn mount_union(
    spec: &BranchSpec,
    mount_point: &Path,
    ttl: Option<u64>,
    allow_other: bool,
) -> Result<()> {
    let config = load_config()?;
    let branches = Branches::open(spec)?;

    let mut settings = config.mount_settings();
    if let Some(ttl) = ttl {
        settings.ttl = Duration::from_secs(ttl);
    }
    settings.allow_other |= allow_other;

    let union = Arc::new(Union::new(branches, config.engine_options()));
    let handle = mount_fuse(mount_point, union, &settings)?;
    println!("Mounted {} at {}", spec, mount_point.display());

    handle
        .join()
        .map_err(|_| UnionError::Fuse("FUSE session thread panicked".to_string()))
}

pub fn unmount_union(mount_point: &Path) -> Result<()> {
    if unmount_fuse(mount_point)? {
        println!("Unmounted {}", mount_point.display());
        Ok(())
    } else {
        Err(UnionError::Fuse(format!(
            "Failed to unmount {} (is it mounted?)",
            mount_point.display()
        )))
    }
}
