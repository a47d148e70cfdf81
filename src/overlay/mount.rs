use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::error::{Result, UnionError};
use crate::overlay::{Union, UnionFuse};

/// Kernel-side options of a mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MountSettings {
    pub ttl: Duration,
    pub allow_other: bool,
    pub auto_unmount: bool,
}

impl Default for MountSettings {
    fn default() -> Self {
        MountSettings {
            ttl: Duration::from_secs(1),
            allow_other: false,
            auto_unmount: true,
        }
    }
}

fn mount_options(settings: &MountSettings) -> Vec<fuser::MountOption> {
    let mut options = vec![
        fuser::MountOption::FSName("twinfs".to_string()),
        fuser::MountOption::Subtype("twinfs".to_string()),
    ];
    if settings.allow_other {
        options.push(fuser::MountOption::AllowOther);
    }
    if settings.auto_unmount {
        options.push(fuser::MountOption::AutoUnmount);
    }
    options
}

/// Mounts `union` at `mount_point` on a background thread.
///
/// Returns once the kernel serves the mount point, with the handle of the
/// session thread; the thread ends when the filesystem is unmounted.
pub fn mount_fuse(
    mount_point: &Path,
    union: Arc<Union>,
    settings: &MountSettings,
) -> Result<JoinHandle<()>> {
    fs::create_dir_all(mount_point).map_err(|e| {
        UnionError::Config(format!(
            "Failed to create mount directory {}: {}",
            mount_point.display(),
            e
        ))
    })?;
    let unmounted_dev = fs::metadata(mount_point)?.dev();

    let fs = UnionFuse::new(union, settings.ttl);
    let options = mount_options(settings);
    let mount_point_clone = mount_point.to_path_buf();

    // Reports a failed mount back to the caller instead of only logging it.
    let (mount_status_tx, mount_status_rx) =
        std::sync::mpsc::channel::<std::result::Result<(), String>>();

    let handle = std::thread::spawn(move || {
        tracing::info!(
            "Mounting twinfs at {}",
            mount_point_clone.display()
        );

        match fuser::mount2(fs, &mount_point_clone, &options) {
            Ok(_) => tracing::info!("twinfs unmounted from {}", mount_point_clone.display()),
            Err(e) => {
                tracing::error!("FUSE mount error: {}", e);
                let _ = mount_status_tx.send(Err(e.to_string()));
            }
        }
    });

    let mount_timeout = Duration::from_millis(2000);
    let check_interval = Duration::from_millis(50);
    let start = std::time::Instant::now();

    loop {
        match mount_status_rx.try_recv() {
            Ok(Err(e)) => {
                return Err(UnionError::Fuse(format!("FUSE mount failed: {}", e)));
            }
            Ok(Ok(())) => break,
            Err(std::sync::mpsc::TryRecvError::Disconnected) => {
                if handle.is_finished() {
                    return Err(UnionError::Fuse(
                        "FUSE session ended before the mount came up".to_string(),
                    ));
                }
            }
            Err(std::sync::mpsc::TryRecvError::Empty) => {}
        }

        // The mount point changes device once the kernel serves it.
        if let Ok(meta) = fs::metadata(mount_point) {
            if meta.dev() != unmounted_dev {
                tracing::debug!("FUSE mount verified at {}", mount_point.display());
                break;
            }
        }

        if start.elapsed() >= mount_timeout {
            return Err(UnionError::Fuse(
                "FUSE mount timed out - mount point not served after 2 seconds".to_string(),
            ));
        }

        std::thread::sleep(check_interval);
    }

    Ok(handle)
}

/// Unmounts the filesystem at `mount_path`.
///
/// Returns Ok(true) if unmount succeeded and Ok(false) if the command ran
/// but failed, which usually means nothing was mounted there.
pub fn unmount_fuse(mount_path: &Path) -> Result<bool> {
    let status = if cfg!(target_os = "macos") {
        std::process::Command::new("diskutil")
            .args(["unmount", "force"])
            .arg(mount_path)
            .status()
    } else {
        match std::process::Command::new("fusermount")
            .arg("-u")
            .arg(mount_path)
            .status()
        {
            Ok(status) => Ok(status),
            Err(e) => {
                tracing::debug!("fusermount unavailable ({}), falling back to umount", e);
                std::process::Command::new("umount").arg(mount_path).status()
            }
        }
    };

    match status {
        Ok(status) => Ok(status.success()),
        Err(e) => Err(UnionError::Fuse(format!(
            "Failed to run unmount command for {}: {}",
            mount_path.display(),
            e
        ))),
    }
}
