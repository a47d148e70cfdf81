use nix::sys::stat::{mknod, Mode, SFlag};
use std::fs::{self, Metadata, Permissions};
use std::io;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use crate::error::{Result, UnionError};
use crate::overlay::context::MountContext;
use crate::overlay::convert::{lstat_opt, set_times_nofollow};
use crate::overlay::metadata::{restore_record, MetadataOverlay, OverlayAttrs};
use crate::overlay::path::VirtualPath;
use crate::overlay::resolver::BranchResolver;
use crate::overlay::types::Location;
use crate::overlay::whiteout::WhiteoutManager;

#[cfg(target_os = "macos")]
pub(crate) fn clone_file_optimized(src: &Path, dest: &Path) -> io::Result<()> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let src_cstr = CString::new(src.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains null byte"))?;
    let dest_cstr = CString::new(dest.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains null byte"))?;

    // SAFETY: Both paths are properly null-terminated CStrings that outlive the call.
    unsafe {
        if libc::clonefile(src_cstr.as_ptr(), dest_cstr.as_ptr(), 0) == 0 {
            return Ok(());
        }
    }
    fs::copy(src, dest)?;
    Ok(())
}

#[cfg(not(target_os = "macos"))]
pub(crate) fn clone_file_optimized(src: &Path, dest: &Path) -> io::Result<()> {
    fs::copy(src, dest)?;
    Ok(())
}

/// Gives `path` the requested owner. Without privilege a refused change is
/// logged and skipped.
pub(crate) fn preserve_owner(path: &Path, uid: u32, gid: u32) -> Result<()> {
    if let Some(meta) = lstat_opt(path)? {
        if meta.uid() == uid && meta.gid() == gid {
            return Ok(());
        }
    }
    match std::os::unix::fs::lchown(path, Some(uid), Some(gid)) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::EPERM) && !nix::unistd::geteuid().is_root() => {
            tracing::warn!(
                "Cannot give {} owner {}:{} without privilege; keeping current owner",
                path.display(),
                uid,
                gid
            );
            Ok(())
        }
        Err(e) => Err(UnionError::Io(e)),
    }
}

/// RW directories created for one operation, outermost first, with the
/// metadata records folded into them.
#[derive(Debug, Default)]
pub(crate) struct CreatedAncestry {
    dirs: Vec<PathBuf>,
    records: Vec<(PathBuf, OverlayAttrs)>,
}

impl CreatedAncestry {
    pub fn dirs(&self) -> &[PathBuf] {
        &self.dirs
    }

    pub fn is_empty(&self) -> bool {
        self.dirs.is_empty()
    }
}

/// Removes an object created by a failed operation, then the directories
/// created for it, innermost first, and puts back the records they absorbed.
pub(crate) fn rollback_created(created: &CreatedAncestry, dest: Option<&Path>) {
    if let Some(dest) = dest {
        let removed = match lstat_opt(dest) {
            Ok(Some(meta)) if meta.is_dir() => fs::remove_dir(dest),
            Ok(Some(_)) => fs::remove_file(dest),
            _ => Ok(()),
        };
        if let Err(e) = removed {
            tracing::warn!("Rollback could not remove {}: {}", dest.display(), e);
        }
    }
    for dir in created.dirs.iter().rev() {
        if let Err(e) = fs::remove_dir(dir) {
            tracing::warn!("Rollback could not remove {}: {}", dir.display(), e);
        }
    }
    for (record, attrs) in &created.records {
        if let Err(e) = restore_record(record, attrs) {
            tracing::warn!("Rollback could not restore {}: {}", record.display(), e);
        }
    }
}

/// Materializes RW copies of RO objects.
pub(crate) struct CopyUpEngine<'a> {
    ctx: &'a MountContext,
}

impl<'a> CopyUpEngine<'a> {
    pub fn new(ctx: &'a MountContext) -> Self {
        CopyUpEngine { ctx }
    }

    /// Creates every missing RW ancestor of `vpath`, modelled on the
    /// effective attributes of its RO counterpart when there is one.
    pub fn ensure_ancestry(&self, vpath: &VirtualPath) -> Result<CreatedAncestry> {
        let mut created = CreatedAncestry::default();

        for ancestor in vpath.ancestors() {
            if let Err(e) = self.ensure_directory(&ancestor, &mut created) {
                rollback_created(&created, None);
                return Err(e);
            }
        }

        if !created.is_empty() {
            tracing::debug!("Created {} RW ancestor(s) for {}", created.dirs().len(), vpath);
        }
        Ok(created)
    }

    fn ensure_directory(&self, dir: &VirtualPath, created: &mut CreatedAncestry) -> Result<()> {
        let rw = self.ctx.rw_path(dir)?;
        match lstat_opt(&rw)? {
            Some(meta) if meta.is_dir() => return Ok(()),
            Some(_) => return Err(UnionError::NotDirectory(dir.to_string())),
            None => {}
        }

        // A record overrides the RO directory's attributes and must not
        // outlive the RW copy.
        let overlay = MetadataOverlay::new(self.ctx);
        let record = overlay.get(dir)?;
        let template = match record {
            Some(attrs) => Some(attrs),
            None => lstat_opt(&self.ctx.ro_path(dir)?)?
                .filter(|m| m.is_dir())
                .map(|m| OverlayAttrs::from_metadata(&m)),
        };

        match fs::create_dir(&rw) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Ok(()),
            Err(e) => return Err(UnionError::Io(e)),
        }

        let stamped = match &template {
            Some(attrs) => Self::apply_attributes(&rw, attrs, false),
            None => fs::set_permissions(
                &rw,
                Permissions::from_mode(self.ctx.options().default_dir_mode),
            )
            .map_err(UnionError::Io),
        }
        .and_then(|_| match record {
            Some(attrs) => {
                let record_path = overlay.record_path(dir)?;
                overlay.remove(dir)?;
                created.records.push((record_path, attrs));
                Ok(())
            }
            None => Ok(()),
        });
        if let Err(e) = stamped {
            if let Err(cleanup) = fs::remove_dir(&rw) {
                tracing::warn!("Rollback could not remove {}: {}", rw.display(), cleanup);
            }
            return Err(e);
        }
        created.dirs.push(rw);
        Ok(())
    }

    /// Copies an RO-only object to RW. Already on RW is a no-op.
    pub fn copy_up(&self, vpath: &VirtualPath) -> Result<()> {
        match BranchResolver::new(self.ctx).resolve(vpath)? {
            Location::ReadWrite | Location::ReadWriteCopiedUp => return Ok(()),
            Location::NonExistent => return Err(UnionError::NotFound(vpath.to_string())),
            Location::ReadOnly => {}
        }

        let ro = self.ctx.ro_path(vpath)?;
        let rw = self.ctx.rw_path(vpath)?;
        let source = fs::symlink_metadata(&ro).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                UnionError::not_found(&ro)
            } else {
                UnionError::Io(e)
            }
        })?;

        let overlay = MetadataOverlay::new(self.ctx);
        let effective = overlay
            .get(vpath)?
            .unwrap_or_else(|| OverlayAttrs::from_metadata(&source));

        let created = self.ensure_ancestry(vpath)?;

        let result = Self::materialize(&ro, &rw, &source)
            .and_then(|_| {
                Self::apply_attributes(&rw, &effective, source.file_type().is_symlink())
            })
            .and_then(|_| overlay.remove(vpath));

        if let Err(e) = result {
            tracing::warn!("Copy-up of {} failed: {}", vpath, e);
            rollback_created(&created, Some(&rw));
            return Err(e);
        }

        tracing::debug!("Copied up {} to {}", vpath, rw.display());
        Ok(())
    }

    fn materialize(ro: &Path, rw: &Path, source: &Metadata) -> Result<()> {
        let file_type = source.file_type();
        if file_type.is_file() {
            clone_file_optimized(ro, rw)?;
        } else if file_type.is_dir() {
            fs::create_dir(rw)?;
        } else if file_type.is_symlink() {
            std::os::unix::fs::symlink(fs::read_link(ro)?, rw)?;
        } else {
            let kind = SFlag::from_bits_truncate((source.mode() & libc::S_IFMT as u32) as libc::mode_t);
            let perm = Mode::from_bits_truncate((source.mode() & 0o7777) as libc::mode_t);
            mknod(rw, kind, perm, source.rdev() as libc::dev_t)
                .map_err(|e| UnionError::Io(io::Error::from(e)))?;
        }
        Ok(())
    }

    fn apply_attributes(path: &Path, attrs: &OverlayAttrs, is_symlink: bool) -> Result<()> {
        preserve_owner(path, attrs.uid, attrs.gid)?;
        if !is_symlink {
            fs::set_permissions(path, Permissions::from_mode(attrs.perm))?;
        }
        set_times_nofollow(path, Some(attrs.atime), Some(attrs.mtime))?;
        Ok(())
    }

    /// Links `target` to `source`. An RO source cannot be hard linked across
    /// branches, so the new entry becomes a symlink to the RO object.
    pub fn link_or_copy_up(&self, source: &VirtualPath, target: &VirtualPath) -> Result<()> {
        let resolver = BranchResolver::new(self.ctx);
        let location = resolver.resolve(source)?;
        if !location.exists() {
            return Err(UnionError::NotFound(source.to_string()));
        }
        if resolver.lstat(source, location)?.is_dir() {
            return Err(UnionError::PermissionDenied(format!(
                "{}: cannot hard link a directory",
                source
            )));
        }

        let rw_target = self.ctx.rw_path(target)?;
        let created = self.ensure_ancestry(target)?;

        let linked = match location {
            Location::ReadOnly => {
                std::os::unix::fs::symlink(self.ctx.ro_path(source)?, &rw_target)
            }
            _ => fs::hard_link(self.ctx.rw_path(source)?, &rw_target),
        };
        if let Err(e) = linked {
            rollback_created(&created, None);
            return Err(UnionError::Io(e));
        }

        if let Err(e) = WhiteoutManager::new(self.ctx).remove(target) {
            rollback_created(&created, Some(&rw_target));
            return Err(e);
        }

        tracing::debug!("Linked {} -> {} ({:?})", target, source, location);
        Ok(())
    }
}
