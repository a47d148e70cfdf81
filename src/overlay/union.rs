use fuser::{FileAttr, FileType};
use std::ffi::OsStr;
use std::fs::{self, DirBuilder, File, OpenOptions, Permissions};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use crate::error::{Result, UnionError};
use crate::overlay::context::{EngineOptions, MountContext};
use crate::overlay::copy_up::{rollback_created, CopyUpEngine};
use crate::overlay::convert::lstat_opt;
use crate::overlay::locks::{PathGuard, PathLockTable};
use crate::overlay::merge::{AccessOverlay, DirectoryMerge, ACCESS_READ, ACCESS_WRITE};
use crate::overlay::metadata::{MetadataOverlay, OverlayAttrs};
use crate::overlay::path::{is_reserved_name, VirtualPath};
use crate::overlay::resolver::BranchResolver;
use crate::overlay::types::{Branches, Credentials, Location, MergedEntry, SetAttr, StatFs};
use crate::overlay::whiteout::WhiteoutManager;

/// The union of one RO and one RW branch.
///
/// Every mutating operation locks its target and the target's parent before
/// it classifies the path, and keeps both until the mutation is complete.
/// Creating a child and removing or changing its parent therefore contend
/// on the same key.
pub struct Union {
    ctx: MountContext,
    locks: PathLockTable,
}

impl Union {
    pub fn new(branches: Branches, options: EngineOptions) -> Self {
        Union {
            ctx: MountContext::new(branches, options),
            locks: PathLockTable::new(),
        }
    }

    pub fn context(&self) -> &MountContext {
        &self.ctx
    }

    pub fn branches(&self) -> &Branches {
        self.ctx.branches()
    }

    /// Number of path locks currently held or awaited.
    pub fn held_locks(&self) -> usize {
        self.locks.len()
    }

    /// Locks each path together with its parent, whose RW directory the
    /// operation may create or change.
    fn lock(&self, vpaths: &[&VirtualPath]) -> Result<Vec<PathGuard<'_>>> {
        let mut keys = Vec::with_capacity(vpaths.len() * 2);
        for vpath in vpaths {
            keys.push(self.ctx.rw_path(vpath)?);
            if let Some(parent) = vpath.parent() {
                keys.push(self.ctx.rw_path(&parent)?);
            }
        }
        Ok(self.locks.lock_all(keys))
    }

    pub fn resolve(&self, vpath: &VirtualPath) -> Result<Location> {
        BranchResolver::new(&self.ctx).resolve(vpath)
    }

    pub fn getattr(&self, vpath: &VirtualPath) -> Result<FileAttr> {
        let (_, attr) = AccessOverlay::new(&self.ctx).effective_attr(vpath)?;
        Ok(attr)
    }

    /// Looks up `name` in `parent`. Reserved names never exist.
    pub fn lookup(&self, parent: &VirtualPath, name: &OsStr) -> Result<(VirtualPath, FileAttr)> {
        let vpath = match parent.join(name) {
            Ok(vpath) => vpath,
            Err(UnionError::ReservedName(_)) => {
                return Err(UnionError::NotFound(format!(
                    "{}/{}",
                    parent,
                    name.to_string_lossy()
                )))
            }
            Err(e) => return Err(e),
        };
        let attr = self.getattr(&vpath)?;
        Ok((vpath, attr))
    }

    /// Checks access for an `open(2)` with `flags` and returns the concrete
    /// path to open. Opening an RO object for writing copies it up first.
    pub fn open(&self, vpath: &VirtualPath, creds: &Credentials, flags: i32) -> Result<PathBuf> {
        let _guards = self.lock(&[vpath])?;
        let access = AccessOverlay::new(&self.ctx);
        let (location, attr) = access.effective_attr(vpath)?;

        let writes = flags & libc::O_ACCMODE != libc::O_RDONLY || flags & libc::O_TRUNC != 0;
        if writes && attr.kind == FileType::Directory {
            return Err(UnionError::IsDirectory(vpath.to_string()));
        }
        let mut mask = 0;
        if flags & libc::O_ACCMODE != libc::O_WRONLY {
            mask |= ACCESS_READ;
        }
        if writes {
            mask |= ACCESS_WRITE;
        }
        access.can_access(vpath, creds, mask)?;

        if writes && location == Location::ReadOnly {
            CopyUpEngine::new(&self.ctx).copy_up(vpath)?;
            return self.ctx.rw_path(vpath);
        }
        BranchResolver::new(&self.ctx).concrete_path(vpath, location)
    }

    /// Creates a regular file and returns it opened for reading and writing.
    pub fn create(
        &self,
        parent: &VirtualPath,
        name: &OsStr,
        mode: u32,
        creds: &Credentials,
    ) -> Result<(VirtualPath, File)> {
        self.create_entry(parent, name, creds, |_, rw| {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .mode(mode & 0o7777)
                .open(rw)?;
            file.set_permissions(Permissions::from_mode(mode & 0o7777))?;
            Ok(file)
        })
    }

    /// Creates a directory. Over a hidden RO directory the new directory
    /// starts out empty: every RO child gets a whiteout inside it.
    pub fn mkdir(
        &self,
        parent: &VirtualPath,
        name: &OsStr,
        mode: u32,
        creds: &Credentials,
    ) -> Result<VirtualPath> {
        let (vpath, ()) = self.create_entry(parent, name, creds, |vpath, rw| {
            DirBuilder::new().mode(0o700).create(rw)?;
            let hidden = self.hide_ro_directory(vpath).and_then(|_| {
                fs::set_permissions(rw, Permissions::from_mode(mode & 0o7777))?;
                Ok(())
            });
            if let Err(e) = hidden {
                if let Err(cleanup) = fs::remove_dir_all(rw) {
                    tracing::warn!("Failed to remove {} after mkdir error: {}", rw.display(), cleanup);
                }
                return Err(e);
            }
            Ok(())
        })?;
        Ok(vpath)
    }

    fn hide_ro_directory(&self, vpath: &VirtualPath) -> Result<()> {
        let ro = self.ctx.ro_path(vpath)?;
        if lstat_opt(&ro)?.is_some_and(|m| m.is_dir()) {
            WhiteoutManager::new(&self.ctx).hide_directory_contents(vpath)?;
        }
        Ok(())
    }

    /// Creates a FIFO, socket or device node.
    pub fn mknod(
        &self,
        parent: &VirtualPath,
        name: &OsStr,
        mode: u32,
        rdev: u64,
        creds: &Credentials,
    ) -> Result<VirtualPath> {
        let (vpath, ()) = self.create_entry(parent, name, creds, |_, rw| {
            let kind = nix::sys::stat::SFlag::from_bits_truncate(
                (mode & libc::S_IFMT as u32) as libc::mode_t,
            );
            let perm = nix::sys::stat::Mode::from_bits_truncate((mode & 0o7777) as libc::mode_t);
            nix::sys::stat::mknod(rw, kind, perm, rdev as libc::dev_t)
                .map_err(|e| UnionError::Io(std::io::Error::from(e)))?;
            fs::set_permissions(rw, Permissions::from_mode(mode & 0o7777))?;
            Ok(())
        })?;
        Ok(vpath)
    }

    pub fn symlink(
        &self,
        parent: &VirtualPath,
        name: &OsStr,
        target: &Path,
        creds: &Credentials,
    ) -> Result<VirtualPath> {
        let (vpath, ()) = self.create_entry(parent, name, creds, |_, rw| {
            std::os::unix::fs::symlink(target, rw)?;
            Ok(())
        })?;
        Ok(vpath)
    }

    /// Hard links `source` as `new_name` in `new_parent`.
    pub fn link(
        &self,
        source: &VirtualPath,
        new_parent: &VirtualPath,
        new_name: &OsStr,
        creds: &Credentials,
    ) -> Result<VirtualPath> {
        let target = new_parent.join(new_name)?;
        let _guards = self.lock(&[source, &target])?;

        let (target, _) = BranchResolver::new(&self.ctx).resolve_for_create(new_parent, new_name)?;
        AccessOverlay::new(&self.ctx).can_create(&target, creds)?;
        CopyUpEngine::new(&self.ctx).link_or_copy_up(source, &target)?;
        MetadataOverlay::new(&self.ctx).remove(&target)?;
        Ok(target)
    }

    pub fn unlink(&self, vpath: &VirtualPath, creds: &Credentials) -> Result<()> {
        let _guards = self.lock(&[vpath])?;
        let resolver = BranchResolver::new(&self.ctx);
        let location = resolver.resolve(vpath)?;
        if !location.exists() {
            return Err(UnionError::NotFound(vpath.to_string()));
        }
        if resolver.lstat(vpath, location)?.is_dir() {
            return Err(UnionError::IsDirectory(vpath.to_string()));
        }
        AccessOverlay::new(&self.ctx).can_remove(vpath, creds)?;
        self.remove_resolved(vpath, location, false)?;
        tracing::debug!("Unlinked {} ({:?})", vpath, location);
        Ok(())
    }

    pub fn rmdir(&self, vpath: &VirtualPath, creds: &Credentials) -> Result<()> {
        if vpath.is_root() {
            return Err(UnionError::PermissionDenied(
                "cannot remove the union root".to_string(),
            ));
        }
        let _guards = self.lock(&[vpath])?;
        let resolver = BranchResolver::new(&self.ctx);
        let location = resolver.resolve(vpath)?;
        if !location.exists() {
            return Err(UnionError::NotFound(vpath.to_string()));
        }
        if !resolver.lstat(vpath, location)?.is_dir() {
            return Err(UnionError::NotDirectory(vpath.to_string()));
        }
        if !DirectoryMerge::new(&self.ctx).is_empty_under_overlay(vpath)? {
            return Err(UnionError::DirectoryNotEmpty(vpath.to_string()));
        }
        AccessOverlay::new(&self.ctx).can_remove(vpath, creds)?;
        self.remove_resolved(vpath, location, true)?;
        tracing::debug!("Removed directory {} ({:?})", vpath, location);
        Ok(())
    }

    pub fn setattr(
        &self,
        vpath: &VirtualPath,
        changes: &SetAttr,
        creds: &Credentials,
    ) -> Result<FileAttr> {
        let _guards = self.lock(&[vpath])?;
        if !changes.is_empty() {
            AccessOverlay::new(&self.ctx).can_set_attributes(vpath, creds, changes)?;
            MetadataOverlay::new(&self.ctx).set(vpath, changes)?;
        }
        self.getattr(vpath)
    }

    pub fn readlink(&self, vpath: &VirtualPath) -> Result<PathBuf> {
        let resolver = BranchResolver::new(&self.ctx);
        let location = resolver.resolve(vpath)?;
        let concrete = resolver.concrete_path(vpath, location)?;
        Ok(fs::read_link(concrete)?)
    }

    pub fn readdir(&self, vpath: &VirtualPath) -> Result<Vec<MergedEntry>> {
        DirectoryMerge::new(&self.ctx).list_merged(vpath)
    }

    pub fn is_empty_dir(&self, vpath: &VirtualPath) -> Result<bool> {
        DirectoryMerge::new(&self.ctx).is_empty_under_overlay(vpath)
    }

    pub fn access(&self, vpath: &VirtualPath, creds: &Credentials, mask: u32) -> Result<()> {
        let access = AccessOverlay::new(&self.ctx);
        if mask == 0 {
            // F_OK
            return access.effective_attr(vpath).map(|_| ());
        }
        access.can_access(vpath, creds, mask)
    }

    pub fn statfs(&self) -> Result<StatFs> {
        let stat = nix::sys::statvfs::statvfs(self.ctx.ro().root())
            .map_err(|e| UnionError::Io(std::io::Error::from(e)))?;
        Ok(StatFs {
            blocks: stat.blocks() as u64,
            blocks_free: stat.blocks_free() as u64,
            blocks_available: stat.blocks_available() as u64,
            files: stat.files() as u64,
            files_free: stat.files_free() as u64,
            block_size: stat.block_size() as u32,
            name_max: stat.name_max() as u32,
            fragment_size: stat.fragment_size() as u32,
        })
    }

    pub fn copy_up(&self, vpath: &VirtualPath) -> Result<()> {
        let _guards = self.lock(&[vpath])?;
        CopyUpEngine::new(&self.ctx).copy_up(vpath)
    }

    pub fn is_whiteouted(&self, vpath: &VirtualPath) -> Result<bool> {
        WhiteoutManager::new(&self.ctx).find(vpath)
    }

    pub fn metadata_overlay(&self, vpath: &VirtualPath) -> Result<Option<OverlayAttrs>> {
        MetadataOverlay::new(&self.ctx).get(vpath)
    }

    /// Concrete object for extended attribute calls. Changes copy an RO
    /// object up first.
    pub fn xattr_target(&self, vpath: &VirtualPath, for_write: bool) -> Result<PathBuf> {
        let _guards = self.lock(&[vpath])?;
        let resolver = BranchResolver::new(&self.ctx);
        let location = resolver.resolve(vpath)?;
        if for_write && location == Location::ReadOnly {
            CopyUpEngine::new(&self.ctx).copy_up(vpath)?;
            return self.ctx.rw_path(vpath);
        }
        resolver.concrete_path(vpath, location)
    }

    fn create_entry<T, F>(
        &self,
        parent: &VirtualPath,
        name: &OsStr,
        creds: &Credentials,
        make: F,
    ) -> Result<(VirtualPath, T)>
    where
        F: FnOnce(&VirtualPath, &Path) -> Result<T>,
    {
        let vpath = parent.join(name)?;
        let _guards = self.lock(&[&vpath])?;

        let (vpath, rw) = BranchResolver::new(&self.ctx).resolve_for_create(parent, name)?;
        AccessOverlay::new(&self.ctx).can_create(&vpath, creds)?;
        let created = CopyUpEngine::new(&self.ctx).ensure_ancestry(&vpath)?;

        let made = match make(&vpath, &rw) {
            Ok(made) => made,
            Err(e) => {
                rollback_created(&created, None);
                return Err(e);
            }
        };
        if let Err(e) = self.finish_create(&vpath, &rw, creds) {
            rollback_created(&created, Some(&rw));
            return Err(e);
        }

        tracing::debug!("Created {} at {}", vpath, rw.display());
        Ok((vpath, made))
    }

    fn finish_create(&self, vpath: &VirtualPath, rw: &Path, creds: &Credentials) -> Result<()> {
        if nix::unistd::geteuid().is_root() {
            std::os::unix::fs::lchown(rw, Some(creds.uid), Some(creds.gid))?;
        }
        WhiteoutManager::new(&self.ctx).remove(vpath)?;
        MetadataOverlay::new(&self.ctx).remove(vpath)
    }

    fn remove_resolved(&self, vpath: &VirtualPath, location: Location, is_dir: bool) -> Result<()> {
        let whiteouts = WhiteoutManager::new(&self.ctx);
        let overlay = MetadataOverlay::new(&self.ctx);
        match location {
            Location::NonExistent => Err(UnionError::NotFound(vpath.to_string())),
            Location::ReadOnly => {
                whiteouts.create(vpath)?;
                overlay.remove(vpath)
            }
            Location::ReadWrite | Location::ReadWriteCopiedUp => {
                let rw = self.ctx.rw_path(vpath)?;
                let hides_ro = location == Location::ReadWriteCopiedUp;
                // The RO original must never show through, even briefly.
                if hides_ro {
                    whiteouts.create(vpath)?;
                }
                let removed = if is_dir {
                    Self::purge_markers(&rw).and_then(|_| Ok(fs::remove_dir(&rw)?))
                } else {
                    fs::remove_file(&rw).map_err(UnionError::from)
                };
                if let Err(e) = removed {
                    if hides_ro {
                        if let Err(cleanup) = whiteouts.remove(vpath) {
                            tracing::warn!("Failed to undo whiteout of {}: {}", vpath, cleanup);
                        }
                    }
                    return Err(e);
                }
                overlay.remove(vpath)
            }
        }
    }

    /// Removes the bookkeeping entries of an RW directory that is empty in
    /// the union, so the directory itself can be removed.
    fn purge_markers(dir: &Path) -> Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            if is_reserved_name(&name) {
                fs::remove_file(entry.path())?;
            } else {
                return Err(UnionError::Inconsistent(format!(
                    "{} holds {:?} but is empty in the union",
                    dir.display(),
                    name
                )));
            }
        }
        Ok(())
    }
}
