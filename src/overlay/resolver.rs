use std::ffi::OsStr;
use std::fs::{self, Metadata};
use std::path::PathBuf;

use crate::error::{Result, UnionError};
use crate::overlay::context::MountContext;
use crate::overlay::convert::lstat_opt;
use crate::overlay::path::VirtualPath;
use crate::overlay::types::Location;
use crate::overlay::whiteout::WhiteoutManager;

/// Decides which branch holds a virtual path.
///
/// Every operation classifies its target here before acting on it.
pub(crate) struct BranchResolver<'a> {
    ctx: &'a MountContext,
}

impl<'a> BranchResolver<'a> {
    pub fn new(ctx: &'a MountContext) -> Self {
        BranchResolver { ctx }
    }

    pub fn resolve(&self, vpath: &VirtualPath) -> Result<Location> {
        if vpath.is_root() {
            return Ok(Location::ReadWriteCopiedUp);
        }

        let whiteouts = WhiteoutManager::new(self.ctx);

        // A whiteouted ancestor hides everything below it, and so does an
        // RW non-directory shadowing an RO directory.
        for ancestor in vpath.ancestors() {
            if whiteouts.find(&ancestor)? {
                tracing::trace!("{} hidden by whiteout on {}", vpath, ancestor);
                return Ok(Location::NonExistent);
            }
            if let Some(meta) = lstat_opt(&self.ctx.rw_path(&ancestor)?)? {
                if !meta.is_dir() {
                    return Ok(Location::NonExistent);
                }
            }
        }

        if whiteouts.find(vpath)? {
            tracing::trace!("{} is whiteouted", vpath);
            return Ok(Location::NonExistent);
        }

        let on_rw = lstat_opt(&self.ctx.rw_path(vpath)?)?.is_some();
        let on_ro = lstat_opt(&self.ctx.ro_path(vpath)?)?.is_some();

        let location = match (on_rw, on_ro) {
            (true, true) => Location::ReadWriteCopiedUp,
            (true, false) => Location::ReadWrite,
            (false, true) => Location::ReadOnly,
            (false, false) => Location::NonExistent,
        };
        tracing::trace!("Resolved {} to {:?}", vpath, location);
        Ok(location)
    }

    /// Validates `leaf` as a new entry of `parent` and returns the virtual
    /// path with its RW concrete path.
    pub fn resolve_for_create(
        &self,
        parent: &VirtualPath,
        leaf: &OsStr,
    ) -> Result<(VirtualPath, PathBuf)> {
        let vpath = parent.join(leaf)?;

        let parent_location = self.resolve(parent)?;
        if !parent_location.exists() {
            return Err(UnionError::NotFound(parent.to_string()));
        }
        if !self.lstat(parent, parent_location)?.is_dir() {
            return Err(UnionError::NotDirectory(parent.to_string()));
        }

        if self.resolve(&vpath)?.exists() {
            return Err(UnionError::AlreadyExists(vpath.to_string()));
        }
        let concrete = self.ctx.rw_path(&vpath)?;
        Ok((vpath, concrete))
    }

    /// The concrete object backing `vpath` at `location`.
    pub fn concrete_path(&self, vpath: &VirtualPath, location: Location) -> Result<PathBuf> {
        match location {
            Location::NonExistent => Err(UnionError::NotFound(vpath.to_string())),
            Location::ReadOnly => self.ctx.ro_path(vpath),
            Location::ReadWrite | Location::ReadWriteCopiedUp => self.ctx.rw_path(vpath),
        }
    }

    pub fn lstat(&self, vpath: &VirtualPath, location: Location) -> Result<Metadata> {
        let concrete = self.concrete_path(vpath, location)?;
        fs::symlink_metadata(&concrete).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                UnionError::not_found(&concrete)
            } else {
                UnionError::Io(e)
            }
        })
    }
}
