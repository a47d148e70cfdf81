//! Whiteout handling.
//!
//! A whiteout hides an RO object from the union. For an entry named `foo`
//! it is an empty `0400` file named `.wh.foo` in the RW copy of the parent
//! directory, owned by the configured marker identity.

use std::ffi::{OsStr, OsString};
use std::fs::{self, OpenOptions};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::path::PathBuf;

use crate::error::{Result, UnionError};
use crate::overlay::context::MountContext;
use crate::overlay::convert::{is_absent, lstat_opt};
use crate::overlay::copy_up::{rollback_created, CopyUpEngine};
use crate::overlay::path::{compose_marker, is_reserved_name, VirtualPath};

/// The prefix used for whiteout marker files.
pub const WHITEOUT_PREFIX: &str = ".wh.";

const WHITEOUT_MODE: u32 = 0o400;

/// Name-level helpers for whiteout markers.
pub struct Whiteout;

impl Whiteout {
    /// For a file named `foo`, this returns `.wh.foo`.
    pub fn marker_name(name: &OsStr) -> OsString {
        let mut whiteout_name = OsString::from(WHITEOUT_PREFIX);
        whiteout_name.push(name);
        whiteout_name
    }

    pub fn is_whiteout_marker(name: &OsStr) -> bool {
        name.as_bytes().starts_with(WHITEOUT_PREFIX.as_bytes())
    }

    /// For a whiteout marker `.wh.foo`, this returns `foo`.
    pub fn extract_target(whiteout_name: &OsStr) -> Option<OsString> {
        let name_bytes = whiteout_name.as_bytes();
        let prefix_bytes = WHITEOUT_PREFIX.as_bytes();

        if name_bytes.starts_with(prefix_bytes) && name_bytes.len() > prefix_bytes.len() {
            let target_bytes = &name_bytes[prefix_bytes.len()..];
            Some(OsString::from(OsStr::from_bytes(target_bytes)))
        } else {
            None
        }
    }
}

/// Creates, finds and removes whiteout markers on the RW branch.
pub(crate) struct WhiteoutManager<'a> {
    ctx: &'a MountContext,
}

impl<'a> WhiteoutManager<'a> {
    pub fn new(ctx: &'a MountContext) -> Self {
        WhiteoutManager { ctx }
    }

    pub fn marker_path(&self, vpath: &VirtualPath) -> Result<PathBuf> {
        compose_marker(self.ctx.rw(), vpath, WHITEOUT_PREFIX)
    }

    pub fn create(&self, vpath: &VirtualPath) -> Result<()> {
        let marker = self.marker_path(vpath)?;
        let owner = self.ctx.options().marker_owner;

        match lstat_opt(&marker)? {
            Some(meta) if meta.file_type().is_file() => {
                if meta.uid() != owner.uid || meta.gid() != owner.gid {
                    tracing::warn!(
                        "Whiteout {} owned by {}:{}, resetting to {}:{}",
                        marker.display(),
                        meta.uid(),
                        meta.gid(),
                        owner.uid,
                        owner.gid
                    );
                    std::os::unix::fs::lchown(&marker, Some(owner.uid), Some(owner.gid))?;
                }
                return Ok(());
            }
            Some(_) => {
                return Err(UnionError::AlreadyExists(marker.display().to_string()));
            }
            None => {}
        }

        let created = CopyUpEngine::new(self.ctx).ensure_ancestry(vpath)?;

        let file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(WHITEOUT_MODE)
            .custom_flags(libc::O_NOFOLLOW)
            .open(&marker)
        {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Ok(()),
            Err(e) => {
                rollback_created(&created, None);
                return Err(UnionError::Io(e));
            }
        };

        if let Err(e) = std::os::unix::fs::fchown(&file, Some(owner.uid), Some(owner.gid)) {
            drop(file);
            rollback_created(&created, Some(&marker));
            return Err(UnionError::Io(e));
        }

        tracing::debug!("Created whiteout for {} at {}", vpath, marker.display());
        Ok(())
    }

    /// Whether `vpath` is whiteouted. Only absence of the marker counts as
    /// `false`; other lookup failures are errors.
    pub fn find(&self, vpath: &VirtualPath) -> Result<bool> {
        let marker = match self.marker_path(vpath) {
            Ok(marker) => marker,
            // no marker can exist for the root or for overlong names
            Err(UnionError::NameTooLong(_)) | Err(UnionError::InvalidPath(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        Ok(lstat_opt(&marker)?.is_some())
    }

    pub fn remove(&self, vpath: &VirtualPath) -> Result<()> {
        let marker = match self.marker_path(vpath) {
            Ok(marker) => marker,
            Err(UnionError::NameTooLong(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        match fs::remove_file(&marker) {
            Ok(()) => {
                tracing::debug!("Removed whiteout for {}", vpath);
                Ok(())
            }
            Err(e) if is_absent(&e) => Ok(()),
            Err(e) => Err(UnionError::Io(e)),
        }
    }

    /// Whiteouts every RO child of `vpath` inside the RW directory that was
    /// just created over it.
    pub fn hide_directory_contents(&self, vpath: &VirtualPath) -> Result<()> {
        let ro_dir = self.ctx.ro_path(vpath)?;
        match lstat_opt(&ro_dir)? {
            Some(meta) if meta.is_dir() => {}
            _ => return Ok(()),
        }

        let mut hidden = 0usize;
        for entry in fs::read_dir(&ro_dir)? {
            let name = entry?.file_name();
            if is_reserved_name(&name) {
                continue;
            }
            self.create(&vpath.join(&name)?)?;
            hidden += 1;
        }
        tracing::debug!("Hid {} RO entries under {}", hidden, vpath);
        Ok(())
    }
}
