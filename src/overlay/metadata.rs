//! Metadata overlay records.
//!
//! Changing the mode, owner or timestamps of an RO object must not copy its
//! content. Instead an empty record named `.me.<leaf>` is placed beside it on
//! RW; the record's own inode attributes are the overriding values.

use fuser::FileAttr;
use std::fs::{self, Metadata, OpenOptions, Permissions};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::error::{Result, UnionError};
use crate::overlay::context::MountContext;
use crate::overlay::convert::{
    is_absent, lstat_opt, metadata_atime, metadata_ctime, metadata_mtime, metadata_to_fileattr,
    set_times_nofollow,
};
use crate::overlay::copy_up::{
    preserve_owner, rollback_created, CopyUpEngine, CreatedAncestry,
};
use crate::overlay::path::{compose_marker, VirtualPath};
use crate::overlay::resolver::BranchResolver;
use crate::overlay::types::{Location, SetAttr};

/// The prefix used for metadata overlay records.
pub const METADATA_PREFIX: &str = ".me.";

const RECORD_CREATE_MODE: u32 = 0o600;

/// Attributes a record overrides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverlayAttrs {
    /// Permission bits including setuid, setgid and sticky.
    pub perm: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
}

impl OverlayAttrs {
    pub fn from_metadata(meta: &Metadata) -> Self {
        OverlayAttrs {
            perm: meta.mode() & 0o7777,
            uid: meta.uid(),
            gid: meta.gid(),
            atime: metadata_atime(meta),
            mtime: metadata_mtime(meta),
            ctime: metadata_ctime(meta),
        }
    }

    pub fn with_changes(mut self, changes: &SetAttr) -> Self {
        if let Some(mode) = changes.mode {
            self.perm = mode & 0o7777;
        }
        if let Some(uid) = changes.uid {
            self.uid = uid;
        }
        if let Some(gid) = changes.gid {
            self.gid = gid;
        }
        if let Some(atime) = changes.atime {
            self.atime = atime;
        }
        if let Some(mtime) = changes.mtime {
            self.mtime = mtime;
        }
        self
    }

    pub fn apply_to(&self, attr: &mut FileAttr) {
        attr.perm = self.perm as u16;
        attr.uid = self.uid;
        attr.gid = self.gid;
        attr.atime = self.atime;
        attr.mtime = self.mtime;
        attr.ctime = self.ctime;
    }
}

/// Recreates a record with `attrs`. Used when a failed operation undoes the
/// RW directory that absorbed it.
pub(crate) fn restore_record(record: &Path, attrs: &OverlayAttrs) -> Result<()> {
    OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(RECORD_CREATE_MODE)
        .custom_flags(libc::O_NOFOLLOW)
        .open(record)?;
    preserve_owner(record, attrs.uid, attrs.gid)?;
    fs::set_permissions(record, Permissions::from_mode(attrs.perm))?;
    set_times_nofollow(record, Some(attrs.atime), Some(attrs.mtime))?;
    Ok(())
}

pub(crate) struct MetadataOverlay<'a> {
    ctx: &'a MountContext,
}

impl<'a> MetadataOverlay<'a> {
    pub fn new(ctx: &'a MountContext) -> Self {
        MetadataOverlay { ctx }
    }

    pub fn record_path(&self, vpath: &VirtualPath) -> Result<PathBuf> {
        compose_marker(self.ctx.rw(), vpath, METADATA_PREFIX)
    }

    pub fn get(&self, vpath: &VirtualPath) -> Result<Option<OverlayAttrs>> {
        let record = match self.record_path(vpath) {
            Ok(record) => record,
            Err(UnionError::NameTooLong(_)) | Err(UnionError::InvalidPath(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        Ok(lstat_opt(&record)?.map(|meta| OverlayAttrs::from_metadata(&meta)))
    }

    pub fn remove(&self, vpath: &VirtualPath) -> Result<()> {
        let record = match self.record_path(vpath) {
            Ok(record) => record,
            Err(UnionError::NameTooLong(_)) | Err(UnionError::InvalidPath(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        match fs::remove_file(&record) {
            Ok(()) => {
                tracing::debug!("Removed metadata record for {}", vpath);
                Ok(())
            }
            Err(e) if is_absent(&e) => Ok(()),
            Err(e) => Err(UnionError::Io(e)),
        }
    }

    /// Applies `changes` to `vpath` wherever it currently lives.
    pub fn set(&self, vpath: &VirtualPath, changes: &SetAttr) -> Result<()> {
        let location = BranchResolver::new(self.ctx).resolve(vpath)?;
        match location {
            Location::NonExistent => Err(UnionError::NotFound(vpath.to_string())),
            Location::ReadOnly if changes.changes_content() => {
                CopyUpEngine::new(self.ctx).copy_up(vpath)?;
                self.apply_to_rw(vpath, changes)
            }
            Location::ReadOnly => self.write_record(vpath, changes),
            Location::ReadWrite | Location::ReadWriteCopiedUp => {
                self.apply_to_rw(vpath, changes)?;
                self.remove(vpath)
            }
        }
    }

    /// The attributes callers see for `vpath` at `location`.
    pub fn effective_attr(&self, vpath: &VirtualPath, location: Location) -> Result<FileAttr> {
        match location {
            Location::NonExistent => Err(UnionError::NotFound(vpath.to_string())),
            Location::ReadWrite | Location::ReadWriteCopiedUp => {
                let meta = fs::symlink_metadata(self.ctx.rw_path(vpath)?)?;
                Ok(metadata_to_fileattr(&meta, meta.ino()))
            }
            Location::ReadOnly => {
                let meta = fs::symlink_metadata(self.ctx.ro_path(vpath)?)?;
                let mut attr = metadata_to_fileattr(&meta, meta.ino());
                if let Some(overlay) = self.get(vpath)? {
                    overlay.apply_to(&mut attr);
                }
                Ok(attr)
            }
        }
    }

    fn write_record(&self, vpath: &VirtualPath, changes: &SetAttr) -> Result<()> {
        let record = self.record_path(vpath)?;

        let (base, existed) = match lstat_opt(&record)? {
            Some(meta) => (OverlayAttrs::from_metadata(&meta), true),
            None => {
                let ro = self.ctx.ro_path(vpath)?;
                let meta = fs::symlink_metadata(&ro)?;
                (OverlayAttrs::from_metadata(&meta), false)
            }
        };
        let target = base.with_changes(changes);

        let mut created = CreatedAncestry::default();
        if !existed {
            created = CopyUpEngine::new(self.ctx).ensure_ancestry(vpath)?;
            if let Err(e) = OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(RECORD_CREATE_MODE)
                .custom_flags(libc::O_NOFOLLOW)
                .open(&record)
            {
                rollback_created(&created, None);
                return Err(UnionError::Io(e));
            }
            tracing::debug!("Created metadata record for {}", vpath);
        }

        if let Err(e) = Self::stamp_record(&record, &target, changes) {
            if !existed {
                rollback_created(&created, Some(&record));
            }
            return Err(e);
        }
        Ok(())
    }

    fn stamp_record(record: &Path, target: &OverlayAttrs, changes: &SetAttr) -> Result<()> {
        // Ownership first: chown clears setuid/setgid bits.
        if changes.uid.is_some() || changes.gid.is_some() {
            std::os::unix::fs::lchown(record, Some(target.uid), Some(target.gid))?;
        } else {
            preserve_owner(record, target.uid, target.gid)?;
        }
        fs::set_permissions(record, Permissions::from_mode(target.perm))?;
        set_times_nofollow(record, Some(target.atime), Some(target.mtime))?;
        Ok(())
    }

    fn apply_to_rw(&self, vpath: &VirtualPath, changes: &SetAttr) -> Result<()> {
        let rw = self.ctx.rw_path(vpath)?;
        let meta = fs::symlink_metadata(&rw)?;

        if let Some(size) = changes.size {
            if meta.is_dir() {
                return Err(UnionError::IsDirectory(vpath.to_string()));
            }
            OpenOptions::new().write(true).open(&rw)?.set_len(size)?;
        }
        if changes.uid.is_some() || changes.gid.is_some() {
            std::os::unix::fs::lchown(&rw, changes.uid, changes.gid)?;
        }
        if let Some(mode) = changes.mode {
            if !meta.file_type().is_symlink() {
                fs::set_permissions(&rw, Permissions::from_mode(mode & 0o7777))?;
            }
        }
        if changes.atime.is_some() || changes.mtime.is_some() {
            set_times_nofollow(&rw, changes.atime, changes.mtime)?;
        }
        tracing::trace!("Applied {:?} to {}", changes, rw.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overlay::testing::TestBranches;
    use std::time::{Duration, UNIX_EPOCH};

    #[test]
    fn test_set_on_read_only_writes_only_a_record() {
        let branches = TestBranches::new();
        let ro_file = branches.ro_file("doc.txt", b"content");
        fs::set_permissions(&ro_file, Permissions::from_mode(0o644)).unwrap();
        let ctx = branches.context();
        let overlay = MetadataOverlay::new(&ctx);
        let vpath = VirtualPath::new("/doc.txt").unwrap();

        overlay
            .set(&vpath, &SetAttr::default().mode(0o600))
            .unwrap();

        assert!(!branches.rw.path().join("doc.txt").exists());
        let record = branches.rw.path().join(".me.doc.txt");
        let meta = fs::symlink_metadata(&record).unwrap();
        assert_eq!(meta.len(), 0);
        assert_eq!(meta.mode() & 0o7777, 0o600);

        // RO untouched
        assert_eq!(
            fs::metadata(&ro_file).unwrap().mode() & 0o7777,
            0o644
        );
        assert_eq!(
            BranchResolver::new(&ctx).resolve(&vpath).unwrap(),
            Location::ReadOnly
        );

        let attr = overlay.effective_attr(&vpath, Location::ReadOnly).unwrap();
        assert_eq!(attr.perm, 0o600);
        assert_eq!(attr.size, 7);
    }

    #[test]
    fn test_record_keeps_earlier_changes() {
        let branches = TestBranches::new();
        branches.ro_file("doc.txt", b"content");
        let ctx = branches.context();
        let overlay = MetadataOverlay::new(&ctx);
        let vpath = VirtualPath::new("/doc.txt").unwrap();

        overlay
            .set(&vpath, &SetAttr::default().mode(0o640))
            .unwrap();
        let mtime = UNIX_EPOCH + Duration::from_secs(86_400);
        overlay
            .set(&vpath, &SetAttr::default().times(None, Some(mtime)))
            .unwrap();

        let attrs = overlay.get(&vpath).unwrap().unwrap();
        assert_eq!(attrs.perm, 0o640);
        assert_eq!(attrs.mtime, mtime);
    }

    #[test]
    fn test_set_on_read_write_applies_directly_and_drops_record() {
        let branches = TestBranches::new();
        branches.ro_file("f", b"ro");
        branches.rw_file("f", b"rw");
        let ctx = branches.context();
        let overlay = MetadataOverlay::new(&ctx);
        let vpath = VirtualPath::new("/f").unwrap();
        fs::write(branches.rw.path().join(".me.f"), b"").unwrap();

        overlay
            .set(&vpath, &SetAttr::default().mode(0o700))
            .unwrap();

        let meta = fs::metadata(branches.rw.path().join("f")).unwrap();
        assert_eq!(meta.mode() & 0o7777, 0o700);
        assert!(!branches.rw.path().join(".me.f").exists());
    }

    #[test]
    fn test_size_change_on_read_only_copies_up() {
        let branches = TestBranches::new();
        branches.ro_file("big", b"0123456789");
        let ctx = branches.context();
        let vpath = VirtualPath::new("/big").unwrap();

        MetadataOverlay::new(&ctx)
            .set(&vpath, &SetAttr::default().size(4))
            .unwrap();

        assert_eq!(fs::read(branches.rw.path().join("big")).unwrap(), b"0123");
        assert_eq!(fs::read(branches.ro.path().join("big")).unwrap(), b"0123456789");
        assert_eq!(
            BranchResolver::new(&ctx).resolve(&vpath).unwrap(),
            Location::ReadWriteCopiedUp
        );
    }

    #[test]
    fn test_set_on_missing_path() {
        let branches = TestBranches::new();
        let ctx = branches.context();
        let result = MetadataOverlay::new(&ctx).set(
            &VirtualPath::new("/nope").unwrap(),
            &SetAttr::default().mode(0o600),
        );
        assert!(matches!(result, Err(UnionError::NotFound(_))));
    }

    #[test]
    fn test_remove_is_idempotent() {
        let branches = TestBranches::new();
        let ctx = branches.context();
        let overlay = MetadataOverlay::new(&ctx);
        let vpath = VirtualPath::new("/x").unwrap();
        overlay.remove(&vpath).unwrap();
        assert!(overlay.get(&vpath).unwrap().is_none());
    }
}
