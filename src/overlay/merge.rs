//! Merged directory listings and the permission checks layered on top of
//! the resolver.

use fuser::{FileAttr, FileType};
use std::collections::{BTreeMap, HashSet};
use std::ffi::OsString;
use std::fs;
use std::path::Path;

use crate::error::{Result, UnionError};
use crate::overlay::context::MountContext;
use crate::overlay::convert::{lstat_opt, std_filetype_to_fuser};
use crate::overlay::metadata::MetadataOverlay;
use crate::overlay::path::{is_reserved_name, VirtualPath};
use crate::overlay::resolver::BranchResolver;
use crate::overlay::types::{BranchRole, Credentials, Location, MergedEntry, SetAttr};
use crate::overlay::whiteout::Whiteout;

pub const ACCESS_READ: u32 = libc::R_OK as u32;
pub const ACCESS_WRITE: u32 = libc::W_OK as u32;
pub const ACCESS_EXEC: u32 = libc::X_OK as u32;

const STICKY_BIT: u16 = 0o1000;

pub(crate) struct DirectoryMerge<'a> {
    ctx: &'a MountContext,
}

impl<'a> DirectoryMerge<'a> {
    pub fn new(ctx: &'a MountContext) -> Self {
        DirectoryMerge { ctx }
    }

    /// Lists `vpath` as seen through the union, sorted by name.
    pub fn list_merged(&self, vpath: &VirtualPath) -> Result<Vec<MergedEntry>> {
        let resolver = BranchResolver::new(self.ctx);
        let location = resolver.resolve(vpath)?;
        if !location.exists() {
            return Err(UnionError::NotFound(vpath.to_string()));
        }
        if !resolver.lstat(vpath, location)?.is_dir() {
            return Err(UnionError::NotDirectory(vpath.to_string()));
        }

        let mut entries: BTreeMap<OsString, MergedEntry> = BTreeMap::new();
        let mut whiteouts: HashSet<OsString> = HashSet::new();

        if location.is_on_rw() {
            Self::scan_layer(&self.ctx.rw_path(vpath)?, |name, kind| {
                if let Some(target) = Whiteout::extract_target(&name) {
                    whiteouts.insert(target);
                } else if !is_reserved_name(&name) {
                    entries.insert(
                        name.clone(),
                        MergedEntry {
                            name,
                            kind,
                            origin: BranchRole::ReadWrite,
                        },
                    );
                }
            })?;
        }

        if location.has_ro_origin() {
            let ro_dir = self.ctx.ro_path(vpath)?;
            if lstat_opt(&ro_dir)?.is_some_and(|m| m.is_dir()) {
                Self::scan_layer(&ro_dir, |name, kind| {
                    if is_reserved_name(&name)
                        || whiteouts.contains(&name)
                        || entries.contains_key(&name)
                    {
                        return;
                    }
                    entries.insert(
                        name.clone(),
                        MergedEntry {
                            name,
                            kind,
                            origin: BranchRole::ReadOnly,
                        },
                    );
                })?;
            }
        }

        tracing::trace!("Merged {} entries for {}", entries.len(), vpath);
        Ok(entries.into_values().collect())
    }

    pub fn is_empty_under_overlay(&self, vpath: &VirtualPath) -> Result<bool> {
        Ok(self.list_merged(vpath)?.is_empty())
    }

    fn scan_layer<F>(dir: &Path, mut visit: F) -> Result<()>
    where
        F: FnMut(OsString, FileType),
    {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let kind = std_filetype_to_fuser(entry.file_type()?);
            visit(entry.file_name(), kind);
        }
        Ok(())
    }
}

/// POSIX owner/group/other check of `mask` against `attr`.
pub fn check_permission(attr: &FileAttr, creds: &Credentials, mask: u32) -> bool {
    if creds.is_root() {
        if mask & ACCESS_EXEC == 0 {
            return true;
        }
        return attr.kind == FileType::Directory || attr.perm & 0o111 != 0;
    }

    let shift = if creds.uid == attr.uid {
        6
    } else if creds.in_group(attr.gid) {
        3
    } else {
        0
    };
    let granted = u32::from((attr.perm >> shift) & 0o7);

    granted & mask == mask
}

pub(crate) struct AccessOverlay<'a> {
    ctx: &'a MountContext,
}

impl<'a> AccessOverlay<'a> {
    pub fn new(ctx: &'a MountContext) -> Self {
        AccessOverlay { ctx }
    }

    pub fn effective_attr(&self, vpath: &VirtualPath) -> Result<(Location, FileAttr)> {
        let location = BranchResolver::new(self.ctx).resolve(vpath)?;
        let attr = MetadataOverlay::new(self.ctx).effective_attr(vpath, location)?;
        Ok((location, attr))
    }

    pub fn can_access(&self, vpath: &VirtualPath, creds: &Credentials, mask: u32) -> Result<()> {
        let (_, attr) = self.effective_attr(vpath)?;
        if check_permission(&attr, creds, mask) {
            Ok(())
        } else {
            Err(UnionError::PermissionDenied(vpath.to_string()))
        }
    }

    /// Write and search permission on the directory that will hold `vpath`.
    pub fn can_create(&self, vpath: &VirtualPath, creds: &Credentials) -> Result<()> {
        self.parent_writable(vpath, creds).map(|_| ())
    }

    /// As `can_create`, plus the sticky-directory ownership rule.
    pub fn can_remove(&self, vpath: &VirtualPath, creds: &Credentials) -> Result<()> {
        let parent = self.parent_writable(vpath, creds)?;
        if parent.perm & STICKY_BIT == 0 || creds.is_root() || creds.uid == parent.uid {
            return Ok(());
        }
        let (_, target) = self.effective_attr(vpath)?;
        if creds.uid == target.uid {
            Ok(())
        } else {
            Err(UnionError::PermissionDenied(format!(
                "{}: sticky directory",
                vpath
            )))
        }
    }

    /// Ownership rules of chmod, chown and utimes.
    pub fn can_set_attributes(
        &self,
        vpath: &VirtualPath,
        creds: &Credentials,
        changes: &SetAttr,
    ) -> Result<()> {
        if creds.is_root() {
            return Ok(());
        }
        let (_, attr) = self.effective_attr(vpath)?;
        let is_owner = creds.uid == attr.uid;
        let denied = || Err(UnionError::PermissionDenied(vpath.to_string()));

        if changes.uid.is_some_and(|uid| uid != attr.uid) {
            return denied();
        }
        if let Some(gid) = changes.gid {
            if gid != attr.gid && !(is_owner && creds.in_group(gid)) {
                return denied();
            }
        }
        if changes.mode.is_some() && !is_owner {
            return denied();
        }
        if (changes.atime.is_some() || changes.mtime.is_some())
            && !is_owner
            && !check_permission(&attr, creds, ACCESS_WRITE)
        {
            return denied();
        }
        if changes.size.is_some() && !check_permission(&attr, creds, ACCESS_WRITE) {
            return denied();
        }
        Ok(())
    }

    fn parent_writable(&self, vpath: &VirtualPath, creds: &Credentials) -> Result<FileAttr> {
        let parent = vpath
            .parent()
            .ok_or_else(|| UnionError::PermissionDenied("the root has no parent".to_string()))?;
        let (_, attr) = self.effective_attr(&parent)?;
        if attr.kind != FileType::Directory {
            return Err(UnionError::NotDirectory(parent.to_string()));
        }
        if !check_permission(&attr, creds, ACCESS_WRITE | ACCESS_EXEC) {
            return Err(UnionError::PermissionDenied(parent.to_string()));
        }
        Ok(attr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overlay::testing::TestBranches;
    use crate::overlay::whiteout::WhiteoutManager;
    use std::fs::Permissions;
    use std::os::unix::fs::PermissionsExt;
    use std::time::SystemTime;

    fn vp(p: &str) -> VirtualPath {
        VirtualPath::new(p).unwrap()
    }

    fn names(entries: &[MergedEntry]) -> Vec<String> {
        entries
            .iter()
            .map(|e| e.name.to_string_lossy().into_owned())
            .collect()
    }

    fn attr(kind: FileType, perm: u16, uid: u32, gid: u32) -> FileAttr {
        FileAttr {
            ino: 1,
            size: 0,
            blocks: 0,
            atime: SystemTime::UNIX_EPOCH,
            mtime: SystemTime::UNIX_EPOCH,
            ctime: SystemTime::UNIX_EPOCH,
            crtime: SystemTime::UNIX_EPOCH,
            kind,
            perm,
            nlink: 1,
            uid,
            gid,
            rdev: 0,
            blksize: 4096,
            flags: 0,
        }
    }

    #[test]
    fn test_list_merged_union_with_rw_winning() {
        let branches = TestBranches::new();
        branches.ro_file("a", b"");
        branches.ro_file("shared", b"ro");
        branches.ro_dir("ro_dir");
        branches.rw_file("b", b"");
        branches.rw_dir("shared");
        let ctx = branches.context();

        let entries = DirectoryMerge::new(&ctx).list_merged(&VirtualPath::root()).unwrap();

        assert_eq!(names(&entries), vec!["a", "b", "ro_dir", "shared"]);
        let shared = entries.iter().find(|e| e.name == "shared").unwrap();
        assert_eq!(shared.origin, BranchRole::ReadWrite);
        assert_eq!(shared.kind, FileType::Directory);
    }

    #[test]
    fn test_list_merged_hides_whiteouts_and_reserved_names() {
        let branches = TestBranches::new();
        branches.ro_file("keep", b"");
        branches.ro_file("drop", b"");
        branches.rw_file(".me.keep", b"");
        let ctx = branches.context();
        WhiteoutManager::new(&ctx).create(&vp("/drop")).unwrap();

        let entries = DirectoryMerge::new(&ctx).list_merged(&VirtualPath::root()).unwrap();

        assert_eq!(names(&entries), vec!["keep"]);
    }

    #[test]
    fn test_list_merged_ignores_ro_non_directory_counterpart() {
        let branches = TestBranches::new();
        branches.ro_file("thing", b"file on RO");
        branches.rw_file("thing/inside", b"");
        let ctx = branches.context();

        let entries = DirectoryMerge::new(&ctx).list_merged(&vp("/thing")).unwrap();
        assert_eq!(names(&entries), vec!["inside"]);
    }

    #[test]
    fn test_list_merged_errors() {
        let branches = TestBranches::new();
        branches.ro_file("file", b"");
        let ctx = branches.context();
        let merge = DirectoryMerge::new(&ctx);

        assert!(matches!(
            merge.list_merged(&vp("/missing")),
            Err(UnionError::NotFound(_))
        ));
        assert!(matches!(
            merge.list_merged(&vp("/file")),
            Err(UnionError::NotDirectory(_))
        ));
    }

    #[test]
    fn test_is_empty_under_overlay() {
        let branches = TestBranches::new();
        branches.ro_file("dir/only", b"");
        let ctx = branches.context();
        let merge = DirectoryMerge::new(&ctx);

        assert!(!merge.is_empty_under_overlay(&vp("/dir")).unwrap());
        WhiteoutManager::new(&ctx).create(&vp("/dir/only")).unwrap();
        assert!(merge.is_empty_under_overlay(&vp("/dir")).unwrap());
    }

    #[test]
    fn test_check_permission_classes() {
        let file = attr(FileType::RegularFile, 0o640, 1000, 100);
        assert!(check_permission(&file, &Credentials::new(1000, 1), ACCESS_READ | ACCESS_WRITE));
        assert!(check_permission(&file, &Credentials::new(2000, 100), ACCESS_READ));
        assert!(!check_permission(&file, &Credentials::new(2000, 100), ACCESS_WRITE));
        assert!(!check_permission(&file, &Credentials::new(3000, 300), ACCESS_READ));
        // The owner class applies even when it grants less than "other"
        let odd = attr(FileType::RegularFile, 0o047, 1000, 100);
        assert!(!check_permission(&odd, &Credentials::new(1000, 1), ACCESS_READ));
    }

    #[test]
    fn test_check_permission_root() {
        let plain = attr(FileType::RegularFile, 0o600, 1000, 100);
        let root = Credentials::root();
        assert!(check_permission(&plain, &root, ACCESS_READ | ACCESS_WRITE));
        assert!(!check_permission(&plain, &root, ACCESS_EXEC));
        let script = attr(FileType::RegularFile, 0o700, 1000, 100);
        assert!(check_permission(&script, &root, ACCESS_EXEC));
        let dir = attr(FileType::Directory, 0o000, 1000, 100);
        assert!(check_permission(&dir, &root, ACCESS_EXEC));
    }

    #[test]
    fn test_can_create_uses_effective_parent_mode() {
        let branches = TestBranches::new();
        branches.ro_dir("locked");
        let ctx = branches.context();
        let me = Credentials::current();
        if me.is_root() {
            return;
        }
        let access = AccessOverlay::new(&ctx);
        access.can_create(&vp("/locked/new"), &me).unwrap();

        MetadataOverlay::new(&ctx)
            .set(&vp("/locked"), &SetAttr::default().mode(0o555))
            .unwrap();

        assert!(matches!(
            access.can_create(&vp("/locked/new"), &me),
            Err(UnionError::PermissionDenied(_))
        ));
    }

    #[test]
    fn test_can_remove_sticky_rule() {
        let branches = TestBranches::new();
        let tmp = branches.ro_dir("tmp");
        branches.ro_file("tmp/theirs", b"");
        fs::set_permissions(&tmp, Permissions::from_mode(0o1777)).unwrap();
        let ctx = branches.context();
        let access = AccessOverlay::new(&ctx);

        let owner = Credentials::current();
        access.can_remove(&vp("/tmp/theirs"), &owner).unwrap();

        let stranger = Credentials::new(owner.uid.wrapping_add(4242), owner.gid.wrapping_add(4242));
        if owner.is_root() || stranger.is_root() {
            return;
        }
        assert!(matches!(
            access.can_remove(&vp("/tmp/theirs"), &stranger),
            Err(UnionError::PermissionDenied(_))
        ));
    }

    #[test]
    fn test_can_set_attributes_ownership_rules() {
        let branches = TestBranches::new();
        branches.ro_file("f", b"");
        let ctx = branches.context();
        let access = AccessOverlay::new(&ctx);
        let owner = Credentials::current();
        if owner.is_root() {
            return;
        }
        let stranger = Credentials::new(owner.uid + 1, owner.gid + 1);

        access
            .can_set_attributes(&vp("/f"), &owner, &SetAttr::default().mode(0o600))
            .unwrap();
        assert!(access
            .can_set_attributes(&vp("/f"), &stranger, &SetAttr::default().mode(0o600))
            .is_err());
        assert!(access
            .can_set_attributes(
                &vp("/f"),
                &owner,
                &SetAttr::default().owner(Some(owner.uid + 1), None)
            )
            .is_err());
    }
}
