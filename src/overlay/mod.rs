mod context;
pub(crate) mod convert;
mod copy_up;
mod file_handle;
mod inode_manager;
mod locks;
mod merge;
mod metadata;
pub mod mount;
mod path;
mod resolver;
#[cfg(test)]
pub(crate) mod testing;
mod types;
mod union;
mod whiteout;

pub use context::{EngineOptions, MountContext, DEFAULT_DIR_MODE};
pub use merge::{check_permission, ACCESS_EXEC, ACCESS_READ, ACCESS_WRITE};
pub use metadata::{OverlayAttrs, METADATA_PREFIX};
pub use mount::{mount_fuse, unmount_fuse, MountSettings};
pub use path::{is_reserved_name, VirtualPath, MAX_NAME_LEN, MAX_PATH_LEN};
pub use types::{
    Branch, BranchRole, Branches, Credentials, Location, MarkerOwner, MergedEntry, SetAttr,
    StatFs,
};
pub use union::Union;
pub use whiteout::{Whiteout, WHITEOUT_PREFIX};

use convert::io_error_to_libc;
use file_handle::{FileHandle, READ_BUFFER};
use inode_manager::InodeManager;

use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr,
    Request, TimeOrNow, FUSE_ROOT_ID,
};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::ffi::OsStr;
use std::fs::{File, OpenOptions};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::error::{Result, UnionError};

/// Kernel-facing adapter over a [`Union`].
///
/// The engine speaks virtual paths; this type translates inode numbers and
/// file handles into them and maps engine errors onto errno values.
pub struct UnionFuse {
    union: Arc<Union>,
    inodes: InodeManager,
    file_handles: RwLock<HashMap<u64, FileHandle>>,
    next_fh: Mutex<u64>,
    /// Attribute and entry cache timeout handed to the kernel.
    ttl: Duration,
}

impl UnionFuse {
    pub fn new(union: Arc<Union>, ttl: Duration) -> Self {
        UnionFuse {
            union,
            inodes: InodeManager::new(),
            file_handles: RwLock::new(HashMap::new()),
            next_fh: Mutex::new(1),
            ttl,
        }
    }

    pub fn union(&self) -> &Union {
        &self.union
    }

    fn path_of(&self, ino: u64) -> Result<VirtualPath> {
        self.inodes
            .path(ino)
            .ok_or_else(|| UnionError::NotFound(format!("inode {}", ino)))
    }

    fn child_of(&self, parent: u64, name: &OsStr) -> Result<(VirtualPath, VirtualPath)> {
        let parent_path = self.path_of(parent)?;
        let child = parent_path.join(name)?;
        Ok((parent_path, child))
    }

    /// Registers a kernel lookup of `vpath` and stamps its inode number.
    fn entry_attr(&self, vpath: &VirtualPath, mut attr: FileAttr) -> FileAttr {
        attr.ino = self.inodes.remember(vpath);
        attr
    }

    /// Inode number reported in listings. Paths the kernel never looked up
    /// get a hashed number with the top bit set so they stay clear of
    /// allocated ones.
    fn listing_ino(&self, vpath: &VirtualPath) -> u64 {
        self.inodes
            .peek(vpath)
            .unwrap_or_else(|| fxhash::hash64(vpath) | (1 << 63))
    }

    fn alloc_fh(&self) -> u64 {
        let mut next = self.next_fh.lock();
        let fh = *next;
        *next = next.wrapping_add(1);
        fh
    }

    fn insert_handle(&self, file: File, writable: bool) -> u64 {
        let fh = self.alloc_fh();
        self.file_handles
            .write()
            .insert(fh, FileHandle::new(file, writable));
        fh
    }

    /// Clones the handle's file out of the table so I/O runs without
    /// holding the table lock.
    fn handle_file(&self, fh: u64) -> Option<(Arc<Mutex<File>>, bool)> {
        self.file_handles
            .read()
            .get(&fh)
            .map(|h| (Arc::clone(&h.file), h.writable))
    }
}

fn errno(op: &str, e: &UnionError) -> i32 {
    match e {
        UnionError::NotFound(_) => tracing::trace!("{}: {}", op, e),
        UnionError::Io(_) | UnionError::Inconsistent(_) => tracing::warn!("{} failed: {}", op, e),
        _ => tracing::debug!("{} failed: {}", op, e),
    }
    e.errno()
}

/// Caller identity of a request, with supplementary groups where the
/// platform exposes them.
fn request_credentials(req: &Request) -> Credentials {
    Credentials::new(req.uid(), req.gid()).with_groups(supplementary_groups(req.pid()))
}

#[cfg(target_os = "linux")]
fn supplementary_groups(pid: u32) -> Vec<u32> {
    let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", pid)) else {
        return Vec::new();
    };
    status
        .lines()
        .find_map(|line| line.strip_prefix("Groups:"))
        .map(|groups| {
            groups
                .split_whitespace()
                .filter_map(|g| g.parse().ok())
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(not(target_os = "linux"))]
fn supplementary_groups(_pid: u32) -> Vec<u32> {
    Vec::new()
}

fn time_or_now(t: TimeOrNow) -> SystemTime {
    match t {
        TimeOrNow::SpecificTime(time) => time,
        TimeOrNow::Now => SystemTime::now(),
    }
}

/// Opens the concrete file behind a kernel `open(2)`.
fn open_concrete(path: &Path, flags: i32) -> std::io::Result<(File, bool)> {
    let access = flags & libc::O_ACCMODE;
    let writable = access != libc::O_RDONLY;
    let truncate = flags & libc::O_TRUNC != 0;

    if truncate && !writable {
        OpenOptions::new().write(true).truncate(true).open(path)?;
    }

    let file = OpenOptions::new()
        .read(access != libc::O_WRONLY)
        .write(writable)
        .append(writable && flags & libc::O_APPEND != 0)
        .truncate(writable && truncate)
        .open(path)?;
    Ok((file, writable))
}

fn xattr_reply(data: &[u8], size: u32, reply: ReplyXattr) {
    if size == 0 {
        reply.size(data.len() as u32);
    } else if size >= data.len() as u32 {
        reply.data(data);
    } else {
        reply.error(libc::ERANGE);
    }
}

impl Filesystem for UnionFuse {
    fn init(
        &mut self,
        _req: &Request,
        _config: &mut KernelConfig,
    ) -> std::result::Result<(), libc::c_int> {
        let branches = self.union.branches();
        tracing::info!(
            "twinfs initialized (RO {}, RW {})",
            branches.read_only.root().display(),
            branches.read_write.root().display()
        );
        Ok(())
    }

    fn destroy(&mut self) {
        let open = self.file_handles.read().len();
        if open > 0 {
            tracing::debug!("Dropping {} open file handle(s)", open);
        }
        tracing::info!("twinfs destroyed");
    }

    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        tracing::trace!("lookup(parent={}, name={:?})", parent, name);
        let result = self
            .path_of(parent)
            .and_then(|parent_path| self.union.lookup(&parent_path, name));
        match result {
            Ok((vpath, attr)) => reply.entry(&self.ttl, &self.entry_attr(&vpath, attr), 0),
            Err(e) => reply.error(errno("lookup", &e)),
        }
    }

    fn forget(&mut self, _req: &Request, ino: u64, nlookup: u64) {
        self.inodes.forget(ino, nlookup);
    }

    fn getattr(&mut self, _req: &Request, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let result = self
            .path_of(ino)
            .and_then(|vpath| self.union.getattr(&vpath));
        match result {
            Ok(mut attr) => {
                attr.ino = ino;
                reply.attr(&self.ttl, &attr);
            }
            Err(e) => reply.error(errno("getattr", &e)),
        }
    }

    fn setattr(
        &mut self,
        req: &Request,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        tracing::debug!(
            "setattr(ino={}, mode={:?}, uid={:?}, gid={:?}, size={:?})",
            ino,
            mode,
            uid,
            gid,
            size
        );
        let changes = SetAttr {
            mode: mode.map(|m| m & 0o7777),
            uid,
            gid,
            size,
            atime: atime.map(time_or_now),
            mtime: mtime.map(time_or_now),
        };
        let creds = request_credentials(req);
        let result = self
            .path_of(ino)
            .and_then(|vpath| self.union.setattr(&vpath, &changes, &creds));
        match result {
            Ok(mut attr) => {
                attr.ino = ino;
                reply.attr(&self.ttl, &attr);
            }
            Err(e) => reply.error(errno("setattr", &e)),
        }
    }

    fn readlink(&mut self, _req: &Request, ino: u64, reply: ReplyData) {
        let result = self
            .path_of(ino)
            .and_then(|vpath| self.union.readlink(&vpath));
        match result {
            Ok(target) => reply.data(target.as_os_str().as_bytes()),
            Err(e) => reply.error(errno("readlink", &e)),
        }
    }

    fn mknod(
        &mut self,
        req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        let creds = request_credentials(req);
        let mode = mode & !umask;
        let result = self.path_of(parent).and_then(|parent_path| {
            let vpath = self
                .union
                .mknod(&parent_path, name, mode, u64::from(rdev), &creds)?;
            let attr = self.union.getattr(&vpath)?;
            Ok((vpath, attr))
        });
        match result {
            Ok((vpath, attr)) => reply.entry(&self.ttl, &self.entry_attr(&vpath, attr), 0),
            Err(e) => reply.error(errno("mknod", &e)),
        }
    }

    fn mkdir(
        &mut self,
        req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        tracing::debug!("mkdir(parent={}, name={:?})", parent, name);
        let creds = request_credentials(req);
        let result = self.path_of(parent).and_then(|parent_path| {
            let vpath = self.union.mkdir(&parent_path, name, mode & !umask, &creds)?;
            let attr = self.union.getattr(&vpath)?;
            Ok((vpath, attr))
        });
        match result {
            Ok((vpath, attr)) => reply.entry(&self.ttl, &self.entry_attr(&vpath, attr), 0),
            Err(e) => reply.error(errno("mkdir", &e)),
        }
    }

    fn unlink(&mut self, req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        tracing::debug!("unlink(parent={}, name={:?})", parent, name);
        let creds = request_credentials(req);
        let result = self.child_of(parent, name).and_then(|(_, vpath)| {
            self.union.unlink(&vpath, &creds)?;
            Ok(vpath)
        });
        match result {
            Ok(vpath) => {
                self.inodes.detach(&vpath);
                reply.ok();
            }
            Err(e) => reply.error(errno("unlink", &e)),
        }
    }

    fn rmdir(&mut self, req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        tracing::debug!("rmdir(parent={}, name={:?})", parent, name);
        let creds = request_credentials(req);
        let result = self.child_of(parent, name).and_then(|(_, vpath)| {
            self.union.rmdir(&vpath, &creds)?;
            Ok(vpath)
        });
        match result {
            Ok(vpath) => {
                self.inodes.detach(&vpath);
                reply.ok();
            }
            Err(e) => reply.error(errno("rmdir", &e)),
        }
    }

    fn symlink(
        &mut self,
        req: &Request,
        parent: u64,
        name: &OsStr,
        link: &Path,
        reply: ReplyEntry,
    ) {
        let creds = request_credentials(req);
        let result = self.path_of(parent).and_then(|parent_path| {
            let vpath = self.union.symlink(&parent_path, name, link, &creds)?;
            let attr = self.union.getattr(&vpath)?;
            Ok((vpath, attr))
        });
        match result {
            Ok((vpath, attr)) => reply.entry(&self.ttl, &self.entry_attr(&vpath, attr), 0),
            Err(e) => reply.error(errno("symlink", &e)),
        }
    }

    fn rename(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        tracing::debug!(
            "rename(parent={}, name={:?}, newparent={}, newname={:?}) is not supported",
            parent,
            name,
            newparent,
            newname
        );
        reply.error(libc::ENOSYS);
    }

    fn link(
        &mut self,
        req: &Request,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        tracing::debug!(
            "link(ino={}, newparent={}, newname={:?})",
            ino,
            newparent,
            newname
        );
        let creds = request_credentials(req);
        let result = self.path_of(ino).and_then(|source| {
            let parent_path = self.path_of(newparent)?;
            let vpath = self.union.link(&source, &parent_path, newname, &creds)?;
            let attr = self.union.getattr(&vpath)?;
            Ok((vpath, attr))
        });
        match result {
            Ok((vpath, attr)) => reply.entry(&self.ttl, &self.entry_attr(&vpath, attr), 0),
            Err(e) => reply.error(errno("link", &e)),
        }
    }

    fn open(&mut self, req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        tracing::debug!("open(ino={}, flags={:#o})", ino, flags);
        let creds = request_credentials(req);
        let result = self.path_of(ino).and_then(|vpath| {
            let concrete = self.union.open(&vpath, &creds, flags)?;
            Ok(open_concrete(&concrete, flags)?)
        });
        match result {
            Ok((file, writable)) => {
                let fh = self.insert_handle(file, writable);
                reply.opened(fh, 0);
            }
            Err(e) => reply.error(errno("open", &e)),
        }
    }

    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        tracing::trace!(
            "read(ino={}, fh={}, offset={}, size={})",
            ino,
            fh,
            offset,
            size
        );
        let Some((file_arc, _)) = self.handle_file(fh) else {
            tracing::warn!("read: file handle {} not found", fh);
            reply.error(libc::EBADF);
            return;
        };
        let mut file = file_arc.lock();

        READ_BUFFER.with(|buffer| {
            let mut buf = buffer.borrow_mut();
            buf.resize(size as usize, 0u8);

            if let Err(e) =
                std::io::Seek::seek(&mut *file, std::io::SeekFrom::Start(offset as u64))
            {
                tracing::error!("read: seek failed - {}", e);
                reply.error(io_error_to_libc(&e));
                return;
            }

            // Fill the buffer unless EOF comes first; the kernel treats a
            // short read as end of file.
            let mut filled = 0;
            while filled < buf.len() {
                match std::io::Read::read(&mut *file, &mut buf[filled..]) {
                    Ok(0) => break,
                    Ok(n) => filled += n,
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        tracing::error!("read: read failed - {}", e);
                        reply.error(io_error_to_libc(&e));
                        return;
                    }
                }
            }
            reply.data(&buf[..filled]);
        });
    }

    fn write(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        tracing::trace!(
            "write(ino={}, fh={}, offset={}, len={})",
            ino,
            fh,
            offset,
            data.len()
        );
        let Some((file_arc, writable)) = self.handle_file(fh) else {
            reply.error(libc::EBADF);
            return;
        };
        if !writable {
            tracing::debug!("write: handle {} was opened read-only", fh);
            reply.error(libc::EBADF);
            return;
        }

        let mut file = file_arc.lock();
        if let Err(e) = std::io::Seek::seek(&mut *file, std::io::SeekFrom::Start(offset as u64)) {
            tracing::error!("write: seek failed - {}", e);
            reply.error(io_error_to_libc(&e));
            return;
        }
        match std::io::Write::write_all(&mut *file, data) {
            Ok(()) => reply.written(data.len() as u32),
            Err(e) => {
                tracing::error!("write: write failed - {}", e);
                reply.error(io_error_to_libc(&e));
            }
        }
    }

    fn flush(&mut self, _req: &Request, _ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        let Some((file_arc, writable)) = self.handle_file(fh) else {
            reply.error(libc::EBADF);
            return;
        };
        if writable {
            if let Err(e) = std::io::Write::flush(&mut *file_arc.lock()) {
                reply.error(io_error_to_libc(&e));
                return;
            }
        }
        reply.ok();
    }

    fn release(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        self.file_handles.write().remove(&fh);
        reply.ok();
    }

    fn fsync(&mut self, _req: &Request, _ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        let Some((file_arc, _)) = self.handle_file(fh) else {
            reply.error(libc::EBADF);
            return;
        };
        let file = file_arc.lock();
        let synced = if datasync {
            file.sync_data()
        } else {
            file.sync_all()
        };
        match synced {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(io_error_to_libc(&e)),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        tracing::debug!("readdir(ino={}, offset={})", ino, offset);
        let vpath = match self.path_of(ino) {
            Ok(vpath) => vpath,
            Err(e) => {
                reply.error(errno("readdir", &e));
                return;
            }
        };
        let merged = match self.union.readdir(&vpath) {
            Ok(merged) => merged,
            Err(e) => {
                reply.error(errno("readdir", &e));
                return;
            }
        };

        let parent_ino = vpath
            .parent()
            .map(|parent| self.listing_ino(&parent))
            .unwrap_or(FUSE_ROOT_ID);
        let mut entries = vec![
            (ino, FileType::Directory, OsStr::new(".").to_os_string()),
            (parent_ino, FileType::Directory, OsStr::new("..").to_os_string()),
        ];
        for entry in merged {
            let child_ino = match vpath.join(&entry.name) {
                Ok(child) => self.listing_ino(&child),
                Err(e) => {
                    tracing::debug!("readdir: skipping {:?}: {}", entry.name, e);
                    continue;
                }
            };
            entries.push((child_ino, entry.kind, entry.name));
        }

        for (i, (entry_ino, kind, name)) in entries.into_iter().enumerate().skip(offset as usize)
        {
            if reply.add(entry_ino, (i + 1) as i64, kind, &name) {
                break;
            }
        }
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request, _ino: u64, reply: ReplyStatfs) {
        match self.union.statfs() {
            Ok(s) => reply.statfs(
                s.blocks,
                s.blocks_free,
                s.blocks_available,
                s.files,
                s.files_free,
                s.block_size,
                s.name_max,
                s.fragment_size,
            ),
            Err(e) => reply.error(errno("statfs", &e)),
        }
    }

    fn setxattr(
        &mut self,
        req: &Request,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        _flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        let creds = request_credentials(req);
        let result = self.path_of(ino).and_then(|vpath| {
            self.union.access(&vpath, &creds, ACCESS_WRITE)?;
            let target = self.union.xattr_target(&vpath, true)?;
            Ok(xattr::set(&target, name, value)?)
        });
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("setxattr", &e)),
        }
    }

    fn getxattr(&mut self, _req: &Request, ino: u64, name: &OsStr, size: u32, reply: ReplyXattr) {
        let result = self.path_of(ino).and_then(|vpath| {
            let target = self.union.xattr_target(&vpath, false)?;
            Ok(xattr::get(&target, name)?)
        });
        match result {
            Ok(Some(value)) => xattr_reply(&value, size, reply),
            Ok(None) => {
                #[cfg(target_os = "macos")]
                reply.error(libc::ENOATTR);
                #[cfg(not(target_os = "macos"))]
                reply.error(libc::ENODATA);
            }
            Err(e) => reply.error(errno("getxattr", &e)),
        }
    }

    fn listxattr(&mut self, _req: &Request, ino: u64, size: u32, reply: ReplyXattr) {
        let result = self.path_of(ino).and_then(|vpath| {
            let target = self.union.xattr_target(&vpath, false)?;
            Ok(xattr::list(&target)?)
        });
        match result {
            Ok(names) => {
                let mut data = Vec::new();
                for name in names {
                    data.extend_from_slice(name.as_bytes());
                    data.push(0);
                }
                xattr_reply(&data, size, reply);
            }
            Err(e) => reply.error(errno("listxattr", &e)),
        }
    }

    fn removexattr(&mut self, req: &Request, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        let creds = request_credentials(req);
        let result = self.path_of(ino).and_then(|vpath| {
            self.union.access(&vpath, &creds, ACCESS_WRITE)?;
            let target = self.union.xattr_target(&vpath, true)?;
            Ok(xattr::remove(&target, name)?)
        });
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("removexattr", &e)),
        }
    }

    fn access(&mut self, req: &Request, ino: u64, mask: i32, reply: ReplyEmpty) {
        let creds = request_credentials(req);
        let result = self
            .path_of(ino)
            .and_then(|vpath| self.union.access(&vpath, &creds, mask as u32));
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("access", &e)),
        }
    }

    fn create(
        &mut self,
        req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        tracing::debug!("create(parent={}, name={:?})", parent, name);
        let creds = request_credentials(req);
        let result = self.path_of(parent).and_then(|parent_path| {
            let (vpath, file) = self
                .union
                .create(&parent_path, name, mode & !umask, &creds)?;
            let attr = self.union.getattr(&vpath)?;
            Ok((vpath, file, attr))
        });
        match result {
            Ok((vpath, file, attr)) => {
                let attr = self.entry_attr(&vpath, attr);
                let writable = flags & libc::O_ACCMODE != libc::O_RDONLY;
                let fh = self.insert_handle(file, writable);
                reply.created(&self.ttl, &attr, 0, fh, flags as u32);
            }
            Err(e) => reply.error(errno("create", &e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overlay::testing::TestBranches;
    use std::io::Write;

    #[test]
    fn test_open_concrete_modes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file");
        std::fs::write(&path, b"content").unwrap();

        let (_, writable) = open_concrete(&path, libc::O_RDONLY).unwrap();
        assert!(!writable);

        let (mut file, writable) = open_concrete(&path, libc::O_WRONLY | libc::O_TRUNC).unwrap();
        assert!(writable);
        file.write_all(b"new").unwrap();
        drop(file);
        assert_eq!(std::fs::read(&path).unwrap(), b"new");
    }

    #[test]
    fn test_open_concrete_rdonly_trunc_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file");
        std::fs::write(&path, b"content").unwrap();

        open_concrete(&path, libc::O_RDONLY | libc::O_TRUNC).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
    }

    #[test]
    fn test_handles_and_inodes() {
        let branches = TestBranches::new();
        branches.ro_file("file", b"data");
        let fs = UnionFuse::new(Arc::new(branches.union()), Duration::from_secs(1));

        let root = fs.path_of(FUSE_ROOT_ID).unwrap();
        assert!(root.is_root());
        assert!(matches!(fs.path_of(99), Err(UnionError::NotFound(_))));

        let (vpath, attr) = fs.union().lookup(&root, OsStr::new("file")).unwrap();
        let attr = fs.entry_attr(&vpath, attr);
        assert_ne!(attr.ino, FUSE_ROOT_ID);
        assert_eq!(fs.listing_ino(&vpath), attr.ino);

        let unseen = VirtualPath::new("/unseen").unwrap();
        assert_ne!(fs.listing_ino(&unseen) & (1 << 63), 0);

        let file = File::open(branches.ro.path().join("file")).unwrap();
        let fh = fs.insert_handle(file, false);
        let (_, writable) = fs.handle_file(fh).unwrap();
        assert!(!writable);
        assert!(fs.handle_file(fh + 1).is_none());
    }

    #[test]
    fn test_time_or_now() {
        let at = SystemTime::UNIX_EPOCH + Duration::from_secs(42);
        assert_eq!(time_or_now(TimeOrNow::SpecificTime(at)), at);
        assert!(time_or_now(TimeOrNow::Now) > at);
    }
}
