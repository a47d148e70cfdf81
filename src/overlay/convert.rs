use fuser::{FileAttr, FileType};
use libc::S_IFMT;
use std::ffi::CString;
use std::fs::Metadata;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::prelude::MetadataExt;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Map std::io::Error to appropriate libc error code.
pub(crate) fn io_error_to_libc(e: &io::Error) -> i32 {
    if let Some(code) = e.raw_os_error() {
        return code;
    }

    match e.kind() {
        io::ErrorKind::NotFound => libc::ENOENT,
        io::ErrorKind::PermissionDenied => libc::EACCES,
        io::ErrorKind::AlreadyExists => libc::EEXIST,
        io::ErrorKind::InvalidInput => libc::EINVAL,
        io::ErrorKind::InvalidData => libc::EINVAL,
        io::ErrorKind::TimedOut => libc::ETIMEDOUT,
        io::ErrorKind::Interrupted => libc::EINTR,
        io::ErrorKind::WriteZero => libc::ENOSPC,
        io::ErrorKind::OutOfMemory => libc::ENOMEM,
        io::ErrorKind::WouldBlock => libc::EAGAIN,
        io::ErrorKind::Unsupported => libc::ENOTSUP,
        _ => libc::EIO,
    }
}

/// True for errors meaning "nothing at this path", including a
/// non-directory somewhere in the prefix.
pub(crate) fn is_absent(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::NotFound || e.raw_os_error() == Some(libc::ENOTDIR)
}

/// `lstat` that reports absence as `None`.
pub(crate) fn lstat_opt(path: &Path) -> io::Result<Option<Metadata>> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) => Ok(Some(meta)),
        Err(e) if is_absent(&e) => Ok(None),
        Err(e) => Err(e),
    }
}

pub(crate) fn mode_to_filetype(mode: u32) -> FileType {
    match mode & (S_IFMT as u32) {
        x if x == libc::S_IFREG as u32 => FileType::RegularFile,
        x if x == libc::S_IFDIR as u32 => FileType::Directory,
        x if x == libc::S_IFLNK as u32 => FileType::Symlink,
        x if x == libc::S_IFBLK as u32 => FileType::BlockDevice,
        x if x == libc::S_IFCHR as u32 => FileType::CharDevice,
        x if x == libc::S_IFIFO as u32 => FileType::NamedPipe,
        x if x == libc::S_IFSOCK as u32 => FileType::Socket,
        _ => FileType::RegularFile,
    }
}

pub(crate) fn metadata_to_filetype(meta: &Metadata) -> FileType {
    mode_to_filetype(meta.mode())
}

/// Convert std::fs::FileType to fuser FileType without another stat.
pub(crate) fn std_filetype_to_fuser(ft: std::fs::FileType) -> FileType {
    if ft.is_file() {
        FileType::RegularFile
    } else if ft.is_dir() {
        FileType::Directory
    } else if ft.is_symlink() {
        FileType::Symlink
    } else if ft.is_fifo() {
        FileType::NamedPipe
    } else if ft.is_char_device() {
        FileType::CharDevice
    } else if ft.is_block_device() {
        FileType::BlockDevice
    } else if ft.is_socket() {
        FileType::Socket
    } else {
        FileType::RegularFile
    }
}

fn timestamp(secs: i64, nsecs: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::new(secs as u64, nsecs as u32)
    } else {
        UNIX_EPOCH - Duration::new(secs.unsigned_abs(), 0) + Duration::from_nanos(nsecs as u64)
    }
}

pub(crate) fn metadata_atime(meta: &Metadata) -> SystemTime {
    timestamp(meta.atime(), meta.atime_nsec())
}

pub(crate) fn metadata_mtime(meta: &Metadata) -> SystemTime {
    timestamp(meta.mtime(), meta.mtime_nsec())
}

pub(crate) fn metadata_ctime(meta: &Metadata) -> SystemTime {
    timestamp(meta.ctime(), meta.ctime_nsec())
}

pub(crate) fn metadata_to_fileattr(meta: &Metadata, ino: u64) -> FileAttr {
    let ctime = metadata_ctime(meta);
    FileAttr {
        ino,
        size: meta.len(),
        blocks: meta.blocks(),
        atime: metadata_atime(meta),
        mtime: metadata_mtime(meta),
        ctime,
        crtime: ctime,
        kind: metadata_to_filetype(meta),
        perm: (meta.mode() & 0o7777) as u16,
        nlink: meta.nlink() as u32,
        uid: meta.uid(),
        gid: meta.gid(),
        rdev: meta.rdev() as u32,
        blksize: meta.blksize() as u32,
        flags: 0,
    }
}

fn to_timespec(time: Option<SystemTime>) -> libc::timespec {
    let (secs, nsecs) = match time.map(|t| t.duration_since(UNIX_EPOCH)) {
        None => (0, libc::UTIME_OMIT as i64),
        Some(Ok(d)) => (d.as_secs() as i64, d.subsec_nanos() as i64),
        Some(Err(e)) => {
            let d = e.duration();
            if d.subsec_nanos() == 0 {
                (-(d.as_secs() as i64), 0)
            } else {
                (
                    -(d.as_secs() as i64) - 1,
                    1_000_000_000 - d.subsec_nanos() as i64,
                )
            }
        }
    };
    libc::timespec {
        tv_sec: secs as libc::time_t,
        tv_nsec: nsecs as _,
    }
}

/// Sets access and modification times without following a final symlink.
/// `None` leaves that timestamp untouched.
pub(crate) fn set_times_nofollow(
    path: &Path,
    atime: Option<SystemTime>,
    mtime: Option<SystemTime>,
) -> io::Result<()> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let times = [to_timespec(atime), to_timespec(mtime)];
    // SAFETY: c_path is a valid NUL-terminated string and times has two entries.
    let rc = unsafe {
        libc::utimensat(
            libc::AT_FDCWD,
            c_path.as_ptr(),
            times.as_ptr(),
            libc::AT_SYMLINK_NOFOLLOW,
        )
    };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_io_error_to_libc_prefers_raw_code() {
        let e = io::Error::from_raw_os_error(libc::ENOTEMPTY);
        assert_eq!(io_error_to_libc(&e), libc::ENOTEMPTY);
        let e = io::Error::new(io::ErrorKind::NotFound, "gone");
        assert_eq!(io_error_to_libc(&e), libc::ENOENT);
    }

    #[test]
    fn test_lstat_opt_absent_through_file_prefix() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("file");
        fs::write(&file, b"x").unwrap();
        assert!(lstat_opt(&file).unwrap().is_some());
        assert!(lstat_opt(&dir.path().join("missing")).unwrap().is_none());
        assert!(lstat_opt(&file.join("child")).unwrap().is_none());
    }

    #[test]
    fn test_set_times_nofollow() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("file");
        fs::write(&file, b"x").unwrap();
        let before = fs::metadata(&file).unwrap();

        let mtime = UNIX_EPOCH + Duration::from_secs(1_000_000);
        set_times_nofollow(&file, None, Some(mtime)).unwrap();

        let meta = fs::metadata(&file).unwrap();
        assert_eq!(metadata_mtime(&meta), mtime);
        assert_eq!(metadata_atime(&meta), metadata_atime(&before));
    }

    #[test]
    fn test_metadata_to_fileattr_keeps_special_bits() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        let sticky = dir.path().join("sticky");
        fs::create_dir(&sticky).unwrap();
        fs::set_permissions(&sticky, fs::Permissions::from_mode(0o1777)).unwrap();

        let attr = metadata_to_fileattr(&fs::symlink_metadata(&sticky).unwrap(), 7);
        assert_eq!(attr.ino, 7);
        assert_eq!(attr.kind, FileType::Directory);
        assert_eq!(attr.perm, 0o1777);
    }
}
