use fuser::FileType;
use std::path::Path;
use twinfs::config::{load_config, BranchSpec};
use twinfs::error::Result;
use twinfs::overlay::{Branches, Union, VirtualPath};

fn kind_name(kind: FileType) -> &'static str {
    match kind {
        FileType::RegularFile => "file",
        FileType::Directory => "directory",
        FileType::Symlink => "symlink",
        FileType::NamedPipe => "fifo",
        FileType::Socket => "socket",
        FileType::CharDevice => "char_device",
        FileType::BlockDevice => "block_device",
    }
}

fn kind_char(kind: FileType) -> char {
    match kind {
        FileType::RegularFile => '-',
        FileType::Directory => 'd',
        FileType::Symlink => 'l',
        FileType::NamedPipe => 'p',
        FileType::Socket => 's',
        FileType::CharDevice => 'c',
        FileType::BlockDevice => 'b',
    }
}

fn format_mode(kind: FileType, perm: u16) -> String {
    let mut out = String::with_capacity(10);
    out.push(kind_char(kind));
    for shift in [6, 3, 0] {
        let bits = (perm >> shift) & 0o7;
        out.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        out.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        out.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }
    out
}

pub fn list_directory(spec: &BranchSpec, path: &Path, porcelain: bool, json: bool) -> Result<()> {
    let config = load_config()?;
    let union = Union::new(Branches::open(spec)?, config.engine_options());
    let dir = VirtualPath::new(path)?;
    let entries = union.readdir(&dir)?;

    if json {
        let entries_display: Vec<_> = entries
            .iter()
            .map(|entry| {
                serde_json::json!({
                    "name": entry.name.to_string_lossy(),
                    "kind": kind_name(entry.kind),
                    "origin": entry.origin,
                })
            })
            .collect();

        println!("{}", serde_json::to_string(&entries_display)?);
    } else if porcelain {
        for entry in &entries {
            println!(
                "{}\t{}\t{}",
                entry.name.to_string_lossy(),
                kind_name(entry.kind),
                entry.origin
            );
        }
    } else {
        if entries.is_empty() {
            println!("{} is empty", dir);
            return Ok(());
        }
        for entry in &entries {
            let child = dir.join(&entry.name)?;
            let attr = union.getattr(&child)?;
            println!(
                "{} {:>5} {:>5} {:>10}  {}  {}",
                format_mode(attr.kind, attr.perm),
                attr.uid,
                attr.gid,
                attr.size,
                entry.origin,
                entry.name.to_string_lossy()
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_mode() {
        assert_eq!(format_mode(FileType::Directory, 0o755), "drwxr-xr-x");
        assert_eq!(format_mode(FileType::RegularFile, 0o640), "-rw-r-----");
        assert_eq!(format_mode(FileType::Symlink, 0o777), "lrwxrwxrwx");
    }
}
