//! Virtual paths of the unified namespace and their composition onto branches.

use std::ffi::{OsStr, OsString};
use std::fmt;
use std::os::unix::ffi::OsStrExt;
use std::path::{Component, Path, PathBuf};

use crate::error::{Result, UnionError};
use crate::overlay::metadata::METADATA_PREFIX;
use crate::overlay::types::Branch;
use crate::overlay::whiteout::WHITEOUT_PREFIX;

/// Concrete paths this long or longer are refused.
pub const MAX_PATH_LEN: usize = libc::PATH_MAX as usize;
/// Longest single component the host filesystems accept.
pub const MAX_NAME_LEN: usize = 255;

/// True for leaf names the engine keeps for its own bookkeeping.
pub fn is_reserved_name(name: &OsStr) -> bool {
    let bytes = name.as_bytes();
    bytes.starts_with(WHITEOUT_PREFIX.as_bytes()) || bytes.starts_with(METADATA_PREFIX.as_bytes())
}

/// A `/`-rooted, normalized path inside the union.
///
/// Construction rejects `..`, embedded NUL bytes and any component that
/// starts with a reserved marker prefix, so a `VirtualPath` can always be
/// composed onto either branch without escaping it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VirtualPath(PathBuf);

impl VirtualPath {
    pub fn root() -> Self {
        VirtualPath(PathBuf::from("/"))
    }

    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.as_os_str().as_bytes().contains(&0) {
            return Err(UnionError::InvalidPath(format!(
                "{}: embedded NUL byte",
                path.display()
            )));
        }
        if !path.has_root() {
            return Err(UnionError::InvalidPath(format!(
                "{}: not absolute",
                path.display()
            )));
        }

        let mut normalized = PathBuf::from("/");
        for component in path.components() {
            match component {
                Component::RootDir | Component::CurDir => {}
                Component::ParentDir => {
                    return Err(UnionError::InvalidPath(format!(
                        "{}: '..' is not allowed",
                        path.display()
                    )));
                }
                Component::Prefix(_) => {
                    return Err(UnionError::InvalidPath(path.display().to_string()));
                }
                Component::Normal(name) => {
                    validate_leaf(name)?;
                    normalized.push(name);
                }
            }
        }
        Ok(VirtualPath(normalized))
    }

    pub fn is_root(&self) -> bool {
        self.0.as_os_str().len() == 1
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }

    /// The path without its leading `/`, suitable for joining onto a branch root.
    pub fn relative(&self) -> &Path {
        self.0.strip_prefix("/").unwrap_or(&self.0)
    }

    pub fn leaf(&self) -> Option<&OsStr> {
        self.0.file_name()
    }

    pub fn parent(&self) -> Option<VirtualPath> {
        self.0.parent().map(|p| VirtualPath(p.to_path_buf()))
    }

    pub fn parent_and_leaf(&self) -> Result<(VirtualPath, OsString)> {
        match (self.parent(), self.leaf()) {
            (Some(parent), Some(leaf)) => Ok((parent, leaf.to_os_string())),
            _ => Err(UnionError::InvalidPath(
                "the root has no parent or leaf".to_string(),
            )),
        }
    }

    /// Appends a single leaf name.
    pub fn join(&self, name: &OsStr) -> Result<VirtualPath> {
        if name.is_empty() || name == "." || name == ".." || name.as_bytes().contains(&b'/') {
            return Err(UnionError::InvalidPath(format!(
                "{:?} is not a valid entry name",
                name
            )));
        }
        if name.as_bytes().contains(&0) {
            return Err(UnionError::InvalidPath(format!(
                "{:?}: embedded NUL byte",
                name
            )));
        }
        validate_leaf(name)?;
        Ok(VirtualPath(self.0.join(name)))
    }

    /// Proper ancestors below the root, outermost first.
    pub fn ancestors(&self) -> Vec<VirtualPath> {
        let mut chain: Vec<VirtualPath> = self
            .0
            .ancestors()
            .skip(1)
            .filter(|p| p.as_os_str().len() > 1)
            .map(|p| VirtualPath(p.to_path_buf()))
            .collect();
        chain.reverse();
        chain
    }
}

impl fmt::Display for VirtualPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

fn validate_leaf(name: &OsStr) -> Result<()> {
    if is_reserved_name(name) {
        return Err(UnionError::ReservedName(name.to_string_lossy().into_owned()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(UnionError::NameTooLong(name.to_string_lossy().into_owned()));
    }
    Ok(())
}

fn check_length(path: PathBuf) -> Result<PathBuf> {
    if path.as_os_str().len() >= MAX_PATH_LEN {
        return Err(UnionError::PathTooLong(format!(
            "{}...",
            path.to_string_lossy().chars().take(64).collect::<String>()
        )));
    }
    Ok(path)
}

/// Builds the concrete path of `vpath` inside `branch`.
pub fn compose(branch: &Branch, vpath: &VirtualPath) -> Result<PathBuf> {
    if vpath.is_root() {
        return check_length(branch.root().to_path_buf());
    }
    check_length(branch.root().join(vpath.relative()))
}

/// Builds the concrete path of the marker `<prefix><leaf>` that sits beside
/// `vpath` inside `branch`.
pub fn compose_marker(branch: &Branch, vpath: &VirtualPath, prefix: &str) -> Result<PathBuf> {
    let (parent, leaf) = vpath.parent_and_leaf()?;
    let mut marker = OsString::from(prefix);
    marker.push(&leaf);
    if marker.len() > MAX_NAME_LEN {
        return Err(UnionError::NameTooLong(marker.to_string_lossy().into_owned()));
    }
    let parent_path = compose(branch, &parent)?;
    check_length(parent_path.join(marker))
}
