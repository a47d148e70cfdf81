use fuser::FileType;
use serde::Serialize;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Role of a branch, fixed at mount time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum BranchRole {
    #[serde(rename = "RO")]
    ReadOnly,
    #[serde(rename = "RW")]
    ReadWrite,
}

impl BranchRole {
    pub fn opposite(self) -> Self {
        match self {
            BranchRole::ReadOnly => BranchRole::ReadWrite,
            BranchRole::ReadWrite => BranchRole::ReadOnly,
        }
    }
}

impl std::fmt::Display for BranchRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BranchRole::ReadOnly => write!(f, "RO"),
            BranchRole::ReadWrite => write!(f, "RW"),
        }
    }
}

impl std::str::FromStr for BranchRole {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "RO" => Ok(BranchRole::ReadOnly),
            "RW" => Ok(BranchRole::ReadWrite),
            _ => Err(format!(
                "Invalid branch role '{}'. Must be one of: RO, RW",
                s
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Branch {
    root: PathBuf,
    role: BranchRole,
}

impl Branch {
    pub fn new(root: PathBuf, role: BranchRole) -> Self {
        Branch { root, role }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn role(&self) -> BranchRole {
        self.role
    }
}

/// The pair of branches a union is mounted over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Branches {
    pub read_only: Branch,
    pub read_write: Branch,
}

/// Where a virtual path currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Location {
    NonExistent,
    ReadOnly,
    ReadWrite,
    /// On RW, with an RO counterpart underneath.
    ReadWriteCopiedUp,
}

impl Location {
    pub fn exists(self) -> bool {
        self != Location::NonExistent
    }

    pub fn is_on_rw(self) -> bool {
        matches!(self, Location::ReadWrite | Location::ReadWriteCopiedUp)
    }

    /// True when deleting the RW object would let an RO object resurface.
    pub fn has_ro_origin(self) -> bool {
        matches!(self, Location::ReadOnly | Location::ReadWriteCopiedUp)
    }
}

/// Identity that owns whiteout markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarkerOwner {
    pub uid: u32,
    pub gid: u32,
}

impl MarkerOwner {
    pub fn current() -> Self {
        MarkerOwner {
            uid: nix::unistd::geteuid().as_raw(),
            gid: nix::unistd::getegid().as_raw(),
        }
    }
}

impl Default for MarkerOwner {
    fn default() -> Self {
        MarkerOwner { uid: 0, gid: 0 }
    }
}

/// The caller an operation runs on behalf of.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
    pub groups: Vec<u32>,
}

impl Credentials {
    pub fn new(uid: u32, gid: u32) -> Self {
        Credentials {
            uid,
            gid,
            groups: Vec::new(),
        }
    }

    pub fn with_groups(mut self, groups: Vec<u32>) -> Self {
        self.groups = groups;
        self
    }

    pub fn root() -> Self {
        Credentials::new(0, 0)
    }

    pub fn current() -> Self {
        let owner = MarkerOwner::current();
        Credentials::new(owner.uid, owner.gid)
    }

    pub fn is_root(&self) -> bool {
        self.uid == 0
    }

    pub fn in_group(&self, gid: u32) -> bool {
        self.gid == gid || self.groups.contains(&gid)
    }
}

/// A requested attribute change. `None` fields are left alone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetAttr {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<SystemTime>,
    pub mtime: Option<SystemTime>,
}

impl SetAttr {
    pub fn mode(mut self, mode: u32) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn owner(mut self, uid: Option<u32>, gid: Option<u32>) -> Self {
        self.uid = uid;
        self.gid = gid;
        self
    }

    pub fn size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn times(mut self, atime: Option<SystemTime>, mtime: Option<SystemTime>) -> Self {
        self.atime = atime;
        self.mtime = mtime;
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == SetAttr::default()
    }

    /// Size changes touch content; everything else is metadata.
    pub fn changes_content(&self) -> bool {
        self.size.is_some()
    }
}

/// One entry of a merged directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedEntry {
    pub name: OsString,
    pub kind: FileType,
    pub origin: BranchRole,
}

/// Filesystem statistics of the union, reported from the RO branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatFs {
    pub blocks: u64,
    pub blocks_free: u64,
    pub blocks_available: u64,
    pub files: u64,
    pub files_free: u64,
    pub block_size: u32,
    pub name_max: u32,
    pub fragment_size: u32,
}
