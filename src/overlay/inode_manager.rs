use fuser::FUSE_ROOT_ID;
use fxhash::FxHashMap;
use parking_lot::RwLock;

use crate::overlay::path::VirtualPath;

#[derive(Debug)]
struct InodeEntry {
    /// `None` once the path was unlinked while the kernel still held it.
    path: Option<VirtualPath>,
    lookups: u64,
}

#[derive(Debug)]
struct InodeTable {
    by_ino: FxHashMap<u64, InodeEntry>,
    by_path: FxHashMap<VirtualPath, u64>,
    next_ino: u64,
}

/// Maps kernel inode numbers to virtual paths.
///
/// The union engine works on paths only; this table gives each path the
/// kernel has looked up a stable number until the kernel forgets it. The
/// root is pinned at `FUSE_ROOT_ID` and never forgotten.
pub(crate) struct InodeManager {
    table: RwLock<InodeTable>,
}

impl InodeManager {
    pub fn new() -> Self {
        let mut by_ino = FxHashMap::default();
        let mut by_path = FxHashMap::default();
        by_ino.insert(
            FUSE_ROOT_ID,
            InodeEntry {
                path: Some(VirtualPath::root()),
                lookups: 1,
            },
        );
        by_path.insert(VirtualPath::root(), FUSE_ROOT_ID);
        InodeManager {
            table: RwLock::new(InodeTable {
                by_ino,
                by_path,
                // FUSE reserves 1 for the root
                next_ino: FUSE_ROOT_ID + 1,
            }),
        }
    }

    pub fn path(&self, ino: u64) -> Option<VirtualPath> {
        self.table
            .read()
            .by_ino
            .get(&ino)
            .and_then(|entry| entry.path.clone())
    }

    /// Inode number already assigned to `path`, if any.
    pub fn peek(&self, path: &VirtualPath) -> Option<u64> {
        self.table.read().by_path.get(path).copied()
    }

    /// Records one kernel lookup of `path` and returns its inode number.
    pub fn remember(&self, path: &VirtualPath) -> u64 {
        let mut table = self.table.write();
        if let Some(&ino) = table.by_path.get(path) {
            if let Some(entry) = table.by_ino.get_mut(&ino) {
                entry.lookups += 1;
            }
            return ino;
        }

        let ino = table.next_ino;
        table.next_ino = table.next_ino.wrapping_add(1);
        table.by_ino.insert(
            ino,
            InodeEntry {
                path: Some(path.clone()),
                lookups: 1,
            },
        );
        table.by_path.insert(path.clone(), ino);
        ino
    }

    /// Drops `nlookup` kernel references; the entry goes away at zero.
    pub fn forget(&self, ino: u64, nlookup: u64) {
        if ino == FUSE_ROOT_ID {
            return;
        }
        let mut table = self.table.write();
        let Some(entry) = table.by_ino.get_mut(&ino) else {
            return;
        };
        entry.lookups = entry.lookups.saturating_sub(nlookup);
        if entry.lookups > 0 {
            return;
        }
        if let Some(entry) = table.by_ino.remove(&ino) {
            if let Some(path) = entry.path {
                if table.by_path.get(&path) == Some(&ino) {
                    table.by_path.remove(&path);
                }
            }
        }
    }

    /// Detaches the inode of a removed path so a later object created at
    /// the same path gets a fresh number.
    pub fn detach(&self, path: &VirtualPath) {
        let mut table = self.table.write();
        if let Some(ino) = table.by_path.remove(path) {
            if let Some(entry) = table.by_ino.get_mut(&ino) {
                entry.path = None;
            }
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.table.read().by_ino.len()
    }
}
