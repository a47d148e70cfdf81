use std::path::PathBuf;

use crate::error::Result;
use crate::overlay::path::{compose, VirtualPath};
use crate::overlay::types::{Branch, Branches, MarkerOwner};

pub const DEFAULT_DIR_MODE: u32 = 0o755;

/// Tunables of the engine that do not come from the branch description.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineOptions {
    pub marker_owner: MarkerOwner,
    /// Mode for RW directories created without an RO template.
    pub default_dir_mode: u32,
}

impl Default for EngineOptions {
    fn default() -> Self {
        EngineOptions {
            marker_owner: MarkerOwner::default(),
            default_dir_mode: DEFAULT_DIR_MODE,
        }
    }
}

/// Immutable state shared by every component of a mounted union.
#[derive(Debug, Clone)]
pub struct MountContext {
    branches: Branches,
    options: EngineOptions,
}

impl MountContext {
    pub fn new(branches: Branches, options: EngineOptions) -> Self {
        MountContext { branches, options }
    }

    pub fn branches(&self) -> &Branches {
        &self.branches
    }

    pub fn ro(&self) -> &Branch {
        &self.branches.read_only
    }

    pub fn rw(&self) -> &Branch {
        &self.branches.read_write
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn ro_path(&self, vpath: &VirtualPath) -> Result<PathBuf> {
        compose(self.ro(), vpath)
    }

    pub fn rw_path(&self, vpath: &VirtualPath) -> Result<PathBuf> {
        compose(self.rw(), vpath)
    }
}
