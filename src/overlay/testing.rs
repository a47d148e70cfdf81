//! Fixtures shared by the unit tests: a pair of temporary branch roots.

use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

use crate::overlay::context::{EngineOptions, MountContext};
use crate::overlay::types::{Branch, BranchRole, Branches, MarkerOwner};
use crate::overlay::Union;

pub(crate) struct TestBranches {
    pub ro: TempDir,
    pub rw: TempDir,
}

impl TestBranches {
    pub fn new() -> Self {
        TestBranches {
            ro: tempfile::tempdir().unwrap(),
            rw: tempfile::tempdir().unwrap(),
        }
    }

    pub fn branches(&self) -> Branches {
        Branches {
            read_only: Branch::new(self.ro.path().to_path_buf(), BranchRole::ReadOnly),
            read_write: Branch::new(self.rw.path().to_path_buf(), BranchRole::ReadWrite),
        }
    }

    pub fn options(&self) -> EngineOptions {
        EngineOptions {
            marker_owner: MarkerOwner::current(),
            ..EngineOptions::default()
        }
    }

    pub fn context(&self) -> MountContext {
        MountContext::new(self.branches(), self.options())
    }

    pub fn union(&self) -> Union {
        Union::new(self.branches(), self.options())
    }

    pub fn ro_dir(&self, rel: &str) -> PathBuf {
        let path = self.ro.path().join(rel);
        fs::create_dir_all(&path).unwrap();
        path
    }

    pub fn ro_file(&self, rel: &str, contents: &[u8]) -> PathBuf {
        let path = self.ro.path().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, contents).unwrap();
        path
    }

    pub fn rw_dir(&self, rel: &str) -> PathBuf {
        let path = self.rw.path().join(rel);
        fs::create_dir_all(&path).unwrap();
        path
    }

    pub fn rw_file(&self, rel: &str, contents: &[u8]) -> PathBuf {
        let path = self.rw.path().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, contents).unwrap();
        path
    }
}
