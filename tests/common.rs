use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use twinfs::overlay::{
    Branch, BranchRole, Branches, Credentials, EngineOptions, MarkerOwner, Union, VirtualPath,
};

/// Get the path to the twinfs binary for testing.
#[allow(dead_code)]
pub fn get_twinfs_path() -> PathBuf {
    assert_cmd::cargo::cargo_bin!("twinfs").to_path_buf()
}

/// A union over two fresh temporary branches. Markers belong to the
/// current user so tests run unprivileged.
#[allow(dead_code)]
pub struct TestUnion {
    pub ro: TempDir,
    pub rw: TempDir,
    pub union: Union,
}

impl Default for TestUnion {
    fn default() -> Self {
        Self::new()
    }
}

#[allow(dead_code)]
impl TestUnion {
    pub fn new() -> Self {
        let ro = TempDir::new().expect("Failed to create RO branch");
        let rw = TempDir::new().expect("Failed to create RW branch");
        let branches = Branches {
            read_only: Branch::new(ro.path().to_path_buf(), BranchRole::ReadOnly),
            read_write: Branch::new(rw.path().to_path_buf(), BranchRole::ReadWrite),
        };
        let options = EngineOptions {
            marker_owner: MarkerOwner::current(),
            ..EngineOptions::default()
        };
        let union = Union::new(branches, options);
        TestUnion { ro, rw, union }
    }

    pub fn ro_path(&self, rel: &str) -> PathBuf {
        self.ro.path().join(rel)
    }

    pub fn rw_path(&self, rel: &str) -> PathBuf {
        self.rw.path().join(rel)
    }

    pub fn ro_file(&self, rel: &str, contents: &[u8]) -> PathBuf {
        write_file(&self.ro_path(rel), contents)
    }

    pub fn rw_file(&self, rel: &str, contents: &[u8]) -> PathBuf {
        write_file(&self.rw_path(rel), contents)
    }

    pub fn ro_dir(&self, rel: &str) -> PathBuf {
        let path = self.ro_path(rel);
        fs::create_dir_all(&path).expect("Failed to create RO directory");
        path
    }

    /// Names listed by the union for `dir`.
    pub fn names(&self, dir: &str) -> Vec<String> {
        self.union
            .readdir(&vp(dir))
            .expect("Failed to list directory")
            .into_iter()
            .map(|e| e.name.to_string_lossy().into_owned())
            .collect()
    }
}

#[allow(dead_code)]
pub fn write_file(path: &Path, contents: &[u8]) -> PathBuf {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("Failed to create parent directory");
    }
    fs::write(path, contents).expect("Failed to write file");
    path.to_path_buf()
}

#[allow(dead_code)]
pub fn vp(path: &str) -> VirtualPath {
    VirtualPath::new(path).expect("Invalid virtual path")
}

#[allow(dead_code)]
pub fn me() -> Credentials {
    Credentials::current()
}
