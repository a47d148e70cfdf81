pub mod branches;
pub mod paths;
pub mod persistence;
pub mod schema;

pub use branches::*;
pub use paths::*;
pub use persistence::*;
pub use schema::*;

fn default_marker_uid() -> u32 {
    0
}

fn default_marker_gid() -> u32 {
    0
}

fn default_dir_mode() -> u32 {
    crate::overlay::DEFAULT_DIR_MODE
}

fn default_fuse_ttl_secs() -> u64 {
    1
}

fn default_allow_other() -> bool {
    false
}

fn default_auto_unmount() -> bool {
    true
}
