pub mod config;
pub mod error;
pub mod fsck;
pub mod overlay;

pub use config::load_config;
pub use config::save_config;
pub use config::BranchSpec;
pub use config::Config;

pub use error::{Result, UnionError};

pub use overlay::{
    Branch, BranchRole, Branches, Credentials, EngineOptions, Location, MergedEntry, SetAttr,
    Union, UnionFuse, VirtualPath,
};
