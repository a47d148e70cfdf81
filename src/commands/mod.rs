pub mod check;
pub mod config;
pub mod fsck;
pub mod list;
pub mod mount;

pub use check::check_branches;
pub use config::handle_config_command;
pub use fsck::run_fsck;
pub use list::list_directory;
pub use mount::{mount_union, unmount_union};
