use clap::{Parser, Subcommand};
use std::path::PathBuf;
use twinfs::config::BranchSpec;

#[derive(Parser, Debug)]
#[command(name = "twinfs")]
#[command(
    version,
    about = "Union filesystem over one read-only and one read-write branch"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[command(about = "Mount the union and serve it until unmounted")]
    Mount {
        #[arg(help = "Branches as path[=RO|RW]:path[=RO|RW]")]
        branches: BranchSpec,
        #[arg(help = "Directory to mount the union on")]
        mount_point: PathBuf,
        #[arg(long, help = "Attribute and entry cache TTL in seconds")]
        ttl: Option<u64>,
        #[arg(long, help = "Allow other users to access the mount")]
        allow_other: bool,
    },
    #[command(about = "Unmount a mounted union")]
    Umount {
        #[arg(help = "Mount point to unmount")]
        mount_point: PathBuf,
    },
    #[command(about = "Validate a branch description and print the roles")]
    Check {
        #[arg(help = "Branches as path[=RO|RW]:path[=RO|RW]")]
        branches: BranchSpec,
    },
    #[command(about = "List a directory of the union without mounting it")]
    Ls {
        #[arg(help = "Branches as path[=RO|RW]:path[=RO|RW]")]
        branches: BranchSpec,
        #[arg(default_value = "/", help = "Directory inside the union")]
        path: PathBuf,

        #[arg(long, help = "Machine-readable output (tab-separated values)")]
        porcelain: bool,

        #[arg(long, help = "JSON output", conflicts_with = "porcelain")]
        json: bool,
    },
    #[command(about = "Find stale whiteouts and metadata records on the RW branch")]
    Fsck {
        #[arg(help = "Branches as path[=RO|RW]:path[=RO|RW]")]
        branches: BranchSpec,
        #[arg(long, help = "Remove the stale markers that were found")]
        repair: bool,
    },
    #[command(about = "Manage configuration")]
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    #[command(about = "Show current configuration values")]
    Show,
    #[command(about = "Show config file path")]
    Path,
    #[command(about = "Write a config file with every default spelled out")]
    Init {
        #[arg(long, help = "Overwrite an existing config file")]
        force: bool,
    },
}
