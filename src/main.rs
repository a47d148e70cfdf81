use clap::Parser;

mod cli;
mod commands;

use cli::{Args, Commands};
use twinfs::error;

fn main() {
    match run() {
        Ok(code) => {
            std::process::exit(code);
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

fn run() -> error::Result<i32> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("TWINFS_LOG").unwrap_or_else(|_| "info".to_string()))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Mount {
            branches,
            mount_point,
            ttl,
            allow_other,
        } => {
            commands::mount_union(&branches, &mount_point, ttl, allow_other)?;
            Ok(0)
        }
        Commands::Umount { mount_point } => {
            commands::unmount_union(&mount_point)?;
            Ok(0)
        }
        Commands::Check { branches } => {
            commands::check_branches(&branches)?;
            Ok(0)
        }
        Commands::Ls {
            branches,
            path,
            porcelain,
            json,
        } => {
            commands::list_directory(&branches, &path, porcelain, json)?;
            Ok(0)
        }
        Commands::Fsck { branches, repair } => commands::run_fsck(&branches, repair),
        Commands::Config { action } => {
            commands::handle_config_command(action)?;
            Ok(0)
        }
    }
}
