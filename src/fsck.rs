//! Offline consistency check of the markers on an RW branch.
//!
//! A whiteout must never sit beside an RW object of the same name, and a
//! metadata record must only describe an RO object that has no RW copy.
//! Anything else leaves the union in a state the engine reports as
//! inconsistent.

use serde::Serialize;
use std::ffi::OsStr;
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::error::Result;
use crate::overlay::convert::{is_absent, lstat_opt};
use crate::overlay::{Branches, Whiteout, METADATA_PREFIX};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Problem {
    /// A whiteout hides an object that exists on the RW branch.
    WhiteoutBesideObject,
    /// A metadata record shadows an object that was copied up.
    RecordBesideObject,
    /// A metadata record whose RO original is gone.
    RecordWithoutOriginal,
    /// A marker prefix with no name after it.
    EmptyMarker,
}

impl std::fmt::Display for Problem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Problem::WhiteoutBesideObject => write!(f, "whiteout beside RW object"),
            Problem::RecordBesideObject => write!(f, "metadata record beside RW object"),
            Problem::RecordWithoutOriginal => write!(f, "metadata record without RO original"),
            Problem::EmptyMarker => write!(f, "marker without a target name"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Finding {
    /// Path of the target inside the union.
    pub path: String,
    /// Concrete path of the stale marker on the RW branch.
    pub marker: PathBuf,
    pub problem: Problem,
}

fn marker_target<'n>(name: &'n OsStr, prefix: &str) -> Option<&'n OsStr> {
    let bytes = name.as_bytes();
    bytes
        .strip_prefix(prefix.as_bytes())
        .map(OsStr::from_bytes)
}

fn virtual_display(relative_parent: &Path, target: &OsStr) -> String {
    Path::new("/")
        .join(relative_parent)
        .join(target)
        .display()
        .to_string()
}

/// Walks the RW branch and reports every marker in an invalid state.
pub fn scan(branches: &Branches) -> Result<Vec<Finding>> {
    let rw_root = branches.read_write.root();
    let ro_root = branches.read_only.root();
    let mut findings = Vec::new();

    for entry in WalkDir::new(rw_root).min_depth(1).follow_links(false) {
        let entry = entry.map_err(std::io::Error::from)?;
        let name = entry.file_name();
        let Some(parent) = entry.path().parent() else {
            continue;
        };
        let Ok(relative_parent) = parent.strip_prefix(rw_root) else {
            continue;
        };

        if Whiteout::is_whiteout_marker(name) {
            let Some(target) = Whiteout::extract_target(name) else {
                findings.push(Finding {
                    path: virtual_display(relative_parent, OsStr::new("")),
                    marker: entry.path().to_path_buf(),
                    problem: Problem::EmptyMarker,
                });
                continue;
            };
            if lstat_opt(&parent.join(&target))?.is_some() {
                findings.push(Finding {
                    path: virtual_display(relative_parent, &target),
                    marker: entry.path().to_path_buf(),
                    problem: Problem::WhiteoutBesideObject,
                });
            }
        } else if let Some(target) = marker_target(name, METADATA_PREFIX) {
            let problem = if target.is_empty() {
                Some(Problem::EmptyMarker)
            } else if lstat_opt(&parent.join(target))?.is_some() {
                Some(Problem::RecordBesideObject)
            } else if lstat_opt(&ro_root.join(relative_parent).join(target))?.is_none() {
                Some(Problem::RecordWithoutOriginal)
            } else {
                None
            };
            if let Some(problem) = problem {
                findings.push(Finding {
                    path: virtual_display(relative_parent, target),
                    marker: entry.path().to_path_buf(),
                    problem,
                });
            }
        }
    }

    tracing::debug!(
        "fsck: {} finding(s) under {}",
        findings.len(),
        rw_root.display()
    );
    Ok(findings)
}

/// Removes the stale markers of `findings`. Returns how many were removed.
pub fn repair(findings: &[Finding]) -> Result<usize> {
    let mut removed = 0;
    for finding in findings {
        match fs::remove_file(&finding.marker) {
            Ok(()) => {
                tracing::info!(
                    "Removed {} ({})",
                    finding.marker.display(),
                    finding.problem
                );
                removed += 1;
            }
            Err(e) if is_absent(&e) => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(removed)
}
