use twinfs::config::BranchSpec;
use twinfs::error::Result;
use twinfs::fsck::{repair, scan};
use twinfs::overlay::Branches;

/// Returns the process exit code: 0 when the branch is clean or was
/// repaired, 1 when problems remain.
pub fn run_fsck(spec: &BranchSpec, repair_markers: bool) -> Result<i32> {
    let branches = Branches::open(spec)?;
    let findings = scan(&branches)?;

    if findings.is_empty() {
        println!("No problems found");
        return Ok(0);
    }

    for finding in &findings {
        println!(
            "{}\t{}\t{}",
            finding.path,
            finding.problem,
            finding.marker.display()
        );
    }

    if repair_markers {
        let removed = repair(&findings)?;
        println!("Removed {} stale marker(s)", removed);
        Ok(0)
    } else {
        println!(
            "{} problem(s) found; run with --repair to remove the stale markers",
            findings.len()
        );
        Ok(1)
    }
}
