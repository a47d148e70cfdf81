use twinfs::config::BranchSpec;
use twinfs::error::Result;
use twinfs::overlay::Branches;

pub fn check_branches(spec: &BranchSpec) -> Result<()> {
    let branches = Branches::open(spec)?;
    println!("RO\t{}", branches.read_only.root().display());
    println!("RW\t{}", branches.read_write.root().display());
    Ok(())
}
