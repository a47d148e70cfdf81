use crate::error::{Result, UnionError};
use crate::overlay::{Branch, BranchRole, Branches};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Parsed form of the `path[=ROLE]:path[=ROLE]` mount argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchSpec {
    pub read_only: PathBuf,
    pub read_write: PathBuf,
}

/// Splits a trailing `=ROLE` off one branch description. A `=` before the
/// last `/` belongs to the path.
fn split_role(part: &str) -> Result<(&str, Option<BranchRole>)> {
    let Some(eq) = part.rfind('=') else {
        return Ok((part, None));
    };
    if part[eq..].contains('/') {
        return Ok((part, None));
    }
    let role = part[eq + 1..].parse::<BranchRole>().map_err(UnionError::Config)?;
    Ok((&part[..eq], Some(role)))
}

fn branch_path(raw: &str) -> Result<PathBuf> {
    if raw.is_empty() {
        return Err(UnionError::Config("Empty branch path".to_string()));
    }
    if !raw.starts_with('/') {
        return Err(UnionError::Config(format!(
            "Branch path '{}' must be absolute",
            raw
        )));
    }
    let trimmed = raw.trim_end_matches('/');
    Ok(PathBuf::from(if trimmed.is_empty() { "/" } else { trimmed }))
}

impl FromStr for BranchSpec {
    type Err = UnionError;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split(':');
        let (Some(first), Some(second), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(UnionError::Config(format!(
                "Invalid branches '{}': expected exactly two branches separated by ':'",
                s
            )));
        };

        let (first_path, first_role) = split_role(first)?;
        let (second_path, second_role) = split_role(second)?;

        let (first_role, second_role) = match (first_role, second_role) {
            (None, None) => (BranchRole::ReadOnly, BranchRole::ReadWrite),
            (Some(role), None) => (role, role.opposite()),
            (None, Some(role)) => (role.opposite(), role),
            (Some(a), Some(b)) if a == b => {
                return Err(UnionError::Config(format!(
                    "Invalid branches '{}': both branches are {}",
                    s, a
                )))
            }
            (Some(a), Some(b)) => (a, b),
        };

        let first_path = branch_path(first_path)?;
        let second_path = branch_path(second_path)?;
        let (read_only, read_write) = if first_role == BranchRole::ReadOnly {
            (first_path, second_path)
        } else {
            debug_assert_eq!(second_role, BranchRole::ReadOnly);
            (second_path, first_path)
        };
        Ok(BranchSpec {
            read_only,
            read_write,
        })
    }
}

impl std::fmt::Display for BranchSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}=RO:{}=RW",
            self.read_only.display(),
            self.read_write.display()
        )
    }
}

fn check_directory(path: &Path, role: BranchRole) -> Result<PathBuf> {
    let meta = std::fs::metadata(path).map_err(|e| {
        UnionError::Config(format!(
            "{} branch {} is not accessible: {}",
            role,
            path.display(),
            e
        ))
    })?;
    if !meta.is_dir() {
        return Err(UnionError::Config(format!(
            "{} branch {} is not a directory",
            role,
            path.display()
        )));
    }
    path.canonicalize().map_err(UnionError::Io)
}

impl Branches {
    /// Validates the branch roots on disk.
    pub fn open(spec: &BranchSpec) -> Result<Branches> {
        let ro = check_directory(&spec.read_only, BranchRole::ReadOnly)?;
        let rw = check_directory(&spec.read_write, BranchRole::ReadWrite)?;
        if ro == rw {
            return Err(UnionError::Config(format!(
                "RO and RW branches are the same directory ({})",
                ro.display()
            )));
        }
        if rw.starts_with(&ro) || ro.starts_with(&rw) {
            return Err(UnionError::Config(format!(
                "Branches {} and {} must not contain each other",
                ro.display(),
                rw.display()
            )));
        }
        tracing::debug!("Branches: RO {} RW {}", ro.display(), rw.display());
        Ok(Branches {
            read_only: Branch::new(ro, BranchRole::ReadOnly),
            read_write: Branch::new(rw, BranchRole::ReadWrite),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(s: &str) -> BranchSpec {
        s.parse().unwrap()
    }

    #[test]
    fn test_roles_inferred() {
        assert_eq!(
            spec("/a:/b"),
            BranchSpec {
                read_only: PathBuf::from("/a"),
                read_write: PathBuf::from("/b"),
            }
        );
        assert_eq!(spec("/a=RW:/b").read_write, PathBuf::from("/a"));
        assert_eq!(spec("/a=RW:/b").read_only, PathBuf::from("/b"));
        assert_eq!(spec("/a:/b=RO").read_only, PathBuf::from("/b"));
        assert_eq!(spec("/a=RO:/b=RW").read_write, PathBuf::from("/b"));
    }

    #[test]
    fn test_invalid_specs() {
        for bad in [
            "/a",
            "/a:/b:/c",
            "/a=RO:/b=RO",
            "/a=RW:/b=RW",
            "/a=ro:/b",
            "/a=XX:/b",
            "a:/b",
            ":/b",
        ] {
            assert!(
                matches!(bad.parse::<BranchSpec>(), Err(UnionError::Config(_))),
                "{} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_trailing_separators_stripped() {
        let parsed = spec("/data/base/=RO:/data/changes//");
        assert_eq!(parsed.read_only, PathBuf::from("/data/base"));
        assert_eq!(parsed.read_write, PathBuf::from("/data/changes"));
        assert_eq!(spec("/:/x").read_only, PathBuf::from("/"));
    }

    #[test]
    fn test_equals_inside_path() {
        let parsed = spec("/a=b/c:/d");
        assert_eq!(parsed.read_only, PathBuf::from("/a=b/c"));
    }

    #[test]
    fn test_open_checks_directories() {
        let ro = tempfile::tempdir().unwrap();
        let rw = tempfile::tempdir().unwrap();
        let file = ro.path().join("file");
        std::fs::write(&file, b"").unwrap();

        let ok = BranchSpec {
            read_only: ro.path().to_path_buf(),
            read_write: rw.path().to_path_buf(),
        };
        let branches = Branches::open(&ok).unwrap();
        assert_eq!(branches.read_only.role(), BranchRole::ReadOnly);
        assert_eq!(
            branches.read_write.root(),
            rw.path().canonicalize().unwrap()
        );

        let same = BranchSpec {
            read_only: ro.path().to_path_buf(),
            read_write: ro.path().to_path_buf(),
        };
        assert!(matches!(Branches::open(&same), Err(UnionError::Config(_))));

        let not_dir = BranchSpec {
            read_only: file,
            read_write: rw.path().to_path_buf(),
        };
        assert!(matches!(Branches::open(&not_dir), Err(UnionError::Config(_))));

        let missing = BranchSpec {
            read_only: ro.path().join("missing"),
            read_write: rw.path().to_path_buf(),
        };
        assert!(matches!(Branches::open(&missing), Err(UnionError::Config(_))));

        std::fs::create_dir(ro.path().join("inner")).unwrap();
        let nested = BranchSpec {
            read_only: ro.path().to_path_buf(),
            read_write: ro.path().join("inner"),
        };
        assert!(matches!(Branches::open(&nested), Err(UnionError::Config(_))));
    }
}
