//! Dependency capability probes
//!
//! Only the loader calls these, once per parser per process.

use std::path::{Path, PathBuf};

use super::registry::{Dependency, DependencyKind};

/// Outcome of probing one dependency
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeResult {
    Available,
    Missing { reason: String },
}

impl ProbeResult {
    pub fn is_available(&self) -> bool {
        matches!(self, Self::Available)
    }
}

/// Check whether a dependency can be used
pub fn probe(dependency: &Dependency) -> ProbeResult {
    match &dependency.kind {
        DependencyKind::Feature { enabled: true } => ProbeResult::Available,
        DependencyKind::Feature { enabled: false } => ProbeResult::Missing {
            reason: format!("{} support not compiled in", dependency.name),
        },
        DependencyKind::Executable { candidates } => match find_executable(candidates) {
            Some(_) => ProbeResult::Available,
            None => ProbeResult::Missing {
                reason: format!(
                    "{} not found on PATH (looked for {})",
                    dependency.name,
                    candidates.join(", ")
                ),
            },
        },
    }
}

/// First candidate found on `PATH`
pub fn find_executable(candidates: &[&str]) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    let dirs: Vec<PathBuf> = std::env::split_paths(&path).collect();
    candidates
        .iter()
        .flat_map(|name| dirs.iter().map(move |dir| dir.join(name)))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file() || path.with_extension("exe").is_file()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feature_probe() {
        assert!(probe(&Dependency::feature("x", true)).is_available());
        assert!(matches!(
            probe(&Dependency::feature("x", false)),
            ProbeResult::Missing { .. }
        ));
    }

    #[test]
    fn test_missing_executable() {
        let dep = Dependency::executable("ghost", &["definitely-not-a-real-binary-7f3a"]);
        match probe(&dep) {
            ProbeResult::Missing { reason } => assert!(reason.contains("ghost")),
            ProbeResult::Available => panic!("should not find a fake binary"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_finds_shell() {
        assert!(find_executable(&["missing-binary-x", "sh"]).is_some());
    }
}
