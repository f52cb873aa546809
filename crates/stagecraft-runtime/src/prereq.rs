use std::fmt;
use std::path::{Path, PathBuf};

/// An executable a site needs but that is not on `PATH`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingPrereq {
    pub name: String,
    pub purpose: &'static str,
}

impl fmt::Display for MissingPrereq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "  - {}: {}", self.name, self.purpose)
    }
}

/// Resolve `name` like a shell would. Names containing a separator are
/// checked as paths and never searched on `PATH`.
pub fn find_executable(name: &str) -> Option<PathBuf> {
    if name.is_empty() {
        return None;
    }
    if name.contains(std::path::MAIN_SEPARATOR) {
        let path = PathBuf::from(name);
        return is_executable(&path).then_some(path);
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

pub fn command_exists(name: &str) -> bool {
    find_executable(name).is_some()
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .is_ok_and(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Check each required executable. Empty list means all are present.
pub fn check_executables(required: &[String]) -> Vec<MissingPrereq> {
    required
        .iter()
        .filter(|name| !command_exists(name))
        .map(|name| MissingPrereq {
            name: name.clone(),
            purpose: "required by the site configuration",
        })
        .collect()
}

/// Format a list of missing executables into a user-friendly error message.
pub fn format_missing(missing: &[MissingPrereq]) -> String {
    use std::fmt::Write as _;
    let mut msg = String::from("missing executables:\n");
    for m in missing {
        let _ = writeln!(msg, "{m}");
    }
    msg.push_str("\nInstall them or adjust [validators].required_executables.");
    msg
}
