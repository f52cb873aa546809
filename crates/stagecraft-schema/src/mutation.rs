use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MutationError {
    #[error("a mutation must name at least one package")]
    Empty,
    #[error("invalid package requirement '{0}', expected 'vendor/name' or 'vendor/name:constraint'")]
    InvalidPackage(String),
}

/// Canonical description of the package changes to make inside a stage.
///
/// Requirements are `vendor/name` with an optional `:constraint`. Lists are
/// trimmed, sorted and deduplicated so two equal intents compare equal.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MutationSpec {
    pub runtime: Vec<String>,
    pub dev: Vec<String>,
}

impl MutationSpec {
    pub fn new(runtime: &[String], dev: &[String]) -> Result<Self, MutationError> {
        let runtime = normalize_requirements(runtime)?;
        let dev = normalize_requirements(dev)?;
        if runtime.is_empty() && dev.is_empty() {
            return Err(MutationError::Empty);
        }
        Ok(Self { runtime, dev })
    }

    /// Package names without their constraints, runtime first.
    pub fn package_names(&self) -> Vec<&str> {
        self.runtime
            .iter()
            .chain(&self.dev)
            .map(|req| req.split_once(':').map_or(req.as_str(), |(name, _)| name))
            .collect()
    }

    /// Argument vectors for the stage operation, in execution order.
    ///
    /// Requirements are recorded without touching the lock file, then a
    /// single update resolves every named package together.
    pub fn to_commands(&self) -> Vec<Vec<String>> {
        let mut commands = Vec::new();
        if !self.runtime.is_empty() {
            let mut cmd = vec!["require".to_owned(), "--no-update".to_owned()];
            cmd.extend(self.runtime.iter().cloned());
            commands.push(cmd);
        }
        if !self.dev.is_empty() {
            let mut cmd = vec![
                "require".to_owned(),
                "--dev".to_owned(),
                "--no-update".to_owned(),
            ];
            cmd.extend(self.dev.iter().cloned());
            commands.push(cmd);
        }
        let mut update = vec![
            "update".to_owned(),
            "--with-all-dependencies".to_owned(),
            "--optimize-autoloader".to_owned(),
        ];
        update.extend(self.package_names().into_iter().map(str::to_owned));
        commands.push(update);
        commands
    }
}

fn normalize_requirements(values: &[String]) -> Result<Vec<String>, MutationError> {
    let mut out = Vec::with_capacity(values.len());
    for raw in values {
        let req = raw.trim();
        if req.is_empty() {
            continue;
        }
        if !is_valid_requirement(req) {
            return Err(MutationError::InvalidPackage(req.to_owned()));
        }
        out.push(req.to_owned());
    }
    out.sort();
    out.dedup();
    Ok(out)
}

fn is_valid_requirement(req: &str) -> bool {
    let (name, constraint) = match req.split_once(':') {
        Some((name, constraint)) => (name, Some(constraint)),
        None => (req, None),
    };
    if constraint.is_some_and(|c| c.trim().is_empty()) {
        return false;
    }
    let Some((vendor, package)) = name.split_once('/') else {
        return false;
    };
    let part_ok = |part: &str| {
        !part.is_empty()
            && part.bytes().all(|b| {
                b.is_ascii_lowercase() || b.is_ascii_digit() || matches!(b, b'-' | b'_' | b'.')
            })
    };
    part_ok(vendor) && part_ok(package)
}
