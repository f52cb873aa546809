//! Directory tree copy and mirror helpers shared by the executors.
//!
//! Exclusions are paths relative to the tree root; an entry is skipped when
//! its relative path equals or lies under any exclusion.

use crate::OperationError;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub fn is_excluded(rel: &Path, exclusions: &[PathBuf]) -> bool {
    exclusions.iter().any(|e| rel.starts_with(e))
}

/// Recursively collect (relative, full) pairs, parents before children.
/// Excluded directories are not descended into.
fn collect_entries(
    root: &Path,
    current: &Path,
    exclusions: &[PathBuf],
    out: &mut Vec<(PathBuf, PathBuf)>,
) -> Result<(), OperationError> {
    let mut entries = fs::read_dir(current)?.collect::<Result<Vec<_>, _>>()?;
    entries.sort_by_key(fs::DirEntry::file_name);
    for entry in entries {
        let full = entry.path();
        let rel = full
            .strip_prefix(root)
            .map_err(|e| OperationError::InvalidPath(format!("{}: {e}", full.display())))?
            .to_path_buf();
        if is_excluded(&rel, exclusions) {
            debug!("excluded: {}", rel.display());
            continue;
        }
        let is_dir = full.symlink_metadata()?.is_dir();
        out.push((rel, full.clone()));
        if is_dir {
            collect_entries(root, &full, exclusions, out)?;
        }
    }
    Ok(())
}

/// Copy every non-excluded entry of `src` over `dst`, replacing entries of a
/// different kind. Nothing in `dst` is removed.
pub fn copy_tree(src: &Path, dst: &Path, exclusions: &[PathBuf]) -> Result<usize, OperationError> {
    if !src.is_dir() {
        return Err(OperationError::InvalidPath(format!(
            "{} is not a directory",
            src.display()
        )));
    }
    fs::create_dir_all(dst)?;
    let mut entries = Vec::new();
    collect_entries(src, src, exclusions, &mut entries)?;

    let mut copied = 0;
    for (rel, full) in &entries {
        let target = dst.join(rel);
        let ft = full.symlink_metadata()?.file_type();
        if ft.is_dir() {
            if target.symlink_metadata().is_ok_and(|m| !m.is_dir()) {
                fs::remove_file(&target)?;
            }
            fs::create_dir_all(&target)?;
        } else if ft.is_file() {
            if target.symlink_metadata().is_ok_and(|m| m.is_dir()) {
                fs::remove_dir_all(&target)?;
            } else if target.symlink_metadata().is_ok_and(|m| m.file_type().is_symlink()) {
                fs::remove_file(&target)?;
            }
            fs::copy(full, &target)?;
            copied += 1;
        } else if ft.is_symlink() {
            copy_symlink(full, &target)?;
            copied += 1;
        } else {
            warn!("skipping unsupported file type: {}", rel.display());
        }
    }
    Ok(copied)
}

#[cfg(unix)]
fn copy_symlink(src: &Path, target: &Path) -> Result<(), OperationError> {
    let link = fs::read_link(src)?;
    match target.symlink_metadata() {
        Ok(m) if m.is_dir() => fs::remove_dir_all(target)?,
        Ok(_) => fs::remove_file(target)?,
        Err(_) => {}
    }
    std::os::unix::fs::symlink(link, target)?;
    Ok(())
}

#[cfg(not(unix))]
fn copy_symlink(src: &Path, _target: &Path) -> Result<(), OperationError> {
    warn!("symlinks are not supported here, skipping {}", src.display());
    Ok(())
}

/// Make `dst` mirror `src`: copy everything over, then remove entries of
/// `dst` that have no counterpart in `src`. Excluded paths are untouched on
/// both sides. Returns (copied, removed).
pub fn mirror_tree(
    src: &Path,
    dst: &Path,
    exclusions: &[PathBuf],
) -> Result<(usize, usize), OperationError> {
    let copied = copy_tree(src, dst, exclusions)?;

    let mut existing = Vec::new();
    collect_entries(dst, dst, exclusions, &mut existing)?;
    let mut removed = 0;
    for (rel, full) in existing {
        // A parent removed earlier in this pass already took it.
        let Ok(meta) = full.symlink_metadata() else {
            continue;
        };
        if src.join(&rel).symlink_metadata().is_ok() {
            continue;
        }
        if meta.is_dir() {
            fs::remove_dir_all(&full)?;
        } else {
            fs::remove_file(&full)?;
        }
        debug!("removed {}", rel.display());
        removed += 1;
    }
    Ok((copied, removed))
}

pub fn remove_tree(path: &Path) -> Result<bool, OperationError> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tree(root: &Path) {
        fs::create_dir_all(root.join("vendor/acme/lib")).unwrap();
        fs::create_dir_all(root.join(".state/kv")).unwrap();
        fs::write(root.join("composer.json"), "{}").unwrap();
        fs::write(root.join("composer.lock"), "lock-v1").unwrap();
        fs::write(root.join("vendor/acme/lib/a.php"), "<?php").unwrap();
        fs::write(root.join(".state/kv/site.stage_lock"), "claim").unwrap();
    }

    #[test]
    fn copy_honors_exclusions() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        sample_tree(&src);

        copy_tree(&src, &dst, &[PathBuf::from(".state")]).unwrap();
        assert_eq!(fs::read_to_string(dst.join("composer.lock")).unwrap(), "lock-v1");
        assert!(dst.join("vendor/acme/lib/a.php").exists());
        assert!(!dst.join(".state").exists());
    }

    #[test]
    fn exclusion_matches_whole_components() {
        assert!(is_excluded(Path::new("web/files/x"), &[PathBuf::from("web/files")]));
        assert!(!is_excluded(Path::new("web/filesystem"), &[PathBuf::from("web/files")]));
    }

    #[test]
    fn mirror_removes_stale_entries_but_keeps_excluded() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        sample_tree(&src);
        sample_tree(&dst);
        fs::remove_dir_all(src.join("vendor/acme")).unwrap();
        fs::remove_dir_all(src.join(".state")).unwrap();
        fs::write(src.join("composer.lock"), "lock-v2").unwrap();

        let (_, removed) = mirror_tree(&src, &dst, &[PathBuf::from(".state")]).unwrap();
        assert_eq!(removed, 1);
        assert!(!dst.join("vendor/acme").exists());
        assert!(dst.join("vendor").is_dir());
        assert!(dst.join(".state/kv/site.stage_lock").exists());
        assert_eq!(fs::read_to_string(dst.join("composer.lock")).unwrap(), "lock-v2");
    }

    #[test]
    fn copy_replaces_entries_of_different_kind() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        fs::create_dir_all(src.join("assets")).unwrap();
        fs::write(src.join("assets/app.js"), "js").unwrap();
        fs::create_dir_all(&dst).unwrap();
        fs::write(dst.join("assets"), "was a file").unwrap();

        copy_tree(&src, &dst, &[]).unwrap();
        assert!(dst.join("assets").is_dir());
        assert!(dst.join("assets/app.js").exists());
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_are_copied_as_links() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("real.txt"), "x").unwrap();
        std::os::unix::fs::symlink("real.txt", src.join("link.txt")).unwrap();

        copy_tree(&src, &dst, &[]).unwrap();
        let link = dst.join("link.txt");
        assert!(link.symlink_metadata().unwrap().file_type().is_symlink());
        assert_eq!(fs::read_link(&link).unwrap(), PathBuf::from("real.txt"));
    }

    #[test]
    fn copy_from_missing_source_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(copy_tree(&dir.path().join("nope"), &dir.path().join("dst"), &[]).is_err());
    }

    #[test]
    fn remove_tree_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("t");
        fs::create_dir_all(target.join("a")).unwrap();
        assert!(remove_tree(&target).unwrap());
        assert!(!remove_tree(&target).unwrap());
    }
}
