//! Built-in validators.
//!
//! These are ordinary listeners: the engine knows nothing about them.
//! [`register_builtin_validators`] wires them into a pipeline from the
//! site's `[validators]` configuration.

use crate::events::{EventKind, ValidationEvent};
use crate::pipeline::{ListenerError, ValidationPipeline};
use crate::result::ValidationResult;
use stagecraft_runtime::check_executables;
use stagecraft_schema::ValidatorsSection;
use std::path::{Path, PathBuf};

pub const LOCK_FILE_PRESENT: &str = "lock_file_present";
pub const PENDING_CHANGES: &str = "pending_changes";
pub const WRITABLE_ROOTS: &str = "writable_roots";
pub const DISK_SPACE: &str = "disk_space";
pub const EXECUTABLES_PRESENT: &str = "executables_present";

pub fn register_builtin_validators(pipeline: &mut ValidationPipeline, config: &ValidatorsSection) {
    for kind in [
        EventKind::PreCreate,
        EventKind::PreRequire,
        EventKind::PreApply,
        EventKind::StatusCheck,
    ] {
        pipeline.on_event(kind, 1000, LOCK_FILE_PRESENT, lock_file_present);
    }

    pipeline.on_event(EventKind::PreApply, 100, PENDING_CHANGES, pending_changes);

    for kind in [EventKind::PreCreate, EventKind::PreApply, EventKind::StatusCheck] {
        pipeline.on_event(kind, 50, WRITABLE_ROOTS, writable_roots);
    }

    let min_free_mb = config.min_free_mb;
    for kind in [EventKind::PreCreate, EventKind::StatusCheck] {
        pipeline.on_event(kind, 40, DISK_SPACE, move |event: &mut ValidationEvent| {
            disk_space(event, min_free_mb)
        });
    }

    if !config.required_executables.is_empty() {
        for kind in [EventKind::PreCreate, EventKind::PreRequire, EventKind::StatusCheck] {
            let required = config.required_executables.clone();
            pipeline.on_event(kind, 30, EXECUTABLES_PRESENT, move |event: &mut ValidationEvent| {
                executables_present(event, &required)
            });
        }
    }
}

/// Nothing else can be judged without a lock file.
pub fn lock_file_present(event: &mut ValidationEvent) -> Result<(), ListenerError> {
    let lock = event.paths().active_lock_file();
    if !lock.is_file() {
        event.add_error(format!("lock file {} does not exist", lock.display()));
        event.stop_propagation();
    }
    Ok(())
}

pub fn pending_changes(event: &mut ValidationEvent) -> Result<(), ListenerError> {
    let Some(staged) = event.staged_lock_file() else {
        return Ok(());
    };
    let active = event.paths().active_lock_file();
    let staged_bytes = match std::fs::read(&staged) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            event.add_error(format!("staged lock file {} is missing", staged.display()));
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };
    if std::fs::read(&active).is_ok_and(|active_bytes| active_bytes == staged_bytes) {
        event.add_error("there are no pending changes to apply");
    }
    Ok(())
}

pub fn writable_roots(event: &mut ValidationEvent) -> Result<(), ListenerError> {
    let active = event.paths().active_root().to_path_buf();
    let staging = event.paths().staging_base();
    let mut problems = Vec::new();
    for (label, dir) in [("active root", active), ("staging root", staging)] {
        match nearest_existing(&dir) {
            Some(existing) if is_writable(&existing) => {}
            Some(existing) => problems.push(format!(
                "{label} {} is not writable ({} is read-only)",
                dir.display(),
                existing.display()
            )),
            None => problems.push(format!("{label} {} has no existing ancestor", dir.display())),
        }
    }
    add_all(event, problems, "codebase directories are not writable")
}

pub fn disk_space(event: &mut ValidationEvent, min_free_mb: u64) -> Result<(), ListenerError> {
    let Some(anchor) = nearest_existing(&event.paths().staging_base()) else {
        return Ok(());
    };
    let Some(avail_mb) = available_mb(&anchor) else {
        event.add_warning(format!("could not determine free space at {}", anchor.display()));
        return Ok(());
    };
    if avail_mb < min_free_mb {
        event.add_error(format!(
            "only {avail_mb} MB free at {}, at least {min_free_mb} MB required",
            anchor.display()
        ));
    } else if avail_mb < min_free_mb.saturating_mul(10) {
        event.add_warning(format!("disk space is low: {avail_mb} MB free at {}", anchor.display()));
    }
    Ok(())
}

pub fn executables_present(
    event: &mut ValidationEvent,
    required: &[String],
) -> Result<(), ListenerError> {
    let messages: Vec<String> = check_executables(required)
        .into_iter()
        .map(|m| format!("{} was not found on PATH", m.name))
        .collect();
    add_all(event, messages, "required executables are missing")
}

fn add_all(
    event: &mut ValidationEvent,
    messages: Vec<String>,
    summary: &str,
) -> Result<(), ListenerError> {
    match messages.len() {
        0 => {}
        1 => event.add_result(ValidationResult::error(messages.concat())),
        _ => event.add_result(ValidationResult::errors(summary, messages)?),
    }
    Ok(())
}

fn nearest_existing(path: &Path) -> Option<PathBuf> {
    path.ancestors().find(|p| p.exists()).map(Path::to_path_buf)
}

fn is_writable(dir: &Path) -> bool {
    tempfile::tempfile_in(dir).is_ok()
}

#[cfg(unix)]
fn available_mb(path: &Path) -> Option<u64> {
    use std::os::unix::ffi::OsStrExt;
    let c_path = std::ffi::CString::new(path.as_os_str().as_bytes()).ok()?;

    // SAFETY: zeroed statvfs is a valid initial state for the struct.
    #[allow(unsafe_code, clippy::undocumented_unsafe_blocks)]
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    // SAFETY: c_path is NUL-terminated and stat is a valid out pointer; the
    // struct is only read after the call reports success.
    #[allow(unsafe_code, clippy::undocumented_unsafe_blocks)]
    let ret = unsafe { libc::statvfs(c_path.as_ptr(), &raw mut stat) };
    if ret != 0 {
        return None;
    }
    #[allow(clippy::useless_conversion)]
    let avail = u64::from(stat.f_bavail) * u64::from(stat.f_frsize);
    Some(avail / (1024 * 1024))
}

#[cfg(not(unix))]
fn available_mb(_path: &Path) -> Option<u64> {
    None
}
