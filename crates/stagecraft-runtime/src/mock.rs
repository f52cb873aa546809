use crate::executor::OperationExecutor;
use crate::{tree, OperationError};
use std::collections::HashMap;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockStep {
    Begin,
    StageOperation,
    Commit,
    Clean,
}

impl fmt::Display for MockStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MockStep::Begin => write!(f, "begin"),
            MockStep::StageOperation => write!(f, "stage_operation"),
            MockStep::Commit => write!(f, "commit"),
            MockStep::Clean => write!(f, "clean"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutorCall {
    Begin { active: PathBuf, staging: PathBuf },
    StageOperation { command: Vec<String>, staging: PathBuf },
    Commit { staging: PathBuf, active: PathBuf },
    Clean { staging: PathBuf },
}

#[derive(Debug, Clone)]
enum Injected {
    Fail(String),
    Timeout,
}

#[derive(Default)]
struct MockState {
    calls: Vec<ExecutorCall>,
    failures: HashMap<MockStep, Injected>,
}

/// In-process executor for tests.
///
/// Copies trees for real (so drift and lock-file checks see actual files),
/// simulates a mutation by appending the command to the staged lock file,
/// records every call and fails on demand.
pub struct MockExecutor {
    lock_file: String,
    state: Mutex<MockState>,
}

impl Default for MockExecutor {
    fn default() -> Self {
        Self {
            lock_file: "composer.lock".to_owned(),
            state: Mutex::new(MockState::default()),
        }
    }
}

impl MockExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_lock_file(mut self, name: impl Into<String>) -> Self {
        self.lock_file = name.into();
        self
    }

    /// Make every later call to `step` fail with `message`.
    pub fn fail_on(&self, step: MockStep, message: impl Into<String>) {
        self.with_state(|s| {
            s.failures.insert(step, Injected::Fail(message.into()));
        });
    }

    /// Make every later call to `step` fail as if it timed out.
    pub fn timeout_on(&self, step: MockStep) {
        self.with_state(|s| {
            s.failures.insert(step, Injected::Timeout);
        });
    }

    pub fn clear_failures(&self) {
        self.with_state(|s| s.failures.clear());
    }

    pub fn calls(&self) -> Vec<ExecutorCall> {
        self.with_state(|s| s.calls.clone())
    }

    pub fn count(&self, step: MockStep) -> usize {
        self.calls()
            .iter()
            .filter(|c| {
                matches!(
                    (c, step),
                    (ExecutorCall::Begin { .. }, MockStep::Begin)
                        | (ExecutorCall::StageOperation { .. }, MockStep::StageOperation)
                        | (ExecutorCall::Commit { .. }, MockStep::Commit)
                        | (ExecutorCall::Clean { .. }, MockStep::Clean)
                )
            })
            .count()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MockState) -> T) -> T {
        // A panicking test thread must not hide the recorded calls from the next one.
        let mut guard = match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    fn record(&self, step: MockStep, call: ExecutorCall) -> Result<(), OperationError> {
        let injected = self.with_state(|s| {
            s.calls.push(call.clone());
            s.failures.get(&step).cloned()
        });
        match injected {
            None => Ok(()),
            Some(Injected::Fail(message)) => Err(OperationError::Injected { step, message }),
            Some(Injected::Timeout) => Err(OperationError::Timeout {
                command: format!("{call:?}"),
                timeout: Duration::ZERO,
            }),
        }
    }
}

impl OperationExecutor for MockExecutor {
    fn name(&self) -> &str {
        "mock"
    }

    fn begin(
        &self,
        active_root: &Path,
        staging_root: &Path,
        exclusions: &[PathBuf],
    ) -> Result<(), OperationError> {
        self.record(
            MockStep::Begin,
            ExecutorCall::Begin {
                active: active_root.to_path_buf(),
                staging: staging_root.to_path_buf(),
            },
        )?;
        tree::copy_tree(active_root, staging_root, exclusions)?;
        Ok(())
    }

    fn stage_operation(
        &self,
        command: &[String],
        staging_root: &Path,
        _timeout: Duration,
    ) -> Result<std::process::Output, OperationError> {
        self.record(
            MockStep::StageOperation,
            ExecutorCall::StageOperation {
                command: command.to_vec(),
                staging: staging_root.to_path_buf(),
            },
        )?;
        let line = command.join(" ");
        let mut lock = OpenOptions::new()
            .create(true)
            .append(true)
            .open(staging_root.join(&self.lock_file))?;
        writeln!(lock, "{line}")?;
        Ok(std::process::Output {
            status: success_status(),
            stdout: format!("mock: {line}\n").into_bytes(),
            stderr: Vec::new(),
        })
    }

    fn commit(
        &self,
        staging_root: &Path,
        active_root: &Path,
        exclusions: &[PathBuf],
    ) -> Result<(), OperationError> {
        self.record(
            MockStep::Commit,
            ExecutorCall::Commit {
                staging: staging_root.to_path_buf(),
                active: active_root.to_path_buf(),
            },
        )?;
        tree::mirror_tree(staging_root, active_root, exclusions)?;
        Ok(())
    }

    fn clean(&self, staging_root: &Path) -> Result<(), OperationError> {
        self.record(
            MockStep::Clean,
            ExecutorCall::Clean {
                staging: staging_root.to_path_buf(),
            },
        )?;
        if staging_root.exists() {
            fs::remove_dir_all(staging_root)?;
        }
        Ok(())
    }
}

#[cfg(unix)]
fn success_status() -> std::process::ExitStatus {
    use std::os::unix::process::ExitStatusExt;
    std::process::ExitStatus::from_raw(0)
}

#[cfg(windows)]
fn success_status() -> std::process::ExitStatus {
    use std::os::windows::process::ExitStatusExt;
    std::process::ExitStatus::from_raw(0)
}
