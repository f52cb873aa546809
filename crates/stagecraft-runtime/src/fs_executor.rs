use crate::executor::OperationExecutor;
use crate::{tree, OperationError};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Executor working directly on the local filesystem, running mutation
/// commands through an external program (`composer` by default).
pub struct FsExecutor {
    program: String,
}

impl FsExecutor {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

impl OperationExecutor for FsExecutor {
    fn name(&self) -> &str {
        "fs"
    }

    fn begin(
        &self,
        active_root: &Path,
        staging_root: &Path,
        exclusions: &[PathBuf],
    ) -> Result<(), OperationError> {
        if tree::remove_tree(staging_root)? {
            warn!("removed leftover staging directory {}", staging_root.display());
        }
        let copied = tree::copy_tree(active_root, staging_root, exclusions)?;
        info!(
            "copied {copied} entries from {} into {}",
            active_root.display(),
            staging_root.display()
        );
        Ok(())
    }

    fn stage_operation(
        &self,
        command: &[String],
        staging_root: &Path,
        timeout: Duration,
    ) -> Result<std::process::Output, OperationError> {
        let cmdline = std::iter::once(self.program.as_str())
            .chain(command.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");
        info!("running '{cmdline}' in {}", staging_root.display());

        let mut child = Command::new(&self.program)
            .args(command)
            .current_dir(staging_root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| OperationError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());
        let status = wait_with_timeout(&mut child, timeout, &cmdline)?;
        let output = std::process::Output {
            status,
            stdout: join_drain(stdout),
            stderr: join_drain(stderr),
        };

        if !output.status.success() {
            return Err(OperationError::ProcessFailed {
                command: cmdline,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }
        debug!("'{cmdline}' finished");
        Ok(output)
    }

    fn commit(
        &self,
        staging_root: &Path,
        active_root: &Path,
        exclusions: &[PathBuf],
    ) -> Result<(), OperationError> {
        let (copied, removed) = tree::mirror_tree(staging_root, active_root, exclusions)?;
        info!(
            "committed {} into {}: {copied} copied, {removed} removed",
            staging_root.display(),
            active_root.display()
        );
        Ok(())
    }

    fn clean(&self, staging_root: &Path) -> Result<(), OperationError> {
        if tree::remove_tree(staging_root)? {
            debug!("removed staging directory {}", staging_root.display());
        }
        Ok(())
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<Vec<u8>>> {
    pipe.map(|mut p| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = p.read_to_end(&mut buf);
            buf
        })
    })
}

fn join_drain(handle: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    handle.and_then(|h| h.join().ok()).unwrap_or_default()
}

fn wait_with_timeout(
    child: &mut Child,
    timeout: Duration,
    cmdline: &str,
) -> Result<std::process::ExitStatus, OperationError> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        if Instant::now() >= deadline {
            warn!("'{cmdline}' exceeded {timeout:?}, killing it");
            let _ = child.kill();
            let _ = child.wait();
            return Err(OperationError::Timeout {
                command: cmdline.to_owned(),
                timeout,
            });
        }
        thread::sleep(POLL_INTERVAL);
    }
}
