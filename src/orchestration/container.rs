//! Container sessions
//!
//! A [`ContainerSession`] owns one created container. It exposes the
//! captured output and exit code, extracts files from the container's
//! filesystem, and removes the container exactly once: explicitly through
//! [`ContainerSession::remove`] or, failing that, when dropped.

use crate::error::{PkgmillError, PkgmillResult};
use crate::process::{shell_join, Invocation, ProcessRunner};
use std::io::{Cursor, Read};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// The command a container runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerCommand {
    /// Shell script, dedented and run through `sh -c`
    Shell(String),
    /// Literal argument vector
    Argv(Vec<String>),
    /// The image's own entrypoint/cmd
    Default,
}

impl ContainerCommand {
    /// Arguments appended after the image reference
    pub fn argv(&self) -> Vec<String> {
        match self {
            Self::Shell(script) => vec![
                "sh".to_string(),
                "-c".to_string(),
                textwrap::dedent(script),
            ],
            Self::Argv(args) => args.clone(),
            Self::Default => Vec::new(),
        }
    }
}

impl From<&str> for ContainerCommand {
    fn from(script: &str) -> Self {
        Self::Shell(script.to_string())
    }
}

impl From<String> for ContainerCommand {
    fn from(script: String) -> Self {
        Self::Shell(script)
    }
}

impl From<Vec<String>> for ContainerCommand {
    fn from(args: Vec<String>) -> Self {
        Self::Argv(args)
    }
}

/// Equivalent one-shot command line, e.g. `$ docker run --rm -v/src:/io alpine sh -c 'make'`
pub fn docker_command_line(program: &str, args: &[String]) -> String {
    format!("$ {} run --rm {}", program, shell_join(args.iter().map(String::as_str)))
}

/// True when the runtime's complaint means the container is already gone
pub(crate) fn is_missing_container(output: &str) -> bool {
    let lower = output.to_lowercase();
    lower.contains("no such container") || lower.contains("no container with name or id")
}

/// Force-remove a container, tolerating one that no longer exists
pub(crate) async fn remove_container(
    runner: &dyn ProcessRunner,
    program: &str,
    id: &str,
) -> PkgmillResult<()> {
    debug!("Removing container: {}", id);

    let invocation = Invocation::new(program).args(["container", "rm", "-f", id]);
    let output = runner.capture(&invocation, false).await?;
    if output.success() || is_missing_container(&output.output) {
        Ok(())
    } else {
        Err(PkgmillError::command_exec(invocation.display(), output.output))
    }
}

/// One created container and the result of running it
pub struct ContainerSession {
    id: String,
    program: String,
    runner: Arc<dyn ProcessRunner>,
    volumes: Vec<(PathBuf, String)>,
    interactive: bool,
    command_line: String,
    pub(crate) output: String,
    pub(crate) code: i32,
    removed: AtomicBool,
}

impl ContainerSession {
    pub(crate) fn new(
        id: String,
        program: String,
        runner: Arc<dyn ProcessRunner>,
        volumes: Vec<(PathBuf, String)>,
        interactive: bool,
        command_line: String,
    ) -> Self {
        Self {
            id,
            program,
            runner,
            volumes,
            interactive,
            command_line,
            output: String::new(),
            code: 0,
            removed: AtomicBool::new(false),
        }
    }

    /// Runtime-assigned container id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Combined stdout/stderr. Empty for successful interactive runs.
    pub fn output(&self) -> &str {
        &self.output
    }

    pub fn code(&self) -> i32 {
        self.code
    }

    /// Host path to container path mounts, host side absolute
    pub fn volumes(&self) -> &[(PathBuf, String)] {
        &self.volumes
    }

    pub fn interactive(&self) -> bool {
        self.interactive
    }

    /// Equivalent `$ docker run --rm ...` line
    pub fn command_line(&self) -> &str {
        &self.command_line
    }

    /// Tar stream of `path` copied out of the container's filesystem
    pub async fn archive(&self, path: &str) -> PkgmillResult<tar::Archive<Cursor<Vec<u8>>>> {
        let invocation = Invocation::new(&self.program).args([
            "container".to_string(),
            "cp".to_string(),
            format!("{}:{}", self.id, path),
            "-".to_string(),
        ]);
        let output = self.runner.capture_bytes(&invocation).await?;
        if output.code != 0 {
            return Err(PkgmillError::execution(invocation.display(), output.stderr));
        }
        Ok(tar::Archive::new(Cursor::new(output.stdout)))
    }

    /// Contents of a single file inside the container
    pub async fn file(&self, path: &str) -> PkgmillResult<Vec<u8>> {
        let mut archive = self.archive(path).await?;
        let context = || format!("reading {} from container {}", path, self.id);

        let mut entries = archive.entries().map_err(|e| PkgmillError::io(context(), e))?;
        let mut entry = entries
            .next()
            .ok_or_else(|| PkgmillError::Internal(format!("{} produced an empty archive", path)))?
            .map_err(|e| PkgmillError::io(context(), e))?;

        let mut content = Vec::new();
        entry
            .read_to_end(&mut content)
            .map_err(|e| PkgmillError::io(context(), e))?;
        Ok(content)
    }

    /// Snapshot the container's filesystem into a new image, returning its id
    pub async fn commit(&self) -> PkgmillResult<String> {
        let invocation = Invocation::new(&self.program).args(["commit", self.id.as_str()]);
        let output = self.runner.capture(&invocation, false).await?;
        if !output.success() {
            return Err(PkgmillError::execution(invocation.display(), output.output));
        }
        output
            .output
            .lines()
            .map(str::trim)
            .rfind(|line| !line.is_empty())
            .map(str::to_string)
            .ok_or_else(|| PkgmillError::ImageIdNotFound {
                command: invocation.display(),
            })
    }

    /// Remove the container now. Later drops are no-ops.
    pub async fn remove(self) -> PkgmillResult<()> {
        if self.removed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        remove_container(self.runner.as_ref(), &self.program, &self.id).await
    }
}

impl Drop for ContainerSession {
    fn drop(&mut self) {
        if self.removed.swap(true, Ordering::SeqCst) {
            return;
        }
        // The runtime may already be gone during shutdown
        let invocation = Invocation::new(&self.program).args(["container", "rm", "-f", self.id.as_str()]);
        if let Err(e) = self.runner.run_blocking(&invocation) {
            warn!("Could not remove container {}: {}", self.id, e);
        }
    }
}

impl std::fmt::Debug for ContainerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerSession")
            .field("id", &self.id)
            .field("program", &self.program)
            .field("code", &self.code)
            .field("interactive", &self.interactive)
            .finish()
    }
}
