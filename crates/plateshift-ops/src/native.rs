//! Platform bulk-copy tool fast path.
//!
//! Cancellation here is coarse: the tool cannot be interrupted between
//! chunks, so a cancelled batch kills the subprocess outright and removes
//! whatever it had written. Callers that need byte-level cancellation
//! latency should leave the native tool disabled.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use plateshift_core::{NativeToolMode, TransferError};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::chunked::discard_partial;

/// Command-line dialect of a native copy tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolFlavor {
    /// Windows `robocopy` (unbuffered, multi-threaded).
    Robocopy,
    /// `rsync` in whole-file, in-place mode.
    Rsync,
    /// Plain `cp`.
    Cp,
}

impl ToolFlavor {
    /// Guess the dialect from an executable path.
    pub fn from_program(program: &Path) -> Self {
        let stem = program
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        match stem.as_str() {
            "robocopy" => Self::Robocopy,
            "rsync" => Self::Rsync,
            _ => Self::Cp,
        }
    }

    /// Whether an exit code means success.
    ///
    /// Robocopy uses codes below 8 for success with various notes.
    pub fn exit_ok(&self, code: Option<i32>) -> bool {
        match (self, code) {
            (Self::Robocopy, Some(code)) => (0..8).contains(&code),
            (_, Some(0)) => true,
            _ => false,
        }
    }
}

/// An external copy utility.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeTool {
    program: PathBuf,
    flavor: ToolFlavor,
    threads: usize,
}

impl NativeTool {
    /// Create a tool from an explicit program path.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        let program = program.into();
        let flavor = ToolFlavor::from_program(&program);
        Self {
            program,
            flavor,
            threads: 8,
        }
    }

    /// Set the worker thread count passed to tools that support it.
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads.max(1);
        self
    }

    /// Look up the platform tool on `PATH`.
    pub fn detect() -> Option<Self> {
        let candidates: &[&str] = if cfg!(windows) {
            &["robocopy"]
        } else {
            &["rsync", "cp"]
        };
        candidates
            .iter()
            .find_map(|name| which::which(name).ok())
            .map(Self::new)
    }

    /// Resolve the configured mode to a tool, if any.
    pub fn from_mode(mode: &NativeToolMode) -> Option<Self> {
        match mode {
            NativeToolMode::Disabled => None,
            NativeToolMode::Auto => Self::detect(),
            NativeToolMode::Program(program) => Some(Self::new(program.clone())),
        }
    }

    /// Executable path.
    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Command-line dialect.
    pub fn flavor(&self) -> ToolFlavor {
        self.flavor
    }

    /// Short display name.
    pub fn name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.display().to_string())
    }

    /// Build the command that copies `source` to `destination`.
    ///
    /// Robocopy copies by file name, so it cannot perform a renaming copy.
    pub fn command(&self, source: &Path, destination: &Path) -> Result<Command, TransferError> {
        let mut command = Command::new(&self.program);
        match self.flavor {
            ToolFlavor::Robocopy => {
                let (Some(src_dir), Some(dst_dir), Some(name)) =
                    (source.parent(), destination.parent(), source.file_name())
                else {
                    return Err(self.failure("source and destination need parent directories"));
                };
                if destination.file_name() != Some(name) {
                    return Err(self.failure("cannot copy under a different file name"));
                }
                command
                    .arg(src_dir)
                    .arg(dst_dir)
                    .arg(name)
                    .arg("/J")
                    .arg(format!("/MT:{}", self.threads))
                    .args(["/R:0", "/W:0", "/NP", "/NJH", "/NJS", "/NFL", "/NDL"]);
            }
            ToolFlavor::Rsync => {
                command
                    .args(["--whole-file", "--inplace", "--no-compress"])
                    .arg(source)
                    .arg(destination);
            }
            ToolFlavor::Cp => {
                command.arg("-f").arg(source).arg(destination);
            }
        }
        Ok(command)
    }

    /// Run the tool and wait for it, killing it if `cancel` fires.
    ///
    /// On failure or cancellation the destination is removed.
    pub async fn try_copy(
        &self,
        source: &Path,
        destination: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), TransferError> {
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }

        let mut command = tokio::process::Command::from(self.command(source, destination)?);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                TransferError::NativeToolUnavailable { tool: self.name() }
            } else {
                self.failure(format!("failed to start: {e}"))
            }
        })?;

        debug!(
            "{} copying {} -> {}",
            self.name(),
            source.display(),
            destination.display()
        );

        tokio::select! {
            status = child.wait() => {
                let status = status.map_err(|e| self.failure(e.to_string()))?;
                if self.flavor.exit_ok(status.code()) {
                    Ok(())
                } else {
                    discard_partial(destination);
                    Err(self.failure(format!("exited with {status}")))
                }
            }
            _ = cancel.cancelled() => {
                if let Err(e) = child.kill().await {
                    debug!("failed to kill {}: {}", self.name(), e);
                }
                discard_partial(destination);
                Err(TransferError::Cancelled)
            }
        }
    }

    fn failure(&self, message: impl Into<String>) -> TransferError {
        TransferError::NativeToolFailed {
            tool: self.name(),
            message: message.into(),
        }
    }
}
