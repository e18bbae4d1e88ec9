//! Error types for pkgmill
//!
//! All modules use `PkgmillResult<T>` as their return type.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for pkgmill operations
pub type PkgmillResult<T> = Result<T, PkgmillError>;

/// All errors that can occur in pkgmill
#[derive(Error, Debug)]
pub enum PkgmillError {
    // Environment errors
    #[error("No container runtime found. Install docker or podman.")]
    RuntimeNotFound,

    #[error("{variant} {found} is too old. Version {minimum} or newer is required.")]
    RuntimeTooOld {
        variant: String,
        found: String,
        minimum: String,
    },

    #[error("Could not parse a version from `{program} --version` output: {output}")]
    RuntimeVersionUnparsable { program: String, output: String },

    #[error("Architecture {architecture} is not supported by {distribution}. Supported: {supported}")]
    UnsupportedArchitecture {
        architecture: String,
        distribution: String,
        supported: String,
    },

    #[error("Emulating {architecture} containers requires a registered QEMU binfmt handler ({handler}), which is missing")]
    EmulatorMissing {
        architecture: String,
        handler: String,
    },

    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    // Container errors
    #[error("{}", format_execution(.command, .output))]
    Execution { command: String, output: String },

    #[error("Container creation failed: {0}")]
    ContainerCreate(String),

    #[error("Could not find an image id in the output of: {command}")]
    ImageIdNotFound { command: String },

    // Mirror errors
    #[error("Unknown mirror: {0}")]
    UnknownMirror(String),

    #[error("Failed to bind mirror port {port}: {source}")]
    MirrorBind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid pattern {pattern:?} for mirror {mirror}: {reason}")]
    InvalidPattern {
        mirror: String,
        pattern: String,
        reason: String,
    },

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // Process errors
    #[error("Command failed: {command}")]
    CommandFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command execution error: {command}, stderr: {stderr}")]
    CommandExecution { command: String, stderr: String },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),
}

fn format_execution(command: &str, output: &str) -> String {
    format!(
        "Container command:\n    {}\nreturned an error:\n{}",
        command,
        textwrap::indent(output, "    ")
    )
}

impl PkgmillError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a command failed error
    pub fn command_failed(command: impl Into<String>, source: std::io::Error) -> Self {
        Self::CommandFailed {
            command: command.into(),
            source,
        }
    }

    /// Create a command execution error
    pub fn command_exec(command: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self::CommandExecution {
            command: command.into(),
            stderr: stderr.into(),
        }
    }

    /// Create an execution error carrying the human readable command line
    pub fn execution(command: impl Into<String>, output: impl Into<String>) -> Self {
        Self::Execution {
            command: command.into(),
            output: output.into(),
        }
    }

    /// Whether the error is a host configuration problem, detected before any
    /// container was created.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::RuntimeNotFound
                | Self::RuntimeTooOld { .. }
                | Self::RuntimeVersionUnparsable { .. }
                | Self::UnsupportedArchitecture { .. }
                | Self::EmulatorMissing { .. }
                | Self::ConfigInvalid { .. }
        )
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::RuntimeNotFound => Some("Install docker (https://docs.docker.com/engine/install/) or podman"),
            Self::RuntimeTooOld { .. } => Some("Upgrade your container runtime via your package manager"),
            Self::EmulatorMissing { .. } => Some(
                "Install qemu-user-static (Debian/Ubuntu/Fedora) or qemu-user-static-binfmt (Arch), then restart systemd-binfmt",
            ),
            Self::MirrorBind { .. } => {
                Some("Another process holds this port. Change it under [mirrors.<name>] in config.toml")
            }
            _ => None,
        }
    }
}
