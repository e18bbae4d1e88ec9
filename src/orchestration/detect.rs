//! Container runtime detection
//!
//! Determines which runtime is installed (docker or podman), its version and
//! the optional flags that version accepts. Detection runs once per
//! [`RuntimeDetector`]; the result is reused until [`RuntimeDetector::reset`].

use crate::error::{PkgmillError, PkgmillResult};
use crate::process::{Invocation, ProcessRunner};
use regex::Regex;
use semver::Version;
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock};
use tracing::{debug, info};

/// The two supported container engines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeVariant {
    /// Classic client/daemon docker
    Docker,
    /// Rootless, daemonless podman
    Podman,
}

impl RuntimeVariant {
    /// Oldest release pkgmill is known to work with
    pub fn minimum_version(&self) -> Version {
        match self {
            Self::Docker => Version::new(20, 10, 0),
            Self::Podman => Version::new(3, 4, 0),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Docker => "docker",
            Self::Podman => "podman",
        }
    }
}

impl fmt::Display for RuntimeVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Optional flags gated on runtime variant and version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// `--pids-limit=-1` is accepted by `create`
    pub pids_limit: bool,
    /// `build` goes through BuildKit and needs `--progress=plain` to print
    /// classifiable output when not attached to a terminal
    pub buildkit: bool,
}

impl Capabilities {
    fn derive(variant: RuntimeVariant, version: &Version) -> Self {
        match variant {
            RuntimeVariant::Docker => Self {
                pids_limit: true,
                buildkit: *version >= Version::new(23, 0, 0),
            },
            RuntimeVariant::Podman => Self {
                // Older rootless podman rejects the flag on cgroups v1 hosts
                pids_limit: *version >= Version::new(4, 0, 0),
                buildkit: false,
            },
        }
    }
}

/// Detected runtime: which program to invoke and what it supports
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DockerInfo {
    /// Executable to invoke (`docker` may be podman's compatibility shim)
    pub program: String,
    pub variant: RuntimeVariant,
    pub version: Version,
    pub capabilities: Capabilities,
}

impl DockerInfo {
    /// Classify a parsed version, rejecting releases below the known minimum
    pub fn classify(
        program: impl Into<String>,
        variant: RuntimeVariant,
        version: Version,
    ) -> PkgmillResult<Self> {
        let minimum = variant.minimum_version();
        if version < minimum {
            return Err(PkgmillError::RuntimeTooOld {
                variant: variant.to_string(),
                found: version.to_string(),
                minimum: minimum.to_string(),
            });
        }

        Ok(Self {
            program: program.into(),
            variant,
            capabilities: Capabilities::derive(variant, &version),
            version,
        })
    }
}

fn version_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d+)\.(\d+)(?:\.(\d+))?").expect("static regex"))
}

/// Parse `docker --version` / `podman --version` output.
///
/// Accepts e.g. `Docker version 24.0.7, build afdd53b`,
/// `Docker version 20.10.21+dfsg1, build baeda1f` and `podman version 4.9.3`.
pub fn parse_version_output(program: &str, output: &str) -> PkgmillResult<(RuntimeVariant, Version)> {
    let unparsable = || PkgmillError::RuntimeVersionUnparsable {
        program: program.to_string(),
        output: output.trim().to_string(),
    };

    let variant = if output.to_lowercase().contains("podman") {
        RuntimeVariant::Podman
    } else if output.to_lowercase().contains("docker") {
        RuntimeVariant::Docker
    } else {
        return Err(unparsable());
    };

    let captures = version_regex().captures(output).ok_or_else(unparsable)?;
    let part = |i: usize| {
        captures
            .get(i)
            .map_or(Ok(0), |m| m.as_str().parse::<u64>())
            .map_err(|_| unparsable())
    };

    Ok((variant, Version::new(part(1)?, part(2)?, part(3)?)))
}

/// Lazily detects the installed runtime and caches the answer
pub struct RuntimeDetector {
    runner: Arc<dyn ProcessRunner>,
    program: Option<String>,
    cached: Mutex<Option<DockerInfo>>,
}

impl RuntimeDetector {
    /// Detector probing `docker` then `podman` on `PATH`
    pub fn new(runner: Arc<dyn ProcessRunner>) -> Self {
        Self {
            runner,
            program: None,
            cached: Mutex::new(None),
        }
    }

    /// Detector restricted to one program (e.g. from `[runtime] program`)
    pub fn with_program(runner: Arc<dyn ProcessRunner>, program: impl Into<String>) -> Self {
        Self {
            runner,
            program: Some(program.into()),
            cached: Mutex::new(None),
        }
    }

    /// Detected runtime, probing on first use
    pub async fn info(&self) -> PkgmillResult<DockerInfo> {
        if let Some(info) = self.cached() {
            return Ok(info);
        }

        let info = self.detect().await?;
        info!(
            "Using {} {} ({})",
            info.variant, info.version, info.program
        );
        *self.lock() = Some(info.clone());
        Ok(info)
    }

    /// Previously detected runtime, without probing
    pub fn cached(&self) -> Option<DockerInfo> {
        self.lock().clone()
    }

    /// Install a known answer, skipping detection
    pub fn preset(&self, info: DockerInfo) {
        *self.lock() = Some(info);
    }

    /// Forget the cached answer so the next [`info`](Self::info) probes again
    pub fn reset(&self) {
        *self.lock() = None;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<DockerInfo>> {
        // A poisoned lock only means another thread panicked mid-assignment of
        // a plain Option; the value is still usable.
        self.cached.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn candidates(&self) -> Vec<String> {
        match &self.program {
            Some(program) => vec![program.clone()],
            None => ["docker", "podman"]
                .iter()
                .filter(|p| which::which(p).is_ok())
                .map(|p| p.to_string())
                .collect(),
        }
    }

    async fn detect(&self) -> PkgmillResult<DockerInfo> {
        let candidates = self.candidates();
        if candidates.is_empty() {
            return Err(PkgmillError::RuntimeNotFound);
        }

        let mut last_error = PkgmillError::RuntimeNotFound;
        for program in candidates {
            let invocation = Invocation::new(&program).arg("--version");
            let output = match self.runner.capture(&invocation, false).await {
                Ok(output) if output.success() => output,
                Ok(output) => {
                    debug!("{} --version exited with {}", program, output.code);
                    continue;
                }
                Err(e) => {
                    debug!("{} --version failed: {}", program, e);
                    continue;
                }
            };

            match parse_version_output(&program, &output.output) {
                Ok((variant, version)) => return DockerInfo::classify(program, variant, version),
                Err(e) => last_error = e,
            }
        }

        Err(last_error)
    }
}

static GLOBAL: OnceLock<Arc<RuntimeDetector>> = OnceLock::new();

/// Initialize the process-wide detector, optionally pinned to one program.
///
/// Only the first call decides the program; later calls return the existing
/// detector. Use [`RuntimeDetector::reset`] to force re-detection.
pub fn init_global(program: Option<&str>) -> Arc<RuntimeDetector> {
    GLOBAL
        .get_or_init(|| {
            let runner: Arc<dyn ProcessRunner> = Arc::new(crate::process::SystemRunner);
            let detector = match program {
                Some(program) if !program.is_empty() => RuntimeDetector::with_program(runner, program),
                _ => RuntimeDetector::new(runner),
            };
            Arc::new(detector)
        })
        .clone()
}
