//! Container engine: `run`, `build` and `lazy_run`
//!
//! Drives the detected runtime's CLI through a [`ProcessRunner`]. Every
//! container gets host networking so it can reach a mirror on localhost.

use crate::config::Config;
use crate::error::{PkgmillError, PkgmillResult};
use crate::orchestration::build_output;
use crate::orchestration::container::{docker_command_line, ContainerCommand, ContainerSession};
use crate::orchestration::detect::{self, DockerInfo, RuntimeDetector};
use crate::orchestration::lazy::{cache_key, LazyCache, LazyEntry};
use crate::orchestration::platform;
use crate::process::{Invocation, ProcessRunner, SystemRunner};
use chrono::{DateTime, Utc};
use nix::unistd::{getgid, getuid};
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Options for [`ContainerEngine::run`]
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// `(host path, container path)` mounts. Host paths may be relative.
    pub volumes: Vec<(PathBuf, String)>,
    /// Attach the terminal so a human can type into the container
    pub interactive: bool,
    /// Overrides the engine's verbosity for this call
    pub verbosity: Option<u8>,
    /// Target architecture; non-native values run under emulation
    pub architecture: Option<String>,
    /// Allocate a pseudo-terminal
    pub tty: bool,
    /// On failure, open a shell in a snapshot of the failed container first
    pub post_mortem: bool,
    /// Run as the image's default user rather than the invoking host user
    pub root: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            volumes: Vec::new(),
            interactive: false,
            verbosity: None,
            architecture: None,
            tty: false,
            post_mortem: false,
            root: true,
        }
    }
}

impl RunOptions {
    pub fn volume(mut self, host: impl Into<PathBuf>, container: impl Into<String>) -> Self {
        self.volumes.push((host.into(), container.into()));
        self
    }

    pub fn architecture(mut self, architecture: impl Into<String>) -> Self {
        self.architecture = Some(architecture.into());
        self
    }

    pub fn verbosity(mut self, verbosity: u8) -> Self {
        self.verbosity = Some(verbosity);
        self
    }
}

/// Options for [`ContainerEngine::build`]
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    /// Build only up to this named stage
    pub target: Option<String>,
    pub architecture: Option<String>,
    pub verbosity: Option<u8>,
}

/// Runs and builds containers with the detected runtime
pub struct ContainerEngine {
    runner: Arc<dyn ProcessRunner>,
    detector: Arc<RuntimeDetector>,
    lazy: LazyCache,
    binfmt_dir: PathBuf,
    verbosity: u8,
}

impl ContainerEngine {
    pub fn new(runner: Arc<dyn ProcessRunner>, detector: Arc<RuntimeDetector>, lazy: LazyCache) -> Self {
        Self {
            runner,
            detector,
            lazy,
            binfmt_dir: platform::default_binfmt_dir(),
            verbosity: 1,
        }
    }

    /// Engine backed by the real runtime and the shared detector, set up
    /// from the user's configuration
    pub fn from_config(config: &Config) -> Self {
        let lazy = LazyCache::in_dir(&config.cache_root()).with_ttl(config.lazy_ttl());
        Self::new(
            Arc::new(SystemRunner),
            detect::init_global(config.runtime.program.as_deref()),
            lazy,
        )
        .with_verbosity(config.verbosity())
        .with_binfmt_dir(&config.runtime.binfmt_dir)
    }

    /// Default verbosity: 0 silent, 1 echo commands, 2 also stream output
    pub fn with_verbosity(mut self, verbosity: u8) -> Self {
        self.verbosity = verbosity;
        self
    }

    pub fn with_binfmt_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.binfmt_dir = dir.into();
        self
    }

    pub fn detector(&self) -> &RuntimeDetector {
        &self.detector
    }

    pub fn lazy_cache(&self) -> &LazyCache {
        &self.lazy
    }

    fn program_invocation(&self, info: &DockerInfo) -> Invocation {
        Invocation::new(&info.program)
    }

    fn platform_args(&self, info: &DockerInfo, architecture: Option<&str>) -> PkgmillResult<Vec<String>> {
        let Some(architecture) = architecture else {
            return Ok(Vec::new());
        };
        if !platform::is_foreign(architecture) {
            return Ok(Vec::new());
        }
        platform::check_supported(info.variant.name(), architecture, platform::EMULATED_ARCHITECTURES)?;
        platform::check_emulator(architecture, &self.binfmt_dir)?;

        let platform = platform::docker_platform(architecture)
            .ok_or_else(|| PkgmillError::Internal(format!("no --platform value for {}", architecture)))?;
        Ok(vec![format!("--platform={}", platform)])
    }

    /// Arguments shared by `create` and the equivalent `run --rm` line
    fn create_args(
        &self,
        info: &DockerInfo,
        image: &str,
        command: &ContainerCommand,
        options: &RunOptions,
        volumes: &[(PathBuf, String)],
    ) -> PkgmillResult<Vec<String>> {
        let mut args = vec!["--network=host".to_string()];
        args.extend(self.platform_args(info, options.architecture.as_deref())?);

        for (host, container) in volumes {
            args.push(format!("-v{}:{}", host.display(), container));
        }

        if options.interactive {
            args.push(if std::io::stdin().is_terminal() { "-it" } else { "-i" }.to_string());
        } else if options.tty {
            args.push("-t".to_string());
        }

        if info.capabilities.pids_limit {
            args.push("--pids-limit=-1".to_string());
        }

        if !options.root {
            args.push(format!("--user={}:{}", getuid(), getgid()));
        }

        args.push(image.to_string());
        args.extend(command.argv());
        Ok(args)
    }

    fn absolute_volumes(volumes: &[(PathBuf, String)]) -> PkgmillResult<Vec<(PathBuf, String)>> {
        volumes
            .iter()
            .map(|(host, container)| {
                std::path::absolute(host)
                    .map(|abs| (abs, container.clone()))
                    .map_err(|e| PkgmillError::io(format!("resolving volume {}", host.display()), e))
            })
            .collect()
    }

    /// Run `command` in a fresh container of `image`.
    ///
    /// On success the returned session still owns the container, so files can
    /// be copied out of it. On a nonzero exit the container is removed and
    /// [`PkgmillError::Execution`] carries the command line and output.
    pub async fn run(
        &self,
        image: &str,
        command: impl Into<ContainerCommand>,
        options: RunOptions,
    ) -> PkgmillResult<ContainerSession> {
        let command = command.into();
        let info = self.detector.info().await?;
        let verbosity = options.verbosity.unwrap_or(self.verbosity);
        let volumes = Self::absolute_volumes(&options.volumes)?;

        let args = self.create_args(&info, image, &command, &options, &volumes)?;
        let human = docker_command_line(&info.program, &args);
        if verbosity >= 1 {
            println!("{}", human);
        }

        let create = self.program_invocation(&info).arg("create").args(args.iter().cloned());
        let created = self.runner.capture(&create, false).await?;
        let id = created
            .output
            .lines()
            .map(str::trim)
            .rfind(|line| !line.is_empty())
            .filter(|_| created.success())
            .ok_or_else(|| PkgmillError::ContainerCreate(created.output.trim().to_string()))?
            .to_string();
        debug!("Created container {}", id);

        let mut session = ContainerSession::new(
            id.clone(),
            info.program.clone(),
            self.runner.clone(),
            volumes,
            options.interactive,
            human.clone(),
        );

        if options.interactive {
            let start = self.program_invocation(&info).args(["start", id.as_str()]);
            let started = self.runner.capture(&start, false).await?;
            if !started.success() {
                return Err(PkgmillError::execution(human, started.output));
            }
            let attach = self.program_invocation(&info).args(["container", "attach", id.as_str()]);
            session.code = self.runner.interactive(&attach).await?;
            if session.code != 0 {
                let logs = self.program_invocation(&info).args(["logs", id.as_str()]);
                session.output = self.runner.capture(&logs, false).await?.output;
            }
        } else {
            let start = self.program_invocation(&info).args(["container", "start", "-a", id.as_str()]);
            let result = self.runner.capture(&start, verbosity >= 2).await?;
            session.code = result.code;
            session.output = result.output;
        }

        if session.code == 0 {
            return Ok(session);
        }

        if options.post_mortem {
            if let Err(e) = self.post_mortem(&info, &session).await {
                warn!("Post-mortem shell failed: {}", e);
            }
        }

        let output = std::mem::take(&mut session.output);
        if let Err(e) = session.remove().await {
            warn!("Could not remove failed container {}: {}", id, e);
        }
        Err(PkgmillError::execution(human, output))
    }

    /// Interactive shell in a snapshot of a failed container
    async fn post_mortem(&self, info: &DockerInfo, session: &ContainerSession) -> PkgmillResult<()> {
        eprintln!("{}\nEntering post-mortem shell. Exit it to continue.", session.output());
        let snapshot = session.commit().await?;

        let mut shell = self
            .program_invocation(info)
            .args(["run", "--rm", "-it", "--network=host"]);
        for (host, container) in session.volumes() {
            shell = shell.arg(format!("-v{}:{}", host.display(), container));
        }
        shell = shell.args([snapshot.as_str(), "sh"]);
        let code = self.runner.interactive(&shell).await;

        let rmi = self.program_invocation(info).args(["image", "rm", snapshot.as_str()]);
        if let Err(e) = self.runner.capture(&rmi, false).await {
            debug!("Could not remove post-mortem image {}: {}", snapshot, e);
        }
        code.map(|_| ())
    }

    /// Build `manifest` with `context` as the build context, returning the
    /// resulting image id. A relative manifest path resolves against `context`.
    pub async fn build(&self, manifest: &Path, context: &Path, options: BuildOptions) -> PkgmillResult<String> {
        let info = self.detector.info().await?;
        let verbosity = options.verbosity.unwrap_or(self.verbosity);

        let mut args = vec![
            "build".to_string(),
            "-f".to_string(),
            manifest.display().to_string(),
            "--network=host".to_string(),
            ".".to_string(),
        ];
        if let Some(target) = &options.target {
            args.push(format!("--target={}", target));
        }
        args.extend(self.platform_args(&info, options.architecture.as_deref())?);
        if info.capabilities.buildkit {
            args.push("--progress=plain".to_string());
        }

        let invocation = self
            .program_invocation(&info)
            .args(args)
            .current_dir(context);
        let human = format!("$ {}", invocation.display());
        if verbosity >= 1 {
            println!("{}", human);
        }

        let result = self.runner.capture(&invocation, verbosity >= 2).await?;
        if !result.success() {
            return Err(PkgmillError::execution(human, result.output));
        }

        let id = build_output::image_id(&result.output)
            .ok_or(PkgmillError::ImageIdNotFound { command: human })?;
        info!("Built image {}", id);
        Ok(id)
    }

    /// Whether the runtime still has an image
    pub async fn image_exists(&self, image: &str) -> PkgmillResult<bool> {
        let info = self.detector.info().await?;
        let inspect = self
            .program_invocation(&info)
            .args(["image", "inspect", "--format", "{{.Id}}", image]);
        Ok(self.runner.capture(&inspect, false).await?.success())
    }

    /// Like [`run`](Self::run) but memoized: the container's final state is
    /// committed to an image and reused for identical calls within the TTL.
    /// Returns the image id.
    pub async fn lazy_run(
        &self,
        image: &str,
        command: impl Into<ContainerCommand>,
        options: RunOptions,
    ) -> PkgmillResult<String> {
        self.lazy_run_at(image, command.into(), options, Utc::now()).await
    }

    pub(crate) async fn lazy_run_at(
        &self,
        image: &str,
        command: ContainerCommand,
        options: RunOptions,
        now: DateTime<Utc>,
    ) -> PkgmillResult<String> {
        let keyed_image = match &options.architecture {
            Some(arch) => format!("{}@{}", image, platform::normalize(arch)),
            None => image.to_string(),
        };
        let key = cache_key(&keyed_image, &command);

        if let Some(entry) = self.lazy.lookup(&key, now).await? {
            if self.image_exists(&entry.result).await? {
                debug!("Lazy cache hit for {}: {}", image, entry.result);
                return Ok(entry.result);
            }
            debug!("Lazy cache entry {} lost its image", entry.result);
            self.lazy.forget(&key).await?;
        }

        let session = self.run(image, command, options).await?;
        let result = session.commit().await?;
        session.remove().await?;

        self.lazy
            .store(
                &key,
                LazyEntry {
                    result: result.clone(),
                    created_at: now,
                },
            )
            .await?;
        Ok(result)
    }
}
