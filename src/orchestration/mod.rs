//! Container orchestration
//!
//! Runs commands in ephemeral containers and builds images on whichever
//! runtime is installed (docker or podman), including emulated foreign
//! architectures:
//! - [`detect`]: runtime variant, version and capability flags
//! - [`engine`]: `run`, `build` and memoized `lazy_run`
//! - [`container`]: one created container, removed exactly once
//! - [`build_output`]: image id extraction from build logs

pub mod build_output;
pub mod container;
pub mod detect;
pub mod engine;
pub mod lazy;
pub mod platform;

pub use container::{docker_command_line, ContainerCommand, ContainerSession};
pub use detect::{Capabilities, DockerInfo, RuntimeDetector, RuntimeVariant};
pub use engine::{BuildOptions, ContainerEngine, RunOptions};
pub use lazy::{LazyCache, LazyEntry};
