//! pkgmill - Distribution packaging toolkit
//!
//! Drives docker or podman to run and build throwaway containers for
//! packaging, and runs caching HTTP mirrors of distribution package
//! repositories so repeated builds do not re-download the world.

pub mod cli;
pub mod config;
pub mod error;
pub mod mirror;
pub mod orchestration;
pub mod process;

pub use error::{PkgmillError, PkgmillResult};
