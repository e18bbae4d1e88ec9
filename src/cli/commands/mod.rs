//! CLI command implementations

pub mod mirror;
pub mod status;

pub use mirror::execute as mirror;
pub use status::execute as status;
