//! Command-line surface and phase orchestration.

pub mod cli;
#[allow(clippy::module_inception)]
pub mod driver;
