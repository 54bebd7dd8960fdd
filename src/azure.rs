//! Azure CLI integration.

pub mod cli;
pub mod models;

pub use cli::{AzCli, CommandOutput, CommandRunner, ProcessRunner};
