//! Output formatting module.

pub mod progress;
pub mod table;

use anyhow::Result;
use clap::ValueEnum;
use serde::Serialize;

pub use progress::TerminalObserver;
pub use table::*;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Colored text and tables
    #[default]
    Human,
    /// One JSON document per line on stdout
    Json,
}

/// Print `value` as a single JSON line.
pub fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}
