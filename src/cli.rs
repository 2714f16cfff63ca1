//! Command-line interface.

use clap::Parser;
use std::path::PathBuf;

/// Rust Server Pages: an HTTP front-end serving templated pages and
/// on-demand compiled servlets from a public content tree.
#[derive(Parser, Debug, Clone)]
#[command(name = "rsp", version, about, long_about = None)]
pub struct Cli {
    /// Run in development mode (verbose logs, error details in responses)
    #[arg(long)]
    pub dev: bool,

    /// Load a configuration file overriding the base configuration
    #[arg(short = 'C', long = "config", value_hint = clap::ValueHint::FilePath)]
    pub config: Option<PathBuf>,
}
