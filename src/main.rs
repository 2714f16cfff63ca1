//! rsp - Rust Server Pages.
//!
//! An HTTP serving front-end: static files, templated pages with layout
//! chains, and servlets compiled on demand from source colocated with the
//! content tree, with hot reload and zero-downtime restarts.

#![allow(dead_code)]

mod cache;
mod cli;
mod config;
mod error;
mod instance;
mod logger;
mod page;
mod server;
mod servlet;
mod srcgraph;
mod template;
mod toolchain;
mod util;
mod zdr;

use anyhow::{Context, Result};
use clap::Parser;

use cli::Cli;
use config::Config;
use instance::Instance;

fn main() -> Result<()> {
    let cli = Cli::parse();
    logger::set_dev_mode(cli.dev);

    // the install dir is two levels above the executable (bin/rsp)
    let rspdir = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().and_then(|p| p.parent()).map(|p| p.to_path_buf()))
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_default());

    let (config, config_path) =
        Config::load(&rspdir, cli.config.as_deref()).context("loading configuration")?;
    crate::debug!("rsp"; "configuration loaded from {}", config_path.display());

    let instance = Instance::new(rspdir, config)?;
    instance.install_signal_handler()?;
    instance.main()?;

    Ok(())
}
