//! Logging with colored module prefixes.
//!
//! `log!` writes a line tagged with a colored `[module]` prefix; `debug!`
//! does the same only when development mode is on (`--dev`).

use crossterm::{
    execute,
    terminal::{Clear, ClearType},
};
use owo_colors::OwoColorize;
use std::{
    io::{stdout, Write},
    sync::atomic::{AtomicBool, Ordering},
};

/// Global development-mode flag (set by the --dev CLI argument).
static DEV_MODE: AtomicBool = AtomicBool::new(false);

/// Enable or disable development mode globally.
pub fn set_dev_mode(v: bool) {
    DEV_MODE.store(v, Ordering::SeqCst);
}

/// Check if development mode is enabled.
pub fn is_dev_mode() -> bool {
    DEV_MODE.load(Ordering::SeqCst)
}

/// Log a message with a colored module prefix
///
/// # Usage
/// ```ignore
/// log!("servlet"; "building {} -> {}", name, libfile);
/// ```
#[macro_export]
macro_rules! log {
    ($module:expr; $($arg:tt)*) => {{
        $crate::logger::log($module, &format!($($arg)*))
    }};
}

/// Log a debug message (only shown in development mode)
///
/// # Usage
/// ```ignore
/// debug!("sg"; "package {} modified; mtime {}", dir, mtime);
/// ```
#[macro_export]
macro_rules! debug {
    ($module:expr; $($arg:tt)*) => {{
        if $crate::logger::is_dev_mode() {
            $crate::logger::log($module, &format!($($arg)*))
        }
    }};
}

/// Log a message with a colored module prefix
#[inline]
pub fn log(module: &str, message: &str) {
    let prefix = colorize_prefix(module);

    let mut stdout = stdout().lock();
    execute!(stdout, Clear(ClearType::UntilNewLine)).ok();
    writeln!(stdout, "{prefix} {message}").ok();
    stdout.flush().ok();
}

/// Apply color to a module prefix based on module type
#[inline]
fn colorize_prefix(module: &str) -> String {
    let prefix = format!("[{module}]");
    match module {
        "serve" | "http" => prefix.bright_blue().bold().to_string(),
        "sg" | "watch" => prefix.bright_green().bold().to_string(),
        "error" => prefix.bright_red().bold().to_string(),
        "zdr" => prefix.bright_magenta().bold().to_string(),
        _ => prefix.bright_yellow().bold().to_string(),
    }
}
