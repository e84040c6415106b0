//! conin - drive console programs from a POSIX terminal
//!
//! Programs written for the Windows console read their keyboard input as key
//! records from the console input buffer, so piping bytes into them from a
//! terminal such as mintty does not work. conin runs such a program with its
//! stdin on the console input buffer and translates the terminal's bytes
//! into key records, while relaying the program's output back unchanged.
//!
//! # Input modes
//!
//! | Console mode | Handling |
//! |--------------|----------|
//! | processed + line + echo | lines are edited locally, then typed in |
//! | anything else | every key is forwarded as it arrives |
//!
//! # Quick Start
//!
//! ```text
//! conin cmd.exe
//! conin python -i
//! conin --log-file ~/conin.log -- net use
//! ```

#![cfg_attr(not(windows), allow(dead_code))]

mod config;
mod core;
mod history;
mod ui;

use std::env;
use std::fs::{self, OpenOptions};
use std::path::Path;
use std::process;

use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::config::{Config, Invocation, LOG_ENV};

/// Version string from Cargo.toml
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Exit code for command line errors
const EXIT_USAGE: i32 = 2;
/// Exit code when the bridge cannot be set up
const EXIT_SETUP: i32 = 126;
/// Exit code for fatal errors while running
const EXIT_FATAL: i32 = 125;

fn print_version() {
    eprintln!("conin {}", VERSION);
}

fn print_help() {
    eprintln!("conin {} - run console programs from a POSIX terminal", VERSION);
    eprintln!();
    eprintln!("Usage: conin [OPTIONS] [--] COMMAND [ARGS...]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --log-file <PATH>     Write a log to PATH (filter with {})", LOG_ENV);
    eprintln!("  --history <N>         Keep N lines of editor history (default 500)");
    eprintln!("  --max-line <N>        Longest line the editor accepts (default 4096)");
    eprintln!("  -V, --version         Show version");
    eprintln!("  -h, --help            Show this help");
    eprintln!();
    eprintln!("Line editing (while the program reads whole lines):");
    eprintln!("  Left/Right, Ctrl+B/F  Move cursor");
    eprintln!("  Home/End, Ctrl+A/E    Start/end of line");
    eprintln!("  Up/Down, Ctrl+P/N     History");
    eprintln!("  Ctrl+U/K/W            Kill to start/to end/previous word");
    eprintln!("  Ctrl+L                Clear screen");
    eprintln!("  Ctrl+C                Discard line and send Ctrl+C");
    eprintln!("  Ctrl+D                End input (on an empty line)");
    eprintln!();
    eprintln!("Exit status is the program's own; 125/126 mean conin itself failed.");
}

fn main() {
    let config = match config::parse_args(env::args().skip(1)) {
        Ok(Invocation::Run(config)) => config,
        Ok(Invocation::Help) => {
            print_help();
            return;
        }
        Ok(Invocation::Version) => {
            print_version();
            return;
        }
        Err(e) => {
            eprintln!("conin: {}", e);
            eprintln!("Use --help for usage information");
            process::exit(EXIT_USAGE);
        }
    };

    if let Some(path) = &config.log_file {
        init_logging(path);
    }

    info!("conin {} starting: {:?}", VERSION, config.command);
    process::exit(run(&config));
}

/// Log to a file; our own stdout and stderr carry the child's output
fn init_logging(path: &Path) {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        let _ = fs::create_dir_all(parent);
    }

    let file = match OpenOptions::new().create(true).append(true).open(path) {
        Ok(file) => file,
        Err(e) => {
            eprintln!("conin: cannot open log file {}: {}", path.display(), e);
            return;
        }
    };

    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::sync::Mutex::new(file))
        .with_ansi(false)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn report(e: &anyhow::Error, code: i32) -> i32 {
    error!("{:#}", e);
    eprintln!("conin: {:#}", e);
    code
}

/// Run the bridge (Windows only); returns the exit code
#[cfg(windows)]
fn run(config: &Config) -> i32 {
    use std::io;
    use std::process::Stdio;

    use anyhow::Context;

    use crate::core::bridge::Bridge;
    use crate::core::console::{current_mode, stdin_is_console, Conin};
    use crate::core::keys::WindowsLayout;
    use crate::core::session::Session;
    use crate::history::History;
    use crate::ui::Readline;

    if stdin_is_console() {
        let e = anyhow::anyhow!("terminal input is a Windows console; run conin from a terminal such as mintty");
        return report(&e, EXIT_SETUP);
    }

    let setup = || -> anyhow::Result<_> {
        let console = Conin::open()?;
        let mode = current_mode(&console).context("Console input buffer is not usable")?;
        info!("Console input mode at startup: {:?}", mode);

        let stdin = console.child_stdin()?;
        let session = Session::spawn(&config.command, Stdio::from(stdin), io::stdin(), config.chunk_size)?;

        let editor = Readline::new(History::new(config.history_limit), config.max_line);
        let bridge = Bridge::new(
            console,
            WindowsLayout,
            editor,
            io::stdout(),
            io::stderr(),
            config.prompt_capacity,
        );
        Ok((bridge, session))
    };

    let (mut bridge, session) = match setup() {
        Ok(parts) => parts,
        Err(e) => return report(&e, EXIT_SETUP),
    };

    match bridge.run(session.events()) {
        Ok(exit) => {
            info!("Bridge for pid {} finished: {:?}", session.pid(), exit);
            exit.exit_code()
        }
        Err(e) => {
            let _ = bridge.shutdown();
            report(&anyhow::Error::from(e), EXIT_FATAL)
        }
    }
}

#[cfg(not(windows))]
fn run(_config: &Config) -> i32 {
    let e = anyhow::Error::from(crate::core::console::ConsoleError::Unsupported);
    report(&e, EXIT_SETUP)
}
