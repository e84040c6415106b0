//! Runtime configuration for conin.
//!
//! Settings come from built-in defaults and the command line only; nothing
//! is read from or written to disk.
//!
//! ```text
//! conin [OPTIONS] [--] COMMAND [ARGS...]
//! ```

use std::path::PathBuf;

use crate::core::relay::{DEFAULT_CHUNK_SIZE, DEFAULT_PROMPT_CAPACITY};
use crate::history::HISTORY_LIMIT;
use crate::ui::editor::DEFAULT_MAX_LINE;

/// Environment variable holding the log filter
pub const LOG_ENV: &str = "CONIN_LOG";

/// Main configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Child command and its arguments
    pub command: Vec<String>,
    /// Read size for child output and terminal input
    pub chunk_size: usize,
    /// Bytes of trailing child output kept as the prompt
    pub prompt_capacity: usize,
    /// Line editor history entries
    pub history_limit: usize,
    /// Longest line the editor accepts, in characters
    pub max_line: usize,
    /// Log destination; no logging without one
    pub log_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            prompt_capacity: DEFAULT_PROMPT_CAPACITY,
            history_limit: HISTORY_LIMIT,
            max_line: DEFAULT_MAX_LINE,
            log_file: None,
        }
    }
}

/// What the command line asked for
#[derive(Debug, PartialEq, Eq)]
pub enum Invocation {
    Run(Config),
    Help,
    Version,
}

/// Parse arguments (without the program name)
pub fn parse_args<I>(args: I) -> Result<Invocation, String>
where
    I: IntoIterator<Item = String>,
{
    let mut config = Config::default();
    let mut args = args.into_iter();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" | "--help" => return Ok(Invocation::Help),
            "-V" | "--version" => return Ok(Invocation::Version),
            "--log-file" => {
                let path = args.next().ok_or("Missing argument for --log-file")?;
                config.log_file = Some(PathBuf::from(path));
            }
            "--history" => {
                config.history_limit = number(&mut args, "--history")?;
            }
            "--max-line" => {
                config.max_line = number(&mut args, "--max-line")?;
                if config.max_line == 0 {
                    return Err("--max-line must be at least 1".to_string());
                }
            }
            "--" => {
                config.command.extend(args.by_ref());
                break;
            }
            _ if arg.starts_with('-') && arg.len() > 1 => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => {
                config.command.push(arg);
                config.command.extend(args.by_ref());
                break;
            }
        }
    }

    if config.command.is_empty() {
        return Err("Missing command to run".to_string());
    }
    Ok(Invocation::Run(config))
}

fn number(args: &mut impl Iterator<Item = String>, option: &str) -> Result<usize, String> {
    let value = args.next().ok_or_else(|| format!("Missing argument for {}", option))?;
    value
        .parse()
        .map_err(|_| format!("Invalid number for {}: {}", option, value))
}
