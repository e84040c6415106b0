//! Console input buffer access
//!
//! The child reads its keyboard input from the console input buffer. This
//! module queries the buffer's input mode and submits key records to it.

use std::io;

use bitflags::bitflags;
use thiserror::Error;

use super::keys::KeyEvent;

#[derive(Error, Debug)]
pub enum ConsoleError {
    #[error("Could not open console input buffer: {0}")]
    Open(#[source] io::Error),

    #[error("Failed to query console mode: {0}")]
    ModeQuery(#[source] io::Error),

    #[error("Failed to write console input: {0}")]
    Write(#[source] io::Error),

    #[error("Console accepted {written} of {expected} input records")]
    ShortWrite { written: usize, expected: usize },

    #[cfg(not(windows))]
    #[error("Console input buffer is only available on Windows")]
    Unsupported,
}

pub type Result<T> = std::result::Result<T, ConsoleError>;

bitflags! {
    /// Console input mode flags
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct ConsoleMode: u32 {
        const PROCESSED_INPUT = 0x0001;
        const LINE_INPUT = 0x0002;
        const ECHO_INPUT = 0x0004;
        const WINDOW_INPUT = 0x0008;
        const MOUSE_INPUT = 0x0010;
        const INSERT_MODE = 0x0020;
        const QUICK_EDIT_MODE = 0x0040;
        const EXTENDED_FLAGS = 0x0080;
        const VIRTUAL_TERMINAL_INPUT = 0x0200;

        /// Cooked input: the reader wants whole, echoed lines
        const COOKED = Self::PROCESSED_INPUT.bits() | Self::LINE_INPUT.bits() | Self::ECHO_INPUT.bits();
    }
}

/// How the child currently wants its input delivered
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InputMode {
    /// Assemble whole lines locally, then type them in
    LineBuffered,
    /// Forward every keystroke as it arrives
    Raw,
}

impl InputMode {
    pub fn from_console_mode(mode: ConsoleMode) -> Self {
        if mode.contains(ConsoleMode::COOKED) {
            InputMode::LineBuffered
        } else {
            InputMode::Raw
        }
    }
}

/// A console input buffer
pub trait ConsoleInput {
    /// Current input mode flags
    fn mode(&self) -> Result<ConsoleMode>;

    /// Append key records to the input queue as one batch
    fn write_input(&mut self, events: &[KeyEvent]) -> Result<()>;
}

/// Query the input mode afresh; the child may switch it at any time
pub fn current_mode<C: ConsoleInput + ?Sized>(console: &C) -> Result<InputMode> {
    console.mode().map(InputMode::from_console_mode)
}

#[cfg(windows)]
pub use self::windows_console::{stdin_is_console, Conin};

#[cfg(windows)]
mod windows_console {
    use std::fs::{File, OpenOptions};
    use std::io;
    use std::os::windows::io::AsRawHandle;

    use tracing::{debug, info};
    use windows::Win32::Foundation::{BOOL, HANDLE};
    use windows::Win32::System::Console::{
        AllocConsole, GetConsoleMode, WriteConsoleInputW, CONSOLE_MODE, INPUT_RECORD, INPUT_RECORD_0,
        KEY_EVENT, KEY_EVENT_RECORD, KEY_EVENT_RECORD_0,
    };

    use super::{ConsoleError, ConsoleInput, ConsoleMode, KeyEvent, Result};

    fn os_error(e: windows::core::Error) -> io::Error {
        io::Error::from(e)
    }

    /// The `CONIN$` input buffer of this process's console
    pub struct Conin {
        file: File,
    }

    impl Conin {
        /// Open the console input buffer, allocating a console if needed
        pub fn open() -> Result<Self> {
            let file = match Self::open_buffer() {
                Ok(file) => file,
                Err(e) => {
                    debug!("CONIN$ unavailable ({}), allocating a console", e);
                    unsafe { AllocConsole() }.map_err(|e| ConsoleError::Open(os_error(e)))?;
                    info!("Allocated a new console");
                    Self::open_buffer().map_err(ConsoleError::Open)?
                }
            };
            Ok(Self { file })
        }

        fn open_buffer() -> io::Result<File> {
            OpenOptions::new().read(true).write(true).open("CONIN$")
        }

        /// A second handle to the same buffer, for the child's stdin
        pub fn child_stdin(&self) -> Result<File> {
            self.file.try_clone().map_err(ConsoleError::Open)
        }

        fn handle(&self) -> HANDLE {
            HANDLE(self.file.as_raw_handle())
        }
    }

    impl ConsoleInput for Conin {
        fn mode(&self) -> Result<ConsoleMode> {
            let mut mode = CONSOLE_MODE(0);
            unsafe { GetConsoleMode(self.handle(), &mut mode) }
                .map_err(|e| ConsoleError::ModeQuery(os_error(e)))?;
            Ok(ConsoleMode::from_bits_retain(mode.0))
        }

        fn write_input(&mut self, events: &[KeyEvent]) -> Result<()> {
            let records: Vec<INPUT_RECORD> = events.iter().map(input_record).collect();
            let mut written: u32 = 0;
            unsafe { WriteConsoleInputW(self.handle(), &records, &mut written) }
                .map_err(|e| ConsoleError::Write(os_error(e)))?;

            if written as usize != records.len() {
                return Err(ConsoleError::ShortWrite {
                    written: written as usize,
                    expected: records.len(),
                });
            }
            Ok(())
        }
    }

    fn input_record(event: &KeyEvent) -> INPUT_RECORD {
        let unit = event
            .character
            .and_then(|ch| u16::try_from(u32::from(ch)).ok())
            .unwrap_or(0);

        INPUT_RECORD {
            EventType: KEY_EVENT as u16,
            Event: INPUT_RECORD_0 {
                KeyEvent: KEY_EVENT_RECORD {
                    bKeyDown: BOOL::from(event.pressed),
                    wRepeatCount: 1,
                    wVirtualKeyCode: event.virtual_key,
                    wVirtualScanCode: event.scan_code,
                    uChar: KEY_EVENT_RECORD_0 { UnicodeChar: unit },
                    dwControlKeyState: event.modifiers.control_key_state(),
                },
            },
        }
    }

    /// True if our own stdin is a console rather than a terminal pipe
    pub fn stdin_is_console() -> bool {
        let stdin = io::stdin();
        let mut mode = CONSOLE_MODE(0);
        unsafe { GetConsoleMode(HANDLE(stdin.as_raw_handle()), &mut mode) }.is_ok()
    }
}
