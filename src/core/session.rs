//! Child process session
//!
//! Spawns the child with its stdin on the console input buffer and its
//! output piped back to us. Helper threads block on the terminal input, on
//! both child pipes and on the child itself, and report everything over one
//! channel. The bridge's event loop is the only consumer.

use std::fmt;
use std::io::{self, Read};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};

use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("No command given")]
    EmptyCommand,

    #[error("Could not execute command `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("Child {0} pipe was not captured")]
    MissingPipe(Stream),

    #[error("Failed to start {stream} reader thread: {source}")]
    Thread {
        stream: Stream,
        #[source]
        source: io::Error,
    },
}

pub type Result<T> = std::result::Result<T, SessionError>;

/// The three byte streams the bridge multiplexes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stream {
    /// Local terminal input
    Input,
    /// Child stdout
    Primary,
    /// Child stderr
    Diagnostic,
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stream::Input => write!(f, "terminal input"),
            Stream::Primary => write!(f, "stdout"),
            Stream::Diagnostic => write!(f, "stderr"),
        }
    }
}

/// How the child ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChildExit {
    Code(i32),
    /// Killed by a signal. Only Unix hosts report this; a Windows exit
    /// status always carries a code, so conin never sees it there.
    Signal(i32),
}

impl ChildExit {
    /// Status for this process to exit with
    pub fn exit_code(self) -> i32 {
        match self {
            ChildExit::Code(code) => code,
            ChildExit::Signal(signal) => 128 + signal,
        }
    }
}

impl From<ExitStatus> for ChildExit {
    fn from(status: ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return ChildExit::Code(code);
        }

        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return ChildExit::Signal(signal);
            }
        }

        ChildExit::Code(1)
    }
}

/// Everything the event loop waits on
#[derive(Debug)]
pub enum BridgeEvent {
    /// A chunk read from one of the streams
    Data(Stream, Vec<u8>),
    /// Zero-length read; the stream produces nothing more
    Closed(Stream),
    ReadFailed(Stream, io::Error),
    ChildExited(ChildExit),
    WaitFailed(io::Error),
}

/// A running child plus the threads feeding its events
pub struct Session {
    pid: u32,
    events: Receiver<BridgeEvent>,
    #[allow(dead_code)]
    threads: Vec<JoinHandle<()>>,
}

impl Session {
    /// Spawn `command` with `stdin` as its input; terminal input is read from
    /// `input`
    pub fn spawn<R>(command: &[String], stdin: Stdio, input: R, chunk_size: usize) -> Result<Self>
    where
        R: Read + Send + 'static,
    {
        let (program, args) = command.split_first().ok_or(SessionError::EmptyCommand)?;

        let mut child = Command::new(program)
            .args(args)
            .stdin(stdin)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| SessionError::Spawn {
                command: command.join(" "),
                source,
            })?;

        let pid = child.id();
        info!("Spawned `{}` (pid {})", program, pid);

        let stdout = child.stdout.take().ok_or(SessionError::MissingPipe(Stream::Primary))?;
        let stderr = child.stderr.take().ok_or(SessionError::MissingPipe(Stream::Diagnostic))?;

        let (tx, rx) = mpsc::channel::<BridgeEvent>();
        let threads = vec![
            spawn_reader(Stream::Primary, stdout, chunk_size, tx.clone())?,
            spawn_reader(Stream::Diagnostic, stderr, chunk_size, tx.clone())?,
            spawn_reader(Stream::Input, input, chunk_size, tx.clone())?,
            spawn_waiter(child, tx)?,
        ];

        Ok(Self {
            pid,
            events: rx,
            threads,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn events(&self) -> &Receiver<BridgeEvent> {
        &self.events
    }
}

/// Forward chunks from `src` until it closes or fails
pub fn spawn_reader<R>(stream: Stream, mut src: R, chunk_size: usize, tx: Sender<BridgeEvent>) -> Result<JoinHandle<()>>
where
    R: Read + Send + 'static,
{
    thread::Builder::new()
        .name(format!("conin-{:?}", stream).to_lowercase())
        .spawn(move || {
            let mut buffer = vec![0u8; chunk_size.max(1)];

            loop {
                let event = match src.read(&mut buffer) {
                    Ok(0) => BridgeEvent::Closed(stream),
                    Ok(n) => BridgeEvent::Data(stream, buffer[..n].to_vec()),
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => BridgeEvent::ReadFailed(stream, e),
                };

                let last = !matches!(event, BridgeEvent::Data(..));
                if tx.send(event).is_err() || last {
                    break;
                }
            }
            debug!("{} reader finished", stream);
        })
        .map_err(|source| SessionError::Thread { stream, source })
}

/// Report the child's exit status
fn spawn_waiter(mut child: Child, tx: Sender<BridgeEvent>) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("conin-wait".to_string())
        .spawn(move || {
            let event = match child.wait() {
                Ok(status) => BridgeEvent::ChildExited(ChildExit::from(status)),
                Err(e) => BridgeEvent::WaitFailed(e),
            };
            let _ = tx.send(event);
        })
        .map_err(|source| SessionError::Thread {
            stream: Stream::Input,
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Cursor;

    #[test]
    fn test_reader_chunks_then_closes() {
        let (tx, rx) = mpsc::channel();
        let handle = spawn_reader(Stream::Primary, Cursor::new(b"hello world".to_vec()), 4, tx).unwrap();
        handle.join().unwrap();

        let mut data = Vec::new();
        let mut closed = false;
        for event in rx.try_iter() {
            match event {
                BridgeEvent::Data(Stream::Primary, chunk) => {
                    assert!(chunk.len() <= 4);
                    data.extend(chunk);
                }
                BridgeEvent::Closed(Stream::Primary) => closed = true,
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert_eq!(data, b"hello world");
        assert!(closed);
    }

    struct Broken;

    impl Read for Broken {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone"))
        }
    }

    #[test]
    fn test_reader_reports_failure() {
        let (tx, rx) = mpsc::channel();
        spawn_reader(Stream::Diagnostic, Broken, 16, tx).unwrap().join().unwrap();
        match rx.recv().unwrap() {
            BridgeEvent::ReadFailed(Stream::Diagnostic, e) => assert_eq!(e.kind(), io::ErrorKind::BrokenPipe),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_empty_command_is_rejected() {
        let result = Session::spawn(&[], Stdio::null(), io::empty(), 16);
        assert!(matches!(result, Err(SessionError::EmptyCommand)));
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(ChildExit::Code(3).exit_code(), 3);
        assert_eq!(ChildExit::Signal(15).exit_code(), 143);
    }

    #[cfg(unix)]
    #[test]
    fn test_signal_status() {
        use std::os::unix::process::ExitStatusExt;

        // Wait status of a child killed by SIGTERM
        assert_eq!(ChildExit::from(ExitStatus::from_raw(15)), ChildExit::Signal(15));
        assert_eq!(ChildExit::from(ExitStatus::from_raw(3 << 8)), ChildExit::Code(3));
    }

    #[cfg(windows)]
    #[test]
    fn test_windows_status_is_a_code() {
        use std::os::windows::process::ExitStatusExt;

        assert_eq!(ChildExit::from(ExitStatus::from_raw(0xC000013A)), ChildExit::Code(0xC000013Au32 as i32));
    }
}
