//! Event loop
//!
//! Ties the pieces together. Each event from the session is handled to
//! completion before the next is taken:
//!
//! - child output goes through the relay to the matching local stream
//! - each terminal input byte goes to the line editor when the console is
//!   in cooked mode, or through the escape decoder straight into the console
//!   input queue otherwise
//!
//! The console mode is queried for every input byte, so the bridge follows
//! the child when it switches between line and raw input.

use std::io::{self, Write};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::console::{current_mode, ConsoleError, ConsoleInput, InputMode};
use super::escape::{Decoded, EscapeDecoder, Feed};
use super::keys::{KeyEncoder, KeyLayout, KeyPair};
use super::relay::{OutputRelay, PromptBuffer};
use super::session::{BridgeEvent, ChildExit, Stream};
use crate::ui::editor::{LineEngine, LineInput};

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error(transparent)]
    Console(#[from] ConsoleError),

    #[error("Failed to read {stream}: {source}")]
    Read {
        stream: Stream,
        #[source]
        source: io::Error,
    },

    #[error("Failed to write to the terminal: {0}")]
    Output(#[source] io::Error),

    #[error("Failed to wait for child process: {0}")]
    Wait(#[source] io::Error),

    #[error("Event channel closed before the child exited")]
    Disconnected,
}

pub type Result<T> = std::result::Result<T, BridgeError>;

/// How long to keep relaying output after the child exits; a grandchild may
/// hold the pipes open
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Why the event loop stopped
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BridgeExit {
    /// The child ended
    Child(ChildExit),
    /// Ctrl-D in the line editor, or the terminal input closed
    EndOfInput,
}

impl BridgeExit {
    pub fn exit_code(self) -> i32 {
        match self {
            BridgeExit::Child(exit) => exit.exit_code(),
            BridgeExit::EndOfInput => 1,
        }
    }
}

/// The translation engine between a terminal and a console
pub struct Bridge<C, L, E, O, D> {
    console: C,
    encoder: KeyEncoder<L>,
    decoder: EscapeDecoder,
    relay: OutputRelay,
    editor: E,
    stdout: O,
    stderr: D,
    last_mode: Option<InputMode>,
    /// Child output streams not yet closed
    open_outputs: Vec<Stream>,
    drain_timeout: Duration,
}

impl<C, L, E, O, D> Bridge<C, L, E, O, D>
where
    C: ConsoleInput,
    L: KeyLayout,
    E: LineEngine,
    O: Write,
    D: Write,
{
    pub fn new(console: C, layout: L, editor: E, stdout: O, stderr: D, prompt_capacity: usize) -> Self {
        Self {
            console,
            encoder: KeyEncoder::new(layout),
            decoder: EscapeDecoder::new(),
            relay: OutputRelay::new(prompt_capacity),
            editor,
            stdout,
            stderr,
            last_mode: None,
            open_outputs: vec![Stream::Primary, Stream::Diagnostic],
            drain_timeout: DRAIN_TIMEOUT,
        }
    }

    #[allow(dead_code)]
    pub fn prompt(&self) -> &PromptBuffer {
        self.relay.prompt()
    }

    #[allow(dead_code)]
    pub fn editor(&self) -> &E {
        &self.editor
    }

    /// Run until the child exits or input ends
    pub fn run(&mut self, events: &Receiver<BridgeEvent>) -> Result<BridgeExit> {
        loop {
            let event = events.recv().map_err(|_| BridgeError::Disconnected)?;
            if let Some(exit) = self.handle(event)? {
                if let BridgeExit::Child(_) = exit {
                    self.drain(events)?;
                }
                self.shutdown()?;
                return Ok(exit);
            }
        }
    }

    /// Handle one event; returns the exit reason once the loop should stop
    pub fn handle(&mut self, event: BridgeEvent) -> Result<Option<BridgeExit>> {
        match event {
            BridgeEvent::Data(Stream::Input, bytes) => {
                for byte in bytes {
                    if let Some(exit) = self.input(byte)? {
                        return Ok(Some(exit));
                    }
                }
                Ok(None)
            }
            BridgeEvent::Data(stream, chunk) => {
                self.output(stream, &chunk)?;
                Ok(None)
            }
            BridgeEvent::Closed(Stream::Input) => {
                info!("Terminal input closed");
                Ok(Some(BridgeExit::EndOfInput))
            }
            BridgeEvent::Closed(stream) => {
                info!("Child {} closed", stream);
                self.open_outputs.retain(|&s| s != stream);
                Ok(None)
            }
            BridgeEvent::ReadFailed(stream, source) => Err(BridgeError::Read { stream, source }),
            BridgeEvent::ChildExited(exit) => {
                info!("Child exited: {:?}", exit);
                Ok(Some(BridgeExit::Child(exit)))
            }
            BridgeEvent::WaitFailed(e) => Err(BridgeError::Wait(e)),
        }
    }

    fn output(&mut self, stream: Stream, chunk: &[u8]) -> Result<()> {
        let dst: &mut dyn Write = match stream {
            Stream::Diagnostic => &mut self.stderr,
            _ => &mut self.stdout,
        };
        self.relay.relay(chunk, dst).map_err(BridgeError::Output)
    }

    /// Relay the rest of the child's output once it has exited
    ///
    /// The exit can be reported before the readers have emptied the pipes, so
    /// keep going until both streams close or the timeout runs out.
    fn drain(&mut self, events: &Receiver<BridgeEvent>) -> Result<()> {
        let deadline = Instant::now() + self.drain_timeout;

        while !self.open_outputs.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match events.recv_timeout(remaining) {
                Ok(BridgeEvent::Data(stream @ (Stream::Primary | Stream::Diagnostic), chunk)) => {
                    self.output(stream, &chunk)?;
                }
                Ok(BridgeEvent::Closed(stream)) => {
                    self.open_outputs.retain(|&s| s != stream);
                }
                Ok(BridgeEvent::ReadFailed(stream @ (Stream::Primary | Stream::Diagnostic), source)) => {
                    return Err(BridgeError::Read { stream, source });
                }
                // Terminal input no longer has anywhere to go
                Ok(_) => {}
                Err(RecvTimeoutError::Timeout) => {
                    warn!("Child output still open {:?} after exit, not waiting", self.drain_timeout);
                    break;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        Ok(())
    }

    fn input(&mut self, byte: u8) -> Result<Option<BridgeExit>> {
        let mode = current_mode(&self.console)?;
        if self.last_mode != Some(mode) {
            debug!("Console input mode: {:?}", mode);
            self.last_mode = Some(mode);
        }

        match mode {
            InputMode::LineBuffered => self.edit(byte),
            InputMode::Raw => {
                self.raw(byte)?;
                Ok(None)
            }
        }
    }

    /// Raw mode: every decoded key goes straight to the console
    fn raw(&mut self, byte: u8) -> Result<()> {
        let pair = match self.decoder.feed(byte) {
            Feed::Pending => return Ok(()),
            Feed::Emit(Decoded::Char(ch)) => self.encoder.encode_char(ch),
            Feed::Emit(Decoded::Special(key)) => self.encoder.encode_special(key),
        };
        self.submit(&[pair])
    }

    /// Line mode: the editor assembles a line, then it is typed in
    fn edit(&mut self, byte: u8) -> Result<Option<BridgeExit>> {
        if self.editor.is_idle() {
            self.sync_prompt();
        }

        let input = self.editor.feed(byte, &mut self.stdout).map_err(BridgeError::Output)?;
        match input {
            None => Ok(None),
            Some(LineInput::EndOfInput) => {
                info!("End of input from line editor");
                Ok(Some(BridgeExit::EndOfInput))
            }
            Some(LineInput::Interrupt) => {
                let pair = self.encoder.encode_char('\x03');
                self.submit(&[pair])?;
                Ok(None)
            }
            Some(LineInput::Line(line)) => {
                if !line.is_empty() {
                    self.editor.add_history(&line);
                }
                let pairs = self.encoder.encode_line(&line);
                debug!("Submitting line of {} keystrokes", pairs.len());
                self.submit(&pairs)?;
                self.sync_prompt();
                Ok(None)
            }
        }
    }

    fn sync_prompt(&mut self) {
        let prompt = self.relay.prompt().to_string_lossy();
        self.editor.set_prompt(&prompt);
    }

    /// Enqueue pairs, each as its own two-record batch
    fn submit(&mut self, pairs: &[KeyPair]) -> Result<()> {
        for pair in pairs {
            self.console.write_input(pair).map_err(|e| {
                error!("Console input rejected: {}", e);
                BridgeError::Console(e)
            })?;
        }
        Ok(())
    }

    /// Leave the terminal tidy before the process ends
    pub fn shutdown(&mut self) -> Result<()> {
        if let Err(e) = self.editor.finish(&mut self.stdout) {
            warn!("Failed to finish line editor: {}", e);
        }
        self.stdout.flush().map_err(BridgeError::Output)?;
        self.stderr.flush().map_err(BridgeError::Output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::cell::{Cell, RefCell};
    use std::rc::Rc;
    use std::sync::mpsc;

    use crate::core::console::ConsoleMode;
    use crate::core::keys::{vk, KeyEvent, SpecialKey, UsLayout};
    use crate::ui::editor::Readline;

    /// Console double recording every batch written to it
    #[derive(Clone, Default)]
    struct RecordingConsole {
        mode: Rc<Cell<ConsoleMode>>,
        batches: Rc<RefCell<Vec<Vec<KeyEvent>>>>,
        fail_writes: bool,
        fail_mode: bool,
    }

    impl RecordingConsole {
        fn with_mode(mode: ConsoleMode) -> Self {
            let console = Self::default();
            console.mode.set(mode);
            console
        }

        fn typed(&self) -> String {
            self.batches.borrow().iter().filter_map(|b| b[0].character).collect()
        }
    }

    impl ConsoleInput for RecordingConsole {
        fn mode(&self) -> std::result::Result<ConsoleMode, ConsoleError> {
            if self.fail_mode {
                return Err(ConsoleError::ModeQuery(io::Error::new(io::ErrorKind::Other, "gone")));
            }
            Ok(self.mode.get())
        }

        fn write_input(&mut self, events: &[KeyEvent]) -> std::result::Result<(), ConsoleError> {
            if self.fail_writes {
                return Err(ConsoleError::Write(io::Error::new(io::ErrorKind::Other, "queue full")));
            }
            self.batches.borrow_mut().push(events.to_vec());
            Ok(())
        }
    }

    type TestBridge = Bridge<RecordingConsole, UsLayout, Readline, Vec<u8>, Vec<u8>>;

    fn new_bridge(console: &RecordingConsole) -> TestBridge {
        let editor = Readline::default().with_width(80);
        Bridge::new(console.clone(), UsLayout, editor, Vec::new(), Vec::new(), 256)
    }

    fn input(bridge: &mut TestBridge, bytes: &[u8]) -> Option<BridgeExit> {
        bridge.handle(BridgeEvent::Data(Stream::Input, bytes.to_vec())).unwrap()
    }

    fn child_output(bridge: &mut TestBridge, stream: Stream, bytes: &[u8]) {
        assert_eq!(bridge.handle(BridgeEvent::Data(stream, bytes.to_vec())).unwrap(), None);
    }

    fn assert_pairs(batches: &[Vec<KeyEvent>]) {
        for batch in batches {
            assert_eq!(batch.len(), 2);
            assert!(batch[0].pressed && !batch[1].pressed);
            assert_eq!(KeyEvent { pressed: true, ..batch[1] }, batch[0]);
        }
    }

    #[test]
    fn test_raw_printable_characters() {
        let console = RecordingConsole::with_mode(ConsoleMode::PROCESSED_INPUT);
        let mut bridge = new_bridge(&console);

        for byte in 0x20u8..0x7f {
            let before = console.batches.borrow().len();
            input(&mut bridge, &[byte]);
            let batches = console.batches.borrow();
            assert_eq!(batches.len(), before + 1);

            let stroke = UsLayout.translate(byte as char).unwrap();
            let down = batches[before][0];
            assert_eq!(down.character, Some(byte as char));
            assert_eq!(down.virtual_key, stroke.virtual_key);
            assert_eq!(down.modifiers, stroke.modifiers);
        }
        assert_pairs(&console.batches.borrow());
        // Raw mode never echoes
        assert!(bridge.stdout.is_empty());
    }

    #[test]
    fn test_raw_cursor_up() {
        let console = RecordingConsole::with_mode(ConsoleMode::empty());
        let mut bridge = new_bridge(&console);

        input(&mut bridge, b"\x1b");
        input(&mut bridge, b"[");
        assert!(console.batches.borrow().is_empty());

        input(&mut bridge, b"A");
        let batches = console.batches.borrow();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0][0].virtual_key, vk::UP);
        assert_eq!(batches[0][0].character, None);
        assert_pairs(&batches);
    }

    #[test]
    fn test_raw_unknown_sequence_is_dropped() {
        let console = RecordingConsole::with_mode(ConsoleMode::empty());
        let mut bridge = new_bridge(&console);

        input(&mut bridge, b"\x1b[Z");
        assert!(console.batches.borrow().is_empty());

        input(&mut bridge, b"\x1b[H");
        let batches = console.batches.borrow();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0][0].virtual_key, SpecialKey::Home.virtual_key());
    }

    #[test]
    fn test_raw_remaps_newline_and_delete() {
        let console = RecordingConsole::with_mode(ConsoleMode::empty());
        let mut bridge = new_bridge(&console);

        input(&mut bridge, b"\n\x7f");
        let batches = console.batches.borrow();
        assert_eq!(batches[0][0].virtual_key, vk::RETURN);
        assert_eq!(batches[0][0].character, Some('\r'));
        assert_eq!(batches[1][0].virtual_key, vk::BACK);
        assert_eq!(batches[1][0].character, Some('\x08'));
    }

    #[test]
    fn test_line_mode_submits_whole_line() {
        let console = RecordingConsole::with_mode(ConsoleMode::COOKED);
        let mut bridge = new_bridge(&console);

        input(&mut bridge, b"ls -la");
        assert!(console.batches.borrow().is_empty());

        input(&mut bridge, b"\r");
        let batches = console.batches.borrow();
        assert_eq!(batches.len(), 7);
        assert_pairs(&batches);
        drop(batches);
        assert_eq!(console.typed(), "ls -la\r");

        // The editor echoed locally
        assert!(String::from_utf8_lossy(&bridge.stdout).contains("ls -la"));
    }

    #[test]
    fn test_prompt_is_reseeded_from_child_output() {
        let console = RecordingConsole::with_mode(ConsoleMode::COOKED);
        let mut bridge = new_bridge(&console);

        child_output(&mut bridge, Stream::Primary, b"Welcome\r\npassword: ");
        assert_eq!(bridge.prompt().as_bytes(), b"password: ");

        input(&mut bridge, b"s");
        assert_eq!(bridge.editor().prompt(), "password: ");
        assert!(bridge.stdout.ends_with(b"\rpassword: s\x1b[J"));

        input(&mut bridge, b"3cret\r");
        assert_eq!(console.typed(), "s3cret\r");
    }

    #[test]
    fn test_prompt_set_after_submission() {
        let console = RecordingConsole::with_mode(ConsoleMode::COOKED);
        let mut bridge = new_bridge(&console);

        child_output(&mut bridge, Stream::Primary, b"C:\\> ");
        input(&mut bridge, b"cd temp");
        // Output arrives while the line is being edited
        child_output(&mut bridge, Stream::Diagnostic, b"\nC:\\temp> ");
        assert_eq!(bridge.editor().prompt(), "C:\\> ");

        input(&mut bridge, b"\r");
        assert_eq!(bridge.editor().prompt(), "C:\\temp> ");
        assert_eq!(bridge.stderr, b"\nC:\\temp> ");
    }

    #[test]
    fn test_mode_switch_between_bytes() {
        let console = RecordingConsole::with_mode(ConsoleMode::COOKED);
        let mut bridge = new_bridge(&console);

        input(&mut bridge, b"y");
        assert!(console.batches.borrow().is_empty());

        console.mode.set(ConsoleMode::PROCESSED_INPUT);
        input(&mut bridge, b"q");
        assert_eq!(console.typed(), "q");
    }

    #[test]
    fn test_line_mode_interrupt_forwards_ctrl_c() {
        let console = RecordingConsole::with_mode(ConsoleMode::COOKED);
        let mut bridge = new_bridge(&console);

        input(&mut bridge, b"abc\x03");
        let batches = console.batches.borrow();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0][0].character, Some('\x03'));
        assert_eq!(batches[0][0].modifiers, crate::core::keys::Modifiers::CTRL);
    }

    #[test]
    fn test_end_of_input() {
        let console = RecordingConsole::with_mode(ConsoleMode::COOKED);
        let mut bridge = new_bridge(&console);
        assert_eq!(input(&mut bridge, b"\x04"), Some(BridgeExit::EndOfInput));

        let mut bridge = new_bridge(&console);
        assert_eq!(bridge.handle(BridgeEvent::Closed(Stream::Input)).unwrap(), Some(BridgeExit::EndOfInput));
        assert_eq!(BridgeExit::EndOfInput.exit_code(), 1);
    }

    #[test]
    fn test_history_records_non_empty_lines() {
        let console = RecordingConsole::with_mode(ConsoleMode::COOKED);
        let mut bridge = new_bridge(&console);

        input(&mut bridge, b"dir\r\r");
        // Up recalls "dir", not the empty line
        input(&mut bridge, b"\x1b[A\r");
        assert_eq!(console.typed(), "dir\r\rdir\r");
    }

    #[test]
    fn test_enqueue_failure_is_fatal() {
        let mut console = RecordingConsole::with_mode(ConsoleMode::empty());
        console.fail_writes = true;
        let mut bridge = new_bridge(&console);

        let result = bridge.handle(BridgeEvent::Data(Stream::Input, b"x".to_vec()));
        assert!(matches!(result, Err(BridgeError::Console(ConsoleError::Write(_)))));
    }

    #[test]
    fn test_mode_query_failure_is_fatal() {
        let mut console = RecordingConsole::with_mode(ConsoleMode::COOKED);
        console.fail_mode = true;
        let mut bridge = new_bridge(&console);

        let result = bridge.handle(BridgeEvent::Data(Stream::Input, b"x".to_vec()));
        assert!(matches!(result, Err(BridgeError::Console(ConsoleError::ModeQuery(_)))));
        assert!(console.batches.borrow().is_empty());
    }

    #[test]
    fn test_output_streams_are_relayed_to_matching_destination() {
        let console = RecordingConsole::default();
        let mut bridge = new_bridge(&console);

        child_output(&mut bridge, Stream::Primary, b"out\n");
        child_output(&mut bridge, Stream::Diagnostic, b"err\n");
        assert_eq!(bridge.stdout, b"out\n");
        assert_eq!(bridge.stderr, b"err\n");

        assert_eq!(bridge.handle(BridgeEvent::Closed(Stream::Primary)).unwrap(), None);
    }

    #[test]
    fn test_read_failure_is_fatal() {
        let console = RecordingConsole::default();
        let mut bridge = new_bridge(&console);
        let event = BridgeEvent::ReadFailed(Stream::Input, io::Error::new(io::ErrorKind::Other, "boom"));
        assert!(matches!(bridge.handle(event), Err(BridgeError::Read { stream: Stream::Input, .. })));
    }

    #[test]
    fn test_run_relays_pending_output_on_child_exit() {
        let console = RecordingConsole::with_mode(ConsoleMode::COOKED);
        let mut bridge = new_bridge(&console);
        let (tx, rx) = mpsc::channel();

        tx.send(BridgeEvent::Data(Stream::Input, b"half".to_vec())).unwrap();
        tx.send(BridgeEvent::ChildExited(ChildExit::Code(7))).unwrap();
        tx.send(BridgeEvent::Data(Stream::Primary, b"bye\n".to_vec())).unwrap();
        tx.send(BridgeEvent::Closed(Stream::Primary)).unwrap();
        tx.send(BridgeEvent::Closed(Stream::Diagnostic)).unwrap();

        let exit = bridge.run(&rx).unwrap();
        assert_eq!(exit, BridgeExit::Child(ChildExit::Code(7)));
        assert_eq!(exit.exit_code(), 7);
        // Editor line finished, then the late output
        assert!(bridge.stdout.ends_with(b"bye\n\r\n"));
        assert!(console.batches.borrow().is_empty());
    }

    #[test]
    fn test_run_waits_for_output_reported_after_exit() {
        let console = RecordingConsole::default();
        let mut bridge = new_bridge(&console);
        let (tx, rx) = mpsc::channel();

        tx.send(BridgeEvent::Data(Stream::Primary, b"line0\n".to_vec())).unwrap();
        tx.send(BridgeEvent::ChildExited(ChildExit::Code(0))).unwrap();

        // Readers still busy with the pipes when the exit comes in
        let readers = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            tx.send(BridgeEvent::Data(Stream::Diagnostic, b"warn\n".to_vec())).unwrap();
            tx.send(BridgeEvent::Closed(Stream::Diagnostic)).unwrap();
            tx.send(BridgeEvent::Data(Stream::Input, b"ignored".to_vec())).unwrap();
            tx.send(BridgeEvent::Data(Stream::Primary, b"line199\n".to_vec())).unwrap();
            tx.send(BridgeEvent::Closed(Stream::Primary)).unwrap();
            tx
        });

        assert_eq!(bridge.run(&rx).unwrap(), BridgeExit::Child(ChildExit::Code(0)));
        assert_eq!(bridge.stdout, b"line0\nline199\n");
        assert_eq!(bridge.stderr, b"warn\n");
        assert!(console.batches.borrow().is_empty());
        readers.join().unwrap();
    }

    #[test]
    fn test_drain_skips_streams_closed_before_exit() {
        let console = RecordingConsole::default();
        let mut bridge = new_bridge(&console);
        let (tx, rx) = mpsc::channel();

        tx.send(BridgeEvent::Closed(Stream::Diagnostic)).unwrap();
        tx.send(BridgeEvent::ChildExited(ChildExit::Code(2))).unwrap();
        tx.send(BridgeEvent::Data(Stream::Primary, b"done\n".to_vec())).unwrap();
        tx.send(BridgeEvent::Closed(Stream::Primary)).unwrap();

        assert_eq!(bridge.run(&rx).unwrap().exit_code(), 2);
        assert_eq!(bridge.stdout, b"done\n");
        drop(tx);
    }

    #[test]
    fn test_drain_gives_up_on_pipes_held_open() {
        let console = RecordingConsole::default();
        let mut bridge = new_bridge(&console);
        bridge.drain_timeout = Duration::from_millis(20);
        let (tx, rx) = mpsc::channel();

        tx.send(BridgeEvent::ChildExited(ChildExit::Code(0))).unwrap();
        tx.send(BridgeEvent::Data(Stream::Primary, b"partial".to_vec())).unwrap();

        assert_eq!(bridge.run(&rx).unwrap(), BridgeExit::Child(ChildExit::Code(0)));
        assert_eq!(bridge.stdout, b"partial");
        drop(tx);
    }

    #[test]
    fn test_run_fails_when_channel_closes() {
        let console = RecordingConsole::default();
        let mut bridge = new_bridge(&console);
        let (tx, rx) = mpsc::channel::<BridgeEvent>();
        drop(tx);
        assert!(matches!(bridge.run(&rx), Err(BridgeError::Disconnected)));
    }
}
