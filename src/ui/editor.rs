//! Line editor
//!
//! A small readline-style editor driven one byte at a time. It draws onto
//! the local terminal and hands back whole lines for the console.
//!
//! The editor never knows what the child printed; the bridge keeps its
//! prompt in step with the child's latest unterminated output so redraws
//! reproduce what is already on screen.
//!
//! Prompt and line may wrap over several terminal rows. The editor keeps
//! track of the row the cursor is on, relative to the row the prompt starts
//! on, and climbs back there before each redraw.

use std::env;
use std::io::{self, Write};
use std::mem;

use crossterm::cursor::{MoveDown, MoveLeft, MoveRight, MoveTo, MoveUp};
use crossterm::terminal::{self, Clear, ClearType};
use crossterm::Command;
use unicode_width::UnicodeWidthChar;

use crate::core::escape::{Decoded, EscapeDecoder, Feed};
use crate::core::keys::SpecialKey;
use crate::history::History;

/// Default maximum line length in characters
pub const DEFAULT_MAX_LINE: usize = 4096;

const BELL: &[u8] = b"\x07";

/// Columns assumed when the terminal width is unknown
const DEFAULT_COLUMNS: usize = 80;

/// Tabs are drawn as spaces up to the next multiple of this
const TAB_STOP: usize = 8;

/// What a completed edit produced
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LineInput {
    /// A line submitted with Enter (without the terminator)
    Line(String),
    /// Ctrl-D on an empty line
    EndOfInput,
    /// Ctrl-C; the line being edited was discarded
    Interrupt,
}

/// A byte-driven line editing engine
pub trait LineEngine {
    /// Feed one terminal byte, drawing to `out`
    fn feed(&mut self, byte: u8, out: &mut dyn Write) -> io::Result<Option<LineInput>>;

    /// Replace the prompt used for redraws
    fn set_prompt(&mut self, prompt: &str);

    /// Record a submitted line
    fn add_history(&mut self, line: &str);

    /// True between lines: nothing typed, not browsing history
    fn is_idle(&self) -> bool;

    /// Leave the terminal on a fresh line
    fn finish(&mut self, out: &mut dyn Write) -> io::Result<()>;
}

/// What a key did to the line
enum Edit {
    /// Line or cursor changed; redraw
    Changed,
    /// Key had no effect; ring the bell
    Refused,
    /// Complete the current edit
    Done(LineInput),
}

/// Readline-style editor
#[derive(Debug)]
pub struct Readline {
    prompt: String,
    line: Vec<char>,
    /// Cursor position in characters
    cursor: usize,
    history: History,
    /// History entry being shown, if browsing
    browse: Option<usize>,
    /// Line in progress when browsing started
    stash: Vec<char>,
    decoder: EscapeDecoder,
    max_line: usize,
    /// Fixed terminal width; queried on every redraw when unset
    width: Option<u16>,
    /// Row of the cursor below the prompt's first row
    cursor_row: usize,
    /// Row the drawn line ends on
    rows: usize,
}

impl Default for Readline {
    fn default() -> Self {
        Self::new(History::default(), DEFAULT_MAX_LINE)
    }
}

impl Readline {
    pub fn new(history: History, max_line: usize) -> Self {
        Self {
            prompt: String::new(),
            line: Vec::new(),
            cursor: 0,
            history,
            browse: None,
            stash: Vec::new(),
            decoder: EscapeDecoder::new(),
            max_line,
            width: None,
            cursor_row: 0,
            rows: 0,
        }
    }

    /// Draw for a terminal of `columns` instead of asking the terminal
    #[allow(dead_code)]
    pub fn with_width(mut self, columns: u16) -> Self {
        self.width = Some(columns);
        self
    }

    #[allow(dead_code)]
    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    /// Current contents of the line
    pub fn line(&self) -> String {
        self.line.iter().collect()
    }

    #[allow(dead_code)]
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    fn key(&mut self, ch: char) -> Edit {
        match ch {
            '\r' => Edit::Done(LineInput::Line(self.take_line())),
            '\x08' => self.backspace(),
            '\x01' => self.move_to(0),
            '\x02' => self.move_to(self.cursor.wrapping_sub(1)),
            '\x03' => {
                self.take_line();
                Edit::Done(LineInput::Interrupt)
            }
            '\x04' if self.line.is_empty() => Edit::Done(LineInput::EndOfInput),
            '\x04' => self.delete(),
            '\x05' => self.move_to(self.line.len()),
            '\x06' => self.move_to(self.cursor + 1),
            '\x0b' => self.kill(self.cursor..self.line.len()),
            '\x0e' => self.history_next(),
            '\x10' => self.history_prev(),
            '\x15' => self.kill(0..self.cursor),
            '\x17' => self.kill(self.word_start()..self.cursor),
            '\t' => self.insert('\t'),
            ch if ch.is_control() => Edit::Refused,
            ch => self.insert(ch),
        }
    }

    fn special(&mut self, key: SpecialKey) -> Edit {
        match key {
            SpecialKey::Left => self.move_to(self.cursor.wrapping_sub(1)),
            SpecialKey::Right => self.move_to(self.cursor + 1),
            SpecialKey::Home => self.move_to(0),
            SpecialKey::End => self.move_to(self.line.len()),
            SpecialKey::Up => self.history_prev(),
            SpecialKey::Down => self.history_next(),
        }
    }

    fn insert(&mut self, ch: char) -> Edit {
        if self.line.len() >= self.max_line {
            return Edit::Refused;
        }
        self.line.insert(self.cursor, ch);
        self.cursor += 1;
        Edit::Changed
    }

    fn backspace(&mut self) -> Edit {
        if self.cursor == 0 {
            return Edit::Refused;
        }
        self.cursor -= 1;
        self.line.remove(self.cursor);
        Edit::Changed
    }

    fn delete(&mut self) -> Edit {
        if self.cursor >= self.line.len() {
            return Edit::Refused;
        }
        self.line.remove(self.cursor);
        Edit::Changed
    }

    /// Move the cursor; out-of-range targets are refused
    fn move_to(&mut self, target: usize) -> Edit {
        if target > self.line.len() || target == self.cursor {
            return Edit::Refused;
        }
        self.cursor = target;
        Edit::Changed
    }

    fn kill(&mut self, range: std::ops::Range<usize>) -> Edit {
        if range.is_empty() {
            return Edit::Refused;
        }
        self.cursor = range.start;
        self.line.drain(range);
        Edit::Changed
    }

    /// Start of the word before the cursor, skipping trailing spaces
    fn word_start(&self) -> usize {
        let before = &self.line[..self.cursor];
        let end = before.iter().rposition(|c| !c.is_whitespace()).map_or(0, |i| i + 1);
        before[..end].iter().rposition(|c| c.is_whitespace()).map_or(0, |i| i + 1)
    }

    fn history_prev(&mut self) -> Edit {
        let index = match self.browse {
            None => self.history.len().checked_sub(1),
            Some(i) => i.checked_sub(1),
        };
        let Some(index) = index else {
            return Edit::Refused;
        };

        if self.browse.is_none() {
            self.stash = mem::take(&mut self.line);
        }
        self.show_history(index);
        Edit::Changed
    }

    fn history_next(&mut self) -> Edit {
        let Some(current) = self.browse else {
            return Edit::Refused;
        };

        if current + 1 < self.history.len() {
            self.show_history(current + 1);
        } else {
            self.browse = None;
            self.line = mem::take(&mut self.stash);
            self.cursor = self.line.len();
        }
        Edit::Changed
    }

    fn show_history(&mut self, index: usize) {
        self.browse = Some(index);
        self.line = self.history.get(index).unwrap_or_default().chars().collect();
        self.cursor = self.line.len();
    }

    /// Reset for the next line, returning the current one
    fn take_line(&mut self) -> String {
        let line = self.line();
        self.line.clear();
        self.stash.clear();
        self.cursor = 0;
        self.browse = None;
        line
    }

    /// Terminal width: `COLUMNS` from a POSIX shell, then the console size
    fn columns(&self) -> usize {
        let columns = self.width.or_else(|| {
            env::var("COLUMNS")
                .ok()
                .and_then(|value| value.trim().parse().ok())
                .or_else(|| terminal::size().ok().map(|(columns, _)| columns))
        });
        columns.filter(|&c| c > 0).map_or(DEFAULT_COLUMNS, usize::from)
    }

    /// Redraw prompt and line, leaving the cursor in place
    fn redraw(&mut self, out: &mut dyn Write) -> io::Result<()> {
        let columns = self.columns();
        let mut seq = String::new();
        if self.cursor_row > 0 {
            ansi(MoveUp(cells(self.cursor_row)), &mut seq)?;
        }
        seq.push('\r');
        seq.push_str(&self.prompt);

        let mut end = display_width(&self.prompt);
        let mut at_cursor = end;
        for (i, &ch) in self.line.iter().enumerate() {
            if i == self.cursor {
                at_cursor = end;
            }
            end += push_char(&mut seq, ch, end);
        }
        if self.cursor >= self.line.len() {
            at_cursor = end;
        }

        // A full last row leaves the terminal waiting to wrap; wrap now
        if end > 0 && end % columns == 0 {
            seq.push_str("\r\n");
        }
        ansi(Clear(ClearType::FromCursorDown), &mut seq)?;

        let (end_row, end_col) = (end / columns, end % columns);
        let (row, col) = (at_cursor / columns, at_cursor % columns);
        if end_row > row {
            ansi(MoveUp(cells(end_row - row)), &mut seq)?;
        }
        if end_col > col {
            ansi(MoveLeft(cells(end_col - col)), &mut seq)?;
        } else if col > end_col {
            ansi(MoveRight(cells(col - end_col)), &mut seq)?;
        }
        self.cursor_row = row;
        self.rows = end_row;

        out.write_all(seq.as_bytes())?;
        out.flush()
    }

    /// Move the cursor under the last drawn row; the next line starts fresh
    fn leave_line(&mut self, seq: &mut String) -> io::Result<()> {
        if self.rows > self.cursor_row {
            ansi(MoveDown(cells(self.rows - self.cursor_row)), seq)?;
        }
        self.cursor_row = 0;
        self.rows = 0;
        Ok(())
    }

    fn clear_screen(&mut self, out: &mut dyn Write) -> io::Result<()> {
        let mut seq = String::new();
        ansi(Clear(ClearType::All), &mut seq)?;
        ansi(MoveTo(0, 0), &mut seq)?;
        out.write_all(seq.as_bytes())?;
        self.cursor_row = 0;
        self.redraw(out)
    }
}

/// Draw one line character at `column`, returning the columns it takes
fn push_char(seq: &mut String, ch: char, column: usize) -> usize {
    if ch == '\t' {
        let width = TAB_STOP - column % TAB_STOP;
        seq.extend(std::iter::repeat(' ').take(width));
        width
    } else {
        seq.push(ch);
        ch.width().unwrap_or(0)
    }
}

/// Columns taken by `text`, not counting control sequences such as colours
fn display_width(text: &str) -> usize {
    let mut width = 0;
    let mut chars = text.chars();
    while let Some(ch) = chars.next() {
        if ch == '\x1b' {
            if chars.next() == Some('[') {
                let _ = chars.find(|c| ('\x40'..='\x7e').contains(c));
            }
            continue;
        }
        width += ch.width().unwrap_or(0);
    }
    width
}

fn cells(n: usize) -> u16 {
    u16::try_from(n).unwrap_or(u16::MAX)
}

fn ansi(command: impl Command, seq: &mut String) -> io::Result<()> {
    command
        .write_ansi(seq)
        .map_err(|_| io::Error::new(io::ErrorKind::Other, "failed to format control sequence"))
}

impl LineEngine for Readline {
    fn feed(&mut self, byte: u8, out: &mut dyn Write) -> io::Result<Option<LineInput>> {
        let edit = match self.decoder.feed(byte) {
            Feed::Pending => return Ok(None),
            Feed::Emit(Decoded::Special(key)) => self.special(key),
            Feed::Emit(Decoded::Char('\x0c')) => {
                self.clear_screen(out)?;
                return Ok(None);
            }
            Feed::Emit(Decoded::Char(ch)) => self.key(ch),
        };

        match edit {
            Edit::Changed => {
                self.redraw(out)?;
                Ok(None)
            }
            Edit::Refused => {
                out.write_all(BELL)?;
                out.flush()?;
                Ok(None)
            }
            Edit::Done(input) => {
                let mut seq = String::new();
                self.leave_line(&mut seq)?;
                match &input {
                    LineInput::Line(_) => seq.push_str("\r\n"),
                    LineInput::Interrupt => seq.push_str("^C\r\n"),
                    LineInput::EndOfInput => {}
                }
                out.write_all(seq.as_bytes())?;
                out.flush()?;
                Ok(Some(input))
            }
        }
    }

    fn set_prompt(&mut self, prompt: &str) {
        if self.prompt != prompt {
            self.prompt.clear();
            self.prompt.push_str(prompt);
        }
        if self.line.is_empty() && self.browse.is_none() {
            // The child left the cursor just after its prompt
            self.cursor_row = display_width(&self.prompt).saturating_sub(1) / self.columns();
            self.rows = self.cursor_row;
        }
    }

    fn add_history(&mut self, line: &str) {
        self.history.add(line);
    }

    fn is_idle(&self) -> bool {
        self.line.is_empty() && self.browse.is_none() && self.decoder.is_idle()
    }

    fn finish(&mut self, out: &mut dyn Write) -> io::Result<()> {
        if !self.line.is_empty() {
            self.take_line();
            let mut seq = String::new();
            self.leave_line(&mut seq)?;
            seq.push_str("\r\n");
            out.write_all(seq.as_bytes())?;
        }
        out.flush()
    }
}
