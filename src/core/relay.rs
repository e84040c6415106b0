//! Child output relay
//!
//! Copies child output to the local terminal unchanged and remembers the
//! trailing unterminated line, which is taken to be the child's prompt.

use std::borrow::Cow;
use std::io::{self, Write};

/// Default read size for child output and terminal input
pub const DEFAULT_CHUNK_SIZE: usize = 256;

/// Default prompt capacity in bytes
pub const DEFAULT_PROMPT_CAPACITY: usize = 256;

/// Bytes the child printed since its last line feed
///
/// Once an append would exceed the capacity, the buffer keeps its old
/// contents and ignores further appends until the next line feed.
#[derive(Debug, Clone)]
pub struct PromptBuffer {
    bytes: Vec<u8>,
    /// Length of the unterminated tail as seen on the wire, which may
    /// exceed what is stored
    seen: usize,
    capacity: usize,
}

impl PromptBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(capacity),
            seen: 0,
            capacity,
        }
    }

    #[allow(dead_code)]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn to_string_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.bytes)
    }

    #[allow(dead_code)]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    #[allow(dead_code)]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Start a new tail after a line feed
    fn replace(&mut self, tail: &[u8]) {
        self.bytes.clear();
        self.bytes.extend_from_slice(&tail[..tail.len().min(self.capacity)]);
        self.seen = tail.len();
    }

    /// Extend the tail with a chunk that contains no line feed
    fn append(&mut self, chunk: &[u8]) {
        self.seen = self.seen.saturating_add(chunk.len());
        if self.seen <= self.capacity {
            self.bytes.extend_from_slice(chunk);
        }
    }
}

impl Default for PromptBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_PROMPT_CAPACITY)
    }
}

/// Relay shared by the primary and diagnostic child streams
#[derive(Debug, Default)]
pub struct OutputRelay {
    prompt: PromptBuffer,
}

impl OutputRelay {
    pub fn new(prompt_capacity: usize) -> Self {
        Self {
            prompt: PromptBuffer::new(prompt_capacity),
        }
    }

    /// Forward one chunk read from a child stream and update the prompt
    pub fn relay<W: Write + ?Sized>(&mut self, chunk: &[u8], dst: &mut W) -> io::Result<()> {
        dst.write_all(chunk)?;
        dst.flush()?;
        self.track(chunk);
        Ok(())
    }

    pub fn prompt(&self) -> &PromptBuffer {
        &self.prompt
    }

    fn track(&mut self, chunk: &[u8]) {
        match chunk.iter().rposition(|&b| b == b'\n') {
            Some(i) => self.prompt.replace(&chunk[i + 1..]),
            None => self.prompt.append(chunk),
        }
    }
}
