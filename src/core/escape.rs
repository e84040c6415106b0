//! Terminal input decoder
//!
//! Turns raw terminal bytes into characters and cursor keys. Only the short
//! `ESC [ <final>` form is understood; anything else starting with ESC is
//! swallowed.

use tracing::trace;

use super::keys::SpecialKey;

/// Decoder state machine
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DecoderState {
    #[default]
    Normal,
    SawEscape,
    SawCsi,
}

/// A fully decoded input unit
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decoded {
    Char(char),
    Special(SpecialKey),
}

/// Outcome of feeding one byte
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Feed {
    Emit(Decoded),
    Pending,
}

/// Byte-at-a-time decoder for terminal input
#[derive(Debug, Default)]
pub struct EscapeDecoder {
    state: DecoderState,
    utf8: [u8; 4],
    utf8_len: usize,
    utf8_need: usize,
}

impl EscapeDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    #[allow(dead_code)]
    pub fn state(&self) -> DecoderState {
        self.state
    }

    /// True when no escape or UTF-8 sequence is in progress
    pub fn is_idle(&self) -> bool {
        self.state == DecoderState::Normal && self.utf8_need == 0
    }

    /// Feed a single byte
    pub fn feed(&mut self, byte: u8) -> Feed {
        match self.state {
            DecoderState::Normal => self.normal(byte),
            DecoderState::SawEscape => {
                if byte == b'[' {
                    self.state = DecoderState::SawCsi;
                } else {
                    trace!(byte, "dropping unrecognized escape sequence");
                    self.state = DecoderState::Normal;
                }
                Feed::Pending
            }
            DecoderState::SawCsi => {
                self.state = DecoderState::Normal;
                match SpecialKey::from_csi_final(byte) {
                    Some(key) => Feed::Emit(Decoded::Special(key)),
                    None => {
                        trace!(byte, "dropping unrecognized control sequence");
                        Feed::Pending
                    }
                }
            }
        }
    }

    fn normal(&mut self, byte: u8) -> Feed {
        if self.utf8_need > 0 {
            if byte & 0xC0 == 0x80 {
                return self.continue_utf8(byte);
            }
            // Truncated sequence; start over with this byte
            trace!("dropping truncated UTF-8 sequence");
            self.utf8_need = 0;
        }

        match byte {
            0x1B => {
                self.state = DecoderState::SawEscape;
                Feed::Pending
            }
            b'\n' => Feed::Emit(Decoded::Char('\r')),
            0x7F => Feed::Emit(Decoded::Char('\x08')),
            0x00..=0x7F => Feed::Emit(Decoded::Char(char::from(byte))),
            0xC2..=0xDF => self.start_utf8(byte, 2),
            0xE0..=0xEF => self.start_utf8(byte, 3),
            0xF0..=0xF4 => self.start_utf8(byte, 4),
            _ => {
                trace!(byte, "dropping invalid UTF-8 byte");
                Feed::Pending
            }
        }
    }

    fn start_utf8(&mut self, lead: u8, need: usize) -> Feed {
        self.utf8[0] = lead;
        self.utf8_len = 1;
        self.utf8_need = need;
        Feed::Pending
    }

    fn continue_utf8(&mut self, byte: u8) -> Feed {
        self.utf8[self.utf8_len] = byte;
        self.utf8_len += 1;
        if self.utf8_len < self.utf8_need {
            return Feed::Pending;
        }

        self.utf8_need = 0;
        match std::str::from_utf8(&self.utf8[..self.utf8_len]).ok().and_then(|s| s.chars().next()) {
            Some(ch) => Feed::Emit(Decoded::Char(ch)),
            None => {
                trace!("dropping malformed UTF-8 sequence");
                Feed::Pending
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_all(decoder: &mut EscapeDecoder, bytes: &[u8]) -> Vec<Decoded> {
        bytes
            .iter()
            .filter_map(|&b| match decoder.feed(b) {
                Feed::Emit(d) => Some(d),
                Feed::Pending => None,
            })
            .collect()
    }

    #[test]
    fn test_plain_bytes() {
        let mut decoder = EscapeDecoder::new();
        assert_eq!(decoder.feed(b'x'), Feed::Emit(Decoded::Char('x')));
        assert_eq!(decoder.feed(b'\n'), Feed::Emit(Decoded::Char('\r')));
        assert_eq!(decoder.feed(0x7F), Feed::Emit(Decoded::Char('\x08')));
        assert_eq!(decoder.feed(0x03), Feed::Emit(Decoded::Char('\x03')));
    }

    #[test]
    fn test_cursor_up() {
        let mut decoder = EscapeDecoder::new();
        assert_eq!(decoder.feed(0x1B), Feed::Pending);
        assert_eq!(decoder.state(), DecoderState::SawEscape);
        assert_eq!(decoder.feed(b'['), Feed::Pending);
        assert_eq!(decoder.state(), DecoderState::SawCsi);
        assert_eq!(decoder.feed(b'A'), Feed::Emit(Decoded::Special(SpecialKey::Up)));
        assert_eq!(decoder.state(), DecoderState::Normal);
    }

    #[test]
    fn test_all_cursor_keys() {
        let mut decoder = EscapeDecoder::new();
        let keys = feed_all(&mut decoder, b"\x1b[A\x1b[B\x1b[C\x1b[D\x1b[F\x1b[H");
        assert_eq!(
            keys,
            vec![
                Decoded::Special(SpecialKey::Up),
                Decoded::Special(SpecialKey::Down),
                Decoded::Special(SpecialKey::Right),
                Decoded::Special(SpecialKey::Left),
                Decoded::Special(SpecialKey::End),
                Decoded::Special(SpecialKey::Home),
            ]
        );
    }

    #[test]
    fn test_unknown_final_is_dropped() {
        let mut decoder = EscapeDecoder::new();
        assert!(feed_all(&mut decoder, b"\x1b[Z").is_empty());
        assert_eq!(decoder.state(), DecoderState::Normal);

        // Next byte starts fresh
        assert_eq!(feed_all(&mut decoder, b"\x1b[Bq"), vec![
            Decoded::Special(SpecialKey::Down),
            Decoded::Char('q'),
        ]);
    }

    #[test]
    fn test_escape_without_bracket_is_dropped() {
        let mut decoder = EscapeDecoder::new();
        // ESC O A (application cursor) and Alt+x are not forwarded
        assert_eq!(feed_all(&mut decoder, b"\x1bOA"), vec![Decoded::Char('A')]);
        assert!(feed_all(&mut decoder, b"\x1bx").is_empty());
        assert!(decoder.is_idle());
    }

    #[test]
    fn test_longer_sequences_are_not_supported() {
        let mut decoder = EscapeDecoder::new();
        // ESC [ 1 ; 5 A: the '1' ends the sequence, the rest is plain text
        assert_eq!(
            feed_all(&mut decoder, b"\x1b[1;5A"),
            vec![Decoded::Char(';'), Decoded::Char('5'), Decoded::Char('A')]
        );
    }

    #[test]
    fn test_utf8_sequences() {
        let mut decoder = EscapeDecoder::new();
        assert_eq!(
            feed_all(&mut decoder, "é€".as_bytes()),
            vec![Decoded::Char('é'), Decoded::Char('€')]
        );
        assert!(decoder.is_idle());
    }

    #[test]
    fn test_truncated_utf8_is_dropped() {
        let mut decoder = EscapeDecoder::new();
        // Lead byte of a 3-byte sequence, then plain ASCII
        assert_eq!(feed_all(&mut decoder, &[0xE2, 0x82, b'x']), vec![Decoded::Char('x')]);
        assert_eq!(feed_all(&mut decoder, &[0xFF, b'y']), vec![Decoded::Char('y')]);
    }
}
