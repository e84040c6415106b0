//! Key event encoding for the console input queue
//!
//! The console reads keyboard input as key records, not bytes. This module
//! turns characters and cursor keys into the press/release record pairs the
//! console expects, using a keyboard layout to recover the virtual key, scan
//! code and modifier state a real keystroke would carry.

use bitflags::bitflags;

bitflags! {
    /// Modifier keys held during a keystroke
    ///
    /// The bit layout matches the shift-state byte of a character-to-key
    /// lookup (1 = shift, 2 = ctrl, 4 = alt).
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct Modifiers: u8 {
        const SHIFT = 0b0001;
        const CTRL  = 0b0010;
        const ALT   = 0b0100;
    }
}

/// Native control-key-state bits
const SHIFT_PRESSED: u32 = 0x0010;
const LEFT_CTRL_PRESSED: u32 = 0x0008;
const RIGHT_ALT_PRESSED: u32 = 0x0001;

impl Modifiers {
    /// Decode the shift-state byte of a character-to-key lookup
    pub fn from_shift_state(state: u8) -> Self {
        Self::from_bits_truncate(state)
    }

    /// Control-key-state word for a key record
    pub fn control_key_state(self) -> u32 {
        let mut state = 0;
        if self.contains(Modifiers::SHIFT) {
            state |= SHIFT_PRESSED;
        }
        if self.contains(Modifiers::CTRL) {
            state |= LEFT_CTRL_PRESSED;
        }
        if self.contains(Modifiers::ALT) {
            state |= RIGHT_ALT_PRESSED;
        }
        state
    }
}

/// Virtual key codes
pub mod vk {
    pub const BACK: u16 = 0x08;
    pub const TAB: u16 = 0x09;
    pub const RETURN: u16 = 0x0D;
    pub const ESCAPE: u16 = 0x1B;
    pub const SPACE: u16 = 0x20;
    pub const END: u16 = 0x23;
    pub const HOME: u16 = 0x24;
    pub const LEFT: u16 = 0x25;
    pub const UP: u16 = 0x26;
    pub const RIGHT: u16 = 0x27;
    pub const DOWN: u16 = 0x28;
    pub const OEM_1: u16 = 0xBA;
    pub const OEM_PLUS: u16 = 0xBB;
    pub const OEM_COMMA: u16 = 0xBC;
    pub const OEM_MINUS: u16 = 0xBD;
    pub const OEM_PERIOD: u16 = 0xBE;
    pub const OEM_2: u16 = 0xBF;
    pub const OEM_3: u16 = 0xC0;
    pub const OEM_4: u16 = 0xDB;
    pub const OEM_5: u16 = 0xDC;
    pub const OEM_6: u16 = 0xDD;
    pub const OEM_7: u16 = 0xDE;
}

/// Cursor keys recognised in terminal input
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpecialKey {
    Up,
    Down,
    Left,
    Right,
    Home,
    End,
}

impl SpecialKey {
    /// Resolve the final byte of `ESC [ <final>`
    pub fn from_csi_final(byte: u8) -> Option<Self> {
        match byte {
            b'A' => Some(SpecialKey::Up),
            b'B' => Some(SpecialKey::Down),
            b'C' => Some(SpecialKey::Right),
            b'D' => Some(SpecialKey::Left),
            b'F' => Some(SpecialKey::End),
            b'H' => Some(SpecialKey::Home),
            _ => None,
        }
    }

    pub fn virtual_key(self) -> u16 {
        match self {
            SpecialKey::Up => vk::UP,
            SpecialKey::Down => vk::DOWN,
            SpecialKey::Left => vk::LEFT,
            SpecialKey::Right => vk::RIGHT,
            SpecialKey::Home => vk::HOME,
            SpecialKey::End => vk::END,
        }
    }
}

/// One half (press or release) of a keystroke
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeyEvent {
    pub virtual_key: u16,
    pub scan_code: u16,
    /// Character payload; always inside the Basic Multilingual Plane
    pub character: Option<char>,
    pub modifiers: Modifiers,
    pub pressed: bool,
}

/// A press immediately followed by its release
pub type KeyPair = [KeyEvent; 2];

impl KeyEvent {
    /// Expand into the press/release pair for this keystroke
    pub fn pair(self) -> KeyPair {
        let down = KeyEvent { pressed: true, ..self };
        [down, KeyEvent { pressed: false, ..down }]
    }
}

/// Result of a character-to-key lookup
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct KeyStroke {
    pub virtual_key: u16,
    pub modifiers: Modifiers,
}

/// Keyboard layout used to recover keystrokes from characters
pub trait KeyLayout {
    /// Key and modifiers that type `ch`, if the layout has one
    fn translate(&self, ch: char) -> Option<KeyStroke>;

    /// Scan code of a virtual key (0 if unknown)
    fn scan_code(&self, virtual_key: u16) -> u16;
}

/// US 101-key reference layout, scan code set 1
#[derive(Clone, Copy, Debug, Default)]
pub struct UsLayout;

/// Punctuation on the US layout: (character, virtual key, shifted)
const US_SYMBOLS: &[(char, u16, bool)] = &[
    ('`', vk::OEM_3, false),
    ('~', vk::OEM_3, true),
    ('!', 0x31, true),
    ('@', 0x32, true),
    ('#', 0x33, true),
    ('$', 0x34, true),
    ('%', 0x35, true),
    ('^', 0x36, true),
    ('&', 0x37, true),
    ('*', 0x38, true),
    ('(', 0x39, true),
    (')', 0x30, true),
    ('-', vk::OEM_MINUS, false),
    ('_', vk::OEM_MINUS, true),
    ('=', vk::OEM_PLUS, false),
    ('+', vk::OEM_PLUS, true),
    ('[', vk::OEM_4, false),
    ('{', vk::OEM_4, true),
    (']', vk::OEM_6, false),
    ('}', vk::OEM_6, true),
    ('\\', vk::OEM_5, false),
    ('|', vk::OEM_5, true),
    (';', vk::OEM_1, false),
    (':', vk::OEM_1, true),
    ('\'', vk::OEM_7, false),
    ('"', vk::OEM_7, true),
    (',', vk::OEM_COMMA, false),
    ('<', vk::OEM_COMMA, true),
    ('.', vk::OEM_PERIOD, false),
    ('>', vk::OEM_PERIOD, true),
    ('/', vk::OEM_2, false),
    ('?', vk::OEM_2, true),
];

/// Letter rows of the US layout with the scan code of their first key
const US_LETTER_ROWS: &[(&str, u16)] = &[("QWERTYUIOP", 0x10), ("ASDFGHJKL", 0x1E), ("ZXCVBNM", 0x2C)];

impl KeyLayout for UsLayout {
    fn translate(&self, ch: char) -> Option<KeyStroke> {
        let stroke = |virtual_key: u16, modifiers: Modifiers| Some(KeyStroke { virtual_key, modifiers });

        match ch {
            'a'..='z' => stroke(ch.to_ascii_uppercase() as u16, Modifiers::empty()),
            'A'..='Z' | '0'..='9' => {
                let shift = if ch.is_ascii_uppercase() { Modifiers::SHIFT } else { Modifiers::empty() };
                stroke(ch as u16, shift)
            }
            ' ' => stroke(vk::SPACE, Modifiers::empty()),
            '\x08' => stroke(vk::BACK, Modifiers::empty()),
            '\t' => stroke(vk::TAB, Modifiers::empty()),
            '\r' => stroke(vk::RETURN, Modifiers::empty()),
            '\n' => stroke(vk::RETURN, Modifiers::CTRL),
            '\x1b' => stroke(vk::ESCAPE, Modifiers::empty()),
            '\x7f' => stroke(vk::BACK, Modifiers::CTRL),
            // Ctrl+A .. Ctrl+Z
            '\x01'..='\x1a' => stroke(0x40 + ch as u16, Modifiers::CTRL),
            '\x1c' => stroke(vk::OEM_5, Modifiers::CTRL),
            '\x1d' => stroke(vk::OEM_6, Modifiers::CTRL),
            _ => US_SYMBOLS
                .iter()
                .find(|(symbol, _, _)| *symbol == ch)
                .and_then(|&(_, key, shifted)| {
                    stroke(key, if shifted { Modifiers::SHIFT } else { Modifiers::empty() })
                }),
        }
    }

    fn scan_code(&self, virtual_key: u16) -> u16 {
        if let Some(letter) = char::from_u32(u32::from(virtual_key)).filter(char::is_ascii_uppercase) {
            return US_LETTER_ROWS
                .iter()
                .find_map(|(row, first)| row.find(letter).map(|i| first + i as u16))
                .unwrap_or(0);
        }

        match virtual_key {
            0x31..=0x39 => 0x02 + (virtual_key - 0x31),
            0x30 => 0x0B,
            vk::ESCAPE => 0x01,
            vk::OEM_MINUS => 0x0C,
            vk::OEM_PLUS => 0x0D,
            vk::BACK => 0x0E,
            vk::TAB => 0x0F,
            vk::OEM_4 => 0x1A,
            vk::OEM_6 => 0x1B,
            vk::RETURN => 0x1C,
            vk::OEM_1 => 0x27,
            vk::OEM_7 => 0x28,
            vk::OEM_3 => 0x29,
            vk::OEM_5 => 0x2B,
            vk::OEM_COMMA => 0x33,
            vk::OEM_PERIOD => 0x34,
            vk::OEM_2 => 0x35,
            vk::SPACE => 0x39,
            vk::HOME => 0x47,
            vk::UP => 0x48,
            vk::LEFT => 0x4B,
            vk::RIGHT => 0x4D,
            vk::END => 0x4F,
            vk::DOWN => 0x50,
            _ => 0,
        }
    }
}

/// The active keyboard layout of the console session
#[cfg(windows)]
#[derive(Clone, Copy, Debug, Default)]
pub struct WindowsLayout;

#[cfg(windows)]
impl KeyLayout for WindowsLayout {
    fn translate(&self, ch: char) -> Option<KeyStroke> {
        use windows::Win32::UI::Input::KeyboardAndMouse::VkKeyScanW;

        let unit = u16::try_from(u32::from(ch)).ok()?;
        let scan = unsafe { VkKeyScanW(unit) };
        if scan == -1 {
            return None;
        }

        let [key, shift_state] = scan.to_le_bytes();
        Some(KeyStroke {
            virtual_key: u16::from(key),
            modifiers: Modifiers::from_shift_state(shift_state),
        })
    }

    fn scan_code(&self, virtual_key: u16) -> u16 {
        use windows::Win32::UI::Input::KeyboardAndMouse::{MapVirtualKeyW, MAPVK_VK_TO_VSC};

        let code = unsafe { MapVirtualKeyW(u32::from(virtual_key), MAPVK_VK_TO_VSC) };
        u16::try_from(code).unwrap_or(0)
    }
}

/// Encoder from characters and cursor keys to key record pairs
#[derive(Debug)]
pub struct KeyEncoder<L> {
    layout: L,
}

impl<L: KeyLayout> KeyEncoder<L> {
    pub fn new(layout: L) -> Self {
        Self { layout }
    }

    /// Keystroke that types `ch`
    ///
    /// Characters the layout cannot type go out with virtual key 0 and keep
    /// their payload; console readers take the character from the payload.
    pub fn encode_char(&self, ch: char) -> KeyPair {
        let ch = if ch.len_utf16() == 1 { ch } else { char::REPLACEMENT_CHARACTER };
        let stroke = self.layout.translate(ch).unwrap_or_default();

        KeyEvent {
            virtual_key: stroke.virtual_key,
            scan_code: self.layout.scan_code(stroke.virtual_key),
            character: Some(ch),
            modifiers: stroke.modifiers,
            pressed: true,
        }
        .pair()
    }

    /// Keystroke for a cursor key (no character payload)
    pub fn encode_special(&self, key: SpecialKey) -> KeyPair {
        let virtual_key = key.virtual_key();
        KeyEvent {
            virtual_key,
            scan_code: self.layout.scan_code(virtual_key),
            character: None,
            modifiers: Modifiers::empty(),
            pressed: true,
        }
        .pair()
    }

    /// One pair per character, with carriage return for line feeds
    pub fn encode_string(&self, s: &str) -> Vec<KeyPair> {
        let mut pairs = Vec::with_capacity(s.chars().count() + 1);
        pairs.extend(s.chars().map(|ch| self.encode_char(if ch == '\n' { '\r' } else { ch })));
        pairs
    }

    /// A completed line followed by its carriage return
    pub fn encode_line(&self, line: &str) -> Vec<KeyPair> {
        let mut pairs = self.encode_string(line);
        pairs.push(self.encode_char('\r'));
        pairs
    }
}
