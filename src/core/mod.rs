//! Core translation components.
//!
//! - **keys**: key records, keyboard layouts and the key encoder
//! - **escape**: terminal input decoder (cursor keys, UTF-8)
//! - **relay**: child output relay and prompt tracking
//! - **console**: console input buffer access and mode detection
//! - **session**: child process and the threads feeding the event loop
//! - **bridge**: the event loop
//!
//! # Architecture
//!
//! ```text
//! Session ──events──▶ Bridge
//!                     ├── OutputRelay ──▶ stdout / stderr
//!                     │   └── PromptBuffer
//!                     ├── console mode? ─┬─ line: LineEngine ─┐
//!                     │                  └─ raw: EscapeDecoder┤
//!                     └── KeyEncoder ◀────────────────────────┘
//!                         └──▶ ConsoleInput (CONIN$)
//! ```

pub mod bridge;
pub mod console;
pub mod escape;
pub mod keys;
pub mod relay;
pub mod session;
