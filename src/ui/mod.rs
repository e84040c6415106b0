//! Terminal-facing components.
//!
//! - **editor**: readline-style line editor used while the child reads
//!   cooked input

pub mod editor;

pub use editor::{LineEngine, LineInput, Readline};
