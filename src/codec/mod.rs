//! Message codec.
//!
//! Everything that turns text into wire bytes and wire bytes into text:
//!
//! - **literal**: mixed-radix numeric literals (`0x48`, `4b1010`, `255`) to bits
//! - **transmit**: structured-vs-plain-text decision for outgoing lines
//! - **format**: receive format specs (`"2xu32 f64 8char"`) to field layouts
//! - **receive**: fixed-width record rendering
//!
//! # Data Flow
//!
//! ```text
//! outbound:  line ──► TransmitEncoder ──► literal ──► bytes
//! inbound:   bytes ──► ReceiveDecoder ◄── FormatProgram ◄── format::compile
//!                          │
//!                          └──► text
//! ```

pub mod format;
pub mod literal;
pub mod receive;
pub mod transmit;

pub use format::{compile, error_markers, validate, FormatProgram};
pub use receive::{DecodeError, ReceiveDecoder};
pub use transmit::TransmitEncoder;
