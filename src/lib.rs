//! serterm - A serial port terminal
//!
//! serterm sends typed lines over a serial link and renders what comes back
//! according to a receive format.
//!
//! # Features
//!
//! - **Numeric literals**: `0x48 0b1010 0d10 255`, with optional bit widths (`4x0F`)
//! - **Receive formats**: fixed-width binary records such as `2xu32 f64 8char`
//! - **Resilient session**: background polling, bounded reopen after faults
//! - **Settings**: TOML file at `~/.serterm/config.toml`
//!
//! # Quick Start
//!
//! ```text
//! serterm -p COM7 -b 115200           # Raw text mode
//! serterm -p /dev/ttyUSB0 -f "2u16"   # Two decimal u16 per record
//! ```

pub mod codec;
pub mod config;
pub mod core;
pub mod printer;
