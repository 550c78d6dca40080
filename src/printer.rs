//! Console output for session events.
//!
//! Received text is printed as-is. Everything the terminal says about itself
//! is coloured by kind:
//!
//! | Event | Colour |
//! |-------|--------|
//! | Info, state changes | green |
//! | Warning, reopen attempts | yellow |
//! | Error | red |
//! | Sent bytes | dark yellow, as hex |

use std::io::{self, Write};

use crossterm::{
    queue,
    style::{Color, Print, ResetColor, SetForegroundColor},
};

use crate::core::session::SessionEvent;

/// Writes session events and command feedback to a terminal
pub struct Printer<W: Write> {
    out: W,
}

impl<W: Write> Printer<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn event(&mut self, event: &SessionEvent) -> io::Result<()> {
        match event {
            SessionEvent::Received(text) => {
                queue!(self.out, Print(text))?;
                self.out.flush()
            }
            SessionEvent::Sent(bytes) => self.line(Color::DarkYellow, &hex_bytes(bytes)),
            SessionEvent::StateChanged(state) => self.info(&format!("Port {}", state)),
            SessionEvent::ReopenAttempt { attempt, max } => {
                self.warning(&format!("Reopening port, attempt {} of {}", attempt, max))
            }
            SessionEvent::Info(message) => self.info(message),
            SessionEvent::Warning(message) => self.warning(message),
            SessionEvent::Error(message) => self.error(message),
        }
    }

    pub fn info(&mut self, message: &str) -> io::Result<()> {
        self.line(Color::Green, message)
    }

    pub fn warning(&mut self, message: &str) -> io::Result<()> {
        self.line(Color::Yellow, &format!("Warning: {}", message))
    }

    pub fn error(&mut self, message: &str) -> io::Result<()> {
        self.line(Color::Red, &format!("Error: {}", message))
    }

    /// Uncoloured output such as the settings table
    pub fn plain(&mut self, message: &str) -> io::Result<()> {
        queue!(self.out, Print(message), Print("\n"))?;
        self.out.flush()
    }

    fn line(&mut self, color: Color, message: &str) -> io::Result<()> {
        queue!(
            self.out,
            SetForegroundColor(color),
            Print(message),
            ResetColor,
            Print("\n")
        )?;
        self.out.flush()
    }
}

/// `[0x48, 0x65]` as `0x48 0x65`
pub fn hex_bytes(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("0x{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}
