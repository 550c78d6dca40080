//! Core serial terminal components.
//!
//! - **port**: `Port`/`PortOpener` seam over the `serialport` crate
//! - **session**: session owning the port, poll loop, reopen on faults
//!
//! # Architecture
//!
//! ```text
//! SerialSession
//! ├── Shared (Arc, used by caller and poll thread)
//! │   ├── Port handle (Mutex<Option<Box<dyn Port>>>)
//! │   ├── ReceiveDecoder (current FormatProgram)
//! │   └── PendingClose flag
//! └── Poll thread ──► SessionEvent channel ──► UI
//! ```

pub mod port;
pub mod session;

#[cfg(test)]
pub(crate) mod mock;
