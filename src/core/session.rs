//! Session management
//!
//! Owns the serial port, runs the background poll loop that turns incoming
//! bytes into rendered records, and recovers from port faults.

use std::fmt;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use super::port::{Port, PortConfig, PortError, PortOpener};
use crate::codec::format::{self, FormatWarning};
use crate::codec::receive::{self, ReceiveDecoder};
use crate::codec::TransmitEncoder;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Port(#[from] PortError),

    #[error("Format send data not correct")]
    EmptyPayload,

    #[error("Failed to write to port: {0}")]
    Write(#[source] io::Error),
}

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    Open,
    Reopening,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionState::Closed => "closed",
            SessionState::Open => "open",
            SessionState::Reopening => "reopening",
        })
    }
}

/// Session events
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A decoded record or a chunk of raw text
    Received(String),
    /// Bytes written to the port
    Sent(Vec<u8>),
    StateChanged(SessionState),
    /// About to retry opening after a port fault
    ReopenAttempt { attempt: u32, max: u32 },
    Info(String),
    Warning(String),
    Error(String),
}

/// Delays and limits used by the session
#[derive(Debug, Clone)]
pub struct SessionTimings {
    /// Sleep between polls when there is nothing to read
    pub idle_interval: Duration,
    /// Back-off before each reopen attempt after a fault
    pub reopen_delay: Duration,
    pub reopen_attempts: u32,
    /// Pause between close and open on an explicit reopen
    pub settle_delay: Duration,
}

impl Default for SessionTimings {
    fn default() -> Self {
        Self {
            idle_interval: Duration::from_millis(10),
            reopen_delay: Duration::from_secs(2),
            reopen_attempts: 3,
            settle_delay: Duration::from_millis(500),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// State shared between the caller and the poll thread
///
/// Lock order: `port` before `state`.
struct Shared {
    opener: Box<dyn PortOpener>,
    config: Mutex<PortConfig>,
    port: Mutex<Option<Box<dyn Port>>>,
    state: Mutex<SessionState>,
    /// Raised by `close()`, consumed by the poll loop
    pending_close: AtomicBool,
    running: AtomicBool,
    decoder: ReceiveDecoder,
    format_spec: Mutex<String>,
    timings: SessionTimings,
    events: Sender<SessionEvent>,
}

impl Shared {
    fn emit(&self, event: SessionEvent) {
        // Nobody listening is fine
        let _ = self.events.send(event);
    }

    fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    fn set_state(&self, new_state: SessionState) {
        let mut state = lock(&self.state);
        if *state != new_state {
            info!("Session state: {} -> {}", *state, new_state);
            *state = new_state;
            drop(state);
            self.emit(SessionEvent::StateChanged(new_state));
        }
    }

    fn config(&self) -> PortConfig {
        lock(&self.config).clone()
    }

    /// Acquire the port. Does not report failures; callers decide how.
    fn open_port(&self) -> Result<(), PortError> {
        let mut port = lock(&self.port);
        if port.is_some() {
            // Cancels a close that the poll loop has not handled yet
            self.pending_close.store(false, Ordering::SeqCst);
            return Ok(());
        }

        let config = self.config();
        let mut handle = self.opener.open(&config)?;
        handle.clear_input()?;
        handle.set_timeout(config.read_timeout)?;
        *port = Some(handle);
        self.pending_close.store(false, Ordering::SeqCst);
        self.set_state(SessionState::Open);
        drop(port);

        info!("Opened {} at {} baud", config.port_name, config.baud_rate);
        self.emit(SessionEvent::Info(format!("Start monitor {}", config.port_name)));
        Ok(())
    }

    /// Drop the handle and report the close
    fn release_port(&self) {
        let mut port = lock(&self.port);
        let was_open = port.take().is_some();
        self.set_state(SessionState::Closed);
        drop(port);

        if was_open {
            let name = lock(&self.config).port_name.clone();
            info!("Closed {}", name);
            self.emit(SessionEvent::Info(format!("Stop monitor {}", name)));
        }
    }

    /// Pull at most one record off the port
    ///
    /// Returns `Ok(true)` when bytes were consumed.
    fn drain(&self) -> io::Result<bool> {
        let program = self.decoder.program();
        let width = program.record_width();

        let mut guard = lock(&self.port);
        let Some(port) = guard.as_mut() else {
            return Ok(false);
        };

        let available = port.bytes_to_read()?;
        if available < width.max(1) {
            return Ok(false);
        }

        let take = if width == 0 { available } else { width };
        let mut chunk = vec![0u8; take];
        port.read_exact(&mut chunk)?;
        drop(guard);

        debug!("Read {} bytes", chunk.len());
        match receive::decode_with(&program, &chunk) {
            Ok(text) if text.is_empty() => {}
            Ok(text) => self.emit(SessionEvent::Received(text)),
            Err(e) => self.emit(SessionEvent::Warning(e.to_string())),
        }
        Ok(true)
    }

    /// Bounded reopen after a port fault; ends `Open` or `Closed`
    fn recover(&self, error: io::Error) {
        let name = self.config().port_name;
        warn!("Port fault on {}: {}", name, error);
        self.emit(SessionEvent::Error(format!("Port fault on {}: {}", name, error)));

        lock(&self.port).take();
        self.set_state(SessionState::Reopening);

        let max = self.timings.reopen_attempts;
        for attempt in 1..=max {
            self.emit(SessionEvent::ReopenAttempt { attempt, max });
            thread::sleep(self.timings.reopen_delay);

            if !self.running.load(Ordering::SeqCst) || self.pending_close.load(Ordering::SeqCst) {
                info!("Reopen of {} abandoned", name);
                self.pending_close.store(false, Ordering::SeqCst);
                self.set_state(SessionState::Closed);
                self.emit(SessionEvent::Info(format!("Stop monitor {}", name)));
                return;
            }

            match self.open_port() {
                Ok(()) => {
                    info!("Reopened {} on attempt {}/{}", name, attempt, max);
                    return;
                }
                Err(e) => {
                    warn!("Reopen attempt {}/{} failed: {}", attempt, max, e);
                    self.emit(SessionEvent::Warning(format!(
                        "Reopen attempt {}/{} failed: {}",
                        attempt, max, e
                    )));
                }
            }
        }

        self.set_state(SessionState::Closed);
        self.emit(SessionEvent::Error(format!(
            "Port {} closed after {} failed reopen attempts",
            name, max
        )));
    }
}

/// Poll loop body, runs until the session is dropped
fn poll_loop(shared: Arc<Shared>) {
    while shared.running.load(Ordering::SeqCst) {
        if shared.pending_close.load(Ordering::SeqCst) {
            shared.release_port();
            shared.pending_close.store(false, Ordering::SeqCst);
            continue;
        }

        match shared.drain() {
            Ok(true) => {}
            Ok(false) => thread::sleep(shared.timings.idle_interval),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                thread::sleep(shared.timings.idle_interval);
            }
            Err(e) => shared.recover(e),
        }
    }
    debug!("Poll loop stopped");
}

/// A serial terminal session
pub struct SerialSession {
    shared: Arc<Shared>,
    poll_thread: Option<JoinHandle<()>>,
}

impl SerialSession {
    /// Create a closed session and start its poll loop
    ///
    /// Rendered records and status reports arrive on the returned receiver.
    pub fn new(
        opener: Box<dyn PortOpener>,
        config: PortConfig,
        format_spec: &str,
        timings: SessionTimings,
    ) -> (Self, Receiver<SessionEvent>) {
        let (tx, rx) = mpsc::channel();
        let shared = Arc::new(Shared {
            opener,
            config: Mutex::new(config),
            port: Mutex::new(None),
            state: Mutex::new(SessionState::Closed),
            pending_close: AtomicBool::new(false),
            running: AtomicBool::new(true),
            decoder: ReceiveDecoder::default(),
            format_spec: Mutex::new(String::new()),
            timings,
            events: tx,
        });

        let mut session = Self {
            shared: shared.clone(),
            poll_thread: None,
        };
        session.set_format(format_spec);

        let poll_thread = thread::Builder::new()
            .name("serial-poll".to_string())
            .spawn(move || poll_loop(shared));
        match poll_thread {
            Ok(handle) => session.poll_thread = Some(handle),
            Err(e) => {
                // Without the loop nothing is ever read; say so and stay closed
                warn!("Failed to start poll thread: {}", e);
                session.shared.running.store(false, Ordering::SeqCst);
                session
                    .shared
                    .emit(SessionEvent::Error(format!("Failed to start poll thread: {}", e)));
            }
        }

        (session, rx)
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn config(&self) -> PortConfig {
        self.shared.config()
    }

    /// Open the port. A busy or missing port is reported and leaves the
    /// session closed.
    pub fn open(&self) -> Result<(), SessionError> {
        if !self.shared.running.load(Ordering::SeqCst) {
            return Err(SessionError::Port(PortError::Io(io::Error::new(
                io::ErrorKind::Other,
                "poll loop is not running",
            ))));
        }

        self.shared.open_port().map_err(|e| {
            warn!("Open failed: {}", e);
            self.shared.emit(SessionEvent::Error(e.to_string()));
            SessionError::from(e)
        })
    }

    /// Ask the poll loop to release the port, or to give up reopening it
    pub fn close(&self) {
        let port = lock(&self.shared.port);
        if port.is_some() || self.shared.state() == SessionState::Reopening {
            self.shared.pending_close.store(true, Ordering::SeqCst);
        }
    }

    /// Close, wait for the handle to be released, settle, open again
    pub fn reopen(&self) -> Result<(), SessionError> {
        self.close();
        while self.shared.running.load(Ordering::SeqCst)
            && (lock(&self.shared.port).is_some() || self.shared.pending_close.load(Ordering::SeqCst))
        {
            thread::sleep(self.shared.timings.idle_interval);
        }
        thread::sleep(self.shared.timings.settle_delay);
        self.open()
    }

    /// Encode and write a line
    ///
    /// Returns the number of bytes written, 0 when the session is not open.
    pub fn transmit(&self, message: &str) -> Result<usize, SessionError> {
        if self.state() != SessionState::Open {
            debug!("Not open, dropping {:?}", message);
            return Ok(0);
        }

        let encoded = TransmitEncoder::encode(message);
        for warning in &encoded.warnings {
            self.shared.emit(SessionEvent::Warning(warning.to_string()));
        }
        if encoded.bytes.is_empty() {
            self.shared.emit(SessionEvent::Error(SessionError::EmptyPayload.to_string()));
            return Err(SessionError::EmptyPayload);
        }

        let mut guard = lock(&self.shared.port);
        let Some(port) = guard.as_mut() else {
            return Ok(0);
        };
        if let Err(e) = port.write_all(&encoded.bytes).and_then(|_| port.flush()) {
            drop(guard);
            warn!("Write failed: {}", e);
            let error = SessionError::Write(e);
            self.shared.emit(SessionEvent::Error(error.to_string()));
            return Err(error);
        }
        drop(guard);

        let len = encoded.bytes.len();
        self.shared.emit(SessionEvent::Sent(encoded.bytes));
        Ok(len)
    }

    /// Compile and install a new receive format
    pub fn set_format(&self, spec: &str) -> Vec<FormatWarning> {
        let compiled = format::compile(spec);
        for warning in &compiled.warnings {
            self.shared.emit(SessionEvent::Warning(warning.to_string()));
        }
        info!("Receive format: {} ({} bytes per record)", compiled.program, compiled.program.record_width());
        self.shared.decoder.set_program(compiled.program);
        *lock(&self.shared.format_spec) = spec.trim().to_string();
        compiled.warnings
    }

    /// Apply new connection parameters, reopening if the port is open
    pub fn reconfigure(&self, config: PortConfig) -> Result<(), SessionError> {
        let changed = {
            let mut current = lock(&self.shared.config);
            let changed = *current != config;
            *current = config;
            changed
        };

        if changed && self.state() == SessionState::Open {
            self.reopen()
        } else {
            Ok(())
        }
    }

    /// One-line summary: port, baud, framing, format, state
    pub fn status_line(&self) -> String {
        let config = self.config();
        let spec = lock(&self.shared.format_spec).clone();
        let format = if spec.is_empty() { format::RAW_TEXT_SENTINEL.to_string() } else { spec };
        format!(
            "{}, {} baud, parity {}, stop bits {}, format \"{}\", {}",
            config.port_name,
            config.baud_rate,
            config.parity,
            config.stop_bits,
            format,
            self.state()
        )
    }
}

impl Drop for SerialSession {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.poll_thread.take() {
            let _ = handle.join();
        }

        lock(&self.shared.port).take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::mock::{MockOpener, MockWire, OpenOutcome};
    use crate::core::port::{Parity, StopBits};
    use std::time::Instant;

    const WAIT: Duration = Duration::from_secs(2);

    fn port_config() -> PortConfig {
        PortConfig {
            port_name: "COM7".to_string(),
            baud_rate: 9600,
            parity: Parity::None,
            stop_bits: StopBits::One,
            read_timeout: Duration::from_millis(100),
        }
    }

    fn fast_timings() -> SessionTimings {
        SessionTimings {
            idle_interval: Duration::from_millis(1),
            reopen_delay: Duration::from_millis(5),
            reopen_attempts: 3,
            settle_delay: Duration::from_millis(5),
        }
    }

    fn session(
        script: &[OpenOutcome],
        format: &str,
    ) -> (SerialSession, Receiver<SessionEvent>, MockWire, Arc<MockOpener>) {
        let wire = MockWire::default();
        let opener = Arc::new(MockOpener::new(wire.clone(), script));
        let (session, rx) =
            SerialSession::new(Box::new(opener.clone()), port_config(), format, fast_timings());
        (session, rx, wire, opener)
    }

    /// Collect events until one matches `done`
    fn wait_for(rx: &Receiver<SessionEvent>, done: impl Fn(&SessionEvent) -> bool) -> Vec<SessionEvent> {
        let deadline = Instant::now() + WAIT;
        let mut seen = Vec::new();
        while let Some(left) = deadline.checked_duration_since(Instant::now()) {
            match rx.recv_timeout(left) {
                Ok(event) => {
                    let finished = done(&event);
                    seen.push(event);
                    if finished {
                        return seen;
                    }
                }
                Err(_) => break,
            }
        }
        panic!("expected event not seen, got {:?}", seen);
    }

    #[test]
    fn test_open_busy_stays_closed() {
        let (session, rx, _wire, _opener) = session(&[OpenOutcome::Busy], "");

        let result = session.open();
        assert!(matches!(result, Err(SessionError::Port(PortError::Busy(_)))));
        assert_eq!(session.state(), SessionState::Closed);
        wait_for(&rx, |e| matches!(e, SessionEvent::Error(msg) if msg.contains("busy")));
    }

    #[test]
    fn test_open_discards_pending_input() {
        let (session, rx, wire, _opener) = session(&[], "");
        wire.push_rx(b"stale");

        session.open().unwrap();
        assert_eq!(session.state(), SessionState::Open);
        assert_eq!(wire.clear_count(), 1);
        assert_eq!(wire.timeout(), Some(Duration::from_millis(100)));
        assert_eq!(wire.pending_rx(), 0);

        wire.push_rx(b"fresh");
        let events = wait_for(&rx, |e| matches!(e, SessionEvent::Received(_)));
        assert_eq!(events.last(), Some(&SessionEvent::Received("fresh".to_string())));
    }

    #[test]
    fn test_records_wait_for_full_width() {
        let (session, rx, wire, _opener) = session(&[], "2u8");
        session.open().unwrap();

        wire.push_rx(&[72]);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(wire.pending_rx(), 1);
        assert!(rx.try_iter().all(|e| !matches!(e, SessionEvent::Received(_))));

        wire.push_rx(&[101, 1, 2]);
        let events = wait_for(&rx, |e| matches!(e, SessionEvent::Received(_)));
        assert_eq!(events.last(), Some(&SessionEvent::Received(" 72 101\n".to_string())));
        let events = wait_for(&rx, |e| matches!(e, SessionEvent::Received(_)));
        assert_eq!(events.last(), Some(&SessionEvent::Received("  1   2\n".to_string())));
    }

    #[test]
    fn test_close_is_handled_by_poll_loop() {
        let (session, rx, wire, _opener) = session(&[], "");
        session.open().unwrap();
        assert_eq!(wire.open_handles(), 1);

        session.close();
        wait_for(&rx, |e| *e == SessionEvent::StateChanged(SessionState::Closed));
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(wire.open_handles(), 0);
    }

    #[test]
    fn test_failed_reopens_close_session() {
        let script = [OpenOutcome::Ok, OpenOutcome::Busy, OpenOutcome::Busy, OpenOutcome::Busy];
        let (session, rx, wire, opener) = session(&script, "");
        session.open().unwrap();

        wire.break_line();
        let events = wait_for(&rx, |e| *e == SessionEvent::StateChanged(SessionState::Closed));

        let attempts: Vec<u32> = events
            .iter()
            .filter_map(|e| match e {
                SessionEvent::ReopenAttempt { attempt, .. } => Some(*attempt),
                _ => None,
            })
            .collect();
        assert_eq!(attempts, vec![1, 2, 3]);
        assert!(events.contains(&SessionEvent::StateChanged(SessionState::Reopening)));
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(opener.attempts(), 4);
        assert_eq!(wire.open_handles(), 0);
    }

    #[test]
    fn test_close_abandons_reopen() {
        let wire = MockWire::default();
        let opener = Arc::new(MockOpener::new(wire.clone(), &[OpenOutcome::Ok, OpenOutcome::Busy]));
        let timings = SessionTimings {
            reopen_delay: Duration::from_millis(100),
            ..fast_timings()
        };
        let (session, rx) = SerialSession::new(Box::new(opener.clone()), port_config(), "", timings);
        session.open().unwrap();

        wire.break_line();
        wait_for(&rx, |e| *e == SessionEvent::StateChanged(SessionState::Reopening));
        session.close();

        let events = wait_for(&rx, |e| *e == SessionEvent::StateChanged(SessionState::Closed));
        assert_eq!(opener.attempts(), 1);
        assert!(!events.iter().any(|e| matches!(e, SessionEvent::Error(_))));
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn test_fault_recovers_when_reopen_succeeds() {
        let script = [OpenOutcome::Ok, OpenOutcome::Busy, OpenOutcome::Ok];
        let (session, rx, wire, opener) = session(&script, "");
        session.open().unwrap();
        wait_for(&rx, |e| *e == SessionEvent::StateChanged(SessionState::Open));

        wire.break_line();
        let events = wait_for(&rx, |e| *e == SessionEvent::StateChanged(SessionState::Open));
        let attempts = events
            .iter()
            .filter(|e| matches!(e, SessionEvent::ReopenAttempt { .. }))
            .count();
        assert_eq!(attempts, 2);
        assert_eq!(opener.attempts(), 3);
        assert_eq!(session.state(), SessionState::Open);

        wire.push_rx(b"back");
        let events = wait_for(&rx, |e| matches!(e, SessionEvent::Received(_)));
        assert_eq!(events.last(), Some(&SessionEvent::Received("back".to_string())));
    }

    #[test]
    fn test_transmit() {
        let (session, rx, wire, _opener) = session(&[], "");

        // Closed: dropped, not queued
        assert_eq!(session.transmit("0x48").unwrap(), 0);
        session.open().unwrap();
        assert!(wire.written().is_empty());

        assert_eq!(session.transmit("0x48 0x65").unwrap(), 2);
        assert_eq!(session.transmit("hi").unwrap(), 2);
        assert_eq!(wire.written(), vec![0x48, 0x65, b'h', b'i']);
        wait_for(&rx, |e| *e == SessionEvent::Sent(vec![0x48, 0x65]));

        assert!(matches!(session.transmit("0x zz"), Err(SessionError::EmptyPayload)));
        assert_eq!(wire.written().len(), 4);
    }

    #[test]
    fn test_read_timeouts_are_silent() {
        let (session, rx, wire, opener) = session(&[], "");
        session.open().unwrap();
        wait_for(&rx, |e| *e == SessionEvent::StateChanged(SessionState::Open));

        wire.stall(true);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(session.state(), SessionState::Open);
        assert_eq!(opener.attempts(), 1);
        assert!(rx
            .try_iter()
            .all(|e| !matches!(e, SessionEvent::Error(_) | SessionEvent::ReopenAttempt { .. })));

        wire.stall(false);
        wire.push_rx(b"quiet");
        let events = wait_for(&rx, |e| matches!(e, SessionEvent::Received(_)));
        assert_eq!(events.last(), Some(&SessionEvent::Received("quiet".to_string())));
        assert_eq!(opener.attempts(), 1);
    }

    #[test]
    fn test_transmit_while_reopening_is_dropped() {
        let wire = MockWire::default();
        let opener = Arc::new(MockOpener::new(wire.clone(), &[OpenOutcome::Ok, OpenOutcome::Busy]));
        let timings = SessionTimings {
            reopen_delay: Duration::from_millis(100),
            ..fast_timings()
        };
        let (session, rx) = SerialSession::new(Box::new(opener.clone()), port_config(), "", timings);
        session.open().unwrap();

        wire.break_line();
        wait_for(&rx, |e| *e == SessionEvent::StateChanged(SessionState::Reopening));

        assert_eq!(session.transmit("0x41 0x42").unwrap(), 0);
        assert_eq!(session.transmit("hello").unwrap(), 0);
        assert!(wire.written().is_empty());
        assert!(rx.try_iter().all(|e| !matches!(e, SessionEvent::Sent(_))));
    }

    #[test]
    fn test_explicit_reopen() {
        let (session, rx, wire, opener) = session(&[], "");
        session.open().unwrap();

        session.reopen().unwrap();
        assert_eq!(session.state(), SessionState::Open);
        assert_eq!(opener.attempts(), 2);
        assert_eq!(wire.open_handles(), 1);
        wait_for(&rx, |e| *e == SessionEvent::StateChanged(SessionState::Closed));
    }

    #[test]
    fn test_reconfigure_reopens_open_port() {
        let (session, _rx, _wire, opener) = session(&[], "");

        let mut config = port_config();
        config.baud_rate = 115200;
        session.reconfigure(config.clone()).unwrap();
        assert_eq!(opener.attempts(), 0);

        session.open().unwrap();
        config.parity = Parity::Even;
        session.reconfigure(config.clone()).unwrap();
        assert_eq!(opener.attempts(), 2);
        assert_eq!(opener.last_config(), Some(config));
    }

    #[test]
    fn test_set_format_reports_bad_words() {
        let (session, rx, _wire, _opener) = session(&[], "");
        let warnings = session.set_format("u8 nope");
        assert_eq!(warnings.len(), 1);
        wait_for(&rx, |e| matches!(e, SessionEvent::Warning(msg) if msg.contains("nope")));
    }

    #[test]
    fn test_status_line() {
        let (session, _rx, _wire, _opener) = session(&[], "2xu16");
        assert_eq!(
            session.status_line(),
            "COM7, 9600 baud, parity none, stop bits 1, format \"2xu16\", closed"
        );
        session.open().unwrap();
        assert!(session.status_line().ends_with("open"));
    }
}
