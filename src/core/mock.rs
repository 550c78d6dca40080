//! In-memory serial wire for tests

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::port::{Port, PortConfig, PortError, PortOpener, Result};

#[derive(Default)]
struct WireState {
    rx: VecDeque<u8>,
    tx: Vec<u8>,
    broken: bool,
    stalled: bool,
    cleared: usize,
    timeout: Option<Duration>,
    handles: usize,
}

/// Both ends of a fake serial line
#[derive(Clone, Default)]
pub struct MockWire {
    state: Arc<Mutex<WireState>>,
}

impl MockWire {
    fn lock(&self) -> MutexGuard<'_, WireState> {
        self.state.lock().unwrap()
    }

    /// Bytes arriving from the remote device
    pub fn push_rx(&self, bytes: &[u8]) {
        self.lock().rx.extend(bytes);
    }

    pub fn pending_rx(&self) -> usize {
        self.lock().rx.len()
    }

    /// Bytes the session wrote
    pub fn written(&self) -> Vec<u8> {
        self.lock().tx.clone()
    }

    /// Make every port operation fail until reopened
    pub fn break_line(&self) {
        self.lock().broken = true;
    }

    /// Make polls time out, as a driver does when the line is quiet
    pub fn stall(&self, stalled: bool) {
        self.lock().stalled = stalled;
    }

    pub fn clear_count(&self) -> usize {
        self.lock().cleared
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.lock().timeout
    }

    /// Number of live port handles
    pub fn open_handles(&self) -> usize {
        self.lock().handles
    }
}

pub struct MockPort {
    wire: MockWire,
}

impl MockPort {
    fn check(&self) -> io::Result<()> {
        if self.wire.lock().broken {
            Err(io::Error::new(io::ErrorKind::Other, "operation canceled"))
        } else {
            Ok(())
        }
    }
}

impl io::Read for MockPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.check()?;
        let mut state = self.wire.lock();
        if state.rx.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "timed out"));
        }
        let n = buf.len().min(state.rx.len());
        for (slot, byte) in buf.iter_mut().zip(state.rx.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl io::Write for MockPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.check()?;
        self.wire.lock().tx.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.check()
    }
}

impl Port for MockPort {
    fn bytes_to_read(&self) -> io::Result<usize> {
        self.check()?;
        let state = self.wire.lock();
        if state.stalled {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "timed out"));
        }
        Ok(state.rx.len())
    }

    fn clear_input(&mut self) -> io::Result<()> {
        let mut state = self.wire.lock();
        state.rx.clear();
        state.cleared += 1;
        Ok(())
    }

    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.wire.lock().timeout = Some(timeout);
        Ok(())
    }
}

impl Drop for MockPort {
    fn drop(&mut self) {
        self.wire.lock().handles -= 1;
    }
}

/// Scripted result of one open attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenOutcome {
    Ok,
    Busy,
}

/// Opener that follows a script, then keeps succeeding
pub struct MockOpener {
    wire: MockWire,
    script: Mutex<VecDeque<OpenOutcome>>,
    attempts: AtomicUsize,
    last_config: Mutex<Option<PortConfig>>,
}

impl MockOpener {
    pub fn new(wire: MockWire, script: &[OpenOutcome]) -> Self {
        Self {
            wire,
            script: Mutex::new(script.iter().copied().collect()),
            attempts: AtomicUsize::new(0),
            last_config: Mutex::new(None),
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn last_config(&self) -> Option<PortConfig> {
        self.last_config.lock().unwrap().clone()
    }
}

impl PortOpener for MockOpener {
    fn open(&self, config: &PortConfig) -> Result<Box<dyn Port>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        *self.last_config.lock().unwrap() = Some(config.clone());

        let outcome = self.script.lock().unwrap().pop_front().unwrap_or(OpenOutcome::Ok);
        match outcome {
            OpenOutcome::Busy => Err(PortError::Busy(config.port_name.clone())),
            OpenOutcome::Ok => {
                let mut state = self.wire.lock();
                state.broken = false;
                state.handles += 1;
                drop(state);
                Ok(Box::new(MockPort {
                    wire: self.wire.clone(),
                }))
            }
        }
    }
}

/// Shares one opener between the session under test and the test body
impl PortOpener for Arc<MockOpener> {
    fn open(&self, config: &PortConfig) -> Result<Box<dyn Port>> {
        self.as_ref().open(config)
    }
}
