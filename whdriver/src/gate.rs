/// Single-reader wait point.
///
/// The blocking read parks here until data is published, the watchdog gives
/// up, or the device is released. The data predicate is evaluated under the
/// gate lock and producers publish before taking that lock, so a wake-up
/// that lands between "check empty" and "sleep" is never lost.

use parking_lot::{Condvar, Mutex};

use crate::error::DriverError;

/// Condition that ends a read without data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Abort {
    Timeout,
    Shutdown,
}

impl From<Abort> for DriverError {
    fn from(abort: Abort) -> Self {
        match abort {
            Abort::Timeout => DriverError::Timeout,
            Abort::Shutdown => DriverError::Shutdown,
        }
    }
}

#[derive(Debug, Default)]
struct GateState {
    waiting: bool,
    pending: Option<Abort>,
}

#[derive(Default)]
pub struct ReaderGate {
    state: Mutex<GateState>,
    wake: Condvar,
}

impl ReaderGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until `has_data` holds or an abort is posted. A pending abort
    /// wins over data and is consumed by this call.
    pub fn wait<F>(&self, has_data: F) -> Result<(), DriverError>
    where
        F: Fn() -> bool,
    {
        let mut state = self.state.lock();
        loop {
            if let Some(abort) = state.pending.take() {
                state.waiting = false;
                return Err(abort.into());
            }
            if has_data() {
                state.waiting = false;
                return Ok(());
            }
            state.waiting = true;
            self.wake.wait(&mut state);
        }
    }

    /// Data was published.
    pub fn notify(&self) {
        let mut state = self.state.lock();
        if state.waiting {
            state.waiting = false;
            self.wake.notify_one();
        }
    }

    /// Record an abort for the current or next read and wake any waiter.
    pub fn post(&self, abort: Abort) {
        let mut state = self.state.lock();
        state.pending = Some(abort);
        state.waiting = false;
        self.wake.notify_one();
    }

    /// Watchdog path: only a reader that is actually parked times out.
    pub fn timeout_waiter(&self) -> bool {
        let mut state = self.state.lock();
        if !state.waiting {
            return false;
        }
        state.pending = Some(Abort::Timeout);
        state.waiting = false;
        self.wake.notify_one();
        true
    }

    pub fn is_waiting(&self) -> bool {
        self.state.lock().waiting
    }

    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.pending = None;
        state.waiting = false;
    }
}
