//! Deadline watchdog
//!
//! One background thread per executor sleeps until the armed deadline and
//! then raises a flag that the generated metering path reads on every
//! basic block. Arming, disarming and raising all happen under one lock,
//! so a flag can never be raised for a deadline that was already disarmed.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use super::error::ExecutionError;

#[derive(Debug, Default)]
struct State {
    deadline: Option<Instant>,
    shutdown: bool,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<State>,
    wake: Condvar,
    flag: AtomicU32,
}

/// Raises a flag once the armed deadline passes
#[derive(Debug, Default)]
pub(crate) struct Watchdog {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl Watchdog {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Address generated code polls; nonzero means the deadline passed
    pub(crate) fn flag(&self) -> *const AtomicU32 {
        &self.shared.flag
    }

    pub(crate) fn is_raised(&self) -> bool {
        self.shared.flag.load(Ordering::Acquire) != 0
    }

    /// Start timing a call, spawning the thread on first use
    pub(crate) fn arm(&mut self, deadline: Instant) -> Result<(), ExecutionError> {
        if self.thread.is_none() {
            let shared = Arc::clone(&self.shared);
            let handle = thread::Builder::new()
                .name("ocvm-watchdog".to_string())
                .spawn(move || run(&shared))
                .map_err(|e| ExecutionError::Resource(format!("Failed to spawn watchdog: {}", e)))?;
            self.thread = Some(handle);
        }

        let mut state = self.shared.state.lock();
        self.shared.flag.store(0, Ordering::Release);
        state.deadline = Some(deadline);
        self.shared.wake.notify_one();
        Ok(())
    }

    /// Stop timing and clear the flag
    pub(crate) fn disarm(&self) {
        let mut state = self.shared.state.lock();
        state.deadline = None;
        self.shared.flag.store(0, Ordering::Release);
        self.shared.wake.notify_one();
    }
}

fn run(shared: &Shared) {
    let mut state = shared.state.lock();
    loop {
        if state.shutdown {
            return;
        }
        match state.deadline {
            None => shared.wake.wait(&mut state),
            Some(deadline) if Instant::now() >= deadline => {
                log::debug!("Execution deadline passed");
                shared.flag.store(1, Ordering::Release);
                state.deadline = None;
            }
            Some(deadline) => {
                shared.wake.wait_until(&mut state, deadline);
            }
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        if let Some(handle) = self.thread.take() {
            self.shared.state.lock().shutdown = true;
            self.shared.wake.notify_one();
            let _ = handle.join();
        }
    }
}
