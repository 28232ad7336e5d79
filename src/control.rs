/// Launch-wide abort flag, first-failure record and forward-progress counter.
///
/// Every blocking wait in the engine sleeps on its condition variable for at
/// most `ABORT_POLL` at a time and re-checks `is_aborted`, so an abort reaches
/// all lanes without the aborter having to know where they are parked.
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{Result, SimError};

pub const ABORT_POLL: Duration = Duration::from_millis(5);

#[derive(Debug, Default)]
pub struct LaunchControl {
    aborted: AtomicBool,
    progress: AtomicU64,
    failure: Mutex<Option<SimError>>,
}

impl LaunchControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// `Err(Aborted)` once the launch has been torn down.
    pub fn check(&self) -> Result<()> {
        if self.is_aborted() {
            Err(SimError::Aborted)
        } else {
            Ok(())
        }
    }

    /// Abort the launch. Only the first non-abort error is kept.
    pub fn abort(&self, error: SimError) {
        if !error.is_abort() {
            let mut failure = self.failure.lock();
            if failure.is_none() {
                log::error!("aborting launch: {}", error);
                *failure = Some(error);
            }
        }
        self.aborted.store(true, Ordering::Release);
    }

    pub fn failure(&self) -> Option<SimError> {
        self.failure.lock().clone()
    }

    pub fn bump(&self) {
        self.progress.fetch_add(1, Ordering::Relaxed);
    }

    pub fn progress(&self) -> u64 {
        self.progress.load(Ordering::Relaxed)
    }
}
