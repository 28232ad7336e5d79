/// A one-slot wakeup: a thread parks on `wait` until someone `ring`s.
/// A ring that arrives before the wait is remembered, so no wakeup is lost.
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
pub struct Bell {
    rung: Mutex<bool>,
    cvar: Condvar,
}

impl Bell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ring(&self) {
        let mut rung = self.rung.lock();
        *rung = true;
        self.cvar.notify_one();
    }

    /// Park until rung, consuming the ring.
    pub fn wait(&self) {
        let mut rung = self.rung.lock();
        while !*rung {
            self.cvar.wait(&mut rung);
        }
        *rung = false;
    }

    /// Park until rung or `timeout` elapses. Returns whether a ring was consumed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut rung = self.rung.lock();
        if !*rung {
            self.cvar.wait_for(&mut rung, timeout);
        }
        std::mem::replace(&mut *rung, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn ring_before_wait_is_kept() {
        let bell = Bell::new();
        bell.ring();
        bell.wait();
        assert!(!bell.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn wakes_parked_thread() {
        let bell = Arc::new(Bell::new());
        let waiter = {
            let bell = Arc::clone(&bell);
            thread::spawn(move || bell.wait())
        };
        thread::sleep(Duration::from_millis(20));
        bell.ring();
        waiter.join().unwrap();
    }

    #[test]
    fn timeout_without_ring() {
        let bell = Bell::new();
        assert!(!bell.wait_timeout(Duration::from_millis(5)));
    }
}
