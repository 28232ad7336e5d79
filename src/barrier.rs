/// Sense-reversing group barrier.
///
/// `signal` counts an arrival; the last arrival resets the count and flips the
/// shared sense. `wait` blocks until the shared sense has moved past the
/// caller's local sense, then advances the local copy. Both halves are
/// required from every participant, and the barrier can be reused any number
/// of times without a reset.
use parking_lot::{Condvar, Mutex};

use crate::control::{ABORT_POLL, LaunchControl};
use crate::error::Result;

#[derive(Debug)]
struct BarrierState {
    parties: usize,
    arrived: usize,
    sense: bool,
    releases: u64,
}

#[derive(Debug)]
pub struct GroupBarrier {
    state: Mutex<BarrierState>,
    cvar: Condvar,
}

impl GroupBarrier {
    pub fn new(parties: usize) -> Self {
        GroupBarrier {
            state: Mutex::new(BarrierState {
                parties,
                arrived: 0,
                sense: false,
                releases: 0,
            }),
            cvar: Condvar::new(),
        }
    }

    /// Rearm for a new group. Callers start over with a local sense of `false`.
    pub fn reset(&self, parties: usize) {
        let mut s = self.state.lock();
        s.parties = parties;
        s.arrived = 0;
        s.sense = false;
        s.releases = 0;
    }

    pub fn signal(&self, control: &LaunchControl) {
        let mut s = self.state.lock();
        s.arrived += 1;
        if s.arrived >= s.parties {
            s.arrived = 0;
            s.sense = !s.sense;
            s.releases += 1;
            control.bump();
            self.cvar.notify_all();
        }
    }

    /// Block until the phase `local_sense` was waiting on has been released.
    pub fn wait(&self, local_sense: &mut bool, control: &LaunchControl) -> Result<()> {
        let target = !*local_sense;
        let mut s = self.state.lock();
        while s.sense != target {
            control.check()?;
            self.cvar.wait_for(&mut s, ABORT_POLL);
        }
        *local_sense = target;
        Ok(())
    }

    /// Releases since the last reset.
    pub fn releases(&self) -> u64 {
        self.state.lock().releases
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SimError;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn nobody_leaves_before_everyone_signals() {
        const N: usize = 6;
        let barrier = Arc::new(GroupBarrier::new(N));
        let control = Arc::new(LaunchControl::new());
        let arrived = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..N)
            .map(|i| {
                let (barrier, control, arrived) =
                    (Arc::clone(&barrier), Arc::clone(&control), Arc::clone(&arrived));
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(3 * i as u64));
                    arrived.fetch_add(1, Ordering::SeqCst);
                    let mut sense = false;
                    barrier.signal(&control);
                    barrier.wait(&mut sense, &control).unwrap();
                    assert_eq!(arrived.load(Ordering::SeqCst), N);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(barrier.releases(), 1);
    }

    #[test]
    fn reuse_keeps_phases_apart() {
        const N: usize = 4;
        const ROUNDS: usize = 50;
        let barrier = Arc::new(GroupBarrier::new(N));
        let control = Arc::new(LaunchControl::new());
        let counters: Arc<Vec<AtomicUsize>> =
            Arc::new((0..ROUNDS).map(|_| AtomicUsize::new(0)).collect());

        let handles: Vec<_> = (0..N)
            .map(|_| {
                let (barrier, control, counters) =
                    (Arc::clone(&barrier), Arc::clone(&control), Arc::clone(&counters));
                thread::spawn(move || {
                    let mut sense = false;
                    for round in 0..ROUNDS {
                        counters[round].fetch_add(1, Ordering::SeqCst);
                        barrier.signal(&control);
                        barrier.wait(&mut sense, &control).unwrap();
                        assert_eq!(counters[round].load(Ordering::SeqCst), N);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(barrier.releases(), ROUNDS as u64);
    }

    #[test]
    fn split_phase_signal_then_wait() {
        let barrier = Arc::new(GroupBarrier::new(2));
        let control = Arc::new(LaunchControl::new());
        let mut sense_a = false;
        barrier.signal(&control);
        let other = {
            let (barrier, control) = (Arc::clone(&barrier), Arc::clone(&control));
            thread::spawn(move || {
                let mut sense = false;
                barrier.signal(&control);
                barrier.wait(&mut sense, &control).unwrap();
            })
        };
        barrier.wait(&mut sense_a, &control).unwrap();
        other.join().unwrap();
        assert!(sense_a);
    }

    #[test]
    fn abort_releases_waiters() {
        let barrier = Arc::new(GroupBarrier::new(2));
        let control = Arc::new(LaunchControl::new());
        let waiter = {
            let (barrier, control) = (Arc::clone(&barrier), Arc::clone(&control));
            thread::spawn(move || {
                let mut sense = false;
                barrier.signal(&control);
                barrier.wait(&mut sense, &control)
            })
        };
        thread::sleep(Duration::from_millis(20));
        control.abort(SimError::Aborted);
        assert!(matches!(waiter.join().unwrap(), Err(SimError::Aborted)));
    }
}
