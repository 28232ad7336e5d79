/// Numbered barriers with separate producer and consumer roles.
///
/// A generation starts with the first `signal` after the barrier went idle:
/// that caller fixes the producer/consumer counts and bumps the cookie. Later
/// signals in the same generation must carry the same counts. Consumers block
/// in `wait` until every producer of their generation has signaled; the last
/// consumer out returns the barrier to idle. Pure producers never block.
///
/// A lane that signals again before its previous generation has drained (or
/// arrives once the generation's producer/consumer quota is already full) is
/// deferred: it sleeps until the cookie moves or the barrier goes idle, then
/// retries against the new generation.
use parking_lot::{Condvar, Mutex};

use crate::control::{ABORT_POLL, LaunchControl};
use crate::error::{Result, SimError};

/// How a lane takes part in a named-barrier generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamedBarrierRole {
    ProducerConsumer,
    Producer,
    Consumer,
}

impl NamedBarrierRole {
    pub fn is_producer(self) -> bool {
        matches!(self, NamedBarrierRole::ProducerConsumer | NamedBarrierRole::Producer)
    }

    pub fn is_consumer(self) -> bool {
        matches!(self, NamedBarrierRole::ProducerConsumer | NamedBarrierRole::Consumer)
    }
}

/// Fixed-width set of lane indices.
#[derive(Debug, Clone, Default)]
struct LaneSet {
    words: Vec<u64>,
}

impl LaneSet {
    fn with_lanes(lanes: usize) -> Self {
        LaneSet { words: vec![0; lanes.div_ceil(64)] }
    }

    fn contains(&self, lane: usize) -> bool {
        self.words[lane / 64] & (1 << (lane % 64)) != 0
    }

    fn insert(&mut self, lane: usize) {
        self.words[lane / 64] |= 1 << (lane % 64);
    }

    fn remove(&mut self, lane: usize) {
        self.words[lane / 64] &= !(1 << (lane % 64));
    }

    fn clear(&mut self) {
        self.words.iter_mut().for_each(|w| *w = 0);
    }

    fn len(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }
}

#[derive(Debug)]
struct NamedState {
    lanes: usize,
    /// (producers, consumers) of the live generation; `None` while idle
    config: Option<(u32, u32)>,
    cookie: u64,
    signaled_producers: u32,
    signaled_consumers: u32,
    pending_consumers: u32,
    released_consumers: u32,
    participated: LaneSet,
    produced: LaneSet,
    consuming: LaneSet,
    generations: u64,
}

impl NamedState {
    fn end_generation(&mut self) {
        self.config = None;
        self.signaled_producers = 0;
        self.signaled_consumers = 0;
        self.pending_consumers = 0;
        self.released_consumers = 0;
        self.participated.clear();
        self.produced.clear();
        self.consuming.clear();
        self.generations += 1;
    }
}

#[derive(Debug)]
pub struct NamedBarrier {
    id: usize,
    state: Mutex<NamedState>,
    cvar: Condvar,
}

impl NamedBarrier {
    pub fn new(id: usize, lanes: usize) -> Self {
        NamedBarrier {
            id,
            state: Mutex::new(NamedState {
                lanes,
                config: None,
                cookie: 0,
                signaled_producers: 0,
                signaled_consumers: 0,
                pending_consumers: 0,
                released_consumers: 0,
                participated: LaneSet::with_lanes(lanes),
                produced: LaneSet::with_lanes(lanes),
                consuming: LaneSet::with_lanes(lanes),
                generations: 0,
            }),
            cvar: Condvar::new(),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Return to idle for a new group of `lanes` work items.
    pub fn reset(&self, lanes: usize) {
        let mut s = self.state.lock();
        if s.lanes != lanes {
            s.lanes = lanes;
            s.participated = LaneSet::with_lanes(lanes);
            s.produced = LaneSet::with_lanes(lanes);
            s.consuming = LaneSet::with_lanes(lanes);
        }
        s.end_generation();
        s.generations = 0;
        s.cookie = 0;
    }

    fn usage(&self, reason: String) -> SimError {
        SimError::NamedBarrierUsage { id: self.id, reason }
    }

    pub fn signal(
        &self,
        lane: usize,
        role: NamedBarrierRole,
        producers: u32,
        consumers: u32,
        control: &LaunchControl,
    ) -> Result<()> {
        let (is_producer, is_consumer) = (role.is_producer(), role.is_consumer());
        let mut s = self.state.lock();

        if lane >= s.lanes {
            return Err(self.usage(format!("lane {} outside group of {}", lane, s.lanes)));
        }
        if producers == 0 && consumers == 0 {
            return Err(self.usage("signal with zero producers and zero consumers".into()));
        }
        if producers as usize > s.lanes || consumers as usize > s.lanes {
            return Err(self.usage(format!(
                "{} producers / {} consumers in a group of {}",
                producers, consumers, s.lanes
            )));
        }
        if (is_producer && producers == 0) || (is_consumer && consumers == 0) {
            return Err(self.usage(format!(
                "lane {} signaled as {:?} with {} producers / {} consumers",
                lane, role, producers, consumers
            )));
        }

        loop {
            let config = s.config;
            let Some((want_p, want_c)) = config else {
                s.config = Some((producers, consumers));
                s.cookie += 1;
                log::trace!(
                    "named barrier {} generation {}: {} producers / {} consumers",
                    self.id,
                    s.cookie,
                    producers,
                    consumers
                );
                break;
            };

            let quota_full = s.participated.contains(lane)
                || (is_producer && s.signaled_producers >= want_p)
                || (is_consumer && s.signaled_consumers >= want_c);
            if quota_full {
                let seen = s.cookie;
                while s.cookie == seen && s.config.is_some() {
                    control.check()?;
                    self.cvar.wait_for(&mut s, ABORT_POLL);
                }
                continue;
            }

            if (want_p, want_c) != (producers, consumers) {
                return Err(SimError::NamedBarrierMismatch {
                    id: self.id,
                    lane,
                    expected_producers: want_p,
                    expected_consumers: want_c,
                    producers,
                    consumers,
                });
            }
            break;
        }

        s.participated.insert(lane);
        if is_consumer {
            s.consuming.insert(lane);
            s.signaled_consumers += 1;
            s.pending_consumers += 1;
        }
        if is_producer {
            s.produced.insert(lane);
            s.signaled_producers += 1;
            control.bump();
            if s.config == Some((s.signaled_producers, 0)) {
                s.end_generation();
            }
            self.cvar.notify_all();
        }
        Ok(())
    }

    /// Block a registered consumer until its generation's producers are all
    /// in. Lanes that are not consumers of the live generation return at once.
    pub fn wait(&self, lane: usize, control: &LaunchControl) -> Result<()> {
        let mut s = self.state.lock();
        if lane >= s.lanes || !s.consuming.contains(lane) {
            return Ok(());
        }

        loop {
            let config = s.config;
            let Some((want_p, want_c)) = config else {
                return Err(self.usage(format!("lane {} waiting on an idle barrier", lane)));
            };
            if s.signaled_producers >= want_p {
                s.consuming.remove(lane);
                s.pending_consumers -= 1;
                s.released_consumers += 1;
                control.bump();
                if s.released_consumers >= want_c {
                    s.end_generation();
                    self.cvar.notify_all();
                }
                return Ok(());
            }
            control.check()?;
            self.cvar.wait_for(&mut s, ABORT_POLL);
        }
    }

    /// Completed generations since the last reset.
    pub fn generations(&self) -> u64 {
        self.state.lock().generations
    }

    pub fn pending_consumers(&self) -> u32 {
        self.state.lock().pending_consumers
    }

    pub fn signaled_producers(&self) -> usize {
        self.state.lock().produced.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    use NamedBarrierRole::*;

    fn setup(lanes: usize) -> (Arc<NamedBarrier>, Arc<LaunchControl>) {
        (Arc::new(NamedBarrier::new(0, lanes)), Arc::new(LaunchControl::new()))
    }

    #[test]
    fn pure_producer_never_blocks() {
        let (nb, ctl) = setup(4);
        nb.signal(0, Producer, 1, 1, &ctl).unwrap();
        nb.wait(0, &ctl).unwrap();
        assert_eq!(nb.signaled_producers(), 1);
    }

    #[test]
    fn consumer_released_only_after_all_producers() {
        let (nb, ctl) = setup(4);
        let produced = Arc::new(AtomicUsize::new(0));

        let consumer = {
            let (nb, ctl, produced) = (Arc::clone(&nb), Arc::clone(&ctl), Arc::clone(&produced));
            thread::spawn(move || {
                nb.signal(3, Consumer, 3, 1, &ctl).unwrap();
                nb.wait(3, &ctl).unwrap();
                produced.load(Ordering::SeqCst)
            })
        };
        let producers: Vec<_> = (0..3)
            .map(|lane| {
                let (nb, ctl, produced) =
                    (Arc::clone(&nb), Arc::clone(&ctl), Arc::clone(&produced));
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(10 * (lane as u64 + 1)));
                    produced.fetch_add(1, Ordering::SeqCst);
                    nb.signal(lane, Producer, 3, 1, &ctl).unwrap();
                    nb.wait(lane, &ctl).unwrap();
                })
            })
            .collect();
        for p in producers {
            p.join().unwrap();
        }
        assert_eq!(consumer.join().unwrap(), 3);
        assert_eq!(nb.generations(), 1);
    }

    #[test]
    fn missing_producer_keeps_consumer_blocked() {
        let (nb, ctl) = setup(4);
        let released = Arc::new(AtomicBool::new(false));
        let consumer = {
            let (nb, ctl, released) = (Arc::clone(&nb), Arc::clone(&ctl), Arc::clone(&released));
            thread::spawn(move || {
                nb.signal(2, Consumer, 2, 1, &ctl).unwrap();
                let r = nb.wait(2, &ctl);
                released.store(true, Ordering::SeqCst);
                r
            })
        };
        nb.signal(0, Producer, 2, 1, &ctl).unwrap();
        thread::sleep(Duration::from_millis(60));
        assert!(!released.load(Ordering::SeqCst));
        assert_eq!(nb.pending_consumers(), 1);

        ctl.abort(SimError::Timeout { millis: 60 });
        assert!(matches!(consumer.join().unwrap(), Err(SimError::Aborted)));
    }

    #[test]
    fn mismatched_counts_mid_generation_fail() {
        let (nb, ctl) = setup(4);
        nb.signal(0, Producer, 2, 1, &ctl).unwrap();
        let err = nb.signal(1, Producer, 3, 1, &ctl).unwrap_err();
        assert!(matches!(
            err,
            SimError::NamedBarrierMismatch { expected_producers: 2, producers: 3, .. }
        ));
    }

    #[test]
    fn reconfigure_after_drain() {
        let (nb, ctl) = setup(4);
        nb.signal(0, Producer, 1, 1, &ctl).unwrap();
        nb.signal(1, Consumer, 1, 1, &ctl).unwrap();
        nb.wait(1, &ctl).unwrap();
        assert_eq!(nb.generations(), 1);

        // new counts are fine once the previous generation has drained
        nb.signal(0, Producer, 2, 2, &ctl).unwrap();
        nb.signal(1, Producer, 2, 2, &ctl).unwrap();
        nb.signal(2, Consumer, 2, 2, &ctl).unwrap();
        nb.signal(3, Consumer, 2, 2, &ctl).unwrap();
        nb.wait(2, &ctl).unwrap();
        nb.wait(3, &ctl).unwrap();
        assert_eq!(nb.generations(), 2);
    }

    #[test]
    fn early_resignal_is_deferred_to_next_generation() {
        let (nb, ctl) = setup(2);
        nb.signal(0, Producer, 1, 1, &ctl).unwrap();
        nb.signal(1, Consumer, 1, 1, &ctl).unwrap();

        // lane 0 produces for the next generation before lane 1 has left
        let eager = {
            let (nb, ctl) = (Arc::clone(&nb), Arc::clone(&ctl));
            thread::spawn(move || nb.signal(0, Producer, 1, 1, &ctl))
        };
        thread::sleep(Duration::from_millis(30));
        assert_eq!(nb.generations(), 0);
        assert!(!eager.is_finished());

        nb.wait(1, &ctl).unwrap();
        eager.join().unwrap().unwrap();
        assert_eq!(nb.generations(), 1);
        assert_eq!(nb.signaled_producers(), 1);
    }

    #[test]
    fn producer_consumer_lanes_meet() {
        const LANES: usize = 4;
        const ROUNDS: usize = 20;
        let (nb, ctl) = setup(LANES);
        let handles: Vec<_> = (0..LANES)
            .map(|lane| {
                let (nb, ctl) = (Arc::clone(&nb), Arc::clone(&ctl));
                thread::spawn(move || {
                    for _ in 0..ROUNDS {
                        nb.signal(lane, ProducerConsumer, LANES as u32, LANES as u32, &ctl)
                            .unwrap();
                        nb.wait(lane, &ctl).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(nb.generations(), ROUNDS as u64);
    }

    #[test]
    fn role_must_match_counts() {
        let (nb, ctl) = setup(4);
        assert!(matches!(
            nb.signal(0, Consumer, 1, 0, &ctl),
            Err(SimError::NamedBarrierUsage { .. })
        ));
        assert!(matches!(
            nb.signal(9, Producer, 1, 0, &ctl),
            Err(SimError::NamedBarrierUsage { .. })
        ));
    }

    #[test]
    fn producers_only_generation_ends_on_last_signal() {
        let (nb, ctl) = setup(4);
        nb.signal(0, Producer, 2, 0, &ctl).unwrap();
        nb.signal(1, Producer, 2, 0, &ctl).unwrap();
        assert_eq!(nb.generations(), 1);
        nb.signal(0, Producer, 3, 0, &ctl).unwrap();
    }
}
