/// Work-item threads: the OS threads that back the lanes of resident groups.
///
/// A `WorkItemThread` runs one lane assignment at a time, a fixed
/// (local index, resident slot) pair, and walks that slot's stripe of the
/// grid: `slot, slot + R, slot + 2R, ...`. Between assignments it parks on its
/// bell, so the `WorkerPool` can hand the same OS thread to a later launch.
///
/// Lifecycle: Unspawned -> Running -> {Suspended <-> Running} -> Completed
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::JoinHandle;

use parking_lot::Mutex;

use crate::bell::Bell;
use crate::context::ItemCtx;
use crate::current::{self, Identity};
use crate::error::{Result, SimError};
use crate::scheduler::{LaneReport, Launch};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaneState {
    Unspawned,
    Running,
    Suspended,
    Completed,
}

impl std::fmt::Display for LaneState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LaneState::Unspawned => write!(f, "Unspawned"),
            LaneState::Running   => write!(f, "Running"),
            LaneState::Suspended => write!(f, "Suspended"),
            LaneState::Completed => write!(f, "Completed"),
        }
    }
}

/// One lane of one launch, bound to a resident slot.
pub struct LaneAssignment {
    pub(crate) launch: Arc<Launch>,
    pub local_index: u32,
    pub slot: u32,
}

impl LaneAssignment {
    pub(crate) fn new(launch: Arc<Launch>, local_index: u32, slot: u32) -> Self {
        LaneAssignment {
            launch,
            local_index,
            slot,
        }
    }

    /// Walk every group of this lane's stripe, then build the completion report.
    fn run(&self) -> LaneReport {
        let launch = &self.launch;
        let mut stripe = launch.plan.groups_for_slot(self.slot);
        let mut iteration = 0usize;
        let mut groups_run = 0u32;

        let outcome = loop {
            let Some(group) = self.next_group(&mut stripe) else {
                break Ok(());
            };
            match self.execute(iteration, group) {
                Ok(()) => groups_run += 1,
                Err(e) => {
                    launch.control.abort(e.clone());
                    break Err(e);
                }
            }
            iteration += 1;
        };

        LaneReport {
            local_index: self.local_index,
            slot: self.slot,
            groups_run,
            outcome,
        }
    }

    /// Next group of the stripe, unless the launch has been torn down.
    fn next_group(&self, stripe: &mut impl Iterator<Item = u32>) -> Option<u32> {
        if self.launch.control.is_aborted() {
            return None;
        }
        stripe.next()
    }

    /// Run the kernel once for `group` on the slot's `iteration`-th buffer.
    fn execute(&self, iteration: usize, group: u32) -> Result<()> {
        let launch = &self.launch;
        let resources = &launch.slots[self.slot as usize];
        let state = resources.acquire(iteration, group as usize, &launch.control)?;

        let identity = Identity::new(
            self.local_index,
            group,
            launch.config.group_dim,
            launch.config.grid_dim,
        );
        let ctx = ItemCtx::new(identity, state, &launch.control);
        let result = {
            let _bound = current::bind(identity);
            panic::catch_unwind(AssertUnwindSafe(|| (launch.kernel.func)(&ctx, &launch.args[..])))
        };
        drop(ctx);

        launch.record_invocation();
        let retired = resources.retire(iteration);
        if retired.last {
            launch.record_group(self.slot, group, retired);
        }

        let lane = self.local_index as usize;
        let group = group as usize;
        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(SimError::Aborted)) => Err(SimError::Aborted),
            Ok(Err(SimError::KernelFailed { message, .. })) => Err(SimError::KernelFailed {
                kernel: launch.kernel.name.to_string(),
                group,
                lane,
                message,
            }),
            Ok(Err(e)) => {
                log::error!(
                    "kernel '{}' group {} lane {}: {}",
                    launch.kernel.name,
                    group,
                    lane,
                    e
                );
                Err(e)
            }
            Err(payload) => Err(SimError::KernelPanicked {
                kernel: launch.kernel.name.to_string(),
                group,
                lane,
                message: panic_message(payload.as_ref()),
            }),
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

struct Mailbox {
    job: Mutex<Option<LaneAssignment>>,
    state: Mutex<LaneState>,
    bell: Bell,
    /// Held by the dispatcher from hand-out until the lane has reported
    claimed: AtomicBool,
    closing: AtomicBool,
}

impl Mailbox {
    fn set_state(&self, state: LaneState) {
        *self.state.lock() = state;
    }

    /// Park the OS thread until the pool rings with new work or shutdown.
    fn suspend(&self) {
        self.set_state(LaneState::Suspended);
        self.bell.wait();
    }
}

pub struct WorkItemThread {
    id: usize,
    mailbox: Arc<Mailbox>,
    handle: Option<JoinHandle<()>>,
}

impl WorkItemThread {
    pub fn new(id: usize) -> Self {
        WorkItemThread {
            id,
            mailbox: Arc::new(Mailbox {
                job: Mutex::new(None),
                state: Mutex::new(LaneState::Unspawned),
                bell: Bell::new(),
                claimed: AtomicBool::new(false),
                closing: AtomicBool::new(false),
            }),
            handle: None,
        }
    }

    /// A worker that completes after its first assignment.
    pub fn one_shot(id: usize) -> Self {
        let worker = Self::new(id);
        worker.mailbox.closing.store(true, Ordering::Release);
        worker
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn state(&self) -> LaneState {
        *self.mailbox.state.lock()
    }

    /// Reserve an idle worker for a new assignment.
    pub fn try_claim(&self) -> bool {
        if self.state() == LaneState::Completed || self.mailbox.closing.load(Ordering::Acquire) {
            return false;
        }
        self.mailbox
            .claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_claimed(&self) -> bool {
        self.mailbox.claimed.load(Ordering::Acquire)
    }

    /// Hand over an assignment, spawning the OS thread on first use.
    pub fn resume(&mut self, job: LaneAssignment) -> Result<()> {
        self.mailbox.claimed.store(true, Ordering::Release);
        *self.mailbox.job.lock() = Some(job);
        if self.handle.is_none() {
            self.spawn()
        } else {
            self.mailbox.bell.ring();
            Ok(())
        }
    }

    fn spawn(&mut self) -> Result<()> {
        let mailbox = Arc::clone(&self.mailbox);
        mailbox.set_state(LaneState::Running);
        let handle = std::thread::Builder::new()
            .name(format!("gridsim-lane-{}", self.id))
            .spawn(move || worker_main(mailbox))
            .map_err(|e| {
                self.mailbox.set_state(LaneState::Unspawned);
                self.mailbox.claimed.store(false, Ordering::Release);
                self.mailbox.job.lock().take();
                SimError::Spawn(e.to_string())
            })?;
        self.handle = Some(handle);
        Ok(())
    }

    /// Finish the thread. Only call on a worker that is not mid-assignment.
    pub fn complete(&mut self) {
        self.mailbox.closing.store(true, Ordering::Release);
        self.mailbox.bell.ring();
        self.join();
        self.mailbox.set_state(LaneState::Completed);
    }

    /// Join the OS thread if one was spawned.
    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("worker {} exited by panic", self.id);
            }
        }
    }
}

fn worker_main(mailbox: Arc<Mailbox>) {
    loop {
        let job = mailbox.job.lock().take();
        match job {
            Some(job) => {
                mailbox.set_state(LaneState::Running);
                let report = job.run();
                mailbox.set_state(LaneState::Suspended);
                mailbox.claimed.store(false, Ordering::Release);
                job.launch.report(report);
            }
            None if mailbox.closing.load(Ordering::Acquire) => break,
            None => mailbox.suspend(),
        }
    }
    mailbox.set_state(LaneState::Completed);
}

/// How a dispatch was served.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchCounts {
    pub reused: usize,
    pub spawned: usize,
}

/// Long-lived workers shared by every launch of a device.
#[derive(Default)]
pub struct WorkerPool {
    workers: Mutex<Vec<WorkItemThread>>,
    next_id: AtomicUsize,
}

impl WorkerPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Give each assignment to a suspended worker, spawning only when none
    /// is free.
    pub fn dispatch(&self, jobs: Vec<LaneAssignment>) -> Result<DispatchCounts> {
        let mut workers = self.workers.lock();
        let mut counts = DispatchCounts::default();
        let mut cursor = 0;

        for job in jobs {
            let free = workers[cursor..]
                .iter()
                .position(|w| w.try_claim())
                .map(|i| cursor + i);
            match free {
                Some(i) => {
                    cursor = i + 1;
                    counts.reused += 1;
                    workers[i].resume(job)?;
                }
                None => {
                    cursor = workers.len();
                    let mut worker =
                        WorkItemThread::new(self.next_id.fetch_add(1, Ordering::Relaxed));
                    worker.resume(job)?;
                    workers.push(worker);
                    cursor += 1;
                    counts.spawned += 1;
                }
            }
        }
        if counts.reused > 0 {
            log::debug!("reused {} suspended workers, spawned {}", counts.reused, counts.spawned);
        }
        Ok(counts)
    }

    /// Fresh workers that exit after their assignment; nothing is reused.
    pub fn dispatch_one_shot(&self, jobs: Vec<LaneAssignment>) -> Result<Vec<WorkItemThread>> {
        jobs.into_iter()
            .map(|job| {
                let mut worker =
                    WorkItemThread::one_shot(self.next_id.fetch_add(1, Ordering::Relaxed));
                worker.resume(job)?;
                Ok(worker)
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.workers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn states(&self) -> Vec<LaneState> {
        self.workers.lock().iter().map(|w| w.state()).collect()
    }

    /// Complete idle workers. Workers still holding an assignment (a lane
    /// abandoned after an abort) are detached instead of joined.
    pub fn shutdown(&self) {
        let mut workers = self.workers.lock();
        for mut worker in workers.drain(..) {
            if worker.try_claim() || worker.handle.is_none() {
                worker.complete();
            } else {
                log::warn!("detaching worker {} still in state {}", worker.id, worker.state());
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
