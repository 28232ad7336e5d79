/// Kernel scheduling: plans the pool, hands one lane assignment per pool
/// thread to the workers and watches the launch until every lane reports.
///
/// Groups are distributed round-robin over the resident slots; within a slot
/// they run in index order. The watchdog in [`LaunchHandle::wait`] aborts a
/// launch that makes no forward progress (no barrier release, no completed
/// group, no lane report) for the configured timeout.
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::control::LaunchControl;
use crate::error::{Result, SimError};
use crate::group::{Retired, SlotResources};
use crate::kernel::{Kernel, LaunchConfig};
use crate::metrics::{LaunchSnapshot, MetricsSink, now_ms};
use crate::occupancy::PoolPlan;
use crate::platform::PlatformConfig;
use crate::work_item::{DispatchCounts, LaneAssignment, WorkItemThread, WorkerPool};

/// How often the watchdog re-checks progress while no lane reports.
const WATCHDOG_TICK: Duration = Duration::from_millis(10);

/// How long aborted lanes get to report before they are abandoned.
const ABANDON_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LaunchMode {
    /// R resident groups, double-buffered group state, pooled workers
    Pipelined,
    /// One resident group, single-buffered, fresh workers; groups run in order
    Debug,
}

impl std::fmt::Display for LaunchMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LaunchMode::Pipelined => write!(f, "pipelined"),
            LaunchMode::Debug     => write!(f, "debug"),
        }
    }
}

/// Statistics collected during a kernel launch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchStats {
    pub kernel_name: String,
    pub mode: LaunchMode,
    pub plan: PoolPlan,
    pub groups_executed: u32,
    pub work_items_executed: u64,
    /// Index = resident slot
    pub slot_groups_executed: Vec<u32>,
    /// Group indices in the order their last lane retired
    pub completion_order: Vec<u32>,
    pub barrier_releases: u64,
    pub named_barrier_generations: u64,
    pub workers_spawned: usize,
    pub workers_reused: usize,
    pub elapsed_ms: f64,
}

/// What a lane sends back when its stripe is done or it gave up.
#[derive(Debug)]
pub struct LaneReport {
    pub local_index: u32,
    pub slot: u32,
    pub groups_run: u32,
    pub outcome: Result<()>,
}

#[derive(Debug)]
struct Tally {
    groups: AtomicU32,
    work_items: AtomicU64,
    barrier_releases: AtomicU64,
    named_generations: AtomicU64,
    per_slot: Vec<AtomicU32>,
    order: Mutex<Vec<u32>>,
}

/// State shared by every lane of one launch.
pub(crate) struct Launch {
    pub(crate) kernel: Kernel,
    pub(crate) config: LaunchConfig,
    pub(crate) args: Vec<u8>,
    pub(crate) plan: PoolPlan,
    pub(crate) mode: LaunchMode,
    pub(crate) slots: Vec<SlotResources>,
    pub(crate) control: LaunchControl,
    reports: Sender<LaneReport>,
    tally: Tally,
    metrics: Option<MetricsSink>,
    started: Instant,
}

impl Launch {
    pub(crate) fn record_invocation(&self) {
        self.tally.work_items.fetch_add(1, Ordering::Relaxed);
    }

    /// Called by the last lane out of `group`.
    pub(crate) fn record_group(&self, slot: u32, group: u32, retired: Retired) {
        let t = &self.tally;
        t.groups.fetch_add(1, Ordering::AcqRel);
        t.per_slot[slot as usize].fetch_add(1, Ordering::Relaxed);
        t.barrier_releases.fetch_add(retired.barrier_releases, Ordering::Relaxed);
        t.named_generations.fetch_add(retired.named_generations, Ordering::Relaxed);
        t.order.lock().push(group);
        self.control.bump();
        self.publish("running", None);
    }

    pub(crate) fn report(&self, report: LaneReport) {
        if self.reports.send(report).is_err() {
            log::debug!("launch '{}' no longer collecting lane reports", self.kernel.name);
        }
    }

    fn snapshot(&self, status: &str, error: Option<String>) -> LaunchSnapshot {
        let t = &self.tally;
        LaunchSnapshot {
            status: status.to_string(),
            kernel_name: self.kernel.name.to_string(),
            mode: self.mode.to_string(),
            grid: self.config.grid_dim.as_array(),
            group: self.config.group_dim.as_array(),
            resident_slots: self.plan.resident_slots,
            pool_threads: self.plan.pool_threads,
            limiter: self.plan.limiter.to_string(),
            thread_utilization: self.plan.thread_utilization(&self.config),
            groups_total: self.plan.total_groups,
            groups_executed: t.groups.load(Ordering::Acquire),
            work_items_executed: t.work_items.load(Ordering::Relaxed),
            slot_groups_executed: t.per_slot.iter().map(|n| n.load(Ordering::Relaxed)).collect(),
            barrier_releases: t.barrier_releases.load(Ordering::Relaxed),
            named_barrier_generations: t.named_generations.load(Ordering::Relaxed),
            error,
            timestamp_ms: now_ms(),
        }
    }

    fn publish(&self, status: &str, error: Option<String>) {
        if let Some(sink) = &self.metrics {
            sink.publish(&self.snapshot(status, error));
        }
    }

    fn stats(&self, dispatch: DispatchCounts) -> LaunchStats {
        let t = &self.tally;
        LaunchStats {
            kernel_name: self.kernel.name.to_string(),
            mode: self.mode,
            plan: self.plan.clone(),
            groups_executed: t.groups.load(Ordering::Acquire),
            work_items_executed: t.work_items.load(Ordering::Relaxed),
            slot_groups_executed: t.per_slot.iter().map(|n| n.load(Ordering::Relaxed)).collect(),
            completion_order: t.order.lock().clone(),
            barrier_releases: t.barrier_releases.load(Ordering::Relaxed),
            named_barrier_generations: t.named_generations.load(Ordering::Relaxed),
            workers_spawned: dispatch.spawned,
            workers_reused: dispatch.reused,
            elapsed_ms: self.started.elapsed().as_secs_f64() * 1000.0,
        }
    }
}

/// Starts launches on a device's worker pool.
pub struct KernelScheduler<'a> {
    pool: &'a WorkerPool,
    platform: &'a PlatformConfig,
    metrics: Option<&'a Path>,
}

impl<'a> KernelScheduler<'a> {
    pub fn new(pool: &'a WorkerPool, platform: &'a PlatformConfig, metrics: Option<&'a Path>) -> Self {
        KernelScheduler {
            pool,
            platform,
            metrics,
        }
    }

    /// Plan the pool and dispatch every lane. Returns once the lanes are
    /// running; configuration errors are reported before anything starts.
    pub fn launch(
        &self,
        kernel: &Kernel,
        config: &LaunchConfig,
        args: &[u8],
        mode: LaunchMode,
    ) -> Result<LaunchHandle> {
        let plan = PoolPlan::compute(config, self.platform)?;
        let (plan, depth) = match mode {
            LaunchMode::Pipelined => (plan, 2),
            LaunchMode::Debug => (plan.serialized(), 1),
        };

        log::info!(
            "launching kernel '{}' ({}): grid=({},{},{}) group=({},{},{}) resident={} threads={} limited by {}",
            kernel.name,
            mode,
            config.grid_dim.x, config.grid_dim.y, config.grid_dim.z,
            config.group_dim.x, config.group_dim.y, config.group_dim.z,
            plan.resident_slots,
            plan.pool_threads,
            plan.limiter,
        );

        let slots = (0..plan.resident_slots)
            .map(|slot| SlotResources::new(slot as usize, plan.group_size as usize, depth, self.platform))
            .collect();
        let (tx, rx) = channel::unbounded();
        let launch = Arc::new(Launch {
            kernel: kernel.clone(),
            config: config.clone(),
            args: args.to_vec(),
            mode,
            slots,
            control: LaunchControl::new(),
            reports: tx,
            tally: Tally {
                groups: AtomicU32::new(0),
                work_items: AtomicU64::new(0),
                barrier_releases: AtomicU64::new(0),
                named_generations: AtomicU64::new(0),
                per_slot: (0..plan.resident_slots).map(|_| AtomicU32::new(0)).collect(),
                order: Mutex::new(Vec::with_capacity(plan.total_groups as usize)),
            },
            metrics: self.metrics.map(MetricsSink::new),
            started: Instant::now(),
            plan,
        });
        launch.publish("running", None);

        let jobs: Vec<LaneAssignment> = (0..launch.plan.resident_slots)
            .flat_map(|slot| (0..launch.plan.group_size).map(move |lane| (slot, lane)))
            .map(|(slot, lane)| LaneAssignment::new(Arc::clone(&launch), lane, slot))
            .collect();

        let dispatched = match mode {
            LaunchMode::Pipelined => self.pool.dispatch(jobs).map(|counts| (counts, Vec::new())),
            LaunchMode::Debug => self.pool.dispatch_one_shot(jobs).map(|workers| {
                let counts = DispatchCounts {
                    reused: 0,
                    spawned: workers.len(),
                };
                (counts, workers)
            }),
        };
        let (dispatch, one_shot) = match dispatched {
            Ok(d) => d,
            Err(e) => {
                launch.control.abort(e.clone());
                launch.publish("failed", Some(e.to_string()));
                return Err(e);
            }
        };

        let timeout = config.timeout.unwrap_or_else(|| self.platform.parallel_timeout());
        Ok(LaunchHandle {
            launch,
            reports: rx,
            one_shot,
            dispatch,
            timeout,
            finished: false,
        })
    }
}

/// A running launch. Dropping it without calling [`LaunchHandle::wait`]
/// still blocks until the launch has finished.
pub struct LaunchHandle {
    launch: Arc<Launch>,
    reports: Receiver<LaneReport>,
    one_shot: Vec<WorkItemThread>,
    dispatch: DispatchCounts,
    timeout: Duration,
    finished: bool,
}

impl LaunchHandle {
    pub fn kernel_name(&self) -> &str {
        &self.launch.kernel.name
    }

    pub fn plan(&self) -> &PoolPlan {
        &self.launch.plan
    }

    /// Groups fully completed so far.
    pub fn groups_executed(&self) -> u32 {
        self.launch.tally.groups.load(Ordering::Acquire)
    }

    /// Block until every lane has reported, or the launch was aborted and the
    /// stragglers were abandoned. Returns the first failure, if any.
    pub fn wait(mut self) -> Result<LaunchStats> {
        self.finish()
    }

    fn finish(&mut self) -> Result<LaunchStats> {
        self.finished = true;
        let launch = &self.launch;
        let control = &launch.control;

        let mut outstanding = launch.plan.pool_threads as usize;
        let mut last_progress = control.progress();
        let mut last_change = Instant::now();
        let mut aborted_at: Option<Instant> = None;

        while outstanding > 0 {
            match self.reports.recv_timeout(WATCHDOG_TICK) {
                Ok(report) => {
                    outstanding -= 1;
                    last_change = Instant::now();
                    if let Err(e) = &report.outcome {
                        log::debug!(
                            "lane {} of slot {} stopped after {} groups: {}",
                            report.local_index,
                            report.slot,
                            report.groups_run,
                            e
                        );
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }

            let progress = control.progress();
            if progress != last_progress {
                last_progress = progress;
                last_change = Instant::now();
            } else if !control.is_aborted() && last_change.elapsed() >= self.timeout {
                log::warn!(
                    "kernel '{}' made no progress for {:?}; {} lanes still running",
                    launch.kernel.name,
                    self.timeout,
                    outstanding
                );
                control.abort(SimError::Timeout {
                    millis: self.timeout.as_millis() as u64,
                });
            }

            if control.is_aborted() {
                let since = *aborted_at.get_or_insert_with(Instant::now);
                if outstanding > 0 && since.elapsed() >= ABANDON_GRACE {
                    log::warn!(
                        "abandoning {} lanes of kernel '{}' that did not stop after abort",
                        outstanding,
                        launch.kernel.name
                    );
                    break;
                }
            }
        }

        if outstanding == 0 {
            for worker in &mut self.one_shot {
                worker.join();
            }
        }
        // anything left is detached
        self.one_shot.clear();

        let stats = launch.stats(self.dispatch);
        if let Some(err) = control.failure() {
            launch.publish("failed", Some(err.to_string()));
            return Err(err);
        }
        if control.is_aborted() || outstanding > 0 {
            launch.publish("failed", Some(SimError::Aborted.to_string()));
            return Err(SimError::Aborted);
        }

        launch.publish("complete", None);
        log::info!(
            "kernel '{}' complete: {} groups, {} work items, {} barrier releases in {:.2}ms",
            stats.kernel_name,
            stats.groups_executed,
            stats.work_items_executed,
            stats.barrier_releases,
            stats.elapsed_ms,
        );
        Ok(stats)
    }
}

impl Drop for LaunchHandle {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.finish() {
                log::warn!("launch '{}' dropped unwaited: {}", self.launch.kernel.name, e);
            }
        }
    }
}
