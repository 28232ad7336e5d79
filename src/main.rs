use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use parking_lot::Mutex;

use gridsim::metrics::DEFAULT_METRICS_PATH;
use gridsim::{Device, Dim3, Kernel, LaunchConfig, PlatformConfig, SimError};

#[derive(Parser)]
#[command(name = "gridsim")]
#[command(about = "Run a demo kernel on the simulated compute grid", long_about = None)]
struct Cli {
    /// Demo kernel to run
    #[arg(short, long, value_enum, default_value = "reduce")]
    kernel: Demo,

    /// Number of groups (1D grid)
    #[arg(short, long, default_value = "64")]
    groups: u32,

    /// Work items per group
    #[arg(short = 's', long, default_value = "16")]
    group_size: u32,

    /// Groups resident at once
    #[arg(short, long, default_value = "4")]
    resident: u32,

    /// OS threads allowed for the launch
    #[arg(short, long, default_value = "64")]
    threads: u32,

    /// Run one group at a time, in index order
    #[arg(long)]
    debug: bool,

    /// Platform limits as JSON
    #[arg(short, long, value_name = "FILE")]
    platform: Option<PathBuf>,

    /// Publish live snapshots for gridsim-viz
    #[arg(long)]
    live: bool,

    /// Snapshot file used with --live
    #[arg(long, value_name = "FILE", default_value = DEFAULT_METRICS_PATH)]
    metrics_path: PathBuf,
}

#[derive(Clone, Copy, ValueEnum)]
enum Demo {
    /// Per-group sum in shared local memory
    Reduce,
    /// Pairwise lane swap through the broadcast buffer
    Exchange,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<(), SimError> {
    let platform = match &cli.platform {
        Some(path) => PlatformConfig::from_json_file(path)?,
        None => PlatformConfig::default(),
    };
    let mut device = Device::new(platform);
    if cli.live {
        device = device.with_metrics(&cli.metrics_path);
    }

    let config = LaunchConfig::new(Dim3::x(cli.groups), Dim3::x(cli.group_size))
        .with_limits(cli.resident, cli.threads);

    match cli.kernel {
        Demo::Reduce => reduce(&device, &config, REDUCE_SCALE, cli.debug),
        Demo::Exchange => exchange(&device, &config, cli.debug),
    }
}

fn launch(device: &Device, kernel: &Kernel, config: &LaunchConfig, args: &[u8], debug: bool) -> Result<(), SimError> {
    let stats = if debug {
        device.run_debug(kernel, config, args)?
    } else {
        device.run(kernel, config, args)?
    };
    println!(
        "Stats: {} groups | {} work items | {} barrier releases | resident={} threads={} (limited by {}) | {:.2}ms",
        stats.groups_executed,
        stats.work_items_executed,
        stats.barrier_releases,
        stats.plan.resident_slots,
        stats.plan.pool_threads,
        stats.plan.limiter,
        stats.elapsed_ms,
    );
    Ok(())
}

// --- Reduction demo ---
// Every work item contributes global_id * scale; each group sums its lanes
// in SLM with a tree of barriers and lane 0 stores the group total. Sums are
// u64 and wrap, matching the host-side check.
const REDUCE_SCALE: u32 = 3;

fn reduce(device: &Device, config: &LaunchConfig, scale: u32, debug: bool) -> Result<(), SimError> {
    let groups = config.num_groups() as usize;
    let sums = Arc::new(Mutex::new(vec![0u64; groups]));

    let out = Arc::clone(&sums);
    let kernel = Kernel::new("group_reduce", move |ctx, args| {
        let scale = u32::from_le_bytes([args[0], args[1], args[2], args[3]]) as u64;
        let n = ctx.linear_group_size() as usize;
        let lane = ctx.linear_thread_index() as usize;

        ctx.slm_init(n * 8)?;
        let base = ctx.slm_alloc(n * 8)?;
        ctx.slm_write_u64(base + lane * 8, ctx.global_id().wrapping_mul(scale))?;
        ctx.barrier()?;

        let mut stride = n.next_power_of_two() / 2;
        while stride > 0 {
            if lane < stride && lane + stride < n {
                let a = ctx.slm_read_u64(base + lane * 8)?;
                let b = ctx.slm_read_u64(base + (lane + stride) * 8)?;
                ctx.slm_write_u64(base + lane * 8, a.wrapping_add(b))?;
            }
            ctx.barrier()?;
            stride /= 2;
        }

        if lane == 0 {
            out.lock()[ctx.linear_group_index() as usize] = ctx.slm_read_u64(base)?;
        }
        Ok(())
    });

    launch(device, &kernel, config, &scale.to_le_bytes(), debug)?;

    let items = config.num_groups() as u128 * config.group_size() as u128;
    let expected = (scale as u128 * items * (items - 1) / 2) as u64;
    let got = sums.lock().iter().fold(0u64, |acc, &s| acc.wrapping_add(s));
    if got == expected {
        println!("Verification PASSED: grid sum = {}", got);
        Ok(())
    } else {
        Err(SimError::kernel(format!("grid sum {} != expected {}", got, expected)))
    }
}

// --- Exchange demo ---
// Even/odd lane pairs swap their global ids; every lane checks it got its
// neighbour's.
fn exchange(device: &Device, config: &LaunchConfig, debug: bool) -> Result<(), SimError> {
    let kernel = Kernel::new("neighbor_swap", |ctx, _| {
        let lane = ctx.linear_thread_index();
        let n = ctx.linear_group_size();
        let got = ctx.exchange_with_neighbor(&ctx.global_id().to_le_bytes())?;
        let mut word = [0u8; 8];
        word.copy_from_slice(&got);
        let got = u64::from_le_bytes(word);

        let peer = if (lane ^ 1) < n { lane ^ 1 } else { lane };
        let want = ctx.linear_group_index() as u64 * n as u64 + peer as u64;
        if got != want {
            return Err(SimError::kernel(format!("lane {} received {}, expected {}", lane, got, want)));
        }
        Ok(())
    });

    launch(device, &kernel, config, &[], debug)?;
    println!("Verification PASSED: every lane received its neighbour's id");
    Ok(())
}
