use gridsim::{Device, Dim3, ItemCtx, Kernel, LaunchConfig, NamedBarrierRole, SimError};

fn expect(ok: bool, what: impl FnOnce() -> String) -> gridsim::Result<()> {
    if ok { Ok(()) } else { Err(SimError::kernel(what())) }
}

fn config(groups: u32, lanes: u32, resident: u32) -> LaunchConfig {
    LaunchConfig::new(Dim3::x(groups), Dim3::x(lanes)).with_limits(resident, lanes * resident)
}

#[test]
fn barrier_separates_rounds_on_one_region() {
    const ROUNDS: u32 = 10;
    let kernel = Kernel::new("rounds", |ctx, _| {
        let n = ctx.linear_group_size() as usize;
        let lane = ctx.linear_thread_index() as usize;
        ctx.slm_init(n * 4)?;
        let base = ctx.slm_alloc(n * 4)?;

        for round in 0..ROUNDS {
            ctx.slm_write_u32(base + lane * 4, round * 1000 + lane as u32)?;
            ctx.barrier()?;
            for other in 0..n {
                let got = ctx.slm_read_u32(base + other * 4)?;
                expect(got == round * 1000 + other as u32, || {
                    format!("round {} lane {} saw {} in slot {}", round, lane, got, other)
                })?;
            }
            ctx.barrier()?;
        }
        Ok(())
    });

    let stats = Device::default().run(&kernel, &config(6, 8, 3), &[]).unwrap();
    assert_eq!(stats.barrier_releases, 6 * 2 * ROUNDS as u64);
}

#[test]
fn split_phase_barrier_overlaps_independent_work() {
    let kernel = Kernel::new("split", |ctx, _| {
        let lane = ctx.linear_thread_index() as usize;
        ctx.slm_init(64)?;
        ctx.slm_alloc(64)?;
        ctx.slm_write_u32(lane * 4, lane as u32 + 1)?;
        ctx.barrier_signal();
        // work that touches nothing shared
        let local: u32 = (0..100).sum();
        ctx.barrier_wait()?;

        let n = ctx.linear_group_size() as usize;
        let peer = (lane + 1) % n;
        let got = ctx.slm_read_u32(peer * 4)?;
        expect(got == peer as u32 + 1 && local == 4950, || format!("lane {} read {}", lane, got))
    });

    Device::default().run(&kernel, &config(4, 4, 2), &[]).unwrap();
}

#[test]
fn consumers_see_every_producer_write() {
    const ROUNDS: usize = 5;
    // lanes 0,1 produce, lanes 2,3 consume; each round uses its own region
    let kernel = Kernel::new("pipeline", |ctx: &ItemCtx<'_>, _| {
        let lane = ctx.linear_thread_index() as usize;
        ctx.nbarrier_init(1)?;
        ctx.slm_init(ROUNDS * 8)?;
        let base = ctx.slm_alloc(ROUNDS * 8)?;

        for round in 0..ROUNDS {
            let region = base + round * 8;
            if lane < 2 {
                ctx.slm_write_u32(region + lane * 4, (round * 10 + lane) as u32)?;
                ctx.nbarrier(0, NamedBarrierRole::Producer, 2, 2)?;
            } else {
                ctx.nbarrier(0, NamedBarrierRole::Consumer, 2, 2)?;
                for p in 0..2 {
                    let got = ctx.slm_read_u32(region + p * 4)?;
                    expect(got == (round * 10 + p) as u32, || {
                        format!("round {} consumer {} saw {} from producer {}", round, lane, got, p)
                    })?;
                }
            }
        }
        Ok(())
    });

    let stats = Device::default().run(&kernel, &config(3, 4, 3), &[]).unwrap();
    assert_eq!(stats.named_barrier_generations, 3 * ROUNDS as u64);
}

#[test]
fn producer_consumer_lanes_rendezvous() {
    let kernel = Kernel::new("all_pc", |ctx, _| {
        let n = ctx.linear_group_size();
        let lane = ctx.linear_thread_index() as usize;
        ctx.nbarrier_init(2)?;
        ctx.slm_init(n as usize * 4)?;
        ctx.slm_alloc(n as usize * 4)?;

        ctx.slm_write_u32(lane * 4, lane as u32 * 3)?;
        ctx.nbarrier(1, NamedBarrierRole::ProducerConsumer, n, n)?;
        let mut sum = 0;
        for other in 0..n as usize {
            sum += ctx.slm_read_u32(other * 4)?;
        }
        expect(sum == 3 * (0..n).sum::<u32>(), || format!("lane {} summed {}", lane, sum))
    });

    Device::default().run(&kernel, &config(4, 6, 2), &[]).unwrap();
}

#[test]
fn mismatched_counts_are_rejected() {
    let kernel = Kernel::new("mismatch", |ctx, _| {
        ctx.nbarrier_init(1)?;
        if ctx.linear_thread_index() == 0 {
            ctx.nbarrier_signal(0, NamedBarrierRole::Producer, 2, 1)?;
            ctx.barrier()
        } else {
            ctx.barrier()?;
            ctx.nbarrier_signal(0, NamedBarrierRole::Producer, 1, 1)
        }
    });

    match Device::default().run(&kernel, &config(1, 2, 1), &[]) {
        Err(SimError::NamedBarrierMismatch { id, lane, expected_producers, producers, .. }) => {
            assert_eq!((id, lane), (0, 1));
            assert_eq!((expected_producers, producers), (2, 1));
        }
        other => panic!("expected NamedBarrierMismatch, got {:?}", other),
    }
}

#[test]
fn undeclared_barrier_id_is_rejected() {
    let kernel = Kernel::new("bad_id", |ctx, _| {
        ctx.nbarrier_init(2)?;
        ctx.nbarrier_signal(5, NamedBarrierRole::Producer, 1, 0)
    });

    assert!(matches!(
        Device::default().run(&kernel, &config(2, 2, 1), &[]),
        Err(SimError::BarrierIdOutOfRange { id: 5, limit: 2 })
    ));
}

#[test]
fn neighbours_swap_values() {
    let kernel = Kernel::new("swap", |ctx, _| {
        let lane = ctx.linear_thread_index();
        let n = ctx.linear_group_size();
        for round in 0..3u32 {
            let mine = ctx.global_id() as u32 * 10 + round;
            let got = ctx.exchange_with_neighbor(&mine.to_le_bytes())?;
            let got = u32::from_le_bytes([got[0], got[1], got[2], got[3]]);

            let peer = if (lane ^ 1) < n { lane ^ 1 } else { lane };
            let want = (ctx.linear_group_index() * n + peer) * 10 + round;
            expect(got == want, || format!("round {} lane {} got {} want {}", round, lane, got, want))?;
        }
        Ok(())
    });

    // odd group: the last lane has no partner and keeps its own value
    Device::default().run(&kernel, &config(4, 5, 2), &[]).unwrap();
}

#[test]
fn oversized_exchange_is_rejected() {
    let kernel = Kernel::new("too_big", |ctx, _| {
        ctx.exchange_with_neighbor(&[0u8; 65]).map(|_| ())
    });

    assert!(matches!(
        Device::default().run(&kernel, &config(1, 2, 1), &[]),
        Err(SimError::BroadcastTooLarge { len: 65, stride: 64 })
    ));
}

#[test]
fn slm_before_init_is_rejected() {
    let kernel = Kernel::new("no_init", |ctx, _| ctx.slm_alloc(16).map(|_| ()));
    assert!(matches!(
        Device::default().run(&kernel, &config(1, 2, 1), &[]),
        Err(SimError::SlmNotInitialized)
    ));
}

#[test]
fn slm_above_platform_limit_is_rejected() {
    let kernel = Kernel::new("greedy", |ctx, _| ctx.slm_init(1 << 20));
    assert!(matches!(
        Device::default().run(&kernel, &config(1, 1, 1), &[]),
        Err(SimError::SlmCapacityExceeded { requested: 1048576, capacity: 65536 })
    ));
}

#[test]
fn debug_mode_supports_the_same_barriers() {
    let kernel = Kernel::new("debug_sync", |ctx, _| {
        ctx.nbarrier_init(1)?;
        let role = if ctx.linear_thread_index() == 0 {
            NamedBarrierRole::Producer
        } else {
            NamedBarrierRole::Consumer
        };
        ctx.nbarrier(0, role, 1, 3)?;
        ctx.barrier()
    });

    let stats = Device::default().run_debug(&kernel, &config(5, 4, 2), &[]).unwrap();
    assert_eq!(stats.completion_order, vec![0, 1, 2, 3, 4]);
    assert_eq!(stats.named_barrier_generations, 5);
}
