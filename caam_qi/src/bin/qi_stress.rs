//! Stress driver for the queue interface on the software queue manager.
//!
//! Runs one submitter thread per driver context against an accelerator
//! thread that keeps processing frames, optionally injecting ICV failures
//! and hot-swapping descriptors while requests are in flight.
//!
//! Run with:
//! ```bash
//! RUST_LOG=caam_qi=debug cargo run --release --bin qi_stress -- --cpus 4 --contexts 8
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use tracing_subscriber::EnvFilter;

use caam_qi::desc::STATUS_ICV_FAILURE;
use caam_qi::{DrvCtx, DrvReq, EnqueueError, QiBackend, QiConfig, ReqStatus, SharedDesc};
use qman::{CpuSet, SgEntry, SoftDma, SoftQman};

#[derive(Parser)]
#[command(name = "qi_stress")]
struct Args {
    /// Portal-owning CPUs
    #[arg(long, default_value = "4")]
    cpus: usize,

    /// Driver contexts, one submitter thread each
    #[arg(long, default_value = "4")]
    contexts: usize,

    /// Requests per context
    #[arg(short, long, default_value = "100000")]
    requests: u64,

    /// Drive completions from the accelerator thread instead of dispatch workers
    #[arg(long)]
    no_workers: bool,

    /// Translate device addresses through an IOMMU
    #[arg(long)]
    iommu: bool,

    /// Fail every Nth frame with an ICV error (0 = never)
    #[arg(long, default_value = "0")]
    icv_every: u64,

    /// Replace the descriptor every N submissions (0 = never)
    #[arg(long, default_value = "0")]
    update_every: u64,

    /// Give up waiting for completions after this many seconds
    #[arg(long, default_value = "30")]
    timeout: u64,
}

// =============================================================================
// Statistics
// =============================================================================

#[derive(Default)]
struct Stats {
    completed: AtomicU64,
    success: AtomicU64,
    icv: AtomicU64,
    hw_error: AtomicU64,
    rejected: AtomicU64,
    busy: AtomicU64,
    throttled: AtomicU64,
    updates: AtomicU64,
}

impl Stats {
    fn record(&self, status: ReqStatus) {
        let counter = match status {
            ReqStatus::Success => &self.success,
            ReqStatus::IntegrityCheckFailure(_) => &self.icv,
            ReqStatus::HardwareError(_) => &self.hw_error,
            ReqStatus::Rejected => &self.rejected,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.completed.fetch_add(1, Ordering::Release);
    }
}

fn descriptor(generation: u32) -> caam_qi::Result<SharedDesc> {
    let body: Vec<u32> = (0..12).map(|i| (generation << 8) | i).collect();
    SharedDesc::new(&body)
}

// =============================================================================
// Submitter
// =============================================================================

fn submitter(ctx: DrvCtx, args: &Args, stats: &Arc<Stats>, backend: &QiBackend) -> DrvCtx {
    let mut generation = 0;
    for seq in 0..args.requests {
        if args.update_every > 0 && seq > 0 && seq % args.update_every == 0 {
            generation += 1;
            match descriptor(generation).and_then(|d| ctx.update(&d)) {
                Ok(()) => {
                    stats.updates.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => tracing::warn!(cpu = ctx.cpu(), error = %e, "descriptor update failed"),
            }
        }

        while backend.is_congested() {
            stats.throttled.fetch_add(1, Ordering::Relaxed);
            thread::yield_now();
        }

        let done = Arc::clone(stats);
        let mut req = DrvReq::new(
            SgEntry::new(0x1000, 64),
            SgEntry::new(0x2000, 64),
            move |_req, status| done.record(status),
        )
        .with_app_ctx(seq);
        loop {
            match ctx.submit(req) {
                Ok(()) => break,
                Err(EnqueueError::Busy(r, _)) => {
                    stats.busy.fetch_add(1, Ordering::Relaxed);
                    req = r;
                    thread::yield_now();
                }
                Err(e) => {
                    tracing::error!(cpu = ctx.cpu(), seq, error = %e, "submit failed");
                    // Keep the totals consistent.
                    stats.record(ReqStatus::Rejected);
                    break;
                }
            }
        }
    }
    ctx
}

// =============================================================================
// Main
// =============================================================================

fn main() -> caam_qi::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let qman = Arc::new(SoftQman::new(CpuSet::first_n(args.cpus)));
    let dma = Arc::new(if args.iommu {
        SoftDma::with_iommu()
    } else {
        SoftDma::new()
    });
    let cfg = QiConfig {
        spawn_workers: !args.no_workers,
        ..QiConfig::default()
    };
    let backend = QiBackend::init(qman.clone(), dma, cfg)?;

    let desc = descriptor(0)?;
    let mut ctxs = Vec::with_capacity(args.contexts);
    for i in 0..args.contexts {
        let mut cpu = i;
        ctxs.push(backend.create_context(&mut cpu, &desc)?);
    }

    println!(
        "qi_stress: cpus={} contexts={} requests/ctx={} workers={} iommu={}",
        args.cpus, args.contexts, args.requests, !args.no_workers, args.iommu
    );

    let stats = Arc::new(Stats::default());
    let stop = Arc::new(AtomicBool::new(false));
    let barrier = Arc::new(Barrier::new(args.contexts + 1));

    // Accelerator thread
    let caam = {
        let qman = Arc::clone(&qman);
        let backend = Arc::clone(&backend);
        let stop = Arc::clone(&stop);
        let icv_every = args.icv_every;
        let poll = args.no_workers;
        thread::spawn(move || {
            let mut frames = 0u64;
            while !stop.load(Ordering::Relaxed) {
                let n = qman.process_caam(256, |_| {
                    frames += 1;
                    if icv_every > 0 && frames % icv_every == 0 {
                        STATUS_ICV_FAILURE
                    } else {
                        0
                    }
                });
                if poll {
                    backend.poll_all();
                }
                if n == 0 {
                    thread::yield_now();
                }
            }
        })
    };

    let args = Arc::new(args);
    let start = Instant::now();
    let submitters: Vec<_> = ctxs
        .into_iter()
        .map(|ctx| {
            let args = Arc::clone(&args);
            let stats = Arc::clone(&stats);
            let backend = Arc::clone(&backend);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                submitter(ctx, &args, &stats, &backend)
            })
        })
        .collect();
    barrier.wait();

    let mut ctxs = Vec::new();
    for handle in submitters {
        match handle.join() {
            Ok(ctx) => ctxs.push(ctx),
            Err(_) => tracing::error!("submitter panicked"),
        }
    }

    let total = args.requests * ctxs.len() as u64;
    let deadline = Instant::now() + Duration::from_secs(args.timeout);
    while stats.completed.load(Ordering::Acquire) < total {
        if Instant::now() >= deadline {
            tracing::error!(
                completed = stats.completed.load(Ordering::Acquire),
                total,
                "timed out waiting for completions"
            );
            break;
        }
        thread::sleep(Duration::from_millis(1));
    }
    let elapsed = start.elapsed();

    stop.store(true, Ordering::Relaxed);
    if caam.join().is_err() {
        tracing::error!("accelerator thread panicked");
    }
    drop(ctxs);
    backend.shutdown()?;

    let completed = stats.completed.load(Ordering::Acquire);
    println!("elapsed:        {:.3}s", elapsed.as_secs_f64());
    println!("completed:      {completed}/{total}");
    println!(
        "throughput:     {:.2} Mreq/s",
        completed as f64 / elapsed.as_secs_f64() / 1e6
    );
    println!("success:        {}", stats.success.load(Ordering::Relaxed));
    println!("icv failures:   {}", stats.icv.load(Ordering::Relaxed));
    println!("hw errors:      {}", stats.hw_error.load(Ordering::Relaxed));
    println!("rejected:       {}", stats.rejected.load(Ordering::Relaxed));
    println!("busy retries:   {}", stats.busy.load(Ordering::Relaxed));
    println!("throttled:      {}", stats.throttled.load(Ordering::Relaxed));
    println!("updates:        {}", stats.updates.load(Ordering::Relaxed));
    println!("congested:      {} times", backend.times_congested());
    Ok(())
}
