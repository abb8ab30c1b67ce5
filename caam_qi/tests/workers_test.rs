//! Completions driven by the per-CPU dispatch workers.

mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use caam_qi::{QiConfig, ReqStatus};
use common::{Harness, Recorder, desc, test_config};
use qman::{CpuSet, SoftDma};

fn worker_config() -> QiConfig {
    QiConfig {
        spawn_workers: true,
        ..test_config()
    }
}

#[test]
fn test_workers_deliver_completions() {
    let h = Harness::with(CpuSet::first_n(4), SoftDma::new(), worker_config());
    let rec = Recorder::new();

    let ctxs: Vec<_> = (0..4)
        .map(|c| {
            let mut cpu = c;
            h.backend.create_context(&mut cpu, &desc(4, c as u32)).unwrap()
        })
        .collect();
    for (i, ctx) in ctxs.iter().enumerate() {
        for id in 0..100 {
            ctx.submit(rec.request((i * 100 + id) as u64)).unwrap();
        }
    }
    h.run_caam(0);

    assert!(rec.wait_for(400, Duration::from_secs(10)));
    let counts = rec.counts();
    assert_eq!(counts.len(), 400);
    assert!(counts.iter().all(|&(_, n)| n == 1));
    assert!(
        rec.completions()
            .iter()
            .all(|(_, st)| *st == ReqStatus::Success)
    );
    assert_eq!(h.backend.inflight(), 0);
}

#[test]
fn test_workers_with_concurrent_accelerator() {
    let h = Arc::new(Harness::with(
        CpuSet::first_n(2),
        SoftDma::new(),
        worker_config(),
    ));
    let rec = Recorder::new();
    let mut cpu = 1;
    let ctx = h.backend.create_context(&mut cpu, &desc(4, 0)).unwrap();

    let caam = {
        let h = Arc::clone(&h);
        let rec = Arc::clone(&rec);
        thread::spawn(move || {
            while rec.len() < 1000 {
                h.run_caam(0);
                thread::yield_now();
            }
        })
    };
    for id in 0..1000 {
        let mut req = rec.request(id);
        // Back off while the ring is congested.
        loop {
            match ctx.submit(req) {
                Ok(()) => break,
                Err(e) => {
                    req = e.into_inner();
                    thread::yield_now();
                }
            }
        }
    }

    assert!(rec.wait_for(1000, Duration::from_secs(10)));
    caam.join().unwrap();
    assert!(rec.counts().iter().all(|&(_, n)| n == 1));
}

#[test]
fn test_shutdown_stops_workers() {
    let h = Harness::with(CpuSet::first_n(2), SoftDma::new(), worker_config());
    let rec = Recorder::new();
    let mut cpu = 0;
    let ctx = h.backend.create_context(&mut cpu, &desc(4, 0)).unwrap();

    ctx.submit(rec.request(1)).unwrap();
    h.run_caam(0);
    assert!(rec.wait_for(1, Duration::from_secs(10)));
    drop(ctx);

    h.backend.shutdown().unwrap();
    assert_eq!(h.qman.fq_count(), 0);
    assert_eq!(h.qman.cgr_len(), 0);
}
