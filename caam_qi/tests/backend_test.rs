//! Backend init, shutdown and CPU placement tests.

mod common;

use std::io;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use caam_qi::{EnqueueError, Error, QiBackend, QiConfig, ReqStatus};
use common::{Harness, Recorder, desc, init_tracing, test_config};
use qman::{AffinityGuard, CpuSet, SoftDma, SoftQman};

fn init(qman: &Arc<SoftQman>, cfg: QiConfig) -> caam_qi::Result<Arc<QiBackend>> {
    init_tracing();
    QiBackend::init(qman.clone(), Arc::new(SoftDma::new()), cfg)
}

// =============================================================================
// Init
// =============================================================================

#[test]
fn test_init_creates_rsp_fq_per_cpu() {
    let h = Harness::with(CpuSet::new([0, 2, 5]), SoftDma::new(), test_config());

    assert_eq!(h.qman.fq_count(), 3);
    assert_eq!(h.qman.cgr_len(), 1);
    assert_eq!(h.backend.init_cpu(), 0);
    for cpu in [0, 2, 5] {
        let fqid = h.backend.rsp_fqid(cpu).unwrap();
        let opts = h.qman.fq_options(fqid).unwrap();
        assert_eq!(opts.dest_channel, qman::Channel::Portal(cpu));
        assert_eq!(opts.dest_wq, 3);
        assert_eq!(opts.cgid, Some(h.backend.cgrid()));
    }
    assert_eq!(h.backend.rsp_fqid(1), None);
}

#[test]
fn test_init_without_portals() {
    let qm = Arc::new(SoftQman::new(CpuSet::new([])));
    assert!(matches!(
        init(&qm, test_config()),
        Err(Error::NoAffinePortals)
    ));
    assert_eq!(qm.cgrids_allocated(), 0);
}

#[test]
fn test_init_cgrid_alloc_failure() {
    let qm = Arc::new(SoftQman::new(CpuSet::first_n(2)));
    qm.fail_next_cgrid_alloc(1);
    assert!(matches!(
        init(&qm, test_config()),
        Err(Error::ResourceExhausted { .. })
    ));
    assert_eq!(qm.cgr_len(), 0);
    assert_eq!(qm.fq_count(), 0);
}

#[test]
fn test_init_rsp_fq_failure_cleans_up() {
    let qm = Arc::new(SoftQman::new(CpuSet::first_n(4)));
    qm.fail_next_init(1);
    assert!(init(&qm, test_config()).is_err());
    assert_eq!(qm.fq_count(), 0);
    assert_eq!(qm.cgr_len(), 0);
    assert_eq!(qm.cgrids_allocated(), 0);

    qm.fail_next_create(1);
    assert!(matches!(
        init(&qm, test_config()),
        Err(Error::ResourceExhausted { .. })
    ));
    assert_eq!(qm.fq_count(), 0);
    assert_eq!(qm.cgr_len(), 0);

    // Nothing left behind to trip up a later init.
    let backend = init(&qm, test_config()).unwrap();
    assert_eq!(qm.fq_count(), 4);
    backend.shutdown().unwrap();
}

// =============================================================================
// CPU Placement
// =============================================================================

#[test]
fn test_context_on_non_portal_cpu_round_robins() {
    let h = Harness::with(CpuSet::new([0, 1, 2, 3]), SoftDma::new(), test_config());

    let mut placed = Vec::new();
    let mut ctxs = Vec::new();
    for _ in 0..5 {
        let mut cpu = 9;
        let ctx = h.backend.create_context(&mut cpu, &desc(4, 0)).unwrap();
        assert_eq!(ctx.cpu(), cpu);
        assert_eq!(Some(ctx.rsp_fqid()), h.backend.rsp_fqid(cpu));
        placed.push(cpu);
        ctxs.push(ctx);
    }
    assert_eq!(placed, vec![1, 2, 3, 0, 1]);
    assert_eq!(h.backend.last_cpu(), 1);
}

#[test]
fn test_context_on_portal_cpu_keeps_cursor() {
    let h = Harness::new(4);
    let mut cpu = 3;
    let _a = h.backend.create_context(&mut cpu, &desc(4, 0)).unwrap();
    assert_eq!(cpu, 3);
    assert_eq!(h.backend.last_cpu(), 0);

    let mut cpu = 100;
    let _b = h.backend.create_context(&mut cpu, &desc(4, 0)).unwrap();
    assert_eq!(cpu, 1);
}

// =============================================================================
// Shutdown
// =============================================================================

#[test]
fn test_shutdown_releases_everything() {
    let h = Harness::new(4);
    h.backend.shutdown().unwrap();

    assert!(h.backend.is_shut_down());
    assert_eq!(h.qman.fq_count(), 0);
    assert_eq!(h.qman.cgr_len(), 0);
    assert_eq!(h.qman.cgrids_allocated(), 0);
    for cpu in 0..4 {
        assert!(!h.qman.portal_pending(cpu));
    }
}

#[test]
fn test_shutdown_twice_is_noop() {
    let h = Harness::new(2);
    h.backend.shutdown().unwrap();
    h.backend.shutdown().unwrap();
    assert_eq!(h.qman.cgr_len(), 0);
}

#[test]
fn test_shutdown_from_other_cpu() {
    let h = Harness::new(4);
    let backend = Arc::clone(&h.backend);
    thread::spawn(move || {
        let _pin = AffinityGuard::pin(3);
        backend.shutdown()
    })
    .join()
    .unwrap()
    .unwrap();
    assert_eq!(h.qman.cgr_len(), 0);
}

#[test]
fn test_create_context_after_shutdown() {
    let h = Harness::new(2);
    h.backend.shutdown().unwrap();
    let mut cpu = 0;
    assert!(matches!(
        h.backend.create_context(&mut cpu, &desc(4, 0)),
        Err(Error::Io(_))
    ));
}

#[test]
fn test_submit_after_shutdown_returns_request() {
    let h = Harness::new(2);
    let rec = Recorder::new();
    let mut cpu = 0;
    let ctx = h.backend.create_context(&mut cpu, &desc(4, 0)).unwrap();
    h.backend.shutdown().unwrap();
    let attempts = h.qman.enqueue_attempts();

    let err = ctx.submit(rec.request(7)).unwrap_err();
    match &err {
        EnqueueError::Other(_, e) => assert_eq!(e.kind(), io::ErrorKind::NotConnected),
        other => panic!("unexpected error: {other}"),
    }
    let req = err.into_inner();
    assert_eq!(req.app_ctx, 7);
    assert!(req.is_pending());
    assert_eq!(h.qman.enqueue_attempts(), attempts);
    assert_eq!(h.backend.inflight(), 0);

    h.run_caam(0);
    h.backend.poll_all();
    assert_eq!(rec.len(), 0);
    drop(ctx);
}

#[test]
fn test_shutdown_completes_pending_responses() {
    let h = Harness::new(2);
    let rec = Recorder::new();
    let mut cpu = 1;
    let ctx = h.backend.create_context(&mut cpu, &desc(4, 0)).unwrap();

    for id in 0..5 {
        ctx.submit(rec.request(id)).unwrap();
    }
    h.run_caam(0);
    ctx.release();
    assert_eq!(rec.len(), 0);

    h.backend.shutdown().unwrap();
    assert_eq!(rec.len(), 5);
    assert!(
        rec.completions()
            .iter()
            .all(|(_, st)| *st == ReqStatus::Success)
    );
    assert_eq!(h.backend.inflight(), 0);
}

#[test]
fn test_drop_shuts_down() {
    let qm = Arc::new(SoftQman::new(CpuSet::first_n(3)));
    let backend = init(&qm, test_config()).unwrap();
    assert_eq!(qm.cgr_len(), 1);

    drop(backend);
    assert_eq!(qm.fq_count(), 0);
    assert_eq!(qm.cgr_len(), 0);
}

#[test]
fn test_retire_completes_asynchronously() {
    let h = Harness::new(2);
    let mut cpu = 0;
    let ctx = h.backend.create_context(&mut cpu, &desc(4, 0)).unwrap();
    let fqid = ctx.req_fqid();

    h.qman.set_retire_pending(Some(3));
    ctx.release();
    assert!(!h.qman.fq_exists(fqid));
    h.qman.set_retire_pending(None);
}

#[test]
fn test_retire_timeout_keeps_queue() {
    let h = Harness::with(
        CpuSet::first_n(1),
        SoftDma::new(),
        QiConfig {
            max_fq_polls: 5,
            fq_poll_interval: Duration::from_millis(1),
            ..test_config()
        },
    );
    let mut cpu = 0;
    let ctx = h.backend.create_context(&mut cpu, &desc(4, 0)).unwrap();
    let fqid = ctx.req_fqid();

    h.qman.set_retire_pending(Some(usize::MAX));
    ctx.release();
    // The queue is stuck retiring and cannot be reclaimed.
    assert!(h.qman.fq_exists(fqid));
    h.qman.set_retire_pending(None);
}
