//! Common test utilities for queue-interface integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use caam_qi::{DrvReq, QiBackend, QiConfig, ReqStatus, SharedDesc};
use qman::{CpuSet, SgEntry, SoftDma, SoftQman};

/// Install a test subscriber; `RUST_LOG` selects what is shown.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Backend over the software queue manager and DMA layer.
pub struct Harness {
    pub qman: Arc<SoftQman>,
    pub dma: Arc<SoftDma>,
    pub backend: Arc<QiBackend>,
}

impl Harness {
    /// `cpus` portal CPUs, identity DMA, caller-driven completions.
    pub fn new(cpus: usize) -> Self {
        Self::with(CpuSet::first_n(cpus), SoftDma::new(), test_config())
    }

    pub fn with(cpus: CpuSet, dma: SoftDma, cfg: QiConfig) -> Self {
        init_tracing();
        let qman = Arc::new(SoftQman::new(cpus));
        let dma = Arc::new(dma);
        let backend = QiBackend::init(qman.clone(), dma.clone(), cfg).expect("QI init");
        Self { qman, dma, backend }
    }

    /// Let the accelerator run every queued frame with `status`.
    pub fn run_caam(&self, status: u32) -> usize {
        self.qman.process_caam(usize::MAX, |_| status)
    }

    /// Run the accelerator, then drive completions on every CPU.
    pub fn complete_all(&self, status: u32) -> usize {
        self.run_caam(status);
        self.backend.poll_all()
    }
}

/// Polled configuration with short waits.
pub fn test_config() -> QiConfig {
    QiConfig {
        fq_poll_interval: Duration::from_millis(1),
        drain_grace: Duration::from_millis(1),
        max_fq_polls: 500,
        ..QiConfig::polled()
    }
}

/// Shared descriptor with a body of `body_words` words tagged with `tag`.
pub fn desc(body_words: usize, tag: u32) -> SharedDesc {
    let body: Vec<u32> = (0..body_words as u32).map(|i| tag.wrapping_add(i)).collect();
    SharedDesc::new(&body).expect("descriptor")
}

/// Collects completions as `(app_ctx, status)`.
#[derive(Default)]
pub struct Recorder {
    done: Mutex<Vec<(u64, ReqStatus)>>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Request tagged `id` that records its completion here.
    pub fn request(self: &Arc<Self>, id: u64) -> Box<DrvReq> {
        let rec = Arc::clone(self);
        DrvReq::new(SgEntry::new(0x1000, 64), SgEntry::new(0x2000, 64), move |req, status| {
            rec.done.lock().unwrap().push((req.app_ctx, status));
        })
        .with_app_ctx(id)
    }

    pub fn len(&self) -> usize {
        self.done.lock().unwrap().len()
    }

    pub fn completions(&self) -> Vec<(u64, ReqStatus)> {
        self.done.lock().unwrap().clone()
    }

    /// Completion count per request id, sorted by id.
    pub fn counts(&self) -> Vec<(u64, usize)> {
        let mut ids: Vec<u64> = self.done.lock().unwrap().iter().map(|(id, _)| *id).collect();
        ids.sort_unstable();
        let mut out: Vec<(u64, usize)> = Vec::new();
        for id in ids {
            match out.last_mut() {
                Some((last, n)) if *last == id => *n += 1,
                _ => out.push((id, 1)),
            }
        }
        out
    }

    /// Wait until `n` completions arrived or `timeout` passed.
    pub fn wait_for(&self, n: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.len() < n {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        true
    }
}
