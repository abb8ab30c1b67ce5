//! Budgeted poll contexts and dispatch workers.
//!
//! Each portal CPU owns a [`Napi`]. The response queue handler never
//! processes completions from interrupt context: it masks the portal's DQRI
//! source and schedules the poll context instead. A scheduled context is run
//! either by the CPU's [`DispatchWorker`] or by the caller through
//! [`QiBackend::poll_cpu`](crate::QiBackend::poll_cpu).
//!
//! A run services at most `budget` portal entries. Cleaning fewer than the
//! budget means the portal is empty: the context completes and unmasks DQRI.
//! Cleaning the full budget leaves it scheduled for another run.

use std::io;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, TryLockError};
use std::thread::{self, JoinHandle};

use qman::{AffinityGuard, DqrrOrigin, PortalIrq, QueueManager};

#[derive(Debug, Default)]
struct NapiState {
    scheduled: bool,
    disabled: bool,
    stop: bool,
}

/// Poll context of one portal CPU.
#[derive(Debug)]
pub struct Napi {
    cpu: usize,
    state: Mutex<NapiState>,
    wake: Condvar,
    /// Held for the duration of a run.
    running: Mutex<()>,
}

impl Napi {
    pub fn new(cpu: usize) -> Self {
        Self {
            cpu,
            state: Mutex::new(NapiState::default()),
            wake: Condvar::new(),
            running: Mutex::new(()),
        }
    }

    pub fn cpu(&self) -> usize {
        self.cpu
    }

    fn lock(&self) -> MutexGuard<'_, NapiState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark the context runnable. Returns `false` if it already was, or if
    /// it has been disabled.
    pub fn schedule(&self) -> bool {
        let mut st = self.lock();
        if st.disabled || st.scheduled {
            return false;
        }
        st.scheduled = true;
        self.wake.notify_all();
        true
    }

    pub fn is_scheduled(&self) -> bool {
        self.lock().scheduled
    }

    pub fn is_disabled(&self) -> bool {
        self.lock().disabled
    }

    fn complete(&self) {
        self.lock().scheduled = false;
    }

    /// Run the context once. Returns the number of entries cleaned; 0 when
    /// the context is not scheduled, disabled or already running elsewhere.
    pub fn poll(&self, qman: &dyn QueueManager, budget: usize) -> usize {
        let _run = match self.running.try_lock() {
            Ok(g) => g,
            Err(TryLockError::Poisoned(e)) => e.into_inner(),
            Err(TryLockError::WouldBlock) => return 0,
        };
        {
            let st = self.lock();
            if st.disabled || !st.scheduled {
                return 0;
            }
        }

        let cleaned = qman.poll_dqrr(self.cpu, budget, DqrrOrigin::Poll);
        if cleaned < budget {
            self.complete();
            qman.irqsource_add(self.cpu, PortalIrq::Dqri);
        }
        cleaned
    }

    /// Prevent further runs and wait for a run in progress to finish.
    pub fn disable(&self) {
        {
            let mut st = self.lock();
            st.disabled = true;
            st.scheduled = false;
        }
        drop(self.running.lock().unwrap_or_else(PoisonError::into_inner));
        self.wake.notify_all();
    }

    /// Block until the context is runnable. Returns `false` once stopped.
    fn wait_scheduled(&self) -> bool {
        let mut st = self.lock();
        loop {
            if st.stop {
                return false;
            }
            if st.scheduled && !st.disabled {
                return true;
            }
            st = self.wake.wait(st).unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn stop(&self) {
        self.lock().stop = true;
        self.wake.notify_all();
    }
}

// =============================================================================
// Dispatch Worker
// =============================================================================

/// Thread running one CPU's poll context whenever it is scheduled.
pub struct DispatchWorker {
    napi: Arc<Napi>,
    handle: Option<JoinHandle<()>>,
}

impl DispatchWorker {
    pub fn spawn(
        napi: Arc<Napi>,
        qman: Arc<dyn QueueManager>,
        budget: usize,
    ) -> io::Result<Self> {
        let cpu = napi.cpu();
        let ctx = Arc::clone(&napi);
        let handle = thread::Builder::new()
            .name(format!("caam-qi-napi/{cpu}"))
            .spawn(move || {
                let _pin = AffinityGuard::pin(cpu);
                while ctx.wait_scheduled() {
                    ctx.poll(&*qman, budget);
                    thread::yield_now();
                }
                tracing::trace!(cpu, "dispatch worker exiting");
            })?;
        Ok(Self {
            napi,
            handle: Some(handle),
        })
    }

    pub fn cpu(&self) -> usize {
        self.napi.cpu()
    }

    /// Stop the worker and wait for it to exit.
    pub fn stop(&mut self) {
        self.napi.stop();
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            tracing::error!(cpu = self.napi.cpu(), "dispatch worker panicked");
        }
    }
}

impl Drop for DispatchWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qman::{
        Channel, CpuSet, DqrrResult, FqFlags, FqHandler, FrameDescriptor, Fqid, InitFqOptions,
        Portal, SoftQman,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Defers everything outside the poll context, like the response handler.
    struct Deferring {
        napi: Arc<Napi>,
        polled: AtomicUsize,
    }

    impl FqHandler for Deferring {
        fn dqrr(
            &self,
            portal: &dyn Portal,
            _fqid: Fqid,
            _fd: &FrameDescriptor,
            origin: DqrrOrigin,
        ) -> DqrrResult {
            if origin != DqrrOrigin::Poll {
                portal.irqsource_remove(PortalIrq::Dqri);
                self.napi.schedule();
                return DqrrResult::Stop;
            }
            self.polled.fetch_add(1, Ordering::SeqCst);
            DqrrResult::Consume
        }
    }

    fn setup(frames: usize) -> (SoftQman, Arc<Deferring>) {
        let qm = SoftQman::new(CpuSet::first_n(1));
        let h = Arc::new(Deferring {
            napi: Arc::new(Napi::new(0)),
            polled: AtomicUsize::new(0),
        });
        let fqid = qm.create_fq(FqFlags::DYNAMIC_FQID, h.clone()).unwrap();
        qm.init_fq(fqid, true, &InitFqOptions::new(Channel::Portal(0), 3))
            .unwrap();
        for i in 0..frames {
            qm.enqueue(fqid, &FrameDescriptor::compound(i as u64, 1))
                .unwrap();
        }
        (qm, h)
    }

    #[test]
    fn test_irq_defers_to_poll_context() {
        let (qm, h) = setup(3);
        assert!(h.napi.is_scheduled());
        assert!(!qm.irq_enabled(0));
        assert_eq!(h.polled.load(Ordering::SeqCst), 0);

        assert_eq!(h.napi.poll(&qm, 63), 3);
        assert!(!h.napi.is_scheduled());
        assert!(qm.irq_enabled(0));
        assert_eq!(h.polled.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_full_budget_stays_scheduled() {
        let (qm, h) = setup(5);
        assert_eq!(h.napi.poll(&qm, 2), 2);
        assert!(h.napi.is_scheduled());
        assert!(!qm.irq_enabled(0));
        assert_eq!(h.napi.poll(&qm, 2), 2);
        assert_eq!(h.napi.poll(&qm, 2), 1);
        assert!(!h.napi.is_scheduled());
        assert!(qm.irq_enabled(0));
    }

    #[test]
    fn test_disabled_context_never_runs() {
        let (qm, h) = setup(1);
        h.napi.disable();
        assert!(!h.napi.schedule());
        assert_eq!(h.napi.poll(&qm, 63), 0);
        assert_eq!(h.polled.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_worker_drains_portal() {
        let (qm, h) = setup(0);
        let qm: Arc<SoftQman> = Arc::new(qm);
        let mut worker =
            DispatchWorker::spawn(h.napi.clone(), qm.clone() as Arc<dyn QueueManager>, 63)
                .unwrap();
        assert_eq!(worker.cpu(), 0);

        let fqid = Fqid(0x400);
        for i in 0..100 {
            qm.enqueue(fqid, &FrameDescriptor::compound(i, 1)).unwrap();
        }
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
        while h.polled.load(Ordering::SeqCst) < 100 && std::time::Instant::now() < deadline {
            thread::sleep(std::time::Duration::from_millis(1));
        }
        worker.stop();
        assert_eq!(h.polled.load(Ordering::SeqCst), 100);
    }
}
