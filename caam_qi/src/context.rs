//! Driver contexts.
//!
//! A [`DrvCtx`] binds one shared descriptor to a request queue on one CPU.
//! Requests submitted through it run that descriptor and complete on the
//! CPU's response queue.
//!
//! # Descriptor hot-swap
//!
//! [`DrvCtx::update`] replaces the descriptor while submitters keep going.
//! New submissions are diverted to a parked replacement queue, the old
//! queue is left to empty, the buffer is rewritten and the replacement is
//! scheduled. If scheduling fails after the rewrite the context falls back
//! to the old queue and the update still reports success.
//!
//! Both take `&self`, so a context shared between threads can be updated
//! while other threads submit through it. Updates on one context run one at
//! a time.

use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use qman::{DmaAddr, DmaDirection, FrameDescriptor, Fqid};

use crate::backend::QiBackend;
use crate::desc::{HwDesc, SharedDesc};
use crate::error::{EnqueueError, Error, Result};
use crate::fq::FqManager;
use crate::request::DrvReq;

/// Per-session driver context.
pub struct DrvCtx {
    backend: Arc<QiBackend>,
    cpu: usize,
    /// Response queue of `cpu`; owned by the backend.
    rsp_fq: Fqid,
    /// Current request queue. Repointed during an update.
    req_fq: AtomicU32,
    /// Preheader and descriptor; mapped at `context_a` for the context's
    /// whole lifetime.
    hwdesc: Mutex<Box<HwDesc>>,
    context_a: DmaAddr,
    /// Held for the whole of an update. Submissions never take it.
    update_lock: Mutex<()>,
}

impl DrvCtx {
    /// Build a context on `*cpu`, moving it to a portal CPU if needed. Use
    /// [`QiBackend::create_context`].
    pub(crate) fn new(
        backend: &Arc<QiBackend>,
        cpu: &mut usize,
        desc: &SharedDesc,
    ) -> Result<Self> {
        let hw = HwDesc::new(desc).inspect_err(|_| {
            tracing::error!(words = desc.len(), "invalid descriptor length");
        })?;

        let phys = &*hw as *const HwDesc as u64;
        let context_a = backend
            .dma
            .map_single(phys, HwDesc::SIZE, DmaDirection::Bidirectional)
            .map_err(|e| {
                tracing::error!(error = %e, "DMA map error for preheader + shdesc");
                Error::DmaMapping
            })?;

        let unmap = || {
            backend
                .dma
                .unmap_single(context_a, HwDesc::SIZE, DmaDirection::Bidirectional)
        };

        let Some((chosen, reassigned)) = backend.pcpu.select_cpu(*cpu) else {
            unmap();
            return Err(Error::NoAffinePortals);
        };
        if reassigned {
            tracing::debug!(requested = *cpu, cpu = chosen, "CPU has no portal, context moved");
        }
        *cpu = chosen;

        let Some(rsp_fq) = backend.pcpu.rsp_fq(chosen) else {
            unmap();
            return Err(Error::NoAffinePortals);
        };

        let req_fq = match backend.fqs().create_req_fq(
            backend.req_handler(),
            rsp_fq,
            context_a,
            backend.cgrid,
            true,
        ) {
            Ok(fqid) => fqid,
            Err(e) => {
                tracing::error!(error = %e, "create_caam_req_fq failed");
                unmap();
                return Err(e);
            }
        };

        Ok(Self {
            backend: Arc::clone(backend),
            cpu: chosen,
            rsp_fq,
            req_fq: AtomicU32::new(req_fq.0),
            hwdesc: Mutex::new(hw),
            context_a,
            update_lock: Mutex::new(()),
        })
    }

    fn fqs(&self) -> FqManager<'_> {
        self.backend.fqs()
    }

    fn hw(&self) -> MutexGuard<'_, Box<HwDesc>> {
        self.hwdesc.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn cpu(&self) -> usize {
        self.cpu
    }

    /// Request queue new submissions go to.
    pub fn req_fqid(&self) -> Fqid {
        Fqid(self.req_fq.load(Ordering::Acquire))
    }

    pub fn rsp_fqid(&self) -> Fqid {
        self.rsp_fq
    }

    /// Device address of the descriptor buffer.
    pub fn context_a(&self) -> DmaAddr {
        self.context_a
    }

    /// Preheader words currently in the buffer.
    pub fn prehdr(&self) -> [u32; 2] {
        self.hw().prehdr
    }

    /// Descriptor words currently in the buffer.
    pub fn descriptor(&self) -> Vec<u32> {
        self.hw().descriptor().to_vec()
    }

    pub fn backend(&self) -> &Arc<QiBackend> {
        &self.backend
    }

    // =========================================================================
    // Submission
    // =========================================================================

    /// Submit a request.
    ///
    /// On success the request belongs to the backend until its callback
    /// runs. On failure it is returned inside the error and its callback
    /// will not run. A request whose callback already ran is refused, as is
    /// any request once the backend is shut down.
    pub fn submit(&self, req: Box<DrvReq>) -> std::result::Result<(), EnqueueError> {
        if self.backend.is_shut_down() {
            return Err(EnqueueError::Other(
                req,
                io::Error::new(io::ErrorKind::NotConnected, "queue interface is shut down"),
            ));
        }
        if !req.is_pending() {
            return Err(EnqueueError::Other(
                req,
                io::Error::new(io::ErrorKind::InvalidInput, "request already completed"),
            ));
        }

        let dma = &self.backend.dma;
        let phys = req.sgt_phys();
        let addr = match dma.map_single(phys, DrvReq::SGT_SIZE, DmaDirection::Bidirectional) {
            Ok(addr) => addr,
            Err(e) => {
                tracing::error!(error = %e, "DMA mapping error for QI enqueue request");
                return Err(EnqueueError::Io(req));
            }
        };
        let fd = FrameDescriptor::compound(addr, req.cong_weight());

        let inflight = &self.backend.inflight;
        if let Err(req) = inflight.insert(req) {
            dma.unmap_single(addr, DrvReq::SGT_SIZE, DmaDirection::Bidirectional);
            return Err(EnqueueError::Other(
                req,
                io::Error::new(io::ErrorKind::AlreadyExists, "request already in flight"),
            ));
        }

        let retries = self.backend.cfg.enqueue_retries.max(1);
        let mut attempts = 0;
        let err = loop {
            attempts += 1;
            match self.backend.qman.enqueue(self.req_fqid(), &fd) {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock && attempts < retries => {
                    std::hint::spin_loop();
                }
                Err(e) => break e,
            }
        };

        tracing::error!(fqid = %self.req_fqid(), attempts, error = %err, "qman_enqueue failed");
        let Some(req) = inflight.remove(phys) else {
            // The queue manager already handed the frame back and the
            // callback has run.
            tracing::warn!(
                fqid = %self.req_fqid(),
                "failed enqueue was completed by the queue manager"
            );
            return Ok(());
        };
        dma.unmap_single(addr, DrvReq::SGT_SIZE, DmaDirection::Bidirectional);
        if err.kind() == io::ErrorKind::WouldBlock {
            Err(EnqueueError::Busy(req, attempts))
        } else {
            Err(EnqueueError::Other(req, err))
        }
    }

    // =========================================================================
    // Descriptor Update
    // =========================================================================

    /// Replace the shared descriptor.
    ///
    /// Submissions through `&self` carry on during the update; whatever they
    /// queue on the replacement runs with the new descriptor. Concurrent
    /// updates on the same context wait for each other.
    ///
    /// - replacement queue creation fails: error, nothing changed
    /// - old queue does not empty: error, context back on the old queue,
    ///   replacement killed, buffer untouched
    /// - replacement cannot be scheduled after the buffer rewrite: context
    ///   back on the old queue, replacement killed, `Ok(())`
    /// - success: old queue killed; a kill failure is only logged
    pub fn update(&self, desc: &SharedDesc) -> Result<()> {
        let words = desc.check_fits().inspect_err(|_| {
            tracing::error!(words = desc.len(), "invalid descriptor length");
        })?;
        let _serial = self
            .update_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let fqs = self.fqs();
        let old_fq = self.req_fqid();

        let new_fq = fqs
            .create_req_fq(
                self.backend.req_handler(),
                self.rsp_fq,
                self.context_a,
                self.backend.cgrid,
                false,
            )
            .inspect_err(|e| {
                tracing::error!(error = %e, "FQ allocation for shdesc update failed");
            })?;

        // New submissions queue up on the parked replacement.
        self.req_fq.store(new_fq.0, Ordering::Release);

        if let Err(e) = fqs.empty_caam_fq(old_fq) {
            tracing::error!(fqid = %old_fq, error = %e, "old CAAM FQ empty failed");
            self.req_fq.store(old_fq.0, Ordering::Release);
            if let Err(e) = fqs.kill_fq(new_fq, self.cpu) {
                tracing::warn!(fqid = %new_fq, error = %e, "new CAAM FQ kill failed");
            }
            return Err(e);
        }

        {
            let mut hw = self.hw();
            hw.write(&desc.words()[..words]);
            self.backend.dma.sync_single_for_device(
                self.context_a,
                HwDesc::SIZE,
                DmaDirection::Bidirectional,
            );
        }

        match self.backend.qman.schedule_fq(new_fq) {
            Err(e) => {
                tracing::error!(fqid = %new_fq, error = %e, "fail to sched new CAAM FQ");
                // The buffer already holds the new descriptor; the update
                // counts as done.
                self.req_fq.store(old_fq.0, Ordering::Release);
                if let Err(e) = fqs.kill_fq(new_fq, self.cpu) {
                    tracing::warn!(fqid = %new_fq, error = %e, "new CAAM FQ kill failed");
                }
            }
            Ok(()) => {
                if let Err(e) = fqs.kill_fq(old_fq, self.cpu) {
                    tracing::warn!(fqid = %old_fq, error = %e, "old CAAM FQ kill failed");
                }
            }
        }
        Ok(())
    }

    /// Release the context: kill its request queue and unmap the buffer.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for DrvCtx {
    fn drop(&mut self) {
        let fqid = self.req_fqid();
        if let Err(e) = self.fqs().kill_fq(fqid, self.cpu) {
            tracing::error!(%fqid, error = %e, "crypto session req FQ kill failed");
        }
        self.backend
            .dma
            .unmap_single(self.context_a, HwDesc::SIZE, DmaDirection::Bidirectional);
    }
}

impl std::fmt::Debug for DrvCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DrvCtx")
            .field("cpu", &self.cpu)
            .field("req_fq", &self.req_fqid())
            .field("rsp_fq", &self.rsp_fq)
            .field("context_a", &format_args!("{:#x}", self.context_a))
            .finish()
    }
}
