//! Completion dispatch.
//!
//! Frames come back to the backend two ways:
//! - through a CPU's response queue, after the accelerator ran them
//!   ([`RspFqHandler`])
//! - through the request queue itself, when the queue manager rejects an
//!   enqueue or a retired queue is drained ([`ReqFqHandler`])
//!
//! Either way the frame address is mapped back to the physical address of
//! the request's scatter table and looked up in the [`InflightTable`]. The
//! request is removed, its table unmapped, and its callback run exactly once.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use qman::{
    DmaAddr, DmaDirection, DmaMapper, DqrrOrigin, DqrrResult, FdFormat, FqHandler,
    FrameDescriptor, Fqid, PhysAddr, Portal, PortalIrq,
};

use crate::desc::is_icv_failure;
use crate::error::{Error, Result};
use crate::napi::Napi;
use crate::request::{DrvReq, ReqStatus};

// =============================================================================
// In-flight Table
// =============================================================================

/// Requests owned by the hardware, keyed by scatter table physical address.
pub struct InflightTable {
    dma: Arc<dyn DmaMapper>,
    reqs: Mutex<HashMap<PhysAddr, Box<DrvReq>>>,
}

impl InflightTable {
    pub fn new(dma: Arc<dyn DmaMapper>) -> Self {
        Self {
            dma,
            reqs: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PhysAddr, Box<DrvReq>>> {
        self.reqs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Requests currently in flight.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Hand a request to the hardware side. Returns its key.
    pub(crate) fn insert(&self, req: Box<DrvReq>) -> std::result::Result<PhysAddr, Box<DrvReq>> {
        let phys = req.sgt_phys();
        let mut reqs = self.lock();
        if reqs.contains_key(&phys) {
            return Err(req);
        }
        reqs.insert(phys, req);
        Ok(phys)
    }

    /// Take a request back before its frame was accepted.
    pub(crate) fn remove(&self, phys: PhysAddr) -> Option<Box<DrvReq>> {
        self.lock().remove(&phys)
    }

    /// Device address to physical address of the scatter table.
    fn resolve(&self, addr: DmaAddr) -> Option<PhysAddr> {
        match self.dma.domain() {
            Some(domain) => domain.iova_to_phys(addr),
            None => Some(addr),
        }
    }

    /// Complete the request a returned frame belongs to.
    pub(crate) fn complete_frame(&self, fd: &FrameDescriptor, status: ReqStatus) -> Result<()> {
        if fd.format != FdFormat::Compound {
            return Err(Error::ProtocolViolation(format!(
                "non-compound frame ({:?}) from CAAM",
                fd.format
            )));
        }
        let req = self
            .resolve(fd.addr)
            .and_then(|phys| self.remove(phys))
            .ok_or_else(|| {
                Error::ProtocolViolation(format!(
                    "no request for frame address {:#x}",
                    fd.addr
                ))
            })?;
        self.dma
            .unmap_single(fd.addr, DrvReq::SGT_SIZE, DmaDirection::Bidirectional);
        req.complete(status);
        Ok(())
    }
}

// =============================================================================
// Frame Queue Handlers
// =============================================================================

/// Handler of a CPU's response queue.
pub struct RspFqHandler {
    napi: Arc<Napi>,
    inflight: Arc<InflightTable>,
}

impl RspFqHandler {
    pub fn new(napi: Arc<Napi>, inflight: Arc<InflightTable>) -> Self {
        Self { napi, inflight }
    }
}

impl FqHandler for RspFqHandler {
    fn dqrr(
        &self,
        portal: &dyn Portal,
        fqid: Fqid,
        fd: &FrameDescriptor,
        origin: DqrrOrigin,
    ) -> DqrrResult {
        if origin != DqrrOrigin::Poll {
            portal.irqsource_remove(PortalIrq::Dqri);
            self.napi.schedule();
            return DqrrResult::Stop;
        }

        if fd.status != 0 && !is_icv_failure(fd.status) {
            tracing::error!(
                %fqid,
                status = format_args!("{:#x}", fd.status),
                "error in CAAM response frame"
            );
        }
        let status = ReqStatus::from_raw(fd.status);
        if let Err(e) = self.inflight.complete_frame(fd, status) {
            tracing::error!(%fqid, cpu = portal.cpu(), error = %e, "dropping response frame");
        }
        DqrrResult::Consume
    }
}

/// Handler of a request queue. Only sees frames the accelerator never ran.
pub struct ReqFqHandler {
    inflight: Arc<InflightTable>,
}

impl ReqFqHandler {
    pub fn new(inflight: Arc<InflightTable>) -> Self {
        Self { inflight }
    }

    fn reject(&self, fqid: Fqid, fd: &FrameDescriptor) {
        if let Err(e) = self.inflight.complete_frame(fd, ReqStatus::Rejected) {
            tracing::error!(%fqid, error = %e, "dropping rejected frame");
        }
    }
}

impl FqHandler for ReqFqHandler {
    fn dqrr(
        &self,
        _portal: &dyn Portal,
        fqid: Fqid,
        fd: &FrameDescriptor,
        _origin: DqrrOrigin,
    ) -> DqrrResult {
        self.reject(fqid, fd);
        DqrrResult::Consume
    }

    fn ern(&self, fqid: Fqid, fd: &FrameDescriptor) {
        self.reject(fqid, fd);
    }
}
