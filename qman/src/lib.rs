//! # qman - frame queue manager capability interface
//!
//! The queue-interface backend talks to two hardware collaborators: a frame
//! queue manager (queues, portals, congestion groups) and a DMA layer
//! (mapping, optional IOMMU translation). This crate expresses both as narrow
//! traits and ships a software model of each.
//!
//! ## Queue-Centric Model
//!
//! - **Frame Queue (FQ)**: FIFO of [`FrameDescriptor`]s with a destination
//!   channel. Queues aimed at [`Channel::Caam`] feed the accelerator; queues
//!   aimed at [`Channel::Portal`] are dequeued by a CPU's software portal.
//! - **Portal**: per-CPU dequeue ring. [`QueueManager::poll_dqrr`] dispatches
//!   ring entries to the owning queue's [`FqHandler`].
//! - **Congestion Group (CGR)**: aggregate frame counter over a set of queues
//!   with a threshold; state changes go to a [`CgrHandler`].
//!
//! ## Callback-Based Completion Handling
//!
//! Handlers are registered when a queue is created and are invoked without
//! any queue-manager lock held, so they may enqueue or change portal
//! interrupt sources freely.
//!
//! ## Module Overview
//!
//! - [`types`]: identifiers, frame descriptors, queue and CGR options
//! - [`dma`]: DMA mapping and IOMMU traits plus [`SoftDma`]
//! - [`cpu`]: affine CPU sets and logical CPU pinning
//! - [`soft`]: [`SoftQman`], a software queue manager with fault injection

pub mod cpu;
pub mod dma;
pub mod soft;
pub mod types;

use std::io;
use std::sync::Arc;

pub use cpu::{AffinityGuard, CpuSet};
pub use dma::{DmaDirection, DmaMapper, IommuDomain, SoftDma};
pub use soft::SoftQman;
pub use types::{
    CgrId, CgrMode, Channel, DmaAddr, DqrrOrigin, DqrrResult, FdFormat, FqCtrl, FqFlags,
    FqQueryNp, FqState, FqStateFlags, FrameDescriptor, Fqid, InitCgrOptions, InitFqOptions,
    InitFqWe, PhysAddr, PortalIrq, RetireStatus, SgEntry, Stashing,
};

/// Portal handed to dequeue callbacks.
pub trait Portal {
    /// CPU the portal is affine to.
    fn cpu(&self) -> usize;

    /// Enable an interrupt source on this portal.
    fn irqsource_add(&self, src: PortalIrq);

    /// Disable an interrupt source on this portal.
    fn irqsource_remove(&self, src: PortalIrq);
}

/// Per-queue callbacks.
pub trait FqHandler: Send + Sync {
    /// A frame was dequeued from `fqid` on `portal`.
    fn dqrr(
        &self,
        portal: &dyn Portal,
        fqid: Fqid,
        fd: &FrameDescriptor,
        origin: DqrrOrigin,
    ) -> DqrrResult;

    /// An enqueue to `fqid` was rejected after it had been accepted.
    fn ern(&self, fqid: Fqid, fd: &FrameDescriptor) {
        let _ = (fqid, fd);
    }
}

/// Congestion state change notifications.
pub trait CgrHandler: Send + Sync {
    fn congestion(&self, cgrid: CgrId, congested: bool);
}

/// Capability set of a frame queue manager.
///
/// Errors follow the `io::Error` conventions of the rest of the stack:
/// an enqueue that hits a full ring fails with [`io::ErrorKind::WouldBlock`]
/// and may be retried.
pub trait QueueManager: Send + Sync {
    /// CPUs owning a software portal.
    fn affine_cpus(&self) -> CpuSet;

    /// Dequeue channel of the portal affine to `cpu`.
    fn affine_channel(&self, cpu: usize) -> Channel {
        Channel::Portal(cpu)
    }

    fn alloc_cgrid(&self) -> io::Result<CgrId>;
    fn release_cgrid(&self, cgrid: CgrId);
    fn create_cgr(
        &self,
        cgrid: CgrId,
        opts: &InitCgrOptions,
        handler: Arc<dyn CgrHandler>,
    ) -> io::Result<()>;
    /// Must run on the CPU that created the group.
    fn delete_cgr(&self, cgrid: CgrId) -> io::Result<()>;

    fn create_fq(&self, flags: FqFlags, handler: Arc<dyn FqHandler>) -> io::Result<Fqid>;
    fn init_fq(&self, fqid: Fqid, schedule: bool, opts: &InitFqOptions) -> io::Result<()>;
    fn schedule_fq(&self, fqid: Fqid) -> io::Result<()>;
    fn retire_fq(&self, fqid: Fqid) -> io::Result<RetireStatus>;
    fn oos_fq(&self, fqid: Fqid) -> io::Result<()>;
    fn destroy_fq(&self, fqid: Fqid);

    /// Current state, `None` once destroyed.
    fn fq_state(&self, fqid: Fqid) -> Option<FqState>;
    fn fq_flags(&self, fqid: Fqid) -> FqStateFlags;
    fn query_fq_np(&self, fqid: Fqid) -> io::Result<FqQueryNp>;

    /// Pull every frame of a retired queue to the portal of `cpu`, ahead of
    /// scheduled dequeues.
    fn volatile_dequeue(&self, fqid: Fqid, cpu: usize) -> io::Result<()>;

    fn enqueue(&self, fqid: Fqid, fd: &FrameDescriptor) -> io::Result<()>;

    /// Dispatch up to `limit` entries of the portal affine to `cpu`.
    /// Returns the number of entries consumed.
    fn poll_dqrr(&self, cpu: usize, limit: usize, origin: DqrrOrigin) -> usize;

    fn irqsource_add(&self, cpu: usize, src: PortalIrq);
    fn irqsource_remove(&self, cpu: usize, src: PortalIrq);
}
