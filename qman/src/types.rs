//! Frame, queue and congestion-group types shared by the queue manager
//! interface and its users.

use std::fmt;

use bitflags::bitflags;

// =============================================================================
// Identifiers
// =============================================================================

/// Frame queue identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fqid(pub u32);

impl fmt::Display for Fqid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Congestion group identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CgrId(pub u32);

impl fmt::Display for CgrId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Address as seen by the device (IOVA when an IOMMU domain is active).
pub type DmaAddr = u64;

/// Physical address of a buffer.
pub type PhysAddr = u64;

/// Destination channel of a frame queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Direct-connect portal of the crypto accelerator.
    Caam,
    /// Software portal affine to the given CPU.
    Portal(usize),
}

// =============================================================================
// Frame Descriptors
// =============================================================================

/// Frame descriptor format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdFormat {
    /// Single contiguous buffer.
    Contiguous,
    /// Scatter/gather table.
    ScatterGather,
    /// Two-entry table: output buffer first, input buffer second.
    Compound,
}

/// Hardware frame descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameDescriptor {
    /// Buffer layout.
    pub format: FdFormat,
    /// Command word (unused by the accelerator for compound frames).
    pub cmd: u32,
    /// Weight charged against the congestion group while queued.
    pub cong_weight: u32,
    /// Device address of the buffer or table.
    pub addr: DmaAddr,
    /// Status written back by the accelerator (0 = success).
    pub status: u32,
}

impl FrameDescriptor {
    /// Build a compound frame pointing at a mapped scatter table.
    pub fn compound(addr: DmaAddr, cong_weight: u32) -> Self {
        Self {
            format: FdFormat::Compound,
            cmd: 0,
            cong_weight,
            addr,
            status: 0,
        }
    }
}

/// One entry of a scatter/gather table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct SgEntry {
    /// Buffer address.
    pub addr: u64,
    /// Buffer length in bytes.
    pub length: u32,
    /// Buffer pool id (0 when not pool-backed).
    pub bpid: u8,
    /// Offset of the data inside the buffer.
    pub offset: u16,
    /// Last entry of the table.
    pub final_entry: bool,
    /// Entry points to another table.
    pub extension: bool,
}

impl SgEntry {
    /// Entry for a plain buffer.
    pub fn new(addr: u64, length: u32) -> Self {
        Self {
            addr,
            length,
            ..Default::default()
        }
    }
}

// =============================================================================
// Frame Queue State
// =============================================================================

/// Frame queue state as tracked by the queue manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FqState {
    /// Created but not initialised, or taken out of service.
    Oos,
    /// Initialised, not eligible for dequeue.
    Parked,
    /// Eligible for dequeue by its destination channel.
    Scheduled,
    /// Retirement requested, completion pending.
    Retiring,
    /// Retired; may still hold frames.
    Retired,
}

bitflags! {
    /// Frame queue creation flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FqFlags: u32 {
        /// Queue manager picks the fqid.
        const DYNAMIC_FQID = 1 << 0;
        /// Frames are consumed by a direct-connect portal.
        const TO_DCPORTAL = 1 << 1;
        /// Software never enqueues to this queue.
        const NO_ENQUEUE = 1 << 2;
    }
}

bitflags! {
    /// Runtime frame queue flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FqStateFlags: u32 {
        /// Queue holds frames (including frames owed to a volatile dequeue).
        const NE = 1 << 0;
        /// Queue cannot go out of service yet.
        const BLOCKOOS = 1 << 1;
        /// Order restoration list still in use.
        const ORL = 1 << 2;
    }
}

bitflags! {
    /// Which fields of [`InitFqOptions`] are written.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct InitFqWe: u32 {
        const FQCTRL = 1 << 0;
        const DESTWQ = 1 << 1;
        const CONTEXTB = 1 << 2;
        const CONTEXTA = 1 << 3;
        const CGID = 1 << 4;
    }
}

bitflags! {
    /// Frame queue control bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FqCtrl: u32 {
        /// Stash the queue context into the CPU cache.
        const CPCSTASH = 1 << 0;
        /// Frames count towards the queue's congestion group.
        const CGE = 1 << 1;
        /// Context-A carries stashing configuration.
        const CTXASTASHING = 1 << 2;
    }
}

/// Context-A stashing parameters for software-consumed queues.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stashing {
    /// Exclusive stashing of context lines.
    pub exclusive_ctx: bool,
    /// Exclusive stashing of data lines.
    pub exclusive_data: bool,
    /// Data cache lines to stash.
    pub data_cl: u8,
    /// Context cache lines to stash.
    pub context_cl: u8,
}

/// Frame queue initialisation parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitFqOptions {
    pub we_mask: InitFqWe,
    pub fq_ctrl: FqCtrl,
    pub dest_channel: Channel,
    pub dest_wq: u8,
    /// Opaque per-queue context handed to the consumer (descriptor address
    /// for accelerator queues).
    pub context_a: u64,
    /// Secondary context (response fqid for accelerator queues).
    pub context_b: u32,
    pub stashing: Option<Stashing>,
    pub cgid: Option<CgrId>,
}

impl InitFqOptions {
    /// Options targeting `channel` with nothing else written.
    pub fn new(dest_channel: Channel, dest_wq: u8) -> Self {
        Self {
            we_mask: InitFqWe::DESTWQ,
            fq_ctrl: FqCtrl::empty(),
            dest_channel,
            dest_wq,
            context_a: 0,
            context_b: 0,
            stashing: None,
            cgid: None,
        }
    }
}

/// Result of a retirement request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetireStatus {
    /// The queue retired immediately.
    Retired,
    /// Retirement completes asynchronously; poll [`FqState`].
    Pending,
}

/// Non-programmable fields returned by a queue query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FqQueryNp {
    /// Frames currently held by the queue.
    pub frm_cnt: u32,
    /// Bytes currently held by the queue.
    pub byte_cnt: u64,
}

// =============================================================================
// Congestion Groups
// =============================================================================

/// Congestion accounting mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgrMode {
    /// Count frames.
    Frame,
    /// Count bytes.
    Byte,
}

/// Congestion group initialisation parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitCgrOptions {
    /// Deliver state change notifications.
    pub cscn_en: bool,
    pub mode: CgrMode,
    /// Congestion state threshold: entering at or above, exiting below.
    pub cs_thres: u64,
}

// =============================================================================
// Portal Dispatch
// =============================================================================

/// Context a dequeue callback runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DqrrOrigin {
    /// Portal interrupt handler.
    Irq,
    /// Cooperative poll context (budgeted, soft-interrupt like).
    Poll,
    /// Ordinary thread polling the portal directly.
    Process,
}

/// Callback verdict for a dequeued entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DqrrResult {
    /// Entry handled, remove it from the ring.
    Consume,
    /// Leave the entry in place and stop this poll.
    Stop,
}

/// Portal interrupt sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortalIrq {
    /// Dequeue ring has entries.
    Dqri,
}
