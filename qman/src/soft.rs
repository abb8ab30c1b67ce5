//! Software queue manager.
//!
//! [`SoftQman`] implements [`QueueManager`] entirely in memory. It keeps
//! per-queue FIFOs, per-CPU portals with a DQRI interrupt source and
//! congestion groups with frame or byte accounting. The accelerator side is
//! driven explicitly through [`SoftQman::process_caam`], which moves frames
//! from scheduled accelerator queues to the queue named by their context-B
//! and raises the destination portal's interrupt.
//!
//! Handlers are always invoked with no internal lock held. A portal is
//! serviced by one poller at a time; an interrupt raised while the portal is
//! busy is latched and delivered when the current poller lets go.
//!
//! Fault injection hooks cover every failure the backend has to survive:
//! create/init/schedule/oos failures, query failures, a full enqueue ring,
//! asynchronous (or stuck) retirement, CGR id exhaustion and sticky
//! `BLOCKOOS`/`ORL` flags.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};

use crate::cpu::{self, CpuSet};
use crate::types::{
    CgrId, CgrMode, Channel, DqrrOrigin, DqrrResult, FqCtrl, FqFlags, FqQueryNp, FqState,
    FqStateFlags, FrameDescriptor, Fqid, InitCgrOptions, InitFqOptions, PortalIrq, RetireStatus,
};
use crate::{CgrHandler, FqHandler, Portal, QueueManager};

/// Entries serviced per interrupt delivery.
const IRQ_POLL_LIMIT: usize = 32;

/// First dynamically allocated fqid.
const FQID_BASE: u32 = 0x400;

// =============================================================================
// Internal State
// =============================================================================

struct SoftFq {
    flags: FqFlags,
    state: FqState,
    handler: Arc<dyn FqHandler>,
    opts: Option<InitFqOptions>,
    frames: VecDeque<FrameDescriptor>,
    /// Portal owed the remaining frames by a volatile dequeue.
    vdq_cpu: Option<usize>,
    /// `fq_state` calls left before an asynchronous retirement completes.
    retire_polls: usize,
}

impl SoftFq {
    fn cgr(&self) -> Option<CgrId> {
        self.opts
            .filter(|o| o.fq_ctrl.contains(FqCtrl::CGE))
            .and_then(|o| o.cgid)
    }

    fn dest(&self) -> Option<Channel> {
        self.opts.map(|o| o.dest_channel)
    }

    /// Scheduled queue whose frames go to the portal of `cpu`.
    fn feeds_portal(&self, cpu: usize) -> bool {
        self.state == FqState::Scheduled && self.dest() == Some(Channel::Portal(cpu))
    }
}

struct SoftCgr {
    mode: CgrMode,
    thres: u64,
    cscn_en: bool,
    handler: Arc<dyn CgrHandler>,
    count: u64,
    congested: bool,
    owner_cpu: Option<usize>,
}

type CgrNote = (Arc<dyn CgrHandler>, CgrId, bool);

#[derive(Default)]
struct Faults {
    create: usize,
    init: usize,
    schedule: usize,
    oos: usize,
    query: usize,
    cgrid_alloc: usize,
    busy_enqueues: usize,
    ring_full: bool,
    retire_pending: Option<usize>,
    sticky_flags: HashMap<Fqid, FqStateFlags>,
}

fn take(counter: &mut usize) -> bool {
    if *counter > 0 {
        *counter -= 1;
        true
    } else {
        false
    }
}

#[derive(Default)]
struct Inner {
    fqs: BTreeMap<Fqid, SoftFq>,
    cgrs: HashMap<CgrId, SoftCgr>,
    allocated_cgrids: HashSet<CgrId>,
    next_fqid: u32,
    next_cgrid: u32,
    faults: Faults,
    enqueue_attempts: u64,
}

/// Charge or credit one frame against a congestion group.
fn account(
    cgrs: &mut HashMap<CgrId, SoftCgr>,
    cgid: Option<CgrId>,
    fd: &FrameDescriptor,
    add: bool,
    notes: &mut Vec<CgrNote>,
) {
    let Some(id) = cgid else { return };
    let Some(cgr) = cgrs.get_mut(&id) else { return };
    let weight = match cgr.mode {
        CgrMode::Frame => 1,
        CgrMode::Byte => u64::from(fd.cong_weight),
    };
    if add {
        cgr.count += weight;
    } else {
        cgr.count = cgr.count.saturating_sub(weight);
    }
    let congested = cgr.count >= cgr.thres;
    if congested != cgr.congested {
        cgr.congested = congested;
        if cgr.cscn_en {
            notes.push((Arc::clone(&cgr.handler), id, congested));
        }
    }
}

fn notify(notes: Vec<CgrNote>) {
    for (handler, id, congested) in notes {
        handler.congestion(id, congested);
    }
}

struct SoftPortal {
    poll_lock: Mutex<()>,
    irq_enabled: AtomicBool,
    irq_pending: AtomicBool,
}

impl SoftPortal {
    fn new() -> Self {
        Self {
            poll_lock: Mutex::new(()),
            irq_enabled: AtomicBool::new(true),
            irq_pending: AtomicBool::new(false),
        }
    }
}

/// Portal view handed to dequeue callbacks.
struct PortalRef<'a> {
    qman: &'a SoftQman,
    cpu: usize,
}

impl Portal for PortalRef<'_> {
    fn cpu(&self) -> usize {
        self.cpu
    }

    fn irqsource_add(&self, src: PortalIrq) {
        self.qman.irqsource_add(self.cpu, src);
    }

    fn irqsource_remove(&self, src: PortalIrq) {
        self.qman.irqsource_remove(self.cpu, src);
    }
}

fn not_found(fqid: Fqid) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("no frame queue {fqid}"))
}

fn bad_state(fqid: Fqid, op: &str, state: FqState) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("cannot {op} frame queue {fqid} in state {state:?}"),
    )
}

fn injected(what: &str) -> io::Error {
    io::Error::other(format!("injected {what} failure"))
}

// =============================================================================
// SoftQman
// =============================================================================

/// In-memory queue manager.
pub struct SoftQman {
    cpus: CpuSet,
    portals: HashMap<usize, SoftPortal>,
    inner: Mutex<Inner>,
}

impl SoftQman {
    /// Queue manager with one portal per CPU in `cpus`.
    pub fn new(cpus: CpuSet) -> Self {
        let portals = cpus.iter().map(|c| (c, SoftPortal::new())).collect();
        Self {
            cpus,
            portals,
            inner: Mutex::new(Inner {
                next_fqid: FQID_BASE,
                next_cgrid: 1,
                ..Default::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // -------------------------------------------------------------------------
    // Accelerator model
    // -------------------------------------------------------------------------

    /// Run the accelerator over up to `max` frames.
    ///
    /// Frames are taken in FIFO order from scheduled accelerator queues
    /// (lowest fqid first), stamped with the status returned by `engine`,
    /// and enqueued to the queue named by the source queue's context-B.
    /// `engine` runs with the internal lock held and must not call back into
    /// the queue manager. Returns the number of frames processed.
    pub fn process_caam<F>(&self, max: usize, mut engine: F) -> usize
    where
        F: FnMut(&FrameDescriptor) -> u32,
    {
        let mut notes = Vec::new();
        let mut ring = BTreeSet::new();
        let mut done = 0;
        {
            let mut inner = self.lock();
            let Inner { fqs, cgrs, .. } = &mut *inner;
            let sources: Vec<Fqid> = fqs
                .iter()
                .filter(|(_, fq)| {
                    fq.state == FqState::Scheduled
                        && fq.dest() == Some(Channel::Caam)
                        && !fq.frames.is_empty()
                })
                .map(|(id, _)| *id)
                .collect();

            'sources: for src in sources {
                while done < max {
                    let Some(fq) = fqs.get_mut(&src) else { break };
                    let Some(mut fd) = fq.frames.pop_front() else { break };
                    let src_cgr = fq.cgr();
                    let rsp = Fqid(fq.opts.map_or(0, |o| o.context_b));
                    fd.status = engine(&fd);
                    done += 1;

                    let Some(dst) = fqs.get_mut(&rsp).filter(|fq| {
                        matches!(fq.state, FqState::Parked | FqState::Scheduled)
                    }) else {
                        tracing::warn!(
                            fqid = %src,
                            rsp = %rsp,
                            "response queue gone, frame dropped"
                        );
                        account(cgrs, src_cgr, &fd, false, &mut notes);
                        continue;
                    };
                    let dst_cgr = dst.cgr();
                    dst.frames.push_back(fd);
                    if let Some(Channel::Portal(cpu)) = dst.dest()
                        && dst.state == FqState::Scheduled
                    {
                        ring.insert(cpu);
                    }
                    if src_cgr != dst_cgr {
                        account(cgrs, src_cgr, &fd, false, &mut notes);
                        account(cgrs, dst_cgr, &fd, true, &mut notes);
                    }
                }
                if done == max {
                    break 'sources;
                }
            }
        }
        notify(notes);
        for cpu in ring {
            self.raise_irq(cpu);
        }
        done
    }

    // -------------------------------------------------------------------------
    // Portal dispatch
    // -------------------------------------------------------------------------

    /// Next entry of the portal: volatile dequeues first, then scheduled
    /// queues, lowest fqid first.
    fn peek(&self, cpu: usize) -> Option<(Fqid, FrameDescriptor, Arc<dyn FqHandler>)> {
        let inner = self.lock();
        let pick = |pred: &dyn Fn(&SoftFq) -> bool| {
            inner
                .fqs
                .iter()
                .find(|(_, fq)| pred(fq) && !fq.frames.is_empty())
                .and_then(|(id, fq)| {
                    fq.frames
                        .front()
                        .map(|fd| (*id, *fd, Arc::clone(&fq.handler)))
                })
        };
        pick(&|fq: &SoftFq| fq.vdq_cpu == Some(cpu))
            .or_else(|| pick(&|fq: &SoftFq| fq.feeds_portal(cpu)))
    }

    fn pop(&self, fqid: Fqid) {
        let mut notes = Vec::new();
        {
            let mut inner = self.lock();
            let Inner { fqs, cgrs, .. } = &mut *inner;
            if let Some(fq) = fqs.get_mut(&fqid)
                && let Some(fd) = fq.frames.pop_front()
            {
                if fq.frames.is_empty() {
                    fq.vdq_cpu = None;
                }
                let cgr = fq.cgr();
                account(cgrs, cgr, &fd, false, &mut notes);
            }
        }
        notify(notes);
    }

    fn has_pending(&self, cpu: usize) -> bool {
        self.lock()
            .fqs
            .values()
            .any(|fq| !fq.frames.is_empty() && (fq.vdq_cpu == Some(cpu) || fq.feeds_portal(cpu)))
    }

    /// Dispatch loop; the caller holds the portal's poll lock.
    fn dispatch(&self, cpu: usize, limit: usize, origin: DqrrOrigin) -> usize {
        let portal = PortalRef { qman: self, cpu };
        let mut consumed = 0;
        while consumed < limit {
            let Some((fqid, fd, handler)) = self.peek(cpu) else {
                break;
            };
            match handler.dqrr(&portal, fqid, &fd, origin) {
                DqrrResult::Consume => {
                    self.pop(fqid);
                    consumed += 1;
                }
                DqrrResult::Stop => break,
            }
        }
        consumed
    }

    /// Deliver a DQRI interrupt to the portal of `cpu` if it is enabled.
    fn raise_irq(&self, cpu: usize) {
        let Some(portal) = self.portals.get(&cpu) else {
            return;
        };
        loop {
            if !portal.irq_enabled.load(Ordering::Acquire) || !self.has_pending(cpu) {
                return;
            }
            portal.irq_pending.store(true, Ordering::Release);
            let guard = match portal.poll_lock.try_lock() {
                Ok(g) => g,
                Err(TryLockError::Poisoned(e)) => e.into_inner(),
                // The current poller picks the latch up on its way out.
                Err(TryLockError::WouldBlock) => return,
            };
            portal.irq_pending.store(false, Ordering::Release);
            self.dispatch(cpu, IRQ_POLL_LIMIT, DqrrOrigin::Irq);
            drop(guard);
            if !portal.irq_pending.load(Ordering::Acquire) {
                return;
            }
        }
    }

    // -------------------------------------------------------------------------
    // Fault injection
    // -------------------------------------------------------------------------

    /// Fail the next `n` calls to `create_fq`.
    pub fn fail_next_create(&self, n: usize) {
        self.lock().faults.create = n;
    }

    /// Fail the next `n` calls to `init_fq`.
    pub fn fail_next_init(&self, n: usize) {
        self.lock().faults.init = n;
    }

    /// Fail the next `n` calls to `schedule_fq`.
    pub fn fail_next_schedule(&self, n: usize) {
        self.lock().faults.schedule = n;
    }

    /// Fail the next `n` calls to `oos_fq`.
    pub fn fail_next_oos(&self, n: usize) {
        self.lock().faults.oos = n;
    }

    /// Fail the next `n` calls to `query_fq_np`.
    pub fn fail_next_queries(&self, n: usize) {
        self.lock().faults.query = n;
    }

    /// Fail the next `n` calls to `alloc_cgrid`.
    pub fn fail_next_cgrid_alloc(&self, n: usize) {
        self.lock().faults.cgrid_alloc = n;
    }

    /// Reject the next `n` enqueues with `WouldBlock`.
    pub fn fail_next_enqueues(&self, n: usize) {
        self.lock().faults.busy_enqueues = n;
    }

    /// Reject every enqueue with `WouldBlock` while set.
    pub fn set_ring_full(&self, full: bool) {
        self.lock().faults.ring_full = full;
    }

    /// Make retirements asynchronous, completing after `polls` calls to
    /// `fq_state`. `Some(usize::MAX)` never completes.
    pub fn set_retire_pending(&self, polls: Option<usize>) {
        self.lock().faults.retire_pending = polls;
    }

    /// Report `flags` for `fqid` on top of the tracked ones.
    pub fn set_sticky_flags(&self, fqid: Fqid, flags: FqStateFlags) {
        self.lock().faults.sticky_flags.insert(fqid, flags);
    }

    // -------------------------------------------------------------------------
    // Inspection
    // -------------------------------------------------------------------------

    pub fn fq_exists(&self, fqid: Fqid) -> bool {
        self.lock().fqs.contains_key(&fqid)
    }

    /// Number of live frame queues.
    pub fn fq_count(&self) -> usize {
        self.lock().fqs.len()
    }

    /// Options the queue was last initialised with.
    pub fn fq_options(&self, fqid: Fqid) -> Option<InitFqOptions> {
        self.lock().fqs.get(&fqid).and_then(|fq| fq.opts)
    }

    /// Frames held by `fqid`.
    pub fn fq_len(&self, fqid: Fqid) -> usize {
        self.lock().fqs.get(&fqid).map_or(0, |fq| fq.frames.len())
    }

    /// Current congestion count of `cgrid`.
    pub fn cgr_count(&self, cgrid: CgrId) -> Option<u64> {
        self.lock().cgrs.get(&cgrid).map(|c| c.count)
    }

    /// Number of live congestion groups.
    pub fn cgr_len(&self) -> usize {
        self.lock().cgrs.len()
    }

    /// Number of allocated (not yet released) congestion group ids.
    pub fn cgrids_allocated(&self) -> usize {
        self.lock().allocated_cgrids.len()
    }

    /// Total enqueue calls, successful or not.
    pub fn enqueue_attempts(&self) -> u64 {
        self.lock().enqueue_attempts
    }

    pub fn reset_enqueue_attempts(&self) {
        self.lock().enqueue_attempts = 0;
    }

    pub fn irq_enabled(&self, cpu: usize) -> bool {
        self.portals
            .get(&cpu)
            .is_some_and(|p| p.irq_enabled.load(Ordering::Acquire))
    }

    /// Whether the portal of `cpu` has entries waiting.
    pub fn portal_pending(&self, cpu: usize) -> bool {
        self.has_pending(cpu)
    }
}

impl QueueManager for SoftQman {
    fn affine_cpus(&self) -> CpuSet {
        self.cpus.clone()
    }

    fn alloc_cgrid(&self) -> io::Result<CgrId> {
        let mut inner = self.lock();
        if take(&mut inner.faults.cgrid_alloc) {
            return Err(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "no congestion group id available",
            ));
        }
        let id = CgrId(inner.next_cgrid);
        inner.next_cgrid += 1;
        inner.allocated_cgrids.insert(id);
        Ok(id)
    }

    fn release_cgrid(&self, cgrid: CgrId) {
        if !self.lock().allocated_cgrids.remove(&cgrid) {
            tracing::warn!(%cgrid, "release of unallocated cgrid");
        }
    }

    fn create_cgr(
        &self,
        cgrid: CgrId,
        opts: &InitCgrOptions,
        handler: Arc<dyn CgrHandler>,
    ) -> io::Result<()> {
        let mut inner = self.lock();
        if !inner.allocated_cgrids.contains(&cgrid) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("cgrid {cgrid} not allocated"),
            ));
        }
        if inner.cgrs.contains_key(&cgrid) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("cgr {cgrid} already exists"),
            ));
        }
        inner.cgrs.insert(
            cgrid,
            SoftCgr {
                mode: opts.mode,
                thres: opts.cs_thres,
                cscn_en: opts.cscn_en,
                handler,
                count: 0,
                congested: false,
                owner_cpu: cpu::current(),
            },
        );
        Ok(())
    }

    fn delete_cgr(&self, cgrid: CgrId) -> io::Result<()> {
        let mut inner = self.lock();
        let Some(cgr) = inner.cgrs.get(&cgrid) else {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no cgr {cgrid}"),
            ));
        };
        let here = cpu::current();
        if cgr.owner_cpu != here {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!(
                    "cgr {cgrid} created on cpu {:?}, deleted on cpu {here:?}",
                    cgr.owner_cpu
                ),
            ));
        }
        inner.cgrs.remove(&cgrid);
        Ok(())
    }

    fn create_fq(&self, flags: FqFlags, handler: Arc<dyn FqHandler>) -> io::Result<Fqid> {
        let mut inner = self.lock();
        if take(&mut inner.faults.create) {
            return Err(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "injected create failure",
            ));
        }
        if !flags.contains(FqFlags::DYNAMIC_FQID) {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "only dynamic fqids are supported",
            ));
        }
        let fqid = Fqid(inner.next_fqid);
        inner.next_fqid += 1;
        inner.fqs.insert(
            fqid,
            SoftFq {
                flags,
                state: FqState::Oos,
                handler,
                opts: None,
                frames: VecDeque::new(),
                vdq_cpu: None,
                retire_polls: 0,
            },
        );
        Ok(fqid)
    }

    fn init_fq(&self, fqid: Fqid, schedule: bool, opts: &InitFqOptions) -> io::Result<()> {
        let ring = {
            let mut inner = self.lock();
            if take(&mut inner.faults.init) {
                return Err(injected("init"));
            }
            let fq = inner.fqs.get_mut(&fqid).ok_or_else(|| not_found(fqid))?;
            if !matches!(fq.state, FqState::Oos | FqState::Parked) {
                return Err(bad_state(fqid, "init", fq.state));
            }
            fq.opts = Some(*opts);
            fq.state = if schedule {
                FqState::Scheduled
            } else {
                FqState::Parked
            };
            match opts.dest_channel {
                Channel::Portal(cpu) if schedule && !fq.frames.is_empty() => Some(cpu),
                _ => None,
            }
        };
        if let Some(cpu) = ring {
            self.raise_irq(cpu);
        }
        Ok(())
    }

    fn schedule_fq(&self, fqid: Fqid) -> io::Result<()> {
        let ring = {
            let mut inner = self.lock();
            if take(&mut inner.faults.schedule) {
                return Err(injected("schedule"));
            }
            let fq = inner.fqs.get_mut(&fqid).ok_or_else(|| not_found(fqid))?;
            if fq.state != FqState::Parked {
                return Err(bad_state(fqid, "schedule", fq.state));
            }
            fq.state = FqState::Scheduled;
            match fq.dest() {
                Some(Channel::Portal(cpu)) if !fq.frames.is_empty() => Some(cpu),
                _ => None,
            }
        };
        if let Some(cpu) = ring {
            self.raise_irq(cpu);
        }
        Ok(())
    }

    fn retire_fq(&self, fqid: Fqid) -> io::Result<RetireStatus> {
        let mut inner = self.lock();
        let pending = inner.faults.retire_pending;
        let fq = inner.fqs.get_mut(&fqid).ok_or_else(|| not_found(fqid))?;
        if !matches!(fq.state, FqState::Parked | FqState::Scheduled) {
            return Err(bad_state(fqid, "retire", fq.state));
        }
        match pending {
            Some(polls) => {
                fq.state = FqState::Retiring;
                fq.retire_polls = polls;
                Ok(RetireStatus::Pending)
            }
            None => {
                fq.state = FqState::Retired;
                Ok(RetireStatus::Retired)
            }
        }
    }

    fn oos_fq(&self, fqid: Fqid) -> io::Result<()> {
        let mut inner = self.lock();
        if take(&mut inner.faults.oos) {
            return Err(injected("oos"));
        }
        let fq = inner.fqs.get_mut(&fqid).ok_or_else(|| not_found(fqid))?;
        if fq.state != FqState::Retired {
            return Err(bad_state(fqid, "take out of service", fq.state));
        }
        if !fq.frames.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::ResourceBusy,
                format!("frame queue {fqid} still holds {} frames", fq.frames.len()),
            ));
        }
        fq.state = FqState::Oos;
        Ok(())
    }

    fn destroy_fq(&self, fqid: Fqid) {
        let mut notes = Vec::new();
        {
            let mut inner = self.lock();
            let Inner {
                fqs, cgrs, faults, ..
            } = &mut *inner;
            let Some(fq) = fqs.remove(&fqid) else {
                tracing::warn!(%fqid, "destroy of unknown frame queue");
                return;
            };
            faults.sticky_flags.remove(&fqid);
            if !matches!(fq.state, FqState::Oos | FqState::Parked) {
                tracing::warn!(%fqid, state = ?fq.state, "destroying frame queue in service");
            }
            let cgr = fq.cgr();
            for fd in &fq.frames {
                account(cgrs, cgr, fd, false, &mut notes);
            }
        }
        notify(notes);
    }

    fn fq_state(&self, fqid: Fqid) -> Option<FqState> {
        let mut inner = self.lock();
        let fq = inner.fqs.get_mut(&fqid)?;
        if fq.state == FqState::Retiring {
            if fq.retire_polls == 0 {
                fq.state = FqState::Retired;
            } else if fq.retire_polls != usize::MAX {
                fq.retire_polls -= 1;
            }
        }
        Some(fq.state)
    }

    fn fq_flags(&self, fqid: Fqid) -> FqStateFlags {
        let inner = self.lock();
        let Some(fq) = inner.fqs.get(&fqid) else {
            return FqStateFlags::empty();
        };
        let mut flags = inner
            .faults
            .sticky_flags
            .get(&fqid)
            .copied()
            .unwrap_or_default();
        if !fq.frames.is_empty() {
            flags |= FqStateFlags::NE;
        }
        flags
    }

    fn query_fq_np(&self, fqid: Fqid) -> io::Result<FqQueryNp> {
        let mut inner = self.lock();
        if take(&mut inner.faults.query) {
            return Err(injected("query"));
        }
        let fq = inner.fqs.get(&fqid).ok_or_else(|| not_found(fqid))?;
        Ok(FqQueryNp {
            frm_cnt: u32::try_from(fq.frames.len()).unwrap_or(u32::MAX),
            byte_cnt: fq.frames.iter().map(|fd| u64::from(fd.cong_weight)).sum(),
        })
    }

    fn volatile_dequeue(&self, fqid: Fqid, cpu: usize) -> io::Result<()> {
        let mut inner = self.lock();
        let fq = inner.fqs.get_mut(&fqid).ok_or_else(|| not_found(fqid))?;
        if !matches!(fq.state, FqState::Retired | FqState::Parked) {
            return Err(bad_state(fqid, "volatile dequeue", fq.state));
        }
        if fq.vdq_cpu.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::ResourceBusy,
                format!("volatile dequeue already active on {fqid}"),
            ));
        }
        if !fq.frames.is_empty() {
            fq.vdq_cpu = Some(cpu);
        }
        Ok(())
    }

    fn enqueue(&self, fqid: Fqid, fd: &FrameDescriptor) -> io::Result<()> {
        enum Outcome {
            Queued(Option<usize>),
            Rejected(Arc<dyn FqHandler>),
        }

        let mut notes = Vec::new();
        let outcome = {
            let mut inner = self.lock();
            inner.enqueue_attempts += 1;
            let Inner {
                fqs, cgrs, faults, ..
            } = &mut *inner;
            if faults.ring_full || take(&mut faults.busy_enqueues) {
                return Err(io::Error::new(
                    io::ErrorKind::WouldBlock,
                    "enqueue ring full",
                ));
            }
            let fq = fqs.get_mut(&fqid).ok_or_else(|| not_found(fqid))?;
            if fq.flags.contains(FqFlags::NO_ENQUEUE) {
                return Err(io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    format!("frame queue {fqid} does not accept enqueues"),
                ));
            }
            match fq.state {
                FqState::Parked | FqState::Scheduled => {
                    fq.frames.push_back(*fd);
                    let cgr = fq.cgr();
                    let ring = match fq.dest() {
                        Some(Channel::Portal(cpu)) if fq.state == FqState::Scheduled => Some(cpu),
                        _ => None,
                    };
                    account(cgrs, cgr, fd, true, &mut notes);
                    Outcome::Queued(ring)
                }
                FqState::Oos | FqState::Retiring | FqState::Retired => {
                    Outcome::Rejected(Arc::clone(&fq.handler))
                }
            }
        };
        notify(notes);
        match outcome {
            Outcome::Queued(Some(cpu)) => self.raise_irq(cpu),
            Outcome::Queued(None) => {}
            Outcome::Rejected(handler) => handler.ern(fqid, fd),
        }
        Ok(())
    }

    fn poll_dqrr(&self, cpu: usize, limit: usize, origin: DqrrOrigin) -> usize {
        let Some(portal) = self.portals.get(&cpu) else {
            return 0;
        };
        let guard = portal
            .poll_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let consumed = self.dispatch(cpu, limit, origin);
        drop(guard);
        if portal.irq_pending.swap(false, Ordering::AcqRel) {
            self.raise_irq(cpu);
        }
        consumed
    }

    fn irqsource_add(&self, cpu: usize, src: PortalIrq) {
        let PortalIrq::Dqri = src;
        let Some(portal) = self.portals.get(&cpu) else {
            return;
        };
        if !portal.irq_enabled.swap(true, Ordering::AcqRel) {
            self.raise_irq(cpu);
        }
    }

    fn irqsource_remove(&self, cpu: usize, src: PortalIrq) {
        let PortalIrq::Dqri = src;
        if let Some(portal) = self.portals.get(&cpu) {
            portal.irq_enabled.store(false, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Counting {
        seen: AtomicUsize,
        erns: AtomicUsize,
    }

    impl Counting {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                seen: AtomicUsize::new(0),
                erns: AtomicUsize::new(0),
            })
        }
    }

    impl FqHandler for Counting {
        fn dqrr(
            &self,
            _portal: &dyn Portal,
            _fqid: Fqid,
            _fd: &FrameDescriptor,
            _origin: DqrrOrigin,
        ) -> DqrrResult {
            self.seen.fetch_add(1, Ordering::SeqCst);
            DqrrResult::Consume
        }

        fn ern(&self, _fqid: Fqid, _fd: &FrameDescriptor) {
            self.erns.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn portal_fq(qm: &SoftQman, cpu: usize, handler: Arc<Counting>, schedule: bool) -> Fqid {
        let fqid = qm.create_fq(FqFlags::DYNAMIC_FQID, handler).unwrap();
        qm.init_fq(fqid, schedule, &InitFqOptions::new(Channel::Portal(cpu), 3))
            .unwrap();
        fqid
    }

    #[test]
    fn test_parked_queue_holds_frames_until_scheduled() {
        let qm = SoftQman::new(CpuSet::first_n(1));
        let h = Counting::new();
        let fqid = portal_fq(&qm, 0, h.clone(), false);
        qm.irqsource_remove(0, PortalIrq::Dqri);

        qm.enqueue(fqid, &FrameDescriptor::compound(0x10, 1)).unwrap();
        assert_eq!(qm.poll_dqrr(0, 16, DqrrOrigin::Process), 0);

        qm.schedule_fq(fqid).unwrap();
        assert_eq!(qm.poll_dqrr(0, 16, DqrrOrigin::Process), 1);
        assert_eq!(h.seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_irq_delivery_on_enqueue() {
        let qm = SoftQman::new(CpuSet::first_n(2));
        let h = Counting::new();
        let fqid = portal_fq(&qm, 1, h.clone(), true);
        qm.enqueue(fqid, &FrameDescriptor::compound(0x10, 1)).unwrap();
        assert_eq!(h.seen.load(Ordering::SeqCst), 1);
        assert!(!qm.portal_pending(1));
    }

    #[test]
    fn test_enqueue_to_retired_queue_is_rejected() {
        let qm = SoftQman::new(CpuSet::first_n(1));
        let h = Counting::new();
        let fqid = portal_fq(&qm, 0, h.clone(), true);
        assert_eq!(qm.retire_fq(fqid).unwrap(), RetireStatus::Retired);
        qm.enqueue(fqid, &FrameDescriptor::compound(0x10, 1)).unwrap();
        assert_eq!(h.erns.load(Ordering::SeqCst), 1);
        assert_eq!(h.seen.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_async_retire_completes_after_polls() {
        let qm = SoftQman::new(CpuSet::first_n(1));
        let fqid = portal_fq(&qm, 0, Counting::new(), false);
        qm.set_retire_pending(Some(2));
        assert_eq!(qm.retire_fq(fqid).unwrap(), RetireStatus::Pending);
        assert_eq!(qm.fq_state(fqid), Some(FqState::Retiring));
        assert_eq!(qm.fq_state(fqid), Some(FqState::Retiring));
        assert_eq!(qm.fq_state(fqid), Some(FqState::Retired));
    }

    #[test]
    fn test_cgr_must_be_deleted_on_owner_cpu() {
        struct Nop;
        impl CgrHandler for Nop {
            fn congestion(&self, _cgrid: CgrId, _congested: bool) {}
        }

        let qm = SoftQman::new(CpuSet::first_n(2));
        let id = qm.alloc_cgrid().unwrap();
        let opts = InitCgrOptions {
            cscn_en: true,
            mode: CgrMode::Frame,
            cs_thres: 4,
        };
        {
            let _pin = cpu::AffinityGuard::pin(1);
            qm.create_cgr(id, &opts, Arc::new(Nop)).unwrap();
        }
        assert!(qm.delete_cgr(id).is_err());
        let _pin = cpu::AffinityGuard::pin(1);
        qm.delete_cgr(id).unwrap();
    }
}
