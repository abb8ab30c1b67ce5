//! Frame queue lifecycle.
//!
//! Request queues feed the accelerator and belong to one driver context.
//! Response queues are per CPU and live as long as the backend. Both are
//! torn down the same way:
//!
//! ```text
//! Scheduled/Parked --retire--> Retiring --> Retired --drain--> empty
//!     --oos--> OutOfService --destroy--> gone
//! ```
//!
//! Retirement may complete asynchronously; the state is then polled at a
//! fixed interval. Frames left in a retired queue are pulled through a
//! volatile dequeue on the owning CPU's portal and completed as rejected.

use std::sync::Arc;
use std::thread;

use qman::{
    Channel, CgrId, DmaAddr, DqrrOrigin, FqCtrl, FqFlags, FqHandler, FqState, FqStateFlags,
    Fqid, InitFqOptions, InitFqWe, QueueManager, RetireStatus, Stashing,
};

use crate::config::QiConfig;
use crate::error::{Error, Result};

/// Coarse lifecycle view of a frame queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FqLifecycle {
    /// Initialised but not eligible for dequeue.
    Parked,
    Scheduled,
    Retiring,
    /// Retired and still holding frames.
    Retired,
    /// Retired and empty.
    Drained,
    OutOfService,
}

/// Frame queue operations of the backend.
pub struct FqManager<'a> {
    qman: &'a dyn QueueManager,
    cfg: &'a QiConfig,
}

impl<'a> FqManager<'a> {
    pub fn new(qman: &'a dyn QueueManager, cfg: &'a QiConfig) -> Self {
        Self { qman, cfg }
    }

    /// Lifecycle view of `fqid`; `None` once destroyed.
    pub fn lifecycle(&self, fqid: Fqid) -> Option<FqLifecycle> {
        let state = self.qman.fq_state(fqid)?;
        Some(match state {
            FqState::Oos => FqLifecycle::OutOfService,
            FqState::Parked => FqLifecycle::Parked,
            FqState::Scheduled => FqLifecycle::Scheduled,
            FqState::Retiring => FqLifecycle::Retiring,
            FqState::Retired if self.qman.fq_flags(fqid).contains(FqStateFlags::NE) => {
                FqLifecycle::Retired
            }
            FqState::Retired => FqLifecycle::Drained,
        })
    }

    /// Create a request queue towards the accelerator.
    ///
    /// Frames run the descriptor at `context_a` and complete on `rsp_fq`.
    /// The queue is scheduled right away or left parked.
    pub fn create_req_fq(
        &self,
        handler: Arc<dyn FqHandler>,
        rsp_fq: Fqid,
        context_a: DmaAddr,
        cgrid: CgrId,
        schedule: bool,
    ) -> Result<Fqid> {
        let fqid = self
            .qman
            .create_fq(FqFlags::DYNAMIC_FQID | FqFlags::TO_DCPORTAL, handler)
            .map_err(|source| {
                tracing::error!(error = %source, "failed to create session req FQ");
                Error::ResourceExhausted {
                    what: "request frame queue",
                    source,
                }
            })?;

        let opts = InitFqOptions {
            we_mask: InitFqWe::FQCTRL
                | InitFqWe::DESTWQ
                | InitFqWe::CONTEXTB
                | InitFqWe::CONTEXTA
                | InitFqWe::CGID,
            fq_ctrl: FqCtrl::CPCSTASH | FqCtrl::CGE,
            context_a,
            context_b: rsp_fq.0,
            cgid: Some(cgrid),
            ..InitFqOptions::new(Channel::Caam, self.cfg.req_dest_wq)
        };
        if let Err(e) = self.qman.init_fq(fqid, schedule, &opts) {
            tracing::error!(%fqid, error = %e, "failed to init session req FQ");
            self.qman.destroy_fq(fqid);
            return Err(e.into());
        }

        tracing::debug!(%fqid, %rsp_fq, schedule, "allocated request FQ");
        Ok(fqid)
    }

    /// Create the response queue of `cpu`, dequeued by that CPU's portal.
    pub fn alloc_rsp_fq(
        &self,
        cpu: usize,
        handler: Arc<dyn FqHandler>,
        cgrid: CgrId,
    ) -> Result<Fqid> {
        let fqid = self
            .qman
            .create_fq(FqFlags::NO_ENQUEUE | FqFlags::DYNAMIC_FQID, handler)
            .map_err(|source| {
                tracing::error!(cpu, error = %source, "rsp FQ create failed");
                Error::ResourceExhausted {
                    what: "response frame queue",
                    source,
                }
            })?;

        let opts = InitFqOptions {
            we_mask: InitFqWe::FQCTRL
                | InitFqWe::DESTWQ
                | InitFqWe::CONTEXTB
                | InitFqWe::CONTEXTA
                | InitFqWe::CGID,
            fq_ctrl: FqCtrl::CTXASTASHING | FqCtrl::CPCSTASH | FqCtrl::CGE,
            stashing: Some(Stashing {
                exclusive_ctx: true,
                exclusive_data: true,
                data_cl: 1,
                context_cl: 1,
            }),
            cgid: Some(cgrid),
            ..InitFqOptions::new(self.qman.affine_channel(cpu), self.cfg.rsp_dest_wq)
        };
        if let Err(e) = self.qman.init_fq(fqid, true, &opts) {
            tracing::error!(cpu, %fqid, error = %e, "rsp FQ init failed");
            self.qman.destroy_fq(fqid);
            return Err(e.into());
        }

        tracing::debug!(cpu, %fqid, "allocated response FQ");
        Ok(fqid)
    }

    /// Retire, drain and destroy `fqid`. Leftover frames are drained through
    /// the portal of `cpu`.
    ///
    /// A failed retirement or drain leaves the queue alive. Once drained the
    /// queue is destroyed even if it cannot be taken out of service; that
    /// failure is still reported.
    pub fn kill_fq(&self, fqid: Fqid, cpu: usize) -> Result<()> {
        let status = self.qman.retire_fq(fqid).map_err(|e| {
            tracing::error!(%fqid, error = %e, "retire FQ failed");
            Error::Io(e)
        })?;

        if status == RetireStatus::Pending {
            self.wait_retired(fqid)?;
            let flags = self.qman.fq_flags(fqid);
            if flags.contains(FqStateFlags::BLOCKOOS) {
                tracing::warn!(%fqid, "retired FQ still blocks OOS");
            }
            if flags.contains(FqStateFlags::ORL) {
                tracing::warn!(%fqid, "retired FQ still has an ORL");
            }
        }

        if self.qman.fq_flags(fqid).contains(FqStateFlags::NE) {
            self.empty_retired_fq(fqid, cpu).inspect_err(|e| {
                tracing::error!(%fqid, error = %e, "empty_retired_fq failed");
            })?;
        }

        let oos = self.qman.oos_fq(fqid);
        if let Err(e) = &oos {
            tracing::error!(%fqid, error = %e, "OOS of FQ failed");
        }
        self.qman.destroy_fq(fqid);
        oos.map_err(Error::from)
    }

    fn wait_retired(&self, fqid: Fqid) -> Result<()> {
        for _ in 0..self.cfg.max_fq_polls {
            thread::sleep(self.cfg.fq_poll_interval);
            if self.qman.fq_state(fqid) == Some(FqState::Retired) {
                return Ok(());
            }
        }
        tracing::error!(%fqid, "FQ retirement did not complete");
        Err(Error::Timeout {
            fqid,
            waiting_for: "retire",
        })
    }

    /// Pull every frame left in a retired queue through the portal of `cpu`.
    pub fn empty_retired_fq(&self, fqid: Fqid, cpu: usize) -> Result<()> {
        self.qman.volatile_dequeue(fqid, cpu).map_err(|e| {
            tracing::error!(%fqid, error = %e, "volatile dequeue failed");
            Error::Io(e)
        })?;

        for _ in 0..self.cfg.max_drain_polls {
            if !self.qman.fq_flags(fqid).contains(FqStateFlags::NE) {
                return Ok(());
            }
            self.qman
                .poll_dqrr(cpu, self.cfg.drain_poll_budget, DqrrOrigin::Poll);
            thread::yield_now();
        }
        if !self.qman.fq_flags(fqid).contains(FqStateFlags::NE) {
            return Ok(());
        }
        Err(Error::Timeout {
            fqid,
            waiting_for: "drain",
        })
    }

    /// Wait until the accelerator has taken every frame of `fqid`, then
    /// give frames already dequeued by the accelerator time to complete.
    pub fn empty_caam_fq(&self, fqid: Fqid) -> Result<()> {
        let mut polls = 0;
        loop {
            let np = self.qman.query_fq_np(fqid)?;
            if np.frm_cnt == 0 {
                break;
            }
            polls += 1;
            if polls >= self.cfg.max_fq_polls {
                return Err(Error::Timeout {
                    fqid,
                    waiting_for: "empty",
                });
            }
            thread::sleep(self.cfg.fq_poll_interval);
        }
        thread::sleep(self.cfg.drain_grace);
        Ok(())
    }
}
