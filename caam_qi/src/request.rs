//! In-flight requests and their completion status.

use std::fmt;
use std::io;

use qman::{PhysAddr, SgEntry};

use crate::desc::is_icv_failure;
use crate::error::Error;

/// Completion callback. Receives the request back together with its status.
pub type Completion = Box<dyn FnOnce(Box<DrvReq>, ReqStatus) + Send>;

/// Outcome of a request, handed to its completion callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReqStatus {
    Success,
    /// ICV check failed during authenticated decryption.
    IntegrityCheckFailure(u32),
    /// Any other non-zero accelerator status.
    HardwareError(u32),
    /// The queue manager handed the frame back without the accelerator
    /// touching it (enqueue rejection or drain of a retired queue).
    Rejected,
}

impl ReqStatus {
    /// Decode the status word the accelerator wrote into the frame.
    pub fn from_raw(status: u32) -> Self {
        match status {
            0 => ReqStatus::Success,
            s if is_icv_failure(s) => ReqStatus::IntegrityCheckFailure(s),
            s => ReqStatus::HardwareError(s),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ReqStatus::Success)
    }

    /// Error equivalent of a failed status.
    pub fn as_error(&self) -> Option<Error> {
        match *self {
            ReqStatus::Success => None,
            ReqStatus::IntegrityCheckFailure(s) => Some(Error::IntegrityCheckFailure(s)),
            ReqStatus::HardwareError(s) => Some(Error::Hardware(s)),
            ReqStatus::Rejected => Some(Error::Io(io::Error::other(
                "request rejected by the queue manager",
            ))),
        }
    }
}

/// Request submitted to the accelerator.
///
/// The compound frame points at `fd_sgt`: entry 0 describes the output
/// buffer, entry 1 the input buffer. The request must stay boxed while in
/// flight; the address of `fd_sgt` identifies it when the frame comes back.
pub struct DrvReq {
    /// Output and input buffer entries.
    pub fd_sgt: [SgEntry; 2],
    /// Caller cookie, untouched by the backend.
    pub app_ctx: u64,
    cbk: Option<Completion>,
}

impl DrvReq {
    pub fn new<F>(output: SgEntry, input: SgEntry, cbk: F) -> Box<Self>
    where
        F: FnOnce(Box<DrvReq>, ReqStatus) + Send + 'static,
    {
        Box::new(Self {
            fd_sgt: [output, input],
            app_ctx: 0,
            cbk: Some(Box::new(cbk)),
        })
    }

    pub fn with_app_ctx(mut self: Box<Self>, app_ctx: u64) -> Box<Self> {
        self.app_ctx = app_ctx;
        self
    }

    /// Physical address of the scatter table.
    pub fn sgt_phys(&self) -> PhysAddr {
        self.fd_sgt.as_ptr() as PhysAddr
    }

    /// Size of the scatter table in bytes.
    pub const SGT_SIZE: usize = std::mem::size_of::<[SgEntry; 2]>();

    /// Congestion weight of the request: the input length.
    pub fn cong_weight(&self) -> u32 {
        self.fd_sgt[1].length
    }

    /// Whether the completion callback has not run yet.
    pub fn is_pending(&self) -> bool {
        self.cbk.is_some()
    }

    /// Run the completion callback. A request completes at most once;
    /// later calls only log.
    pub(crate) fn complete(mut self: Box<Self>, status: ReqStatus) {
        match self.cbk.take() {
            Some(cbk) => cbk(self, status),
            None => tracing::error!(
                sgt = format_args!("{:#x}", self.sgt_phys()),
                "request completed twice"
            ),
        }
    }
}

impl fmt::Debug for DrvReq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DrvReq")
            .field("fd_sgt", &self.fd_sgt)
            .field("app_ctx", &self.app_ctx)
            .field("pending", &self.cbk.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::desc::STATUS_ICV_FAILURE;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_status_decoding() {
        assert_eq!(ReqStatus::from_raw(0), ReqStatus::Success);
        assert_eq!(
            ReqStatus::from_raw(STATUS_ICV_FAILURE),
            ReqStatus::IntegrityCheckFailure(STATUS_ICV_FAILURE)
        );
        assert_eq!(
            ReqStatus::from_raw(0x4000_0001),
            ReqStatus::HardwareError(0x4000_0001)
        );
        assert!(ReqStatus::Success.as_error().is_none());
        assert!(matches!(
            ReqStatus::Rejected.as_error(),
            Some(Error::Io(_))
        ));
    }

    #[test]
    fn test_complete_runs_callback_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let req = DrvReq::new(SgEntry::new(0, 16), SgEntry::new(0, 32), move |req, st| {
            assert!(!req.is_pending());
            assert_eq!(st, ReqStatus::Success);
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(req.cong_weight(), 32);
        req.complete(ReqStatus::Success);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
