//! Error types for the queue-interface backend.

use std::io;

use qman::Fqid;
use thiserror::Error;

use crate::request::DrvReq;

/// Backend errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Allocation of a queue, congestion group or buffer failed.
    #[error("failed to allocate {what}: {source}")]
    ResourceExhausted {
        what: &'static str,
        #[source]
        source: io::Error,
    },
    /// Queue manager operation failed.
    #[error("queue manager error: {0}")]
    Io(#[from] io::Error),
    /// A buffer could not be mapped for DMA.
    #[error("DMA mapping failed")]
    DmaMapping,
    /// The accelerator reported an ICV check failure.
    #[error("ICV check failed (status {0:#010x})")]
    IntegrityCheckFailure(u32),
    /// The accelerator reported any other error.
    #[error("hardware error (status {0:#010x})")]
    Hardware(u32),
    /// The enqueue ring stayed full for the whole retry budget.
    #[error("enqueue ring busy after {attempts} attempts")]
    Busy { attempts: u32 },
    /// A bounded wait on a frame queue ran out.
    #[error("timed out waiting for frame queue {fqid} to {waiting_for}")]
    Timeout {
        fqid: Fqid,
        waiting_for: &'static str,
    },
    /// A completion frame did not have the expected shape.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    /// Shared descriptor does not fit the descriptor buffer.
    #[error("shared descriptor of {words} words exceeds the descriptor buffer")]
    InvalidDescriptor { words: usize },
    /// The queue manager exposes no CPU with a software portal.
    #[error("no CPU owns a queue manager portal")]
    NoAffinePortals,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Error from [`DrvCtx::submit()`](crate::DrvCtx::submit). Every variant
/// hands the request back; no completion callback will run for it.
#[derive(Debug)]
pub enum EnqueueError {
    /// The request could not be mapped for DMA.
    Io(Box<DrvReq>),
    /// The enqueue ring stayed full for the whole retry budget; carries the
    /// number of attempts made.
    Busy(Box<DrvReq>, u32),
    /// The queue manager refused the frame.
    Other(Box<DrvReq>, io::Error),
}

impl EnqueueError {
    pub fn into_inner(self) -> Box<DrvReq> {
        match self {
            EnqueueError::Io(req) | EnqueueError::Busy(req, _) | EnqueueError::Other(req, _) => req,
        }
    }

    pub fn request(&self) -> &DrvReq {
        match self {
            EnqueueError::Io(req) | EnqueueError::Busy(req, _) | EnqueueError::Other(req, _) => req,
        }
    }
}

impl std::fmt::Display for EnqueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnqueueError::Io(_) => write!(f, "request could not be mapped for DMA"),
            EnqueueError::Busy(_, n) => write!(f, "enqueue ring busy after {} attempts", n),
            EnqueueError::Other(_, e) => write!(f, "enqueue failed: {}", e),
        }
    }
}

impl std::error::Error for EnqueueError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EnqueueError::Other(_, e) => Some(e),
            _ => None,
        }
    }
}

impl From<EnqueueError> for Error {
    fn from(e: EnqueueError) -> Self {
        match e {
            EnqueueError::Io(_) => Error::DmaMapping,
            EnqueueError::Busy(_, attempts) => Error::Busy { attempts },
            EnqueueError::Other(_, e) => Error::Io(e),
        }
    }
}
