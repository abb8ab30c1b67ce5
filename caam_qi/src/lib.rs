//! # caam_qi - crypto accelerator queue interface
//!
//! Bridges a crypto accelerator to a hardware frame queue manager. Callers
//! submit requests against a driver context bound to one shared descriptor;
//! completions come back asynchronously on the CPU the context is bound to.
//!
//! ## Architecture
//!
//! ```text
//!   DrvCtx::submit ──► request FQ (per context) ──► accelerator
//!                                                       │
//!                          response FQ (per CPU) ◄──────┘
//!                                 │
//!   portal DQRI ──► RspFqHandler ──► Napi::poll (budget) ──► callback
//! ```
//!
//! - **Request queues** carry the descriptor address in context-A and the
//!   response queue id in context-B. [`DrvCtx::update`] swaps a context's
//!   queue to change the descriptor while requests are in flight.
//! - **Response queues** are created once per portal CPU at init. The
//!   interrupt path only schedules the CPU's poll context; completions run
//!   from the budgeted poll.
//! - **Congestion**: every queue counts towards one congestion group whose
//!   state is exposed through [`QiBackend::is_congested`].
//!
//! ## Module Overview
//!
//! - [`backend`]: init/shutdown and the shared backend handle
//! - [`context`]: driver contexts, submission and descriptor update
//! - [`fq`]: frame queue creation, retirement and draining
//! - [`dispatch`]: completion handlers and the in-flight table
//! - [`napi`]: poll contexts and dispatch workers
//! - [`affinity`]: per-CPU response queues and CPU reassignment
//! - [`congestion`]: congestion group monitor
//! - [`desc`]: shared descriptors, descriptor buffer, status words
//! - [`request`]: requests and completion status
//! - [`cache`]: scratch buffer pool
//! - [`config`], [`error`]

pub mod affinity;
pub mod backend;
pub mod cache;
pub mod config;
pub mod congestion;
pub mod context;
pub mod desc;
pub mod dispatch;
pub mod error;
pub mod fq;
pub mod napi;
pub mod request;

pub use backend::QiBackend;
pub use cache::QiCache;
pub use config::QiConfig;
pub use context::DrvCtx;
pub use desc::{HwDesc, MAX_SDLEN, SharedDesc};
pub use error::{EnqueueError, Error, Result};
pub use request::{Completion, DrvReq, ReqStatus};
