//! Configuration for the queue-interface backend.
//!
//! All limits and timing constants of the backend live here. The defaults
//! match the values the hardware driver has always used; tests shrink the
//! intervals to keep runs short.

use std::time::Duration;

/// Frames of backlog each portal CPU may have before the shared congestion
/// group enters congestion.
pub const DEFAULT_BACKLOG_PER_CPU: u64 = 256;

/// Enqueue attempts per submission before giving up with `Busy`.
pub const DEFAULT_ENQUEUE_RETRIES: u32 = 10_000;

/// Poll budget of a response poll context.
pub const DEFAULT_NAPI_WEIGHT: usize = 63;

/// Portal poll budget while draining a retired queue.
pub const DEFAULT_DRAIN_POLL_BUDGET: usize = 16;

/// Size of a scratch buffer from [`QiCache`](crate::QiCache).
pub const DEFAULT_CACHE_OBJ_SIZE: usize = 768;

/// Backend configuration.
#[derive(Debug, Clone)]
pub struct QiConfig {
    /// Congestion threshold contribution of every portal CPU, in frames.
    pub backlog_per_cpu: u64,
    /// Total enqueue attempts per submission.
    pub enqueue_retries: u32,
    /// Entries serviced per poll context run.
    pub napi_weight: usize,
    /// Entries serviced per portal poll while draining a retired queue.
    pub drain_poll_budget: usize,
    /// Sleep between frame queue state and frame count queries.
    pub fq_poll_interval: Duration,
    /// Extra wait after a replaced queue reports empty, covering frames the
    /// accelerator has dequeued but not yet completed.
    pub drain_grace: Duration,
    /// Maximum state/count queries before a wait fails with `Timeout`.
    pub max_fq_polls: u32,
    /// Maximum portal polls while draining a retired queue.
    pub max_drain_polls: u32,
    /// Work queue of request queues on the accelerator channel.
    pub req_dest_wq: u8,
    /// Work queue of response queues on the portal channels.
    pub rsp_dest_wq: u8,
    /// Scratch buffer size.
    pub cache_obj_size: usize,
    /// Scratch buffers allocated up front.
    pub cache_prealloc: usize,
    /// Upper bound of buffers kept on the free list.
    pub cache_max_free: usize,
    /// Spawn one dispatch worker per portal CPU. Without workers the caller
    /// drives completions through [`QiBackend::poll_cpu`](crate::QiBackend::poll_cpu).
    pub spawn_workers: bool,
}

impl Default for QiConfig {
    fn default() -> Self {
        Self {
            backlog_per_cpu: DEFAULT_BACKLOG_PER_CPU,
            enqueue_retries: DEFAULT_ENQUEUE_RETRIES,
            napi_weight: DEFAULT_NAPI_WEIGHT,
            drain_poll_budget: DEFAULT_DRAIN_POLL_BUDGET,
            fq_poll_interval: Duration::from_millis(20),
            drain_grace: Duration::from_millis(20),
            max_fq_polls: 500, // 10s at the default interval
            max_drain_polls: 1_000_000,
            req_dest_wq: 2,
            rsp_dest_wq: 3,
            cache_obj_size: DEFAULT_CACHE_OBJ_SIZE,
            cache_prealloc: 64,
            cache_max_free: 1024,
            spawn_workers: true,
        }
    }
}

impl QiConfig {
    /// Short intervals and no worker threads; completions are driven by the
    /// caller.
    pub fn polled() -> Self {
        Self {
            fq_poll_interval: Duration::from_millis(1),
            drain_grace: Duration::from_millis(1),
            spawn_workers: false,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = QiConfig::default();
        assert_eq!(cfg.backlog_per_cpu, 256);
        assert_eq!(cfg.enqueue_retries, 10_000);
        assert_eq!(cfg.napi_weight, 63);
        assert_eq!(cfg.drain_poll_budget, 16);
        assert_eq!(cfg.fq_poll_interval, Duration::from_millis(20));
        assert_eq!(cfg.drain_grace, Duration::from_millis(20));
        assert_eq!(cfg.cache_obj_size, 768);
    }

    #[test]
    fn test_polled_keeps_limits() {
        let cfg = QiConfig::polled();
        assert!(!cfg.spawn_workers);
        assert_eq!(cfg.enqueue_retries, DEFAULT_ENQUEUE_RETRIES);
    }
}
