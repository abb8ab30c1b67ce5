//! Congestion monitor.
//!
//! All request and response queues of the backend share one congestion
//! group. The queue manager notifies the monitor on every state change; the
//! monitor only records it. Readers get an advisory, eventually consistent
//! view and are expected to back off while it reads congested.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use qman::{CgrHandler, CgrId, CgrMode, InitCgrOptions};

/// Shared congestion group threshold: `cpus * backlog_per_cpu` frames.
pub fn threshold(cpus: usize, backlog_per_cpu: u64) -> u64 {
    cpus as u64 * backlog_per_cpu
}

/// Congestion group options for the backend.
pub fn cgr_options(cpus: usize, backlog_per_cpu: u64) -> InitCgrOptions {
    InitCgrOptions {
        cscn_en: true,
        mode: CgrMode::Frame,
        cs_thres: threshold(cpus, backlog_per_cpu),
    }
}

/// Records congestion state changes of the shared group.
#[derive(Debug, Default)]
pub struct CongestionMonitor {
    congested: AtomicBool,
    times_congested: AtomicU64,
}

impl CongestionMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_congested(&self) -> bool {
        self.congested.load(Ordering::Relaxed)
    }

    /// Number of times the group entered congestion.
    pub fn times_congested(&self) -> u64 {
        self.times_congested.load(Ordering::Relaxed)
    }
}

impl CgrHandler for CongestionMonitor {
    fn congestion(&self, cgrid: CgrId, congested: bool) {
        self.congested.store(congested, Ordering::Relaxed);
        if congested {
            self.times_congested.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(%cgrid, "CAAM entered congestion");
        } else {
            tracing::debug!(%cgrid, "CAAM exited congestion");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold() {
        assert_eq!(threshold(16, 256), 4096);
        let opts = cgr_options(4, 256);
        assert_eq!(opts.cs_thres, 1024);
        assert_eq!(opts.mode, CgrMode::Frame);
        assert!(opts.cscn_en);
    }

    #[test]
    fn test_counts_entries_only() {
        let mon = CongestionMonitor::new();
        let id = CgrId(1);
        mon.congestion(id, true);
        assert!(mon.is_congested());
        mon.congestion(id, false);
        assert!(!mon.is_congested());
        mon.congestion(id, true);
        assert_eq!(mon.times_congested(), 2);
    }
}
