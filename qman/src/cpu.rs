//! Affine CPU sets and logical CPU pinning.
//!
//! Queue manager resources are tied to the CPU whose portal allocated them.
//! Threads carry a logical CPU id in a thread-local; [`AffinityGuard`] sets it
//! for a scope and, on Linux, also narrows the OS affinity mask so the work
//! really runs there. The OS part is best effort: logical ids that do not
//! exist on the host only change the logical id.

use std::cell::Cell;

/// Sorted set of CPU ids.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CpuSet {
    cpus: Vec<usize>,
}

impl CpuSet {
    /// Build a set from arbitrary ids; duplicates are dropped.
    pub fn new(cpus: impl IntoIterator<Item = usize>) -> Self {
        let mut cpus: Vec<usize> = cpus.into_iter().collect();
        cpus.sort_unstable();
        cpus.dedup();
        Self { cpus }
    }

    /// CPUs `0..n`.
    pub fn first_n(n: usize) -> Self {
        Self {
            cpus: (0..n).collect(),
        }
    }

    pub fn contains(&self, cpu: usize) -> bool {
        self.cpus.binary_search(&cpu).is_ok()
    }

    pub fn first(&self) -> Option<usize> {
        self.cpus.first().copied()
    }

    /// Smallest member strictly greater than `cpu`.
    pub fn next_after(&self, cpu: usize) -> Option<usize> {
        let idx = self.cpus.partition_point(|&c| c <= cpu);
        self.cpus.get(idx).copied()
    }

    /// Number of CPUs in the set.
    pub fn weight(&self) -> usize {
        self.cpus.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cpus.is_empty()
    }

    /// Largest member, if any.
    pub fn last(&self) -> Option<usize> {
        self.cpus.last().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.cpus.iter().copied()
    }
}

thread_local! {
    static CURRENT_CPU: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Logical CPU of the calling thread, if it has been pinned.
pub fn current() -> Option<usize> {
    CURRENT_CPU.with(Cell::get)
}

/// Pin the calling thread to a logical CPU for the lifetime of the guard.
///
/// Dropping the guard restores both the previous logical CPU and the
/// previous OS affinity mask.
pub struct AffinityGuard {
    prev: Option<usize>,
    #[cfg(target_os = "linux")]
    saved_mask: Option<libc::cpu_set_t>,
}

impl AffinityGuard {
    pub fn pin(cpu: usize) -> Self {
        let prev = CURRENT_CPU.with(|c| c.replace(Some(cpu)));
        Self {
            prev,
            #[cfg(target_os = "linux")]
            saved_mask: os::pin(cpu),
        }
    }
}

impl Drop for AffinityGuard {
    fn drop(&mut self) {
        #[cfg(target_os = "linux")]
        if let Some(mask) = self.saved_mask.take() {
            os::restore(&mask);
        }
        CURRENT_CPU.with(|c| c.set(self.prev));
    }
}

#[cfg(target_os = "linux")]
mod os {
    use std::io;

    const SET_SIZE: usize = std::mem::size_of::<libc::cpu_set_t>();

    /// Narrow the OS mask to `cpu`; returns the previous mask on success.
    pub(super) fn pin(cpu: usize) -> Option<libc::cpu_set_t> {
        if cpu >= SET_SIZE * 8 {
            return None;
        }
        unsafe {
            let mut old: libc::cpu_set_t = std::mem::zeroed();
            if libc::sched_getaffinity(0, SET_SIZE, &mut old) != 0 {
                tracing::debug!(cpu, err = %io::Error::last_os_error(), "sched_getaffinity failed");
                return None;
            }
            if !libc::CPU_ISSET(cpu, &old) {
                // Not a CPU this thread may run on; keep the logical pin only.
                return None;
            }
            let mut set: libc::cpu_set_t = std::mem::zeroed();
            libc::CPU_ZERO(&mut set);
            libc::CPU_SET(cpu, &mut set);
            if libc::sched_setaffinity(0, SET_SIZE, &set) != 0 {
                tracing::debug!(cpu, err = %io::Error::last_os_error(), "sched_setaffinity failed");
                return None;
            }
            Some(old)
        }
    }

    pub(super) fn restore(mask: &libc::cpu_set_t) {
        let ret = unsafe { libc::sched_setaffinity(0, SET_SIZE, mask) };
        if ret != 0 {
            tracing::debug!(err = %io::Error::last_os_error(), "restoring CPU mask failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpuset_next_wraps_to_none() {
        let set = CpuSet::new([6, 2, 4, 2]);
        assert_eq!(set.weight(), 3);
        assert_eq!(set.first(), Some(2));
        assert_eq!(set.next_after(0), Some(2));
        assert_eq!(set.next_after(2), Some(4));
        assert_eq!(set.next_after(5), Some(6));
        assert_eq!(set.next_after(6), None);
        assert!(set.contains(4));
        assert!(!set.contains(3));
    }

    #[test]
    fn test_guard_restores_logical_cpu() {
        assert_eq!(current(), None);
        {
            let _outer = AffinityGuard::pin(3);
            assert_eq!(current(), Some(3));
            {
                let _inner = AffinityGuard::pin(5);
                assert_eq!(current(), Some(5));
            }
            assert_eq!(current(), Some(3));
        }
        assert_eq!(current(), None);
    }
}
