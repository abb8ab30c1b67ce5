//! Per-CPU response affinity.
//!
//! Every CPU that owns a portal gets a response queue and a poll context at
//! init. The table is filled once before the backend is shared and only read
//! afterwards. Contexts requested for a CPU without a portal are spread over
//! the portal CPUs round-robin.

use std::sync::{Arc, Mutex, PoisonError};

use qman::{CpuSet, Fqid};

use crate::napi::Napi;

/// Per-CPU backend state.
#[derive(Debug)]
pub struct PcpuPriv {
    /// Response queue dequeued by this CPU's portal.
    pub rsp_fq: Fqid,
    pub napi: Arc<Napi>,
}

/// Arena of [`PcpuPriv`] indexed by CPU id.
#[derive(Debug)]
pub struct PcpuTable {
    cpus: CpuSet,
    slots: Vec<Option<PcpuPriv>>,
    /// Last CPU handed out by round-robin reassignment.
    last_cpu: Mutex<usize>,
}

impl PcpuTable {
    pub fn new(cpus: CpuSet) -> Self {
        let len = cpus.last().map_or(0, |c| c + 1);
        Self {
            cpus,
            slots: (0..len).map(|_| None).collect(),
            last_cpu: Mutex::new(0),
        }
    }

    pub(crate) fn insert(&mut self, cpu: usize, priv_: PcpuPriv) {
        if cpu >= self.slots.len() {
            self.slots.resize_with(cpu + 1, || None);
        }
        self.slots[cpu] = Some(priv_);
    }

    pub fn get(&self, cpu: usize) -> Option<&PcpuPriv> {
        self.slots.get(cpu).and_then(Option::as_ref)
    }

    pub fn rsp_fq(&self, cpu: usize) -> Option<Fqid> {
        self.get(cpu).map(|p| p.rsp_fq)
    }

    pub fn napi(&self, cpu: usize) -> Option<&Arc<Napi>> {
        self.get(cpu).map(|p| &p.napi)
    }

    /// Populated entries in CPU order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &PcpuPriv)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(cpu, p)| p.as_ref().map(|p| (cpu, p)))
    }

    pub fn cpus(&self) -> &CpuSet {
        &self.cpus
    }

    /// CPU a context requested on `requested` is bound to, and whether it
    /// was reassigned. `None` when no CPU owns a portal.
    pub fn select_cpu(&self, requested: usize) -> Option<(usize, bool)> {
        if self.cpus.contains(requested) && self.get(requested).is_some() {
            return Some((requested, false));
        }
        let mut last = self.last_cpu.lock().unwrap_or_else(PoisonError::into_inner);
        let next = self
            .cpus
            .next_after(*last)
            .or_else(|| self.cpus.first())?;
        *last = next;
        Some((next, true))
    }

    /// Current round-robin cursor.
    pub fn last_cpu(&self) -> usize {
        *self.last_cpu.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
