//! DMA mapping capability and a software model of it.
//!
//! [`SoftDma`] runs in one of two modes:
//! - identity: device address == physical address
//! - IOMMU: device addresses are IOVAs handed out from a counter and
//!   translated back through [`IommuDomain::iova_to_phys`]

use std::collections::HashMap;
use std::io;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::types::{DmaAddr, PhysAddr};

/// Direction of a DMA transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaDirection {
    ToDevice,
    FromDevice,
    Bidirectional,
}

/// IOVA to physical address translation.
pub trait IommuDomain: Send + Sync {
    fn iova_to_phys(&self, iova: DmaAddr) -> Option<PhysAddr>;
}

/// Streaming DMA mapping of single buffers.
pub trait DmaMapper: Send + Sync {
    fn map_single(&self, phys: PhysAddr, len: usize, dir: DmaDirection) -> io::Result<DmaAddr>;
    fn unmap_single(&self, addr: DmaAddr, len: usize, dir: DmaDirection);
    /// Make CPU writes to a mapped buffer visible to the device.
    fn sync_single_for_device(&self, addr: DmaAddr, len: usize, dir: DmaDirection);
    /// IOMMU domain the device sits behind, if any.
    fn domain(&self) -> Option<&dyn IommuDomain>;
}

/// First IOVA handed out in IOMMU mode. Kept far from typical heap
/// addresses so identity lookups cannot accidentally succeed.
const IOVA_BASE: u64 = 0xf000_0000_0000;
const IOVA_ALIGN: u64 = 64;

#[derive(Debug)]
struct Mapping {
    phys: PhysAddr,
    len: usize,
}

/// Software DMA layer.
#[derive(Debug)]
pub struct SoftDma {
    iommu: bool,
    next_iova: AtomicU64,
    mappings: Mutex<HashMap<DmaAddr, Mapping>>,
    fail_maps: AtomicUsize,
    syncs: AtomicUsize,
}

impl SoftDma {
    /// Identity-mapped DMA, no IOMMU.
    pub fn new() -> Self {
        Self::build(false)
    }

    /// DMA behind an IOMMU domain.
    pub fn with_iommu() -> Self {
        Self::build(true)
    }

    fn build(iommu: bool) -> Self {
        Self {
            iommu,
            next_iova: AtomicU64::new(IOVA_BASE),
            mappings: Mutex::new(HashMap::new()),
            fail_maps: AtomicUsize::new(0),
            syncs: AtomicUsize::new(0),
        }
    }

    /// Make the next `n` calls to `map_single` fail.
    pub fn fail_next_maps(&self, n: usize) {
        self.fail_maps.store(n, Ordering::SeqCst);
    }

    /// Number of currently mapped buffers.
    pub fn live_mappings(&self) -> usize {
        self.lock().len()
    }

    /// Number of `sync_single_for_device` calls so far.
    pub fn sync_count(&self) -> usize {
        self.syncs.load(Ordering::SeqCst)
    }

    pub fn is_mapped(&self, addr: DmaAddr) -> bool {
        self.lock().contains_key(&addr)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<DmaAddr, Mapping>> {
        self.mappings.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn take_fault(&self) -> bool {
        self.fail_maps
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Default for SoftDma {
    fn default() -> Self {
        Self::new()
    }
}

impl IommuDomain for SoftDma {
    fn iova_to_phys(&self, iova: DmaAddr) -> Option<PhysAddr> {
        self.lock().get(&iova).map(|m| m.phys)
    }
}

impl DmaMapper for SoftDma {
    fn map_single(&self, phys: PhysAddr, len: usize, _dir: DmaDirection) -> io::Result<DmaAddr> {
        if self.take_fault() {
            return Err(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "injected mapping failure",
            ));
        }
        let addr = if self.iommu {
            let span = (len as u64).max(1).div_ceil(IOVA_ALIGN) * IOVA_ALIGN;
            self.next_iova.fetch_add(span, Ordering::Relaxed)
        } else {
            phys
        };
        let mut mappings = self.lock();
        if mappings.contains_key(&addr) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("address {addr:#x} already mapped"),
            ));
        }
        mappings.insert(addr, Mapping { phys, len });
        Ok(addr)
    }

    fn unmap_single(&self, addr: DmaAddr, len: usize, _dir: DmaDirection) {
        match self.lock().remove(&addr) {
            Some(m) if m.len != len => {
                tracing::warn!(addr, mapped = m.len, unmapped = len, "unmap length mismatch");
            }
            Some(_) => {}
            None => tracing::warn!(addr, "unmap of unmapped address"),
        }
    }

    fn sync_single_for_device(&self, addr: DmaAddr, _len: usize, _dir: DmaDirection) {
        if !self.is_mapped(addr) {
            tracing::warn!(addr, "sync of unmapped address");
        }
        self.syncs.fetch_add(1, Ordering::SeqCst);
    }

    fn domain(&self) -> Option<&dyn IommuDomain> {
        if self.iommu { Some(self) } else { None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_mapping() {
        let dma = SoftDma::new();
        assert!(dma.domain().is_none());
        let addr = dma.map_single(0x1000, 32, DmaDirection::Bidirectional).unwrap();
        assert_eq!(addr, 0x1000);
        assert_eq!(dma.live_mappings(), 1);
        dma.unmap_single(addr, 32, DmaDirection::Bidirectional);
        assert_eq!(dma.live_mappings(), 0);
    }

    #[test]
    fn test_iommu_translates_back() {
        let dma = SoftDma::with_iommu();
        let a = dma.map_single(0x1000, 32, DmaDirection::ToDevice).unwrap();
        let b = dma.map_single(0x2000, 100, DmaDirection::ToDevice).unwrap();
        assert_ne!(a, 0x1000);
        assert_ne!(a, b);
        let domain = dma.domain().unwrap();
        assert_eq!(domain.iova_to_phys(a), Some(0x1000));
        assert_eq!(domain.iova_to_phys(b), Some(0x2000));
        assert_eq!(domain.iova_to_phys(0x1000), None);
    }

    #[test]
    fn test_injected_failures_are_consumed() {
        let dma = SoftDma::new();
        dma.fail_next_maps(1);
        assert!(dma.map_single(0x1000, 8, DmaDirection::ToDevice).is_err());
        assert!(dma.map_single(0x1000, 8, DmaDirection::ToDevice).is_ok());
    }
}
