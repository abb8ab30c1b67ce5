//! Scratch buffer pool.
//!
//! Callers building requests need small per-request buffers (link tables,
//! IVs, extended descriptors) on the submission path. [`QiCache`] hands out
//! fixed-size buffers from a free list so the hot path rarely allocates.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Fixed-size buffer pool.
#[derive(Debug)]
pub struct QiCache {
    obj_size: usize,
    max_free: usize,
    free: Mutex<Vec<Box<[u8]>>>,
    outstanding: AtomicUsize,
}

impl QiCache {
    /// Pool of `obj_size`-byte buffers with `prealloc` buffers ready and at
    /// most `max_free` kept around after they are returned.
    pub fn new(obj_size: usize, prealloc: usize, max_free: usize) -> Self {
        let free = (0..prealloc.min(max_free))
            .map(|_| vec![0u8; obj_size].into_boxed_slice())
            .collect();
        Self {
            obj_size,
            max_free,
            free: Mutex::new(free),
            outstanding: AtomicUsize::new(0),
        }
    }

    pub fn obj_size(&self) -> usize {
        self.obj_size
    }

    /// Take a buffer. Contents are unspecified.
    pub fn alloc(&self) -> Box<[u8]> {
        let recycled = self
            .free
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop();
        self.outstanding.fetch_add(1, Ordering::Relaxed);
        recycled.unwrap_or_else(|| vec![0u8; self.obj_size].into_boxed_slice())
    }

    /// Return a buffer taken with [`alloc`](Self::alloc).
    pub fn free(&self, obj: Box<[u8]>) {
        if obj.len() != self.obj_size {
            tracing::warn!(
                len = obj.len(),
                obj_size = self.obj_size,
                "foreign buffer returned to QI cache"
            );
            return;
        }
        self.outstanding.fetch_sub(1, Ordering::Relaxed);
        let mut free = self.free.lock().unwrap_or_else(|e| e.into_inner());
        if free.len() < self.max_free {
            free.push(obj);
        }
    }

    /// Buffers handed out and not yet returned.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Relaxed)
    }

    /// Buffers ready on the free list.
    pub fn available(&self) -> usize {
        self.free.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}
