// src/suballoc.rs
//! The suballocator (`spec.md` §4.1): a mutex-guarded, fixed-capacity
//! device-memory pool with a wait/notify free list. Grounded on
//! `gpu::resource_pool`'s buffer pool (three size-class free lists,
//! fine-grained locking) generalized to one capacity-bounded free list
//! with blocking allocation instead of LRU eviction — vDNN's planner
//! guarantees the request sequence fits, so there is nothing to evict,
//! only something to wait for.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::accel::{Accelerator, DeviceHandle};
use crate::error::{Error, Result};

/// One contiguous free byte range `[offset, offset + len)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct FreeRange {
    offset: u64,
    len: u64,
}

struct PoolState {
    capacity: u64,
    /// Sorted, coalesced free ranges.
    free: Vec<FreeRange>,
    outstanding_bytes: u64,
    next_generation: u32,
}

impl PoolState {
    fn first_fit(&self, size: u64) -> Option<usize> {
        self.free.iter().position(|r| r.len >= size)
    }

    fn insert_free(&mut self, offset: u64, len: u64) {
        let pos = self.free.partition_point(|r| r.offset < offset);
        self.free.insert(pos, FreeRange { offset, len });
        // Coalesce with the following neighbor, then the preceding one.
        if pos + 1 < self.free.len() {
            let cur = self.free[pos];
            let next = self.free[pos + 1];
            if cur.offset + cur.len == next.offset {
                self.free[pos].len += next.len;
                self.free.remove(pos + 1);
            }
        }
        if pos > 0 {
            let prev = self.free[pos - 1];
            let cur = self.free[pos];
            if prev.offset + prev.len == cur.offset {
                self.free[pos - 1].len += cur.len;
                self.free.remove(pos);
            }
        }
    }

    fn free_bytes(&self) -> u64 {
        self.capacity - self.outstanding_bytes
    }
}

/// Serves every per-step device allocation from one fixed pool sized by
/// the planner. `alloc`/`free` never call back into the `Accelerator`
/// after `new` reserves the pool (`spec.md` §4.1).
///
/// Owns an `Arc<dyn Accelerator>` rather than borrowing one so the whole
/// allocator can itself be wrapped in an `Arc` and shared with the
/// detached worker threads the executor spawns.
pub struct Suballocator {
    accel: Arc<dyn Accelerator>,
    state: Mutex<PoolState>,
    not_empty: Condvar,
}

impl Suballocator {
    /// `init(capacity_bytes)`: reserve a contiguous device pool and
    /// disable growth.
    pub fn new(accel: Arc<dyn Accelerator>, capacity_bytes: u64) -> Result<Self> {
        accel.reserve_pool(capacity_bytes)?;
        Ok(Self {
            accel,
            state: Mutex::new(PoolState {
                capacity: capacity_bytes,
                free: vec![FreeRange { offset: 0, len: capacity_bytes }],
                outstanding_bytes: 0,
                next_generation: 0,
            }),
            not_empty: Condvar::new(),
        })
    }

    /// `alloc(size) -> ptr`. Blocks on a concurrent `free`'s broadcast
    /// when the pool cannot currently satisfy `size`.
    pub fn alloc(&self, size: u64) -> Result<DeviceHandle> {
        if size == 0 {
            let mut state = self.state.lock();
            let generation = state.next_generation;
            state.next_generation = state.next_generation.wrapping_add(1);
            return Ok(DeviceHandle { offset: 0, bytes: 0, generation });
        }

        let mut state = self.state.lock();
        if size > state.capacity {
            return Err(Error::invariant(format!(
                "suballoc: requested {size} bytes exceeds pool capacity {}",
                state.capacity
            )));
        }

        loop {
            if let Some(idx) = state.first_fit(size) {
                let range = state.free[idx];
                if range.len == size {
                    state.free.remove(idx);
                } else {
                    state.free[idx] = FreeRange { offset: range.offset + size, len: range.len - size };
                }
                state.outstanding_bytes += size;
                let generation = state.next_generation;
                state.next_generation = state.next_generation.wrapping_add(1);
                return Ok(DeviceHandle { offset: range.offset, bytes: size, generation });
            }
            // OOM: wait for a concurrent free() to broadcast availability,
            // then retry. The planner is responsible for sizing the pool
            // so this always eventually succeeds.
            self.not_empty.wait(&mut state);
        }
    }

    /// `free(ptr)`: release the block and broadcast to all waiters.
    pub fn free(&self, handle: DeviceHandle) -> Result<()> {
        if handle.bytes == 0 {
            return Ok(());
        }
        let mut state = self.state.lock();
        state.insert_free(handle.offset, handle.bytes);
        state.outstanding_bytes = state.outstanding_bytes.saturating_sub(handle.bytes);
        self.not_empty.notify_all();
        Ok(())
    }

    /// Bytes currently free in the pool, used by algorithm-selection
    /// queries (`spec.md` §4.2) and the planner's allocator-confirmation
    /// phase.
    pub fn free_bytes(&self) -> u64 {
        self.state.lock().free_bytes()
    }

    pub fn capacity(&self) -> u64 {
        self.state.lock().capacity
    }

    /// `spec.md` P2: bytes outstanding beyond persistent parameter
    /// tensors. Callers pass the bytes they know are legitimately still
    /// resident (e.g. parameter tensors) to get the *transient* residue.
    pub fn outstanding_bytes(&self) -> u64 {
        self.state.lock().outstanding_bytes
    }

    pub fn copy_to_host(&self, handle: DeviceHandle, host: &mut [u8]) -> Result<()> {
        self.accel.copy_to_host(handle, host)
    }

    pub fn copy_from_host(&self, host: &[u8], handle: DeviceHandle) -> Result<()> {
        self.accel.copy_from_host(host, handle)
    }

    /// `shutdown()`: drain and release the pool.
    pub fn shutdown(&self) {
        self.accel.release_pool();
    }
}

/// A pinned host-memory shadow for one offloaded layer's activation,
/// allocated at init and freed at teardown (`spec.md` §3 Lifecycles).
/// Modeled as a plain heap buffer; on a real device this would be a
/// page-locked allocation registered with the accelerator for zero-copy
/// DMA, which is exactly the role `ResourceTier::PinnedRam` plays in the
/// teacher's `offload.rs`.
#[derive(Debug, Clone)]
pub struct PinnedHostShadow {
    pub buf: Arc<Mutex<Vec<u8>>>,
}

impl PinnedHostShadow {
    pub fn new(bytes: u64) -> Self {
        Self { buf: Arc::new(Mutex::new(vec![0u8; bytes as usize])) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accel::sim::SimAccelerator;

    fn sim_accel() -> Arc<dyn Accelerator> {
        Arc::new(SimAccelerator::new())
    }

    #[test]
    fn alloc_free_round_trip_frees_all_bytes() {
        let pool = Suballocator::new(sim_accel(), 1024).unwrap();
        let a = pool.alloc(256).unwrap();
        let b = pool.alloc(256).unwrap();
        assert_eq!(pool.free_bytes(), 512);
        pool.free(a).unwrap();
        pool.free(b).unwrap();
        assert_eq!(pool.free_bytes(), 1024);
        assert_eq!(pool.outstanding_bytes(), 0);
    }

    #[test]
    fn alloc_never_exceeds_capacity() {
        let pool = Suballocator::new(sim_accel(), 128).unwrap();
        assert!(pool.alloc(256).is_err());
    }

    #[test]
    fn alloc_blocks_until_a_concurrent_free_makes_room() {
        use std::thread;
        use std::time::Duration;

        let pool = Arc::new(Suballocator::new(sim_accel(), 64).unwrap());
        let held = pool.alloc(64).unwrap();

        let pool2 = Arc::clone(&pool);
        let waiter = thread::spawn(move || pool2.alloc(32).unwrap());

        thread::sleep(Duration::from_millis(20));
        pool.free(held).unwrap();

        let handle = waiter.join().unwrap();
        assert_eq!(handle.bytes, 32);
    }
}
