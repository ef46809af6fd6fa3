// Copyright (c) 2026 The pvdisplay developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The two pools device memory is suballocated from.
//!
//! # DEVRAM and VRAM
//!
//! DEVRAM is the part of the RAM bar past the primary surface. Command payloads live there.
//! VRAM is the whole VRAM bar and holds bitmaps, clip rectangles and cursor shapes.
//!
//! When VRAM is exhausted, an allocation falls back to DEVRAM. The block then counts as a DEVRAM
//! block for the rest of its life, which is what the device expects since it only checks that
//! pointers fall in a registered slot. Large bitmaps can therefore crowd out command payloads
//! under heavy load.
//!
//! # Blocking
//!
//! The pools themselves never block. Waiting for the device to release memory is the device's
//! business, see `Device::alloc_mem`.

pub use self::suballocator::SuballocatorError;
pub(crate) use self::suballocator::BLOCK_ALIGNMENT;
use self::suballocator::FreeListAllocator;
use super::{DeviceSize, LocalAddress};
use std::ops::Range;
use tracing::trace;

mod suballocator;

/// Identifies one of the two pools.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PoolKind {
    DevRam,
    Vram,
}

/// Both pools, guarded together by the device's allocator mutex.
#[derive(Debug)]
pub(crate) struct MemoryPools {
    devram: FreeListAllocator,
    vram: FreeListAllocator,
}

impl MemoryPools {
    /// # Panics
    ///
    /// - Panics if the two ranges overlap.
    pub fn new(devram: Range<LocalAddress>, vram: Range<LocalAddress>) -> Self {
        assert!(devram.end <= vram.start || vram.end <= devram.start);

        MemoryPools {
            devram: FreeListAllocator::new(devram.start, devram.end - devram.start),
            vram: FreeListAllocator::new(vram.start, vram.end - vram.start),
        }
    }

    fn pool(&self, kind: PoolKind) -> &FreeListAllocator {
        match kind {
            PoolKind::DevRam => &self.devram,
            PoolKind::Vram => &self.vram,
        }
    }

    fn pool_mut(&mut self, kind: PoolKind) -> &mut FreeListAllocator {
        match kind {
            PoolKind::DevRam => &mut self.devram,
            PoolKind::Vram => &mut self.vram,
        }
    }

    /// Allocates `size` bytes from `kind`, falling back to DEVRAM for VRAM requests.
    ///
    /// Returns the address together with the pool that actually satisfied the request.
    pub fn allocate(
        &mut self,
        kind: PoolKind,
        size: DeviceSize,
    ) -> Option<(LocalAddress, PoolKind)> {
        match self.pool_mut(kind).allocate(size) {
            Ok(addr) => return Some((addr, kind)),
            Err(err) => trace!(?kind, size, %err, "pool allocation failed"),
        }

        if kind == PoolKind::Vram {
            match self.devram.allocate(size) {
                Ok(addr) => return Some((addr, PoolKind::DevRam)),
                Err(err) => trace!(size, %err, "DEVRAM fallback failed"),
            }
        }

        None
    }

    /// Returns the block at `addr` to the pool it lies in. Returns `false` if `addr` is not the
    /// start of a block of either pool.
    pub fn free(&mut self, addr: LocalAddress) -> bool {
        match self.classify(addr) {
            Some(kind) => self.pool_mut(kind).free(addr),
            None => false,
        }
    }

    /// Returns the pool whose bounds contain `addr`.
    pub fn classify(&self, addr: LocalAddress) -> Option<PoolKind> {
        [PoolKind::DevRam, PoolKind::Vram]
            .into_iter()
            .find(|&kind| self.bounds(kind).contains(&addr))
    }

    pub fn bounds(&self, kind: PoolKind) -> Range<LocalAddress> {
        let pool = self.pool(kind);

        pool.start()..pool.start() + pool.size()
    }

    pub fn free_size(&self, kind: PoolKind) -> DeviceSize {
        self.pool(kind).free_size()
    }
}
