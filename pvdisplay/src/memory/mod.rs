// Copyright (c) 2026 The pvdisplay developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Device memory.
//!
//! The adapter exposes two memory bars: RAM, whose head holds the primary surface and whose tail
//! is the DEVRAM pool, and VRAM. Both are mapped into the driver's address space. This module
//! keeps the contents of the two bars in [`DeviceMemory`] and addresses them by their *local*
//! address, that is the address the driver sees. The device sees the same bytes through
//! [device addresses](slot::DeviceAddress).
//!
//! # Pools
//!
//! Everything the driver hands to the device is suballocated from one of two pools, see the
//! [`allocator`] module. Payloads that the device reads once go to DEVRAM, bulk data such as
//! bitmaps goes to VRAM.

use bytemuck::{NoUninit, Pod};
use parking_lot::RwLock;
use std::ops::Range;

pub mod allocator;
pub mod slot;

/// A local address, as seen by the driver.
pub type LocalAddress = u64;

/// A size or offset in device memory.
pub type DeviceSize = u64;

/// Granularity in which the ROM expresses the size of DEVRAM.
pub const PAGE_SIZE: DeviceSize = 4096;

/// Describes where a memory bar lives.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RegionInfo {
    /// The address at which the device sees the start of the bar.
    pub phys_start: u64,

    /// The address at which the driver sees the start of the bar. Must not be zero.
    pub local_start: LocalAddress,

    /// The size of the bar in bytes.
    pub size: DeviceSize,
}

impl RegionInfo {
    #[inline]
    pub fn range(&self) -> Range<LocalAddress> {
        self.local_start..self.local_start + self.size
    }
}

#[derive(Debug)]
struct MappedRegion {
    start: LocalAddress,
    bytes: RwLock<Box<[u8]>>,
}

impl MappedRegion {
    fn new(start: LocalAddress, size: DeviceSize) -> Self {
        MappedRegion {
            start,
            bytes: RwLock::new(vec![0; size as usize].into_boxed_slice()),
        }
    }

    fn contains(&self, addr: LocalAddress) -> bool {
        addr >= self.start && addr - self.start < self.bytes.read().len() as DeviceSize
    }

    fn span(&self, addr: LocalAddress, len: usize) -> Range<usize> {
        let offset = (addr - self.start) as usize;

        offset..offset + len
    }
}

/// The contents of the RAM and VRAM bars.
///
/// Reads and writes panic when they leave the bar they start in. Every address the driver uses is
/// one it allocated, so such an access is a bug in the driver.
#[derive(Debug)]
pub struct DeviceMemory {
    ram: MappedRegion,
    vram: MappedRegion,
}

impl DeviceMemory {
    pub(crate) fn new(ram: &RegionInfo, vram: &RegionInfo) -> Self {
        DeviceMemory {
            ram: MappedRegion::new(ram.local_start, ram.size),
            vram: MappedRegion::new(vram.local_start, vram.size),
        }
    }

    fn region(&self, addr: LocalAddress) -> &MappedRegion {
        if self.ram.contains(addr) {
            &self.ram
        } else {
            &self.vram
        }
    }

    pub fn read_bytes(&self, addr: LocalAddress, dst: &mut [u8]) {
        let region = self.region(addr);
        let span = region.span(addr, dst.len());
        dst.copy_from_slice(&region.bytes.read()[span]);
    }

    pub fn write_bytes(&self, addr: LocalAddress, src: &[u8]) {
        let region = self.region(addr);
        let span = region.span(addr, src.len());
        region.bytes.write()[span].copy_from_slice(src);
    }

    pub fn fill(&self, addr: LocalAddress, len: usize, value: u8) {
        let region = self.region(addr);
        let span = region.span(addr, len);
        region.bytes.write()[span].fill(value);
    }

    /// Reads a value of type `T` at `addr`.
    pub fn read<T: Pod>(&self, addr: LocalAddress) -> T {
        let mut value = T::zeroed();
        self.read_bytes(addr, bytemuck::bytes_of_mut(&mut value));

        value
    }

    /// Writes `value` at `addr`.
    pub fn write<T: NoUninit>(&self, addr: LocalAddress, value: &T) {
        self.write_bytes(addr, bytemuck::bytes_of(value));
    }

    /// Reads the value at `addr`, lets `f` modify it and writes it back.
    pub fn update<T: Pod>(&self, addr: LocalAddress, f: impl FnOnce(&mut T)) {
        let mut value = self.read::<T>(addr);
        f(&mut value);
        self.write(addr, &value);
    }
}
