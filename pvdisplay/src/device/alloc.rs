// Copyright (c) 2026 The pvdisplay developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Allocation of device memory, and reclaiming it from released outputs.

use super::{Device, IoPort};
use crate::{
    command::{DataChunk, ReleaseInfo},
    memory::{
        allocator::{MemoryPools, PoolKind},
        slot::DeviceAddress,
        DeviceSize, LocalAddress,
    },
    resource::{Output, OutputKind, Resource},
};
use foldhash::HashMap;
use parking_lot::MutexGuard;
use std::{sync::Arc, thread, time::Duration};
use tracing::{debug, error, trace, warn};

/// Maximum number of outputs released by one call to `flush_release_ring`.
pub(crate) const RELEASE_BATCH: usize = 50;

/// How long to let the device catch up before asking it to release memory.
const OOM_GRACE: Duration = Duration::from_millis(10);

/// How long to wait for a display interrupt while the release ring stays empty.
const RELEASE_WAIT: Duration = Duration::from_millis(30);

/// Everything guarded by the allocator mutex.
#[derive(Debug)]
pub(crate) struct MemState {
    pub(crate) pools: MemoryPools,
    pub(crate) outputs: HashMap<LocalAddress, Output>,
    // The rest of a release chain that didn't fit in the last batch.
    pub(crate) free_outputs: Option<LocalAddress>,
}

impl MemState {
    pub fn new(pools: MemoryPools) -> Self {
        MemState {
            pools,
            outputs: HashMap::default(),
            free_outputs: None,
        }
    }
}

#[inline]
fn non_null(addr: u64) -> Option<LocalAddress> {
    (addr != 0).then_some(addr)
}

impl Device {
    /// Allocates `size` bytes from `pool`.
    ///
    /// When `force` is false this never blocks: if the allocator is busy, or if the memory isn't
    /// available right away, `None` is returned. When `force` is true, the call waits for the
    /// device to release memory for as long as the device is active.
    pub(crate) fn alloc_mem(
        &self,
        pool: PoolKind,
        size: DeviceSize,
        force: bool,
    ) -> Option<LocalAddress> {
        let mut state = if force {
            self.mem.lock()
        } else {
            self.mem.try_lock()?
        };

        loop {
            self.flush_release_ring(&mut state);

            if let Some((addr, effective)) = state.pools.allocate(pool, size) {
                debug_assert_eq!(state.pools.classify(addr), Some(effective));
                return Some(addr);
            }

            if state.free_outputs.is_some() || !self.ram_header.release_ring.is_empty() {
                continue;
            }

            if !force || !self.is_active() {
                trace!(?pool, size, force, "device memory allocation failed");
                return None;
            }

            MutexGuard::unlocked(&mut state, || self.wait_for_release_ring());
        }
    }

    pub(crate) fn free_mem(&self, addr: LocalAddress) {
        let mut state = self.mem.lock();
        self.free_locked(&mut state, addr);
    }

    fn free_locked(&self, state: &mut MemState, addr: LocalAddress) {
        if !state.pools.free(addr) {
            error!(addr = format_args!("{:#x}", addr), "freeing memory that isn't allocated");
        }
    }

    /// Blocks until the device released something, or until it is deactivated.
    fn wait_for_release_ring(&self) {
        let ring = &self.ram_header.release_ring;
        let mut state = self.mem.lock();

        loop {
            if ring.is_empty() {
                MutexGuard::unlocked(&mut state, || thread::sleep(OOM_GRACE));

                if !ring.is_empty() {
                    break;
                }

                debug!("release ring is empty, notifying the device");
                self.sync_io(IoPort::NotifyOom, 0);
            }

            if !ring.cons_wait() || !self.is_active() {
                break;
            }

            MutexGuard::unlocked(&mut state, || {
                self.display_event.wait_timeout(RELEASE_WAIT);
            });

            if ring.is_empty() {
                self.sync_io(IoPort::NotifyOom, 0);
            }
        }
    }

    /// Releases up to [`RELEASE_BATCH`] outputs handed back by the device.
    pub(crate) fn flush_release_ring(&self, state: &mut MemState) {
        let ring = &self.ram_header.release_ring;
        let mut output = state.free_outputs.take();
        let mut budget = RELEASE_BATCH;

        loop {
            while let Some(id) = output {
                output = self.release_output_locked(state, id);
                budget -= 1;

                if budget == 0 {
                    break;
                }
            }

            if output.is_some() || budget == 0 {
                break;
            }

            // SAFETY: The allocator mutex is held, and it is the only place the release ring is
            // consumed from.
            match unsafe { ring.pop() } {
                Some((id, _)) => output = non_null(id),
                None => break,
            }
        }

        state.free_outputs = output;
    }

    /// Flushes until the release ring is empty and no chain is left over.
    pub(crate) fn drain_release_ring(&self, state: &mut MemState) {
        while state.free_outputs.is_some() || !self.ram_header.release_ring.is_empty() {
            self.flush_release_ring(state);
        }
    }

    /// Allocates an output block in DEVRAM with a zeroed payload of `size` bytes, whose release
    /// info points at itself.
    pub(crate) fn new_output(&self, kind: OutputKind, size: DeviceSize) -> Option<LocalAddress> {
        let addr = self.alloc_mem(PoolKind::DevRam, size, true)?;
        self.memory.fill(addr, size as usize, 0);
        self.memory.write(addr, &ReleaseInfo { id: addr, next: 0 });
        self.mem.lock().outputs.insert(addr, Output::new(kind));

        Some(addr)
    }

    /// Releases an output that will never reach the device.
    pub(crate) fn release_output(&self, id: LocalAddress) {
        let mut state = self.mem.lock();

        if let Some(next) = self.release_output_locked(&mut state, id) {
            warn!(
                id = format_args!("{:#x}", id),
                next = format_args!("{:#x}", next),
                "released an output that was chained to another",
            );
        }
    }

    /// Releases the resources of an output, then the output itself. Returns the next output in
    /// the release chain.
    pub(crate) fn release_output_locked(
        &self,
        state: &mut MemState,
        id: LocalAddress,
    ) -> Option<LocalAddress> {
        let Some(output) = state.outputs.remove(&id) else {
            error!(id = format_args!("{:#x}", id), "releasing an unknown output");
            return None;
        };

        trace!(id = format_args!("{:#x}", id), kind = ?output.kind(), "releasing output");

        for resource in output.into_resources() {
            self.release_resource_locked(state, &resource);
        }

        let next = self.memory.read::<ReleaseInfo>(id).next;
        self.free_locked(state, id);

        non_null(next)
    }

    /// Makes `output` hold `resource`, consuming the creator's reference.
    pub(crate) fn attach_resource(&self, output: LocalAddress, resource: Arc<Resource>) {
        let mut state = self.mem.lock();

        match state.outputs.get_mut(&output) {
            Some(entry) => entry.attach(&resource),
            None => error!(
                output = format_args!("{:#x}", output),
                "attaching a resource to an unknown output",
            ),
        }

        self.release_resource_locked(&mut state, &resource);
    }

    fn release_resource_locked(&self, state: &mut MemState, resource: &Resource) {
        if resource.release() {
            self.destroy_resource_locked(state, resource);
        }
    }

    /// Frees the chunks chained after the resource's embedded first chunk, then the resource
    /// block.
    fn destroy_resource_locked(&self, state: &mut MemState, resource: &Resource) {
        let first = resource.address() + resource.kind().chunk_offset();
        let mut chunk = self.memory.read::<DataChunk>(first).next_chunk;

        while chunk != 0 {
            let addr = self.translator.to_local(DeviceAddress::from_raw(chunk));
            chunk = self.memory.read::<DataChunk>(addr).next_chunk;
            self.free_locked(state, addr);
        }

        self.free_locked(state, resource.address());
    }
}
