// Copyright (c) 2026 The pvdisplay developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The free-list allocator backing each pool.

use self::host::SlotId;
use crate::memory::{DeviceSize, LocalAddress};
use foldhash::HashMap;
use std::{
    error::Error,
    fmt::{self, Display},
};

/// Alignment of every block handed out.
pub(crate) const BLOCK_ALIGNMENT: DeviceSize = 8;

/// Error that can be returned when suballocating from a pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SuballocatorError {
    /// There is no more space available in the pool.
    OutOfRegionMemory,

    /// The pool has enough free space in total, but no single free block is large enough.
    FragmentedRegion,
}

impl Error for SuballocatorError {}

impl Display for SuballocatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::OutOfRegionMemory => "out of pool memory",
                Self::FragmentedRegion => "the pool is too fragmented",
            }
        )
    }
}

/// A best-fit free-list allocator over a range of local addresses.
///
/// Free blocks are kept in a list sorted by size, so the best fit is found with a binary search.
/// Every block, free or not, is also part of a doubly linked list in address order, which lets a
/// freed block be merged with its free neighbors right away.
///
/// The allocator does no locking of its own. The device guards all of its pools with one mutex.
#[derive(Debug)]
pub(crate) struct FreeListAllocator {
    start: LocalAddress,
    size: DeviceSize,
    free_size: DeviceSize,
    nodes: host::PoolAllocator<BlockNode>,
    // Free blocks sorted by size in ascending order.
    free_list: Vec<SlotId>,
    // Occupied blocks by their address.
    occupied: HashMap<LocalAddress, SlotId>,
}

#[derive(Clone, Copy, Debug)]
struct BlockNode {
    prev: Option<SlotId>,
    next: Option<SlotId>,
    offset: LocalAddress,
    size: DeviceSize,
    free: bool,
}

impl FreeListAllocator {
    /// Creates an allocator managing `[start, start + size)`.
    ///
    /// # Panics
    ///
    /// - Panics if `start` is not aligned to [`BLOCK_ALIGNMENT`].
    pub fn new(start: LocalAddress, size: DeviceSize) -> Self {
        assert_eq!(start % BLOCK_ALIGNMENT, 0);

        let size = size - size % BLOCK_ALIGNMENT;
        let mut nodes = host::PoolAllocator::new(64);
        let mut free_list = Vec::with_capacity(16);

        if size > 0 {
            free_list.push(nodes.allocate(BlockNode {
                prev: None,
                next: None,
                offset: start,
                size,
                free: true,
            }));
        }

        FreeListAllocator {
            start,
            size,
            free_size: size,
            nodes,
            free_list,
            occupied: HashMap::default(),
        }
    }

    #[inline]
    pub fn start(&self) -> LocalAddress {
        self.start
    }

    #[inline]
    pub fn size(&self) -> DeviceSize {
        self.size
    }

    /// Total memory remaining in the pool.
    #[inline]
    pub fn free_size(&self) -> DeviceSize {
        self.free_size
    }

    /// Allocates a block of at least `size` bytes and returns its address.
    ///
    /// A size of zero is served with the smallest possible block.
    pub fn allocate(&mut self, size: DeviceSize) -> Result<LocalAddress, SuballocatorError> {
        let size = size
            .max(1)
            .checked_next_multiple_of(BLOCK_ALIGNMENT)
            .ok_or(SuballocatorError::OutOfRegionMemory)?;

        match self.free_list.last() {
            Some(&last) if self.nodes.get(last).size >= size => {
                // The list is sorted, so either this is an exact fit or the next-best one. It
                // can't be past the end because the last block is large enough.
                let (Ok(index) | Err(index)) = self
                    .free_list
                    .binary_search_by_key(&size, |&id| self.nodes.get(id).size);
                let id = self.free_list.remove(index);
                let offset = self.nodes.get(id).offset;

                self.split(id, size);
                self.nodes.get_mut(id).free = false;
                self.occupied.insert(offset, id);
                self.free_size -= size;

                Ok(offset)
            }
            Some(_) if self.free_size >= size => Err(SuballocatorError::FragmentedRegion),
            _ => Err(SuballocatorError::OutOfRegionMemory),
        }
    }

    /// Returns the block at `addr` to the pool. Returns `false` if no block was allocated there.
    pub fn free(&mut self, addr: LocalAddress) -> bool {
        let Some(id) = self.occupied.remove(&addr) else {
            return false;
        };

        let node = self.nodes.get_mut(id);
        debug_assert!(!node.free);
        node.free = true;
        self.free_size += node.size;

        self.coalesce(id);
        self.insert_free(id);

        true
    }

    /// Trims the free block `id` down to `size` bytes, turning the remainder into a new free
    /// block placed after it.
    fn split(&mut self, id: SlotId, size: DeviceSize) {
        let node = self.nodes.get(id);
        debug_assert!(node.free && node.size >= size);

        let remainder = node.size - size;

        if remainder == 0 {
            return;
        }

        let tail_id = self.nodes.allocate(BlockNode {
            prev: Some(id),
            next: node.next,
            offset: node.offset + size,
            size: remainder,
            free: true,
        });

        if let Some(next_id) = node.next {
            self.nodes.get_mut(next_id).prev = Some(tail_id);
        }

        let node = self.nodes.get_mut(id);
        node.next = Some(tail_id);
        node.size = size;

        self.insert_free(tail_id);
    }

    fn insert_free(&mut self, id: SlotId) {
        debug_assert!(!self.free_list.contains(&id));

        let size = self.nodes.get(id).size;
        let (Ok(index) | Err(index)) = self
            .free_list
            .binary_search_by_key(&size, |&id| self.nodes.get(id).size);
        self.free_list.insert(index, id);
    }

    /// Removes a free block from the free-list. Several blocks may share a size, so the search
    /// only finds the run of equal sizes to scan.
    fn remove_free(&mut self, id: SlotId) {
        let size = self.nodes.get(id).size;
        let start = self
            .free_list
            .partition_point(|&other| self.nodes.get(other).size < size);
        let position = self.free_list[start..]
            .iter()
            .position(|&other| other == id);

        match position {
            Some(position) => {
                self.free_list.remove(start + position);
            }
            None => debug_assert!(false, "free block missing from the free-list"),
        }
    }

    /// Merges the free block `id` with its free neighbors. `id` itself must not be in the
    /// free-list yet.
    fn coalesce(&mut self, id: SlotId) {
        let node = self.nodes.get(id);

        if let Some(prev_id) = node.prev {
            let prev = self.nodes.get(prev_id);

            if prev.free {
                self.remove_free(prev_id);

                let node = self.nodes.get_mut(id);
                node.prev = prev.prev;
                node.offset = prev.offset;
                node.size += prev.size;

                if let Some(prev_prev_id) = prev.prev {
                    self.nodes.get_mut(prev_prev_id).next = Some(id);
                }

                self.nodes.free(prev_id);
            }
        }

        let node = self.nodes.get(id);

        if let Some(next_id) = node.next {
            let next = self.nodes.get(next_id);

            if next.free {
                self.remove_free(next_id);

                let node = self.nodes.get_mut(id);
                node.next = next.next;
                node.size += next.size;

                if let Some(next_next_id) = next.next {
                    self.nodes.get_mut(next_next_id).prev = Some(id);
                }

                self.nodes.free(next_id);
            }
        }
    }
}

/// Pool of list nodes on the host, so that splitting and merging blocks does not go through the
/// global allocator every time.
mod host {
    use std::num::NonZeroUsize;

    #[derive(Debug)]
    pub(super) struct PoolAllocator<T> {
        pool: Vec<T>,
        // Unsorted list of free slots.
        free_list: Vec<SlotId>,
    }

    impl<T: Copy> PoolAllocator<T> {
        pub fn new(capacity: usize) -> Self {
            PoolAllocator {
                pool: Vec::with_capacity(capacity),
                free_list: Vec::new(),
            }
        }

        pub fn allocate(&mut self, val: T) -> SlotId {
            if let Some(id) = self.free_list.pop() {
                *self.get_mut(id) = val;

                id
            } else {
                self.pool.push(val);

                // The pool was just pushed to, so its length is non-zero.
                SlotId(NonZeroUsize::MIN.saturating_add(self.pool.len() - 1))
            }
        }

        /// Returns the slot to the allocator. The ID must not be used again.
        pub fn free(&mut self, id: SlotId) {
            debug_assert!(!self.free_list.contains(&id));
            self.free_list.push(id);
        }

        pub fn get(&self, id: SlotId) -> T {
            self.pool[id.0.get() - 1]
        }

        pub fn get_mut(&mut self, id: SlotId) -> &mut T {
            &mut self.pool[id.0.get() - 1]
        }
    }

    /// ID of a slot in the `host::PoolAllocator`.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub(super) struct SlotId(NonZeroUsize);
}
