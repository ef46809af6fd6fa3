// Copyright (c) 2026 The pvdisplay developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Bookkeeping for blocks of device memory referenced by commands.
//!
//! # Outputs and resources
//!
//! An *output* is a block in DEVRAM holding a command payload. Once pushed, it belongs to the
//! device until the device hands it back through the release ring.
//!
//! A *resource* is a block in VRAM that a payload points to: a bitmap, a clip list or a cursor
//! shape. Outputs keep their resources alive through a reference count. When an output is
//! released, every resource it holds is released with it, and a resource whose count reaches zero
//! is destroyed together with its chain of data chunks.
//!
//! The bookkeeping itself lives on the host, keyed by the address of the device block.

use crate::{
    command::{ClipRects, CursorShape, Image},
    memory::{DeviceSize, LocalAddress},
};
use smallvec::SmallVec;
use std::{
    mem::offset_of,
    sync::{
        atomic::{fence, AtomicU32, Ordering},
        Arc,
    },
};

/// Maximum number of resources a single output holds.
pub const MAX_OUTPUT_RES: usize = 6;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    ClipRects,
    Image,
    Cursor,
}

impl ResourceKind {
    /// Offset of the first data chunk within the resource block.
    pub const fn chunk_offset(self) -> DeviceSize {
        (match self {
            ResourceKind::ClipRects => offset_of!(ClipRects, chunk),
            ResourceKind::Image => size_of::<Image>(),
            ResourceKind::Cursor => offset_of!(CursorShape, chunk),
        }) as DeviceSize
    }
}

/// A reference-counted block of device memory.
#[derive(Debug)]
pub struct Resource {
    kind: ResourceKind,
    addr: LocalAddress,
    refs: AtomicU32,
}

impl Resource {
    /// Creates the bookkeeping for a freshly allocated block. The creator holds the only
    /// reference.
    pub(crate) fn new(kind: ResourceKind, addr: LocalAddress) -> Arc<Self> {
        Arc::new(Resource {
            kind,
            addr,
            refs: AtomicU32::new(1),
        })
    }

    #[inline]
    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    /// The local address of the resource block.
    #[inline]
    pub fn address(&self) -> LocalAddress {
        self.addr
    }

    #[inline]
    pub fn ref_count(&self) -> u32 {
        self.refs.load(Ordering::Acquire)
    }

    pub(crate) fn add_ref(&self) {
        let old = self.refs.fetch_add(1, Ordering::Relaxed);
        debug_assert!(old > 0, "reference added to a destroyed resource");
    }

    /// Drops one reference. Returns `true` for the one call that dropped the last reference,
    /// after which the caller must destroy the resource.
    #[must_use]
    pub(crate) fn release(&self) -> bool {
        let old = self.refs.fetch_sub(1, Ordering::Release);
        debug_assert!(old > 0, "resource released more often than referenced");

        if old != 1 {
            return false;
        }

        fence(Ordering::Acquire);

        true
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) enum OutputKind {
    Drawable,
    Cursor,
}

/// Host-side bookkeeping of an output block.
#[derive(Debug)]
pub(crate) struct Output {
    kind: OutputKind,
    resources: SmallVec<[Arc<Resource>; MAX_OUTPUT_RES]>,
}

impl Output {
    pub fn new(kind: OutputKind) -> Self {
        Output {
            kind,
            resources: SmallVec::new(),
        }
    }

    #[inline]
    pub fn kind(&self) -> OutputKind {
        self.kind
    }

    /// Makes the output hold a reference to `resource`.
    ///
    /// # Panics
    ///
    /// - Panics if the output already holds [`MAX_OUTPUT_RES`] resources.
    pub fn attach(&mut self, resource: &Arc<Resource>) {
        assert!(
            self.resources.len() < MAX_OUTPUT_RES,
            "an output holds at most {} resources",
            MAX_OUTPUT_RES,
        );

        resource.add_ref();
        self.resources.push(resource.clone());
    }

    pub fn resources(&self) -> &[Arc<Resource>] {
        &self.resources
    }

    pub fn into_resources(self) -> SmallVec<[Arc<Resource>; MAX_OUTPUT_RES]> {
        self.resources
    }
}
