// Copyright (c) 2026 The pvdisplay developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The header shared between the driver and the device.

use crate::{
    command::{Command, SurfaceCreate},
    ring::Ring,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64};

pub const COMMAND_RING_SIZE: usize = 32;
pub const CURSOR_RING_SIZE: usize = 32;
pub const RELEASE_RING_SIZE: usize = 8;

/// Window through which a memory slot is described to the device before `MEMSLOT_ADD`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemSlotWindow {
    pub mem_start: u64,
    pub mem_end: u64,
}

/// The shared descriptor both sides see.
///
/// The driver produces on the command and cursor rings and consumes the release ring. A device
/// implementation does the opposite, and raises interrupts by setting bits in `int_pending`.
#[derive(Debug)]
pub struct RamHeader {
    pub int_pending: AtomicU32,
    pub int_mask: AtomicU32,
    pub command_ring: Ring<Command, COMMAND_RING_SIZE>,
    pub cursor_ring: Ring<Command, CURSOR_RING_SIZE>,
    /// Local addresses of released outputs, each possibly heading a chain.
    pub release_ring: Ring<u64, RELEASE_RING_SIZE>,
    pub mem_slot: Mutex<MemSlotWindow>,
    pub create_surface: Mutex<SurfaceCreate>,
    /// Device address of the monitors config.
    pub monitors_config: AtomicU64,
}

impl RamHeader {
    pub fn new() -> Self {
        RamHeader {
            int_pending: AtomicU32::new(0),
            int_mask: AtomicU32::new(0),
            command_ring: Ring::new(),
            cursor_ring: Ring::new(),
            release_ring: Ring::new(),
            mem_slot: Mutex::new(MemSlotWindow::default()),
            create_surface: Mutex::new(SurfaceCreate::default()),
            monitors_config: AtomicU64::new(0),
        }
    }
}

impl Default for RamHeader {
    fn default() -> Self {
        Self::new()
    }
}
