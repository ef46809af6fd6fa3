// Copyright (c) 2026 The pvdisplay developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Interrupt acknowledgement and the deferred work that follows it.
//!
//! The device raises an interrupt by setting bits in `int_pending`. The host calls
//! [`Device::interrupt_occurred`] from its interrupt handler, which acknowledges the interrupt
//! and queues the deferred work. The host later calls [`Device::run_deferred_work`], which wakes
//! whoever waits on the corresponding channel.

use super::{Device, IoPort};
use bitflags::bitflags;
use std::sync::atomic::Ordering;
use tracing::{trace, warn};

bitflags! {
    /// Reasons the device raises an interrupt for.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct InterruptReasons: u32 {
        /// The device consumed commands or released outputs.
        const DISPLAY = 1 << 0;

        /// The device consumed cursor commands.
        const CURSOR = 1 << 1;

        /// An asynchronous port write completed.
        const IO_CMD = 1 << 2;

        const ERROR = 1 << 3;
        const CLIENT = 1 << 4;
        const CLIENT_MONITORS_CONFIG = 1 << 5;
    }
}

/// The interrupts the driver unmasks.
pub(crate) const DRIVER_INTERRUPTS: InterruptReasons = InterruptReasons::DISPLAY
    .union(InterruptReasons::CURSOR)
    .union(InterruptReasons::IO_CMD);

impl Device {
    /// Acknowledges a pending interrupt. Returns `false` if the interrupt wasn't raised by this
    /// device, or only for masked reasons.
    pub fn interrupt_occurred(&self) -> bool {
        let header = &self.ram_header;
        let pending = header.int_pending.load(Ordering::Acquire);

        if pending & header.int_mask.load(Ordering::Acquire) == 0 {
            return false;
        }

        let reasons = header.int_pending.swap(0, Ordering::AcqRel);
        self.pending.fetch_or(reasons, Ordering::AcqRel);

        // This may run in interrupt context, so it bypasses the I/O lock.
        self.port_io.write_port(IoPort::UpdateIrq, 0);

        if !self.host.queue_dpc() {
            warn!(
                reasons = ?InterruptReasons::from_bits_retain(reasons),
                "deferred work was already queued",
            );
        }

        true
    }

    /// Wakes the waiters for every interrupt reason acknowledged since the last call.
    pub fn run_deferred_work(&self) {
        let reasons = InterruptReasons::from_bits_retain(self.pending.swap(0, Ordering::AcqRel));
        trace!(?reasons, "running deferred interrupt work");

        if reasons.contains(InterruptReasons::DISPLAY) {
            self.display_event.set();
        }

        if reasons.contains(InterruptReasons::CURSOR) {
            self.cursor_event.set();
        }

        if reasons.contains(InterruptReasons::IO_CMD) {
            self.io_cmd_event.set();
        }
    }
}
