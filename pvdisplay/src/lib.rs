// Copyright (c) 2026 The pvdisplay developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Command-submission core of a paravirtualized display adapter.
//!
//! # Brief summary
//!
//! - The [`Device`] object owns everything. It is created from the raw ROM bytes, the two mapped
//!   memory bars and two collaborators: a [`PortIo`] implementation that writes the device's I/O
//!   ports and a [`HostCallbacks`] implementation that reaches the host graphics kernel.
//!
//! - All device-visible memory is suballocated from two [pools](crate::memory::allocator): DEVRAM,
//!   which holds command payloads, and VRAM, which holds bitmaps, clip rectangles and cursor
//!   shapes. Pointers handed to the device go through the [address
//!   translator](crate::memory::slot).
//!
//! - Commands reach the device through the fixed-size [rings](crate::ring) of the
//!   [`RamHeader`](crate::ram::RamHeader). The device hands finished commands back through the
//!   release ring, and the memory they occupied is reclaimed the next time an allocation is made.
//!
//! - Presents are [built](crate::drawable) on the calling thread and queued to a dedicated worker
//!   thread, which pushes them onto the command ring. A mode change bumps the device's generation,
//!   which makes the worker discard anything built for the previous mode.
//!
//! - Interrupts are acknowledged in [`Device::interrupt_occurred`] and turned into wake-ups for
//!   the waiting producers in [`Device::run_deferred_work`].

pub use crate::{
    command::{Point, Rect},
    device::{
        cursor::{CursorKind, CursorShapeInfo},
        interrupt::InterruptReasons,
        mode::{DisplayInfo, DisplayMode, EscapeKind},
        Device, DeviceCreateInfo, HostCallbacks, IoPort, PortIo,
    },
    memory::{allocator::PoolKind, slot::DeviceAddress, DeviceSize, LocalAddress, RegionInfo},
    present::{MoveRect, PresentInfo, Rotation},
    rom::{RomDescriptor, RomError},
};
use std::{error::Error, fmt};

mod tests;

pub mod command;
pub mod device;
mod drawable;
pub mod memory;
mod present;
pub mod ram;
pub mod resource;
pub mod ring;
pub mod rom;
mod sync;

/// A helper type for non-exhaustive structs.
///
/// This type cannot be constructed outside this crate. Structures with a field of this type can
/// only be constructed by calling a constructor function or `Default::default()`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NonExhaustive(pub(crate) ());

/// Error that can happen when talking to the device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DisplayError {
    /// Neither pool could satisfy an allocation, and waiting for the device did not help.
    OutOfDeviceMemory,

    /// Staging memory on the host could not be reserved.
    OutOfHostMemory,

    /// A caller-supplied buffer did not have the expected size.
    InvalidBufferSize { provided: usize, required: usize },

    /// A caller-supplied value was out of range or not recognized.
    InvalidParameter,

    /// A custom mode needs more primary surface memory than the device has.
    ModeTooLarge {
        required: DeviceSize,
        available: DeviceSize,
    },

    /// No mode with the given index exists.
    UnknownMode,

    /// The present worker is not running.
    WorkerStopped,

    /// The ROM does not list a single mode the driver can use.
    NoSuitableModes,

    /// The ROM could not be parsed.
    InvalidRom(RomError),
}

impl Error for DisplayError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::InvalidRom(err) => Some(err),
            _ => None,
        }
    }
}

impl fmt::Display for DisplayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfDeviceMemory => write!(f, "out of device memory"),
            Self::OutOfHostMemory => write!(f, "out of host memory"),
            Self::InvalidBufferSize { provided, required } => write!(
                f,
                "the buffer has a size of {} bytes, but {} bytes were expected",
                provided, required,
            ),
            Self::InvalidParameter => write!(f, "a parameter was out of range"),
            Self::ModeTooLarge {
                required,
                available,
            } => write!(
                f,
                "the mode requires {} bytes of primary surface memory, but only {} are available",
                required, available,
            ),
            Self::UnknownMode => write!(f, "no mode with the given index exists"),
            Self::WorkerStopped => write!(f, "the present worker is not running"),
            Self::NoSuitableModes => write!(f, "the ROM does not list any usable mode"),
            Self::InvalidRom(_) => write!(f, "the ROM could not be parsed"),
        }
    }
}

impl From<RomError> for DisplayError {
    fn from(err: RomError) -> Self {
        Self::InvalidRom(err)
    }
}
