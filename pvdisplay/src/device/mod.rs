// Copyright (c) 2026 The pvdisplay developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The device and its collaborators.
//!
//! # Creating a device
//!
//! A [`Device`] is created from the raw ROM and the two memory bars, together with two trait
//! objects:
//!
//! - [`PortIo`] writes the device's I/O ports. Ports are how the driver kicks the device: to
//!   notify it of new commands, to acknowledge an interrupt, or to ask it to release memory.
//! - [`HostCallbacks`] reaches the host graphics kernel: queueing the deferred interrupt work and
//!   reporting the monitor as connected.
//!
//! ```
//! use pvdisplay::{
//!     Device, DeviceCreateInfo, HostCallbacks, IoPort, PortIo, RegionInfo, RomDescriptor,
//!     rom::RomMode,
//! };
//! use std::sync::Arc;
//!
//! struct Ports;
//!
//! impl PortIo for Ports {
//!     fn write_port(&self, _port: IoPort, _value: u8) {}
//! }
//!
//! struct Host;
//!
//! impl HostCallbacks for Host {
//!     fn queue_dpc(&self) -> bool {
//!         true
//!     }
//!
//!     fn indicate_child_status(&self, _connected: bool) {}
//! }
//!
//! let rom = RomDescriptor {
//!     surface0_area_size: 1024 * 768 * 4,
//!     num_pages: 16,
//!     slots_start: 1,
//!     slots_end: 3,
//!     slot_gen_bits: 8,
//!     slot_id_bits: 4,
//!     modes: vec![RomMode { x_res: 1024, y_res: 768, bits: 32, stride: 4096, ..Default::default() }],
//!     ..Default::default()
//! };
//!
//! let device = Device::new(
//!     Arc::new(Ports),
//!     Arc::new(Host),
//!     DeviceCreateInfo {
//!         rom: rom.to_bytes(),
//!         ram: RegionInfo {
//!             phys_start: 0xf000_0000,
//!             local_start: 0x1000_0000,
//!             size: 1024 * 768 * 4 + 16 * 4096,
//!         },
//!         vram: RegionInfo {
//!             phys_start: 0xf800_0000,
//!             local_start: 0x2000_0000,
//!             size: 1 << 20,
//!         },
//!         ..Default::default()
//!     },
//! )
//! .unwrap();
//!
//! assert_eq!(device.current_mode().width, 1024);
//! device.shutdown();
//! ```
//!
//! # Shutting down
//!
//! The present worker holds a reference to the device, so a device is only dropped after
//! [`Device::shutdown`] has stopped it.

use self::{
    alloc::MemState,
    interrupt::DRIVER_INTERRUPTS,
    mode::{DisplayInfo, ModeTable},
};
use crate::{
    command::MONITORS_CONFIG_SIZE,
    memory::{
        allocator::{MemoryPools, PoolKind, BLOCK_ALIGNMENT},
        slot::{AddressTranslator, MemorySlot, SlotLayout},
        DeviceMemory, DeviceSize, LocalAddress, RegionInfo, PAGE_SIZE,
    },
    present::PresentQueue,
    ram::{MemSlotWindow, RamHeader},
    rom::{RomDescriptor, RomError},
    sync::Event,
    DisplayError, NonExhaustive,
};
use parking_lot::Mutex;
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
    },
    thread::JoinHandle,
    time::Duration,
};
use tracing::{debug, warn};

pub(crate) mod alloc;
pub mod cursor;
pub mod interrupt;
pub mod mode;
mod submit;

/// How long an asynchronous port write waits for the device to complete it.
const ASYNC_IO_TIMEOUT: Duration = Duration::from_secs(60);

/// The I/O ports the driver writes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum IoPort {
    NotifyCmd = 0,
    NotifyCursor = 1,
    UpdateIrq = 3,
    NotifyOom = 4,
    Reset = 5,
    MemslotAdd = 8,
    CreatePrimary = 12,
    DestroyPrimary = 13,
    MonitorsConfigAsync = 24,
}

impl IoPort {
    /// Offset of the port from the start of the device's I/O range.
    #[inline]
    pub const fn offset(self) -> u8 {
        self as u8
    }

    /// Whether the device completes a write to this port by raising `IO_CMD`.
    #[inline]
    pub const fn is_async(self) -> bool {
        matches!(self, IoPort::MonitorsConfigAsync)
    }
}

/// Writes the device's I/O ports.
pub trait PortIo: Send + Sync {
    fn write_port(&self, port: IoPort, value: u8);
}

/// Callbacks into the host graphics kernel.
pub trait HostCallbacks: Send + Sync {
    /// Queues a call to [`Device::run_deferred_work`]. Returns `false` if one is already queued.
    fn queue_dpc(&self) -> bool;

    /// Reports whether the monitor is connected.
    fn indicate_child_status(&self, connected: bool);
}

/// Parameters to create a new `Device`.
#[derive(Clone, Debug)]
pub struct DeviceCreateInfo {
    /// The raw ROM.
    ///
    /// The default value is empty, which must be overridden.
    pub rom: Vec<u8>,

    /// The RAM bar. It must hold the primary surface followed by DEVRAM.
    ///
    /// The default value is empty, which must be overridden.
    pub ram: RegionInfo,

    /// The VRAM bar.
    ///
    /// The default value is empty, which must be overridden.
    pub vram: RegionInfo,

    /// The display mode the host booted with. The matching mode becomes the current one.
    ///
    /// The default value is [`DisplayInfo::default()`], which selects 1024x768.
    pub display: DisplayInfo,

    /// Whether presents may stage pixel data on the host when VRAM is exhausted, instead of
    /// waiting for the device on the calling thread.
    ///
    /// The default value is `true`.
    pub delayed_chunks: bool,

    pub _ne: NonExhaustive,
}

impl Default for DeviceCreateInfo {
    #[inline]
    fn default() -> Self {
        DeviceCreateInfo {
            rom: Vec::new(),
            ram: RegionInfo::default(),
            vram: RegionInfo::default(),
            display: DisplayInfo::default(),
            delayed_chunks: true,
            _ne: NonExhaustive(()),
        }
    }
}

/// A paravirtualized display adapter.
pub struct Device {
    pub(crate) port_io: Arc<dyn PortIo>,
    pub(crate) host: Arc<dyn HostCallbacks>,
    pub(crate) rom: RomDescriptor,
    pub(crate) ram_header: Arc<RamHeader>,
    pub(crate) memory: DeviceMemory,
    pub(crate) translator: AddressTranslator,
    pub(crate) ram_start: LocalAddress,
    pub(crate) monitors_config: LocalAddress,

    pub(crate) mem: Mutex<MemState>,
    pub(crate) cmd_lock: Mutex<()>,
    pub(crate) cursor_lock: Mutex<()>,
    pub(crate) io_lock: Mutex<()>,

    pub(crate) display_event: Event,
    pub(crate) cursor_event: Event,
    pub(crate) io_cmd_event: Event,

    // Interrupt reasons acknowledged but not yet handled by the deferred work.
    pub(crate) pending: AtomicU32,
    pub(crate) generation: AtomicU32,
    pub(crate) active: AtomicBool,
    pub(crate) delayed_chunks: bool,
    pub(crate) modes: Mutex<ModeTable>,

    pub(crate) present: PresentQueue,
    pub(crate) worker: Mutex<Option<JoinHandle<()>>>,
}

impl Device {
    /// Creates a new `Device` and starts its present worker.
    ///
    /// # Panics
    ///
    /// - Panics if the RAM and VRAM bars overlap.
    pub fn new(
        port_io: Arc<dyn PortIo>,
        host: Arc<dyn HostCallbacks>,
        create_info: DeviceCreateInfo,
    ) -> Result<Arc<Device>, DisplayError> {
        let DeviceCreateInfo {
            rom,
            ram,
            vram,
            display,
            delayed_chunks,
            _ne: _,
        } = create_info;

        let rom = RomDescriptor::parse(&rom)?;
        let modes = ModeTable::new(&rom.modes, &display)?;

        let devram_size = rom
            .num_pages
            .checked_mul(PAGE_SIZE)
            .ok_or(DisplayError::InvalidParameter)?;
        let main_size = rom.surface0_area_size + devram_size;

        if ram.local_start == 0
            || vram.local_start == 0
            || ram.local_start % BLOCK_ALIGNMENT != 0
            || vram.local_start % BLOCK_ALIGNMENT != 0
            || ram.size < main_size
            || vram.size == 0
        {
            return Err(DisplayError::InvalidParameter);
        }

        let layout = SlotLayout::new(rom.slot_id_bits, rom.slot_gen_bits)
            .ok_or(RomError::InvalidSlotLayout)?;
        let main_slot = MemorySlot::new(
            layout,
            rom.slots_start,
            rom.slot_generation,
            ram.phys_start,
            ram.local_start,
            main_size,
        )
        .ok_or(RomError::InvalidSlotLayout)?;
        let surface_slot = MemorySlot::new(
            layout,
            rom.slots_start.wrapping_add(1),
            rom.slot_generation,
            vram.phys_start,
            vram.local_start,
            vram.size,
        )
        .ok_or(RomError::InvalidSlotLayout)?;

        let devram_start = ram.local_start + rom.surface0_area_size;
        let pools = MemoryPools::new(devram_start..devram_start + devram_size, vram.range());

        let mut device = Device {
            port_io,
            host,
            ram_header: Arc::new(RamHeader::new()),
            memory: DeviceMemory::new(&ram, &vram),
            translator: AddressTranslator::new(layout, rom.slots_start, [main_slot, surface_slot]),
            ram_start: ram.local_start,
            monitors_config: 0,
            rom,
            mem: Mutex::new(MemState::new(pools)),
            cmd_lock: Mutex::new(()),
            cursor_lock: Mutex::new(()),
            io_lock: Mutex::new(()),
            display_event: Event::new(),
            cursor_event: Event::new(),
            io_cmd_event: Event::new(),
            pending: AtomicU32::new(0),
            generation: AtomicU32::new(0),
            active: AtomicBool::new(false),
            delayed_chunks,
            modes: Mutex::new(modes),
            present: PresentQueue::new(),
            worker: Mutex::new(None),
        };

        device.port_io.write_port(IoPort::Reset, 0);
        device
            .ram_header
            .int_mask
            .store(DRIVER_INTERRUPTS.bits(), Ordering::Release);
        device.register_memslots();
        device.monitors_config = device.create_monitors_config()?;

        let device = Arc::new(device);
        device.set_active(true);
        device.start_present_thread()?;

        debug!(
            id = device.rom.id,
            modes = device.modes.lock().len(),
            "device initialized",
        );

        Ok(device)
    }

    fn register_memslots(&self) {
        for (index, slot) in self.translator.slots().iter().enumerate() {
            *self.ram_header.mem_slot.lock() = MemSlotWindow {
                mem_start: slot.start_phys,
                mem_end: slot.end_phys,
            };
            self.sync_io(IoPort::MemslotAdd, index as u8 + 1);
        }
    }

    /// Allocates the monitors config and publishes its address.
    fn create_monitors_config(&self) -> Result<LocalAddress, DisplayError> {
        let addr = self
            .alloc_mem(PoolKind::DevRam, MONITORS_CONFIG_SIZE, true)
            .ok_or(DisplayError::OutOfDeviceMemory)?;
        self.memory.fill(addr, MONITORS_CONFIG_SIZE as usize, 0);
        self.ram_header
            .monitors_config
            .store(self.translator.to_device(addr).as_raw(), Ordering::Release);

        Ok(addr)
    }

    #[inline]
    pub fn rom(&self) -> &RomDescriptor {
        &self.rom
    }

    /// The header shared with the device.
    #[inline]
    pub fn ram_header(&self) -> &Arc<RamHeader> {
        &self.ram_header
    }

    /// The contents of the memory bars.
    #[inline]
    pub fn memory(&self) -> &DeviceMemory {
        &self.memory
    }

    #[inline]
    pub fn translator(&self) -> &AddressTranslator {
        &self.translator
    }

    /// Local address of the monitors config.
    #[inline]
    pub fn monitors_config(&self) -> LocalAddress {
        self.monitors_config
    }

    /// Remaining free memory of a pool.
    pub fn free_size(&self, pool: PoolKind) -> DeviceSize {
        self.mem.lock().pools.free_size(pool)
    }

    /// Returns the current generation. Every mode change and shutdown bumps it, and drawables
    /// built under an older generation are discarded instead of pushed.
    #[inline]
    pub fn generation(&self) -> u32 {
        // A stale read only means one more drawable is built and then discarded.
        self.generation.load(Ordering::Relaxed)
    }

    pub(crate) fn bump_generation(&self) -> u32 {
        self.generation.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }

    #[inline]
    pub(crate) fn delayed_chunks(&self) -> bool {
        self.delayed_chunks
    }

    /// Writes `port` under the I/O lock.
    pub(crate) fn sync_io(&self, port: IoPort, value: u8) {
        let _guard = self.io_lock.lock();
        self.port_io.write_port(port, value);
    }

    /// Writes `port` under the I/O lock and waits for the device to signal completion.
    pub(crate) fn async_io(&self, port: IoPort, value: u8) {
        debug_assert!(port.is_async());

        let _guard = self.io_lock.lock();
        self.port_io.write_port(port, value);

        if !self.io_cmd_event.wait_timeout(ASYNC_IO_TIMEOUT) {
            warn!(?port, "the device did not complete an asynchronous port write");
        }
    }

    /// Masks nothing and drops all memory slots, as the device expects before it is reset.
    pub fn reset(&self) {
        self.ram_header.int_mask.store(!0, Ordering::Release);
        self.sync_io(IoPort::MemslotAdd, 0);
    }

    /// Stops the present worker and frees all device memory still in use.
    ///
    /// Outputs the device never released are discarded without its confirmation. Calling this
    /// more than once has no further effect.
    pub fn shutdown(&self) {
        self.set_active(false);
        // Producers waiting for room notice the device is gone.
        self.display_event.set();
        self.cursor_event.set();
        self.stop_present_thread();

        let mut state = self.mem.lock();
        self.drain_release_ring(&mut state);

        let outstanding: Vec<_> = state.outputs.keys().copied().collect();

        if !outstanding.is_empty() {
            warn!(
                count = outstanding.len(),
                "discarding outputs the device never released",
            );
        }

        for id in outstanding {
            if let Some(next) = self.release_output_locked(&mut state, id) {
                warn!(
                    id = format_args!("{:#x}", id),
                    next = format_args!("{:#x}", next),
                    "discarded output was chained to another",
                );
            }
        }
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("rom", &self.rom)
            .field("ram_header", &self.ram_header)
            .field("translator", &self.translator)
            .field("generation", &self.generation)
            .field("active", &self.active)
            .finish_non_exhaustive()
    }
}
