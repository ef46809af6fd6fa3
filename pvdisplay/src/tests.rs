// Copyright (c) 2026 The pvdisplay developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

#![cfg(test)]

//! Test harness: a recording port, a recording host, and helpers that play the device's part.

use crate::{
    command::{Command, ReleaseInfo},
    memory::{DeviceSize, LocalAddress, RegionInfo, PAGE_SIZE},
    ring::Ring,
    rom::{RomDescriptor, RomMode},
    Device, DeviceCreateInfo, HostCallbacks, InterruptReasons, IoPort, PortIo,
};
use parking_lot::Mutex;
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Weak,
    },
    thread,
    time::{Duration, Instant},
};

pub(crate) const SURFACE0_SIZE: DeviceSize = 0x10000;
const NUM_PAGES: DeviceSize = 16;
pub(crate) const DEVRAM_SIZE: DeviceSize = NUM_PAGES * PAGE_SIZE;
pub(crate) const VRAM_SIZE: DeviceSize = 0x40000;

/// Records every port write. Completes asynchronous writes right away by raising `IO_CMD`.
pub(crate) struct TestPort {
    writes: Mutex<Vec<(IoPort, u8)>>,
    device: Mutex<Weak<Device>>,
}

impl TestPort {
    pub fn new() -> Arc<Self> {
        Arc::new(TestPort {
            writes: Mutex::new(Vec::new()),
            device: Mutex::new(Weak::new()),
        })
    }

    pub fn writes(&self) -> Vec<(IoPort, u8)> {
        self.writes.lock().clone()
    }
}

impl PortIo for TestPort {
    fn write_port(&self, port: IoPort, value: u8) {
        self.writes.lock().push((port, value));

        if port.is_async() {
            // Not holding the lock while the device calls back into us.
            let device = self.device.lock().upgrade();

            if let Some(device) = device {
                raise(&device, InterruptReasons::IO_CMD);
            }
        }
    }
}

/// Counts deferred-work requests and records child status changes.
pub(crate) struct TestHost {
    dpcs: AtomicUsize,
    child_status: Mutex<Vec<bool>>,
}

impl TestHost {
    pub fn new() -> Arc<Self> {
        Arc::new(TestHost {
            dpcs: AtomicUsize::new(0),
            child_status: Mutex::new(Vec::new()),
        })
    }

    pub fn dpcs(&self) -> usize {
        self.dpcs.load(Ordering::Acquire)
    }

    pub fn child_status(&self) -> Vec<bool> {
        self.child_status.lock().clone()
    }
}

impl HostCallbacks for TestHost {
    fn queue_dpc(&self) -> bool {
        self.dpcs.fetch_add(1, Ordering::AcqRel);
        true
    }

    fn indicate_child_status(&self, connected: bool) {
        self.child_status.lock().push(connected);
    }
}

pub(crate) struct TestDevice {
    pub device: Arc<Device>,
    pub port: Arc<TestPort>,
    pub host: Arc<TestHost>,
}

pub(crate) fn rom_descriptor() -> RomDescriptor {
    let mode = |x_res, y_res| RomMode {
        x_res,
        y_res,
        bits: 32,
        stride: x_res * 4,
        ..Default::default()
    };

    RomDescriptor {
        id: 1,
        surface0_area_size: SURFACE0_SIZE,
        num_pages: NUM_PAGES,
        mm_clock: 4242,
        slots_start: 1,
        slots_end: 3,
        slot_gen_bits: 8,
        slot_id_bits: 4,
        slot_generation: 5,
        modes: vec![mode(800, 600), mode(1024, 768)],
    }
}

pub(crate) fn create_info(rom: &RomDescriptor) -> DeviceCreateInfo {
    DeviceCreateInfo {
        rom: rom.to_bytes(),
        ram: RegionInfo {
            phys_start: 0xf000_0000,
            local_start: 0x1000_0000,
            size: rom.surface0_area_size + rom.num_pages * PAGE_SIZE,
        },
        vram: RegionInfo {
            phys_start: 0xf800_0000,
            local_start: 0x2000_0000,
            size: VRAM_SIZE,
        },
        ..Default::default()
    }
}

pub(crate) fn create_device() -> TestDevice {
    create_device_with(&rom_descriptor(), true)
}

pub(crate) fn create_device_with(rom: &RomDescriptor, delayed_chunks: bool) -> TestDevice {
    let (port, host) = (TestPort::new(), TestHost::new());
    let device = Device::new(
        port.clone(),
        host.clone(),
        DeviceCreateInfo {
            delayed_chunks,
            ..create_info(rom)
        },
    )
    .unwrap();
    *port.device.lock() = Arc::downgrade(&device);

    TestDevice { device, port, host }
}

/// Polls `condition` for up to five seconds.
pub(crate) fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);

    while !condition() {
        if Instant::now() > deadline {
            return false;
        }

        thread::sleep(Duration::from_millis(1));
    }

    true
}

/// Raises an interrupt and runs the deferred work, as the host would.
pub(crate) fn raise(device: &Device, reasons: InterruptReasons) {
    device
        .ram_header()
        .int_pending
        .fetch_or(reasons.bits(), Ordering::AcqRel);

    if device.interrupt_occurred() {
        device.run_deferred_work();
    }
}

/// Chains `outputs` together and hands the chain back through the release ring.
pub(crate) fn release_chain(device: &Device, outputs: &[LocalAddress]) {
    for pair in outputs.windows(2) {
        device
            .memory()
            .update::<ReleaseInfo>(pair[0], |info| info.next = pair[1]);
    }

    // SAFETY: Tests are the only producer of the release ring.
    let pushed = unsafe { device.ram_header().release_ring.push(outputs[0]) };
    assert!(pushed.is_ok(), "release ring is full");
}

/// Consumes one command, as the device would.
pub(crate) fn pop_command<const N: usize>(ring: &Ring<Command, N>) -> Option<Command> {
    // SAFETY: Tests are the only consumer of the command rings.
    unsafe { ring.pop() }.map(|(command, _)| command)
}

mod device_simulation {
    use super::*;
    use crate::{
        command::{CommandKind, Rect},
        memory::allocator::PoolKind,
        PresentInfo,
    };
    use std::sync::atomic::AtomicBool;

    const PRESENTERS: usize = 4;
    const PRESENTS: usize = 10;

    /// Consumes commands and releases them in chains of up to four, until `stop` is set.
    fn run_device(device: &Device, consumed: &AtomicUsize, stop: &AtomicBool) {
        let ring = &device.ram_header().command_ring;
        let mut batch = Vec::new();
        let mut idle = 0u32;

        while !stop.load(Ordering::Acquire) {
            if let Some(command) = pop_command(ring) {
                assert_eq!(command.kind, CommandKind::Draw as u32);
                batch.push(device.translator().to_local(command.data()));
                consumed.fetch_add(1, Ordering::AcqRel);
                raise(device, InterruptReasons::DISPLAY);
                idle = 0;
            } else {
                idle += 1;

                if idle % 10 == 0 {
                    raise(device, InterruptReasons::DISPLAY);
                }

                thread::sleep(Duration::from_millis(1));
            }

            if (batch.len() == 4 || ring.is_empty() && !batch.is_empty())
                && !device.ram_header().release_ring.is_full()
            {
                release_chain(device, &batch);
                batch.clear();
            }
        }
    }

    #[test]
    fn concurrent_presents_are_all_released() {
        let TestDevice { device, .. } = create_device();
        let devram = device.free_size(PoolKind::DevRam);
        let source = vec![0x11; 16 * 16 * 4];
        let consumed = AtomicUsize::new(0);
        let stop = AtomicBool::new(false);
        let total = PRESENTERS * PRESENTS * 2;

        thread::scope(|scope| {
            scope.spawn(|| run_device(&device, &consumed, &stop));

            for _ in 0..PRESENTERS {
                scope.spawn(|| {
                    for _ in 0..PRESENTS {
                        device
                            .submit_present(&PresentInfo {
                                dirty_rects: &[Rect::new(0, 0, 8, 8), Rect::new(8, 8, 16, 16)],
                                ..PresentInfo::new(&source, 64, [16, 16])
                            })
                            .unwrap();
                    }
                });
            }

            assert!(wait_until(|| consumed.load(Ordering::Acquire) == total));
            assert!(wait_until(|| {
                device.drain_release_ring(&mut device.mem.lock());
                device.mem.lock().outputs.is_empty()
            }));

            stop.store(true, Ordering::Release);
        });

        assert_eq!(device.free_size(PoolKind::DevRam), devram);
        assert_eq!(device.free_size(PoolKind::Vram), VRAM_SIZE);

        device.shutdown();
    }
}
