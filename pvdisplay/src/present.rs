// Copyright (c) 2026 The pvdisplay developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The present pipeline.
//!
//! Presents are validated and turned into drawables on the calling thread, then handed to a
//! dedicated worker thread through the present ring. The worker is the only thread that pushes
//! drawables onto the command ring. It is also the only one allowed to wait for device memory
//! while doing so, which is why drawables may still carry delayed chunks when they reach it.

use crate::{
    command::{Point, Rect},
    device::{mode::DisplayMode, Device},
    drawable::Drawable,
    ring::Ring,
    sync::Event,
    DisplayError, NonExhaustive,
};
use parking_lot::Mutex;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};
use tracing::{debug, error, warn};

/// Capacity of the present ring.
pub(crate) const PRESENT_RING_SIZE: usize = 1024;

/// How often a stopping worker is woken up while it finishes.
const STOP_POLL: Duration = Duration::from_millis(5);

/// A unit of work for the present worker.
pub(crate) enum PresentOperation {
    /// Pushes drawables built under `generation`.
    Present {
        generation: u32,
        drawables: Vec<Drawable>,
    },

    /// Pushes a fill covering the whole mode.
    BlackOut {
        generation: u32,
        drawable: Drawable,
    },

    /// Recreates the primary surface for `mode` and makes it current, then completes `done`.
    SetMode {
        mode: DisplayMode,
        done: Arc<Completion>,
    },

    /// Ends the worker.
    Stop,
}

/// Completion of an operation the poster waits for.
pub(crate) struct Completion {
    event: Event,
    applied: AtomicBool,
}

impl Completion {
    pub fn new() -> Arc<Self> {
        Arc::new(Completion {
            event: Event::new(),
            applied: AtomicBool::new(false),
        })
    }

    fn complete(&self, applied: bool) {
        self.applied.store(applied, Ordering::Release);
        self.event.set();
    }

    /// Waits for the worker. Returns `false` if the operation was dropped instead of applied.
    pub fn wait(&self) -> bool {
        self.event.wait();
        self.applied.load(Ordering::Acquire)
    }
}

/// The present ring with its producer lock and wake-up events.
pub(crate) struct PresentQueue {
    ring: Ring<PresentOperation, PRESENT_RING_SIZE>,
    post_lock: Mutex<()>,
    // Set when the worker may have work.
    present_event: Event,
    // Set when the worker made room in a full ring.
    ready_event: Event,
}

impl PresentQueue {
    pub fn new() -> Self {
        PresentQueue {
            ring: Ring::new(),
            post_lock: Mutex::new(()),
            present_event: Event::new(),
            ready_event: Event::new(),
        }
    }

    /// Queues `operation`, waiting for room if the ring is full.
    pub fn post(&self, mut operation: PresentOperation) {
        let _guard = self.post_lock.lock();

        loop {
            while self.ring.prod_wait() {
                self.ready_event.wait();
            }

            // SAFETY: `post_lock` makes this the only producer.
            match unsafe { self.ring.push(operation) } {
                Ok(notify) => {
                    if notify {
                        self.present_event.set();
                    }

                    return;
                }
                Err(rejected) => operation = rejected,
            }
        }
    }

    /// Takes the next operation, waiting for one if the ring is empty.
    ///
    /// # Safety
    ///
    /// - Only the worker thread may call this.
    unsafe fn next(&self) -> PresentOperation {
        loop {
            while self.ring.cons_wait() {
                self.present_event.wait();
            }

            // SAFETY: The caller is the only consumer.
            if let Some(operation) = unsafe { self.try_next() } {
                return operation;
            }
        }
    }

    /// Takes the next operation if there is one.
    ///
    /// # Safety
    ///
    /// - Only the worker thread may call this, or any thread once the worker has exited.
    unsafe fn try_next(&self) -> Option<PresentOperation> {
        // SAFETY: The caller is the only consumer.
        let (operation, notify) = unsafe { self.ring.pop() }?;

        if notify {
            self.ready_event.set();
        }

        Some(operation)
    }
}

/// A rectangle moved within the primary surface.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MoveRect {
    /// Top-left corner of the area to move.
    pub source: Point,
    pub destination: Rect,
}

/// How the source is rotated onto the primary surface.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Rotation {
    #[default]
    Identity,
    Rotate90,
    Rotate180,
    Rotate270,
}

/// Parameters of [`Device::submit_present`].
#[derive(Clone, Debug)]
pub struct PresentInfo<'a> {
    /// The source image, 32 bits per pixel.
    pub source: &'a [u8],

    /// Bytes per line of `source`.
    pub source_pitch: usize,

    /// Width and height of `source`, in pixels.
    pub source_extent: [u32; 2],

    /// The default value is [`Rotation::Identity`].
    pub rotation: Rotation,

    /// Areas of the primary surface to move, applied before the dirty rectangles.
    ///
    /// The default value is empty.
    pub moves: &'a [MoveRect],

    /// Areas of `source` to copy to the same position of the primary surface.
    ///
    /// The default value is empty.
    pub dirty_rects: &'a [Rect],

    pub _ne: NonExhaustive,
}

impl<'a> PresentInfo<'a> {
    /// Returns a `PresentInfo` with the specified `source`, and nothing to present yet.
    #[inline]
    pub fn new(source: &'a [u8], source_pitch: usize, source_extent: [u32; 2]) -> Self {
        PresentInfo {
            source,
            source_pitch,
            source_extent,
            rotation: Rotation::Identity,
            moves: &[],
            dirty_rects: &[],
            _ne: NonExhaustive(()),
        }
    }

    /// Extent of the primary surface area the source covers.
    fn destination_extent(&self) -> [u32; 2] {
        let [width, height] = self.source_extent;

        match self.rotation {
            Rotation::Rotate90 | Rotation::Rotate270 => [height, width],
            Rotation::Identity | Rotation::Rotate180 => [width, height],
        }
    }

    fn validate(&self) -> Result<(), DisplayError> {
        let [width, height] = self.source_extent;
        let line_size = width as usize * 4;

        if self.source_pitch < line_size {
            return Err(DisplayError::InvalidParameter);
        }

        if height > 0 {
            let required = self.source_pitch * (height as usize - 1) + line_size;

            if self.source.len() < required {
                return Err(DisplayError::InvalidBufferSize {
                    provided: self.source.len(),
                    required,
                });
            }
        }

        if !self
            .dirty_rects
            .iter()
            .all(|rect| fits(rect, self.source_extent))
        {
            return Err(DisplayError::InvalidParameter);
        }

        let extent = self.destination_extent();

        for MoveRect {
            source,
            destination,
        } in self.moves
        {
            if !fits(destination, extent) {
                return Err(DisplayError::InvalidParameter);
            }

            let moved = Rect::new(
                source.x,
                source.y,
                source.x.saturating_add(destination.width()),
                source.y.saturating_add(destination.height()),
            );

            if !fits(&moved, extent) {
                return Err(DisplayError::InvalidParameter);
            }
        }

        Ok(())
    }
}

/// Whether `rect` is non-empty and lies within `extent`.
fn fits(rect: &Rect, [width, height]: [u32; 2]) -> bool {
    rect.left >= 0
        && rect.top >= 0
        && i64::from(rect.right) <= i64::from(width)
        && i64::from(rect.bottom) <= i64::from(height)
        && !rect.is_empty()
}

impl Device {
    /// Queues the moves and dirty rectangles of `info` for presentation.
    ///
    /// The pixel data is copied before this returns, but the device may process the present
    /// later. Everything is validated before any device memory is allocated.
    pub fn submit_present(&self, info: &PresentInfo<'_>) -> Result<(), DisplayError> {
        if !self.is_worker_running() {
            return Err(DisplayError::WorkerStopped);
        }

        info.validate()?;

        let generation = self.generation();
        let forced = !self.delayed_chunks();
        let mut drawables = Vec::with_capacity(info.moves.len() + info.dirty_rects.len());

        let discard_all = |drawables: Vec<Drawable>| {
            for drawable in drawables {
                self.discard_drawable(drawable);
            }
        };

        for MoveRect {
            source,
            destination,
        } in info.moves
        {
            match self.build_copy_bits(destination, *source) {
                Some(drawable) => drawables.push(drawable),
                None => {
                    discard_all(drawables);
                    return Err(DisplayError::OutOfDeviceMemory);
                }
            }
        }

        for rect in info.dirty_rects {
            match self.build_blit(rect, info.source, info.source_pitch, forced) {
                Ok(drawable) => drawables.push(drawable),
                Err(err) => {
                    discard_all(drawables);
                    return Err(err);
                }
            }
        }

        if !drawables.is_empty() {
            self.post_to_worker(PresentOperation::Present {
                generation,
                drawables,
            })?;
        }

        Ok(())
    }

    /// Fills the current mode with black.
    pub fn black_out_screen(&self) -> Result<(), DisplayError> {
        if !self.is_worker_running() {
            return Err(DisplayError::WorkerStopped);
        }

        let generation = self.generation();
        let mode = self.current_mode();
        let area = Rect::new(0, 0, mode.width as i32, mode.height as i32);
        let drawable = self
            .build_fill(&area)
            .ok_or(DisplayError::OutOfDeviceMemory)?;

        self.post_to_worker(PresentOperation::BlackOut {
            generation,
            drawable,
        })
    }

    #[inline]
    pub(crate) fn is_worker_running(&self) -> bool {
        self.worker.lock().is_some()
    }

    /// Queues `operation` for the worker. If the worker is stopped, the operation is dropped and
    /// `WorkerStopped` is returned.
    pub(crate) fn post_to_worker(&self, operation: PresentOperation) -> Result<(), DisplayError> {
        // Held across the post, so nothing is queued behind `Stop`.
        let worker = self.worker.lock();

        if worker.is_none() {
            drop(worker);
            self.cancel_present_operation(operation);

            return Err(DisplayError::WorkerStopped);
        }

        self.present.post(operation);

        Ok(())
    }

    pub(crate) fn start_present_thread(self: &Arc<Self>) -> Result<(), DisplayError> {
        let device = self.clone();
        let handle = thread::Builder::new()
            .name("pvdisplay-present".into())
            .spawn(move || device.present_thread_routine())
            .map_err(|err| {
                error!(%err, "cannot spawn the present worker");
                DisplayError::OutOfHostMemory
            })?;

        *self.worker.lock() = Some(handle);

        Ok(())
    }

    /// Stops the worker, discarding anything it still had to present.
    pub(crate) fn stop_present_thread(&self) {
        let Some(handle) = self.worker.lock().take() else {
            return;
        };

        self.bump_generation();
        self.present.post(PresentOperation::Stop);

        while !handle.is_finished() {
            // The worker may be waiting for room in the command ring of an inactive device.
            self.display_event.set();
            thread::sleep(STOP_POLL);
        }

        if handle.join().is_err() {
            error!("the present worker panicked");
        }

        // SAFETY: The worker has exited.
        while let Some(operation) = unsafe { self.present.try_next() } {
            self.cancel_present_operation(operation);
        }
    }

    fn cancel_present_operation(&self, operation: PresentOperation) {
        match operation {
            PresentOperation::Present { drawables, .. } => {
                for drawable in drawables {
                    self.discard_drawable(drawable);
                }
            }
            PresentOperation::BlackOut { drawable, .. } => self.discard_drawable(drawable),
            PresentOperation::SetMode { done, .. } => done.complete(false),
            PresentOperation::Stop => {}
        }
    }

    fn present_thread_routine(&self) {
        debug!("present worker started");

        loop {
            // SAFETY: This is the worker thread.
            let operation = unsafe { self.present.next() };

            if matches!(operation, PresentOperation::Stop) {
                break;
            }

            self.run_present_operation(operation);
        }

        debug!("present worker stopped");
    }

    fn run_present_operation(&self, operation: PresentOperation) {
        match operation {
            PresentOperation::Present {
                generation,
                drawables,
            } => {
                let mut delayed = 0;

                for drawable in drawables {
                    if let Some((drawable, count)) = self.resolve_delayed(drawable) {
                        delayed += count;
                        self.push_or_discard(generation, drawable);
                    }
                }

                if delayed > 0 {
                    warn!(delayed, "resolved delayed chunks");
                }
            }
            PresentOperation::BlackOut {
                generation,
                drawable,
            } => self.push_or_discard(generation, drawable),
            PresentOperation::SetMode { mode, done } => {
                self.destroy_primary_surface();
                self.create_primary_surface(&mode);
                self.modes.lock().set_current(mode.index);
                done.complete(true);
            }
            PresentOperation::Stop => {}
        }
    }

    fn push_or_discard(&self, generation: u32, drawable: Drawable) {
        let current = self.generation();

        if generation == current {
            self.push_drawable(drawable);
        } else {
            debug!(generation, current, "discarding a stale drawable");
            self.discard_drawable(drawable);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        command::{DataChunk, DrawableKind, DrawablePayload, Image, DATA_CHUNK_SIZE},
        memory::{allocator::PoolKind, DeviceSize},
        tests::{
            create_device, create_device_with, pop_command, rom_descriptor, wait_until, TestDevice,
        },
        DeviceAddress,
    };

    /// A 16x16 source whose every pixel holds its row number.
    fn source() -> Vec<u8> {
        (0..16u8)
            .flat_map(|row| std::iter::repeat_n(row, 64))
            .collect()
    }

    fn next_drawable(device: &Device) -> DrawablePayload {
        let ring = &device.ram_header().command_ring;
        assert!(wait_until(|| !ring.is_empty()));
        let command = pop_command(ring).unwrap();

        device
            .memory()
            .read(device.translator().to_local(command.data()))
    }

    #[test]
    fn stale_presents_are_discarded() {
        let TestDevice { device, .. } = create_device();
        let source = source();
        let ring = &device.ram_header().command_ring;

        // The device sleeps on an empty ring, so the first push notifies it, and the worker
        // stalls on the I/O lock right after publishing.
        assert!(ring.cons_wait());
        let io = device.io_lock.lock();

        device
            .submit_present(&PresentInfo {
                dirty_rects: &[Rect::new(0, 0, 4, 4)],
                ..PresentInfo::new(&source, 64, [16, 16])
            })
            .unwrap();
        assert!(wait_until(|| ring.len() == 1));

        device
            .submit_present(&PresentInfo {
                dirty_rects: &[
                    Rect::new(0, 0, 8, 8),
                    Rect::new(8, 0, 16, 8),
                    Rect::new(0, 8, 16, 16),
                ],
                ..PresentInfo::new(&source, 64, [16, 16])
            })
            .unwrap();
        assert_eq!(device.mem.lock().outputs.len(), 4);

        device.bump_generation();
        drop(io);

        // Only the drawable published before the bump is left.
        assert!(wait_until(|| device.mem.lock().outputs.len() == 1));
        assert_eq!(ring.produced(), 1);

        device.shutdown();
    }

    #[test]
    fn late_operations_are_cancelled() {
        let TestDevice { device, .. } = create_device();
        let devram = device.free_size(PoolKind::DevRam);
        let drawable = device.build_fill(&Rect::new(0, 0, 8, 8)).unwrap();

        device.stop_present_thread();

        assert_eq!(
            device.post_to_worker(PresentOperation::BlackOut {
                generation: device.generation(),
                drawable,
            }),
            Err(DisplayError::WorkerStopped),
        );
        assert!(device.mem.lock().outputs.is_empty());
        assert_eq!(device.free_size(PoolKind::DevRam), devram);

        let done = Completion::new();
        assert_eq!(
            device.post_to_worker(PresentOperation::SetMode {
                mode: device.current_mode(),
                done: done.clone(),
            }),
            Err(DisplayError::WorkerStopped),
        );
        assert!(!done.wait());

        device.shutdown();
    }

    #[test]
    fn dirty_rect_reaches_the_device() {
        let TestDevice { device, .. } = create_device();
        let source = source();

        device
            .submit_present(&PresentInfo {
                dirty_rects: &[Rect::new(2, 4, 6, 7)],
                ..PresentInfo::new(&source, 64, [16, 16])
            })
            .unwrap();

        let payload = next_drawable(&device);
        assert_eq!(payload.kind, DrawableKind::Copy as u32);
        assert_eq!(payload.bbox, Rect::new(2, 4, 6, 7));

        let image = device
            .translator()
            .to_local(DeviceAddress::from_raw(payload.src_bitmap));
        let chunk = image + size_of::<Image>() as DeviceSize;
        let header = device.memory().read::<DataChunk>(chunk);
        assert_eq!(header.data_size, 48);

        let mut data = vec![0; 48];
        device
            .memory()
            .read_bytes(chunk + DATA_CHUNK_SIZE, &mut data);
        assert_eq!(data[..16], [6; 16]);
        assert_eq!(data[16..32], [5; 16]);
        assert_eq!(data[32..], [4; 16]);

        device.shutdown();
    }

    #[test]
    fn moves_come_first() {
        let TestDevice { device, .. } = create_device();
        let source = source();

        device
            .submit_present(&PresentInfo {
                moves: &[MoveRect {
                    source: Point { x: 0, y: 8 },
                    destination: Rect::new(0, 0, 16, 8),
                }],
                dirty_rects: &[Rect::new(0, 8, 16, 16)],
                ..PresentInfo::new(&source, 64, [16, 16])
            })
            .unwrap();

        let payload = next_drawable(&device);
        assert_eq!(payload.kind, DrawableKind::CopyBits as u32);
        assert_eq!(payload.src_pos, Point { x: 0, y: 8 });
        assert_eq!(payload.bbox, Rect::new(0, 0, 16, 8));

        let payload = next_drawable(&device);
        assert_eq!(payload.kind, DrawableKind::Copy as u32);

        device.shutdown();
    }

    #[test]
    fn rejects_rects_outside_the_source() {
        let TestDevice { device, .. } = create_device();
        let devram = device.free_size(PoolKind::DevRam);
        let source = source();

        for dirty_rects in [
            &[Rect::new(0, 0, 17, 4)][..],
            &[Rect::new(-1, 0, 4, 4)],
            &[Rect::new(4, 4, 4, 8)],
            &[Rect::new(0, 0, 4, 4), Rect::new(0, 12, 4, 20)],
        ] {
            assert_eq!(
                device.submit_present(&PresentInfo {
                    dirty_rects,
                    ..PresentInfo::new(&source, 64, [16, 16])
                }),
                Err(DisplayError::InvalidParameter),
            );
        }

        assert_eq!(
            device.submit_present(&PresentInfo {
                moves: &[MoveRect {
                    source: Point { x: 10, y: 0 },
                    destination: Rect::new(0, 0, 8, 8),
                }],
                ..PresentInfo::new(&source, 64, [16, 16])
            }),
            Err(DisplayError::InvalidParameter),
        );

        assert_eq!(
            device.submit_present(&PresentInfo::new(&source[..100], 64, [16, 16])),
            Err(DisplayError::InvalidBufferSize {
                provided: 100,
                required: 1024,
            }),
        );

        assert_eq!(device.free_size(PoolKind::DevRam), devram);
        assert_eq!(device.ram_header().command_ring.produced(), 0);

        device.shutdown();
    }

    #[test]
    fn rotation_swaps_the_destination() {
        let source = vec![0; 8 * 4 * 4];
        let info = PresentInfo {
            rotation: Rotation::Rotate90,
            moves: &[MoveRect {
                source: Point { x: 0, y: 0 },
                destination: Rect::new(0, 4, 4, 8),
            }],
            ..PresentInfo::new(&source, 32, [8, 4])
        };

        assert_eq!(info.destination_extent(), [4, 8]);
        assert_eq!(info.validate(), Ok(()));
        assert_eq!(
            PresentInfo {
                rotation: Rotation::Identity,
                ..info
            }
            .validate(),
            Err(DisplayError::InvalidParameter),
        );
    }

    #[test]
    fn black_out_covers_the_mode() {
        let TestDevice { device, .. } = create_device_with(&rom_descriptor(), false);

        device.black_out_screen().unwrap();

        let payload = next_drawable(&device);
        assert_eq!(payload.kind, DrawableKind::Fill as u32);
        assert_eq!(payload.bbox, Rect::new(0, 0, 1024, 768));
        assert_eq!(payload.brush_color, 0);

        device.shutdown();
        assert_eq!(device.black_out_screen(), Err(DisplayError::WorkerStopped));
    }
}
