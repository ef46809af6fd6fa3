// Copyright (c) 2026 The pvdisplay developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Building drawables and chunking pixel data into device memory.
//!
//! Pixel data is copied line by line into a chain of [`DataChunk`]s. The first chunk is embedded
//! in the resource that owns the data, and every following chunk is a separate VRAM block linked
//! through device addresses.
//!
//! When the caller must not block, chunks that cannot be allocated right away are staged on the
//! host as *delayed chunks* instead. The present worker later moves them to device memory, where
//! it is allowed to wait.

use crate::{
    command::{
        ClipRects, DataChunk, DrawableKind, DrawablePayload, Image, Point, Rect,
        BITMAP_ALLOC_BASE, BITS_BUF_MAX, BRUSH_SOLID, CLIP_TYPE_NONE, CLIP_TYPE_RECTS,
        DATA_CHUNK_SIZE, EFFECT_OPAQUE, ROP_PUT, SCALE_NEAREST,
    },
    device::Device,
    memory::{allocator::PoolKind, DeviceSize, LocalAddress},
    resource::{OutputKind, Resource, ResourceKind},
    DisplayError,
};
use tracing::{debug, error, warn};

const BYTES_PER_PIXEL: usize = 4;

/// Pixel data staged on the host because device memory ran out.
#[derive(Debug)]
pub(crate) struct DelayedChunk {
    data: Vec<u8>,
    capacity: usize,
}

impl DelayedChunk {
    /// Reserves `capacity` bytes on the host heap.
    pub fn with_capacity(capacity: usize) -> Result<Self, DisplayError> {
        let mut data = Vec::new();
        data.try_reserve_exact(capacity).map_err(|_| {
            error!(capacity, "cannot stage a delayed chunk");
            DisplayError::OutOfHostMemory
        })?;

        Ok(DelayedChunk { data, capacity })
    }

    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    fn remaining(&self) -> usize {
        self.capacity - self.data.len()
    }

    fn push(&mut self, bytes: &[u8]) {
        debug_assert!(bytes.len() <= self.remaining());
        self.data.extend_from_slice(bytes);
    }
}

/// The part of a drawable's pixel data that still lives on the host.
#[derive(Debug)]
pub(crate) enum Pending {
    /// The image itself could not be allocated. The chunk holds the whole bitmap.
    WholeBitmap(DelayedChunk),

    /// The image was allocated, but its chunk chain ends early. `last_real` is the last chunk
    /// that made it to device memory.
    Tail {
        last_real: LocalAddress,
        chunks: Vec<DelayedChunk>,
    },
}

/// A drawable output that is built but not yet pushed.
///
/// A drawable owns its output block until it is either pushed or discarded.
#[must_use = "a drawable must be pushed or discarded"]
#[derive(Debug)]
pub(crate) struct Drawable {
    output: LocalAddress,
    width: u32,
    height: u32,
    pending: Option<Pending>,
}

impl Drawable {
    /// Local address of the output block.
    #[inline]
    pub fn output(&self) -> LocalAddress {
        self.output
    }

    #[inline]
    pub fn has_pending_chunks(&self) -> bool {
        self.pending.is_some()
    }

    #[cfg(test)]
    pub(crate) fn pending(&self) -> Option<&Pending> {
        self.pending.as_ref()
    }
}

/// Largest multiple of `line_size` that fits in `limit` bytes, or `limit` itself when a single
/// line is larger. Lines are then split across chunks.
#[inline]
pub(crate) fn max_chunk_size(limit: DeviceSize, line_size: usize) -> usize {
    let limit = limit as usize;

    if line_size > limit {
        limit
    } else {
        limit - limit % line_size
    }
}

/// Copies bytes into a chunk chain, growing it as needed.
pub(crate) struct ChunkWriter<'a> {
    device: &'a Device,
    chunk: LocalAddress,
    now: LocalAddress,
    end: LocalAddress,
    forced: bool,
    staged: Vec<DelayedChunk>,
}

impl<'a> ChunkWriter<'a> {
    /// Starts writing at the data of the chunk at `chunk`, which may hold data up to `end`.
    ///
    /// When `forced` is false, chunks that cannot be allocated without waiting are staged on the
    /// host instead, and so is everything after them.
    pub fn new(device: &'a Device, chunk: LocalAddress, end: LocalAddress, forced: bool) -> Self {
        ChunkWriter {
            device,
            chunk,
            now: chunk + DATA_CHUNK_SIZE,
            end,
            forced,
            staged: Vec::new(),
        }
    }

    /// Appends `bytes`. A new chunk holds up to `alloc_size` bytes of data.
    pub fn put(&mut self, mut bytes: &[u8], alloc_size: usize) -> Result<(), DisplayError> {
        if alloc_size == 0 && !bytes.is_empty() {
            error!(len = bytes.len(), "no room to chunk pixel data into");
            return Err(DisplayError::InvalidParameter);
        }

        while !bytes.is_empty() {
            if let Some(staged) = self.staged.last_mut() {
                let len = staged.remaining().min(bytes.len());

                if len == 0 {
                    self.staged.push(DelayedChunk::with_capacity(alloc_size)?);
                } else {
                    staged.push(&bytes[..len]);
                    bytes = &bytes[len..];
                }

                continue;
            }

            let len = ((self.end - self.now) as usize).min(bytes.len());

            if len == 0 {
                match self.device.alloc_chunk(alloc_size, self.forced) {
                    Some(next) => {
                        self.device.link_chunks(self.chunk, next);
                        self.chunk = next;
                        self.now = next + DATA_CHUNK_SIZE;
                        self.end = self.now + alloc_size as DeviceSize;
                    }
                    None if self.forced => return Err(DisplayError::OutOfDeviceMemory),
                    None => self.staged.push(DelayedChunk::with_capacity(alloc_size)?),
                }

                continue;
            }

            let memory = &self.device.memory;
            memory.write_bytes(self.now, &bytes[..len]);
            memory.update::<DataChunk>(self.chunk, |chunk| chunk.data_size += len as u32);
            self.now += len as DeviceSize;
            bytes = &bytes[len..];
        }

        Ok(())
    }

    /// Returns the chunks that had to be staged, if any.
    pub fn finish(self) -> Option<Pending> {
        (!self.staged.is_empty()).then_some(Pending::Tail {
            last_real: self.chunk,
            chunks: self.staged,
        })
    }
}

impl Device {
    /// Allocates a chained chunk in VRAM with room for `data_size` bytes, with an empty header.
    pub(crate) fn alloc_chunk(&self, data_size: usize, forced: bool) -> Option<LocalAddress> {
        let addr = self.alloc_mem(
            PoolKind::Vram,
            DATA_CHUNK_SIZE + data_size as DeviceSize,
            forced,
        )?;
        self.memory.write(addr, &DataChunk::default());

        Some(addr)
    }

    /// Makes `next` follow `prev` in a chunk chain.
    pub(crate) fn link_chunks(&self, prev: LocalAddress, next: LocalAddress) {
        let prev_device = self.translator.to_device(prev).as_raw();
        let next_device = self.translator.to_device(next).as_raw();

        self.memory
            .update::<DataChunk>(prev, |chunk| chunk.next_chunk = next_device);
        self.memory.update::<DataChunk>(next, |chunk| {
            chunk.prev_chunk = prev_device;
            chunk.next_chunk = 0;
        });
    }

    /// Builds a drawable of `kind` covering `area`, with an optional single clip rectangle.
    ///
    /// Returns `None` if device memory could not be allocated, which only happens once the
    /// device is inactive.
    pub(crate) fn build_drawable(
        &self,
        kind: DrawableKind,
        area: &Rect,
        clip: Option<&Rect>,
    ) -> Option<Drawable> {
        let output = self.new_output(
            OutputKind::Drawable,
            size_of::<DrawablePayload>() as DeviceSize,
        )?;

        let mm_time = self.rom.mm_clock;
        self.memory
            .update::<DrawablePayload>(output, |payload| {
                payload.surface_id = 0;
                payload.kind = kind as u32;
                payload.effect = EFFECT_OPAQUE;
                payload.self_bitmap = 0;
                payload.mm_time = mm_time;
                payload.surfaces_dest = [-1; 3];
                payload.bbox = *area;
            });

        let drawable = Drawable {
            output,
            width: area.width().max(0) as u32,
            height: area.height().max(0) as u32,
            pending: None,
        };

        if !self.set_clip(&drawable, clip) {
            debug!("setting the clip failed");
            self.release_output(output);

            return None;
        }

        Some(drawable)
    }

    fn set_clip(&self, drawable: &Drawable, clip: Option<&Rect>) -> bool {
        let Some(clip) = clip else {
            self.memory
                .update::<DrawablePayload>(drawable.output, |payload| {
                    payload.clip_type = CLIP_TYPE_NONE;
                });

            return true;
        };

        let size = size_of::<ClipRects>() + size_of::<Rect>();
        let Some(addr) = self.alloc_mem(PoolKind::Vram, size as DeviceSize, true) else {
            return false;
        };

        self.memory.write(
            addr,
            &ClipRects {
                num_rects: 1,
                _pad: 0,
                chunk: DataChunk {
                    data_size: size_of::<Rect>() as u32,
                    ..Default::default()
                },
            },
        );
        self.memory
            .write(addr + size_of::<ClipRects>() as DeviceSize, clip);

        self.attach_resource(drawable.output, Resource::new(ResourceKind::ClipRects, addr));

        let data = self.translator.to_device(addr).as_raw();
        self.memory
            .update::<DrawablePayload>(drawable.output, |payload| {
                payload.clip_type = CLIP_TYPE_RECTS;
                payload.clip_data = data;
            });

        true
    }

    /// Builds a drawable that copies `area` of the primary surface from `source`.
    pub(crate) fn build_copy_bits(&self, area: &Rect, source: Point) -> Option<Drawable> {
        let drawable = self.build_drawable(DrawableKind::CopyBits, area, None)?;
        self.memory
            .update::<DrawablePayload>(drawable.output, |payload| payload.src_pos = source);

        Some(drawable)
    }

    /// Builds a drawable that fills `area` with black.
    pub(crate) fn build_fill(&self, area: &Rect) -> Option<Drawable> {
        let drawable = self.build_drawable(DrawableKind::Fill, area, None)?;
        self.memory
            .update::<DrawablePayload>(drawable.output, |payload| {
                payload.brush_kind = BRUSH_SOLID;
                payload.brush_color = 0;
                payload.rop_descriptor = ROP_PUT;
                payload.mask_bitmap = 0;
            });

        Some(drawable)
    }

    /// Builds a drawable that blits `rect` of `source`, a 32-bit image with `pitch` bytes per
    /// line. The rectangle must lie within the source.
    pub(crate) fn build_blit(
        &self,
        rect: &Rect,
        source: &[u8],
        pitch: usize,
        forced: bool,
    ) -> Result<Drawable, DisplayError> {
        let mut drawable = self
            .build_drawable(DrawableKind::Copy, rect, None)
            .ok_or(DisplayError::OutOfDeviceMemory)?;
        let (width, height) = (drawable.width, drawable.height);

        self.memory
            .update::<DrawablePayload>(drawable.output, |payload| {
                payload.scale_mode = SCALE_NEAREST;
                payload.mask_bitmap = 0;
                payload.rop_descriptor = ROP_PUT;
                payload.surfaces_dest[0] = 0;
                payload.surfaces_rects[0] = *rect;
                payload.surfaces_rects[1] = *rect;
                payload.self_bitmap = 1;
                payload.self_bitmap_area = *rect;
                payload.src_area = Rect::new(0, 0, width as i32, height as i32);
            });

        let line_size = width as usize * BYTES_PER_PIXEL;
        let left = rect.left as usize * BYTES_PER_PIXEL;
        let top = rect.top as usize;
        // Bottom-up: the first line stored is the last row of the rectangle.
        let lines = (top..top + height as usize)
            .rev()
            .map(|row| &source[row * pitch + left..][..line_size]);

        match self.attach_bitmap(&mut drawable, lines, forced) {
            Ok(()) => Ok(drawable),
            Err(err) => {
                self.discard_drawable(drawable);
                Err(err)
            }
        }
    }

    /// Allocates the image of a copy drawable and fills it with `lines`.
    ///
    /// When `forced` is false nothing here waits for the device: memory that isn't available right
    /// away is staged in delayed chunks instead. When `forced` is true, failing to allocate device
    /// memory fails the call.
    pub(crate) fn attach_bitmap<'s>(
        &self,
        drawable: &mut Drawable,
        lines: impl Iterator<Item = &'s [u8]>,
        forced: bool,
    ) -> Result<(), DisplayError> {
        let line_size = drawable.width as usize * BYTES_PER_PIXEL;
        let total = line_size * drawable.height as usize;
        let max_chunk = max_chunk_size(BITS_BUF_MAX, line_size);
        let alloc_size = (BITMAP_ALLOC_BASE as usize + total)
            .min(BITMAP_ALLOC_BASE as usize + max_chunk);

        let Some(addr) = self.alloc_mem(PoolKind::Vram, alloc_size as DeviceSize, forced) else {
            if forced {
                error!("cannot allocate the bitmap of a drawable");
                return Err(DisplayError::OutOfDeviceMemory);
            }

            let mut chunk = DelayedChunk::with_capacity(total)?;

            for line in lines {
                chunk.push(line);
            }

            drawable.pending = Some(Pending::WholeBitmap(chunk));

            return Ok(());
        };

        let chunk = addr + size_of::<Image>() as DeviceSize;
        self.memory.write(
            addr,
            &Image {
                id: Image::uncached_id(drawable.width, drawable.height, Image::FORMAT_32BIT),
                palette: 0,
                data: self.translator.to_device(chunk).as_raw(),
                kind: Image::KIND_BITMAP,
                flags: 0,
                width: drawable.width,
                height: drawable.height,
                format: Image::FORMAT_32BIT,
                bitmap_flags: 0,
                x: drawable.width,
                y: drawable.height,
                stride: line_size as u32,
                _pad: 0,
            },
        );
        self.memory.write(chunk, &DataChunk::default());

        let bitmap = self.translator.to_device(addr).as_raw();
        self.memory
            .update::<DrawablePayload>(drawable.output, |payload| payload.src_bitmap = bitmap);
        self.attach_resource(drawable.output, Resource::new(ResourceKind::Image, addr));

        let mut writer = ChunkWriter::new(self, chunk, addr + alloc_size as DeviceSize, forced);
        let mut remaining = total;

        for line in lines {
            writer.put(line, remaining.min(max_chunk))?;
            remaining -= line_size;
        }

        drawable.pending = writer.finish();

        Ok(())
    }

    /// Moves a staged chunk into a new VRAM chunk, waiting for memory if needed.
    fn make_chunk(&self, staged: &DelayedChunk) -> Option<LocalAddress> {
        let data = staged.data();
        let chunk = self.alloc_chunk(data.len(), true)?;
        self.memory
            .write_bytes(chunk + DATA_CHUNK_SIZE, data);
        self.memory
            .update::<DataChunk>(chunk, |header| header.data_size = data.len() as u32);

        Some(chunk)
    }

    /// Moves every delayed chunk of `drawable` to device memory. Returns the drawable and the
    /// number of chunks moved.
    ///
    /// On failure the drawable is released and `None` is returned. Nothing is moved at all if
    /// the device is inactive.
    pub(crate) fn resolve_delayed(&self, mut drawable: Drawable) -> Option<(Drawable, usize)> {
        let mut failed = !self.is_active();
        let mut count = 0;

        match drawable.pending.take() {
            None => {}
            Some(Pending::WholeBitmap(chunk)) => {
                let line_size = drawable.width as usize * BYTES_PER_PIXEL;

                if !failed {
                    let lines = chunk.data().chunks_exact(line_size.max(1));

                    match self.attach_bitmap(&mut drawable, lines, true) {
                        Ok(()) => count += 1,
                        Err(_) => failed = true,
                    }
                }
            }
            Some(Pending::Tail { last_real, chunks }) => {
                let mut last = last_real;

                for staged in &chunks {
                    if failed {
                        break;
                    }

                    match self.make_chunk(staged) {
                        Some(chunk) => {
                            self.link_chunks(last, chunk);
                            last = chunk;
                            count += 1;
                        }
                        None => failed = true,
                    }
                }
            }
        }

        if failed {
            warn!(
                output = format_args!("{:#x}", drawable.output),
                "dropping a drawable whose delayed chunks could not be resolved",
            );
            self.release_output(drawable.output);

            return None;
        }

        Some((drawable, count))
    }

    /// Drops the delayed chunks of a drawable that will never be pushed, and releases it.
    pub(crate) fn discard_drawable(&self, drawable: Drawable) {
        let Drawable {
            output, pending, ..
        } = drawable;
        drop(pending);
        self.release_output(output);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        tests::{create_device_with, rom_descriptor, TestDevice, VRAM_SIZE},
        DeviceAddress,
    };
    use std::{thread, time::Duration};

    /// A `width` x `height` image whose every pixel holds its row number.
    fn rows(width: usize, height: usize) -> Vec<u8> {
        (0..height)
            .flat_map(|row| std::iter::repeat_n(row as u8, width * BYTES_PER_PIXEL))
            .collect()
    }

    /// Reads the data of a chunk chain starting at the chunk at `first`.
    fn read_chain(device: &Device, first: LocalAddress) -> Vec<Vec<u8>> {
        let mut chunks = Vec::new();
        let mut addr = first;

        loop {
            let header = device.memory().read::<DataChunk>(addr);
            let mut data = vec![0; header.data_size as usize];
            device.memory().read_bytes(addr + DATA_CHUNK_SIZE, &mut data);
            chunks.push(data);

            if header.next_chunk == 0 {
                return chunks;
            }

            addr = device
                .translator()
                .to_local(DeviceAddress::from_raw(header.next_chunk));
        }
    }

    fn image_chunk(device: &Device, drawable: &Drawable) -> LocalAddress {
        let payload = device.memory().read::<DrawablePayload>(drawable.output);
        let image = device
            .translator()
            .to_local(DeviceAddress::from_raw(payload.src_bitmap));

        image + size_of::<Image>() as DeviceSize
    }

    /// Fills both pools except for `vram_left` bytes of VRAM. Returns the blocks to free later.
    fn exhaust(device: &Device, vram_left: DeviceSize) -> Vec<LocalAddress> {
        let devram = device.free_size(PoolKind::DevRam);
        let vram = device.free_size(PoolKind::Vram) - vram_left;

        [(PoolKind::DevRam, devram), (PoolKind::Vram, vram)]
            .into_iter()
            .filter(|&(_, size)| size > 0)
            .map(|(pool, size)| device.alloc_mem(pool, size, false).unwrap())
            .collect()
    }

    #[test]
    fn blit_is_stored_bottom_up() {
        let TestDevice { device, .. } = create_device_with(&rom_descriptor(), true);
        let source = rows(8, 8);
        let rect = Rect::new(2, 1, 6, 4);

        let drawable = device.build_blit(&rect, &source, 8 * 4, false).unwrap();
        assert!(!drawable.has_pending_chunks());

        let payload = device.memory().read::<DrawablePayload>(drawable.output);
        assert_eq!(payload.kind, DrawableKind::Copy as u32);
        assert_eq!(payload.bbox, rect);
        assert_eq!(payload.src_area, Rect::new(0, 0, 4, 3));
        assert_eq!(payload.surfaces_dest, [0, -1, -1]);
        assert_eq!(payload.mm_time, device.rom().mm_clock);
        assert_eq!(payload.clip_type, CLIP_TYPE_NONE);
        assert_eq!(
            payload.release_info.id,
            drawable.output,
        );

        let chunks = read_chain(&device, image_chunk(&device, &drawable));
        assert_eq!(chunks.len(), 1);
        let expected: Vec<u8> = [3u8, 2, 1]
            .iter()
            .flat_map(|&row| std::iter::repeat_n(row, 16))
            .collect();
        assert_eq!(chunks[0], expected);

        device.discard_drawable(drawable);
        assert_eq!(device.free_size(PoolKind::Vram), VRAM_SIZE);

        device.shutdown();
    }

    #[test]
    fn long_bitmaps_are_chained() {
        let TestDevice { device, .. } = create_device_with(&rom_descriptor(), true);
        // 256-byte lines, so a chunk holds exactly 256 of them.
        let (width, height) = (64, 300);
        let source = rows(width, height);
        let rect = Rect::new(0, 0, width as i32, height as i32);

        let drawable = device.build_blit(&rect, &source, width * 4, true).unwrap();
        let chunks = read_chain(&device, image_chunk(&device, &drawable));

        let sizes: Vec<_> = chunks.iter().map(Vec::len).collect();
        assert_eq!(sizes, [65536, 44 * 256]);
        assert_eq!(chunks[1][0], 43);
        assert_eq!(chunks[1][chunks[1].len() - 1], 0);

        device.discard_drawable(drawable);
        assert_eq!(device.free_size(PoolKind::Vram), VRAM_SIZE);

        device.shutdown();
    }

    #[test]
    fn whole_bitmap_is_delayed() {
        let TestDevice { device, .. } = create_device_with(&rom_descriptor(), true);
        let source = rows(4, 4);
        let rect = Rect::new(0, 0, 4, 4);

        let mut drawable = device
            .build_drawable(DrawableKind::Copy, &rect, None)
            .unwrap();
        let hogs = exhaust(&device, 0);

        let lines = (0..4).rev().map(|row| &source[row * 16..][..16]);
        device.attach_bitmap(&mut drawable, lines, false).unwrap();

        let Some(Pending::WholeBitmap(chunk)) = drawable.pending() else {
            panic!("expected the whole bitmap to be staged");
        };
        assert_eq!(chunk.data().len(), 64);
        assert_eq!(chunk.data()[0], 3);

        for hog in hogs {
            device.free_mem(hog);
        }

        let (drawable, count) = device.resolve_delayed(drawable).unwrap();
        assert_eq!(count, 1);
        assert!(!drawable.has_pending_chunks());

        let chunks = read_chain(&device, image_chunk(&device, &drawable));
        assert_eq!(chunks.concat(), rows(4, 4).into_iter().rev().collect::<Vec<_>>());

        device.discard_drawable(drawable);
        device.shutdown();
    }

    #[test]
    fn tail_is_delayed_then_resolved() {
        let TestDevice { device, .. } = create_device_with(&rom_descriptor(), true);
        let (width, height) = (64, 300);
        let source = rows(width, height);
        let rect = Rect::new(0, 0, width as i32, height as i32);

        let mut drawable = device
            .build_drawable(DrawableKind::Copy, &rect, None)
            .unwrap();
        let hogs = exhaust(&device, BITMAP_ALLOC_BASE + 65536);

        let lines = (0..height).rev().map(|row| &source[row * 256..][..256]);
        device.attach_bitmap(&mut drawable, lines, false).unwrap();

        let Some(Pending::Tail { last_real, chunks }) = drawable.pending() else {
            panic!("expected the tail to be staged");
        };
        assert_eq!(*last_real, image_chunk(&device, &drawable));
        let sizes: Vec<_> = chunks.iter().map(|chunk| chunk.data().len()).collect();
        assert_eq!(sizes, [44 * 256]);

        for hog in hogs {
            device.free_mem(hog);
        }

        let (drawable, count) = device.resolve_delayed(drawable).unwrap();
        assert_eq!(count, 1);

        let chunks = read_chain(&device, image_chunk(&device, &drawable));
        let sizes: Vec<_> = chunks.iter().map(Vec::len).collect();
        assert_eq!(sizes, [65536, 44 * 256]);
        assert_eq!(chunks[1][0], 43);

        device.discard_drawable(drawable);
        assert_eq!(device.free_size(PoolKind::Vram), VRAM_SIZE);

        device.shutdown();
    }

    #[test]
    fn lines_longer_than_a_chunk_are_split() {
        let TestDevice { device, .. } = create_device_with(&rom_descriptor(), true);
        let width = 16385;
        let source: Vec<u8> = (0..width * BYTES_PER_PIXEL).map(|i| i as u8).collect();
        let rect = Rect::new(0, 0, width as i32, 1);

        let drawable = device
            .build_blit(&rect, &source, width * BYTES_PER_PIXEL, true)
            .unwrap();
        let chunks = read_chain(&device, image_chunk(&device, &drawable));

        let sizes: Vec<_> = chunks.iter().map(Vec::len).collect();
        assert_eq!(sizes, [65536, 4]);
        assert_eq!(chunks.concat(), source);

        device.discard_drawable(drawable);
        assert_eq!(device.free_size(PoolKind::Vram), VRAM_SIZE);

        device.shutdown();
    }

    #[test]
    fn writer_needs_room() {
        let TestDevice { device, .. } = create_device_with(&rom_descriptor(), true);
        let chunk = device.alloc_chunk(0, true).unwrap();
        let mut writer = ChunkWriter::new(&device, chunk, chunk + DATA_CHUNK_SIZE, true);

        assert_eq!(writer.put(&[1, 2, 3], 0), Err(DisplayError::InvalidParameter));
        assert_eq!(writer.put(&[], 0), Ok(()));
        assert!(writer.finish().is_none());

        device.free_mem(chunk);
        device.shutdown();
    }

    #[test]
    fn failing_tail_releases_every_chunk() {
        let TestDevice { device, .. } = create_device_with(&rom_descriptor(), true);
        let devram = device.free_size(PoolKind::DevRam);
        // Three chunks of data: one in the image, two staged.
        let (width, height) = (64, 600);
        let source = rows(width, height);
        let rect = Rect::new(0, 0, width as i32, height as i32);

        let mut drawable = device
            .build_drawable(DrawableKind::Copy, &rect, None)
            .unwrap();
        let hogs = exhaust(&device, BITMAP_ALLOC_BASE + 65536);

        let lines = (0..height).rev().map(|row| &source[row * 256..][..256]);
        device.attach_bitmap(&mut drawable, lines, false).unwrap();

        let Some(Pending::Tail { chunks, .. }) = drawable.pending() else {
            panic!("expected the tail to be staged");
        };
        let sizes: Vec<_> = chunks.iter().map(|chunk| chunk.data().len()).collect();
        assert_eq!(sizes, [65536, 88 * 256]);

        for hog in hogs {
            device.free_mem(hog);
        }

        // Only the first staged chunk fits now.
        let hogs = exhaust(&device, DATA_CHUNK_SIZE + 65536);

        thread::scope(|scope| {
            let resolver = scope.spawn(|| device.resolve_delayed(drawable));

            thread::sleep(Duration::from_millis(50));
            assert!(!resolver.is_finished());
            assert_eq!(device.free_size(PoolKind::Vram), 0);

            device.set_active(false);
            assert!(resolver.join().unwrap().is_none());
        });

        for hog in hogs {
            device.free_mem(hog);
        }

        // The chunk that was moved went away with the image.
        assert_eq!(device.free_size(PoolKind::Vram), VRAM_SIZE);
        assert_eq!(device.free_size(PoolKind::DevRam), devram);
        assert!(device.mem.lock().outputs.is_empty());

        device.shutdown();
    }

    #[test]
    fn inactive_device_resolves_nothing() {
        let TestDevice { device, .. } = create_device_with(&rom_descriptor(), true);
        let devram = device.free_size(PoolKind::DevRam);
        let (width, height) = (64, 300);
        let source = rows(width, height);
        let rect = Rect::new(0, 0, width as i32, height as i32);

        let mut drawable = device
            .build_drawable(DrawableKind::Copy, &rect, None)
            .unwrap();
        let hogs = exhaust(&device, BITMAP_ALLOC_BASE + 65536);

        let lines = (0..height).rev().map(|row| &source[row * 256..][..256]);
        device.attach_bitmap(&mut drawable, lines, false).unwrap();
        assert!(drawable.has_pending_chunks());

        for hog in hogs {
            device.free_mem(hog);
        }

        device.set_active(false);
        assert!(device.resolve_delayed(drawable).is_none());

        // The image and the output are gone, and no chunk was moved.
        assert_eq!(device.free_size(PoolKind::Vram), VRAM_SIZE);
        assert_eq!(device.free_size(PoolKind::DevRam), devram);
        assert!(device.mem.lock().outputs.is_empty());

        device.shutdown();
    }

    #[test]
    fn clip_is_a_resource() {
        let TestDevice { device, .. } = create_device_with(&rom_descriptor(), true);
        let clip = Rect::new(1, 2, 3, 4);

        let drawable = device
            .build_drawable(DrawableKind::Fill, &Rect::new(0, 0, 10, 10), Some(&clip))
            .unwrap();

        let payload = device.memory().read::<DrawablePayload>(drawable.output);
        assert_eq!(payload.clip_type, CLIP_TYPE_RECTS);

        let rects = device
            .translator()
            .to_local(DeviceAddress::from_raw(payload.clip_data));
        assert_eq!(device.memory().read::<ClipRects>(rects).num_rects, 1);
        assert_eq!(
            device
                .memory()
                .read::<Rect>(rects + size_of::<ClipRects>() as DeviceSize),
            clip,
        );
        assert_eq!(
            device.mem.lock().outputs[&drawable.output].resources().len(),
            1,
        );

        device.discard_drawable(drawable);
        assert_eq!(device.free_size(PoolKind::Vram), VRAM_SIZE);

        device.shutdown();
    }

    #[test]
    fn staging_capacity_is_exact() {
        let chunk = DelayedChunk::with_capacity(100).unwrap();
        assert_eq!(chunk.remaining(), 100);
        assert_eq!(max_chunk_size(BITS_BUF_MAX, 12), 65532);
        assert_eq!(max_chunk_size(4096, 256), 4096);
        assert_eq!(max_chunk_size(4096, 8192), 4096);
        assert_eq!(max_chunk_size(BITS_BUF_MAX, 65540), 65536);
    }
}
