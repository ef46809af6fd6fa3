// Copyright (c) 2026 The pvdisplay developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Cursor shape and position.
//!
//! Cursor commands don't go through the present worker. They are built and pushed onto the cursor
//! ring on the calling thread.

use super::Device;
use crate::{
    command::{
        CursorCommandKind, CursorCommandPayload, CursorShape, BITS_BUF_MAX, CURSOR_ALLOC_SIZE,
    },
    drawable::{max_chunk_size, ChunkWriter},
    memory::{allocator::PoolKind, DeviceSize, PAGE_SIZE},
    resource::{OutputKind, Resource, ResourceKind},
    DisplayError,
};
use tracing::{error, trace};

/// The pixel layout of a cursor shape.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CursorKind {
    /// Two 1-bit images, the AND mask followed by the XOR mask, each `height` lines high.
    Monochrome,

    /// A 32-bit image with alpha.
    Color,
}

impl CursorKind {
    fn line_size(self, width: u32) -> usize {
        match self {
            CursorKind::Monochrome => width.next_multiple_of(8) as usize / 8,
            CursorKind::Color => width as usize * 4,
        }
    }

    fn image_count(self) -> usize {
        match self {
            CursorKind::Monochrome => 2,
            CursorKind::Color => 1,
        }
    }

    fn shape_kind(self) -> u16 {
        match self {
            CursorKind::Monochrome => CursorShape::KIND_MONO,
            CursorKind::Color => CursorShape::KIND_ALPHA,
        }
    }
}

/// A cursor shape as handed over by the host.
#[derive(Clone, Copy, Debug)]
pub struct CursorShapeInfo<'a> {
    /// The pixels, `pitch` bytes per line.
    pub pixels: &'a [u8],
    pub width: u32,
    pub height: u32,
    pub hot_spot: [u32; 2],
    pub pitch: usize,
    pub kind: CursorKind,
}

impl CursorShapeInfo<'_> {
    fn validate(&self) -> Result<(), DisplayError> {
        let max = u32::from(u16::MAX);

        if self.width == 0
            || self.height == 0
            || self.width > max
            || self.height > max
            || self.hot_spot.iter().any(|&coord| coord > max)
            || self.pitch < self.kind.line_size(self.width)
        {
            return Err(DisplayError::InvalidParameter);
        }

        let rows = self.height as usize * self.kind.image_count();
        let required = self.pitch * (rows - 1) + self.kind.line_size(self.width);

        if self.pixels.len() < required {
            return Err(DisplayError::InvalidBufferSize {
                provided: self.pixels.len(),
                required,
            });
        }

        Ok(())
    }
}

const PAYLOAD_SIZE: DeviceSize = size_of::<CursorCommandPayload>() as DeviceSize;

impl Device {
    /// Replaces the cursor shape. The cursor is shown at the origin until it is moved.
    pub fn set_cursor_shape(&self, shape: &CursorShapeInfo<'_>) -> Result<(), DisplayError> {
        shape.validate()?;

        let output = self
            .new_output(OutputKind::Cursor, PAYLOAD_SIZE)
            .ok_or(DisplayError::OutOfDeviceMemory)?;

        let Some(addr) = self.alloc_mem(PoolKind::Vram, CURSOR_ALLOC_SIZE, true) else {
            error!("cannot allocate the cursor shape");
            self.release_output(output);

            return Err(DisplayError::OutOfDeviceMemory);
        };

        let line_size = shape.kind.line_size(shape.width);
        let rows = shape.height as usize * shape.kind.image_count();

        self.memory.write(
            addr,
            &CursorShape {
                unique: 0,
                kind: shape.kind.shape_kind(),
                width: shape.width as u16,
                height: shape.height as u16,
                hot_spot_x: shape.hot_spot[0] as u16,
                hot_spot_y: shape.hot_spot[1] as u16,
                _pad: 0,
                data_size: (line_size * rows) as u32,
                chunk: Default::default(),
            },
        );
        self.attach_resource(output, Resource::new(ResourceKind::Cursor, addr));

        let mut writer = ChunkWriter::new(
            self,
            addr + ResourceKind::Cursor.chunk_offset(),
            addr + CURSOR_ALLOC_SIZE,
            true,
        );
        let alloc_size = (PAGE_SIZE as usize).min(max_chunk_size(BITS_BUF_MAX, line_size));

        for line in shape.pixels.chunks(shape.pitch).take(rows) {
            if let Err(err) = writer.put(&line[..line_size], alloc_size) {
                error!("cannot allocate the rest of the cursor shape");
                self.release_output(output);

                return Err(err);
            }
        }

        let shape_addr = self.translator.to_device(addr).as_raw();
        self.memory
            .update::<CursorCommandPayload>(output, |payload| {
                payload.kind = CursorCommandKind::Set as u32;
                payload.visible = 1;
                payload.x = 0;
                payload.y = 0;
                payload.shape = shape_addr;
            });

        trace!(width = shape.width, height = shape.height, kind = ?shape.kind, "cursor shape set");
        self.push_cursor_command(output);

        Ok(())
    }

    /// Moves the cursor, or hides it if `visible` is false or `x` is negative.
    pub fn set_cursor_position(&self, x: i32, y: i32, visible: bool) -> Result<(), DisplayError> {
        let output = self
            .new_output(OutputKind::Cursor, PAYLOAD_SIZE)
            .ok_or(DisplayError::OutOfDeviceMemory)?;

        self.memory
            .update::<CursorCommandPayload>(output, |payload| {
                if x < 0 || !visible {
                    payload.kind = CursorCommandKind::Hide as u32;
                } else {
                    payload.kind = CursorCommandKind::Move as u32;
                    payload.x = x;
                    payload.y = y;
                }
            });

        self.push_cursor_command(output);

        Ok(())
    }
}
