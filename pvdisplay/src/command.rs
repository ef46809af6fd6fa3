// Copyright (c) 2026 The pvdisplay developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Layout of the payloads the driver writes into device memory.
//!
//! Every structure here is `#[repr(C)]` plain old data, written at native endianness. Pointers
//! stored inside a payload are raw [`DeviceAddress`](crate::DeviceAddress) values, never local
//! addresses.

use crate::memory::{slot::DeviceAddress, DeviceSize, PAGE_SIZE};
use bytemuck::{Pod, Zeroable};

/// Largest amount of pixel data a single bitmap chunk holds.
pub const BITS_BUF_MAX: DeviceSize = 64 * 1024;

/// Size of the image header and the embedded first chunk header.
pub const BITMAP_ALLOC_BASE: DeviceSize =
    size_of::<Image>() as DeviceSize + size_of::<DataChunk>() as DeviceSize;

/// Size of the block holding a cursor shape and its first chunk.
pub const CURSOR_ALLOC_SIZE: DeviceSize = PAGE_SIZE << 1;

/// A rectangle in surface coordinates. `right` and `bottom` are exclusive.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Pod, Zeroable)]
#[repr(C)]
pub struct Rect {
    pub top: i32,
    pub left: i32,
    pub bottom: i32,
    pub right: i32,
}

impl Rect {
    #[inline]
    pub const fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Rect {
            top,
            left,
            bottom,
            right,
        }
    }

    #[inline]
    pub const fn width(&self) -> i32 {
        self.right - self.left
    }

    #[inline]
    pub const fn height(&self) -> i32 {
        self.bottom - self.top
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.width() <= 0 || self.height() <= 0
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Pod, Zeroable)]
#[repr(C)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

/// Header of every command payload. `id` is the local address of the payload, `next` is written
/// by the device to chain released outputs behind a single release-ring entry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct ReleaseInfo {
    pub id: u64,
    pub next: u64,
}

/// Header of a block of payload data. The data follows the header directly.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct DataChunk {
    pub prev_chunk: u64,
    pub next_chunk: u64,
    pub data_size: u32,
    pub _pad: u32,
}

pub(crate) const DATA_CHUNK_SIZE: DeviceSize = size_of::<DataChunk>() as DeviceSize;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct ClipRects {
    pub num_rects: u32,
    pub _pad: u32,
    pub chunk: DataChunk,
}

/// Bitmap descriptor. The first data chunk is placed right after it in the same block.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct Image {
    pub id: u64,
    pub palette: u64,
    pub data: u64,
    pub kind: u32,
    pub flags: u32,
    pub width: u32,
    pub height: u32,
    pub format: u32,
    pub bitmap_flags: u32,
    pub x: u32,
    pub y: u32,
    pub stride: u32,
    pub _pad: u32,
}

impl Image {
    pub const KIND_BITMAP: u32 = 0;
    pub const FORMAT_32BIT: u32 = 8;
    pub const BITMAP_DIRECT: u32 = 1 << 2;
    pub const BITMAP_UNSTABLE: u32 = 1 << 1;

    /// Identifier telling the device not to cache the image.
    pub const fn uncached_id(width: u32, height: u32, format: u32) -> u64 {
        const GROUP_DRIVER_DONT_CACHE: u64 = 1;

        let info = (width & 0x1fff) | ((height & 0x1fff) << 13) | (format << 26);

        ((GROUP_DRIVER_DONT_CACHE << 30) | info as u64) << 32
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum DrawableKind {
    Fill = 1,
    Copy = 3,
    CopyBits = 4,
}

pub const EFFECT_OPAQUE: u32 = 1;
pub const CLIP_TYPE_NONE: u32 = 0;
pub const CLIP_TYPE_RECTS: u32 = 1;
pub const ROP_PUT: u32 = 1 << 3;
pub const SCALE_NEAREST: u32 = 1;
pub const BRUSH_SOLID: u32 = 1;

/// The command payload describing one drawing operation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct DrawablePayload {
    pub release_info: ReleaseInfo,
    pub clip_data: u64,
    pub src_bitmap: u64,
    pub mask_bitmap: u64,
    pub surface_id: u32,
    pub kind: u32,
    pub effect: u32,
    pub self_bitmap: u32,
    pub mm_time: u32,
    pub clip_type: u32,
    pub rop_descriptor: u32,
    pub scale_mode: u32,
    pub brush_kind: u32,
    pub brush_color: u32,
    pub surfaces_dest: [i32; 3],
    pub src_pos: Point,
    pub _pad: u32,
    pub bbox: Rect,
    pub self_bitmap_area: Rect,
    pub src_area: Rect,
    pub surfaces_rects: [Rect; 3],
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum CursorCommandKind {
    Set = 0,
    Move = 1,
    Hide = 2,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct CursorCommandPayload {
    pub release_info: ReleaseInfo,
    pub shape: u64,
    pub kind: u32,
    pub visible: u32,
    pub x: i32,
    pub y: i32,
}

/// Header of a cursor shape. The shape's first chunk is embedded at the end.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct CursorShape {
    pub unique: u64,
    pub kind: u16,
    pub width: u16,
    pub height: u16,
    pub hot_spot_x: u16,
    pub hot_spot_y: u16,
    pub _pad: u16,
    pub data_size: u32,
    pub chunk: DataChunk,
}

impl CursorShape {
    pub const KIND_ALPHA: u16 = 0;
    pub const KIND_MONO: u16 = 1;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct MonitorsConfig {
    pub count: u16,
    pub max_allowed: u16,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct Head {
    pub id: u32,
    pub surface_id: u32,
    pub width: u32,
    pub height: u32,
    pub x: u32,
    pub y: u32,
    pub flags: u32,
}

pub(crate) const MONITORS_CONFIG_SIZE: DeviceSize =
    (size_of::<MonitorsConfig>() + size_of::<Head>()) as DeviceSize;

/// Payload of the custom display escape.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct CustomDisplay {
    pub xres: u32,
    pub yres: u32,
    pub bpp: u32,
}

/// Parameters of the primary surface, read by the device on `CREATE_PRIMARY`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct SurfaceCreate {
    pub format: u32,
    pub width: u32,
    pub height: u32,
    pub stride: i32,
    pub position: u32,
    pub mouse_mode: u32,
    pub flags: u32,
    pub kind: u32,
    pub mem: u64,
}

impl SurfaceCreate {
    pub const KIND_PRIMARY: u32 = 0;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum CommandKind {
    Draw = 1,
    Cursor = 3,
}

/// An entry of the command and cursor rings.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct Command {
    pub data: u64,
    pub kind: u32,
    pub _pad: u32,
}

impl Command {
    #[inline]
    pub fn new(kind: CommandKind, data: DeviceAddress) -> Self {
        Command {
            data: data.as_raw(),
            kind: kind as u32,
            _pad: 0,
        }
    }

    #[inline]
    pub fn data(&self) -> DeviceAddress {
        DeviceAddress::from_raw(self.data)
    }
}
