// Copyright (c) 2026 The pvdisplay developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The device ROM: memory layout parameters and the list of modes.

use crate::memory::DeviceSize;
use bytemuck::{Pod, Zeroable};
use std::{
    error::Error,
    fmt::{self, Display},
};

/// `"QXRO"` in little endian.
pub const ROM_MAGIC: u32 = 0x4f52_5851;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
struct RawHeader {
    magic: u32,
    id: u32,
    modes_offset: u32,
    surface0_area_size: u32,
    num_pages: u32,
    mm_clock: u32,
    slots_start: u8,
    slots_end: u8,
    slot_gen_bits: u8,
    slot_id_bits: u8,
    slot_generation: u8,
    _pad: [u8; 3],
}

/// A mode as listed in the ROM.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct RomMode {
    pub id: u32,
    pub x_res: u32,
    pub y_res: u32,
    pub bits: u32,
    pub stride: u32,
    pub x_mili: u32,
    pub y_mili: u32,
    pub orientation: u32,
}

/// The parsed contents of the ROM.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RomDescriptor {
    pub id: u32,
    /// Size of the primary surface at the start of the RAM bar.
    pub surface0_area_size: DeviceSize,
    /// Number of pages of DEVRAM following the primary surface.
    pub num_pages: DeviceSize,
    /// The device clock, stamped on every drawable.
    pub mm_clock: u32,
    pub slots_start: u8,
    pub slots_end: u8,
    pub slot_gen_bits: u8,
    pub slot_id_bits: u8,
    pub slot_generation: u8,
    pub modes: Vec<RomMode>,
}

impl RomDescriptor {
    /// Parses the ROM, checking every offset against the length of `bytes`.
    pub fn parse(bytes: &[u8]) -> Result<Self, RomError> {
        let header: RawHeader = bytes
            .get(..size_of::<RawHeader>())
            .map(bytemuck::pod_read_unaligned)
            .ok_or(RomError::Truncated)?;

        if header.magic != ROM_MAGIC {
            return Err(RomError::BadMagic {
                found: header.magic,
            });
        }

        let modes_offset = header.modes_offset as usize;
        let count: u32 = modes_offset
            .checked_add(size_of::<u32>())
            .and_then(|end| bytes.get(modes_offset..end))
            .map(bytemuck::pod_read_unaligned)
            .ok_or(RomError::ModesOutOfBounds)?;
        let modes = (count as usize)
            .checked_mul(size_of::<RomMode>())
            .and_then(|len| {
                let start = modes_offset + size_of::<u32>();
                bytes.get(start..start.checked_add(len)?)
            })
            .ok_or(RomError::ModesOutOfBounds)?
            .chunks_exact(size_of::<RomMode>())
            .map(bytemuck::pod_read_unaligned)
            .collect();

        Ok(RomDescriptor {
            id: header.id,
            surface0_area_size: header.surface0_area_size.into(),
            num_pages: header.num_pages.into(),
            mm_clock: header.mm_clock,
            slots_start: header.slots_start,
            slots_end: header.slots_end,
            slot_gen_bits: header.slot_gen_bits,
            slot_id_bits: header.slot_id_bits,
            slot_generation: header.slot_generation,
            modes,
        })
    }

    /// Serializes the descriptor in the layout [`parse`](Self::parse) reads, with the mode list
    /// right after the header. Sizes that don't fit the ROM's 32-bit fields are truncated.
    pub fn to_bytes(&self) -> Vec<u8> {
        let header = RawHeader {
            magic: ROM_MAGIC,
            id: self.id,
            modes_offset: size_of::<RawHeader>() as u32,
            surface0_area_size: self.surface0_area_size as u32,
            num_pages: self.num_pages as u32,
            mm_clock: self.mm_clock,
            slots_start: self.slots_start,
            slots_end: self.slots_end,
            slot_gen_bits: self.slot_gen_bits,
            slot_id_bits: self.slot_id_bits,
            slot_generation: self.slot_generation,
            _pad: [0; 3],
        };

        let mut bytes = bytemuck::bytes_of(&header).to_vec();
        bytes.extend_from_slice(&(self.modes.len() as u32).to_ne_bytes());
        bytes.extend_from_slice(bytemuck::cast_slice(&self.modes[..]));

        bytes
    }
}

/// Error that can happen when parsing the ROM.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RomError {
    /// The ROM is shorter than its header.
    Truncated,

    /// The ROM does not start with the expected signature.
    BadMagic { found: u32 },

    /// The mode list extends past the end of the ROM.
    ModesOutOfBounds,

    /// The slot bit widths leave no room for an offset, or the slots don't fit them.
    InvalidSlotLayout,
}

impl Error for RomError {}

impl Display for RomError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated => write!(f, "the ROM is shorter than its header"),
            Self::BadMagic { found } => write!(
                f,
                "the ROM signature is {:#010x} instead of {:#010x}",
                found, ROM_MAGIC,
            ),
            Self::ModesOutOfBounds => write!(f, "the mode list extends past the end of the ROM"),
            Self::InvalidSlotLayout => write!(f, "the memory slot layout is invalid"),
        }
    }
}
