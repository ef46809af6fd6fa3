// Copyright (c) 2026 The pvdisplay developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Translation between local and device addresses.
//!
//! The device does not know where the driver mapped its memory bars. Instead, the driver registers
//! *memory slots* with it, and every pointer written into device memory is expressed relative to
//! one of them. A device address packs three fields, from the most significant bit down:
//!
//! - the slot id, `slot_id_bits` wide,
//! - the slot generation, `slot_gen_bits` wide,
//! - the offset from the start of the slot.
//!
//! The widths come from the ROM.

use super::{DeviceSize, LocalAddress};
use bytemuck::{Pod, Zeroable};

/// Bit widths of the fields of a [`DeviceAddress`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SlotLayout {
    id_bits: u8,
    gen_bits: u8,
}

impl SlotLayout {
    /// Returns `None` unless `1 <= id_bits <= 8`, `gen_bits <= 8`, and some bits remain for the
    /// offset.
    pub const fn new(id_bits: u8, gen_bits: u8) -> Option<Self> {
        if id_bits == 0 || id_bits > 8 || gen_bits > 8 {
            return None;
        }

        Some(SlotLayout { id_bits, gen_bits })
    }

    #[inline]
    pub const fn id_bits(self) -> u32 {
        self.id_bits as u32
    }

    #[inline]
    pub const fn gen_bits(self) -> u32 {
        self.gen_bits as u32
    }

    #[inline]
    pub const fn offset_bits(self) -> u32 {
        64 - self.id_bits() - self.gen_bits()
    }

    /// Mask selecting the offset field.
    #[inline]
    pub const fn offset_mask(self) -> u64 {
        !0 >> (self.id_bits() + self.gen_bits())
    }
}

/// An address as seen by the device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Pod, Zeroable)]
#[repr(transparent)]
pub struct DeviceAddress(u64);

impl DeviceAddress {
    pub const NULL: Self = DeviceAddress(0);

    /// Packs the fields of a device address.
    ///
    /// Returns `None` if any field does not fit in the width `layout` gives it.
    pub const fn new(layout: SlotLayout, slot_id: u8, generation: u8, offset: u64) -> Option<Self> {
        if (slot_id as u64) >> layout.id_bits() != 0
            || (generation as u64) >> layout.gen_bits() != 0
            || offset & !layout.offset_mask() != 0
        {
            return None;
        }

        let high = ((slot_id as u64) << layout.gen_bits()) | generation as u64;

        Some(DeviceAddress((high << layout.offset_bits()) | offset))
    }

    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        DeviceAddress(raw)
    }

    #[inline]
    pub const fn as_raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn slot_id(self, layout: SlotLayout) -> u8 {
        (self.0 >> (64 - layout.id_bits())) as u8
    }

    #[inline]
    pub const fn generation(self, layout: SlotLayout) -> u8 {
        ((self.0 >> layout.offset_bits()) & ((1 << layout.gen_bits()) - 1)) as u8
    }

    #[inline]
    pub const fn offset(self, layout: SlotLayout) -> u64 {
        self.0 & layout.offset_mask()
    }
}

/// A window of local memory registered with the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemorySlot {
    pub start_phys: u64,
    pub end_phys: u64,
    pub start_virt: LocalAddress,
    pub last_virt: LocalAddress,
    pub high_bits: DeviceAddress,
}

impl MemorySlot {
    /// Returns `None` if `slot_id` or `generation` do not fit the layout, or if the slot is larger
    /// than the offset field can address.
    pub fn new(
        layout: SlotLayout,
        slot_id: u8,
        generation: u8,
        phys_start: u64,
        local_start: LocalAddress,
        size: DeviceSize,
    ) -> Option<Self> {
        if size == 0 || size - 1 > layout.offset_mask() {
            return None;
        }

        Some(MemorySlot {
            start_phys: phys_start,
            end_phys: phys_start + size,
            start_virt: local_start,
            last_virt: local_start + size - 1,
            high_bits: DeviceAddress::new(layout, slot_id, generation, 0)?,
        })
    }
}

/// Converts between local and device addresses using the two registered slots.
///
/// Slot 0 covers the RAM bar and slot 1 covers the VRAM bar. Neither direction checks bounds:
/// callers only translate addresses they allocated or that the device handed back.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AddressTranslator {
    layout: SlotLayout,
    slots_start: u8,
    slots: [MemorySlot; 2],
}

impl AddressTranslator {
    pub fn new(layout: SlotLayout, slots_start: u8, slots: [MemorySlot; 2]) -> Self {
        AddressTranslator {
            layout,
            slots_start,
            slots,
        }
    }

    #[inline]
    pub fn layout(&self) -> SlotLayout {
        self.layout
    }

    #[inline]
    pub fn slots(&self) -> &[MemorySlot; 2] {
        &self.slots
    }

    pub fn to_device(&self, addr: LocalAddress) -> DeviceAddress {
        let main = &self.slots[0];
        let slot = if addr < main.start_virt || addr > main.last_virt {
            &self.slots[1]
        } else {
            main
        };

        DeviceAddress(slot.high_bits.0 | addr.wrapping_sub(slot.start_virt))
    }

    pub fn to_local(&self, addr: DeviceAddress) -> LocalAddress {
        let slot_id = addr.slot_id(self.layout).wrapping_sub(self.slots_start);
        let slot = &self.slots[usize::from(slot_id & 1)];

        slot.start_virt + addr.offset(self.layout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const RAM_START: LocalAddress = 0x7f00_0000_0000;
    const RAM_SIZE: DeviceSize = 0x0100_0000;
    const VRAM_START: LocalAddress = 0x7e00_0000_0000;
    const VRAM_SIZE: DeviceSize = 0x0400_0000;

    fn translator(id_bits: u8, gen_bits: u8, slots_start: u8, generation: u8) -> AddressTranslator {
        let layout = SlotLayout::new(id_bits, gen_bits).unwrap();
        let main =
            MemorySlot::new(layout, slots_start, generation, 0xf000_0000, RAM_START, RAM_SIZE)
                .unwrap();
        let surface = MemorySlot::new(
            layout,
            slots_start + 1,
            generation,
            0xe000_0000,
            VRAM_START,
            VRAM_SIZE,
        )
        .unwrap();

        AddressTranslator::new(layout, slots_start, [main, surface])
    }

    #[test]
    fn rejects_wide_fields() {
        let layout = SlotLayout::new(1, 8).unwrap();
        assert!(DeviceAddress::new(layout, 2, 0, 0).is_none());
        assert!(DeviceAddress::new(layout, 1, 255, 0).is_some());
        assert!(DeviceAddress::new(layout, 0, 0, 1 << 55).is_none());
        assert!(SlotLayout::new(0, 8).is_none());
        assert!(SlotLayout::new(9, 0).is_none());
    }

    #[test]
    fn high_bits_layout() {
        let translator = translator(2, 8, 1, 3);
        assert_eq!(
            translator.slots()[0].high_bits.as_raw(),
            (1 << 62) | (3 << 54),
        );

        let translator = self::translator(4, 4, 1, 1);
        assert_eq!(
            translator.slots()[1].high_bits.as_raw(),
            (2 << 60) | (1 << 56),
        );
        assert!(MemorySlot::new(SlotLayout::new(1, 8).unwrap(), 2, 0, 0, RAM_START, 16).is_none());
    }

    #[test]
    fn picks_the_surface_slot_outside_ram() {
        let translator = translator(4, 4, 1, 1);
        let layout = translator.layout();
        let addr = translator.to_device(VRAM_START + 0x40);
        assert_eq!(addr.slot_id(layout), 2);
        assert_eq!(addr.generation(layout), 1);
        assert_eq!(addr.offset(layout), 0x40);

        let addr = translator.to_device(RAM_START + RAM_SIZE - 1);
        assert_eq!(addr.slot_id(layout), 1);
        assert_eq!(addr.offset(layout), RAM_SIZE - 1);
    }

    proptest! {
        #[test]
        fn address_round_trip(
            id_bits in 2u8..=8,
            gen_bits in 0u8..=8,
            generation in any::<u8>(),
            in_vram in any::<bool>(),
            offset in 0..RAM_SIZE,
        ) {
            let generation = if gen_bits == 8 { generation } else { generation % (1 << gen_bits) };
            let translator = translator(id_bits, gen_bits, 1, generation);
            let local = if in_vram { VRAM_START + offset } else { RAM_START + offset };
            let device = translator.to_device(local);

            prop_assert_eq!(translator.to_local(device), local);
            prop_assert_eq!(device.offset(translator.layout()), offset);
            prop_assert_eq!(device.generation(translator.layout()), generation);
        }

        #[test]
        fn field_round_trip(id in 0u8..16, generation in 0u8..16, offset in any::<u64>()) {
            let layout = SlotLayout::new(4, 4).unwrap();
            let offset = offset & layout.offset_mask();
            let addr = DeviceAddress::new(layout, id, generation, offset).unwrap();

            prop_assert_eq!(addr.slot_id(layout), id);
            prop_assert_eq!(addr.generation(layout), generation);
            prop_assert_eq!(addr.offset(layout), offset);
        }
    }
}
