// Copyright (c) 2026 The pvdisplay developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Display modes, the primary surface and escapes.
//!
//! The mode table holds the ROM modes the driver can drive, followed by two *custom* slots. A
//! custom resolution requested through [`EscapeKind::SetCustomDisplay`] is written to whichever
//! custom slot was not written last, so the host always sees a mode index change.

use super::{Device, IoPort};
use crate::{
    command::{CustomDisplay, Head, MonitorsConfig, SurfaceCreate},
    memory::DeviceSize,
    present::{Completion, PresentOperation},
    rom::RomMode,
    DisplayError,
};
use tracing::{debug, error, warn};

pub const MIN_WIDTH: u32 = 1024;
pub const MIN_HEIGHT: u32 = 768;
pub const BITS_PER_PIXEL: u32 = 32;

/// The mode the host booted with.
///
/// A zero width or height, or a depth other than 32 bits, selects 1024x768.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DisplayInfo {
    pub width: u32,
    pub height: u32,
    pub bits_per_pixel: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DisplayMode {
    /// Position of the mode in the mode table.
    pub index: u32,
    pub width: u32,
    pub height: u32,
    /// Bytes per line.
    pub stride: u32,
    pub bits_per_pixel: u32,
    /// Physical size, in millimeters.
    pub x_mm: u32,
    pub y_mm: u32,
    pub orientation: u32,
}

impl DisplayMode {
    fn from_rom(index: u32, mode: &RomMode) -> Self {
        DisplayMode {
            index,
            width: mode.x_res,
            height: mode.y_res,
            stride: mode.stride,
            bits_per_pixel: mode.bits,
            x_mm: mode.x_mili,
            y_mm: mode.y_mili,
            orientation: mode.orientation,
        }
    }

    /// Size of the framebuffer in bytes.
    #[inline]
    pub fn framebuffer_size(&self) -> DeviceSize {
        DeviceSize::from(self.width) * DeviceSize::from(self.height) * self.bytes_per_pixel()
    }

    #[inline]
    fn bytes_per_pixel(&self) -> DeviceSize {
        DeviceSize::from(self.bits_per_pixel.div_ceil(8))
    }

    /// Bytes per line of a mode `width` pixels wide, aligned to 4 bytes. `None` on overflow.
    fn stride_for(width: u32, bits_per_pixel: u32) -> Option<u32> {
        width
            .checked_mul(bits_per_pixel.div_ceil(8))?
            .checked_add(3)
            .map(|stride| stride & !3)
    }

    fn resize(&mut self, width: u32, height: u32, bits_per_pixel: u32, stride: u32) {
        self.width = width;
        self.height = height;
        self.bits_per_pixel = bits_per_pixel;
        self.stride = stride;
    }
}

#[derive(Debug)]
pub(crate) struct ModeTable {
    modes: Vec<DisplayMode>,
    current: usize,
    // The custom slot written last.
    custom: usize,
}

impl ModeTable {
    pub fn new(rom_modes: &[RomMode], display: &DisplayInfo) -> Result<Self, DisplayError> {
        let mut modes: Vec<_> = rom_modes
            .iter()
            .filter(|mode| {
                mode.x_res >= MIN_WIDTH && mode.y_res >= MIN_HEIGHT && mode.bits == BITS_PER_PIXEL
            })
            .enumerate()
            .map(|(index, mode)| DisplayMode::from_rom(index as u32, mode))
            .collect();

        if modes.is_empty() {
            return Err(DisplayError::NoSuitableModes);
        }

        let (width, height) = if display.width == 0
            || display.height == 0
            || display.bits_per_pixel != BITS_PER_PIXEL
        {
            (MIN_WIDTH, MIN_HEIGHT)
        } else {
            (display.width, display.height)
        };

        let find = |width, height| {
            modes
                .iter()
                .position(|mode| mode.width == width && mode.height == height)
        };
        let current = find(width, height)
            .or_else(|| find(MIN_WIDTH, MIN_HEIGHT))
            .unwrap_or(0);

        for _ in 0..2 {
            let mut custom = modes[current];
            custom.index = modes.len() as u32;
            modes.push(custom);
        }

        let custom = modes.len() - 2;

        Ok(ModeTable {
            modes,
            current,
            custom,
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.modes.len()
    }

    pub fn get(&self, index: u32) -> Option<&DisplayMode> {
        self.modes.get(index as usize)
    }

    pub fn set_current(&mut self, index: u32) {
        debug_assert!((index as usize) < self.modes.len());
        self.current = index as usize;
    }

    fn next_custom_slot(&mut self) -> usize {
        let last = self.modes.len() - 1;
        self.custom = if self.custom == last { last - 1 } else { last };

        self.custom
    }
}

/// The escapes the driver understands.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EscapeKind {
    /// Writes a custom resolution into one of the custom mode slots. The payload is a
    /// [`CustomDisplay`].
    SetCustomDisplay,

    /// Describes the monitor's geometry to the device. The payload is a [`Head`].
    MonitorConfig,
}

impl EscapeKind {
    #[inline]
    pub const fn code(self) -> u32 {
        match self {
            EscapeKind::SetCustomDisplay => 0x10001,
            EscapeKind::MonitorConfig => 0x10002,
        }
    }

    /// Size of the payload that follows the escape code.
    #[inline]
    pub const fn payload_size(self) -> usize {
        match self {
            EscapeKind::SetCustomDisplay => size_of::<CustomDisplay>(),
            EscapeKind::MonitorConfig => size_of::<Head>(),
        }
    }
}

impl TryFrom<u32> for EscapeKind {
    type Error = DisplayError;

    fn try_from(code: u32) -> Result<Self, Self::Error> {
        [EscapeKind::SetCustomDisplay, EscapeKind::MonitorConfig]
            .into_iter()
            .find(|kind| kind.code() == code)
            .ok_or(DisplayError::InvalidParameter)
    }
}

const ESCAPE_CODE_SIZE: usize = size_of::<u32>();

impl Device {
    /// Returns a copy of the mode table.
    pub fn modes(&self) -> Vec<DisplayMode> {
        self.modes.lock().modes.clone()
    }

    pub fn current_mode(&self) -> DisplayMode {
        let modes = self.modes.lock();

        modes.modes[modes.current]
    }

    /// Switches to the mode at `index`, recreating the primary surface.
    ///
    /// Presents built for the previous mode are discarded. This blocks until the present worker
    /// has recreated the surface.
    pub fn set_current_mode(&self, index: u32) -> Result<(), DisplayError> {
        let mode = self
            .modes
            .lock()
            .get(index)
            .copied()
            .ok_or(DisplayError::UnknownMode)?;

        if !self.is_worker_running() {
            return Err(DisplayError::WorkerStopped);
        }

        let generation = self.bump_generation();
        debug!(index, generation, "switching display mode");

        let done = Completion::new();
        self.post_to_worker(PresentOperation::SetMode {
            mode,
            done: done.clone(),
        })?;

        if !done.wait() {
            return Err(DisplayError::WorkerStopped);
        }

        Ok(())
    }

    pub(crate) fn destroy_primary_surface(&self) {
        self.sync_io(IoPort::DestroyPrimary, 0);
    }

    pub(crate) fn create_primary_surface(&self, mode: &DisplayMode) {
        *self.ram_header.create_surface.lock() = SurfaceCreate {
            format: mode.bits_per_pixel,
            width: mode.width,
            height: mode.height,
            stride: mode.stride as i32,
            position: 0,
            mouse_mode: 0,
            flags: 0,
            kind: SurfaceCreate::KIND_PRIMARY,
            mem: self.translator.to_device(self.ram_start).as_raw(),
        };
        self.sync_io(IoPort::CreatePrimary, 0);
    }

    /// Handles an escape given as the raw private data buffer: the 32-bit escape code followed by
    /// the payload.
    pub fn escape_raw(&self, data: &[u8]) -> Result<(), DisplayError> {
        let Some(code) = data.get(..ESCAPE_CODE_SIZE) else {
            return Err(DisplayError::InvalidBufferSize {
                provided: data.len(),
                required: ESCAPE_CODE_SIZE,
            });
        };

        let code = u32::from_ne_bytes([code[0], code[1], code[2], code[3]]);
        let kind = EscapeKind::try_from(code).inspect_err(|_| {
            error!(code = format_args!("{:#x}", code), "unknown escape");
        })?;

        self.escape(kind, &data[ESCAPE_CODE_SIZE..])
    }

    /// Handles an escape. `payload` is everything after the escape code.
    ///
    /// A payload of the wrong size is rejected before anything changes.
    pub fn escape(&self, kind: EscapeKind, payload: &[u8]) -> Result<(), DisplayError> {
        if payload.len() != kind.payload_size() {
            error!(
                ?kind,
                provided = payload.len(),
                required = kind.payload_size(),
                "escape payload has the wrong size",
            );

            return Err(DisplayError::InvalidBufferSize {
                provided: ESCAPE_CODE_SIZE + payload.len(),
                required: ESCAPE_CODE_SIZE + kind.payload_size(),
            });
        }

        match kind {
            EscapeKind::SetCustomDisplay => {
                self.set_custom_display(&bytemuck::pod_read_unaligned(payload))
            }
            EscapeKind::MonitorConfig => {
                self.set_monitor_config(&bytemuck::pod_read_unaligned(payload));

                Ok(())
            }
        }
    }

    fn set_custom_display(&self, display: &CustomDisplay) -> Result<(), DisplayError> {
        let CustomDisplay { xres, yres, .. } = *display;

        if xres == 0 || yres == 0 {
            error!(xres, yres, "custom display has no area");

            return Err(DisplayError::InvalidParameter);
        }

        if xres < MIN_WIDTH || yres < MIN_HEIGHT {
            debug!(xres, yres, "custom display is smaller than the minimum mode");
        }

        let required =
            DeviceSize::from(xres) * DeviceSize::from(yres) * DeviceSize::from(BITS_PER_PIXEL) / 8;
        let available = self.rom.surface0_area_size;
        let stride = DisplayMode::stride_for(xres, BITS_PER_PIXEL);

        let Some(stride) = stride.filter(|_| required <= available) else {
            error!(xres, yres, required, available, "custom display does not fit");

            return Err(DisplayError::ModeTooLarge {
                required,
                available,
            });
        };

        {
            let mut modes = self.modes.lock();
            let slot = modes.next_custom_slot();
            modes.modes[slot].resize(xres, yres, BITS_PER_PIXEL, stride);
            debug!(slot, xres, yres, "custom display mode updated");
        }

        self.host.indicate_child_status(true);

        Ok(())
    }

    fn set_monitor_config(&self, head: &Head) {
        let head = Head {
            id: 0,
            surface_id: 0,
            ..*head
        };

        self.memory.write(
            self.monitors_config,
            &MonitorsConfig {
                count: 1,
                max_allowed: 1,
            },
        );
        self.memory.write(
            self.monitors_config + size_of::<MonitorsConfig>() as DeviceSize,
            &head,
        );

        if !self.is_active() {
            warn!("sending a monitor config to an inactive device");
        }

        self.async_io(IoPort::MonitorsConfigAsync, 0);
    }
}
