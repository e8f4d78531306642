// SPDX-License-Identifier: GPL-3.0-only

//! V4L2 sub-device (sensor, ISP stage, lens) pad configuration

use super::device::V4l2Device;
use super::driver::V4l2Driver;
use super::sys::*;
use crate::errors::HalResult;
use bytemuck::Zeroable;
use tracing::debug;

/// Active media-bus format on one pad
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PadFormat {
    pub width: u32,
    pub height: u32,
    /// Media bus code
    pub code: u32,
    pub field: u32,
}

#[derive(Debug)]
pub struct Subdevice {
    device: V4l2Device,
}

impl Subdevice {
    pub fn new(path: impl Into<String>, driver: Box<dyn V4l2Driver>) -> Self {
        Self {
            device: V4l2Device::new(path, driver),
        }
    }

    pub fn name(&self) -> &str {
        self.device.name()
    }

    pub fn open(&mut self) -> HalResult<()> {
        self.device.open()
    }

    pub fn close(&mut self) {
        self.device.close()
    }

    /// Controls and events
    pub fn device(&mut self) -> &mut V4l2Device {
        &mut self.device
    }

    pub fn get_format(&mut self, pad: u32) -> HalResult<PadFormat> {
        self.device.ensure_open("get_pad_format")?;
        let mut fmt = V4l2SubdevFormat::zeroed();
        fmt.which = V4L2_SUBDEV_FORMAT_ACTIVE;
        fmt.pad = pad;
        self.device
            .driver()
            .subdev_get_format(&mut fmt)
            .map_err(|e| self.device.driver_error("VIDIOC_SUBDEV_G_FMT", e))?;
        Ok(PadFormat {
            width: fmt.format.width,
            height: fmt.format.height,
            code: fmt.format.code,
            field: fmt.format.field,
        })
    }

    /// Set the active format on `pad`, returning what the driver accepted
    pub fn set_format(&mut self, pad: u32, format: PadFormat) -> HalResult<PadFormat> {
        self.device.ensure_open("set_pad_format")?;
        let mut fmt = V4l2SubdevFormat::zeroed();
        fmt.which = V4L2_SUBDEV_FORMAT_ACTIVE;
        fmt.pad = pad;
        fmt.format.width = format.width;
        fmt.format.height = format.height;
        fmt.format.code = format.code;
        fmt.format.field = format.field;
        self.device
            .driver()
            .subdev_set_format(&mut fmt)
            .map_err(|e| self.device.driver_error("VIDIOC_SUBDEV_S_FMT", e))?;
        let applied = PadFormat {
            width: fmt.format.width,
            height: fmt.format.height,
            code: fmt.format.code,
            field: fmt.format.field,
        };
        debug!(device = %self.name(), pad, format = ?applied, "Pad format set");
        Ok(applied)
    }

    pub fn get_selection(&mut self, pad: u32, target: u32) -> HalResult<V4l2Rect> {
        self.device.ensure_open("get_selection")?;
        let mut sel = V4l2SubdevSelection::zeroed();
        sel.which = V4L2_SUBDEV_FORMAT_ACTIVE;
        sel.pad = pad;
        sel.target = target;
        self.device
            .driver()
            .subdev_get_selection(&mut sel)
            .map_err(|e| self.device.driver_error("VIDIOC_SUBDEV_G_SELECTION", e))?;
        Ok(sel.r)
    }

    /// Set a crop/compose rectangle, returning the one the driver applied
    pub fn set_selection(&mut self, pad: u32, target: u32, rect: V4l2Rect) -> HalResult<V4l2Rect> {
        self.device.ensure_open("set_selection")?;
        let mut sel = V4l2SubdevSelection::zeroed();
        sel.which = V4L2_SUBDEV_FORMAT_ACTIVE;
        sel.pad = pad;
        sel.target = target;
        sel.r = rect;
        self.device
            .driver()
            .subdev_set_selection(&mut sel)
            .map_err(|e| self.device.driver_error("VIDIOC_SUBDEV_S_SELECTION", e))?;
        debug!(device = %self.name(), pad, target, rect = ?sel.r, "Selection set");
        Ok(sel.r)
    }
}
