// SPDX-License-Identifier: GPL-3.0-only

//! Kernel ABI for the media controller ioctls
//!
//! Layouts mirror `include/uapi/linux/media.h`.

use crate::v4l2::sys::iowr;
use bytemuck::Zeroable;

pub const MEDIA_IOC_DEVICE_INFO: libc::c_ulong = iowr::<MediaDeviceInfo>(b'|', 0x00);
pub const MEDIA_IOC_ENUM_ENTITIES: libc::c_ulong = iowr::<MediaEntityDesc>(b'|', 0x01);
pub const MEDIA_IOC_ENUM_LINKS: libc::c_ulong = iowr::<MediaLinksEnum>(b'|', 0x02);
pub const MEDIA_IOC_SETUP_LINK: libc::c_ulong = iowr::<MediaLinkDesc>(b'|', 0x03);

/// OR-ed into an entity id to ask for the next entity after it
pub const MEDIA_ENT_ID_FLAG_NEXT: u32 = 1 << 31;

pub const MEDIA_ENT_TYPE_MASK: u32 = 0x00ff_0000;
pub const MEDIA_ENT_T_DEVNODE: u32 = 1 << 16;
pub const MEDIA_ENT_T_V4L2_SUBDEV: u32 = 2 << 16;

pub const MEDIA_LNK_FL_ENABLED: u32 = 1 << 0;
pub const MEDIA_LNK_FL_IMMUTABLE: u32 = 1 << 1;
pub const MEDIA_LNK_FL_DYNAMIC: u32 = 1 << 2;

pub const MEDIA_PAD_FL_SINK: u32 = 1 << 0;
pub const MEDIA_PAD_FL_SOURCE: u32 = 1 << 1;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct MediaDeviceInfo {
    pub driver: [u8; 16],
    pub model: [u8; 32],
    pub serial: [u8; 40],
    pub bus_info: [u8; 32],
    pub media_version: u32,
    pub hw_revision: u32,
    pub driver_version: u32,
    pub reserved: [u32; 31],
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct MediaEntityDesc {
    pub id: u32,
    pub name: [u8; 32],
    pub type_: u32,
    pub revision: u32,
    pub flags: u32,
    pub group_id: u32,
    pub pads: u16,
    pub links: u16,
    pub reserved: [u32; 4],
    /// Union of `dev { major, minor }` and padding; only the device view is used
    pub raw: [u32; 46],
}

impl MediaEntityDesc {
    pub fn major(&self) -> u32 {
        self.raw[0]
    }

    pub fn minor(&self) -> u32 {
        self.raw[1]
    }

    pub fn set_device(&mut self, major: u32, minor: u32) {
        self.raw[0] = major;
        self.raw[1] = minor;
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MediaPadDesc {
    pub entity: u32,
    pub index: u16,
    pub _pad: u16,
    pub flags: u32,
    pub reserved: [u32; 2],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MediaLinkDesc {
    pub source: MediaPadDesc,
    pub sink: MediaPadDesc,
    pub flags: u32,
    pub reserved: [u32; 2],
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct MediaLinksEnum {
    pub entity: u32,
    pub pads: *mut MediaPadDesc,
    pub links: *mut MediaLinkDesc,
    pub reserved: [u32; 4],
}

// SAFETY: plain C structs; all-zero (null pointers included) is the state
// userspace fills in before each ioctl.
unsafe impl Zeroable for MediaDeviceInfo {}
unsafe impl Zeroable for MediaEntityDesc {}
unsafe impl Zeroable for MediaPadDesc {}
unsafe impl Zeroable for MediaLinkDesc {}
unsafe impl Zeroable for MediaLinksEnum {}
