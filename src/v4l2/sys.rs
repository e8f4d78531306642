// SPDX-License-Identifier: GPL-3.0-only

//! Kernel ABI for the V4L2 ioctls the HAL issues
//!
//! Layouts mirror `include/uapi/linux/videodev2.h` and `v4l2-subdev.h`.
//! Request numbers are derived from the struct sizes rather than hard-coded,
//! so they stay correct on 32-bit targets where pointer-sized members shrink.

#![allow(non_camel_case_types)]

use bytemuck::Zeroable;
use std::mem::size_of;

// ===== ioctl Request Encoding =====
// (dir << 30) | (size << 16) | (type << 8) | nr
// where dir: 2=READ, 1=WRITE, 3=READ|WRITE

const IOC_WRITE: u32 = 1;
const IOC_READ: u32 = 2;

pub const fn ioc(dir: u32, ty: u8, nr: u8, size: usize) -> libc::c_ulong {
    ((dir << 30) | ((size as u32) << 16) | ((ty as u32) << 8) | nr as u32) as libc::c_ulong
}

pub const fn ior<T>(ty: u8, nr: u8) -> libc::c_ulong {
    ioc(IOC_READ, ty, nr, size_of::<T>())
}

pub const fn iow<T>(ty: u8, nr: u8) -> libc::c_ulong {
    ioc(IOC_WRITE, ty, nr, size_of::<T>())
}

pub const fn iowr<T>(ty: u8, nr: u8) -> libc::c_ulong {
    ioc(IOC_READ | IOC_WRITE, ty, nr, size_of::<T>())
}

// ===== V4L2 ioctl Numbers =====

pub const VIDIOC_QUERYCAP: libc::c_ulong = ior::<V4l2Capability>(b'V', 0);
pub const VIDIOC_G_FMT: libc::c_ulong = iowr::<V4l2Format>(b'V', 4);
pub const VIDIOC_S_FMT: libc::c_ulong = iowr::<V4l2Format>(b'V', 5);
pub const VIDIOC_REQBUFS: libc::c_ulong = iowr::<V4l2RequestBuffers>(b'V', 8);
pub const VIDIOC_QUERYBUF: libc::c_ulong = iowr::<V4l2Buffer>(b'V', 9);
pub const VIDIOC_QBUF: libc::c_ulong = iowr::<V4l2Buffer>(b'V', 15);
pub const VIDIOC_DQBUF: libc::c_ulong = iowr::<V4l2Buffer>(b'V', 17);
pub const VIDIOC_STREAMON: libc::c_ulong = iow::<libc::c_int>(b'V', 18);
pub const VIDIOC_STREAMOFF: libc::c_ulong = iow::<libc::c_int>(b'V', 19);
pub const VIDIOC_S_PARM: libc::c_ulong = iowr::<V4l2StreamParm>(b'V', 22);
pub const VIDIOC_G_CTRL: libc::c_ulong = iowr::<V4l2Control>(b'V', 27);
pub const VIDIOC_S_CTRL: libc::c_ulong = iowr::<V4l2Control>(b'V', 28);
pub const VIDIOC_S_EXT_CTRLS: libc::c_ulong = iowr::<V4l2ExtControls>(b'V', 72);
pub const VIDIOC_DQEVENT: libc::c_ulong = ior::<V4l2Event>(b'V', 89);
pub const VIDIOC_SUBSCRIBE_EVENT: libc::c_ulong = iow::<V4l2EventSubscription>(b'V', 90);
pub const VIDIOC_UNSUBSCRIBE_EVENT: libc::c_ulong = iow::<V4l2EventSubscription>(b'V', 91);

pub const VIDIOC_SUBDEV_G_FMT: libc::c_ulong = iowr::<V4l2SubdevFormat>(b'V', 4);
pub const VIDIOC_SUBDEV_S_FMT: libc::c_ulong = iowr::<V4l2SubdevFormat>(b'V', 5);
pub const VIDIOC_SUBDEV_G_SELECTION: libc::c_ulong = iowr::<V4l2SubdevSelection>(b'V', 61);
pub const VIDIOC_SUBDEV_S_SELECTION: libc::c_ulong = iowr::<V4l2SubdevSelection>(b'V', 62);

/// First driver-private ioctl number
const BASE_VIDIOC_PRIVATE: u8 = 192;
/// AtomISP continuous-capture ring configuration
pub const ATOMISP_IOC_S_CONT_CAPTURE_CONFIG: libc::c_ulong =
    iowr::<AtomispContCaptureConfig>(b'v', BASE_VIDIOC_PRIVATE + 33);
/// AtomISP release of a locked raw frame by exposure id
pub const ATOMISP_IOC_EXP_ID_UNLOCK: libc::c_ulong = iow::<libc::c_int>(b'v', BASE_VIDIOC_PRIVATE + 36);
/// AtomISP capture of a locked raw frame by exposure id
pub const ATOMISP_IOC_EXP_ID_CAPTURE: libc::c_ulong = iow::<libc::c_int>(b'v', BASE_VIDIOC_PRIVATE + 37);

// ===== Buffer Types and Memory =====

pub const V4L2_BUF_TYPE_VIDEO_CAPTURE: u32 = 1;
pub const V4L2_BUF_TYPE_VIDEO_OUTPUT: u32 = 2;

pub const V4L2_MEMORY_MMAP: u32 = 1;
pub const V4L2_MEMORY_USERPTR: u32 = 2;
pub const V4L2_MEMORY_DMABUF: u32 = 4;

pub const V4L2_FIELD_ANY: u32 = 0;
pub const V4L2_FIELD_NONE: u32 = 1;
pub const V4L2_FIELD_INTERLACED: u32 = 4;

// ===== Buffer Flags =====

pub const V4L2_BUF_FLAG_QUEUED: u32 = 0x0000_0002;
pub const V4L2_BUF_FLAG_DONE: u32 = 0x0000_0004;
pub const V4L2_BUF_FLAG_ERROR: u32 = 0x0000_0040;
pub const V4L2_BUF_FLAG_NO_CACHE_INVALIDATE: u32 = 0x0000_0800;
pub const V4L2_BUF_FLAG_NO_CACHE_CLEAN: u32 = 0x0000_1000;

// ===== Capabilities =====

pub const V4L2_CAP_VIDEO_CAPTURE: u32 = 0x0000_0001;
pub const V4L2_CAP_VIDEO_OUTPUT: u32 = 0x0000_0002;
pub const V4L2_CAP_STREAMING: u32 = 0x0400_0000;
pub const V4L2_CAP_DEVICE_CAPS: u32 = 0x8000_0000;

// ===== Events =====

pub const V4L2_EVENT_ALL: u32 = 0;
pub const V4L2_EVENT_VSYNC: u32 = 1;
pub const V4L2_EVENT_EOS: u32 = 2;
pub const V4L2_EVENT_CTRL: u32 = 3;
pub const V4L2_EVENT_FRAME_SYNC: u32 = 4;

// ===== Sub-device =====

pub const V4L2_SUBDEV_FORMAT_TRY: u32 = 0;
pub const V4L2_SUBDEV_FORMAT_ACTIVE: u32 = 1;
pub const V4L2_SEL_TGT_CROP: u32 = 0x0000;
pub const V4L2_SEL_TGT_COMPOSE: u32 = 0x0100;

// ===== Structures =====

/// Device capability structure for QUERYCAP
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct V4l2Capability {
    pub driver: [u8; 16],
    pub card: [u8; 32],
    pub bus_info: [u8; 32],
    pub version: u32,
    pub capabilities: u32,
    pub device_caps: u32,
    pub reserved: [u32; 3],
}

/// Single-planar pixel format
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct V4l2PixFormat {
    pub width: u32,
    pub height: u32,
    pub pixelformat: u32,
    pub field: u32,
    pub bytesperline: u32,
    pub sizeimage: u32,
    pub colorspace: u32,
    pub priv_: u32,
    pub flags: u32,
    pub ycbcr_enc: u32,
    pub quantization: u32,
    pub xfer_func: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union V4l2FormatData {
    pub pix: V4l2PixFormat,
    pub raw_data: [u8; 200],
    // The kernel union holds pointers (v4l2_window)
    _align: [libc::c_ulong; 0],
}

/// Format structure for G_FMT/S_FMT
#[repr(C)]
#[derive(Clone, Copy)]
pub struct V4l2Format {
    pub type_: u32,
    pub fmt: V4l2FormatData,
}

impl V4l2Format {
    pub fn pix(&self) -> &V4l2PixFormat {
        // SAFETY: every bit pattern is a valid V4l2PixFormat
        unsafe { &self.fmt.pix }
    }

    pub fn pix_mut(&mut self) -> &mut V4l2PixFormat {
        // SAFETY: as above
        unsafe { &mut self.fmt.pix }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct V4l2RequestBuffers {
    pub count: u32,
    pub type_: u32,
    pub memory: u32,
    pub capabilities: u32,
    pub flags: u8,
    pub reserved: [u8; 3],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct V4l2Timecode {
    pub type_: u32,
    pub flags: u32,
    pub frames: u8,
    pub seconds: u8,
    pub minutes: u8,
    pub hours: u8,
    pub userbits: [u8; 4],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union V4l2BufferM {
    pub offset: u32,
    pub userptr: libc::c_ulong,
    pub fd: i32,
}

/// Buffer descriptor for QUERYBUF/QBUF/DQBUF
///
/// `reserved2` and `reserved` are overloaded by the AtomISP driver, see
/// [`crate::v4l2::frame_info`] for the accessors.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct V4l2Buffer {
    pub index: u32,
    pub type_: u32,
    pub bytesused: u32,
    pub flags: u32,
    pub field: u32,
    pub timestamp: libc::timeval,
    pub timecode: V4l2Timecode,
    pub sequence: u32,
    pub memory: u32,
    pub m: V4l2BufferM,
    pub length: u32,
    pub reserved2: u32,
    pub reserved: u32,
}

impl V4l2Buffer {
    pub fn userptr(&self) -> libc::c_ulong {
        // SAFETY: reading the widest member of a zero-initialised union
        unsafe { self.m.userptr }
    }

    pub fn set_userptr(&mut self, ptr: libc::c_ulong) {
        self.m.userptr = ptr;
    }

    pub fn offset(&self) -> u32 {
        // SAFETY: plain integer member
        unsafe { self.m.offset }
    }

    /// Capture timestamp in microseconds
    pub fn timestamp_us(&self) -> i64 {
        self.timestamp.tv_sec as i64 * 1_000_000 + self.timestamp.tv_usec as i64
    }
}

impl std::fmt::Debug for V4l2Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("V4l2Buffer")
            .field("index", &self.index)
            .field("type", &self.type_)
            .field("bytesused", &self.bytesused)
            .field("flags", &format_args!("{:#x}", self.flags))
            .field("sequence", &self.sequence)
            .field("memory", &self.memory)
            .field("userptr", &format_args!("{:#x}", self.userptr()))
            .field("length", &self.length)
            .field("reserved2", &format_args!("{:#x}", self.reserved2))
            .field("reserved", &format_args!("{:#x}", self.reserved))
            .finish()
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct V4l2Fract {
    pub numerator: u32,
    pub denominator: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct V4l2CaptureParm {
    pub capability: u32,
    pub capturemode: u32,
    pub timeperframe: V4l2Fract,
    pub extendedmode: u32,
    pub readbuffers: u32,
    pub reserved: [u32; 4],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union V4l2StreamParmData {
    pub capture: V4l2CaptureParm,
    pub raw_data: [u8; 200],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct V4l2StreamParm {
    pub type_: u32,
    pub parm: V4l2StreamParmData,
}

/// Control get/set structure
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct V4l2Control {
    pub id: u32,
    pub value: i32,
}

#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Default)]
pub struct V4l2ExtControl {
    pub id: u32,
    pub size: u32,
    pub reserved2: [u32; 1],
    /// Union of value / value64 / pointer payloads
    pub value64: i64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct V4l2ExtControls {
    pub which: u32,
    pub count: u32,
    pub error_idx: u32,
    pub request_fd: i32,
    pub reserved: [u32; 1],
    pub controls: *mut V4l2ExtControl,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct V4l2EventSubscription {
    pub type_: u32,
    pub id: u32,
    pub flags: u32,
    pub reserved: [u32; 5],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union V4l2EventData {
    pub data: [u8; 64],
    _align: [u64; 0],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct V4l2Event {
    pub type_: u32,
    pub u: V4l2EventData,
    pub pending: u32,
    pub sequence: u32,
    pub timestamp: libc::timespec,
    pub id: u32,
    pub reserved: [u32; 8],
}

impl V4l2Event {
    /// `u.frame_sync.frame_sequence` for FRAME_SYNC events
    pub fn frame_sequence(&self) -> u32 {
        // SAFETY: byte array member
        let data = unsafe { self.u.data };
        u32::from_ne_bytes([data[0], data[1], data[2], data[3]])
    }
}

/// Media bus format on a sub-device pad
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct V4l2MbusFramefmt {
    pub width: u32,
    pub height: u32,
    pub code: u32,
    pub field: u32,
    pub colorspace: u32,
    pub ycbcr_enc: u16,
    pub quantization: u16,
    pub xfer_func: u16,
    pub flags: u16,
    pub reserved: [u16; 10],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct V4l2SubdevFormat {
    pub which: u32,
    pub pad: u32,
    pub format: V4l2MbusFramefmt,
    pub stream: u32,
    pub reserved: [u32; 7],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct V4l2Rect {
    pub left: i32,
    pub top: i32,
    pub width: u32,
    pub height: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct V4l2SubdevSelection {
    pub which: u32,
    pub pad: u32,
    pub target: u32,
    pub flags: u32,
    pub r: V4l2Rect,
    pub stream: u32,
    pub reserved: [u32; 7],
}

/// `struct atomisp_cont_capture_conf`
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AtomispContCaptureConfig {
    pub num_captures: i32,
    pub skip_frames: u32,
    pub offset: i32,
    pub reserved: [u32; 5],
}

// SAFETY: all of these are plain C structs for which all-zero is the
// documented initial state before an ioctl.
unsafe impl Zeroable for V4l2Capability {}
unsafe impl Zeroable for V4l2PixFormat {}
unsafe impl Zeroable for V4l2Format {}
unsafe impl Zeroable for V4l2RequestBuffers {}
unsafe impl Zeroable for V4l2Buffer {}
unsafe impl Zeroable for V4l2StreamParm {}
unsafe impl Zeroable for V4l2Control {}
unsafe impl Zeroable for V4l2ExtControl {}
unsafe impl Zeroable for V4l2ExtControls {}
unsafe impl Zeroable for V4l2EventSubscription {}
unsafe impl Zeroable for V4l2Event {}
unsafe impl Zeroable for V4l2SubdevFormat {}
unsafe impl Zeroable for V4l2SubdevSelection {}
unsafe impl Zeroable for AtomispContCaptureConfig {}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn struct_sizes_match_kernel_abi() {
        assert_eq!(size_of::<V4l2Capability>(), 104);
        assert_eq!(size_of::<V4l2Format>(), 208);
        assert_eq!(size_of::<V4l2RequestBuffers>(), 20);
        assert_eq!(size_of::<V4l2Buffer>(), 88);
        assert_eq!(size_of::<V4l2StreamParm>(), 204);
        assert_eq!(size_of::<V4l2ExtControl>(), 20);
        assert_eq!(size_of::<V4l2Event>(), 136);
        assert_eq!(size_of::<V4l2SubdevFormat>(), 88);
        assert_eq!(size_of::<V4l2SubdevSelection>(), 64);
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn request_numbers_match_headers() {
        assert_eq!(VIDIOC_QUERYCAP, 0x8068_5600);
        assert_eq!(VIDIOC_S_FMT, 0xC0D0_5605);
        assert_eq!(VIDIOC_REQBUFS, 0xC014_5608);
        assert_eq!(VIDIOC_QBUF, 0xC058_560F);
        assert_eq!(VIDIOC_DQBUF, 0xC058_5611);
        assert_eq!(VIDIOC_STREAMON, 0x4004_5612);
        assert_eq!(VIDIOC_G_CTRL, 0xC008_561B);
        assert_eq!(VIDIOC_DQEVENT, 0x8088_5659);
    }
}
