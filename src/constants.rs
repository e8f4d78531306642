// SPDX-License-Identifier: GPL-3.0-only

//! HAL-wide constants and pixel format arithmetic
//!
//! Frame geometry follows the ISP convention: strides are expressed in pixels,
//! the driver reports bytes-per-line, and the two are converted with
//! [`pixels_to_bytes`] / [`bytes_to_pixels`]. Planar YUV formats keep the luma
//! stride in bytes, so for them a pixel stride and a byte stride are the same.

use serde::{Deserialize, Serialize};

/// Build a V4L2 fourcc code from its four characters
pub const fn fourcc(a: u8, b: u8, c: u8, d: u8) -> u32 {
    (a as u32) | ((b as u32) << 8) | ((c as u32) << 16) | ((d as u32) << 24)
}

// ===== V4L2 Pixel Formats =====

pub const V4L2_PIX_FMT_NV12: u32 = fourcc(b'N', b'V', b'1', b'2');
pub const V4L2_PIX_FMT_NV21: u32 = fourcc(b'N', b'V', b'2', b'1');
pub const V4L2_PIX_FMT_NV16: u32 = fourcc(b'N', b'V', b'1', b'6');
pub const V4L2_PIX_FMT_YUV420: u32 = fourcc(b'Y', b'U', b'1', b'2');
pub const V4L2_PIX_FMT_YVU420: u32 = fourcc(b'Y', b'V', b'1', b'2');
pub const V4L2_PIX_FMT_YUYV: u32 = fourcc(b'Y', b'U', b'Y', b'V');
pub const V4L2_PIX_FMT_UYVY: u32 = fourcc(b'U', b'Y', b'V', b'Y');
pub const V4L2_PIX_FMT_RGB565: u32 = fourcc(b'R', b'G', b'B', b'P');
pub const V4L2_PIX_FMT_RGB24: u32 = fourcc(b'R', b'G', b'B', b'3');
pub const V4L2_PIX_FMT_XBGR32: u32 = fourcc(b'X', b'R', b'2', b'4');
pub const V4L2_PIX_FMT_SBGGR8: u32 = fourcc(b'B', b'A', b'8', b'1');
pub const V4L2_PIX_FMT_SBGGR10: u32 = fourcc(b'B', b'G', b'1', b'0');
pub const V4L2_PIX_FMT_SGRBG10: u32 = fourcc(b'B', b'A', b'1', b'0');
pub const V4L2_PIX_FMT_JPEG: u32 = fourcc(b'J', b'P', b'E', b'G');

// ===== Timing =====

/// Default poll timeout per request, in milliseconds
pub const POLL_TIMEOUT_MS: u32 = 1000;
/// Acquire fence wait bound, in milliseconds
pub const FENCE_TIMEOUT_MS: u32 = 2000;
/// Preview rate assumed when converting shutter lag to frames
pub const DEFAULT_PREVIEW_FPS: f32 = 30.0;

// ===== Bracketing =====

/// Recovery attempts before a bracketing burst is abandoned
pub const MAX_BRACKET_RETRIES: u32 = 2;
/// Exposure lag used when the sensor configuration reports none
pub const DEFAULT_EXPOSURE_LAG: u32 = 2;

// ===== Continuous Capture =====

pub const MIN_CONTINUOUS_BUF_SIZE: i32 = 3;
pub const MIN_CONTINUOUS_BUF_NUM_CSS2X: i32 = 5;
/// Ring size when the number of captures is unbounded (-1)
pub const RAW_BUF_NUM_FOR_INFINITE_CAP: i32 = 7;
pub const DEFAULT_MAX_CONTINUOUS_RAW_RING: i32 = 10;

// ===== Buffers =====

/// Row alignment the ISP requires, in bytes
pub const MIN_STRIDE_ALIGNMENT: u32 = 64;
/// Buffers per stream when the client does not ask for a count
pub const DEFAULT_BUFFER_COUNT: u32 = 4;
/// SOI plus APP0 segment the capture node writes and the HAL strips
pub const JFIF_HEADER_SIZE: u32 = 20;
/// Space reserved at the start of a JPEG buffer for EXIF
pub const JPEG_DATA_START_OFFSET: u32 = 0x1000;

/// Platform (framework) pixel formats a stream can request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum StreamFormat {
    /// Flexible YUV 4:2:0
    #[default]
    Ycbcr420,
    /// Format chosen by the HAL, consumed by the display or encoder
    ImplementationDefined,
    /// Compressed still image (JPEG)
    Blob,
    /// Raw sensor data
    Raw16,
}

impl StreamFormat {
    pub const ALL: [StreamFormat; 4] = [
        StreamFormat::Ycbcr420,
        StreamFormat::ImplementationDefined,
        StreamFormat::Blob,
        StreamFormat::Raw16,
    ];

    pub fn display_name(&self) -> &'static str {
        match self {
            StreamFormat::Ycbcr420 => "YCbCr_420_888",
            StreamFormat::ImplementationDefined => "IMPLEMENTATION_DEFINED",
            StreamFormat::Blob => "BLOB",
            StreamFormat::Raw16 => "RAW16",
        }
    }

    /// YUV streams are served by the overlay/preview path
    pub fn is_yuv(&self) -> bool {
        matches!(
            self,
            StreamFormat::Ycbcr420 | StreamFormat::ImplementationDefined
        )
    }
}

/// Pixel formats the HAL knows how to size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    Nv12,
    Nv21,
    Nv16,
    Yuv420,
    Yvu420,
    Yuyv,
    Uyvy,
    Rgb565,
    Rgb24,
    Xbgr32,
    Sbggr8,
    Sbggr10,
    Sgrbg10,
    Jpeg,
}

impl PixelFormat {
    pub const ALL: [PixelFormat; 14] = [
        PixelFormat::Nv12,
        PixelFormat::Nv21,
        PixelFormat::Nv16,
        PixelFormat::Yuv420,
        PixelFormat::Yvu420,
        PixelFormat::Yuyv,
        PixelFormat::Uyvy,
        PixelFormat::Rgb565,
        PixelFormat::Rgb24,
        PixelFormat::Xbgr32,
        PixelFormat::Sbggr8,
        PixelFormat::Sbggr10,
        PixelFormat::Sgrbg10,
        PixelFormat::Jpeg,
    ];

    pub fn fourcc(&self) -> u32 {
        match self {
            PixelFormat::Nv12 => V4L2_PIX_FMT_NV12,
            PixelFormat::Nv21 => V4L2_PIX_FMT_NV21,
            PixelFormat::Nv16 => V4L2_PIX_FMT_NV16,
            PixelFormat::Yuv420 => V4L2_PIX_FMT_YUV420,
            PixelFormat::Yvu420 => V4L2_PIX_FMT_YVU420,
            PixelFormat::Yuyv => V4L2_PIX_FMT_YUYV,
            PixelFormat::Uyvy => V4L2_PIX_FMT_UYVY,
            PixelFormat::Rgb565 => V4L2_PIX_FMT_RGB565,
            PixelFormat::Rgb24 => V4L2_PIX_FMT_RGB24,
            PixelFormat::Xbgr32 => V4L2_PIX_FMT_XBGR32,
            PixelFormat::Sbggr8 => V4L2_PIX_FMT_SBGGR8,
            PixelFormat::Sbggr10 => V4L2_PIX_FMT_SBGGR10,
            PixelFormat::Sgrbg10 => V4L2_PIX_FMT_SGRBG10,
            PixelFormat::Jpeg => V4L2_PIX_FMT_JPEG,
        }
    }

    pub fn from_fourcc(code: u32) -> Option<Self> {
        Self::ALL.iter().copied().find(|f| f.fourcc() == code)
    }

    /// Parse a fourcc string such as "NV12" (case-insensitive)
    pub fn from_name(name: &str) -> Option<Self> {
        let bytes = name.to_ascii_uppercase().into_bytes();
        if bytes.len() != 4 {
            return None;
        }
        Self::from_fourcc(fourcc(bytes[0], bytes[1], bytes[2], bytes[3]))
    }

    /// Bits per pixel, averaged over planes for planar formats
    pub fn depth(&self) -> u32 {
        match self {
            PixelFormat::Nv12 | PixelFormat::Nv21 | PixelFormat::Yuv420 | PixelFormat::Yvu420 => 12,
            PixelFormat::Nv16
            | PixelFormat::Yuyv
            | PixelFormat::Uyvy
            | PixelFormat::Rgb565
            | PixelFormat::Sbggr10
            | PixelFormat::Sgrbg10 => 16,
            PixelFormat::Rgb24 => 24,
            PixelFormat::Xbgr32 => 32,
            PixelFormat::Sbggr8 | PixelFormat::Jpeg => 8,
        }
    }

    /// Planar formats express their line stride as the luma plane width
    pub fn is_planar(&self) -> bool {
        matches!(
            self,
            PixelFormat::Nv12
                | PixelFormat::Nv21
                | PixelFormat::Nv16
                | PixelFormat::Yuv420
                | PixelFormat::Yvu420
        )
    }
}

/// Render a fourcc as its four characters
pub fn fourcc_to_string(code: u32) -> String {
    code.to_le_bytes()
        .iter()
        .map(|&b| if b.is_ascii_graphic() { b as char } else { '?' })
        .collect()
}

pub const fn align_to(value: u32, alignment: u32) -> u32 {
    (value + alignment - 1) & !(alignment - 1)
}

pub const fn align8(value: u32) -> u32 {
    align_to(value, 8)
}

pub const fn align64(value: u32) -> u32 {
    align_to(value, 64)
}

/// Bits per pixel for a fourcc; unknown codes are sized as 16-bit packed
pub fn bits_per_pixel(code: u32) -> u32 {
    PixelFormat::from_fourcc(code).map(|f| f.depth()).unwrap_or(16)
}

pub fn is_planar(code: u32) -> bool {
    PixelFormat::from_fourcc(code)
        .map(|f| f.is_planar())
        .unwrap_or(false)
}

/// Convert a stride in pixels to the bytes-per-line the driver expects
pub fn pixels_to_bytes(code: u32, pixels: u32) -> u32 {
    if is_planar(code) {
        pixels
    } else {
        align8(bits_per_pixel(code) * pixels) / 8
    }
}

/// Convert driver bytes-per-line back to a stride in pixels
pub fn bytes_to_pixels(code: u32, bytes: u32) -> u32 {
    if is_planar(code) {
        bytes
    } else {
        bytes * 8 / bits_per_pixel(code)
    }
}

/// Size in bytes of one frame with the given pixel stride
///
/// JPEG (BLOB) buffers are one-dimensional: the declared width is the byte
/// size of the buffer.
pub fn frame_size(code: u32, stride: u32, height: u32) -> u32 {
    if code == V4L2_PIX_FMT_JPEG {
        return stride;
    }
    height * align8(bits_per_pixel(code) * stride) / 8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fourcc_matches_kernel_values() {
        assert_eq!(V4L2_PIX_FMT_NV12, 0x3231_564E);
        assert_eq!(V4L2_PIX_FMT_YUYV, 0x5659_5559);
        assert_eq!(V4L2_PIX_FMT_JPEG, 0x4745_504A);
        assert_eq!(fourcc_to_string(V4L2_PIX_FMT_NV21), "NV21");
    }

    #[test]
    fn packed_stride_round_trips() {
        let bpl = pixels_to_bytes(V4L2_PIX_FMT_YUYV, 640);
        assert_eq!(bpl, 1280);
        assert_eq!(bytes_to_pixels(V4L2_PIX_FMT_YUYV, bpl), 640);
    }

    #[test]
    fn planar_stride_is_identity() {
        assert_eq!(pixels_to_bytes(V4L2_PIX_FMT_NV12, 1920), 1920);
        assert_eq!(frame_size(V4L2_PIX_FMT_NV12, 1920, 1080), 1920 * 1080 * 3 / 2);
    }

    #[test]
    fn blob_size_is_width() {
        assert_eq!(frame_size(V4L2_PIX_FMT_JPEG, 4_000_000, 1), 4_000_000);
    }

    #[test]
    fn alignment_helpers() {
        assert_eq!(align64(1), 64);
        assert_eq!(align64(1920), 1920);
        assert_eq!(align8(12 * 5), 64);
    }
}
