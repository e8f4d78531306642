// SPDX-License-Identifier: MPL-2.0

//! Integration tests for constants module

use camera_hal::constants::*;

#[test]
fn test_stream_format_values() {
    assert_eq!(StreamFormat::ALL.len(), 4);
    for format in StreamFormat::ALL {
        assert!(
            !format.display_name().is_empty(),
            "Format {:?} has empty display name",
            format
        );
    }
    assert!(StreamFormat::Ycbcr420.is_yuv());
    assert!(!StreamFormat::Blob.is_yuv());
}

#[test]
fn test_pixel_format_lookup() {
    for format in PixelFormat::ALL {
        assert_eq!(PixelFormat::from_fourcc(format.fourcc()), Some(format));
    }
    assert_eq!(PixelFormat::from_name("nv12"), Some(PixelFormat::Nv12));
    assert_eq!(PixelFormat::from_name("NV1"), None);
    assert_eq!(PixelFormat::from_fourcc(0), None);
}

#[test]
fn test_stride_conversion() {
    // Planar strides are already in bytes of the luma plane
    assert_eq!(pixels_to_bytes(V4L2_PIX_FMT_NV12, 640), 640);
    assert_eq!(pixels_to_bytes(V4L2_PIX_FMT_YUYV, 640), 1280);
    assert_eq!(bytes_to_pixels(V4L2_PIX_FMT_YUYV, 1280), 640);
    assert_eq!(pixels_to_bytes(V4L2_PIX_FMT_RGB24, 3), 9);
}

#[test]
fn test_frame_sizes() {
    assert_eq!(frame_size(V4L2_PIX_FMT_NV12, 640, 480), 640 * 480 * 3 / 2);
    assert_eq!(frame_size(V4L2_PIX_FMT_YUYV, 640, 480), 640 * 480 * 2);
    // JPEG buffers are sized by their width alone
    assert_eq!(frame_size(V4L2_PIX_FMT_JPEG, 1 << 20, 1), 1 << 20);
    assert_eq!(align64(100), 128);
    assert_eq!(align8(9), 16);
}
