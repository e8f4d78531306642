// SPDX-License-Identifier: GPL-3.0-only

//! V4L2 control identifiers used by the HAL
//!
//! Standard camera-class controls drive exposure and focus bracketing; the
//! AtomISP private controls configure the continuous-capture ring.

// ===== V4L2 Control Class Bases =====
const V4L2_CTRL_CLASS_USER: u32 = 0x00980000;
pub const V4L2_CTRL_CLASS_CAMERA: u32 = 0x009a0000;

const V4L2_CID_BASE: u32 = V4L2_CTRL_CLASS_USER | 0x900;
const V4L2_CID_CAMERA_CLASS_BASE: u32 = V4L2_CTRL_CLASS_CAMERA | 0x900;

// ===== V4L2 Control IDs (User Class) =====

/// Gain control
pub const V4L2_CID_GAIN: u32 = V4L2_CID_BASE + 19;

// ===== V4L2 Control IDs (Camera Class) =====

/// Exposure mode: Auto, Manual, Shutter Priority, Aperture Priority
pub const V4L2_CID_EXPOSURE_AUTO: u32 = V4L2_CID_CAMERA_CLASS_BASE + 1;
/// Absolute exposure time in 100µs units
pub const V4L2_CID_EXPOSURE_ABSOLUTE: u32 = V4L2_CID_CAMERA_CLASS_BASE + 2;
/// Focus control (manual focus position)
pub const V4L2_CID_FOCUS_ABSOLUTE: u32 = V4L2_CID_CAMERA_CLASS_BASE + 10;
/// Auto focus enable
pub const V4L2_CID_FOCUS_AUTO: u32 = V4L2_CID_CAMERA_CLASS_BASE + 12;
/// Exposure compensation (EV bias) in 0.001 EV units
pub const V4L2_CID_AUTO_EXPOSURE_BIAS: u32 = V4L2_CID_CAMERA_CLASS_BASE + 19;

// ===== AtomISP Private Controls =====

const V4L2_CID_CAMERA_LASTP1: u32 = V4L2_CID_CAMERA_CLASS_BASE + 1024;

/// Selects continuous (ring buffer) capture mode
pub const V4L2_CID_ATOMISP_CONTINUOUS_MODE: u32 = V4L2_CID_CAMERA_LASTP1 + 22;
/// Number of raw frames kept in the continuous ring
pub const V4L2_CID_ATOMISP_CONTINUOUS_RAW_BUFFER_SIZE: u32 = V4L2_CID_CAMERA_LASTP1 + 23;
/// Keep raw frames locked until the HAL releases them
pub const V4L2_CID_ENABLE_RAW_BUFFER_LOCK: u32 = V4L2_CID_CAMERA_LASTP1 + 29;

// ===== V4L2 Exposure Auto Menu Values =====

/// Automatic exposure time and iris
pub const V4L2_EXPOSURE_AUTO: i32 = 0;
/// Manual exposure time and iris
pub const V4L2_EXPOSURE_MANUAL: i32 = 1;

/// Human readable name for logging
pub fn control_name(id: u32) -> &'static str {
    match id {
        V4L2_CID_GAIN => "gain",
        V4L2_CID_EXPOSURE_AUTO => "exposure_auto",
        V4L2_CID_EXPOSURE_ABSOLUTE => "exposure_absolute",
        V4L2_CID_FOCUS_ABSOLUTE => "focus_absolute",
        V4L2_CID_FOCUS_AUTO => "focus_auto",
        V4L2_CID_AUTO_EXPOSURE_BIAS => "exposure_bias",
        V4L2_CID_ATOMISP_CONTINUOUS_MODE => "continuous_mode",
        V4L2_CID_ATOMISP_CONTINUOUS_RAW_BUFFER_SIZE => "continuous_raw_buffer_size",
        V4L2_CID_ENABLE_RAW_BUFFER_LOCK => "raw_buffer_lock",
        _ => "unknown",
    }
}
