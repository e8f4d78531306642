// SPDX-License-Identifier: GPL-3.0-only

//! Continuous (zero shutter lag) capture
//!
//! In continuous mode the ISP keeps a ring of recent raw frames while the
//! preview runs. A still capture then asks for `num_captures` frames starting
//! `offset` frames back in that ring (negative offsets look into the past),
//! keeping one frame out of every `skip + 1`.

use crate::config::HalConfig;
use crate::constants::{MIN_CONTINUOUS_BUF_NUM_CSS2X, MIN_CONTINUOUS_BUF_SIZE, RAW_BUF_NUM_FOR_INFINITE_CAP};
use crate::errors::{HalError, HalResult};
use crate::v4l2::V4l2Device;
use crate::v4l2::VideoNode;
use crate::v4l2::controls::{
    V4L2_CID_ATOMISP_CONTINUOUS_MODE, V4L2_CID_ATOMISP_CONTINUOUS_RAW_BUFFER_SIZE,
    V4L2_CID_ENABLE_RAW_BUFFER_LOCK,
};
use crate::v4l2::sys::AtomispContCaptureConfig;
use bytemuck::Zeroable;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ContinuousCaptureConfig {
    /// Frames to capture; -1 captures until stopped
    pub num_captures: i32,
    /// Start position relative to the shutter press; negative looks back into the ring
    pub offset: i32,
    /// Ring frames to skip after each captured frame
    pub skip: u32,
    /// Keep captured raw frames locked until released by exposure id
    pub raw_buffer_lock: bool,
    /// Favour capture resolution over a continuous viewfinder
    pub capture_priority: bool,
}

/// Sensor timing the ring-buffer arithmetic depends on
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContinuousTiming {
    pub max_ring: i32,
    pub css_major_version: u32,
    pub shutter_lag_ms: u32,
    pub preview_fps: f32,
}

impl ContinuousTiming {
    pub fn from_config(config: &HalConfig) -> Self {
        Self {
            max_ring: config.sensor.max_continuous_raw_ring,
            css_major_version: config.sensor.css_major_version,
            shutter_lag_ms: config.sensor.shutter_lag_compensation_ms,
            preview_fps: config.preview_fps,
        }
    }

    /// Raw ring depth needed to serve `cfg`
    pub fn ring_buffer_size(&self, cfg: &ContinuousCaptureConfig) -> i32 {
        let captures = cfg.num_captures;
        let lookback = cfg.offset.abs();
        let mut buffers = MIN_CONTINUOUS_BUF_SIZE;
        if lookback > captures && !cfg.raw_buffer_lock {
            buffers += lookback;
        } else {
            buffers += captures.abs();
        }

        if self.css_major_version >= 2 {
            if cfg.offset == -1 && !cfg.raw_buffer_lock {
                buffers -= 1;
            }
            buffers = buffers.max(MIN_CONTINUOUS_BUF_NUM_CSS2X);
            if captures == -1 {
                buffers = RAW_BUF_NUM_FOR_INFINITE_CAP;
            }
        }
        buffers.min(self.max_ring)
    }

    /// Deepest offset the ring supports
    pub fn neg_min_offset(&self) -> i32 {
        -(self.max_ring - 2)
    }

    /// Frames between the shutter press and the frame the user saw
    pub fn shutter_lag_zero_align(&self) -> i32 {
        let frame_interval_ms = 1000.0 / self.preview_fps;
        (self.shutter_lag_ms as f32 / frame_interval_ms).round() as i32
    }

    /// Ring offset of output frame `start_index` (<= 0) when skipping `skip` frames between outputs
    pub fn neg_offset(&self, skip: u32, start_index: i32) -> HalResult<i32> {
        if start_index > 0 {
            return Err(HalError::InvalidArgument(format!(
                "start index {} must not be positive",
                start_index
            )));
        }
        let ratio = skip as i32 + 1;
        let offset = ratio * start_index - self.shutter_lag_zero_align();
        debug!(offset, ratio, skip, align = self.shutter_lag_zero_align(), "Continuous burst offset");
        Ok(offset)
    }
}

/// Offline-capture bookkeeping for the node that reads from the ring
#[derive(Debug)]
pub struct ContinuousCapture {
    timing: ContinuousTiming,
    /// Config the ring was sized for at preview start
    preview_config: Option<ContinuousCaptureConfig>,
    prepared: bool,
    running: bool,
}

impl ContinuousCapture {
    pub fn new(timing: ContinuousTiming) -> Self {
        Self {
            timing,
            preview_config: None,
            prepared: false,
            running: false,
        }
    }

    pub fn timing(&self) -> &ContinuousTiming {
        &self.timing
    }

    pub fn preview_config(&self) -> Option<ContinuousCaptureConfig> {
        self.preview_config
    }

    pub fn is_prepared(&self) -> bool {
        self.prepared
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn raw_buffer_lock(&self) -> bool {
        self.preview_config.is_some_and(|c| c.raw_buffer_lock)
    }

    /// Store the capture shape the ring must be able to serve
    pub fn prepare(&mut self, cfg: ContinuousCaptureConfig) -> HalResult<()> {
        let min = self.timing.neg_min_offset();
        if cfg.offset < min && !cfg.raw_buffer_lock {
            error!(offset = cfg.offset, min, "Continuous offset not supported");
            return Err(HalError::InvalidArgument(format!(
                "offset {} below minimum {}",
                cfg.offset, min
            )));
        }
        info!(
            captures = cfg.num_captures,
            offset = cfg.offset,
            skip = cfg.skip,
            raw_lock = cfg.raw_buffer_lock,
            "Offline capture prepared"
        );
        self.preview_config = Some(cfg);
        self.prepared = true;
        Ok(())
    }

    /// Enable continuous mode and size the ring on `main` before preview starts
    pub fn configure_ring_buffer(&self, main: &mut V4l2Device) -> HalResult<i32> {
        let cfg = self.preview_config.unwrap_or_default();
        let size = self.timing.ring_buffer_size(&cfg);
        main.set_control(V4L2_CID_ATOMISP_CONTINUOUS_MODE, 1)?;
        main.set_control(V4L2_CID_ATOMISP_CONTINUOUS_RAW_BUFFER_SIZE, size)?;
        main.set_control(V4L2_CID_ENABLE_RAW_BUFFER_LOCK, i32::from(cfg.raw_buffer_lock))?;
        info!(size, captures = cfg.num_captures, offset = cfg.offset, "Continuous ring buffer configured");
        Ok(size)
    }

    /// Request frames from the ring and start streaming them out of `main`
    pub fn start(&mut self, main: &mut VideoNode, mut cfg: ContinuousCaptureConfig, initial_skips: u32) -> HalResult<()> {
        let Some(preview) = self.preview_config else {
            return Err(HalError::InvalidOperation("offline capture not prepared".to_string()));
        };
        if cfg.offset < 0 && cfg.offset < preview.offset {
            error!(offset = cfg.offset, preview = preview.offset, "Offset deeper than prepared ring");
            return Err(HalError::InvalidArgument(format!(
                "offset {} exceeds {} set at preview start",
                cfg.offset, preview.offset
            )));
        }
        if cfg.num_captures > preview.num_captures {
            error!(captures = cfg.num_captures, preview = preview.num_captures, "More captures than prepared");
            return Err(HalError::InvalidArgument(format!(
                "{} captures exceed {} set at preview start",
                cfg.num_captures, preview.num_captures
            )));
        }

        // Frames the preview is still skipping after stream-on sit in the ring too
        cfg.offset += initial_skips as i32;
        request_continuous_capture(main.device(), &cfg)?;
        main.start(0)?;
        self.running = true;
        Ok(())
    }

    /// Stream off the capture node, keeping its buffers for the next burst
    pub fn stop(&mut self, main: &mut VideoNode) -> HalResult<()> {
        main.stop(true)?;
        self.running = false;
        self.prepared = true;
        Ok(())
    }

    pub fn raw_buffer_unlock(&self, main: &mut V4l2Device, exposure_id: i32) -> HalResult<()> {
        if !self.raw_buffer_lock() {
            warn!(exposure_id, "Raw buffer unlock without raw buffer lock mode");
            return Err(HalError::InvalidOperation("raw buffer lock not enabled".to_string()));
        }
        main.ensure_open("raw_buffer_unlock")?;
        main.driver()
            .unlock_raw_buffer(exposure_id)
            .map_err(|e| main.driver_error("ATOMISP_IOC_EXP_ID_UNLOCK", e))
    }

    pub fn raw_buffer_capture(&self, main: &mut V4l2Device, exposure_id: i32) -> HalResult<()> {
        if !self.raw_buffer_lock() {
            warn!(exposure_id, "Raw buffer capture without raw buffer lock mode");
            return Err(HalError::InvalidOperation("raw buffer lock not enabled".to_string()));
        }
        main.ensure_open("raw_buffer_capture")?;
        main.driver()
            .capture_raw_buffer(exposure_id)
            .map_err(|e| main.driver_error("ATOMISP_IOC_EXP_ID_CAPTURE", e))
    }
}

fn request_continuous_capture(main: &mut V4l2Device, cfg: &ContinuousCaptureConfig) -> HalResult<()> {
    main.ensure_open("request_continuous_capture")?;
    let mut conf = AtomispContCaptureConfig::zeroed();
    conf.num_captures = cfg.num_captures;
    conf.offset = cfg.offset;
    conf.skip_frames = cfg.skip;
    main.driver()
        .set_continuous_capture(&mut conf)
        .map_err(|e| main.driver_error("ATOMISP_IOC_S_CONT_CAPTURE_CONFIG", e))?;
    debug!(captures = cfg.num_captures, offset = cfg.offset, skip = cfg.skip, "Continuous capture requested");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timing(css: u32) -> ContinuousTiming {
        ContinuousTiming {
            max_ring: 10,
            css_major_version: css,
            shutter_lag_ms: 40,
            preview_fps: 30.0,
        }
    }

    fn cfg(num_captures: i32, offset: i32) -> ContinuousCaptureConfig {
        ContinuousCaptureConfig {
            num_captures,
            offset,
            ..Default::default()
        }
    }

    #[test]
    fn ring_grows_with_lookback() {
        let t = timing(1);
        assert_eq!(t.ring_buffer_size(&cfg(1, -4)), 3 + 4);
        assert_eq!(t.ring_buffer_size(&cfg(3, -1)), 3 + 3);
        // Lookback ignored while frames can be locked
        let locked = ContinuousCaptureConfig {
            raw_buffer_lock: true,
            ..cfg(2, -6)
        };
        assert_eq!(t.ring_buffer_size(&locked), 3 + 2);
        // Clamped to the deepest supported ring
        assert_eq!(t.ring_buffer_size(&cfg(1, -20)), 10);
    }

    #[test]
    fn css2_ring_floor_and_infinite_capture() {
        let t = timing(2);
        // 3 + 1 - 1 = 3, raised to the CSS2 floor
        assert_eq!(t.ring_buffer_size(&cfg(1, -1)), 5);
        assert_eq!(t.ring_buffer_size(&cfg(-1, 0)), 7);
    }

    #[test]
    fn offsets_align_to_shutter_lag() {
        let t = timing(1);
        assert_eq!(t.neg_min_offset(), -8);
        // 40 ms at 30 fps is 1.2 frames
        assert_eq!(t.shutter_lag_zero_align(), 1);
        assert_eq!(t.neg_offset(0, 0).unwrap(), -1);
        assert_eq!(t.neg_offset(1, -2).unwrap(), -5);
        assert!(t.neg_offset(0, 1).is_err());
    }

    #[test]
    fn prepare_rejects_offsets_past_the_ring() {
        let mut cc = ContinuousCapture::new(timing(1));
        assert!(cc.prepare(cfg(1, -9)).is_err());
        assert!(!cc.is_prepared());
        let locked = ContinuousCaptureConfig {
            raw_buffer_lock: true,
            ..cfg(1, -9)
        };
        assert!(cc.prepare(locked).is_ok());
        assert!(cc.raw_buffer_lock());
    }
}
