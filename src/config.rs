// SPDX-License-Identifier: GPL-3.0-only

//! HAL configuration
//!
//! Loaded from `$XDG_CONFIG_HOME/camera-hal/config.json`. A missing or
//! unreadable file falls back to [`HalConfig::default`], matching the kernel
//! node layout of the reference CIF platform.

use crate::constants::{
    DEFAULT_BUFFER_COUNT, DEFAULT_EXPOSURE_LAG, DEFAULT_MAX_CONTINUOUS_RAW_RING,
    DEFAULT_PREVIEW_FPS, POLL_TIMEOUT_MS,
};
use crate::errors::{HalError, HalResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const CONFIG_DIR: &str = "camera-hal";
const CONFIG_FILE: &str = "config.json";

/// Device node paths for one camera
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodePaths {
    /// Preview/overlay video node
    pub overlay: String,
    /// Main capture (still/video) node
    pub capture: String,
    /// ISP parameter/statistics node
    pub isp: String,
    /// Sub-device delivering frame-sync events
    pub event_subdev: Option<String>,
}

impl Default for NodePaths {
    fn default() -> Self {
        Self {
            overlay: "/dev/video0".to_string(),
            capture: "/dev/video1".to_string(),
            isp: "/dev/video2".to_string(),
            event_subdev: None,
        }
    }
}

/// Sensor and ISP properties the capture core consumes but does not compute
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorSettings {
    /// Frames between applying an exposure and seeing it in the output
    pub exposure_lag: u32,
    /// ISP firmware generation; 2 adds one frame of exposure lag
    pub css_major_version: u32,
    /// Frames to mark corrupted after stream-on
    pub initial_skip_frames: u32,
    /// Shutter lag the continuous mode compensates, in milliseconds
    pub shutter_lag_compensation_ms: u32,
    /// Deepest raw ring buffer the ISP supports
    pub max_continuous_raw_ring: i32,
    /// Driver can lock raw frames in the ring until explicitly released
    pub raw_buffer_lock: bool,
}

impl Default for SensorSettings {
    fn default() -> Self {
        Self {
            exposure_lag: DEFAULT_EXPOSURE_LAG,
            css_major_version: 1,
            initial_skip_frames: 0,
            shutter_lag_compensation_ms: 40,
            max_continuous_raw_ring: DEFAULT_MAX_CONTINUOUS_RAW_RING,
            raw_buffer_lock: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HalConfig {
    /// Media controller device
    pub media_device: String,
    /// Node paths indexed by camera id
    pub cameras: Vec<NodePaths>,
    pub sensor: SensorSettings,
    /// Preview frame rate used for shutter-lag alignment
    pub preview_fps: f32,
    /// Poll timeout per request, in milliseconds
    pub poll_timeout_ms: u32,
    /// Buffers per stream when the client does not specify
    pub buffer_count: u32,
    /// Queue a spare buffer when a node is down to its last buffer
    pub extra_buffer_quirk: bool,
    /// Register buffers as cached (skips cache maintenance flags)
    pub cached_buffers: bool,
}

impl Default for HalConfig {
    fn default() -> Self {
        Self {
            media_device: "/dev/media0".to_string(),
            cameras: vec![NodePaths::default()],
            sensor: SensorSettings::default(),
            preview_fps: DEFAULT_PREVIEW_FPS,
            poll_timeout_ms: POLL_TIMEOUT_MS,
            buffer_count: DEFAULT_BUFFER_COUNT,
            extra_buffer_quirk: true,
            cached_buffers: false,
        }
    }
}

impl HalConfig {
    /// Default location of the config file
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(CONFIG_DIR).join(CONFIG_FILE))
    }

    /// Load from the default location, falling back to defaults
    pub fn load() -> Self {
        match Self::default_path() {
            Some(path) => Self::load_or_default(&path),
            None => {
                warn!("No config directory available, using defaults");
                Self::default()
            }
        }
    }

    /// Load from `path`, falling back to defaults on any failure
    pub fn load_or_default(path: &Path) -> Self {
        if !path.exists() {
            debug!(path = %path.display(), "Config file not found, using defaults");
            return Self::default();
        }
        match Self::load_from(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to load config, using defaults");
                Self::default()
            }
        }
    }

    pub fn load_from(path: &Path) -> HalResult<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| HalError::Config(format!("{}: {}", path.display(), e)))?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        info!(path = %path.display(), "Loaded HAL config");
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> HalResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| HalError::Config(format!("{}: {}", parent.display(), e)))?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .map_err(|e| HalError::Config(format!("{}: {}", path.display(), e)))?;
        Ok(())
    }

    pub fn validate(&self) -> HalResult<()> {
        if self.cameras.is_empty() {
            return Err(HalError::Config("no cameras configured".to_string()));
        }
        if self.preview_fps <= 0.0 {
            return Err(HalError::Config(format!(
                "preview_fps must be positive, got {}",
                self.preview_fps
            )));
        }
        if self.buffer_count == 0 {
            return Err(HalError::Config("buffer_count must be at least 1".to_string()));
        }
        if self.sensor.max_continuous_raw_ring < 2 {
            return Err(HalError::Config(format!(
                "max_continuous_raw_ring must be at least 2, got {}",
                self.sensor.max_continuous_raw_ring
            )));
        }
        Ok(())
    }

    /// Exposure lag in frames, including the extra frame of CSS 2.x firmware
    pub fn effective_exposure_lag(&self) -> u32 {
        let lag = if self.sensor.exposure_lag == 0 {
            DEFAULT_EXPOSURE_LAG
        } else {
            self.sensor.exposure_lag
        };
        if self.sensor.css_major_version == 2 {
            lag + 1
        } else {
            lag
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_lag_falls_back_to_default() {
        let mut config = HalConfig::default();
        config.sensor.exposure_lag = 0;
        assert_eq!(config.effective_exposure_lag(), DEFAULT_EXPOSURE_LAG);
        config.sensor.css_major_version = 2;
        assert_eq!(config.effective_exposure_lag(), DEFAULT_EXPOSURE_LAG + 1);
    }

    #[test]
    fn validate_rejects_empty_camera_list() {
        let config = HalConfig {
            cameras: Vec::new(),
            ..HalConfig::default()
        };
        assert!(matches!(config.validate(), Err(HalError::Config(_))));
    }
}
