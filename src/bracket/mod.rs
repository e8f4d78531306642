// SPDX-License-Identifier: GPL-3.0-only

//! Exposure and focus bracketing
//!
//! A burst of `burst_length` frames is captured with a different exposure
//! compensation (or focus position) for each frame. Two engines exist:
//!
//! - [`online::OnlineBracket`] pushes each value to the 3A controls while the
//!   sensor streams, one or two frames ahead of the frame it should affect,
//!   and recovers from frames lost on the way.
//! - [`offline::OfflineBracket`] asks the ISP for the burst out of its raw
//!   ring buffer, where the frames already exist.
//!
//! Both tag every delivered frame with the [`BracketValue`] that produced it.

pub mod offline;
pub mod online;

pub use offline::{OfflineBracket, OfflineCaptureSource, OfflinePlan};
pub use online::{BracketState, OnlineBracket};

use crate::buffer::CameraBuffer;
use crate::errors::{HalError, HalResult};
use crate::v4l2::FrameStatus;
use crate::v4l2::V4l2Device;
use crate::v4l2::controls::{
    V4L2_CID_EXPOSURE_ABSOLUTE, V4L2_CID_EXPOSURE_AUTO, V4L2_CID_FOCUS_ABSOLUTE, V4L2_CID_FOCUS_AUTO,
    V4L2_CID_GAIN, V4L2_EXPOSURE_MANUAL,
};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Exposure compensation range of the bracketing sequence
pub const EV_MIN: f32 = -2.0;
pub const EV_MAX: f32 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BracketMode {
    #[default]
    None,
    Exposure,
    Focus,
}

impl BracketMode {
    pub const ALL: [BracketMode; 3] = [BracketMode::None, BracketMode::Exposure, BracketMode::Focus];

    pub fn display_name(&self) -> &'static str {
        match self {
            BracketMode::None => "none",
            BracketMode::Exposure => "exposure",
            BracketMode::Focus => "focus",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BracketRequest {
    pub mode: BracketMode,
    pub burst_length: u32,
    /// Frames dropped after each captured frame to reach the target rate
    pub fps_adapt_skip: u32,
    /// Custom EV sequence; evenly spaced from EV_MIN to EV_MAX when absent
    pub values: Option<Vec<f32>>,
}

impl BracketRequest {
    pub fn exposure(burst_length: u32, fps_adapt_skip: u32) -> Self {
        Self {
            mode: BracketMode::Exposure,
            burst_length,
            fps_adapt_skip,
            values: None,
        }
    }

    pub fn focus(burst_length: u32, fps_adapt_skip: u32) -> Self {
        Self {
            mode: BracketMode::Focus,
            burst_length,
            fps_adapt_skip,
            values: None,
        }
    }

    pub fn with_values(mut self, values: Vec<f32>) -> Self {
        self.values = Some(values);
        self
    }

    /// A single-frame burst has nothing to bracket
    pub fn effective_mode(&self) -> BracketMode {
        if self.burst_length > 1 { self.mode } else { BracketMode::None }
    }

    pub fn validate(&self) -> HalResult<()> {
        if self.burst_length == 0 {
            return Err(HalError::InvalidArgument("empty bracketing burst".to_string()));
        }
        if let Some(values) = &self.values {
            if values.len() < self.burst_length as usize {
                return Err(HalError::InvalidArgument(format!(
                    "{} bracket values for a burst of {}",
                    values.len(),
                    self.burst_length
                )));
            }
        }
        Ok(())
    }
}

/// Per-frame value sequence for `request`
///
/// Custom exposure values are clamped to the supported range. Focus
/// bracketing walks step indices `0..burst_length`.
pub fn bracket_values(request: &BracketRequest) -> Vec<f32> {
    let length = request.burst_length as usize;
    match request.effective_mode() {
        BracketMode::None => Vec::new(),
        BracketMode::Focus => (0..length).map(|step| step as f32).collect(),
        BracketMode::Exposure => match &request.values {
            Some(values) => values
                .iter()
                .take(length)
                .map(|&ev| {
                    if ev > EV_MAX {
                        warn!(ev, "Too high exposure value");
                    } else if ev < EV_MIN {
                        warn!(ev, "Too low exposure value");
                    }
                    ev.clamp(EV_MIN, EV_MAX)
                })
                .collect(),
            None => {
                let step = (EV_MAX - EV_MIN) / (length - 1) as f32;
                (0..length).map(|i| EV_MIN + step * i as f32).collect()
            }
        },
    }
}

/// Exposure parameters in effect when a bracket value was applied
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct AeConfig {
    pub ev_bias: f32,
    /// 100 µs units
    pub exposure_time: i32,
    pub analog_gain: i32,
}

/// One applied bracket step, queued until the frame it affects is captured
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BracketValue {
    /// Position in the burst
    pub index: u32,
    pub value: f32,
    pub ae: Option<AeConfig>,
}

/// A frame handed out by a [`SnapshotSource`]
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub buffer: Arc<CameraBuffer>,
    /// Device slot, needed to give the frame back
    pub index: u32,
    pub sequence: u32,
    pub timestamp: i64,
    pub status: FrameStatus,
}

/// A bracketed frame and the value it was captured with
#[derive(Debug, Clone)]
pub struct BracketFrame {
    pub snapshot: Snapshot,
    pub value: Option<BracketValue>,
}

/// Frames from a streaming still-capture node
pub trait SnapshotSource: Send {
    /// Block until the next frame is available
    fn get_snapshot(&mut self) -> HalResult<Snapshot>;
    /// Give a frame back to the device
    fn put_snapshot(&mut self, snapshot: Snapshot) -> HalResult<()>;
}

/// The slice of 3A the bracketing engines drive
pub trait AaaControls: Send {
    /// Switch AE to manual so bracket values stick
    fn init_ae_bracketing(&mut self) -> HalResult<()>;
    fn apply_ev(&mut self, ev: f32) -> HalResult<()>;
    fn exposure_info(&mut self) -> HalResult<AeConfig>;
    /// Prepare `steps` focus positions around the current one
    fn init_af_bracketing(&mut self, steps: u32) -> HalResult<()>;
    fn set_manual_focus_increment(&mut self, step: i32) -> HalResult<()>;
}

/// 3A bracketing straight on the sensor's V4L2 controls
///
/// EV offsets scale the exposure time captured at init; focus steps move the
/// lens symmetrically around its position at init.
pub struct V4l2AaaControls {
    device: V4l2Device,
    base_exposure: i32,
    focus_base: i32,
    focus_step: i32,
    focus_steps: u32,
}

impl V4l2AaaControls {
    pub fn new(device: V4l2Device, focus_step: i32) -> Self {
        Self {
            device,
            base_exposure: 0,
            focus_base: 0,
            focus_step,
            focus_steps: 0,
        }
    }

    pub fn device(&mut self) -> &mut V4l2Device {
        &mut self.device
    }
}

impl AaaControls for V4l2AaaControls {
    fn init_ae_bracketing(&mut self) -> HalResult<()> {
        self.base_exposure = self.device.get_control(V4L2_CID_EXPOSURE_ABSOLUTE)?;
        self.device.set_control(V4L2_CID_EXPOSURE_AUTO, V4L2_EXPOSURE_MANUAL)?;
        debug!(base_exposure = self.base_exposure, "AE bracketing initialized");
        Ok(())
    }

    fn apply_ev(&mut self, ev: f32) -> HalResult<()> {
        let exposure = (self.base_exposure as f32 * 2f32.powf(ev)).round().max(1.0) as i32;
        self.device.set_control(V4L2_CID_EXPOSURE_ABSOLUTE, exposure)
    }

    fn exposure_info(&mut self) -> HalResult<AeConfig> {
        Ok(AeConfig {
            ev_bias: 0.0,
            exposure_time: self.device.get_control(V4L2_CID_EXPOSURE_ABSOLUTE)?,
            analog_gain: self.device.get_control(V4L2_CID_GAIN)?,
        })
    }

    fn init_af_bracketing(&mut self, steps: u32) -> HalResult<()> {
        self.device.set_control(V4L2_CID_FOCUS_AUTO, 0)?;
        self.focus_base = self.device.get_control(V4L2_CID_FOCUS_ABSOLUTE)?;
        self.focus_steps = steps;
        Ok(())
    }

    fn set_manual_focus_increment(&mut self, step: i32) -> HalResult<()> {
        let centered = step - (self.focus_steps as i32) / 2;
        let position = self.focus_base + centered * self.focus_step;
        self.device.set_control(V4L2_CID_FOCUS_ABSOLUTE, position)
    }
}

/// Progress through one burst
///
/// `applied` counts bracket values pushed to 3A, `captured` frames accepted
/// into the burst and `delivered` frames handed to the caller. Always
/// `delivered <= captured <= burst_length` and `applied <= burst_length`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BurstProgress {
    pub burst_length: u32,
    pub applied: u32,
    pub captured: u32,
    pub delivered: u32,
    /// Recoveries performed so far
    pub retries: u32,
}

impl BurstProgress {
    pub fn new(burst_length: u32) -> Self {
        Self {
            burst_length,
            ..Default::default()
        }
    }

    pub fn check(&self) -> HalResult<()> {
        if self.delivered <= self.captured
            && self.captured <= self.burst_length
            && self.applied <= self.burst_length
        {
            return Ok(());
        }
        error!(progress = ?self, "Bracket burst counters out of order");
        Err(HalError::InvariantViolation(format!("burst progress {:?}", self)))
    }

    pub fn can_apply(&self) -> bool {
        self.applied < self.burst_length
    }

    pub fn record_applied(&mut self) -> HalResult<()> {
        self.applied += 1;
        self.check()
    }

    pub fn record_captured(&mut self) -> HalResult<()> {
        self.captured += 1;
        self.check()
    }

    pub fn record_delivered(&mut self) -> HalResult<()> {
        self.delivered += 1;
        self.check()
    }

    /// Restart value application from the first frame not yet captured
    pub fn rewind_to_captured(&mut self) {
        self.applied = self.captured;
    }

    pub fn all_captured(&self) -> bool {
        self.captured >= self.burst_length
    }

    pub fn ready_to_deliver(&self) -> bool {
        self.captured > self.delivered
    }
}

/// Applied values waiting for their frames, oldest first
#[derive(Debug, Default)]
pub struct ValueQueue {
    values: VecDeque<BracketValue>,
}

impl ValueQueue {
    pub fn push(&mut self, value: BracketValue) {
        self.values.push_back(value);
    }

    pub fn pop(&mut self) -> Option<BracketValue> {
        self.values.pop_front()
    }

    /// Forget values applied for frames that were lost
    pub fn discard_from(&mut self, index: u32) {
        self.values.retain(|v| v.index < index);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }
}

/// Counts frames missing between consecutive sequence numbers
#[derive(Debug, Default, Clone, Copy)]
pub struct SequenceTracker {
    last: Option<u32>,
}

impl SequenceTracker {
    pub fn reset(&mut self) {
        self.last = None;
    }

    pub fn last(&self) -> Option<u32> {
        self.last
    }

    /// Record `sequence`, returning how many frames went missing before it
    pub fn observe(&mut self, sequence: u32) -> u32 {
        let lost = match self.last {
            Some(last) if sequence != last.wrapping_add(1) => {
                let lost = sequence.wrapping_sub(last).wrapping_sub(1);
                error!(lost, sequence, previous = last, "Frames lost");
                lost
            }
            _ => 0,
        };
        self.last = Some(sequence);
        lost
    }
}
