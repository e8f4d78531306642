// SPDX-License-Identifier: GPL-3.0-only

//! Offline bracketing out of the continuous raw ring
//!
//! The ISP already holds recent raw frames, so the burst is a single
//! continuous-capture request: `burst_length` frames starting at a negative
//! offset, keeping one of every `fps_adapt_skip + 1`. Nothing is applied
//! per frame; frames are tagged with their burst value in arrival order and
//! sequence gaps are only reported.

use super::{BracketFrame, BracketRequest, BracketValue, SequenceTracker, SnapshotSource, bracket_values};
use crate::capture::continuous::{ContinuousCaptureConfig, ContinuousTiming};
use crate::errors::{HalError, HalResult};
use tracing::{debug, info, warn};

/// A still-capture node that can read back from the raw ring
pub trait OfflineCaptureSource: SnapshotSource {
    fn prepare_offline_capture(&mut self, config: &ContinuousCaptureConfig) -> HalResult<()>;
    fn start_offline_capture(&mut self, config: &ContinuousCaptureConfig) -> HalResult<()>;
    fn stop_offline_capture(&mut self) -> HalResult<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct OfflinePlan {
    pub values: Vec<f32>,
    pub config: ContinuousCaptureConfig,
}

pub struct OfflineBracket {
    timing: ContinuousTiming,
}

impl OfflineBracket {
    pub fn new(timing: ContinuousTiming) -> Self {
        Self { timing }
    }

    /// Ring request for `request`, with the first frame at output index `start_index` (<= 0)
    pub fn plan(&self, request: &BracketRequest, start_index: i32) -> HalResult<OfflinePlan> {
        request.validate()?;
        let skip = request.fps_adapt_skip;
        let offset = self.timing.neg_offset(skip, start_index)?;
        let config = ContinuousCaptureConfig {
            num_captures: request.burst_length as i32,
            offset,
            skip,
            raw_buffer_lock: false,
            capture_priority: false,
        };
        debug!(?config, "Offline bracket plan");
        Ok(OfflinePlan {
            values: bracket_values(request),
            config,
        })
    }

    /// Capture the whole burst described by `plan`
    pub fn run(&self, source: &mut dyn OfflineCaptureSource, plan: &OfflinePlan) -> HalResult<Vec<BracketFrame>> {
        let count = plan.config.num_captures;
        if count <= 0 {
            return Err(HalError::InvalidArgument(format!("offline burst of {} frames", count)));
        }
        source.prepare_offline_capture(&plan.config)?;
        source.start_offline_capture(&plan.config)?;
        info!(count, offset = plan.config.offset, skip = plan.config.skip, "Offline bracketing started");

        let result = Self::collect(source, plan, count as u32);
        let stopped = source.stop_offline_capture();
        let frames = result?;
        stopped?;
        Ok(frames)
    }

    fn collect(source: &mut dyn OfflineCaptureSource, plan: &OfflinePlan, count: u32) -> HalResult<Vec<BracketFrame>> {
        let mut tracker = SequenceTracker::default();
        let mut frames = Vec::with_capacity(count as usize);
        for index in 0..count {
            let snapshot = match source.get_snapshot() {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    for frame in frames.drain(..) {
                        let BracketFrame { snapshot, .. } = frame;
                        if let Err(put) = source.put_snapshot(snapshot) {
                            warn!(error = %put, "Failed to return offline bracket frame");
                        }
                    }
                    return Err(e);
                }
            };
            let lost = tracker.observe(snapshot.sequence);
            if lost > 0 {
                warn!(lost, index, "Gap in offline bracket burst");
            }
            let value = plan.values.get(index as usize).map(|&value| BracketValue { index, value, ae: None });
            frames.push(BracketFrame { snapshot, value });
        }
        Ok(frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timing() -> ContinuousTiming {
        ContinuousTiming {
            max_ring: 30,
            css_major_version: 1,
            shutter_lag_ms: 0,
            preview_fps: 30.0,
        }
    }

    #[test]
    fn plan_spans_skip_ratio() {
        let bracket = OfflineBracket::new(timing());
        let plan = bracket.plan(&BracketRequest::exposure(3, 1), -2).unwrap();
        assert_eq!(plan.config.num_captures, 3);
        assert_eq!(plan.config.offset, -4);
        assert_eq!(plan.config.skip, 1);
        assert_eq!(plan.values, vec![-2.0, 0.0, 2.0]);
    }

    #[test]
    fn plan_rejects_positive_start() {
        let bracket = OfflineBracket::new(timing());
        assert!(bracket.plan(&BracketRequest::exposure(3, 0), 1).is_err());
    }
}
