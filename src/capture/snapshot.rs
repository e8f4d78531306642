// SPDX-License-Identifier: GPL-3.0-only

//! Still-capture node driven synchronously for bracketing
//!
//! Unlike the capture controller, which hands client buffers to the driver
//! per request, a [`SnapshotDevice`] owns a private heap pool, keeps every
//! free buffer queued and hands frames out one at a time.

use super::continuous::{ContinuousCapture, ContinuousCaptureConfig, ContinuousTiming};
use crate::bracket::{OfflineCaptureSource, Snapshot, SnapshotSource};
use crate::buffer::{CameraBuffer, allocate_heap_pool};
use crate::config::HalConfig;
use crate::errors::{HalError, HalResult};
use crate::v4l2::{FrameInfo, MemoryType, VideoNode, VideoNodeState};
use std::sync::Arc;
use tracing::{debug, error, info};

pub struct SnapshotDevice {
    node: VideoNode,
    buffers: Vec<Arc<CameraBuffer>>,
    continuous: ContinuousCapture,
    poll_timeout_ms: i32,
    cached: bool,
}

impl SnapshotDevice {
    pub fn new(node: VideoNode, config: &HalConfig) -> Self {
        Self {
            node,
            buffers: Vec::new(),
            continuous: ContinuousCapture::new(ContinuousTiming::from_config(config)),
            poll_timeout_ms: config.poll_timeout_ms as i32,
            cached: config.cached_buffers,
        }
    }

    pub fn node(&self) -> &VideoNode {
        &self.node
    }

    pub fn node_mut(&mut self) -> &mut VideoNode {
        &mut self.node
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    /// Negotiate the still format and register `count` heap buffers
    pub fn configure(&mut self, width: u32, height: u32, v4l2_format: u32, count: usize) -> HalResult<FrameInfo> {
        if self.node.state() == VideoNodeState::Closed {
            self.node.open()?;
        }
        let mut info = FrameInfo::new(width, height, v4l2_format);
        self.node.set_format(&mut info)?;
        let buffers = allocate_heap_pool(count, info.width, info.height, info.stride, info.format)?;
        let pool = buffers.iter().map(|b| b.as_buffer_info()).collect();
        self.node.set_buffer_pool(pool, self.cached, MemoryType::UserPtr)?;
        self.buffers = buffers;
        info!(device = %self.node.name(), width = info.width, height = info.height, count, "Snapshot pool ready");
        Ok(info)
    }

    /// Stream on with every buffer queued
    pub fn start(&mut self, initial_skips: u32) -> HalResult<()> {
        self.node.start(initial_skips)?;
        self.queue_free_buffers()
    }

    pub fn stop(&mut self) -> HalResult<()> {
        if self.node.is_started() {
            self.node.stop(true)?;
        }
        Ok(())
    }

    /// Stream off and release the pool
    pub fn release(&mut self) -> HalResult<()> {
        match self.node.state() {
            VideoNodeState::Started | VideoNodeState::Prepared => self.node.stop(false)?,
            _ => {}
        }
        self.buffers.clear();
        Ok(())
    }

    fn queue_free_buffers(&mut self) -> HalResult<()> {
        for index in 0..self.node.buffer_count() {
            let queued = self.node.buffer(index).is_some_and(|b| b.is_queued());
            if !queued {
                self.node.put_frame(index as u32)?;
            }
        }
        debug!(device = %self.node.name(), queued = self.node.buffers_in_device(), "Snapshot buffers queued");
        Ok(())
    }
}

impl SnapshotSource for SnapshotDevice {
    fn get_snapshot(&mut self) -> HalResult<Snapshot> {
        let ret = self.node.poll(self.poll_timeout_ms);
        if ret == 0 {
            error!(device = %self.node.name(), timeout_ms = self.poll_timeout_ms, "Snapshot poll timed out");
            return Err(HalError::Driver {
                call: "poll",
                errno: libc::ETIMEDOUT,
            });
        }
        if ret < 0 {
            return Err(HalError::Driver {
                call: "poll",
                errno: -ret,
            });
        }
        let vbuf = self.node.grab_frame()?;
        let buffer = self.buffers.get(vbuf.index as usize).cloned().ok_or_else(|| {
            HalError::InvariantViolation(format!("snapshot index {} has no buffer", vbuf.index))
        })?;
        let timestamp = vbuf.timestamp_us();
        buffer.set_capture_info(timestamp, vbuf.sequence);
        Ok(Snapshot {
            buffer,
            index: vbuf.index,
            sequence: vbuf.sequence,
            timestamp,
            status: vbuf.frame_status(),
        })
    }

    fn put_snapshot(&mut self, snapshot: Snapshot) -> HalResult<()> {
        self.node.put_frame(snapshot.index)
    }
}

impl OfflineCaptureSource for SnapshotDevice {
    fn prepare_offline_capture(&mut self, config: &ContinuousCaptureConfig) -> HalResult<()> {
        self.continuous.prepare(*config)
    }

    fn start_offline_capture(&mut self, config: &ContinuousCaptureConfig) -> HalResult<()> {
        self.continuous.start(&mut self.node, *config, 0)?;
        self.queue_free_buffers()
    }

    fn stop_offline_capture(&mut self) -> HalResult<()> {
        self.continuous.stop(&mut self.node)
    }
}
