// SPDX-License-Identifier: GPL-3.0-only

//! Commands understood by the capture controller worker

use super::continuous::ContinuousCaptureConfig;
use super::streams::{NodeRole, StreamConfig};
use crate::buffer::{CameraBuffer, StreamId};
use crate::message_queue::Reply;
use crate::poller::PollEvent;
use crate::v4l2::VideoNodeState;
use crate::v4l2::sys::V4l2Buffer;
use std::sync::Arc;

/// Controller operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CaptureMode {
    #[default]
    None,
    Configured,
    Preview,
    Video,
    Capture,
    ContinuousCapture,
    ContinuousVideo,
}

impl CaptureMode {
    pub const ALL: [CaptureMode; 7] = [
        CaptureMode::None,
        CaptureMode::Configured,
        CaptureMode::Preview,
        CaptureMode::Video,
        CaptureMode::Capture,
        CaptureMode::ContinuousCapture,
        CaptureMode::ContinuousVideo,
    ];

    pub fn display_name(&self) -> &'static str {
        match self {
            CaptureMode::None => "none",
            CaptureMode::Configured => "configured",
            CaptureMode::Preview => "preview",
            CaptureMode::Video => "video",
            CaptureMode::Capture => "capture",
            CaptureMode::ContinuousCapture => "continuous-capture",
            CaptureMode::ContinuousVideo => "continuous-video",
        }
    }

    /// Modes `start` can enter
    pub fn is_streaming(&self) -> bool {
        !matches!(self, CaptureMode::None | CaptureMode::Configured)
    }

    pub fn is_continuous(&self) -> bool {
        matches!(self, CaptureMode::ContinuousCapture | CaptureMode::ContinuousVideo)
    }
}

/// One framework request: at most one buffer per configured stream
#[derive(Debug, Clone)]
pub struct CaptureRequest {
    pub id: u32,
    pub buffers: Vec<Arc<CameraBuffer>>,
    /// Tag descriptors so the ISP applies settings queued for this request
    pub per_frame_settings: bool,
}

impl CaptureRequest {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            buffers: Vec::new(),
            per_frame_settings: false,
        }
    }

    pub fn with_buffer(mut self, buffer: Arc<CameraBuffer>) -> Self {
        self.buffers.push(buffer);
        self
    }

    pub fn buffer_for(&self, stream: StreamId) -> Option<&Arc<CameraBuffer>> {
        self.buffers.iter().find(|b| b.stream() == Some(stream))
    }
}

/// Event raised by the ISP front end for a frame still in flight
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEventKind {
    RawBayer,
    MipiCompressed,
    Statistics,
    Unsupported(u32),
}

#[derive(Debug, Clone)]
pub struct DeviceEvent {
    pub kind: DeviceEventKind,
    /// Descriptor of the frame the event refers to; matched by user pointer
    pub descriptor: V4l2Buffer,
    pub request_id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpareState {
    Free,
    /// Queued to the node, poll not yet armed
    Queued,
    QueuedAndPolling,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    pub role: NodeRole,
    pub state: VideoNodeState,
    pub stream: Option<StreamId>,
    pub buffers_in_device: i32,
    pub frame_count: i32,
    pub in_flight: usize,
    pub spare: Option<SpareState>,
    /// Times the spare buffer went to the driver
    pub spare_queued_total: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerStatus {
    pub mode: CaptureMode,
    pub nodes: Vec<NodeStatus>,
}

impl ControllerStatus {
    pub fn node(&self, role: NodeRole) -> Option<&NodeStatus> {
        self.nodes.iter().find(|n| n.role == role)
    }
}

pub(crate) enum ControllerMessage {
    Configure {
        streams: Vec<StreamConfig>,
        reply: Reply<()>,
    },
    Start {
        mode: CaptureMode,
        reply: Reply<()>,
    },
    Stop {
        reply: Reply<()>,
    },
    Capture {
        request: CaptureRequest,
    },
    /// Poll result; answered with the number of spare frames dropped
    Notify {
        event: PollEvent,
        reply: Reply<usize>,
    },
    Flush {
        reply: Reply<()>,
    },
    ReturnBuffer {
        buffer: Arc<CameraBuffer>,
    },
    DeviceEvent {
        event: DeviceEvent,
    },
    PrepareOffline {
        config: ContinuousCaptureConfig,
        reply: Reply<()>,
    },
    StartOffline {
        config: ContinuousCaptureConfig,
        reply: Reply<()>,
    },
    StopOffline {
        reply: Reply<()>,
    },
    RawBufferUnlock {
        exposure_id: i32,
        reply: Reply<()>,
    },
    RawBufferCapture {
        exposure_id: i32,
        reply: Reply<()>,
    },
    Status {
        reply: Reply<ControllerStatus>,
    },
    Exit,
}

impl ControllerMessage {
    /// Work a flush discards
    pub(crate) fn is_flushable(&self) -> bool {
        matches!(self, ControllerMessage::Capture { .. } | ControllerMessage::Notify { .. })
    }
}
