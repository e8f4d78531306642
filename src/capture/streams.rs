// SPDX-License-Identifier: GPL-3.0-only

//! Stream to device-node assignment
//!
//! A configured stream set is classified once against [`ROLE_TABLE`]: the
//! first matching rule for the use case decides which node serves the stream
//! and with which V4L2 format. Streams no rule matches are not served.

use crate::buffer::StreamId;
use crate::constants::{StreamFormat, V4L2_PIX_FMT_JPEG, V4L2_PIX_FMT_NV21};
use crate::errors::{HalError, HalResult};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Device node serving a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeRole {
    /// Viewfinder / first YUV stream
    Overlay,
    /// Still or second YUV stream
    Capture,
}

impl NodeRole {
    pub const ALL: [NodeRole; 2] = [NodeRole::Overlay, NodeRole::Capture];

    pub fn display_name(&self) -> &'static str {
        match self {
            NodeRole::Overlay => "overlay",
            NodeRole::Capture => "capture",
        }
    }

    /// Poll target id
    pub fn id(&self) -> u32 {
        match self {
            NodeRole::Overlay => 0,
            NodeRole::Capture => 1,
        }
    }

    pub fn from_id(id: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|r| r.id() == id)
    }
}

/// One stream requested by the framework
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    pub id: StreamId,
    pub width: u32,
    pub height: u32,
    pub format: StreamFormat,
    /// Buffers the framework may have in flight
    pub max_buffers: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UseCase {
    Still,
    Video,
}

impl UseCase {
    /// Three streams means preview + video + snapshot
    pub fn for_streams(streams: &[StreamConfig]) -> Self {
        if streams.len() == 3 { UseCase::Video } else { UseCase::Still }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FormatClass {
    Yuv,
    Blob,
}

struct RoleRule {
    use_case: UseCase,
    class: FormatClass,
    /// Position among the YUV streams this rule takes, `None` for any
    yuv_ordinal: Option<usize>,
    role: NodeRole,
    v4l2_format: u32,
}

const ROLE_TABLE: &[RoleRule] = &[
    RoleRule {
        use_case: UseCase::Still,
        class: FormatClass::Yuv,
        yuv_ordinal: None,
        role: NodeRole::Overlay,
        v4l2_format: V4L2_PIX_FMT_NV21,
    },
    RoleRule {
        use_case: UseCase::Still,
        class: FormatClass::Blob,
        yuv_ordinal: None,
        role: NodeRole::Capture,
        v4l2_format: V4L2_PIX_FMT_JPEG,
    },
    RoleRule {
        use_case: UseCase::Video,
        class: FormatClass::Yuv,
        yuv_ordinal: Some(0),
        role: NodeRole::Overlay,
        v4l2_format: V4L2_PIX_FMT_NV21,
    },
    RoleRule {
        use_case: UseCase::Video,
        class: FormatClass::Yuv,
        yuv_ordinal: Some(1),
        role: NodeRole::Capture,
        v4l2_format: V4L2_PIX_FMT_NV21,
    },
];

/// Result of classification for one served stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamAssignment {
    pub stream: StreamConfig,
    pub role: NodeRole,
    pub v4l2_format: u32,
}

fn format_class(format: StreamFormat) -> Option<FormatClass> {
    match format {
        StreamFormat::Ycbcr420 | StreamFormat::ImplementationDefined => Some(FormatClass::Yuv),
        StreamFormat::Blob => Some(FormatClass::Blob),
        StreamFormat::Raw16 => None,
    }
}

/// Assign every servable stream to a node
///
/// Two streams competing for one node is rejected.
pub fn classify_streams(streams: &[StreamConfig]) -> HalResult<Vec<StreamAssignment>> {
    let use_case = UseCase::for_streams(streams);
    let mut assignments: Vec<StreamAssignment> = Vec::new();
    let mut yuv_seen = 0usize;

    for stream in streams {
        if stream.width == 0 || stream.height == 0 || stream.max_buffers == 0 {
            return Err(HalError::InvalidArgument(format!(
                "stream {}: {}x{} with {} buffers",
                stream.id, stream.width, stream.height, stream.max_buffers
            )));
        }
        let Some(class) = format_class(stream.format) else {
            debug!(stream = stream.id, format = stream.format.display_name(), "No node for stream format");
            continue;
        };
        let ordinal = if class == FormatClass::Yuv {
            yuv_seen += 1;
            Some(yuv_seen - 1)
        } else {
            None
        };

        let rule = ROLE_TABLE.iter().find(|rule| {
            rule.use_case == use_case
                && rule.class == class
                && (rule.yuv_ordinal.is_none() || rule.yuv_ordinal == ordinal)
        });
        let Some(rule) = rule else {
            warn!(stream = stream.id, use_case = ?use_case, "Stream not served in this use case");
            continue;
        };
        if let Some(taken) = assignments.iter().find(|a| a.role == rule.role) {
            return Err(HalError::InvalidArgument(format!(
                "streams {} and {} both need the {} node",
                taken.stream.id,
                stream.id,
                rule.role.display_name()
            )));
        }
        debug!(stream = stream.id, role = rule.role.display_name(), "Stream assigned");
        assignments.push(StreamAssignment {
            stream: *stream,
            role: rule.role,
            v4l2_format: rule.v4l2_format,
        });
    }
    Ok(assignments)
}
