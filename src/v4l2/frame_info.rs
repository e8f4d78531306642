// SPDX-License-Identifier: GPL-3.0-only

//! Accessors for the driver-overloaded words of [`V4l2Buffer`]
//!
//! The AtomISP driver repurposes two descriptor fields:
//!
//! - `reserved2`: bit 31 flags a buffer that carries per-frame ISP settings,
//!   the remaining bits hold the request id plus one.
//! - `reserved`: bits 0..16 hold the frame status, bits 16..32 hold the id of
//!   the exposure the driver locked for this frame.
//!
//! The layout must stay bit-exact for the driver to understand it.

use super::sys::V4l2Buffer;

pub const ATOMISP_BUFFER_HAS_PER_FRAME_SETTING: u32 = 0x8000_0000;

const FRAME_STATUS_MASK: u32 = 0xFFFF;
const EXPOSURE_ID_SHIFT: u32 = 16;

/// Per-frame status reported in `reserved`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    Ok,
    Corrupted,
    FlashExposed,
    FlashPartial,
    FlashFailed,
    Unknown(u16),
}

impl FrameStatus {
    pub fn from_raw(raw: u16) -> Self {
        match raw {
            0 => FrameStatus::Ok,
            1 => FrameStatus::Corrupted,
            2 => FrameStatus::FlashExposed,
            3 => FrameStatus::FlashPartial,
            4 => FrameStatus::FlashFailed,
            other => FrameStatus::Unknown(other),
        }
    }

    pub fn to_raw(self) -> u16 {
        match self {
            FrameStatus::Ok => 0,
            FrameStatus::Corrupted => 1,
            FrameStatus::FlashExposed => 2,
            FrameStatus::FlashPartial => 3,
            FrameStatus::FlashFailed => 4,
            FrameStatus::Unknown(raw) => raw,
        }
    }
}

impl V4l2Buffer {
    /// Tag the buffer with per-frame settings for `request_id`, or clear the tag
    pub fn set_per_frame_request(&mut self, request_id: Option<u32>) {
        self.reserved2 = match request_id {
            Some(id) => {
                let tagged = id.wrapping_add(1) & !ATOMISP_BUFFER_HAS_PER_FRAME_SETTING;
                ATOMISP_BUFFER_HAS_PER_FRAME_SETTING | tagged
            }
            None => 0,
        };
    }

    pub fn per_frame_request(&self) -> Option<u32> {
        if self.reserved2 & ATOMISP_BUFFER_HAS_PER_FRAME_SETTING == 0 {
            return None;
        }
        let tagged = self.reserved2 & !ATOMISP_BUFFER_HAS_PER_FRAME_SETTING;
        tagged.checked_sub(1)
    }

    pub fn frame_status(&self) -> FrameStatus {
        FrameStatus::from_raw((self.reserved & FRAME_STATUS_MASK) as u16)
    }

    /// Replace the status, keeping the exposure id
    pub fn set_frame_status(&mut self, status: FrameStatus) {
        self.reserved = (self.reserved & !FRAME_STATUS_MASK) | status.to_raw() as u32;
    }

    /// Exposure id the driver locked the frame with (0 when not locked)
    pub fn exposure_id(&self) -> u16 {
        ((self.reserved >> EXPOSURE_ID_SHIFT) & FRAME_STATUS_MASK) as u16
    }

    pub fn is_corrupted(&self) -> bool {
        self.frame_status() == FrameStatus::Corrupted
    }
}
