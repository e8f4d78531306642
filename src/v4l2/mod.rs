// SPDX-License-Identifier: GPL-3.0-only

//! V4L2 device layer
//!
//! - [`sys`]: kernel structures and ioctl numbers
//! - [`driver`]: the ioctl seam and its kernel implementation
//! - [`device`]: open/close, poll, controls and events shared by all nodes
//! - [`video_node`]: streaming state machine and buffer queue protocol
//! - [`subdevice`]: pad formats and selections

pub mod controls;
pub mod device;
pub mod driver;
pub mod frame_info;
pub mod subdevice;
pub mod sys;
pub mod video_node;

pub use device::V4l2Device;
pub use driver::{DriverFactory, KernelDriver, V4l2Driver, kernel_driver_factory};
pub use frame_info::FrameStatus;
pub use subdevice::{PadFormat, Subdevice};
pub use video_node::{FrameInfo, MemoryType, NodeDirection, V4l2BufferInfo, VideoNode, VideoNodeState};
