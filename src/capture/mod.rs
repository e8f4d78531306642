// SPDX-License-Identifier: GPL-3.0-only

//! Request-driven capture on the ISP's output nodes
//!
//! - [`controller`]: the capture controller worker and its public handle
//! - [`streams`]: mapping client streams onto the preview and still nodes
//! - [`continuous`]: zero shutter lag ring-buffer arithmetic
//! - [`snapshot`]: a still node driven synchronously for bracketing
//! - [`listener`]: frame and capture event fan-out
//! - [`device_registry`]: per-camera node ownership

pub mod continuous;
pub mod controller;
pub mod device_registry;
pub mod listener;
pub mod messages;
pub mod snapshot;
pub mod streams;

pub use continuous::{ContinuousCapture, ContinuousCaptureConfig, ContinuousTiming};
pub use controller::{CaptureController, SPARE_POLL_REQUEST, check_spare_invariant};
pub use device_registry::{DeviceLease, DeviceRegistry};
pub use listener::{
    CaptureEvent, CaptureEventListener, CaptureEventType, CaptureMessage, FrameNotification, FrameObserver,
};
pub use messages::{
    CaptureMode, CaptureRequest, ControllerStatus, DeviceEvent, DeviceEventKind, NodeStatus, SpareState,
};
pub use snapshot::SnapshotDevice;
pub use streams::{NodeRole, StreamAssignment, StreamConfig, classify_streams};
