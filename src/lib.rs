// SPDX-License-Identifier: GPL-3.0-only

//! Camera hardware abstraction over V4L2 and the media controller
//!
//! # Architecture
//!
//! - [`v4l2`]: device nodes, sub-devices and their streaming state machine
//! - [`buffer`]: frame buffers over heap, graphics and mmap memory
//! - [`poller`]: the thread that waits for frames on a set of nodes
//! - [`capture`]: the request-driven capture controller
//! - [`bracket`]: exposure and focus bracketing, online and offline
//! - [`media_graph`]: media entity discovery and link routing
//! - [`config`]: on-disk configuration
//!
//! Each worker (controller, poller, bracket engine) owns one thread and one
//! [`message_queue::MessageQueue`]; public handles send it commands and block
//! on the reply.

pub mod bracket;
pub mod buffer;
pub mod capture;
pub mod config;
pub mod constants;
pub mod errors;
pub mod media_graph;
pub mod message_queue;
pub mod poller;
pub mod v4l2;

pub use capture::{CaptureController, CaptureMode, CaptureRequest};
pub use config::HalConfig;
pub use errors::{HalError, HalResult};
