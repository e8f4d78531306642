// SPDX-License-Identifier: GPL-3.0-only

//! Media controller graph
//!
//! The ISP pipeline is a graph of entities (sensor, CSI receiver, ISP
//! sub-devices, video nodes) joined pad to pad by links. Routing is set up
//! here before any video node is opened for streaming.

pub mod driver;
pub mod entity;
pub mod graph;
pub mod sys;

pub use driver::{KernelMediaDriver, MediaDriver};
pub use entity::{EntityDevice, EntityType, LinkInfo, MediaEntity};
pub use graph::{EntityInfo, MediaDeviceSummary, MediaGraph};
