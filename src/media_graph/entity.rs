// SPDX-License-Identifier: GPL-3.0-only

//! One entity of the media graph and the device node behind it

use super::sys::*;
use crate::v4l2::device::c_string;
use crate::v4l2::{Subdevice, V4l2Device, VideoNode};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityType {
    VideoNode,
    Subdevice,
    Other(u32),
}

impl EntityType {
    pub fn from_raw(type_: u32) -> Self {
        match type_ & MEDIA_ENT_TYPE_MASK {
            MEDIA_ENT_T_DEVNODE => EntityType::VideoNode,
            MEDIA_ENT_T_V4L2_SUBDEV => EntityType::Subdevice,
            _ => EntityType::Other(type_),
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            EntityType::VideoNode => "video",
            EntityType::Subdevice => "subdev",
            EntityType::Other(_) => "other",
        }
    }
}

/// A pad-to-pad link as reported by the kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkInfo {
    pub source_entity: u32,
    pub source_pad: u16,
    pub sink_entity: u32,
    pub sink_pad: u16,
    pub flags: u32,
}

impl LinkInfo {
    pub fn is_enabled(&self) -> bool {
        self.flags & MEDIA_LNK_FL_ENABLED != 0
    }

    pub fn is_immutable(&self) -> bool {
        self.flags & MEDIA_LNK_FL_IMMUTABLE != 0
    }
}

impl From<&MediaLinkDesc> for LinkInfo {
    fn from(link: &MediaLinkDesc) -> Self {
        Self {
            source_entity: link.source.entity,
            source_pad: link.source.index,
            sink_entity: link.sink.entity,
            sink_pad: link.sink.index,
            flags: link.flags,
        }
    }
}

impl fmt::Display for LinkInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{} [{}{}]",
            self.source_entity,
            self.source_pad,
            self.sink_entity,
            self.sink_pad,
            if self.is_enabled() { "ENABLED" } else { "disabled" },
            if self.is_immutable() { ",IMMUTABLE" } else { "" }
        )
    }
}

/// Opened device node of an entity
pub enum EntityDevice {
    Video(VideoNode),
    Subdev(Subdevice),
}

impl EntityDevice {
    /// Controls and events work the same on both kinds
    pub fn device(&mut self) -> &mut V4l2Device {
        match self {
            EntityDevice::Video(node) => node.device(),
            EntityDevice::Subdev(subdev) => subdev.device(),
        }
    }
}

impl fmt::Debug for EntityDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityDevice::Video(node) => write!(f, "Video({})", node.name()),
            EntityDevice::Subdev(subdev) => write!(f, "Subdev({})", subdev.name()),
        }
    }
}

#[derive(Debug)]
pub struct MediaEntity {
    desc: MediaEntityDesc,
    pads: Vec<MediaPadDesc>,
    links: Vec<MediaLinkDesc>,
    pub(crate) device: Option<EntityDevice>,
}

impl MediaEntity {
    pub(crate) fn new(desc: MediaEntityDesc, pads: Vec<MediaPadDesc>, links: Vec<MediaLinkDesc>) -> Self {
        Self {
            desc,
            pads,
            links,
            device: None,
        }
    }

    pub fn id(&self) -> u32 {
        self.desc.id
    }

    pub fn name(&self) -> String {
        c_string(&self.desc.name)
    }

    pub fn entity_type(&self) -> EntityType {
        EntityType::from_raw(self.desc.type_)
    }

    /// Character device numbers of the backing node
    pub fn dev(&self) -> (u32, u32) {
        (self.desc.major(), self.desc.minor())
    }

    pub fn desc(&self) -> &MediaEntityDesc {
        &self.desc
    }

    pub fn pad(&self, index: u16) -> Option<MediaPadDesc> {
        self.pads.iter().find(|p| p.index == index).copied().or_else(|| {
            // Pads may be unavailable if enumeration skipped them; address by index
            (index < self.desc.pads).then(|| MediaPadDesc {
                entity: self.desc.id,
                index,
                ..Default::default()
            })
        })
    }

    pub fn links(&self) -> Vec<LinkInfo> {
        self.links.iter().map(LinkInfo::from).collect()
    }

    pub(crate) fn raw_links(&self) -> &[MediaLinkDesc] {
        &self.links
    }

    pub(crate) fn update_links(&mut self, links: Vec<MediaLinkDesc>) {
        self.links = links;
    }

    pub fn is_device_open(&self) -> bool {
        self.device.is_some()
    }
}
