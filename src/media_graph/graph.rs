// SPDX-License-Identifier: GPL-3.0-only

use super::driver::MediaDriver;
use super::entity::{EntityDevice, EntityType, LinkInfo, MediaEntity};
use super::sys::*;
use crate::errors::{HalError, HalResult};
use crate::v4l2::device::c_string;
use crate::v4l2::sys::{V4L2_FIELD_NONE, V4l2Rect};
use crate::v4l2::{DriverFactory, FrameInfo, NodeDirection, PadFormat, Subdevice, VideoNode};
use bytemuck::Zeroable;
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

const SYSFS_CHAR_DEVICES: &str = "/sys/dev/char";
const DEV_ROOT: &str = "/dev";

/// Identity of the media device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaDeviceSummary {
    pub driver: String,
    pub model: String,
    pub serial: String,
    pub bus_info: String,
    pub media_version: u32,
    pub hw_revision: u32,
    pub driver_version: u32,
}

impl From<&MediaDeviceInfo> for MediaDeviceSummary {
    fn from(info: &MediaDeviceInfo) -> Self {
        Self {
            driver: c_string(&info.driver),
            model: c_string(&info.model),
            serial: c_string(&info.serial),
            bus_info: c_string(&info.bus_info),
            media_version: info.media_version,
            hw_revision: info.hw_revision,
            driver_version: info.driver_version,
        }
    }
}

/// Entity summary for listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityInfo {
    pub id: u32,
    pub name: String,
    pub entity_type: EntityType,
    pub pads: u16,
    pub links: u16,
    pub dev: (u32, u32),
}

/// Entities, pads and links of one media controller device
///
/// Entity descriptors are enumerated once by [`MediaGraph::find_entities`].
/// Pads, links and device nodes are fetched the first time an entity is
/// used by name and cached until `close`.
pub struct MediaGraph {
    path: String,
    driver: Box<dyn MediaDriver>,
    node_drivers: DriverFactory,
    sysfs_root: PathBuf,
    dev_root: PathBuf,
    info: Option<MediaDeviceSummary>,
    descriptors: BTreeMap<String, MediaEntityDesc>,
    entities: BTreeMap<String, MediaEntity>,
}

impl MediaGraph {
    pub fn new(path: impl Into<String>, driver: Box<dyn MediaDriver>, node_drivers: DriverFactory) -> Self {
        Self {
            path: path.into(),
            driver,
            node_drivers,
            sysfs_root: PathBuf::from(SYSFS_CHAR_DEVICES),
            dev_root: PathBuf::from(DEV_ROOT),
            info: None,
            descriptors: BTreeMap::new(),
            entities: BTreeMap::new(),
        }
    }

    /// Resolve device numbers under other roots than `/sys/dev/char` and `/dev`
    pub fn with_device_roots(mut self, sysfs_root: impl Into<PathBuf>, dev_root: impl Into<PathBuf>) -> Self {
        self.sysfs_root = sysfs_root.into();
        self.dev_root = dev_root.into();
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        self.driver.is_open()
    }

    fn driver_error(&self, call: &'static str, err: io::Error) -> HalError {
        let errno = err.raw_os_error().unwrap_or(libc::EIO);
        error!(device = %self.path, call, errno, error = %err, "Media ioctl failed");
        HalError::Driver { call, errno }
    }

    fn ensure_open(&self, operation: &'static str) -> HalResult<()> {
        if self.driver.is_open() {
            Ok(())
        } else {
            error!(device = %self.path, operation, "Media device not open");
            Err(HalError::InvalidState {
                operation,
                state: "closed".to_string(),
            })
        }
    }

    /// Open the device, read its identity and enumerate entities
    pub fn open(&mut self) -> HalResult<()> {
        if self.driver.is_open() {
            return Err(HalError::InvalidState {
                operation: "open",
                state: "open".to_string(),
            });
        }
        self.driver
            .open(Path::new(&self.path))
            .map_err(|e| HalError::from_io("open", &e))?;
        let result = self.refresh_device_info().and_then(|_| self.find_entities().map(|_| ()));
        if let Err(e) = result {
            self.close();
            return Err(e);
        }
        Ok(())
    }

    pub fn close(&mut self) {
        for entity in self.entities.values_mut() {
            match entity.device.take() {
                Some(EntityDevice::Video(mut node)) => {
                    if let Err(e) = node.close() {
                        warn!(device = %node.name(), error = %e, "Failed to close video node");
                    }
                }
                Some(EntityDevice::Subdev(mut subdev)) => subdev.close(),
                None => {}
            }
        }
        self.entities.clear();
        self.descriptors.clear();
        self.info = None;
        self.driver.close();
        debug!(device = %self.path, "Media device closed");
    }

    fn refresh_device_info(&mut self) -> HalResult<MediaDeviceSummary> {
        let mut raw = MediaDeviceInfo::zeroed();
        self.driver
            .device_info(&mut raw)
            .map_err(|e| self.driver_error("MEDIA_IOC_DEVICE_INFO", e))?;
        let summary = MediaDeviceSummary::from(&raw);
        info!(device = %self.path, driver = %summary.driver, model = %summary.model, "Media device");
        self.info = Some(summary.clone());
        Ok(summary)
    }

    pub fn device_info(&mut self) -> HalResult<MediaDeviceSummary> {
        self.ensure_open("device_info")?;
        match &self.info {
            Some(info) => Ok(info.clone()),
            None => self.refresh_device_info(),
        }
    }

    /// Enumerate entity descriptors until the driver reports no more
    pub fn find_entities(&mut self) -> HalResult<usize> {
        self.ensure_open("find_entities")?;
        self.descriptors.clear();
        let mut id = 0u32;
        loop {
            let mut desc = MediaEntityDesc::zeroed();
            desc.id = id | MEDIA_ENT_ID_FLAG_NEXT;
            if let Err(e) = self.driver.enum_entities(&mut desc) {
                debug!(found = self.descriptors.len(), error = %e, "Entity enumeration finished");
                break;
            }
            let name = c_string(&desc.name);
            debug!(
                name = %name,
                id = desc.id,
                pads = desc.pads,
                links = desc.links,
                kind = EntityType::from_raw(desc.type_).display_name(),
                "Media entity"
            );
            id = desc.id;
            self.descriptors.insert(name, desc);
        }
        Ok(self.descriptors.len())
    }

    pub fn entities(&self) -> Vec<EntityInfo> {
        let mut list: Vec<EntityInfo> = self
            .descriptors
            .iter()
            .map(|(name, desc)| EntityInfo {
                id: desc.id,
                name: name.clone(),
                entity_type: EntityType::from_raw(desc.type_),
                pads: desc.pads,
                links: desc.links,
                dev: (desc.major(), desc.minor()),
            })
            .collect();
        list.sort_by_key(|e| e.id);
        list
    }

    fn enum_links(&mut self, desc: &MediaEntityDesc) -> HalResult<(Vec<MediaPadDesc>, Vec<MediaLinkDesc>)> {
        let mut pads = vec![MediaPadDesc::default(); desc.pads as usize];
        let mut links = vec![MediaLinkDesc::default(); desc.links as usize];
        self.driver
            .enum_links(desc.id, &mut pads, &mut links)
            .map_err(|e| self.driver_error("MEDIA_IOC_ENUM_LINKS", e))?;
        Ok((pads, links))
    }

    /// Entity by name, fetching its pads and links on first use
    pub fn entity(&mut self, name: &str) -> HalResult<&mut MediaEntity> {
        self.ensure_open("entity")?;
        if !self.entities.contains_key(name) {
            let Some(desc) = self.descriptors.get(name).copied() else {
                error!(entity = name, "Entity not registered with the media device");
                return Err(HalError::NotFound(format!("media entity {}", name)));
            };
            let (pads, links) = self.enum_links(&desc)?;
            debug!(entity = name, id = desc.id, pads = pads.len(), links = links.len(), "Created media entity");
            self.entities.insert(name.to_string(), MediaEntity::new(desc, pads, links));
        }
        self.entities
            .get_mut(name)
            .ok_or_else(|| HalError::NotFound(format!("media entity {}", name)))
    }

    pub fn links(&mut self, name: &str) -> HalResult<Vec<LinkInfo>> {
        Ok(self.entity(name)?.links())
    }

    /// Device node path behind `(major, minor)`, via the sysfs char-device link
    pub fn device_path(&self, major: u32, minor: u32) -> HalResult<PathBuf> {
        let sys_path = self.sysfs_root.join(format!("{}:{}", major, minor));
        let target = std::fs::read_link(&sys_path).map_err(|e| {
            error!(path = %sys_path.display(), error = %e, "Cannot resolve device link");
            HalError::from_io("readlink", &e)
        })?;
        let name = target
            .file_name()
            .ok_or_else(|| HalError::NotFound(format!("device name in {}", target.display())))?;
        Ok(self.dev_root.join(name))
    }

    /// Open (once) and return the device node of an entity
    pub fn get_device(&mut self, name: &str) -> HalResult<&mut EntityDevice> {
        let (entity_type, (major, minor), opened) = {
            let entity = self.entity(name)?;
            (entity.entity_type(), entity.dev(), entity.is_device_open())
        };
        if !opened {
            let path = self.device_path(major, minor)?;
            let path_str = path.to_string_lossy().to_string();
            let device = match entity_type {
                EntityType::VideoNode => {
                    let mut node = VideoNode::new(path_str, NodeDirection::Input, (self.node_drivers)());
                    node.open()?;
                    EntityDevice::Video(node)
                }
                EntityType::Subdevice => {
                    let mut subdev = Subdevice::new(path_str, (self.node_drivers)());
                    subdev.open()?;
                    EntityDevice::Subdev(subdev)
                }
                EntityType::Other(raw) => {
                    warn!(entity = name, type_ = raw, "Entity has no device node");
                    return Err(HalError::InvalidOperation(format!("entity {} has no device node", name)));
                }
            };
            info!(entity = name, path = %path.display(), "Opened entity device");
            self.entity(name)?.device = Some(device);
        }
        self.entity(name)?
            .device
            .as_mut()
            .ok_or_else(|| HalError::NotFound(format!("device of entity {}", name)))
    }

    /// Enable or disable the link `src:src_pad -> sink:sink_pad`
    pub fn configure_link(&mut self, src: &str, src_pad: u16, sink: &str, sink_pad: u16, enable: bool) -> HalResult<()> {
        info!(src, src_pad, sink, sink_pad, enable, "Configuring link");
        let source = self
            .entity(src)?
            .pad(src_pad)
            .ok_or_else(|| HalError::InvalidArgument(format!("{} has no pad {}", src, src_pad)))?;
        let sink_desc = self
            .entity(sink)?
            .pad(sink_pad)
            .ok_or_else(|| HalError::InvalidArgument(format!("{} has no pad {}", sink, sink_pad)))?;

        let mut link = MediaLinkDesc {
            source,
            sink: sink_desc,
            flags: if enable { MEDIA_LNK_FL_ENABLED } else { 0 },
            ..Default::default()
        };
        self.driver
            .setup_link(&mut link)
            .map_err(|e| self.driver_error("MEDIA_IOC_SETUP_LINK", e))?;

        let desc = *self.entity(src)?.desc();
        let (_, links) = self.enum_links(&desc)?;
        self.entity(src)?.update_links(links);
        Ok(())
    }

    /// Disable every link that is not immutable
    pub fn reset_links(&mut self) -> HalResult<()> {
        self.ensure_open("reset_links")?;
        let descriptors: Vec<MediaEntityDesc> = self.descriptors.values().copied().collect();
        for desc in descriptors {
            let (_, links) = self.enum_links(&desc)?;
            for mut link in links.into_iter().filter(|l| l.flags & MEDIA_LNK_FL_IMMUTABLE == 0) {
                link.flags &= !MEDIA_LNK_FL_ENABLED;
                if let Err(e) = self.driver.setup_link(&mut link) {
                    warn!(link = %LinkInfo::from(&link), error = %e, "Failed to disable link");
                }
            }
            let name = c_string(&desc.name);
            if self.entities.contains_key(&name) {
                let (_, links) = self.enum_links(&desc)?;
                if let Some(entity) = self.entities.get_mut(&name) {
                    entity.update_links(links);
                }
            }
        }
        info!(device = %self.path, "Links reset");
        Ok(())
    }

    /// Set a format on an entity's pad, or on the video node itself
    pub fn set_format(&mut self, name: &str, pad: u32, width: u32, height: u32, code: u32) -> HalResult<()> {
        debug!(entity = name, pad, width, height, code, "Setting entity format");
        match self.get_device(name)? {
            EntityDevice::Video(node) => {
                let mut info = FrameInfo::new(width, height, code);
                node.set_format(&mut info)
            }
            EntityDevice::Subdev(subdev) => subdev
                .set_format(
                    pad,
                    PadFormat {
                        width,
                        height,
                        code,
                        field: V4L2_FIELD_NONE,
                    },
                )
                .map(|_| ()),
        }
    }

    pub fn set_selection(&mut self, name: &str, pad: u32, target: u32, rect: V4l2Rect) -> HalResult<V4l2Rect> {
        match self.get_device(name)? {
            EntityDevice::Subdev(subdev) => subdev.set_selection(pad, target, rect),
            EntityDevice::Video(_) => Err(HalError::InvalidOperation(format!(
                "selection on video node entity {}",
                name
            ))),
        }
    }

    pub fn set_control(&mut self, name: &str, id: u32, value: i32) -> HalResult<()> {
        self.get_device(name)?.device().set_control(id, value)
    }
}

impl Drop for MediaGraph {
    fn drop(&mut self) {
        if self.driver.is_open() {
            self.close();
        }
    }
}
