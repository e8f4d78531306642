// SPDX-License-Identifier: GPL-3.0-only

//! Per-camera device node groups
//!
//! Each camera id owns a fixed group of node paths. A controller takes a
//! [`DeviceLease`] on its group for its lifetime; a second lease on the same
//! camera fails with `Busy` until the first is dropped.

use crate::config::{HalConfig, NodePaths};
use crate::errors::{HalError, HalResult};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use tracing::{debug, info};

#[derive(Debug)]
struct Group {
    paths: NodePaths,
    in_use: bool,
}

#[derive(Debug, Clone)]
pub struct DeviceRegistry {
    groups: Arc<Mutex<Vec<Group>>>,
}

impl DeviceRegistry {
    pub fn new(cameras: Vec<NodePaths>) -> Self {
        let groups = cameras
            .into_iter()
            .map(|paths| Group { paths, in_use: false })
            .collect();
        Self {
            groups: Arc::new(Mutex::new(groups)),
        }
    }

    pub fn from_config(config: &HalConfig) -> Self {
        Self::new(config.cameras.clone())
    }

    /// Process-wide registry built from the on-disk configuration
    pub fn global() -> &'static DeviceRegistry {
        static REGISTRY: OnceLock<DeviceRegistry> = OnceLock::new();
        REGISTRY.get_or_init(|| {
            let registry = Self::from_config(&HalConfig::load());
            info!(cameras = registry.camera_count(), "Device registry initialized");
            registry
        })
    }

    fn groups(&self) -> MutexGuard<'_, Vec<Group>> {
        self.groups.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn camera_count(&self) -> usize {
        self.groups().len()
    }

    pub fn paths(&self, camera_id: usize) -> Option<NodePaths> {
        self.groups().get(camera_id).map(|g| g.paths.clone())
    }

    pub fn is_in_use(&self, camera_id: usize) -> bool {
        self.groups().get(camera_id).is_some_and(|g| g.in_use)
    }

    pub fn acquire(&self, camera_id: usize) -> HalResult<DeviceLease> {
        let mut groups = self.groups();
        let group = groups
            .get_mut(camera_id)
            .ok_or_else(|| HalError::NotFound(format!("camera {}", camera_id)))?;
        if group.in_use {
            return Err(HalError::Busy(format!("camera {}", camera_id)));
        }
        group.in_use = true;
        debug!(camera_id, overlay = %group.paths.overlay, "Device group leased");
        Ok(DeviceLease {
            registry: self.clone(),
            camera_id,
            paths: group.paths.clone(),
        })
    }
}

/// Exclusive use of one camera's nodes; released on drop
#[derive(Debug)]
pub struct DeviceLease {
    registry: DeviceRegistry,
    camera_id: usize,
    paths: NodePaths,
}

impl DeviceLease {
    pub fn camera_id(&self) -> usize {
        self.camera_id
    }

    pub fn paths(&self) -> &NodePaths {
        &self.paths
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        if let Some(group) = self.registry.groups().get_mut(self.camera_id) {
            group.in_use = false;
        }
        debug!(camera_id = self.camera_id, "Device group released");
    }
}
