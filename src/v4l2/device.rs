// SPDX-License-Identifier: GPL-3.0-only

//! Operations common to every V4L2 device file
//!
//! Video nodes and sub-devices share open/close, polling, controls and event
//! handling. Each embeds a [`V4l2Device`] and adds its own state machine.

use super::controls::control_name;
use super::driver::{KernelDriver, V4l2Driver};
use super::sys::*;
use crate::errors::{HalError, HalResult};
use bytemuck::Zeroable;
use std::io;
use std::os::unix::io::RawFd;
use std::path::Path;
use tracing::{debug, error, warn};

pub struct V4l2Device {
    name: String,
    driver: Box<dyn V4l2Driver>,
    open: bool,
}

impl V4l2Device {
    pub fn new(name: impl Into<String>, driver: Box<dyn V4l2Driver>) -> Self {
        Self {
            name: name.into(),
            driver,
            open: false,
        }
    }

    /// Device backed by the kernel node at `name`
    pub fn kernel(name: impl Into<String>) -> Self {
        Self::new(name, Box::new(KernelDriver::default()))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn raw_fd(&self) -> Option<RawFd> {
        self.driver.raw_fd()
    }

    pub fn open(&mut self) -> HalResult<()> {
        if self.open {
            error!(device = %self.name, "Device already open");
            return Err(HalError::Busy(self.name.clone()));
        }
        self.driver
            .open(Path::new(&self.name))
            .map_err(|e| self.driver_error("open", e))?;
        self.open = true;
        debug!(device = %self.name, "Device opened");
        Ok(())
    }

    pub fn close(&mut self) {
        if self.open {
            self.driver.close();
            self.open = false;
            debug!(device = %self.name, "Device closed");
        }
    }

    /// Wait for the device to become readable
    ///
    /// Returns a positive value when data is ready, 0 on timeout and a
    /// negative errno on failure.
    pub fn poll(&self, timeout_ms: i32) -> i32 {
        let Some(fd) = self.raw_fd() else {
            return -libc::EBADF;
        };
        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLPRI | libc::POLLIN | libc::POLLERR,
            revents: 0,
        };
        match poll_descriptors(std::slice::from_mut(&mut pfd), timeout_ms) {
            Ok(ready) => ready as i32,
            Err(e) => {
                warn!(device = %self.name, error = %e, "poll failed");
                -e.raw_os_error().unwrap_or(libc::EIO)
            }
        }
    }

    pub(crate) fn driver(&mut self) -> &mut dyn V4l2Driver {
        self.driver.as_mut()
    }

    /// Log a failed call and convert it
    pub(crate) fn driver_error(&self, call: &'static str, err: io::Error) -> HalError {
        let err = HalError::from_io(call, &err);
        error!(device = %self.name, call, errno = err.errno().unwrap_or_default(), "Driver call failed");
        err
    }

    pub(crate) fn ensure_open(&self, operation: &'static str) -> HalResult<()> {
        if self.open {
            Ok(())
        } else {
            error!(device = %self.name, operation, "Device is closed");
            Err(HalError::InvalidState {
                operation,
                state: "Closed".to_string(),
            })
        }
    }

    pub fn query_cap(&mut self) -> HalResult<V4l2Capability> {
        self.ensure_open("query_cap")?;
        let mut cap = V4l2Capability::zeroed();
        self.driver
            .query_cap(&mut cap)
            .map_err(|e| self.driver_error("VIDIOC_QUERYCAP", e))?;
        Ok(cap)
    }

    pub fn get_control(&mut self, id: u32) -> HalResult<i32> {
        self.ensure_open("get_control")?;
        let mut ctrl = V4l2Control { id, value: 0 };
        self.driver
            .get_control(&mut ctrl)
            .map_err(|e| self.driver_error("VIDIOC_G_CTRL", e))?;
        Ok(ctrl.value)
    }

    pub fn set_control(&mut self, id: u32, value: i32) -> HalResult<()> {
        self.ensure_open("set_control")?;
        let mut ctrl = V4l2Control { id, value };
        self.driver
            .set_control(&mut ctrl)
            .map_err(|e| self.driver_error("VIDIOC_S_CTRL", e))?;
        if ctrl.value != value {
            debug!(
                device = %self.name,
                control = control_name(id),
                requested = value,
                actual = ctrl.value,
                "Control value was clamped"
            );
        }
        Ok(())
    }

    /// Set one control through the extended-control interface
    pub fn set_extended_control(&mut self, id: u32, value: i64) -> HalResult<()> {
        self.ensure_open("set_extended_control")?;
        let mut control = V4l2ExtControl {
            id,
            value64: value,
            ..Default::default()
        };
        let mut controls = V4l2ExtControls::zeroed();
        controls.which = id & 0x0FFF_0000;
        controls.count = 1;
        controls.controls = &mut control;
        self.driver
            .set_ext_controls(&mut controls)
            .map_err(|e| self.driver_error("VIDIOC_S_EXT_CTRLS", e))
    }

    pub fn subscribe_event(&mut self, event_type: u32, id: u32) -> HalResult<()> {
        self.ensure_open("subscribe_event")?;
        let mut sub = V4l2EventSubscription {
            type_: event_type,
            id,
            ..Default::default()
        };
        self.driver
            .subscribe_event(&mut sub)
            .map_err(|e| self.driver_error("VIDIOC_SUBSCRIBE_EVENT", e))
    }

    pub fn unsubscribe_event(&mut self, event_type: u32, id: u32) -> HalResult<()> {
        self.ensure_open("unsubscribe_event")?;
        let mut sub = V4l2EventSubscription {
            type_: event_type,
            id,
            ..Default::default()
        };
        self.driver
            .unsubscribe_event(&mut sub)
            .map_err(|e| self.driver_error("VIDIOC_UNSUBSCRIBE_EVENT", e))
    }

    pub fn dequeue_event(&mut self) -> HalResult<V4l2Event> {
        self.ensure_open("dequeue_event")?;
        let mut event = V4l2Event::zeroed();
        self.driver
            .dequeue_event(&mut event)
            .map_err(|e| self.driver_error("VIDIOC_DQEVENT", e))?;
        Ok(event)
    }
}

impl Drop for V4l2Device {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for V4l2Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("V4l2Device")
            .field("name", &self.name)
            .field("open", &self.open)
            .finish()
    }
}

/// `poll(2)` over a descriptor set, retried on EINTR
pub fn poll_descriptors(fds: &mut [libc::pollfd], timeout_ms: i32) -> io::Result<usize> {
    loop {
        // SAFETY: `fds` is a valid, exclusively borrowed slice of pollfd
        let ret = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        if ret >= 0 {
            return Ok(ret as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Extract a NUL-terminated string from a fixed-size byte array
pub fn c_string(bytes: &[u8]) -> String {
    let len = bytes.iter().position(|&c| c == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..len]).to_string()
}
