// SPDX-License-Identifier: GPL-3.0-only

//! Acquire fences
//!
//! A fence is a sync-file descriptor that becomes readable once the previous
//! user of a graphics buffer has finished with it.

use crate::errors::{HalError, HalResult};
use crate::v4l2::device::poll_descriptors;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use tracing::warn;

#[derive(Debug)]
pub struct Fence {
    fd: OwnedFd,
}

impl Fence {
    pub fn new(fd: OwnedFd) -> Self {
        Self { fd }
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Block until the fence signals or `timeout_ms` elapses
    pub fn wait(&self, timeout_ms: u32) -> HalResult<()> {
        let mut pfd = libc::pollfd {
            fd: self.fd.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let timeout = i32::try_from(timeout_ms).unwrap_or(i32::MAX);
        match poll_descriptors(std::slice::from_mut(&mut pfd), timeout) {
            Ok(0) => Err(HalError::FenceTimeout { timeout_ms }),
            Ok(_) if pfd.revents & (libc::POLLERR | libc::POLLNVAL) != 0 => {
                warn!(fd = pfd.fd, revents = pfd.revents, "Fence in error state");
                Err(HalError::Driver {
                    call: "sync_wait",
                    errno: libc::EINVAL,
                })
            }
            Ok(_) => Ok(()),
            Err(e) => Err(HalError::from_io("sync_wait", &e)),
        }
    }
}
