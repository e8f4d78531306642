// SPDX-License-Identifier: GPL-3.0-only

//! ioctl seam for the media controller device

use super::sys::*;
use crate::v4l2::driver::xioctl;
use bytemuck::Zeroable;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;
use tracing::{debug, warn};

pub trait MediaDriver: Send {
    fn open(&mut self, path: &Path) -> io::Result<()>;
    fn close(&mut self);
    fn is_open(&self) -> bool;
    fn device_info(&mut self, info: &mut MediaDeviceInfo) -> io::Result<()>;
    /// Fill `desc` for the entity selected by `desc.id`
    fn enum_entities(&mut self, desc: &mut MediaEntityDesc) -> io::Result<()>;
    /// Fill `pads` and `links` for `entity`; both slices are sized from its descriptor
    fn enum_links(&mut self, entity: u32, pads: &mut [MediaPadDesc], links: &mut [MediaLinkDesc]) -> io::Result<()>;
    fn setup_link(&mut self, link: &mut MediaLinkDesc) -> io::Result<()>;
}

#[derive(Debug, Default)]
pub struct KernelMediaDriver {
    file: Option<File>,
}

impl KernelMediaDriver {
    fn fd(&self) -> io::Result<RawFd> {
        self.file
            .as_ref()
            .map(|f| f.as_raw_fd())
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EBADF))
    }
}

impl MediaDriver for KernelMediaDriver {
    fn open(&mut self, path: &Path) -> io::Result<()> {
        let metadata = std::fs::metadata(path)?;
        if !metadata.file_type().is_char_device() {
            warn!(path = %path.display(), "Not a character device");
            return Err(io::Error::from_raw_os_error(libc::ENODEV));
        }
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        debug!(path = %path.display(), fd = file.as_raw_fd(), "Opened media device");
        self.file = Some(file);
        Ok(())
    }

    fn close(&mut self) {
        self.file = None;
    }

    fn is_open(&self) -> bool {
        self.file.is_some()
    }

    fn device_info(&mut self, info: &mut MediaDeviceInfo) -> io::Result<()> {
        xioctl(self.fd()?, MEDIA_IOC_DEVICE_INFO, info)
    }

    fn enum_entities(&mut self, desc: &mut MediaEntityDesc) -> io::Result<()> {
        xioctl(self.fd()?, MEDIA_IOC_ENUM_ENTITIES, desc)
    }

    fn enum_links(&mut self, entity: u32, pads: &mut [MediaPadDesc], links: &mut [MediaLinkDesc]) -> io::Result<()> {
        let mut request = MediaLinksEnum::zeroed();
        request.entity = entity;
        request.pads = if pads.is_empty() { std::ptr::null_mut() } else { pads.as_mut_ptr() };
        request.links = if links.is_empty() { std::ptr::null_mut() } else { links.as_mut_ptr() };
        xioctl(self.fd()?, MEDIA_IOC_ENUM_LINKS, &mut request)
    }

    fn setup_link(&mut self, link: &mut MediaLinkDesc) -> io::Result<()> {
        xioctl(self.fd()?, MEDIA_IOC_SETUP_LINK, link)
    }
}
