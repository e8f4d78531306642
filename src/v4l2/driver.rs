// SPDX-License-Identifier: GPL-3.0-only

//! Seam between the device state machines and the kernel
//!
//! [`V4l2Driver`] is the ioctl vocabulary a device node needs. The kernel
//! implementation forwards each call to `libc::ioctl`; tests substitute an
//! in-memory driver. Methods a driver does not implement fail with `ENOTTY`,
//! the same answer the kernel gives for an unsupported request.

use super::sys::*;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

fn unsupported() -> io::Error {
    io::Error::from_raw_os_error(libc::ENOTTY)
}

/// ioctl surface of a V4L2 video node or sub-device
pub trait V4l2Driver: Send {
    fn open(&mut self, path: &Path) -> io::Result<()>;
    fn close(&mut self);
    /// Descriptor to poll on while open
    fn raw_fd(&self) -> Option<RawFd>;

    fn query_cap(&mut self, _cap: &mut V4l2Capability) -> io::Result<()> {
        Err(unsupported())
    }
    fn get_format(&mut self, _fmt: &mut V4l2Format) -> io::Result<()> {
        Err(unsupported())
    }
    fn set_format(&mut self, _fmt: &mut V4l2Format) -> io::Result<()> {
        Err(unsupported())
    }
    fn request_buffers(&mut self, _req: &mut V4l2RequestBuffers) -> io::Result<()> {
        Err(unsupported())
    }
    fn query_buffer(&mut self, _buf: &mut V4l2Buffer) -> io::Result<()> {
        Err(unsupported())
    }
    fn queue_buffer(&mut self, _buf: &mut V4l2Buffer) -> io::Result<()> {
        Err(unsupported())
    }
    fn dequeue_buffer(&mut self, _buf: &mut V4l2Buffer) -> io::Result<()> {
        Err(unsupported())
    }
    fn stream_on(&mut self, _buf_type: u32) -> io::Result<()> {
        Err(unsupported())
    }
    fn stream_off(&mut self, _buf_type: u32) -> io::Result<()> {
        Err(unsupported())
    }
    fn set_parm(&mut self, _parm: &mut V4l2StreamParm) -> io::Result<()> {
        Err(unsupported())
    }
    fn get_control(&mut self, _ctrl: &mut V4l2Control) -> io::Result<()> {
        Err(unsupported())
    }
    fn set_control(&mut self, _ctrl: &mut V4l2Control) -> io::Result<()> {
        Err(unsupported())
    }
    fn set_ext_controls(&mut self, _ctrls: &mut V4l2ExtControls) -> io::Result<()> {
        Err(unsupported())
    }
    fn subscribe_event(&mut self, _sub: &mut V4l2EventSubscription) -> io::Result<()> {
        Err(unsupported())
    }
    fn unsubscribe_event(&mut self, _sub: &mut V4l2EventSubscription) -> io::Result<()> {
        Err(unsupported())
    }
    fn dequeue_event(&mut self, _event: &mut V4l2Event) -> io::Result<()> {
        Err(unsupported())
    }
    fn subdev_get_format(&mut self, _fmt: &mut V4l2SubdevFormat) -> io::Result<()> {
        Err(unsupported())
    }
    fn subdev_set_format(&mut self, _fmt: &mut V4l2SubdevFormat) -> io::Result<()> {
        Err(unsupported())
    }
    fn subdev_get_selection(&mut self, _sel: &mut V4l2SubdevSelection) -> io::Result<()> {
        Err(unsupported())
    }
    fn subdev_set_selection(&mut self, _sel: &mut V4l2SubdevSelection) -> io::Result<()> {
        Err(unsupported())
    }
    /// AtomISP private: configure the continuous-capture ring request
    fn set_continuous_capture(&mut self, _conf: &mut AtomispContCaptureConfig) -> io::Result<()> {
        Err(unsupported())
    }
    /// AtomISP private: release a locked raw frame
    fn unlock_raw_buffer(&mut self, _exposure_id: i32) -> io::Result<()> {
        Err(unsupported())
    }
    /// AtomISP private: process a locked raw frame
    fn capture_raw_buffer(&mut self, _exposure_id: i32) -> io::Result<()> {
        Err(unsupported())
    }
}

/// Creates drivers for device nodes opened on demand (media graph lookups)
pub type DriverFactory = Arc<dyn Fn() -> Box<dyn V4l2Driver> + Send + Sync>;

/// Factory producing [`KernelDriver`]s
pub fn kernel_driver_factory() -> DriverFactory {
    Arc::new(|| Box::new(KernelDriver::default()) as Box<dyn V4l2Driver>)
}

/// Issue an ioctl, retrying when interrupted by a signal
pub fn xioctl<T>(fd: RawFd, request: libc::c_ulong, arg: &mut T) -> io::Result<()> {
    loop {
        // SAFETY: `arg` is a live, exclusively borrowed repr(C) struct whose
        // size is encoded in `request`
        let ret = unsafe { libc::ioctl(fd, request as _, arg as *mut T) };
        if ret >= 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Driver backed by a real character device
#[derive(Debug, Default)]
pub struct KernelDriver {
    file: Option<File>,
}

impl KernelDriver {
    fn fd(&self) -> io::Result<RawFd> {
        self.file
            .as_ref()
            .map(|f| f.as_raw_fd())
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EBADF))
    }

    fn ioctl<T>(&self, request: libc::c_ulong, arg: &mut T) -> io::Result<()> {
        xioctl(self.fd()?, request, arg)
    }
}

impl V4l2Driver for KernelDriver {
    fn open(&mut self, path: &Path) -> io::Result<()> {
        let metadata = std::fs::metadata(path)?;
        if !metadata.file_type().is_char_device() {
            warn!(path = %path.display(), "Not a character device");
            return Err(io::Error::from_raw_os_error(libc::ENODEV));
        }
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        debug!(path = %path.display(), fd = file.as_raw_fd(), "Opened device");
        self.file = Some(file);
        Ok(())
    }

    fn close(&mut self) {
        self.file = None;
    }

    fn raw_fd(&self) -> Option<RawFd> {
        self.file.as_ref().map(|f| f.as_raw_fd())
    }

    fn query_cap(&mut self, cap: &mut V4l2Capability) -> io::Result<()> {
        self.ioctl(VIDIOC_QUERYCAP, cap)
    }

    fn get_format(&mut self, fmt: &mut V4l2Format) -> io::Result<()> {
        self.ioctl(VIDIOC_G_FMT, fmt)
    }

    fn set_format(&mut self, fmt: &mut V4l2Format) -> io::Result<()> {
        self.ioctl(VIDIOC_S_FMT, fmt)
    }

    fn request_buffers(&mut self, req: &mut V4l2RequestBuffers) -> io::Result<()> {
        self.ioctl(VIDIOC_REQBUFS, req)
    }

    fn query_buffer(&mut self, buf: &mut V4l2Buffer) -> io::Result<()> {
        self.ioctl(VIDIOC_QUERYBUF, buf)
    }

    fn queue_buffer(&mut self, buf: &mut V4l2Buffer) -> io::Result<()> {
        self.ioctl(VIDIOC_QBUF, buf)
    }

    fn dequeue_buffer(&mut self, buf: &mut V4l2Buffer) -> io::Result<()> {
        self.ioctl(VIDIOC_DQBUF, buf)
    }

    fn stream_on(&mut self, buf_type: u32) -> io::Result<()> {
        let mut ty = buf_type as libc::c_int;
        self.ioctl(VIDIOC_STREAMON, &mut ty)
    }

    fn stream_off(&mut self, buf_type: u32) -> io::Result<()> {
        let mut ty = buf_type as libc::c_int;
        self.ioctl(VIDIOC_STREAMOFF, &mut ty)
    }

    fn set_parm(&mut self, parm: &mut V4l2StreamParm) -> io::Result<()> {
        self.ioctl(VIDIOC_S_PARM, parm)
    }

    fn get_control(&mut self, ctrl: &mut V4l2Control) -> io::Result<()> {
        self.ioctl(VIDIOC_G_CTRL, ctrl)
    }

    fn set_control(&mut self, ctrl: &mut V4l2Control) -> io::Result<()> {
        self.ioctl(VIDIOC_S_CTRL, ctrl)
    }

    fn set_ext_controls(&mut self, ctrls: &mut V4l2ExtControls) -> io::Result<()> {
        self.ioctl(VIDIOC_S_EXT_CTRLS, ctrls)
    }

    fn subscribe_event(&mut self, sub: &mut V4l2EventSubscription) -> io::Result<()> {
        self.ioctl(VIDIOC_SUBSCRIBE_EVENT, sub)
    }

    fn unsubscribe_event(&mut self, sub: &mut V4l2EventSubscription) -> io::Result<()> {
        self.ioctl(VIDIOC_UNSUBSCRIBE_EVENT, sub)
    }

    fn dequeue_event(&mut self, event: &mut V4l2Event) -> io::Result<()> {
        self.ioctl(VIDIOC_DQEVENT, event)
    }

    fn subdev_get_format(&mut self, fmt: &mut V4l2SubdevFormat) -> io::Result<()> {
        self.ioctl(VIDIOC_SUBDEV_G_FMT, fmt)
    }

    fn subdev_set_format(&mut self, fmt: &mut V4l2SubdevFormat) -> io::Result<()> {
        self.ioctl(VIDIOC_SUBDEV_S_FMT, fmt)
    }

    fn subdev_get_selection(&mut self, sel: &mut V4l2SubdevSelection) -> io::Result<()> {
        self.ioctl(VIDIOC_SUBDEV_G_SELECTION, sel)
    }

    fn subdev_set_selection(&mut self, sel: &mut V4l2SubdevSelection) -> io::Result<()> {
        self.ioctl(VIDIOC_SUBDEV_S_SELECTION, sel)
    }

    fn set_continuous_capture(&mut self, conf: &mut AtomispContCaptureConfig) -> io::Result<()> {
        self.ioctl(ATOMISP_IOC_S_CONT_CAPTURE_CONFIG, conf)
    }

    fn unlock_raw_buffer(&mut self, exposure_id: i32) -> io::Result<()> {
        let mut id = exposure_id as libc::c_int;
        self.ioctl(ATOMISP_IOC_EXP_ID_UNLOCK, &mut id)
    }

    fn capture_raw_buffer(&mut self, exposure_id: i32) -> io::Result<()> {
        let mut id = exposure_id as libc::c_int;
        self.ioctl(ATOMISP_IOC_EXP_ID_CAPTURE, &mut id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regular_file_is_rejected() {
        let file = tempfile::NamedTempFile::new().expect("temp file");
        let mut driver = KernelDriver::default();
        let err = driver.open(file.path()).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENODEV));
        assert!(driver.raw_fd().is_none());
    }

    #[test]
    fn ioctl_on_closed_driver_is_ebadf() {
        let mut driver = KernelDriver::default();
        let mut ctrl = V4l2Control::default();
        let err = driver.get_control(&mut ctrl).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EBADF));
    }
}
