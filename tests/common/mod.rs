// SPDX-License-Identifier: MPL-2.0

//! In-memory V4L2 driver shared by the integration tests
//!
//! Readiness is signalled through a pipe: the read end is the descriptor the
//! HAL polls, and it holds one byte per frame the driver could hand back, so
//! the real poll path is exercised.

#![allow(dead_code)]

use bytemuck::Zeroable;
use camera_hal::constants::{bytes_to_pixels, frame_size};
use camera_hal::v4l2::sys::*;
use camera_hal::v4l2::{DriverFactory, V4l2Driver};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, Default)]
pub struct MockSlot {
    pub queued: bool,
    pub userptr: libc::c_ulong,
}

pub struct MockState {
    pub path: Option<PathBuf>,
    pub open: bool,
    pub format: V4l2PixFormat,
    /// Round bytesperline up to this many bytes, 0 to accept as is
    pub stride_alignment: u32,
    /// Most buffers REQBUFS grants
    pub max_buffers: u32,
    pub slots: Vec<MockSlot>,
    pub queue: VecDeque<V4l2Buffer>,
    pub streaming: bool,
    /// Keep the most recently queued buffer until another one arrives
    pub hold_last: bool,
    /// Sequence numbers for the next frames; counting resumes after the script
    pub sequences: VecDeque<u32>,
    pub next_sequence: u32,
    /// Frames with these sequence numbers come back flagged as errors
    pub error_sequences: Vec<u32>,
    /// Calls to fail, with the errno to fail them with
    pub failures: HashMap<&'static str, i32>,
    pub controls: HashMap<u32, i32>,
    pub subscriptions: Vec<u32>,
    pub continuous: Option<AtomispContCaptureConfig>,
    pub unlocked: Vec<i32>,
    pub captured: Vec<i32>,
    /// Active sub-device pad formats
    pub pad_formats: HashMap<u32, V4l2MbusFramefmt>,
    pub selections: HashMap<(u32, u32), V4l2Rect>,
    /// Last S_PARM time-per-frame as (numerator, denominator)
    pub frame_interval: Option<(u32, u32)>,
    pub stream_on_count: u32,
    pub queued_total: u32,
    pub dequeued_total: u32,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            path: None,
            open: false,
            format: V4l2PixFormat::default(),
            stride_alignment: 0,
            max_buffers: 32,
            slots: Vec::new(),
            queue: VecDeque::new(),
            streaming: false,
            hold_last: false,
            sequences: VecDeque::new(),
            next_sequence: 0,
            error_sequences: Vec::new(),
            failures: HashMap::new(),
            controls: HashMap::new(),
            subscriptions: Vec::new(),
            continuous: None,
            unlocked: Vec::new(),
            captured: Vec::new(),
            pad_formats: HashMap::new(),
            selections: HashMap::new(),
            frame_interval: None,
            stream_on_count: 0,
            queued_total: 0,
            dequeued_total: 0,
        }
    }
}

impl MockState {
    /// Frames a DQBUF would return right now
    pub fn completable(&self) -> usize {
        if !self.streaming {
            0
        } else if self.hold_last {
            self.queue.len().saturating_sub(1)
        } else {
            self.queue.len()
        }
    }

    fn check(&self, call: &'static str) -> io::Result<()> {
        match self.failures.get(call) {
            Some(&errno) => Err(io::Error::from_raw_os_error(errno)),
            None => Ok(()),
        }
    }
}

struct Shared {
    state: Mutex<MockState>,
    read: OwnedFd,
    write: OwnedFd,
}

impl Shared {
    fn new() -> Self {
        let mut fds = [0; 2];
        // SAFETY: fds is a valid two-element array
        let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) };
        assert_eq!(ret, 0, "pipe2 failed");
        // SAFETY: pipe2 returned two fresh descriptors nothing else owns
        let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
        Self {
            state: Mutex::new(MockState::default()),
            read,
            write,
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Make the pipe hold exactly one byte per completable frame
    fn sync(&self, state: &MockState) {
        let mut buf = [0u8; 64];
        // SAFETY: non-blocking reads into a local buffer from our own pipe
        while unsafe { libc::read(self.read.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) } > 0 {}
        for _ in 0..state.completable() {
            // SAFETY: one byte from a valid buffer into our own pipe
            unsafe { libc::write(self.write.as_raw_fd(), [1u8].as_ptr().cast(), 1) };
        }
    }
}

/// Test-side view of a [`MockDriver`]
#[derive(Clone)]
pub struct MockHandle(Arc<Shared>);

impl MockHandle {
    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.0.lock()
    }

    /// Change state and resync readiness
    pub fn update(&self, f: impl FnOnce(&mut MockState)) {
        let mut state = self.0.lock();
        f(&mut state);
        self.0.sync(&state);
    }

    pub fn fail(&self, call: &'static str, errno: i32) {
        self.update(|s| {
            s.failures.insert(call, errno);
        });
    }

    pub fn clear_failure(&self, call: &'static str) {
        self.update(|s| {
            s.failures.remove(call);
        });
    }

    pub fn script_sequences(&self, sequences: &[u32]) {
        self.update(|s| s.sequences = sequences.iter().copied().collect());
    }

    pub fn set_hold_last(&self, hold: bool) {
        self.update(|s| s.hold_last = hold);
    }

    pub fn queued(&self) -> usize {
        self.state().queue.len()
    }

    pub fn is_streaming(&self) -> bool {
        self.state().streaming
    }
}

pub struct MockDriver {
    shared: Arc<Shared>,
}

impl MockDriver {
    pub fn new() -> (Self, MockHandle) {
        let shared = Arc::new(Shared::new());
        (
            Self {
                shared: Arc::clone(&shared),
            },
            MockHandle(shared),
        )
    }

    fn with_state<R>(&mut self, f: impl FnOnce(&mut MockState) -> io::Result<R>) -> io::Result<R> {
        let mut state = self.shared.lock();
        let result = f(&mut state);
        self.shared.sync(&state);
        result
    }
}

fn einval() -> io::Error {
    io::Error::from_raw_os_error(libc::EINVAL)
}

impl V4l2Driver for MockDriver {
    fn open(&mut self, path: &Path) -> io::Result<()> {
        self.with_state(|s| {
            s.check("open")?;
            s.path = Some(path.to_path_buf());
            s.open = true;
            Ok(())
        })
    }

    fn close(&mut self) {
        let _ = self.with_state(|s| {
            s.open = false;
            s.streaming = false;
            s.queue.clear();
            Ok(())
        });
    }

    fn raw_fd(&self) -> Option<RawFd> {
        self.shared.lock().open.then(|| self.shared.read.as_raw_fd())
    }

    fn query_cap(&mut self, cap: &mut V4l2Capability) -> io::Result<()> {
        self.with_state(|s| {
            s.check("QUERYCAP")?;
            cap.device_caps = V4L2_CAP_VIDEO_CAPTURE | V4L2_CAP_STREAMING;
            Ok(())
        })
    }

    fn get_format(&mut self, fmt: &mut V4l2Format) -> io::Result<()> {
        self.with_state(|s| {
            s.check("G_FMT")?;
            *fmt.pix_mut() = s.format;
            Ok(())
        })
    }

    fn set_format(&mut self, fmt: &mut V4l2Format) -> io::Result<()> {
        self.with_state(|s| {
            s.check("S_FMT")?;
            if s.streaming {
                return Err(io::Error::from_raw_os_error(libc::EBUSY));
            }
            let pix = fmt.pix_mut();
            if s.stride_alignment > 0 {
                let align = s.stride_alignment;
                pix.bytesperline = pix.bytesperline.div_ceil(align) * align;
            }
            let stride = bytes_to_pixels(pix.pixelformat, pix.bytesperline);
            pix.sizeimage = frame_size(pix.pixelformat, stride, pix.height);
            s.format = *pix;
            Ok(())
        })
    }

    fn request_buffers(&mut self, req: &mut V4l2RequestBuffers) -> io::Result<()> {
        self.with_state(|s| {
            s.check("REQBUFS")?;
            if s.streaming {
                return Err(io::Error::from_raw_os_error(libc::EBUSY));
            }
            req.count = req.count.min(s.max_buffers);
            s.slots = vec![MockSlot::default(); req.count as usize];
            s.queue.clear();
            Ok(())
        })
    }

    fn query_buffer(&mut self, buf: &mut V4l2Buffer) -> io::Result<()> {
        self.with_state(|s| {
            s.check("QUERYBUF")?;
            if buf.index as usize >= s.slots.len() {
                return Err(einval());
            }
            buf.length = s.format.sizeimage;
            buf.flags = 0;
            Ok(())
        })
    }

    fn queue_buffer(&mut self, buf: &mut V4l2Buffer) -> io::Result<()> {
        self.with_state(|s| {
            s.check("QBUF")?;
            let slot = s.slots.get_mut(buf.index as usize).ok_or_else(einval)?;
            if slot.queued {
                return Err(einval());
            }
            slot.queued = true;
            slot.userptr = buf.userptr();
            buf.flags |= V4L2_BUF_FLAG_QUEUED;
            s.queue.push_back(*buf);
            s.queued_total += 1;
            Ok(())
        })
    }

    fn dequeue_buffer(&mut self, buf: &mut V4l2Buffer) -> io::Result<()> {
        self.with_state(|s| {
            s.check("DQBUF")?;
            if !s.streaming {
                return Err(einval());
            }
            if s.completable() == 0 {
                return Err(io::Error::from_raw_os_error(libc::EAGAIN));
            }
            let queued = s.queue.pop_front().ok_or_else(einval)?;
            let sequence = s.sequences.pop_front().unwrap_or(s.next_sequence);
            s.next_sequence = sequence.wrapping_add(1);
            s.dequeued_total += 1;
            if let Some(slot) = s.slots.get_mut(queued.index as usize) {
                slot.queued = false;
            }

            *buf = V4l2Buffer::zeroed();
            buf.index = queued.index;
            buf.type_ = queued.type_;
            buf.memory = queued.memory;
            buf.set_userptr(queued.userptr());
            buf.length = queued.length;
            buf.reserved2 = queued.reserved2;
            buf.bytesused = s.format.sizeimage;
            buf.sequence = sequence;
            buf.field = V4L2_FIELD_NONE;
            buf.timestamp.tv_sec = (sequence / 30) as libc::time_t;
            buf.timestamp.tv_usec = ((sequence % 30) * 33_333) as libc::suseconds_t;
            buf.flags = V4L2_BUF_FLAG_DONE;
            if s.error_sequences.contains(&sequence) {
                buf.flags |= V4L2_BUF_FLAG_ERROR;
            }
            Ok(())
        })
    }

    fn stream_on(&mut self, _buf_type: u32) -> io::Result<()> {
        self.with_state(|s| {
            s.check("STREAMON")?;
            s.streaming = true;
            s.stream_on_count += 1;
            Ok(())
        })
    }

    fn stream_off(&mut self, _buf_type: u32) -> io::Result<()> {
        self.with_state(|s| {
            s.check("STREAMOFF")?;
            s.streaming = false;
            s.queue.clear();
            for slot in &mut s.slots {
                slot.queued = false;
            }
            Ok(())
        })
    }

    fn set_parm(&mut self, parm: &mut V4l2StreamParm) -> io::Result<()> {
        self.with_state(|s| {
            s.check("S_PARM")?;
            // SAFETY: the capture member is the one every caller fills in
            let interval = unsafe { parm.parm.capture.timeperframe };
            s.frame_interval = Some((interval.numerator, interval.denominator));
            Ok(())
        })
    }

    fn get_control(&mut self, ctrl: &mut V4l2Control) -> io::Result<()> {
        self.with_state(|s| {
            s.check("G_CTRL")?;
            ctrl.value = *s.controls.get(&ctrl.id).ok_or_else(einval)?;
            Ok(())
        })
    }

    fn set_control(&mut self, ctrl: &mut V4l2Control) -> io::Result<()> {
        self.with_state(|s| {
            s.check("S_CTRL")?;
            s.controls.insert(ctrl.id, ctrl.value);
            Ok(())
        })
    }

    fn subscribe_event(&mut self, sub: &mut V4l2EventSubscription) -> io::Result<()> {
        self.with_state(|s| {
            s.check("SUBSCRIBE_EVENT")?;
            s.subscriptions.push(sub.type_);
            Ok(())
        })
    }

    fn unsubscribe_event(&mut self, sub: &mut V4l2EventSubscription) -> io::Result<()> {
        self.with_state(|s| {
            s.subscriptions.retain(|&t| t != sub.type_);
            Ok(())
        })
    }

    fn set_continuous_capture(&mut self, conf: &mut AtomispContCaptureConfig) -> io::Result<()> {
        self.with_state(|s| {
            s.check("S_CONT_CAPTURE_CONFIG")?;
            s.continuous = Some(*conf);
            Ok(())
        })
    }

    fn subdev_get_format(&mut self, fmt: &mut V4l2SubdevFormat) -> io::Result<()> {
        self.with_state(|s| {
            s.check("SUBDEV_G_FMT")?;
            fmt.format = *s.pad_formats.get(&fmt.pad).ok_or_else(einval)?;
            Ok(())
        })
    }

    fn subdev_set_format(&mut self, fmt: &mut V4l2SubdevFormat) -> io::Result<()> {
        self.with_state(|s| {
            s.check("SUBDEV_S_FMT")?;
            // Sensors only do even sizes
            fmt.format.width &= !1;
            fmt.format.height &= !1;
            s.pad_formats.insert(fmt.pad, fmt.format);
            Ok(())
        })
    }

    fn subdev_get_selection(&mut self, sel: &mut V4l2SubdevSelection) -> io::Result<()> {
        self.with_state(|s| {
            sel.r = *s.selections.get(&(sel.pad, sel.target)).ok_or_else(einval)?;
            Ok(())
        })
    }

    fn subdev_set_selection(&mut self, sel: &mut V4l2SubdevSelection) -> io::Result<()> {
        self.with_state(|s| {
            s.check("SUBDEV_S_SELECTION")?;
            s.selections.insert((sel.pad, sel.target), sel.r);
            Ok(())
        })
    }

    fn unlock_raw_buffer(&mut self, exposure_id: i32) -> io::Result<()> {
        self.with_state(|s| {
            s.unlocked.push(exposure_id);
            Ok(())
        })
    }

    fn capture_raw_buffer(&mut self, exposure_id: i32) -> io::Result<()> {
        self.with_state(|s| {
            s.captured.push(exposure_id);
            Ok(())
        })
    }
}

/// Hands out mock drivers and remembers them for inspection
#[derive(Clone, Default)]
pub struct MockFactory {
    handles: Arc<Mutex<Vec<MockHandle>>>,
}

impl MockFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn factory(&self) -> DriverFactory {
        let handles = Arc::clone(&self.handles);
        Arc::new(move || {
            let (driver, handle) = MockDriver::new();
            handles.lock().unwrap_or_else(|p| p.into_inner()).push(handle);
            Box::new(driver) as Box<dyn V4l2Driver>
        })
    }

    /// Driver of the node last opened at `path`
    pub fn handle(&self, path: &str) -> Option<MockHandle> {
        let handles = self.handles.lock().unwrap_or_else(|p| p.into_inner());
        handles
            .iter()
            .rev()
            .find(|h| h.state().path.as_deref() == Some(Path::new(path)))
            .cloned()
    }
}

/// Poll `condition` until it holds or `timeout` passes
pub fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}
