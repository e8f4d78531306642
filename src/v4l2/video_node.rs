// SPDX-License-Identifier: GPL-3.0-only

//! V4L2 video node with an enforced streaming state machine
//!
//! ```text
//! Closed -> Open -> Configured -> Prepared -> Started
//!                      ^              |          |
//!                      +-- stop(false)+<- stop --+
//! ```
//!
//! Every operation checks the state first and fails with
//! [`HalError::InvalidState`] without touching the driver when called at the
//! wrong time. Driver failures are logged and returned; this layer never
//! retries.

use super::device::V4l2Device;
use super::driver::V4l2Driver;
use super::frame_info::FrameStatus;
use super::sys::*;
use crate::constants::{bytes_to_pixels, fourcc_to_string, frame_size, pixels_to_bytes};
use crate::errors::{HalError, HalResult};
use bytemuck::Zeroable;
use std::fmt;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoNodeState {
    Closed,
    Open,
    Configured,
    Prepared,
    Started,
    /// A buffer-pool registration failed half way
    Error,
}

impl fmt::Display for VideoNodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Which way frames flow through the node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeDirection {
    /// Frames come from the device (capture)
    Input,
    /// Frames go to the device (ISP input, parameters)
    Output,
}

impl NodeDirection {
    fn buf_type(self) -> u32 {
        match self {
            NodeDirection::Input => V4L2_BUF_TYPE_VIDEO_CAPTURE,
            NodeDirection::Output => V4L2_BUF_TYPE_VIDEO_OUTPUT,
        }
    }
}

/// How buffer memory is shared with the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemoryType {
    /// HAL-owned memory handed over by pointer
    #[default]
    UserPtr,
    /// Driver-owned memory mapped by the HAL
    Mmap,
}

impl MemoryType {
    fn raw(self) -> u32 {
        match self {
            MemoryType::UserPtr => V4L2_MEMORY_USERPTR,
            MemoryType::Mmap => V4L2_MEMORY_MMAP,
        }
    }
}

/// Frame geometry negotiated with a node
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameInfo {
    pub width: u32,
    pub height: u32,
    /// Line stride in pixels
    pub stride: u32,
    /// Bytes per frame
    pub size: u32,
    /// V4L2 fourcc
    pub format: u32,
}

impl FrameInfo {
    /// Geometry with an unpadded stride; the driver corrects it in set_format
    pub fn new(width: u32, height: u32, format: u32) -> Self {
        Self {
            width,
            height,
            stride: width,
            size: frame_size(format, width, height),
            format,
        }
    }
}

/// One registered buffer slot
#[derive(Debug, Clone, Copy)]
pub struct V4l2BufferInfo {
    /// CPU address of the backing memory (USERPTR)
    pub data: usize,
    pub length: u32,
    pub width: u32,
    pub height: u32,
    pub format: u32,
    pub cache_flags: u32,
    /// Descriptor as last exchanged with the driver
    pub vbuffer: V4l2Buffer,
    queued: bool,
}

impl V4l2BufferInfo {
    pub fn new(data: usize, length: u32, width: u32, height: u32, format: u32) -> Self {
        Self {
            data,
            length,
            width,
            height,
            format,
            cache_flags: 0,
            vbuffer: V4l2Buffer::zeroed(),
            queued: false,
        }
    }

    /// Currently owned by the driver
    pub fn is_queued(&self) -> bool {
        self.queued
    }
}

pub struct VideoNode {
    device: V4l2Device,
    direction: NodeDirection,
    memory: MemoryType,
    state: VideoNodeState,
    frame_counter: i32,
    initial_skips: u32,
    in_flight: AtomicI32,
    config: FrameInfo,
    pool: Vec<V4l2BufferInfo>,
}

impl VideoNode {
    pub fn new(path: impl Into<String>, direction: NodeDirection, driver: Box<dyn V4l2Driver>) -> Self {
        Self::from_device(V4l2Device::new(path, driver), direction)
    }

    pub fn from_device(device: V4l2Device, direction: NodeDirection) -> Self {
        Self {
            device,
            direction,
            memory: MemoryType::UserPtr,
            state: VideoNodeState::Closed,
            frame_counter: 0,
            initial_skips: 0,
            in_flight: AtomicI32::new(0),
            config: FrameInfo::default(),
            pool: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        self.device.name()
    }

    pub fn state(&self) -> VideoNodeState {
        self.state
    }

    pub fn direction(&self) -> NodeDirection {
        self.direction
    }

    pub fn is_started(&self) -> bool {
        self.state == VideoNodeState::Started
    }

    /// Frames dequeued since the last start
    pub fn frame_count(&self) -> i32 {
        self.frame_counter
    }

    /// Warm-up frames still to be flagged corrupted
    pub fn initial_skips(&self) -> u32 {
        self.initial_skips
    }

    /// Buffers currently queued in the driver
    pub fn buffers_in_device(&self) -> i32 {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn buffer_count(&self) -> usize {
        self.pool.len()
    }

    pub fn buffer(&self, index: usize) -> Option<&V4l2BufferInfo> {
        self.pool.get(index)
    }

    pub fn config(&self) -> FrameInfo {
        self.config
    }

    pub fn raw_fd(&self) -> Option<RawFd> {
        self.device.raw_fd()
    }

    /// Controls and events
    pub fn device(&mut self) -> &mut V4l2Device {
        &mut self.device
    }

    fn check_state(&self, operation: &'static str, allowed: &[VideoNodeState]) -> HalResult<()> {
        if allowed.contains(&self.state) {
            return Ok(());
        }
        error!(device = %self.name(), operation, state = ?self.state, "Invalid state for operation");
        Err(HalError::InvalidState {
            operation,
            state: self.state.to_string(),
        })
    }

    pub fn open(&mut self) -> HalResult<()> {
        if self.state != VideoNodeState::Closed {
            error!(device = %self.name(), state = ?self.state, "Node already open");
            return Err(HalError::Busy(self.name().to_string()));
        }
        self.device.open()?;
        self.state = VideoNodeState::Open;
        self.in_flight.store(0, Ordering::SeqCst);
        Ok(())
    }

    pub fn close(&mut self) -> HalResult<()> {
        if self.state == VideoNodeState::Started {
            if let Err(e) = self.stop(false) {
                warn!(device = %self.name(), error = %e, "Stop during close failed");
                self.state = VideoNodeState::Prepared;
            }
        }
        if !self.pool.is_empty() {
            if let Err(e) = self.destroy_buffer_pool() {
                warn!(device = %self.name(), error = %e, "Releasing buffers during close failed");
            }
        }
        self.device.close();
        self.state = VideoNodeState::Closed;
        self.in_flight.store(0, Ordering::SeqCst);
        Ok(())
    }

    /// Negotiate geometry, writing the driver-corrected stride and size back
    pub fn set_format(&mut self, info: &mut FrameInfo) -> HalResult<()> {
        self.check_state(
            "set_format",
            &[
                VideoNodeState::Open,
                VideoNodeState::Configured,
                VideoNodeState::Prepared,
            ],
        )?;
        if self.state == VideoNodeState::Prepared {
            self.destroy_buffer_pool()?;
        }
        if info.stride == 0 {
            info.stride = info.width;
        }

        let mut fmt = V4l2Format::zeroed();
        fmt.type_ = self.direction.buf_type();
        self.device
            .driver()
            .get_format(&mut fmt)
            .map_err(|e| self.device.driver_error("VIDIOC_G_FMT", e))?;

        {
            let pix = fmt.pix_mut();
            pix.width = info.width;
            pix.height = info.height;
            pix.pixelformat = info.format;
            pix.bytesperline = pixels_to_bytes(info.format, info.stride);
            pix.sizeimage = 0;
            pix.field = V4L2_FIELD_INTERLACED;
        }
        self.device
            .driver()
            .set_format(&mut fmt)
            .map_err(|e| self.device.driver_error("VIDIOC_S_FMT", e))?;

        let pix = *fmt.pix();
        info.stride = bytes_to_pixels(info.format, pix.bytesperline);
        info.size = frame_size(info.format, info.stride, info.height);
        self.config = *info;
        self.state = VideoNodeState::Configured;

        debug!(
            device = %self.name(),
            width = info.width,
            height = info.height,
            stride = info.stride,
            size = info.size,
            format = %fourcc_to_string(info.format),
            "Format set"
        );
        Ok(())
    }

    /// Register `buffers` with the driver
    ///
    /// Every buffer must match the negotiated geometry. On success the node is
    /// Prepared and owns the pool until `destroy_buffer_pool` or `close`.
    pub fn set_buffer_pool(
        &mut self,
        mut buffers: Vec<V4l2BufferInfo>,
        cached: bool,
        memory: MemoryType,
    ) -> HalResult<()> {
        self.check_state("set_buffer_pool", &[VideoNodeState::Configured])?;
        if buffers.is_empty() {
            return Err(HalError::InvalidArgument("empty buffer pool".to_string()));
        }
        let config = self.config;
        if let Some(bad) = buffers.iter().find(|b| {
            b.width != config.width || b.height != config.height || b.format != config.format
        }) {
            error!(
                device = %self.name(),
                expected = ?(config.width, config.height, fourcc_to_string(config.format)),
                got = ?(bad.width, bad.height, fourcc_to_string(bad.format)),
                "Buffer geometry does not match active format"
            );
            return Err(HalError::InvalidArgument(format!(
                "buffer {}x{} {} does not match format {}x{} {}",
                bad.width,
                bad.height,
                fourcc_to_string(bad.format),
                config.width,
                config.height,
                fourcc_to_string(config.format)
            )));
        }

        self.memory = memory;
        let count = self.request_buffers(buffers.len() as u32)?;
        if count == 0 {
            error!(device = %self.name(), "Driver granted no buffers");
            return Err(HalError::OutOfMemory(format!("{}: no driver buffers", self.name())));
        }

        let cache_flags = if cached {
            0
        } else {
            V4L2_BUF_FLAG_NO_CACHE_INVALIDATE | V4L2_BUF_FLAG_NO_CACHE_CLEAN
        };
        let buf_type = self.direction.buf_type();

        for (index, info) in buffers.iter_mut().enumerate() {
            let mut vbuf = V4l2Buffer::zeroed();
            vbuf.index = index as u32;
            vbuf.type_ = buf_type;
            vbuf.memory = memory.raw();
            if let Err(e) = self.device.driver().query_buffer(&mut vbuf) {
                let err = self.device.driver_error("VIDIOC_QUERYBUF", e);
                self.pool.clear();
                self.state = VideoNodeState::Error;
                return Err(err);
            }
            if memory == MemoryType::UserPtr {
                vbuf.set_userptr(info.data as libc::c_ulong);
            }
            info.cache_flags = cache_flags;
            info.length = vbuf.length;
            info.vbuffer = vbuf;
            info.queued = false;
        }

        self.pool = buffers;
        self.state = VideoNodeState::Prepared;
        info!(device = %self.name(), buffers = self.pool.len(), cached, "Buffer pool registered");
        Ok(())
    }

    fn request_buffers(&mut self, count: u32) -> HalResult<u32> {
        let mut req = V4l2RequestBuffers {
            count,
            type_: self.direction.buf_type(),
            memory: self.memory.raw(),
            ..Default::default()
        };
        self.device
            .driver()
            .request_buffers(&mut req)
            .map_err(|e| self.device.driver_error("VIDIOC_REQBUFS", e))?;
        debug!(device = %self.name(), requested = count, granted = req.count, "Requested buffers");
        Ok(req.count)
    }

    /// Release the driver-side pool
    pub fn destroy_buffer_pool(&mut self) -> HalResult<()> {
        if self.state == VideoNodeState::Started {
            return self.check_state("destroy_buffer_pool", &[VideoNodeState::Prepared]);
        }
        let result = self.request_buffers(0).map(|_| ());
        self.pool.clear();
        self.in_flight.store(0, Ordering::SeqCst);
        if self.state == VideoNodeState::Prepared {
            self.state = VideoNodeState::Configured;
        }
        result
    }

    /// Stream on; the first `initial_skips` frames are reported corrupted
    pub fn start(&mut self, initial_skips: u32) -> HalResult<()> {
        self.check_state("start", &[VideoNodeState::Prepared])?;
        let buf_type = self.direction.buf_type();
        self.device
            .driver()
            .stream_on(buf_type)
            .map_err(|e| self.device.driver_error("VIDIOC_STREAMON", e))?;
        self.frame_counter = 0;
        self.initial_skips = initial_skips;
        self.state = VideoNodeState::Started;
        info!(device = %self.name(), initial_skips, "Streaming started");
        Ok(())
    }

    /// Stream off, optionally keeping the registered buffers
    pub fn stop(&mut self, keep_buffers: bool) -> HalResult<()> {
        match self.state {
            VideoNodeState::Started => {
                let buf_type = self.direction.buf_type();
                self.device
                    .driver()
                    .stream_off(buf_type)
                    .map_err(|e| self.device.driver_error("VIDIOC_STREAMOFF", e))?;
                // Stream-off returns every queued buffer to userspace
                self.in_flight.store(0, Ordering::SeqCst);
                for slot in &mut self.pool {
                    slot.queued = false;
                }
                self.state = VideoNodeState::Prepared;
                info!(device = %self.name(), "Streaming stopped");
            }
            VideoNodeState::Prepared => {}
            state => {
                warn!(device = %self.name(), state = ?state, "Stop on a node that is not streaming");
                return Err(HalError::InvalidState {
                    operation: "stop",
                    state: state.to_string(),
                });
            }
        }

        if !keep_buffers {
            self.destroy_buffer_pool()?;
        }
        Ok(())
    }

    /// Queue slot `index` to the driver
    pub fn put_frame(&mut self, index: u32) -> HalResult<()> {
        self.check_state("put_frame", &[VideoNodeState::Started])?;
        let name = self.device.name().to_string();
        let memory = self.memory.raw();
        let buf_type = self.direction.buf_type();
        let slot = self.pool.get_mut(index as usize).ok_or_else(|| {
            error!(device = %name, index, "Buffer index out of range");
            HalError::InvalidArgument(format!("{}: buffer index {} out of range", name, index))
        })?;
        if slot.queued {
            error!(device = %name, index, "Buffer already queued");
            return Err(HalError::InvalidArgument(format!(
                "{}: buffer {} already queued",
                name, index
            )));
        }

        let mut vbuf = slot.vbuffer;
        vbuf.index = index;
        vbuf.type_ = buf_type;
        vbuf.memory = memory;
        vbuf.flags = slot.cache_flags;
        if let Err(e) = self.device.driver().queue_buffer(&mut vbuf) {
            return Err(self.device.driver_error("VIDIOC_QBUF", e));
        }
        let slot = &mut self.pool[index as usize];
        slot.vbuffer = vbuf;
        slot.queued = true;
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Queue a descriptor, adopting its user pointer and per-frame tag
    pub fn put_frame_descriptor(&mut self, buf: &V4l2Buffer) -> HalResult<()> {
        self.check_state("put_frame", &[VideoNodeState::Started])?;
        let index = buf.index;
        if index as usize >= self.pool.len() {
            error!(device = %self.name(), index, "Buffer index out of range");
            return Err(HalError::InvalidArgument(format!(
                "{}: buffer index {} out of range",
                self.name(),
                index
            )));
        }
        let slot = &mut self.pool[index as usize];
        if !slot.queued {
            slot.vbuffer.set_userptr(buf.userptr());
            slot.vbuffer.reserved2 = buf.reserved2;
            if buf.length != 0 {
                slot.vbuffer.length = buf.length;
            }
        }
        self.put_frame(index)
    }

    /// Dequeue one completed buffer
    pub fn grab_frame(&mut self) -> HalResult<V4l2Buffer> {
        self.check_state("grab_frame", &[VideoNodeState::Started])?;
        let mut vbuf = V4l2Buffer::zeroed();
        vbuf.type_ = self.direction.buf_type();
        vbuf.memory = self.memory.raw();
        self.device
            .driver()
            .dequeue_buffer(&mut vbuf)
            .map_err(|e| self.device.driver_error("VIDIOC_DQBUF", e))?;

        let index = vbuf.index as usize;
        if index >= self.pool.len() {
            error!(device = %self.name(), index, "Driver returned unknown buffer index");
            return Err(HalError::InvariantViolation(format!(
                "{}: dequeued index {} outside pool of {}",
                self.name(),
                index,
                self.pool.len()
            )));
        }

        let _ = self
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some((n - 1).max(0)));
        self.frame_counter = self.frame_counter.wrapping_add(1) & i32::MAX;

        if vbuf.flags & V4L2_BUF_FLAG_ERROR != 0 {
            warn!(device = %self.name(), index, sequence = vbuf.sequence, "Driver flagged frame as corrupted");
            vbuf.set_frame_status(FrameStatus::Corrupted);
        }
        if self.initial_skips > 0 {
            debug!(device = %self.name(), index, remaining = self.initial_skips, "Skipping warm-up frame");
            vbuf.set_frame_status(FrameStatus::Corrupted);
            self.initial_skips -= 1;
        }

        let slot = &mut self.pool[index];
        slot.vbuffer = vbuf;
        slot.queued = false;
        Ok(vbuf)
    }

    /// >0 when a frame is ready, 0 on timeout, <0 on error
    pub fn poll(&self, timeout_ms: i32) -> i32 {
        self.device.poll(timeout_ms)
    }

    /// Request a capture frame rate
    pub fn set_frame_rate(&mut self, fps: f32) -> HalResult<()> {
        self.device.ensure_open("set_frame_rate")?;
        if fps <= 0.0 {
            return Err(HalError::InvalidArgument(format!("frame rate {}", fps)));
        }
        let mut parm = V4l2StreamParm::zeroed();
        parm.type_ = self.direction.buf_type();
        parm.parm.capture = V4l2CaptureParm {
            timeperframe: V4l2Fract {
                numerator: 1000,
                denominator: (fps * 1000.0).round() as u32,
            },
            ..Default::default()
        };
        self.device
            .driver()
            .set_parm(&mut parm)
            .map_err(|e| self.device.driver_error("VIDIOC_S_PARM", e))
    }
}

impl fmt::Debug for VideoNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VideoNode")
            .field("name", &self.name())
            .field("state", &self.state)
            .field("frame_counter", &self.frame_counter)
            .field("in_flight", &self.buffers_in_device())
            .field("config", &self.config)
            .field("buffers", &self.pool.len())
            .finish()
    }
}

impl Drop for VideoNode {
    fn drop(&mut self) {
        if self.state != VideoNodeState::Closed {
            if let Err(e) = self.close() {
                warn!(device = %self.name(), error = %e, "Close on drop failed");
            }
        }
    }
}
