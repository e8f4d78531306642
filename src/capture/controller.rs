// SPDX-License-Identifier: GPL-3.0-only

//! Capture controller
//!
//! Owns the overlay and capture nodes of one camera and drives them through
//! the mode machine:
//!
//! ```text
//! None -> Configured -> Preview | Video | Capture | ContinuousCapture | ContinuousVideo
//!  ^                                         |
//!  +------------------- stop ----------------+
//! ```
//!
//! Every node operation runs on the controller's worker thread. Public
//! methods post a [`ControllerMessage`] and, for synchronous commands, block
//! on the reply. The [`Poller`] watches the nodes and hands completed polls
//! back through the same queue, so frames are grabbed in order with
//! configuration changes.
//!
//! Each node registers one slot more than its stream needs. The extra slot
//! holds a spare buffer the worker queues when a node is down to its last
//! buffer, so the driver never runs dry; the spare is dropped when it comes
//! back out.

use super::continuous::{ContinuousCapture, ContinuousCaptureConfig, ContinuousTiming};
use super::device_registry::{DeviceLease, DeviceRegistry};
use super::listener::{
    CaptureEvent, CaptureEventListener, CaptureEventType, CaptureMessage, FrameNotification,
    FrameObserver, ListenerRegistry, ObserverRegistry,
};
use super::messages::{
    CaptureMode, CaptureRequest, ControllerMessage, ControllerStatus, DeviceEvent, DeviceEventKind,
    NodeStatus, SpareState,
};
use super::streams::{NodeRole, StreamAssignment, StreamConfig, classify_streams};
use crate::buffer::{CameraBuffer, CaptureBuffer, GraphicsAllocator, ItemPool, StreamId};
use crate::config::{HalConfig, NodePaths};
use crate::constants::{
    FENCE_TIMEOUT_MS, JFIF_HEADER_SIZE, JPEG_DATA_START_OFFSET, StreamFormat, V4L2_PIX_FMT_JPEG,
};
use crate::errors::{HalError, HalResult};
use crate::message_queue::{MessageQueue, reply};
use crate::poller::{PollEvent, PollEventListener, PollOutcome, PollTarget, Poller};
use crate::v4l2::sys::V4l2Buffer;
use crate::v4l2::{
    DriverFactory, FrameInfo, MemoryType, NodeDirection, V4l2BufferInfo, VideoNode, VideoNodeState,
};
use bytemuck::Zeroable;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

/// Poll request id used for spare-buffer polls, outside the client id range
pub const SPARE_POLL_REQUEST: u32 = u32::MAX;

struct SpareBuffer {
    buffer: Arc<CameraBuffer>,
    /// Device slot reserved for the spare
    index: u32,
    state: SpareState,
    queued_total: u32,
}

impl SpareBuffer {
    fn descriptor(&self) -> V4l2Buffer {
        let mut vbuf = V4l2Buffer::zeroed();
        vbuf.index = self.index;
        vbuf.set_userptr(self.buffer.data() as libc::c_ulong);
        vbuf.length = self.buffer.size();
        vbuf
    }
}

/// One node and the bookkeeping of the stream it serves
struct NodeSlot {
    role: NodeRole,
    node: VideoNode,
    stream: Option<StreamId>,
    format: FrameInfo,
    /// Slots for framework buffers; the spare takes the next index
    buffers_num: u32,
    items: ItemPool<CaptureBuffer>,
    in_flight: HashMap<u32, CaptureBuffer>,
    spare: Option<SpareBuffer>,
}

impl NodeSlot {
    fn new(role: NodeRole, path: &str, factory: &DriverFactory) -> Self {
        Self {
            role,
            node: VideoNode::new(path, NodeDirection::Input, factory()),
            stream: None,
            format: FrameInfo::default(),
            buffers_num: 0,
            items: ItemPool::from_items(role.display_name(), Vec::new()),
            in_flight: HashMap::new(),
            spare: None,
        }
    }

    fn name(&self) -> &'static str {
        self.role.display_name()
    }

    fn is_jpeg(&self) -> bool {
        self.format.format == V4L2_PIX_FMT_JPEG
    }

    fn poll_target(&self) -> Option<PollTarget> {
        self.node.raw_fd().map(|fd| PollTarget {
            id: self.role.id(),
            fd,
        })
    }

    fn configure(&mut self, assignment: &StreamAssignment, cached: bool) -> HalResult<()> {
        if self.node.state() == VideoNodeState::Closed {
            self.node.open()?;
        }
        let stream = assignment.stream;
        let mut info = FrameInfo::new(stream.width, stream.height, assignment.v4l2_format);
        self.node.set_format(&mut info)?;
        self.format = info;
        self.stream = Some(stream.id);
        self.buffers_num = stream.max_buffers;
        self.register_pool(cached)?;
        info!(
            node = self.name(),
            stream = stream.id,
            width = info.width,
            height = info.height,
            stride = info.stride,
            buffers = self.buffers_num,
            "Node configured"
        );
        Ok(())
    }

    /// Register the stream's slots plus one for the spare
    fn register_pool(&mut self, cached: bool) -> HalResult<()> {
        let cfg = self.format;
        let infos = (0..=self.buffers_num)
            .map(|_| V4l2BufferInfo::new(0, 0, cfg.width, cfg.height, cfg.format))
            .collect();
        self.node.set_buffer_pool(infos, cached, MemoryType::UserPtr)?;
        self.reset_items();
        Ok(())
    }

    /// Forget in-flight buffers and refill the item pool
    fn reset_items(&mut self) {
        let dropped = self.in_flight.len();
        for (_, mut item) in self.in_flight.drain() {
            if let Some(buffer) = item.reset() {
                buffer.set_request_id(None);
            }
        }
        if dropped > 0 {
            debug!(node = self.role.display_name(), dropped, "Discarded in-flight buffers");
        }
        let items = (0..self.buffers_num)
            .map(|index| CaptureBuffer {
                index,
                ..Default::default()
            })
            .collect();
        self.items = ItemPool::from_items(self.role.display_name(), items);
        if let Some(spare) = self.spare.as_mut() {
            spare.state = SpareState::Free;
        }
    }

    /// Stream off and release the pool; stream-off is attempted whatever the bookkeeping says
    fn release(&mut self) -> HalResult<()> {
        let result = match self.node.state() {
            VideoNodeState::Started | VideoNodeState::Prepared => self.node.stop(false),
            _ => Ok(()),
        };
        self.reset_items();
        result
    }

    fn unconfigure(&mut self) -> HalResult<()> {
        let result = self.release();
        self.stream = None;
        self.buffers_num = 0;
        self.spare = None;
        self.items = ItemPool::from_items(self.role.display_name(), Vec::new());
        result
    }

    /// Stop the node, renegotiate the format and rebuild the pool
    ///
    /// The JPEG capture path needs this before every still.
    fn reset_jpeg_pipeline(&mut self, cached: bool) -> HalResult<()> {
        if !self.in_flight.is_empty() {
            warn!(
                node = self.name(),
                in_flight = self.in_flight.len(),
                "JPEG still pending, skipping pipeline reset"
            );
            return Ok(());
        }
        if matches!(self.node.state(), VideoNodeState::Started | VideoNodeState::Prepared) {
            self.node.stop(false)?;
        }
        let mut info = FrameInfo::new(self.format.width, self.format.height, self.format.format);
        self.node.set_format(&mut info)?;
        self.format = info;
        self.register_pool(cached)
    }

    fn status(&self) -> NodeStatus {
        NodeStatus {
            role: self.role,
            state: self.node.state(),
            stream: self.stream,
            buffers_in_device: self.node.buffers_in_device(),
            frame_count: self.node.frame_count(),
            in_flight: self.in_flight.len(),
            spare: self.spare.as_ref().map(|s| s.state),
            spare_queued_total: self.spare.as_ref().map_or(0, |s| s.queued_total),
        }
    }
}

fn allocate_spare(
    allocator: Option<&Arc<dyn GraphicsAllocator>>,
    format: &FrameInfo,
    index: u32,
) -> HalResult<SpareBuffer> {
    let buffer = match allocator {
        Some(allocator) => CameraBuffer::graphic(Arc::clone(allocator), format.stride, format.height, format.format),
        None => CameraBuffer::heap(
            format.width,
            format.height,
            format.stride,
            format.format,
            StreamFormat::Ycbcr420,
        ),
    };
    let buffer = buffer.ok_or_else(|| {
        HalError::OutOfMemory(format!("spare buffer {}x{}", format.stride, format.height))
    })?;
    Ok(SpareBuffer {
        buffer,
        index,
        state: SpareState::Free,
        queued_total: 0,
    })
}

fn map_device_event(kind: DeviceEventKind) -> Option<CaptureEventType> {
    match kind {
        DeviceEventKind::RawBayer => Some(CaptureEventType::RawBayer),
        DeviceEventKind::MipiCompressed => Some(CaptureEventType::MipiCompressed),
        DeviceEventKind::Statistics => Some(CaptureEventType::Statistics2A),
        DeviceEventKind::Unsupported(_) => None,
    }
}

/// Frames dropped while two devices were polled together means the spare
/// went out with a real request
pub fn check_spare_invariant(polled: usize, dropped: usize) -> HalResult<()> {
    if polled == 2 && dropped > 0 {
        error!(polled, dropped, "Spare buffer dequeued during a two-device poll");
        return Err(HalError::InvariantViolation(
            "polled two devices, one dropped buffer".to_string(),
        ));
    }
    Ok(())
}

/// Route a poll result through the worker queue and decide whether to re-poll
fn route_poll_event(queue: &MessageQueue<ControllerMessage>, event: &PollEvent) -> HalResult<PollOutcome> {
    if event.active.is_empty() {
        if event.timed_out {
            warn!(request_id = event.request_id, "Dropping the notify event, it was a timeout");
        } else {
            warn!(request_id = event.request_id, "Poll returned no active devices");
        }
        return Ok(PollOutcome::Done);
    }

    let dropped = match queue.request(|reply| ControllerMessage::Notify {
        event: event.clone(),
        reply,
    }) {
        Ok(dropped) => dropped,
        Err(HalError::Flushed) => {
            debug!(request_id = event.request_id, "Notify flushed");
            return Ok(PollOutcome::Done);
        }
        Err(e) => return Err(e),
    };
    debug!(
        request_id = event.request_id,
        polled = event.polled.len(),
        inactive = event.inactive.len(),
        dropped,
        "Poll event handled"
    );
    check_spare_invariant(event.polled.len(), dropped)?;

    if event.inactive.is_empty() {
        Ok(PollOutcome::Done)
    } else {
        Ok(PollOutcome::Retry)
    }
}

struct ControllerPollListener {
    queue: MessageQueue<ControllerMessage>,
}

impl PollEventListener for ControllerPollListener {
    fn notify_poll_event(&self, event: &PollEvent) -> HalResult<PollOutcome> {
        route_poll_event(&self.queue, event)
    }
}

struct ControllerWorker {
    config: HalConfig,
    queue: MessageQueue<ControllerMessage>,
    poller: Poller,
    listeners: Arc<ListenerRegistry>,
    observers: Arc<ObserverRegistry>,
    allocator: Option<Arc<dyn GraphicsAllocator>>,
    slots: [NodeSlot; 2],
    mode: CaptureMode,
    continuous: ContinuousCapture,
}

impl ControllerWorker {
    fn run(mut self) {
        info!("Capture controller worker started");
        loop {
            if self.config.extra_buffer_quirk && self.queue.is_empty() {
                self.queue_spare_buffers();
            }
            let Some(message) = self.queue.receive() else {
                break;
            };
            if !self.dispatch(message) {
                break;
            }
        }
        self.shutdown();
    }

    fn dispatch(&mut self, message: ControllerMessage) -> bool {
        match message {
            ControllerMessage::Configure { streams, reply: tx } => reply(tx, self.configure(&streams)),
            ControllerMessage::Start { mode, reply: tx } => reply(tx, self.start(mode)),
            ControllerMessage::Stop { reply: tx } => reply(tx, self.stop()),
            ControllerMessage::Capture { request } => {
                if let Err(e) = self.enqueue_buffers(&request) {
                    error!(request_id = request.id, error = %e, "Capture request failed");
                    self.observers.notify_error(&e);
                    self.listeners.notify(&CaptureMessage::Error(e));
                }
            }
            ControllerMessage::Notify { event, reply: tx } => reply(tx, self.notify(&event)),
            ControllerMessage::Flush { reply: tx } => reply(tx, self.poller.flush(false)),
            ControllerMessage::ReturnBuffer { buffer } => self.return_buffer(&buffer),
            ControllerMessage::DeviceEvent { event } => self.device_event(&event),
            ControllerMessage::PrepareOffline { config, reply: tx } => {
                reply(tx, self.continuous.prepare(config))
            }
            ControllerMessage::StartOffline { config, reply: tx } => reply(tx, self.start_offline(config)),
            ControllerMessage::StopOffline { reply: tx } => reply(tx, self.stop_offline()),
            ControllerMessage::RawBufferUnlock { exposure_id, reply: tx } => {
                let result = self.require_mode("raw_buffer_unlock", &[CaptureMode::ContinuousCapture]);
                let capture = &mut self.slots[NodeRole::Capture.id() as usize];
                reply(
                    tx,
                    result.and_then(|_| self.continuous.raw_buffer_unlock(capture.node.device(), exposure_id)),
                )
            }
            ControllerMessage::RawBufferCapture { exposure_id, reply: tx } => {
                let result = self.require_mode("raw_buffer_capture", &[CaptureMode::ContinuousCapture]);
                let capture = &mut self.slots[NodeRole::Capture.id() as usize];
                reply(
                    tx,
                    result.and_then(|_| self.continuous.raw_buffer_capture(capture.node.device(), exposure_id)),
                )
            }
            ControllerMessage::Status { reply: tx } => reply(tx, Ok(self.status())),
            ControllerMessage::Exit => return false,
        }
        true
    }

    fn require_mode(&self, operation: &'static str, allowed: &[CaptureMode]) -> HalResult<()> {
        if allowed.contains(&self.mode) {
            return Ok(());
        }
        error!(operation, mode = self.mode.display_name(), "Invalid controller mode for operation");
        Err(HalError::InvalidState {
            operation,
            state: self.mode.display_name().to_string(),
        })
    }

    fn unconfigure_all(&mut self) -> HalResult<()> {
        let mut first_error = None;
        // Capture goes down before overlay
        for slot in self.slots.iter_mut().rev() {
            if let Err(e) = slot.unconfigure() {
                warn!(node = slot.name(), error = %e, "Failed to release node");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn configure(&mut self, streams: &[StreamConfig]) -> HalResult<()> {
        self.require_mode("configure_streams", &[CaptureMode::None, CaptureMode::Configured])?;
        self.unconfigure_all()?;
        self.mode = CaptureMode::None;

        let assignments = classify_streams(streams)?;
        if assignments.is_empty() {
            return Err(HalError::InvalidArgument("no stream can be served".to_string()));
        }

        let cached = self.config.cached_buffers;
        for assignment in &assignments {
            let slot = &mut self.slots[assignment.role.id() as usize];
            let result = slot.configure(assignment, cached).and_then(|_| {
                if slot.is_jpeg() {
                    // The JPEG pipeline is rebuilt per still; a spare would not survive it
                    return Ok(());
                }
                let spare = allocate_spare(self.allocator.as_ref(), &slot.format, slot.buffers_num)?;
                slot.spare = Some(spare);
                Ok(())
            });
            if let Err(e) = result {
                error!(node = assignment.role.display_name(), error = %e, "Stream configuration failed");
                if let Err(cleanup) = self.unconfigure_all() {
                    warn!(error = %cleanup, "Cleanup after failed configuration");
                }
                return Err(e);
            }
        }

        self.mode = CaptureMode::Configured;
        info!(streams = assignments.len(), "Streams configured");
        self.listeners
            .notify(&CaptureMessage::Event(CaptureEvent::new(CaptureEventType::NewSensorDescriptor)));
        Ok(())
    }

    fn start(&mut self, mode: CaptureMode) -> HalResult<()> {
        self.require_mode("start", &[CaptureMode::Configured])?;
        if !mode.is_streaming() {
            return Err(HalError::InvalidArgument(format!(
                "cannot start in mode {}",
                mode.display_name()
            )));
        }
        let skips = self.config.sensor.initial_skip_frames;

        if mode.is_continuous() {
            let capture = &mut self.slots[NodeRole::Capture.id() as usize];
            if capture.stream.is_none() {
                return Err(HalError::InvalidOperation(
                    "continuous mode needs a configured capture node".to_string(),
                ));
            }
            self.continuous.configure_ring_buffer(capture.node.device())?;
        }

        let mut started: Vec<NodeRole> = Vec::new();
        for role in NodeRole::ALL {
            let slot = &mut self.slots[role.id() as usize];
            let wanted = match role {
                NodeRole::Overlay => true,
                // The offline path starts the capture node on demand
                NodeRole::Capture => matches!(mode, CaptureMode::Video | CaptureMode::Capture),
            };
            if !wanted || slot.stream.is_none() || slot.node.state() != VideoNodeState::Prepared {
                continue;
            }
            let node_skips = if role == NodeRole::Overlay { skips } else { 0 };
            if let Err(e) = slot.node.start(node_skips) {
                error!(node = slot.name(), error = %e, "Failed to start node");
                for role in started {
                    let slot = &mut self.slots[role.id() as usize];
                    if let Err(e) = slot.node.stop(true) {
                        warn!(node = slot.name(), error = %e, "Rollback stop failed");
                    }
                }
                return Err(e);
            }
            started.push(role);
        }

        self.mode = mode;
        info!(mode = mode.display_name(), "Capture controller started");
        Ok(())
    }

    fn stop(&mut self) -> HalResult<()> {
        if self.mode == CaptureMode::None {
            debug!("Stop with nothing configured");
            return Ok(());
        }
        if let Err(e) = self.poller.flush(false) {
            warn!(error = %e, "Poller flush on stop failed");
        }
        let result = self.unconfigure_all();
        self.continuous = ContinuousCapture::new(ContinuousTiming::from_config(&self.config));
        info!(from = self.mode.display_name(), "Capture controller stopped");
        self.mode = CaptureMode::None;
        result
    }

    /// Queue the spare to every streaming node that is down to one buffer
    fn queue_spare_buffers(&mut self) {
        for slot in &mut self.slots {
            if !slot.node.is_started() || slot.node.buffers_in_device() != 1 {
                continue;
            }
            let Some(spare) = slot.spare.as_mut() else {
                continue;
            };
            if spare.state != SpareState::Free {
                continue;
            }
            match slot.node.put_frame_descriptor(&spare.descriptor()) {
                Ok(()) => {
                    spare.state = SpareState::Queued;
                    spare.queued_total += 1;
                    debug!(node = slot.role.display_name(), index = spare.index, "Spare buffer queued");
                }
                Err(e) => warn!(node = slot.role.display_name(), error = %e, "Failed to queue spare buffer"),
            }
        }
    }

    fn enqueue_buffers(&mut self, request: &CaptureRequest) -> HalResult<()> {
        let timeout = self.config.poll_timeout_ms as i32;
        let cached = self.config.cached_buffers;
        let mut targets = Vec::new();
        let mut failure = None;

        for role in NodeRole::ALL {
            let slot = &mut self.slots[role.id() as usize];
            let Some(stream) = slot.stream else {
                continue;
            };
            let Some(buffer) = request.buffer_for(stream) else {
                debug!(request_id = request.id, stream, "No buffer for stream in request");
                continue;
            };

            // A queued spare needs its own poll so it comes back out
            if let (Some(spare), Some(target)) = (slot.spare.as_mut(), slot.node.raw_fd()) {
                if spare.state == SpareState::Queued {
                    let spare_target = PollTarget { id: role.id(), fd: target };
                    match self.poller.poll_request(SPARE_POLL_REQUEST, vec![spare_target], timeout) {
                        Ok(()) => spare.state = SpareState::QueuedAndPolling,
                        Err(e) => warn!(node = role.display_name(), error = %e, "Spare poll request failed"),
                    }
                }
            }

            let reset = if role == NodeRole::Capture && slot.is_jpeg() {
                slot.reset_jpeg_pipeline(cached)
            } else {
                Ok(())
            };
            match reset.and_then(|()| enqueue_on_slot(slot, buffer, request)) {
                Ok(()) => targets.extend(slot.poll_target()),
                Err(e) if role == NodeRole::Overlay => {
                    warn!(request_id = request.id, error = %e, "Overlay buffer not queued");
                }
                Err(e) => {
                    error!(request_id = request.id, node = role.display_name(), error = %e, "Buffer not queued");
                    failure.get_or_insert(e);
                }
            }
        }

        // Buffers that made it into a device are polled even when another stream failed
        if targets.is_empty() {
            warn!(request_id = request.id, "Request queued no buffers");
        } else if let Err(e) = self.poller.poll_request(request.id, targets, timeout) {
            failure.get_or_insert(e);
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Returns the number of spare frames dropped
    fn notify(&mut self, event: &PollEvent) -> HalResult<usize> {
        let mut dropped = 0;
        for role in NodeRole::ALL {
            if event.is_active(role.id()) && self.handle_node_poll(role)? {
                dropped += 1;
            }
        }
        Ok(dropped)
    }

    /// Grab one frame from `role`; true when it was the spare
    fn handle_node_poll(&mut self, role: NodeRole) -> HalResult<bool> {
        let slot = &mut self.slots[role.id() as usize];
        if !slot.node.is_started() {
            warn!(node = slot.name(), "Poll event for a node that is not streaming");
            return Ok(false);
        }
        let vbuf = slot.node.grab_frame()?;

        if let Some(spare) = slot.spare.as_mut() {
            if spare.index == vbuf.index {
                debug!(node = role.display_name(), index = vbuf.index, "Spare buffer dequeued, dropping it");
                spare.state = SpareState::Free;
                return Ok(true);
            }
        }

        let Some(mut item) = slot.in_flight.remove(&vbuf.index) else {
            warn!(node = slot.name(), index = vbuf.index, "Dequeued a slot with no buffer bound");
            return Ok(false);
        };
        let buffer = item.reset();
        if let Err(e) = slot.items.release(item) {
            error!(node = slot.name(), error = %e, "Capture item pool out of balance");
        }
        let Some(buffer) = buffer else {
            return Err(HalError::InvariantViolation(format!(
                "{}: in-flight slot {} had no buffer",
                slot.name(),
                vbuf.index
            )));
        };

        let timestamp = vbuf.timestamp_us();
        buffer.set_capture_info(timestamp, vbuf.sequence);
        let bytes_used = if slot.is_jpeg() {
            vbuf.bytesused.saturating_sub(JFIF_HEADER_SIZE)
        } else {
            vbuf.bytesused
        };
        let request_id = buffer.request_id();

        let mut event = CaptureEvent::new(CaptureEventType::RawBayer);
        event.buffer = Some(Arc::clone(&buffer));
        event.descriptor = Some(vbuf);
        event.role = Some(role);
        event.request_id = request_id;
        event.timestamp = timestamp;
        event.sequence = vbuf.sequence;
        event.bytes_used = bytes_used;
        self.listeners.notify(&CaptureMessage::Event(event));

        if let Some(stream) = slot.stream {
            self.observers.notify_frame(&FrameNotification {
                stream,
                buffer,
                status: vbuf.frame_status(),
                request_id,
                sequence: vbuf.sequence,
                timestamp,
            });
        }
        Ok(false)
    }

    fn return_buffer(&mut self, buffer: &Arc<CameraBuffer>) {
        if buffer.is_locked() {
            if let Err(e) = buffer.unlock() {
                warn!(error = %e, "Unlock of returned buffer failed");
            }
        }
        debug!(request_id = ?buffer.request_id(), stream = ?buffer.stream(), "Buffer returned");
        buffer.set_request_id(None);
    }

    fn device_event(&mut self, event: &DeviceEvent) {
        let Some(event_type) = map_device_event(event.kind) else {
            warn!(kind = ?event.kind, "Unsupported device event");
            return;
        };
        let userptr = event.descriptor.userptr() as usize;
        let found = self.slots.iter().find_map(|slot| {
            slot.in_flight
                .values()
                .find(|item| item.userptr == userptr)
                .and_then(|item| item.buffer.clone())
                .map(|buffer| (slot.role, buffer))
        });

        let mut capture_event = CaptureEvent::new(event_type);
        capture_event.descriptor = Some(event.descriptor);
        capture_event.request_id = Some(event.request_id);
        capture_event.timestamp = event.descriptor.timestamp_us();
        capture_event.sequence = event.descriptor.sequence;
        capture_event.bytes_used = event.descriptor.bytesused;
        match found {
            Some((role, buffer)) => {
                buffer.set_request_id(Some(event.request_id));
                capture_event.role = Some(role);
                capture_event.buffer = Some(buffer);
            }
            None => debug!(userptr, kind = event_type.display_name(), "Device event for a buffer not in flight"),
        }
        self.listeners.notify(&CaptureMessage::Event(capture_event));
    }

    fn start_offline(&mut self, config: ContinuousCaptureConfig) -> HalResult<()> {
        self.require_mode(
            "start_offline_capture",
            &[CaptureMode::ContinuousCapture, CaptureMode::ContinuousVideo],
        )?;
        let skips = self.slots[NodeRole::Overlay.id() as usize].node.initial_skips();
        let capture = &mut self.slots[NodeRole::Capture.id() as usize];
        self.continuous.start(&mut capture.node, config, skips)
    }

    fn stop_offline(&mut self) -> HalResult<()> {
        self.require_mode(
            "stop_offline_capture",
            &[CaptureMode::ContinuousCapture, CaptureMode::ContinuousVideo],
        )?;
        let capture = &mut self.slots[NodeRole::Capture.id() as usize];
        self.continuous.stop(&mut capture.node)?;
        // Buffers queued before stream-off came back with it
        capture.reset_items();
        Ok(())
    }

    fn status(&self) -> ControllerStatus {
        ControllerStatus {
            mode: self.mode,
            nodes: self.slots.iter().map(NodeSlot::status).collect(),
        }
    }

    fn shutdown(mut self) {
        self.queue.close();
        // Pending replies are dropped, their callers see Flushed
        let mut discarded = 0;
        while self.queue.try_receive().is_some() {
            discarded += 1;
        }
        if discarded > 0 {
            debug!(discarded, "Discarded queued controller messages");
        }
        if let Err(e) = self.unconfigure_all() {
            warn!(error = %e, "Node release on shutdown failed");
        }
        for slot in &mut self.slots {
            if slot.node.state() != VideoNodeState::Closed {
                if let Err(e) = slot.node.close() {
                    warn!(node = slot.name(), error = %e, "Close failed");
                }
            }
        }
        info!("Capture controller worker exited");
    }
}

/// Queue one framework buffer to `slot`
fn enqueue_on_slot(slot: &mut NodeSlot, buffer: &Arc<CameraBuffer>, request: &CaptureRequest) -> HalResult<()> {
    let Some(mut item) = slot.items.acquire() else {
        return Err(HalError::Busy(format!("{}: all slots in flight", slot.name())));
    };

    if let Err(e) = buffer.wait_on_acquire_fence(FENCE_TIMEOUT_MS) {
        warn!(node = slot.name(), request_id = request.id, error = %e, "Acquire fence wait failed, queuing anyway");
    }
    match buffer.lock() {
        Ok(()) | Err(HalError::AlreadyLocked) => {}
        Err(e) => {
            let _ = slot.items.release(item);
            return Err(e);
        }
    }
    buffer.set_request_id(Some(request.id));
    item.bind(Arc::clone(buffer), item.index);

    let mut vbuf = V4l2Buffer::zeroed();
    vbuf.index = item.index;
    if slot.is_jpeg() {
        // The driver writes the JFIF header just ahead of the EXIF reserve
        let skip = JPEG_DATA_START_OFFSET - JFIF_HEADER_SIZE;
        vbuf.set_userptr((buffer.data() + skip as usize) as libc::c_ulong);
        vbuf.length = buffer.size().saturating_sub(skip);
    } else {
        vbuf.set_userptr(buffer.data() as libc::c_ulong);
        vbuf.length = buffer.size();
    }
    item.userptr = vbuf.userptr() as usize;
    if request.per_frame_settings {
        vbuf.set_per_frame_request(Some(request.id));
    }

    let queued = if slot.node.is_started() {
        slot.node.put_frame_descriptor(&vbuf)
    } else {
        slot.node.start(0).and_then(|_| slot.node.put_frame_descriptor(&vbuf))
    };
    if let Err(e) = queued {
        item.reset();
        buffer.set_request_id(None);
        let _ = slot.items.release(item);
        return Err(e);
    }
    debug!(node = slot.name(), request_id = request.id, index = vbuf.index, "Buffer queued");
    slot.in_flight.insert(vbuf.index, item);
    Ok(())
}

/// Handle to a capture controller and its worker thread
pub struct CaptureController {
    queue: MessageQueue<ControllerMessage>,
    listeners: Arc<ListenerRegistry>,
    observers: Arc<ObserverRegistry>,
    thread: Option<JoinHandle<()>>,
    lease: Option<DeviceLease>,
}

impl CaptureController {
    pub fn new(config: HalConfig, paths: NodePaths, factory: DriverFactory) -> HalResult<Self> {
        Self::with_allocator(config, paths, factory, None)
    }

    /// Spare buffers come from `allocator` when given, the heap otherwise
    pub fn with_allocator(
        config: HalConfig,
        paths: NodePaths,
        factory: DriverFactory,
        allocator: Option<Arc<dyn GraphicsAllocator>>,
    ) -> HalResult<Self> {
        let queue = MessageQueue::new("capture-controller");
        let listeners = Arc::new(ListenerRegistry::new());
        let observers = Arc::new(ObserverRegistry::new());
        let poller = Poller::start(
            "capture",
            Arc::new(ControllerPollListener {
                queue: queue.clone(),
            }),
        )?;

        let worker = ControllerWorker {
            continuous: ContinuousCapture::new(ContinuousTiming::from_config(&config)),
            slots: [
                NodeSlot::new(NodeRole::Overlay, &paths.overlay, &factory),
                NodeSlot::new(NodeRole::Capture, &paths.capture, &factory),
            ],
            config,
            queue: queue.clone(),
            poller,
            listeners: Arc::clone(&listeners),
            observers: Arc::clone(&observers),
            allocator,
            mode: CaptureMode::None,
        };
        let thread = thread::Builder::new()
            .name("capture-controller".to_string())
            .spawn(move || worker.run())
            .map_err(|e| HalError::from_io("spawn", &e))?;
        info!(overlay = %paths.overlay, capture = %paths.capture, "Capture controller created");

        Ok(Self {
            queue,
            listeners,
            observers,
            thread: Some(thread),
            lease: None,
        })
    }

    /// Lease camera `camera_id` from `registry` and build a controller on its nodes
    pub fn open_camera(
        registry: &DeviceRegistry,
        camera_id: usize,
        config: HalConfig,
        factory: DriverFactory,
    ) -> HalResult<Self> {
        let lease = registry.acquire(camera_id)?;
        let mut controller = Self::new(config, lease.paths().clone(), factory)?;
        controller.lease = Some(lease);
        Ok(controller)
    }

    pub fn camera_id(&self) -> Option<usize> {
        self.lease.as_ref().map(DeviceLease::camera_id)
    }

    pub fn configure_streams(&self, streams: Vec<StreamConfig>) -> HalResult<()> {
        self.queue
            .request(|reply| ControllerMessage::Configure { streams, reply })
    }

    pub fn start(&self, mode: CaptureMode) -> HalResult<()> {
        self.queue.request(|reply| ControllerMessage::Start { mode, reply })
    }

    pub fn stop(&self) -> HalResult<()> {
        self.queue.request(|reply| ControllerMessage::Stop { reply })
    }

    /// Queue a request; failures are reported to observers and listeners
    pub fn enqueue_buffers(&self, request: CaptureRequest) -> HalResult<()> {
        if request.id == SPARE_POLL_REQUEST {
            return Err(HalError::InvalidArgument(format!(
                "request id {} is reserved",
                request.id
            )));
        }
        self.queue.send(ControllerMessage::Capture { request })
    }

    pub fn return_buffer(&self, buffer: Arc<CameraBuffer>) -> HalResult<()> {
        self.queue.send(ControllerMessage::ReturnBuffer { buffer })
    }

    pub fn device_event(&self, event: DeviceEvent) -> HalResult<()> {
        self.queue.send(ControllerMessage::DeviceEvent { event })
    }

    /// Discard queued captures and poll results, then wait for the worker to drain
    pub fn flush(&self) -> HalResult<()> {
        let discarded = self.queue.remove_matching(ControllerMessage::is_flushable);
        for message in &discarded {
            if let ControllerMessage::Capture { request } = message {
                for buffer in &request.buffers {
                    buffer.set_request_id(None);
                }
            }
        }
        debug!(discarded = discarded.len(), "Flushing capture controller");
        drop(discarded);
        self.queue.request(|reply| ControllerMessage::Flush { reply })
    }

    pub fn prepare_offline_capture(&self, config: ContinuousCaptureConfig) -> HalResult<()> {
        self.queue
            .request(|reply| ControllerMessage::PrepareOffline { config, reply })
    }

    pub fn start_offline_capture(&self, config: ContinuousCaptureConfig) -> HalResult<()> {
        self.queue
            .request(|reply| ControllerMessage::StartOffline { config, reply })
    }

    pub fn stop_offline_capture(&self) -> HalResult<()> {
        self.queue.request(|reply| ControllerMessage::StopOffline { reply })
    }

    pub fn raw_buffer_unlock(&self, exposure_id: i32) -> HalResult<()> {
        self.queue
            .request(|reply| ControllerMessage::RawBufferUnlock { exposure_id, reply })
    }

    pub fn raw_buffer_capture(&self, exposure_id: i32) -> HalResult<()> {
        self.queue
            .request(|reply| ControllerMessage::RawBufferCapture { exposure_id, reply })
    }

    pub fn status(&self) -> HalResult<ControllerStatus> {
        self.queue.request(|reply| ControllerMessage::Status { reply })
    }

    pub fn mode(&self) -> HalResult<CaptureMode> {
        self.status().map(|s| s.mode)
    }

    pub fn attach_listener(&self, listener: Arc<dyn CaptureEventListener>, event: CaptureEventType) -> HalResult<()> {
        self.listeners.attach(listener, event)
    }

    pub fn detach_listener(&self, listener: &Arc<dyn CaptureEventListener>, event: CaptureEventType) -> HalResult<()> {
        self.listeners.detach(listener, event)
    }

    pub fn attach_observer(&self, stream: StreamId, observer: Arc<dyn FrameObserver>) -> HalResult<()> {
        self.observers.attach(stream, observer)
    }

    pub fn detach_observer(&self, stream: StreamId, observer: &Arc<dyn FrameObserver>) -> HalResult<()> {
        self.observers.detach(stream, observer)
    }
}

impl PollEventListener for CaptureController {
    fn notify_poll_event(&self, event: &PollEvent) -> HalResult<PollOutcome> {
        route_poll_event(&self.queue, event)
    }
}

impl Drop for CaptureController {
    fn drop(&mut self) {
        if self.queue.send(ControllerMessage::Exit).is_err() {
            debug!("Controller queue already closed");
        }
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                warn!("Capture controller thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(id: u32) -> PollTarget {
        PollTarget { id, fd: -1 }
    }

    #[test]
    fn spare_invariant_only_trips_on_two_devices() {
        assert!(check_spare_invariant(1, 1).is_ok());
        assert!(check_spare_invariant(2, 0).is_ok());
        assert!(matches!(
            check_spare_invariant(2, 1),
            Err(HalError::InvariantViolation(_))
        ));
    }

    #[test]
    fn timeouts_are_not_routed_to_the_worker() {
        let queue = MessageQueue::new("test");
        let event = PollEvent {
            request_id: 3,
            active: Vec::new(),
            inactive: vec![target(0)],
            polled: vec![target(0)],
            timed_out: true,
        };
        assert_eq!(route_poll_event(&queue, &event), Ok(PollOutcome::Done));
        assert!(queue.is_empty());
    }

    #[test]
    fn partial_poll_asks_for_retry() {
        let queue: MessageQueue<ControllerMessage> = MessageQueue::new("test");
        let worker = queue.clone();
        let handle = thread::spawn(move || {
            if let Some(ControllerMessage::Notify { reply: tx, .. }) = worker.receive() {
                reply(tx, Ok(0));
            }
        });
        let event = PollEvent {
            request_id: 7,
            active: vec![target(0)],
            inactive: vec![target(1)],
            polled: vec![target(0), target(1)],
            timed_out: false,
        };
        assert_eq!(route_poll_event(&queue, &event), Ok(PollOutcome::Retry));
        handle.join().unwrap();
    }

    #[test]
    fn flushed_notify_ends_the_poll() {
        let queue: MessageQueue<ControllerMessage> = MessageQueue::new("test");
        let worker = queue.clone();
        let handle = thread::spawn(move || {
            drop(worker.receive());
        });
        let event = PollEvent {
            request_id: 1,
            active: vec![target(1)],
            inactive: Vec::new(),
            polled: vec![target(1)],
            timed_out: false,
        };
        assert_eq!(route_poll_event(&queue, &event), Ok(PollOutcome::Done));
        handle.join().unwrap();
    }

    #[test]
    fn device_event_kinds_map_to_capture_events() {
        assert_eq!(map_device_event(DeviceEventKind::RawBayer), Some(CaptureEventType::RawBayer));
        assert_eq!(
            map_device_event(DeviceEventKind::Statistics),
            Some(CaptureEventType::Statistics2A)
        );
        assert_eq!(map_device_event(DeviceEventKind::Unsupported(9)), None);
    }
}
