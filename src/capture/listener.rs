// SPDX-License-Identifier: GPL-3.0-only

//! Capture-event listeners and per-stream frame observers

use super::streams::NodeRole;
use crate::buffer::{CameraBuffer, StreamId};
use crate::errors::{HalError, HalResult};
use crate::v4l2::FrameStatus;
use crate::v4l2::sys::V4l2Buffer;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CaptureEventType {
    RawBayer,
    MipiCompressed,
    Statistics2A,
    NewSensorDescriptor,
}

impl CaptureEventType {
    pub const ALL: [CaptureEventType; 4] = [
        CaptureEventType::RawBayer,
        CaptureEventType::MipiCompressed,
        CaptureEventType::Statistics2A,
        CaptureEventType::NewSensorDescriptor,
    ];

    pub fn display_name(&self) -> &'static str {
        match self {
            CaptureEventType::RawBayer => "raw-bayer",
            CaptureEventType::MipiCompressed => "mipi-compressed",
            CaptureEventType::Statistics2A => "2a-statistics",
            CaptureEventType::NewSensorDescriptor => "new-sensor-descriptor",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CaptureEvent {
    pub event_type: CaptureEventType,
    pub buffer: Option<Arc<CameraBuffer>>,
    /// Descriptor as dequeued
    pub descriptor: Option<V4l2Buffer>,
    pub role: Option<NodeRole>,
    pub request_id: Option<u32>,
    /// Microseconds
    pub timestamp: i64,
    pub sequence: u32,
    /// Payload size; for JPEG this excludes the stripped JFIF header
    pub bytes_used: u32,
}

impl CaptureEvent {
    pub fn new(event_type: CaptureEventType) -> Self {
        Self {
            event_type,
            buffer: None,
            descriptor: None,
            role: None,
            request_id: None,
            timestamp: 0,
            sequence: 0,
            bytes_used: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub enum CaptureMessage {
    Event(CaptureEvent),
    Error(HalError),
}

pub trait CaptureEventListener: Send + Sync {
    /// Returns true when the listener consumed the event
    fn notify_capture_event(&self, message: &CaptureMessage) -> bool;
}

fn same_object<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Each object once, whatever number of lists it sits in
fn distinct<'a, T: ?Sized + 'a>(lists: impl Iterator<Item = &'a Vec<Arc<T>>>) -> Vec<Arc<T>> {
    let mut out: Vec<Arc<T>> = Vec::new();
    for item in lists.flatten() {
        if !out.iter().any(|seen| same_object(seen, item)) {
            out.push(Arc::clone(item));
        }
    }
    out
}

#[derive(Default)]
pub struct ListenerRegistry {
    listeners: Mutex<HashMap<CaptureEventType, Vec<Arc<dyn CaptureEventListener>>>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self) -> MutexGuard<'_, HashMap<CaptureEventType, Vec<Arc<dyn CaptureEventListener>>>> {
        self.listeners.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn attach(&self, listener: Arc<dyn CaptureEventListener>, event: CaptureEventType) -> HalResult<()> {
        let mut map = self.map();
        let list = map.entry(event).or_default();
        if list.iter().any(|l| same_object(l, &listener)) {
            return Err(HalError::AlreadyExists(format!(
                "listener for {}",
                event.display_name()
            )));
        }
        list.push(listener);
        debug!(event = event.display_name(), count = list.len(), "Listener attached");
        Ok(())
    }

    /// Detaching from an event nobody listens to is a no-op
    pub fn detach(&self, listener: &Arc<dyn CaptureEventListener>, event: CaptureEventType) -> HalResult<()> {
        let mut map = self.map();
        let Some(list) = map.get_mut(&event) else {
            warn!(event = event.display_name(), "No listener registered for event, ignoring");
            return Ok(());
        };
        let Some(pos) = list.iter().position(|l| same_object(l, listener)) else {
            return Err(HalError::InvalidArgument(format!(
                "listener not attached to {}",
                event.display_name()
            )));
        };
        list.remove(pos);
        if list.is_empty() {
            map.remove(&event);
        }
        Ok(())
    }

    pub fn count(&self, event: CaptureEventType) -> usize {
        self.map().get(&event).map_or(0, Vec::len)
    }

    /// Deliver to every listener of the event type; true if any consumed it
    pub fn notify(&self, message: &CaptureMessage) -> bool {
        let listeners: Vec<Arc<dyn CaptureEventListener>> = match message {
            CaptureMessage::Event(event) => self.map().get(&event.event_type).cloned().unwrap_or_default(),
            CaptureMessage::Error(_) => distinct(self.map().values()),
        };
        // Listeners run without the registry lock so they may attach or detach
        listeners
            .iter()
            .fold(false, |consumed, l| l.notify_capture_event(message) | consumed)
    }
}

/// A completed frame for one stream
#[derive(Debug, Clone)]
pub struct FrameNotification {
    pub stream: StreamId,
    pub buffer: Arc<CameraBuffer>,
    pub status: FrameStatus,
    pub request_id: Option<u32>,
    pub sequence: u32,
    pub timestamp: i64,
}

pub trait FrameObserver: Send + Sync {
    fn notify_frame(&self, frame: &FrameNotification);
    fn notify_error(&self, error: &HalError);
}

#[derive(Default)]
pub struct ObserverRegistry {
    observers: Mutex<HashMap<StreamId, Vec<Arc<dyn FrameObserver>>>>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self) -> MutexGuard<'_, HashMap<StreamId, Vec<Arc<dyn FrameObserver>>>> {
        self.observers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn attach(&self, stream: StreamId, observer: Arc<dyn FrameObserver>) -> HalResult<()> {
        let mut map = self.map();
        let list = map.entry(stream).or_default();
        if list.iter().any(|o| same_object(o, &observer)) {
            return Err(HalError::AlreadyExists(format!("observer for stream {}", stream)));
        }
        list.push(observer);
        Ok(())
    }

    pub fn detach(&self, stream: StreamId, observer: &Arc<dyn FrameObserver>) -> HalResult<()> {
        let mut map = self.map();
        let list = map
            .get_mut(&stream)
            .ok_or_else(|| HalError::NotFound(format!("observers for stream {}", stream)))?;
        let pos = list
            .iter()
            .position(|o| same_object(o, observer))
            .ok_or_else(|| HalError::NotFound(format!("observer for stream {}", stream)))?;
        list.remove(pos);
        if list.is_empty() {
            map.remove(&stream);
        }
        Ok(())
    }

    pub fn notify_frame(&self, frame: &FrameNotification) {
        let observers = self.map().get(&frame.stream).cloned().unwrap_or_default();
        for observer in observers {
            observer.notify_frame(frame);
        }
    }

    pub fn notify_error(&self, error: &HalError) {
        let observers = distinct(self.map().values());
        for observer in observers {
            observer.notify_error(error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct Counter(AtomicU32);

    impl CaptureEventListener for Counter {
        fn notify_capture_event(&self, _message: &CaptureMessage) -> bool {
            self.0.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    #[test]
    fn duplicate_attach_is_rejected() {
        let registry = ListenerRegistry::new();
        let listener: Arc<dyn CaptureEventListener> = Arc::new(Counter::default());
        registry.attach(listener.clone(), CaptureEventType::RawBayer).unwrap();
        assert!(matches!(
            registry.attach(listener.clone(), CaptureEventType::RawBayer),
            Err(HalError::AlreadyExists(_))
        ));
        // Same listener on another event is fine
        registry.attach(listener, CaptureEventType::Statistics2A).unwrap();
    }

    #[test]
    fn notify_reaches_only_matching_event_type() {
        let registry = ListenerRegistry::new();
        let raw = Arc::new(Counter::default());
        let stats = Arc::new(Counter::default());
        registry.attach(raw.clone(), CaptureEventType::RawBayer).unwrap();
        registry.attach(stats.clone(), CaptureEventType::Statistics2A).unwrap();

        let consumed = registry.notify(&CaptureMessage::Event(CaptureEvent::new(CaptureEventType::RawBayer)));
        assert!(consumed);
        assert_eq!(raw.0.load(Ordering::SeqCst), 1);
        assert_eq!(stats.0.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn error_reaches_each_listener_once() {
        let registry = ListenerRegistry::new();
        let counter = Arc::new(Counter::default());
        registry.attach(counter.clone(), CaptureEventType::RawBayer).unwrap();
        registry.attach(counter.clone(), CaptureEventType::Statistics2A).unwrap();

        assert!(registry.notify(&CaptureMessage::Error(HalError::Flushed)));
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }

    #[derive(Default)]
    struct ErrorCounter(AtomicU32);

    impl FrameObserver for ErrorCounter {
        fn notify_frame(&self, _frame: &FrameNotification) {}

        fn notify_error(&self, _error: &HalError) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn error_reaches_each_observer_once() {
        let registry = ObserverRegistry::new();
        let observer = Arc::new(ErrorCounter::default());
        let other = Arc::new(ErrorCounter::default());
        registry.attach(0, observer.clone()).unwrap();
        registry.attach(1, observer.clone()).unwrap();
        registry.attach(1, other.clone()).unwrap();

        registry.notify_error(&HalError::Flushed);
        assert_eq!(observer.0.load(Ordering::SeqCst), 1);
        assert_eq!(other.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn detach_unknown_listener() {
        let registry = ListenerRegistry::new();
        let a: Arc<dyn CaptureEventListener> = Arc::new(Counter::default());
        let b: Arc<dyn CaptureEventListener> = Arc::new(Counter::default());
        assert!(registry.detach(&a, CaptureEventType::RawBayer).is_ok());
        registry.attach(a.clone(), CaptureEventType::RawBayer).unwrap();
        assert!(registry.detach(&b, CaptureEventType::RawBayer).is_err());
        registry.detach(&a, CaptureEventType::RawBayer).unwrap();
        assert_eq!(registry.count(CaptureEventType::RawBayer), 0);
    }
}
