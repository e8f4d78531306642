// SPDX-License-Identifier: MPL-2.0

//! Integration tests for buffer locking and release

use camera_hal::HalError;
use camera_hal::buffer::{
    BackingKind, BufferHandle, BufferMapper, CameraBuffer, Fence, GraphicAllocation, GraphicsAllocator,
    StreamBuffer, allocate_graphic_pool, allocate_heap_pool,
};
use camera_hal::constants::{StreamFormat, V4L2_PIX_FMT_JPEG, V4L2_PIX_FMT_NV12};
use camera_hal::errors::HalResult;
use std::collections::HashMap;
use std::os::fd::{FromRawFd, OwnedFd};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct CountingMapper {
    locks: AtomicU32,
    unlocks: AtomicU32,
    fail_lock: bool,
    /// (width, height) of the last lock
    last_bounds: Mutex<Option<(u32, u32)>>,
    memory: Mutex<Vec<u8>>,
}

impl BufferMapper for CountingMapper {
    fn lock(&self, _handle: BufferHandle, _usage: u32, width: u32, height: u32) -> HalResult<usize> {
        self.locks.fetch_add(1, Ordering::SeqCst);
        *self.last_bounds.lock().unwrap() = Some((width, height));
        if self.fail_lock {
            return Err(HalError::Driver {
                call: "mapper_lock",
                errno: libc::EINVAL,
            });
        }
        let mut memory = self.memory.lock().unwrap();
        if memory.is_empty() {
            memory.resize(1 << 16, 0);
        }
        Ok(memory.as_ptr() as usize)
    }

    fn unlock(&self, _handle: BufferHandle) -> HalResult<()> {
        self.unlocks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct CountingAllocator {
    memory: Mutex<HashMap<u64, Vec<u8>>>,
    next: AtomicU32,
    /// Allocation number that fails, counting from 0
    fail_at: Option<u32>,
    unlocks: Mutex<Vec<u64>>,
    frees: Mutex<Vec<u64>>,
}

impl GraphicsAllocator for CountingAllocator {
    fn allocate(&self, width: u32, height: u32, _v4l2_format: u32, _usage: u32) -> Option<GraphicAllocation> {
        let id = self.next.fetch_add(1, Ordering::SeqCst);
        if self.fail_at == Some(id) {
            return None;
        }
        let stride = width.next_multiple_of(64);
        let bytes = vec![0u8; (stride * height * 2) as usize];
        let data = bytes.as_ptr() as usize;
        self.memory.lock().unwrap().insert(id as u64, bytes);
        Some(GraphicAllocation {
            handle: BufferHandle(id as u64),
            stride,
            data,
        })
    }

    fn unlock(&self, handle: BufferHandle) {
        self.unlocks.lock().unwrap().push(handle.0);
    }

    fn free(&self, handle: BufferHandle) {
        self.frees.lock().unwrap().push(handle.0);
        self.memory.lock().unwrap().remove(&handle.0);
    }
}

fn stream_buffer(format: StreamFormat, v4l2_format: u32, width: u32, height: u32) -> StreamBuffer {
    StreamBuffer {
        handle: BufferHandle(7),
        stream: 1,
        width,
        height,
        stride: 0,
        format,
        v4l2_format,
        acquire_fence: None,
    }
}

fn pipe() -> (OwnedFd, OwnedFd) {
    let mut fds = [0; 2];
    // SAFETY: fds is a valid two-element array
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
    // SAFETY: pipe() returned two fresh descriptors
    unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
}

#[test]
fn test_handle_buffer_lock_unlock_balance() {
    let mapper = Arc::new(CountingMapper::default());
    let buffer = CameraBuffer::wrap_handle(mapper.clone());

    // Nothing to lock before init
    assert!(matches!(buffer.lock(), Err(HalError::InvalidOperation(_))));

    buffer
        .init(stream_buffer(StreamFormat::Ycbcr420, V4L2_PIX_FMT_NV12, 64, 48))
        .unwrap();
    assert_eq!(buffer.kind(), BackingKind::Handle);
    assert_eq!(buffer.stride(), 64);

    buffer.lock().unwrap();
    assert!(buffer.is_locked());
    assert_ne!(buffer.data(), 0);
    assert_eq!(buffer.size(), 64 * 48 * 3 / 2);
    assert_eq!(buffer.lock(), Err(HalError::AlreadyLocked));

    buffer.unlock().unwrap();
    assert!(!buffer.is_locked());
    assert_eq!(buffer.data(), 0);
    assert_eq!(buffer.unlock(), Err(HalError::NotLocked));

    assert_eq!(mapper.locks.load(Ordering::SeqCst), 1);
    assert_eq!(mapper.unlocks.load(Ordering::SeqCst), 1);
}

#[test]
fn test_blob_buffer_is_locked_as_one_row() {
    let mapper = Arc::new(CountingMapper::default());
    let buffer = CameraBuffer::wrap_handle(mapper.clone());
    buffer
        .init(stream_buffer(StreamFormat::Blob, V4L2_PIX_FMT_JPEG, 4096, 1))
        .unwrap();
    buffer.lock().unwrap();
    assert_eq!(*mapper.last_bounds.lock().unwrap(), Some((4096, 1)));
    assert_eq!(buffer.size(), 4096);
}

#[test]
fn test_failed_lock_unlocks_the_mapper() {
    let mapper = Arc::new(CountingMapper {
        fail_lock: true,
        ..Default::default()
    });
    let buffer = CameraBuffer::wrap_handle(mapper.clone());
    buffer
        .init(stream_buffer(StreamFormat::Ycbcr420, V4L2_PIX_FMT_NV12, 16, 16))
        .unwrap();
    assert!(buffer.lock().is_err());
    assert!(!buffer.is_locked());
    assert_eq!(mapper.unlocks.load(Ordering::SeqCst), 1);
}

#[test]
fn test_init_is_refused_while_locked() {
    let mapper = Arc::new(CountingMapper::default());
    let buffer = CameraBuffer::wrap_handle(mapper);
    buffer
        .init(stream_buffer(StreamFormat::Ycbcr420, V4L2_PIX_FMT_NV12, 16, 16))
        .unwrap();
    buffer.lock().unwrap();
    assert_eq!(
        buffer.init(stream_buffer(StreamFormat::Ycbcr420, V4L2_PIX_FMT_NV12, 32, 32)),
        Err(HalError::AlreadyLocked)
    );

    let heap = CameraBuffer::heap(16, 16, 16, V4L2_PIX_FMT_NV12, StreamFormat::Ycbcr420).unwrap();
    assert!(matches!(
        heap.init(stream_buffer(StreamFormat::Ycbcr420, V4L2_PIX_FMT_NV12, 16, 16)),
        Err(HalError::InvalidOperation(_))
    ));
}

#[test]
fn test_graphics_buffer_released_once_by_last_owner() {
    let allocator = Arc::new(CountingAllocator::default());
    let dyn_allocator: Arc<dyn GraphicsAllocator> = allocator.clone();
    let buffer = CameraBuffer::graphic(dyn_allocator, 100, 50, V4L2_PIX_FMT_NV12).unwrap();
    assert_eq!(buffer.kind(), BackingKind::Graphics);
    assert_eq!(buffer.stride(), 128);
    // Graphics buffers stay mapped for their whole life
    buffer.lock().unwrap();
    buffer.unlock().unwrap();
    assert!(buffer.is_locked());

    let other = Arc::clone(&buffer);
    drop(buffer);
    assert!(allocator.frees.lock().unwrap().is_empty());

    drop(other);
    assert_eq!(*allocator.unlocks.lock().unwrap(), vec![0]);
    assert_eq!(*allocator.frees.lock().unwrap(), vec![0]);
}

#[test]
fn test_locked_handle_buffer_unlocks_on_drop() {
    let mapper = Arc::new(CountingMapper::default());
    let buffer = CameraBuffer::wrap_handle(mapper.clone());
    buffer
        .init(stream_buffer(StreamFormat::Ycbcr420, V4L2_PIX_FMT_NV12, 16, 16))
        .unwrap();
    buffer.lock().unwrap();
    drop(buffer);
    assert_eq!(mapper.unlocks.load(Ordering::SeqCst), 1);

    // Never initialised: nothing to release
    let mapper = Arc::new(CountingMapper::default());
    drop(CameraBuffer::wrap_handle(mapper.clone()));
    assert_eq!(mapper.unlocks.load(Ordering::SeqCst), 0);
}

#[test]
fn test_graphic_pool_unwinds_on_failure() {
    let allocator = Arc::new(CountingAllocator {
        fail_at: Some(2),
        ..Default::default()
    });
    let dyn_allocator: Arc<dyn GraphicsAllocator> = allocator.clone();
    let result = allocate_graphic_pool(&dyn_allocator, 4, 64, 64, V4L2_PIX_FMT_NV12);
    assert!(matches!(result, Err(HalError::OutOfMemory(_))));

    let mut freed = allocator.frees.lock().unwrap().clone();
    freed.sort_unstable();
    assert_eq!(freed, vec![0, 1]);
}

#[test]
fn test_heap_pool_is_page_aligned() {
    let pool = allocate_heap_pool(3, 320, 240, 320, V4L2_PIX_FMT_NV12).unwrap();
    assert_eq!(pool.len(), 3);
    for buffer in &pool {
        assert_eq!(buffer.kind(), BackingKind::Heap);
        assert_eq!(buffer.data() % 4096, 0);
        assert_eq!(buffer.size(), 320 * 240 * 3 / 2);
    }
}

#[test]
fn test_acquire_fence_timeout_is_a_warning() {
    let (read, _write) = pipe();
    let buffer = CameraBuffer::heap(16, 16, 16, V4L2_PIX_FMT_NV12, StreamFormat::Ycbcr420).unwrap();
    buffer.set_acquire_fence(Some(Fence::new(read)));

    let err = buffer.wait_on_acquire_fence(20).unwrap_err();
    assert_eq!(err, HalError::FenceTimeout { timeout_ms: 20 });
    assert!(err.is_warning());

    // The fence is consumed by the first wait
    assert!(buffer.wait_on_acquire_fence(20).is_ok());
}

#[test]
fn test_capture_info_and_request_tag() {
    let buffer = CameraBuffer::heap(16, 16, 16, V4L2_PIX_FMT_NV12, StreamFormat::Ycbcr420).unwrap();
    buffer.set_request_id(Some(12));
    buffer.set_capture_info(1_000_033, 31);
    assert_eq!(buffer.request_id(), Some(12));
    assert_eq!(buffer.timestamp(), 1_000_033);
    assert_eq!(buffer.sequence(), 31);
    buffer.set_stream(3);
    assert_eq!(buffer.stream(), Some(3));
}
