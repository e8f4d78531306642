// SPDX-License-Identifier: GPL-3.0-only

//! Reference-counted frame buffer with one of four backing kinds
//!
//! Buffers are shared as `Arc<CameraBuffer>`; the last owner releases the
//! backing memory in `Drop`, dispatched by kind:
//!
//! | Backing  | Created by                  | Lock              | Release                 |
//! |----------|-----------------------------|-------------------|-------------------------|
//! | Handle   | [`CameraBuffer::wrap_handle`] + `init` | mapper lock | mapper unlock if locked |
//! | Graphics | [`CameraBuffer::graphic`]   | pinned            | allocator unlock + free |
//! | Heap     | [`CameraBuffer::heap`]      | flag only         | `free`                  |
//! | Mapped   | [`CameraBuffer::mmap`]      | pinned            | `munmap`                |

use super::fence::Fence;
use super::memory::{BufferHandle, BufferMapper, GraphicsAllocator, USAGE_CAMERA};
use crate::constants::{StreamFormat, frame_size};
use crate::errors::{HalError, HalResult};
use crate::v4l2::V4l2BufferInfo;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, warn};

pub type StreamId = u32;

/// Default acquire-fence wait
pub const ACQUIRE_FENCE_TIMEOUT_MS: u32 = 2000;

/// Framework buffer handed in with a request
#[derive(Debug)]
pub struct StreamBuffer {
    pub handle: BufferHandle,
    pub stream: StreamId,
    pub width: u32,
    pub height: u32,
    /// Stride from the native handle, 0 when unknown
    pub stride: u32,
    pub format: StreamFormat,
    pub v4l2_format: u32,
    pub acquire_fence: Option<Fence>,
}

/// Backing kind without its payload, for logging and tests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackingKind {
    Handle,
    Graphics,
    Heap,
    Mapped,
}

enum Backing {
    Handle {
        handle: Option<BufferHandle>,
        mapper: Arc<dyn BufferMapper>,
    },
    Graphics {
        handle: BufferHandle,
        allocator: Arc<dyn GraphicsAllocator>,
    },
    Heap,
    Mapped {
        len: usize,
    },
}

impl Backing {
    fn kind(&self) -> BackingKind {
        match self {
            Backing::Handle { .. } => BackingKind::Handle,
            Backing::Graphics { .. } => BackingKind::Graphics,
            Backing::Heap => BackingKind::Heap,
            Backing::Mapped { .. } => BackingKind::Mapped,
        }
    }
}

struct BufferInner {
    width: u32,
    height: u32,
    stride: u32,
    size: u32,
    format: StreamFormat,
    v4l2_format: u32,
    backing: Backing,
    data: usize,
    locked: bool,
    initialized: bool,
    request_id: Option<u32>,
    timestamp: i64,
    sequence: u32,
    stream: Option<StreamId>,
    acquire_fence: Option<Fence>,
}

pub struct CameraBuffer {
    inner: Mutex<BufferInner>,
}

impl CameraBuffer {
    fn from_inner(inner: BufferInner) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(inner),
        })
    }

    fn blank(backing: Backing) -> BufferInner {
        BufferInner {
            width: 0,
            height: 0,
            stride: 0,
            size: 0,
            format: StreamFormat::default(),
            v4l2_format: 0,
            backing,
            data: 0,
            locked: false,
            initialized: false,
            request_id: None,
            timestamp: 0,
            sequence: 0,
            stream: None,
            acquire_fence: None,
        }
    }

    /// Pre-allocated wrapper for a framework buffer; usable after [`init`](Self::init)
    pub fn wrap_handle(mapper: Arc<dyn BufferMapper>) -> Arc<Self> {
        Self::from_inner(Self::blank(Backing::Handle {
            handle: None,
            mapper,
        }))
    }

    /// Allocate a CPU-mapped graphics buffer
    pub fn graphic(
        allocator: Arc<dyn GraphicsAllocator>,
        width: u32,
        height: u32,
        v4l2_format: u32,
    ) -> Option<Arc<Self>> {
        let Some(alloc) = allocator.allocate(width, height, v4l2_format, USAGE_CAMERA) else {
            error!(width, height, "Graphics allocator returned no buffer");
            return None;
        };
        if alloc.data == 0 {
            error!(width, height, handle = alloc.handle.0, "Graphics buffer has no mapping");
            allocator.free(alloc.handle);
            return None;
        }
        let mut inner = Self::blank(Backing::Graphics {
            handle: alloc.handle,
            allocator,
        });
        inner.width = width;
        inner.height = height;
        inner.stride = alloc.stride;
        inner.v4l2_format = v4l2_format;
        inner.size = frame_size(v4l2_format, alloc.stride, height);
        inner.data = alloc.data;
        inner.locked = true;
        inner.initialized = true;
        Some(Self::from_inner(inner))
    }

    /// Allocate a page-aligned heap buffer
    pub fn heap(
        width: u32,
        height: u32,
        stride: u32,
        v4l2_format: u32,
        format: StreamFormat,
    ) -> Option<Arc<Self>> {
        let size = frame_size(v4l2_format, stride, height);
        if size == 0 {
            error!(width, height, stride, "Refusing zero-sized heap buffer");
            return None;
        }
        // SAFETY: sysconf has no memory-safety preconditions
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) }.max(4096) as usize;
        let mut ptr: *mut libc::c_void = std::ptr::null_mut();
        // SAFETY: ptr is a valid out-pointer and page is a power of two
        let ret = unsafe { libc::posix_memalign(&mut ptr, page, size as usize) };
        if ret != 0 || ptr.is_null() {
            error!(size, errno = ret, "posix_memalign failed");
            return None;
        }
        let mut inner = Self::blank(Backing::Heap);
        inner.width = width;
        inner.height = height;
        inner.stride = stride;
        inner.size = size;
        inner.format = format;
        inner.v4l2_format = v4l2_format;
        inner.data = ptr as usize;
        inner.locked = true;
        inner.initialized = true;
        Some(Self::from_inner(inner))
    }

    /// Map `length` bytes of `fd` at `offset`, shared read/write
    pub fn mmap(fd: RawFd, length: u32, v4l2_format: u32, offset: i64) -> Option<Arc<Self>> {
        if length == 0 {
            return None;
        }
        // SAFETY: a null hint with a caller-provided descriptor; failure is checked below
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                length as usize,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                offset as libc::off_t,
            )
        };
        if ptr == libc::MAP_FAILED {
            error!(fd, length, offset, error = %std::io::Error::last_os_error(), "mmap failed");
            return None;
        }
        let mut inner = Self::blank(Backing::Mapped {
            len: length as usize,
        });
        inner.width = 1;
        inner.height = length;
        inner.stride = 1;
        inner.size = length;
        inner.v4l2_format = v4l2_format;
        inner.data = ptr as usize;
        inner.locked = true;
        inner.initialized = true;
        debug!(fd, length, "Mapped buffer");
        Some(Self::from_inner(inner))
    }

    fn inner(&self) -> MutexGuard<'_, BufferInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Bind a framework buffer to a [`wrap_handle`](Self::wrap_handle) wrapper
    pub fn init(&self, buffer: StreamBuffer) -> HalResult<()> {
        let mut guard = self.inner();
        let inner = &mut *guard;
        let Backing::Handle { handle, .. } = &mut inner.backing else {
            return Err(HalError::InvalidOperation(
                "init on a buffer that does not wrap a framework handle".to_string(),
            ));
        };
        if inner.locked {
            return Err(HalError::AlreadyLocked);
        }
        *handle = Some(buffer.handle);
        inner.width = buffer.width;
        inner.height = buffer.height;
        inner.stride = if buffer.stride != 0 {
            buffer.stride
        } else {
            buffer.width
        };
        inner.size = 0;
        inner.format = buffer.format;
        inner.v4l2_format = buffer.v4l2_format;
        inner.stream = Some(buffer.stream);
        inner.acquire_fence = buffer.acquire_fence;
        inner.data = 0;
        inner.request_id = None;
        inner.initialized = true;
        Ok(())
    }

    /// Map the buffer for CPU access
    pub fn lock(&self) -> HalResult<()> {
        let mut guard = self.inner();
        let inner = &mut *guard;
        if !inner.initialized {
            error!("Cannot lock a buffer that is not initialized");
            return Err(HalError::InvalidOperation("buffer not initialized".to_string()));
        }
        let (handle, mapper) = match &inner.backing {
            Backing::Heap => {
                inner.locked = true;
                return Ok(());
            }
            Backing::Graphics { .. } | Backing::Mapped { .. } => return Ok(()),
            Backing::Handle { handle, mapper } => {
                if inner.locked {
                    error!(stream = ?inner.stream, "Buffer already locked");
                    return Err(HalError::AlreadyLocked);
                }
                let Some(handle) = *handle else {
                    return Err(HalError::InvalidOperation("no framework handle".to_string()));
                };
                (handle, mapper.clone())
            }
        };

        let (width, height, size) = if inner.format == StreamFormat::Blob {
            // JPEG buffers are described as width x 1 bytes
            (inner.width, 1, inner.width)
        } else {
            (
                inner.width,
                inner.height,
                frame_size(inner.v4l2_format, inner.stride, inner.height),
            )
        };
        match mapper.lock(handle, USAGE_CAMERA, width, height) {
            Ok(data) => {
                inner.data = data;
                inner.size = size;
                inner.locked = true;
                Ok(())
            }
            Err(e) => {
                error!(handle = handle.0, error = %e, "Mapper lock failed");
                if let Err(e) = mapper.unlock(handle) {
                    debug!(handle = handle.0, error = %e, "Unlock after failed lock");
                }
                Err(e)
            }
        }
    }

    /// Release the CPU mapping; a buffer that is not locked is a warning
    pub fn unlock(&self) -> HalResult<()> {
        let mut guard = self.inner();
        let inner = &mut *guard;
        match &inner.backing {
            Backing::Graphics { .. } | Backing::Mapped { .. } if inner.locked => Ok(()),
            Backing::Heap if inner.locked => {
                inner.locked = false;
                Ok(())
            }
            Backing::Handle {
                handle: Some(handle),
                mapper,
            } if inner.locked => {
                let (handle, mapper) = (*handle, mapper.clone());
                inner.locked = false;
                inner.data = 0;
                mapper.unlock(handle)
            }
            _ => {
                warn!(kind = ?inner.backing.kind(), "Unlocking a buffer that is not locked");
                Err(HalError::NotLocked)
            }
        }
    }

    /// Wait for the framework's acquire fence, consuming it
    pub fn wait_on_acquire_fence(&self, timeout_ms: u32) -> HalResult<()> {
        let fence = self.inner().acquire_fence.take();
        match fence {
            Some(fence) => fence.wait(timeout_ms).inspect_err(|e| {
                warn!(error = %e, timeout_ms, "Acquire fence wait failed");
            }),
            None => Ok(()),
        }
    }

    pub fn set_acquire_fence(&self, fence: Option<Fence>) {
        self.inner().acquire_fence = fence;
    }

    pub fn kind(&self) -> BackingKind {
        self.inner().backing.kind()
    }

    pub fn handle(&self) -> Option<BufferHandle> {
        match &self.inner().backing {
            Backing::Handle { handle, .. } => *handle,
            Backing::Graphics { handle, .. } => Some(*handle),
            _ => None,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.inner().initialized
    }

    pub fn is_locked(&self) -> bool {
        self.inner().locked
    }

    pub fn width(&self) -> u32 {
        self.inner().width
    }

    pub fn height(&self) -> u32 {
        self.inner().height
    }

    pub fn stride(&self) -> u32 {
        self.inner().stride
    }

    pub fn size(&self) -> u32 {
        self.inner().size
    }

    pub fn format(&self) -> StreamFormat {
        self.inner().format
    }

    pub fn v4l2_format(&self) -> u32 {
        self.inner().v4l2_format
    }

    /// CPU address; 0 while a handle-backed buffer is unlocked
    pub fn data(&self) -> usize {
        self.inner().data
    }

    pub fn stream(&self) -> Option<StreamId> {
        self.inner().stream
    }

    pub fn set_stream(&self, stream: StreamId) {
        self.inner().stream = Some(stream);
    }

    pub fn request_id(&self) -> Option<u32> {
        self.inner().request_id
    }

    pub fn set_request_id(&self, request_id: Option<u32>) {
        self.inner().request_id = request_id;
    }

    /// Capture timestamp in microseconds
    pub fn timestamp(&self) -> i64 {
        self.inner().timestamp
    }

    pub fn sequence(&self) -> u32 {
        self.inner().sequence
    }

    pub fn set_capture_info(&self, timestamp: i64, sequence: u32) {
        let mut inner = self.inner();
        inner.timestamp = timestamp;
        inner.sequence = sequence;
    }

    /// Copy the frame out of a mapped buffer
    pub fn read_bytes(&self) -> HalResult<Vec<u8>> {
        let inner = self.inner();
        if !inner.locked || inner.data == 0 {
            return Err(HalError::InvalidOperation("buffer is not mapped".to_string()));
        }
        // SAFETY: data points to at least `size` mapped bytes while the buffer is locked
        let bytes = unsafe { std::slice::from_raw_parts(inner.data as *const u8, inner.size as usize) };
        Ok(bytes.to_vec())
    }

    /// Copy `bytes` into the start of a mapped buffer
    pub fn write_bytes(&self, bytes: &[u8]) -> HalResult<()> {
        let inner = self.inner();
        if !inner.locked || inner.data == 0 {
            return Err(HalError::InvalidOperation("buffer is not mapped".to_string()));
        }
        if bytes.len() > inner.size as usize {
            return Err(HalError::InvalidArgument(format!(
                "{} bytes into a {} byte buffer",
                bytes.len(),
                inner.size
            )));
        }
        // SAFETY: the destination holds `size` mapped bytes and the ranges cannot overlap
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), inner.data as *mut u8, bytes.len());
        }
        Ok(())
    }

    /// Slot description for [`VideoNode::set_buffer_pool`](crate::v4l2::VideoNode::set_buffer_pool)
    pub fn as_buffer_info(&self) -> V4l2BufferInfo {
        let inner = self.inner();
        V4l2BufferInfo::new(inner.data, inner.size, inner.width, inner.height, inner.v4l2_format)
    }
}

impl std::fmt::Debug for CameraBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner();
        f.debug_struct("CameraBuffer")
            .field("kind", &inner.backing.kind())
            .field("width", &inner.width)
            .field("height", &inner.height)
            .field("stride", &inner.stride)
            .field("locked", &inner.locked)
            .field("request_id", &inner.request_id)
            .field("sequence", &inner.sequence)
            .finish()
    }
}

impl Drop for CameraBuffer {
    fn drop(&mut self) {
        let inner = match self.inner.get_mut() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !inner.initialized {
            return;
        }
        match &inner.backing {
            Backing::Handle { handle, mapper } => {
                if let (true, Some(handle)) = (inner.locked, handle) {
                    if let Err(e) = mapper.unlock(*handle) {
                        warn!(handle = handle.0, error = %e, "Unlock on release failed");
                    }
                }
            }
            Backing::Graphics { handle, allocator } => {
                allocator.unlock(*handle);
                allocator.free(*handle);
            }
            Backing::Heap => {
                // SAFETY: data came from posix_memalign and is freed only here
                unsafe { libc::free(inner.data as *mut libc::c_void) };
            }
            Backing::Mapped { len } => {
                // SAFETY: data/len describe the live mapping created in `mmap`
                if unsafe { libc::munmap(inner.data as *mut libc::c_void, *len) } != 0 {
                    warn!(error = %std::io::Error::last_os_error(), "munmap failed");
                }
            }
        }
        inner.data = 0;
        inner.initialized = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::V4L2_PIX_FMT_NV12;

    #[test]
    fn heap_buffer_is_sized_from_stride() {
        let buf = CameraBuffer::heap(64, 48, 64, V4L2_PIX_FMT_NV12, StreamFormat::Ycbcr420).unwrap();
        assert_eq!(buf.kind(), BackingKind::Heap);
        assert_eq!(buf.size(), 64 * 48 * 3 / 2);
        assert!(buf.is_locked());
        assert_ne!(buf.data(), 0);
        assert_eq!(buf.data() % 4096, 0);
    }

    #[test]
    fn heap_lock_is_idempotent_and_unlock_warns_once_released() {
        let buf = CameraBuffer::heap(16, 16, 16, V4L2_PIX_FMT_NV12, StreamFormat::Ycbcr420).unwrap();
        assert!(buf.lock().is_ok());
        assert!(buf.lock().is_ok());
        assert!(buf.unlock().is_ok());
        assert_eq!(buf.unlock(), Err(HalError::NotLocked));
    }

    #[test]
    fn bytes_round_trip_through_heap_memory() {
        let buf = CameraBuffer::heap(8, 8, 8, V4L2_PIX_FMT_NV12, StreamFormat::Ycbcr420).unwrap();
        buf.write_bytes(&[1, 2, 3]).unwrap();
        let bytes = buf.read_bytes().unwrap();
        assert_eq!(&bytes[..3], &[1, 2, 3]);
        assert_eq!(bytes.len(), buf.size() as usize);
        assert!(buf.write_bytes(&vec![0; bytes.len() + 1]).is_err());
    }

    #[test]
    fn zero_sized_heap_allocation_fails() {
        assert!(CameraBuffer::heap(0, 0, 0, V4L2_PIX_FMT_NV12, StreamFormat::Ycbcr420).is_none());
    }

    #[test]
    fn buffer_info_carries_geometry() {
        let buf = CameraBuffer::heap(32, 16, 32, V4L2_PIX_FMT_NV12, StreamFormat::Ycbcr420).unwrap();
        let info = buf.as_buffer_info();
        assert_eq!((info.width, info.height, info.format), (32, 16, V4L2_PIX_FMT_NV12));
        assert_eq!(info.data, buf.data());
        assert!(!info.is_queued());
    }
}
