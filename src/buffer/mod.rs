// SPDX-License-Identifier: GPL-3.0-only

//! Frame buffers and their backing memory

pub mod camera_buffer;
pub mod fence;
pub mod item_pool;
pub mod memory;

pub use camera_buffer::{ACQUIRE_FENCE_TIMEOUT_MS, BackingKind, CameraBuffer, StreamBuffer, StreamId};
pub use fence::Fence;
pub use item_pool::ItemPool;
pub use memory::{
    BufferHandle, BufferMapper, GraphicAllocation, GraphicsAllocator, allocate_graphic_pool,
    allocate_heap_pool,
};

use std::sync::Arc;

/// A buffer in flight to a device slot
#[derive(Debug, Clone, Default)]
pub struct CaptureBuffer {
    pub buffer: Option<Arc<CameraBuffer>>,
    /// Device slot index
    pub index: u32,
    pub userptr: usize,
    pub length: u32,
}

impl CaptureBuffer {
    pub fn bind(&mut self, buffer: Arc<CameraBuffer>, index: u32) {
        self.userptr = buffer.data();
        self.length = buffer.size();
        self.index = index;
        self.buffer = Some(buffer);
    }

    /// Drop the buffer reference, keeping the item reusable
    pub fn reset(&mut self) -> Option<Arc<CameraBuffer>> {
        self.userptr = 0;
        self.length = 0;
        self.buffer.take()
    }
}
