// SPDX-License-Identifier: GPL-3.0-only

//! Allocator and mapper seams, plus batch buffer builders
//!
//! The graphics allocator and the framework buffer mapper live outside the
//! HAL; they are reached through [`GraphicsAllocator`] and [`BufferMapper`].
//! Pool builders allocate a whole batch or nothing: on the first failure the
//! buffers already allocated are dropped before the error is returned.

use super::camera_buffer::CameraBuffer;
use crate::constants::StreamFormat;
use crate::errors::{HalError, HalResult};
use std::sync::Arc;
use tracing::{debug, error};

/// Opaque framework buffer handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub u64);

/// Usage bits handed to the mapper/allocator
pub const USAGE_SW_READ_OFTEN: u32 = 0x0000_0003;
pub const USAGE_SW_WRITE_OFTEN: u32 = 0x0000_0030;
pub const USAGE_CAMERA: u32 = USAGE_SW_READ_OFTEN | USAGE_SW_WRITE_OFTEN;

/// Maps framework-owned buffers into the HAL's address space
pub trait BufferMapper: Send + Sync {
    /// Lock `width` x `height` of the buffer for CPU access, returning its address
    fn lock(&self, handle: BufferHandle, usage: u32, width: u32, height: u32) -> HalResult<usize>;
    fn unlock(&self, handle: BufferHandle) -> HalResult<()>;
}

/// A freshly allocated, CPU-mapped graphics buffer
#[derive(Debug, Clone, Copy)]
pub struct GraphicAllocation {
    pub handle: BufferHandle,
    /// Row stride in pixels chosen by the allocator
    pub stride: u32,
    pub data: usize,
}

/// Allocates graphics buffers on behalf of the HAL
pub trait GraphicsAllocator: Send + Sync {
    fn allocate(&self, width: u32, height: u32, v4l2_format: u32, usage: u32) -> Option<GraphicAllocation>;
    fn unlock(&self, handle: BufferHandle);
    /// Drop the HAL's reference to the buffer
    fn free(&self, handle: BufferHandle);
}

/// Allocate `count` heap buffers of identical geometry
pub fn allocate_heap_pool(
    count: usize,
    width: u32,
    height: u32,
    stride: u32,
    v4l2_format: u32,
) -> HalResult<Vec<Arc<CameraBuffer>>> {
    let mut buffers = Vec::with_capacity(count);
    for index in 0..count {
        match CameraBuffer::heap(width, height, stride, v4l2_format, StreamFormat::Ycbcr420) {
            Some(buffer) => buffers.push(buffer),
            None => {
                error!(index, count, width, height, "Heap buffer allocation failed");
                // `buffers` drops here, releasing what was allocated so far
                return Err(HalError::OutOfMemory(format!(
                    "heap buffer {} of {} ({}x{})",
                    index, count, width, height
                )));
            }
        }
    }
    debug!(count, width, height, "Allocated heap buffer pool");
    Ok(buffers)
}

/// Allocate `count` graphics buffers of identical geometry
pub fn allocate_graphic_pool(
    allocator: &Arc<dyn GraphicsAllocator>,
    count: usize,
    width: u32,
    height: u32,
    v4l2_format: u32,
) -> HalResult<Vec<Arc<CameraBuffer>>> {
    let mut buffers = Vec::with_capacity(count);
    for index in 0..count {
        match CameraBuffer::graphic(allocator.clone(), width, height, v4l2_format) {
            Some(buffer) => buffers.push(buffer),
            None => {
                error!(index, count, width, height, "Graphics buffer allocation failed");
                return Err(HalError::OutOfMemory(format!(
                    "graphics buffer {} of {} ({}x{})",
                    index, count, width, height
                )));
            }
        }
    }
    debug!(count, width, height, "Allocated graphics buffer pool");
    Ok(buffers)
}
