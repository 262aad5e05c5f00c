// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Buffer handles passed through the graph.
//!
//! A buffer's backing memory belongs to whatever allocated it (normally a
//! [`BufferPool`](crate::core::pool::BufferPool)). Nodes only ever borrow the
//! memory for the duration of a closure, and only ever write within the
//! fixed capacity reported by [`FrameBuffer::size`].

use std::fmt;
use std::sync::Arc;

use super::error::Result;
use super::pool::BufferPoolId;
use super::types::StreamId;

/// Contract every buffer implementation provides to the pipeline.
pub trait FrameBuffer: Send + Sync + fmt::Debug {
    /// Stream this buffer belongs to. Fixed for the buffer's lifetime.
    fn stream_id(&self) -> StreamId;

    /// Backing capacity in bytes.
    fn size(&self) -> usize;

    /// Number of meaningful bytes at the start of the backing memory.
    fn valid_frame_size(&self) -> usize;

    /// Record how many bytes are meaningful. Fails if `len` exceeds [`size`](Self::size).
    fn set_valid_frame_size(&self, len: usize) -> Result<()>;

    /// Run `f` with exclusive access to the backing memory.
    fn with_memory_mut(&self, f: &mut dyn FnMut(&mut [u8])) -> Result<()>;

    /// Run `f` with shared access to the backing memory.
    fn with_memory(&self, f: &mut dyn FnMut(&[u8])) -> Result<()>;

    /// Hand the buffer back to whoever owns its memory.
    fn release(self: Arc<Self>) {}

    /// A buffer with no backing memory or a negative stream id is never routed.
    fn is_valid(&self) -> bool {
        self.size() > 0 && self.stream_id().get() >= 0
    }
}

/// Shared handle to a buffer travelling through the graph.
pub type BufferHandle = Arc<dyn FrameBuffer>;

/// A buffer-pool-described frame exchanged with a device controller.
#[derive(Debug, Clone)]
pub struct FrameSpec {
    pub buffer_pool_id: BufferPoolId,
    pub buffer: BufferHandle,
}

impl FrameSpec {
    pub fn new(buffer_pool_id: BufferPoolId, buffer: BufferHandle) -> Self {
        Self {
            buffer_pool_id,
            buffer,
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.buffer.stream_id()
    }

    /// Return the frame's buffer to its pool.
    pub fn release(self) {
        self.buffer.release();
    }
}
