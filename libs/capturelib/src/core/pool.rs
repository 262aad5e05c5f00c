// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Fixed-size buffer pool.
//!
//! Each pool serves exactly one stream. Buffers are allocated once at pool
//! creation with a fixed capacity and are recycled through a bounded channel:
//! `acquire` takes a free buffer, [`FrameBuffer::release`] puts it back.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::buffer::{BufferHandle, FrameBuffer, FrameSpec};
use super::error::{PipelineError, Result};
use super::types::StreamId;

/// Unique identifier for a buffer pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BufferPoolId(uuid::Uuid);

impl BufferPoolId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for BufferPoolId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BufferPoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct PoolInner {
    id: BufferPoolId,
    stream_id: StreamId,
    buffer_size: usize,
    capacity: usize,
    free_tx: Sender<Arc<PoolBuffer>>,
    free_rx: Receiver<Arc<PoolBuffer>>,
}

/// Pool of equally sized buffers bound to one stream.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    /// Allocate `count` buffers of `buffer_size` bytes for `stream_id`.
    pub fn new(stream_id: StreamId, count: usize, buffer_size: usize) -> Result<Self> {
        if count == 0 || buffer_size == 0 {
            return Err(PipelineError::Configuration(format!(
                "buffer pool for stream {} needs a non-zero count and size (got {} x {})",
                stream_id, count, buffer_size
            )));
        }

        let (free_tx, free_rx) = crossbeam_channel::bounded(count);
        let inner = Arc::new(PoolInner {
            id: BufferPoolId::new(),
            stream_id,
            buffer_size,
            capacity: count,
            free_tx,
            free_rx,
        });

        for index in 0..count {
            let buffer = Arc::new(PoolBuffer {
                index,
                stream_id,
                capacity: buffer_size,
                memory: Mutex::new(vec![0u8; buffer_size].into_boxed_slice()),
                valid_frame_size: AtomicUsize::new(0),
                in_pool: AtomicBool::new(true),
                pool: Arc::downgrade(&inner),
            });
            inner
                .free_tx
                .send(buffer)
                .map_err(|_| PipelineError::Configuration("buffer pool channel closed".into()))?;
        }

        tracing::debug!(
            "[pool {}] allocated {} buffers of {} bytes for stream {}",
            inner.id,
            count,
            buffer_size,
            stream_id
        );

        Ok(Self { inner })
    }

    pub fn id(&self) -> BufferPoolId {
        self.inner.id
    }

    pub fn stream_id(&self) -> StreamId {
        self.inner.stream_id
    }

    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Number of buffers currently free.
    pub fn available(&self) -> usize {
        self.inner.free_rx.len()
    }

    /// Take a free buffer without waiting.
    pub fn acquire(&self) -> Option<BufferHandle> {
        self.inner.free_rx.try_recv().ok().map(checkout)
    }

    /// Take a free buffer, waiting up to `timeout` for one to be released.
    pub fn acquire_timeout(&self, timeout: Duration) -> Option<BufferHandle> {
        self.inner.free_rx.recv_timeout(timeout).ok().map(checkout)
    }

    /// Take a free buffer wrapped as a device frame.
    pub fn acquire_frame(&self, timeout: Duration) -> Option<FrameSpec> {
        self.acquire_timeout(timeout)
            .map(|buffer| FrameSpec::new(self.inner.id, buffer))
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("id", &self.inner.id)
            .field("stream_id", &self.inner.stream_id)
            .field("buffer_size", &self.inner.buffer_size)
            .field("capacity", &self.inner.capacity)
            .field("available", &self.available())
            .finish()
    }
}

fn checkout(buffer: Arc<PoolBuffer>) -> BufferHandle {
    buffer.in_pool.store(false, Ordering::Release);
    buffer
}

/// A buffer whose memory is owned by a [`BufferPool`].
pub struct PoolBuffer {
    index: usize,
    stream_id: StreamId,
    capacity: usize,
    memory: Mutex<Box<[u8]>>,
    valid_frame_size: AtomicUsize,
    in_pool: AtomicBool,
    pool: Weak<PoolInner>,
}

impl PoolBuffer {
    pub fn index(&self) -> usize {
        self.index
    }
}

impl fmt::Debug for PoolBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolBuffer")
            .field("index", &self.index)
            .field("stream_id", &self.stream_id)
            .field("size", &self.size())
            .field("valid_frame_size", &self.valid_frame_size())
            .finish()
    }
}

impl FrameBuffer for PoolBuffer {
    fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    fn size(&self) -> usize {
        self.capacity
    }

    fn valid_frame_size(&self) -> usize {
        self.valid_frame_size.load(Ordering::Acquire)
    }

    fn set_valid_frame_size(&self, len: usize) -> Result<()> {
        let capacity = self.size();
        if len > capacity {
            return Err(PipelineError::BufferTooSmall {
                needed: len,
                capacity,
            });
        }
        self.valid_frame_size.store(len, Ordering::Release);
        Ok(())
    }

    fn with_memory_mut(&self, f: &mut dyn FnMut(&mut [u8])) -> Result<()> {
        let mut memory = self.memory.lock();
        f(&mut memory);
        Ok(())
    }

    fn with_memory(&self, f: &mut dyn FnMut(&[u8])) -> Result<()> {
        let memory = self.memory.lock();
        f(&memory);
        Ok(())
    }

    fn release(self: Arc<Self>) {
        if self.in_pool.swap(true, Ordering::AcqRel) {
            tracing::warn!(
                "[pool] buffer {} of stream {} released twice, ignoring",
                self.index,
                self.stream_id
            );
            return;
        }
        self.valid_frame_size.store(0, Ordering::Release);

        let Some(pool) = self.pool.upgrade() else {
            tracing::trace!("[pool] pool gone, dropping buffer {}", self.index);
            return;
        };
        if pool.free_tx.try_send(Arc::clone(&self)).is_err() {
            tracing::error!(
                "[pool {}] free list full while releasing buffer {}",
                pool.id,
                self.index
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_until_empty_then_release() {
        let pool = BufferPool::new(StreamId(1), 2, 64).unwrap();
        let a = pool.acquire().unwrap();
        let _b = pool.acquire().unwrap();
        assert!(pool.acquire().is_none());
        assert_eq!(pool.available(), 0);

        a.release();
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_release_resets_valid_frame_size() {
        let pool = BufferPool::new(StreamId(3), 1, 32).unwrap();
        let buffer = pool.acquire().unwrap();
        buffer.set_valid_frame_size(10).unwrap();
        buffer.release();

        let again = pool.acquire().unwrap();
        assert_eq!(again.valid_frame_size(), 0);
        assert_eq!(again.stream_id(), StreamId(3));
    }

    #[test]
    fn test_double_release_is_ignored() {
        let pool = BufferPool::new(StreamId(1), 1, 8).unwrap();
        let buffer = pool.acquire().unwrap();
        Arc::clone(&buffer).release();
        buffer.release();
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_valid_frame_size_bounded_by_capacity() {
        let pool = BufferPool::new(StreamId(1), 1, 8).unwrap();
        let buffer = pool.acquire().unwrap();
        assert!(matches!(
            buffer.set_valid_frame_size(9),
            Err(PipelineError::BufferTooSmall { needed: 9, capacity: 8 })
        ));
    }

    #[test]
    fn test_zero_sized_pool_rejected() {
        assert!(BufferPool::new(StreamId(1), 0, 8).is_err());
        assert!(BufferPool::new(StreamId(1), 1, 0).is_err());
    }

    #[test]
    fn test_pool_id_serializes_as_uuid_string() {
        let id = BufferPoolId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id));
        assert_eq!(serde_json::from_str::<BufferPoolId>(&json).unwrap(), id);
    }
}
