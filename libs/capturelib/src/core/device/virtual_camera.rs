// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Software capture device.
//!
//! Frames queued with `send_frame_buffer` are filled by a dedicated capture
//! thread, in the order they were queued, and handed to the node callback.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use super::{DeviceController, FrameCallback};
use crate::core::buffer::FrameSpec;
use crate::core::error::{PipelineError, Result};
use crate::core::metadata::MetadataRecord;
use crate::core::types::{DeviceFormat, StreamId};

const QUEUE_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VirtualCameraConfig {
    /// Pause after each produced frame, in milliseconds.
    pub frame_interval_ms: u64,
    /// Fill frames with a per-frame byte pattern instead of leaving them as is.
    pub fill_pattern: bool,
}

impl Default for VirtualCameraConfig {
    fn default() -> Self {
        Self {
            frame_interval_ms: 33,
            fill_pattern: true,
        }
    }
}

impl VirtualCameraConfig {
    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }
}

/// A [`DeviceController`] that produces frames in software.
pub struct VirtualCamera {
    config: VirtualCameraConfig,
    queue_tx: Sender<FrameSpec>,
    queue_rx: Receiver<FrameSpec>,
    callback: Arc<RwLock<Option<FrameCallback>>>,
    running: Arc<AtomicBool>,
    frames_produced: Arc<AtomicU64>,
    thread_handle: Mutex<Option<JoinHandle<()>>>,
    start_requests: Mutex<Vec<(u32, DeviceFormat)>>,
    last_configuration: Mutex<Option<Arc<MetadataRecord>>>,
    configure_count: AtomicU64,
}

impl VirtualCamera {
    pub fn new(config: VirtualCameraConfig) -> Self {
        let (queue_tx, queue_rx) = crossbeam_channel::unbounded();
        Self {
            config,
            queue_tx,
            queue_rx,
            callback: Arc::new(RwLock::new(None)),
            running: Arc::new(AtomicBool::new(false)),
            frames_produced: Arc::new(AtomicU64::new(0)),
            thread_handle: Mutex::new(None),
            start_requests: Mutex::new(Vec::new()),
            last_configuration: Mutex::new(None),
            configure_count: AtomicU64::new(0),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn frames_produced(&self) -> u64 {
        self.frames_produced.load(Ordering::SeqCst)
    }

    /// Frames queued and not yet produced.
    pub fn queued(&self) -> usize {
        self.queue_rx.len()
    }

    /// Every `(buffer_count, format)` pair passed to `start`, in call order.
    pub fn start_requests(&self) -> Vec<(u32, DeviceFormat)> {
        self.start_requests.lock().clone()
    }

    pub fn last_configuration(&self) -> Option<Arc<MetadataRecord>> {
        self.last_configuration.lock().clone()
    }

    pub fn configure_count(&self) -> u64 {
        self.configure_count.load(Ordering::SeqCst)
    }

    fn spawn_capture_thread(&self) -> Result<JoinHandle<()>> {
        let queue = self.queue_rx.clone();
        let callback = Arc::clone(&self.callback);
        let running = Arc::clone(&self.running);
        let produced = Arc::clone(&self.frames_produced);
        let config = self.config;

        thread::Builder::new()
            .name("virtual-camera".to_string())
            .spawn(move || {
                tracing::info!(
                    "[VirtualCamera] capture thread started, {:?} frame interval",
                    config.frame_interval()
                );

                while running.load(Ordering::SeqCst) {
                    let frame = match queue.recv_timeout(QUEUE_POLL) {
                        Ok(frame) => frame,
                        Err(RecvTimeoutError::Timeout) => continue,
                        Err(RecvTimeoutError::Disconnected) => break,
                    };

                    let sequence = produced.fetch_add(1, Ordering::SeqCst);
                    if let Err(e) = fill_frame(&frame, sequence, config.fill_pattern) {
                        tracing::error!("[VirtualCamera] failed to fill frame: {}", e);
                        frame.release();
                        continue;
                    }

                    let current = callback.read().clone();
                    match current {
                        Some(deliver) => deliver(frame),
                        None => {
                            tracing::warn!(
                                "[VirtualCamera] no node callback, returning frame for stream {}",
                                frame.stream_id()
                            );
                            frame.release();
                        }
                    }

                    if config.frame_interval_ms > 0 {
                        thread::sleep(config.frame_interval());
                    }
                }

                tracing::info!("[VirtualCamera] capture thread stopped");
            })
            .map_err(PipelineError::Io)
    }
}

fn fill_frame(frame: &FrameSpec, sequence: u64, fill_pattern: bool) -> Result<()> {
    let buffer = &frame.buffer;
    if fill_pattern {
        let seed = sequence as u8;
        buffer.with_memory_mut(&mut |memory| {
            for (i, byte) in memory.iter_mut().enumerate() {
                *byte = seed.wrapping_add(i as u8);
            }
        })?;
    }
    buffer.set_valid_frame_size(buffer.size())
}

impl Default for VirtualCamera {
    fn default() -> Self {
        Self::new(VirtualCameraConfig::default())
    }
}

impl DeviceController for VirtualCamera {
    fn start(&self, buffer_count: u32, format: &DeviceFormat) -> Result<()> {
        self.start_requests.lock().push((buffer_count, *format));

        if self.running.swap(true, Ordering::SeqCst) {
            tracing::debug!(
                "[VirtualCamera] already capturing, added {}x{} {} x{}",
                format.width,
                format.height,
                format.pixel_format,
                buffer_count
            );
            return Ok(());
        }

        match self.spawn_capture_thread() {
            Ok(handle) => {
                *self.thread_handle.lock() = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    fn stop(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);

        let handle = self.thread_handle.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                tracing::warn!("[VirtualCamera] stop called from capture thread, not joining");
                return Ok(());
            }
            handle
                .join()
                .map_err(|_| PipelineError::Device("virtual camera thread panicked".into()))?;
        }
        Ok(())
    }

    fn flush(&self, stream_id: StreamId) -> Result<()> {
        let mut returned = 0usize;
        let mut kept = Vec::new();
        while let Ok(frame) = self.queue_rx.try_recv() {
            if frame.stream_id() == stream_id {
                frame.release();
                returned += 1;
            } else {
                kept.push(frame);
            }
        }
        for frame in kept {
            self.queue_tx
                .send(frame)
                .map_err(|_| PipelineError::Device("virtual camera queue closed".into()))?;
        }
        tracing::debug!(
            "[VirtualCamera] flushed {} queued frames for stream {}",
            returned,
            stream_id
        );
        Ok(())
    }

    fn configure(&self, metadata: &Arc<MetadataRecord>) -> Result<()> {
        tracing::debug!(
            "[VirtualCamera] configure with {} entries",
            metadata.len()
        );
        *self.last_configuration.lock() = Some(Arc::clone(metadata));
        self.configure_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn send_frame_buffer(&self, frame: FrameSpec) -> Result<()> {
        if !frame.buffer.is_valid() {
            return Err(PipelineError::InvalidBuffer(format!(
                "frame for stream {} has no backing memory",
                frame.stream_id()
            )));
        }
        self.queue_tx
            .send(frame)
            .map_err(|_| PipelineError::Device("virtual camera queue closed".into()))
    }

    fn set_node_callback(&self, callback: FrameCallback) {
        *self.callback.write() = Some(callback);
    }
}

impl Drop for VirtualCamera {
    fn drop(&mut self) {
        if let Err(e) = DeviceController::stop(self) {
            tracing::warn!("[VirtualCamera] stop on drop failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::pool::BufferPool;
    use crate::core::types::PixelFormat;
    use std::time::Instant;

    fn format() -> DeviceFormat {
        DeviceFormat {
            width: 4,
            height: 4,
            pixel_format: PixelFormat::Nv12,
        }
    }

    fn camera() -> VirtualCamera {
        VirtualCamera::new(VirtualCameraConfig {
            frame_interval_ms: 0,
            fill_pattern: true,
        })
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        cond()
    }

    #[test]
    fn test_frames_delivered_in_queue_order() {
        let camera = camera();
        let pool = BufferPool::new(StreamId(1), 3, 16).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        camera.set_node_callback(Arc::new(move |frame: FrameSpec| {
            s.lock().push(Arc::as_ptr(&frame.buffer) as *const () as usize);
            frame.release();
        }));

        let mut expected = Vec::new();
        for _ in 0..3 {
            let frame = pool.acquire_frame(Duration::ZERO).unwrap();
            expected.push(Arc::as_ptr(&frame.buffer) as *const () as usize);
            camera.send_frame_buffer(frame).unwrap();
        }

        camera.start(3, &format()).unwrap();
        assert!(wait_for(|| seen.lock().len() == 3));
        camera.stop().unwrap();

        assert_eq!(*seen.lock(), expected);
        assert_eq!(pool.available(), 3);
    }

    #[test]
    fn test_produced_frame_is_filled() {
        let camera = camera();
        let pool = BufferPool::new(StreamId(2), 1, 8).unwrap();
        let valid = Arc::new(Mutex::new(None));
        let v = Arc::clone(&valid);
        camera.set_node_callback(Arc::new(move |frame: FrameSpec| {
            *v.lock() = Some(frame.buffer.valid_frame_size());
        }));

        camera.send_frame_buffer(pool.acquire_frame(Duration::ZERO).unwrap()).unwrap();
        camera.start(1, &format()).unwrap();
        assert!(wait_for(|| valid.lock().is_some()));
        camera.stop().unwrap();

        assert_eq!(*valid.lock(), Some(8));
        assert_eq!(camera.frames_produced(), 1);
    }

    #[test]
    fn test_flush_returns_only_matching_stream() {
        let camera = camera();
        let a = BufferPool::new(StreamId(1), 2, 8).unwrap();
        let b = BufferPool::new(StreamId(2), 2, 8).unwrap();
        for pool in [&a, &b] {
            while let Some(frame) = pool.acquire_frame(Duration::ZERO) {
                camera.send_frame_buffer(frame).unwrap();
            }
        }

        camera.flush(StreamId(1)).unwrap();

        assert_eq!(a.available(), 2);
        assert_eq!(b.available(), 0);
        assert_eq!(camera.queued(), 2);
    }

    #[test]
    fn test_second_start_records_format_without_new_thread() {
        let camera = camera();
        camera.start(4, &format()).unwrap();
        camera.start(2, &format()).unwrap();
        assert_eq!(camera.start_requests().len(), 2);
        assert!(camera.is_running());

        camera.stop().unwrap();
        camera.stop().unwrap();
        assert!(!camera.is_running());
    }

    #[test]
    fn test_configure_keeps_latest_record() {
        let camera = camera();
        let first = Arc::new(MetadataRecord::for_stream(StreamId(0), 4, 32).unwrap());
        let second = Arc::new(MetadataRecord::for_stream(StreamId(0), 8, 64).unwrap());
        camera.configure(&first).unwrap();
        camera.configure(&second).unwrap();

        assert_eq!(camera.configure_count(), 2);
        assert_eq!(camera.last_configuration().unwrap().entry_capacity(), 8);
    }
}
