// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Shared test doubles for the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use capturelib::{
    BufferHandle, BufferPool, CameraId, DeliveryOutcome, DeviceController, DeviceFormat,
    FrameCallback, FrameSpec, MetadataController, MetadataRecord, Node, NodeBase, NodeContext,
    PipelineError, PipelineGraph, Result, StaticDeviceManager, StreamId,
};
use parking_lot::Mutex;

/// Route library logs to the test harness. Filtered by `RUST_LOG`, warnings
/// and up by default.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Device controller that records every call made to it.
#[derive(Default)]
pub struct RecordingDevice {
    starts: Mutex<Vec<(u32, DeviceFormat)>>,
    stops: AtomicUsize,
    flushes: Mutex<Vec<StreamId>>,
    configures: Mutex<Vec<Arc<MetadataRecord>>>,
    queued: Mutex<Vec<FrameSpec>>,
    callback: Mutex<Option<FrameCallback>>,
    /// 1-based start call that fails.
    fail_start_on: Option<usize>,
}

impl RecordingDevice {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing_start_on(call: usize) -> Arc<Self> {
        Arc::new(Self {
            fail_start_on: Some(call),
            ..Self::default()
        })
    }

    pub fn starts(&self) -> Vec<(u32, DeviceFormat)> {
        self.starts.lock().clone()
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn flushes(&self) -> Vec<StreamId> {
        self.flushes.lock().clone()
    }

    pub fn configures(&self) -> Vec<Arc<MetadataRecord>> {
        self.configures.lock().clone()
    }

    pub fn queued(&self) -> usize {
        self.queued.lock().len()
    }

    /// Complete a frame as if the hardware had filled it.
    pub fn emit(&self, buffer: BufferHandle) -> bool {
        let callback = self.callback.lock().clone();
        match callback {
            Some(callback) => {
                callback(FrameSpec::new(Default::default(), buffer));
                true
            }
            None => false,
        }
    }
}

impl DeviceController for RecordingDevice {
    fn start(&self, buffer_count: u32, format: &DeviceFormat) -> Result<()> {
        let mut starts = self.starts.lock();
        if self.fail_start_on == Some(starts.len() + 1) {
            return Err(PipelineError::Device(format!(
                "start #{} refused",
                starts.len() + 1
            )));
        }
        starts.push((buffer_count, *format));
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn flush(&self, stream_id: StreamId) -> Result<()> {
        self.flushes.lock().push(stream_id);
        Ok(())
    }

    fn configure(&self, metadata: &Arc<MetadataRecord>) -> Result<()> {
        self.configures.lock().push(Arc::clone(metadata));
        Ok(())
    }

    fn send_frame_buffer(&self, frame: FrameSpec) -> Result<()> {
        self.queued.lock().push(frame);
        Ok(())
    }

    fn set_node_callback(&self, callback: FrameCallback) {
        *self.callback.lock() = Some(callback);
    }
}

/// Terminal node keeping every buffer it receives.
pub struct RecordingNode {
    base: NodeBase,
    received: Mutex<Vec<BufferHandle>>,
}

impl RecordingNode {
    pub fn new(name: &str, ctx: &NodeContext) -> Arc<Self> {
        Arc::new(Self {
            base: NodeBase::new(ctx.id, name, "recorder", ctx.camera_id.clone()),
            received: Mutex::new(Vec::new()),
        })
    }

    pub fn received(&self) -> Vec<BufferHandle> {
        self.received.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.received.lock().len()
    }
}

impl Node for RecordingNode {
    fn base(&self) -> &NodeBase {
        &self.base
    }

    fn route_buffer(&self, buffer: BufferHandle) -> DeliveryOutcome {
        self.received.lock().push(buffer);
        self.base.record(DeliveryOutcome::Consumed)
    }
}

/// An empty graph whose camera resolves to `device`.
pub fn graph_with_device(device: Arc<dyn DeviceController>) -> PipelineGraph {
    let devices = StaticDeviceManager::new().with_device(CameraId::default(), device);
    PipelineGraph::new(
        CameraId::default(),
        Arc::new(MetadataController::new()),
        Arc::new(devices),
    )
}

/// A single buffer for `stream`, filled with `fill`.
pub fn filled_buffer(stream: i32, size: usize, fill: u8) -> (BufferPool, BufferHandle) {
    let pool = BufferPool::new(StreamId(stream), 1, size).unwrap();
    let buffer = pool.acquire().unwrap();
    buffer
        .with_memory_mut(&mut |memory| memory.fill(fill))
        .unwrap();
    (pool, buffer)
}

pub fn contents(buffer: &BufferHandle) -> Vec<u8> {
    let mut out = Vec::new();
    buffer
        .with_memory(&mut |memory| out.extend_from_slice(memory))
        .unwrap();
    out
}
