// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Bridge between a capture device and the graph.
//!
//! On start the source resolves its device controller, starts the device once
//! per output port and, for every output stream that has a buffer pool, runs
//! a feeder thread that keeps the device supplied with empty frames. Frames
//! completed by the device re-enter the graph through [`Node::deliver_buffer`].
//!
//! The source also watches the metadata controller: records addressed to the
//! device-control stream are forwarded to the device's `configure`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::base::NodeBase;
use super::state::LifecycleOp;
use super::{Node, NodeContext, NodeSpec};
use crate::core::buffer::FrameSpec;
use crate::core::device::{DeviceController, DeviceManager, FrameCallback};
use crate::core::error::{PipelineError, Result};
use crate::core::metadata::{MetadataController, MetadataRecord, SubscriptionId};
use crate::core::pool::BufferPool;
use crate::core::types::StreamId;

/// What to do with already-started ports when a later port fails to start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartRollback {
    /// Leave the device running and report the failure.
    #[default]
    Keep,
    /// Stop the device before reporting the failure.
    StopStarted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Stream id whose metadata is treated as device configuration.
    pub control_stream_id: StreamId,
    pub start_rollback: StartRollback,
    /// Create a buffer pool for every output port that has none at start.
    pub allocate_buffer_pools: bool,
    /// How long a feeder waits for a free buffer before rechecking for stop.
    pub feed_timeout_ms: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            control_stream_id: StreamId::DEVICE_CONTROL,
            start_rollback: StartRollback::Keep,
            allocate_buffer_pools: false,
            feed_timeout_ms: 20,
        }
    }
}

struct Feeder {
    stream_id: StreamId,
    running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

pub struct SourceNode {
    base: NodeBase,
    weak_self: Weak<SourceNode>,
    config: SourceConfig,
    devices: Arc<dyn DeviceManager>,
    metadata: Arc<MetadataController>,
    subscription: SubscriptionId,
    device: Mutex<Option<Arc<dyn DeviceController>>>,
    pools: Mutex<Vec<BufferPool>>,
    feeders: Mutex<Vec<Feeder>>,
}

impl SourceNode {
    pub const TYPE_NAME: &'static str = "device_source";

    /// Create a source and subscribe it to `ctx.metadata`.
    pub fn new(spec: &NodeSpec, ctx: &NodeContext, config: SourceConfig) -> Arc<Self> {
        let camera_id = spec.camera_id.clone().unwrap_or_else(|| ctx.camera_id.clone());

        Arc::new_cyclic(|weak: &Weak<SourceNode>| {
            let listener = weak.clone();
            let subscription = ctx.metadata.add_node_callback(move |metadata| {
                if let Some(node) = listener.upgrade() {
                    node.on_metadata_changed(metadata);
                }
            });

            Self {
                base: NodeBase::new(ctx.id, spec.name.clone(), Self::TYPE_NAME, camera_id),
                weak_self: weak.clone(),
                config,
                devices: Arc::clone(&ctx.devices),
                metadata: Arc::clone(&ctx.metadata),
                subscription,
                device: Mutex::new(None),
                pools: Mutex::new(Vec::new()),
                feeders: Mutex::new(Vec::new()),
            }
        })
    }

    /// Registry factory.
    pub fn create(spec: &NodeSpec, ctx: &NodeContext) -> Result<Arc<dyn Node>> {
        let config: SourceConfig = spec.parse_config()?;
        Ok(Self::new(spec, ctx, config))
    }

    pub fn source_config(&self) -> &SourceConfig {
        &self.config
    }

    /// The device controller resolved by the last start, if any.
    pub fn device(&self) -> Option<Arc<dyn DeviceController>> {
        self.device.lock().clone()
    }

    /// Supply empty buffers for `pool.stream_id()` while running. Replaces any
    /// pool already attached for that stream; takes effect at the next start.
    pub fn attach_buffer_pool(&self, pool: BufferPool) {
        let mut pools = self.pools.lock();
        if let Some(existing) = pools.iter_mut().find(|p| p.stream_id() == pool.stream_id()) {
            tracing::debug!(
                "[{}] replacing buffer pool for stream {}",
                self.base.name(),
                pool.stream_id()
            );
            *existing = pool;
        } else {
            pools.push(pool);
        }
    }

    pub fn buffer_pools(&self) -> Vec<BufferPool> {
        self.pools.lock().clone()
    }

    /// Hand an empty frame to the device for the next capture.
    pub fn provide_buffers(&self, frame: FrameSpec) -> Result<()> {
        let device = self.device.lock().clone().ok_or_else(|| {
            PipelineError::DeviceUnavailable(format!(
                "source '{}' has no device controller",
                self.base.name()
            ))
        })?;
        device.send_frame_buffer(frame)
    }

    fn on_frame(&self, frame: FrameSpec) {
        tracing::trace!(
            "[{}] frame from device for stream {}",
            self.base.name(),
            frame.stream_id()
        );
        self.deliver_buffer(frame.buffer);
    }

    fn on_metadata_changed(&self, metadata: &Arc<MetadataRecord>) {
        let control = self.config.control_stream_id;
        match metadata.stream_id() {
            Some(stream) if stream == control => {
                if let Err(e) = Node::config(self, control, metadata) {
                    tracing::warn!("[{}] device configuration failed: {}", self.base.name(), e);
                }
            }
            Some(stream) => {
                tracing::trace!(
                    "[{}] ignoring metadata for stream {}",
                    self.base.name(),
                    stream
                );
            }
            None => {
                tracing::trace!("[{}] ignoring metadata without stream id", self.base.name());
            }
        }
    }

    fn resolve_device(&self) -> Result<Arc<dyn DeviceController>> {
        let device = self.devices.controller(self.base.camera_id())?;
        *self.device.lock() = Some(Arc::clone(&device));

        let weak = self.weak_self.clone();
        let callback: FrameCallback = Arc::new(move |frame: FrameSpec| {
            if let Some(node) = weak.upgrade() {
                node.on_frame(frame);
            }
        });
        device.set_node_callback(callback);
        Ok(device)
    }

    fn start_device(&self, device: &Arc<dyn DeviceController>) -> Result<()> {
        let ports = self.base.output_ports();
        if ports.is_empty() {
            tracing::warn!("[{}] no output ports, device not started", self.base.name());
            return Ok(());
        }

        for (started, port) in ports.iter().enumerate() {
            let format = port.format();
            if let Err(e) = device.start(format.buffer_count, &format.device_format()) {
                tracing::error!(
                    "[{}] device start failed for stream {} after {} started ports: {}",
                    self.base.name(),
                    format.stream_id,
                    started,
                    e
                );
                if started > 0 {
                    self.roll_back(device);
                }
                return Err(e);
            }
            tracing::debug!(
                "[{}] device started for stream {} ({}x{} {}, {} buffers)",
                self.base.name(),
                format.stream_id,
                format.width,
                format.height,
                format.pixel_format,
                format.buffer_count
            );
        }
        Ok(())
    }

    /// Undo a partially successful start when configured to.
    fn roll_back(&self, device: &Arc<dyn DeviceController>) {
        if self.config.start_rollback != StartRollback::StopStarted {
            return;
        }
        tracing::info!("[{}] rolling back partial start", self.base.name());
        self.stop_feeders();
        if let Err(e) = device.stop() {
            tracing::warn!("[{}] rollback stop failed: {}", self.base.name(), e);
        }
    }

    fn supply_buffers(&self) -> Result<()> {
        if self.config.allocate_buffer_pools {
            self.allocate_missing_pools()?;
        }
        self.spawn_feeders()
    }

    fn allocate_missing_pools(&self) -> Result<()> {
        let mut pools = self.pools.lock();
        for port in self.base.output_ports() {
            let format = port.format();
            if pools.iter().any(|p| p.stream_id() == format.stream_id) {
                continue;
            }
            let pool = BufferPool::new(
                format.stream_id,
                format.buffer_count as usize,
                format.frame_size(),
            )?;
            tracing::debug!(
                "[{}] allocated pool {} for stream {}",
                self.base.name(),
                pool.id(),
                format.stream_id
            );
            pools.push(pool);
        }
        Ok(())
    }

    fn spawn_feeders(&self) -> Result<()> {
        let pools = self.pools.lock().clone();
        let timeout = Duration::from_millis(self.config.feed_timeout_ms);
        let mut feeders = self.feeders.lock();

        for pool in pools {
            let stream_id = pool.stream_id();
            if self.base.output_port_for(stream_id).is_none() {
                tracing::debug!(
                    "[{}] pool for stream {} has no output port, not feeding",
                    self.base.name(),
                    stream_id
                );
                continue;
            }

            let running = Arc::new(AtomicBool::new(true));
            let flag = Arc::clone(&running);
            let weak = self.weak_self.clone();
            let name = self.base.name().to_string();

            let handle = thread::Builder::new()
                .name(format!("{}-feed-{}", name, stream_id))
                .spawn(move || {
                    while flag.load(Ordering::Acquire) {
                        let Some(frame) = pool.acquire_frame(timeout) else {
                            continue;
                        };
                        let Some(node) = weak.upgrade() else {
                            frame.release();
                            break;
                        };
                        if let Err(e) = node.provide_buffers(frame.clone()) {
                            tracing::warn!("[{}] device refused frame: {}", name, e);
                            frame.release();
                            thread::sleep(timeout);
                        }
                    }
                    tracing::debug!("[{}] feeder for stream {} exited", name, stream_id);
                })
                .map_err(PipelineError::Io)?;

            feeders.push(Feeder {
                stream_id,
                running,
                handle,
            });
        }
        Ok(())
    }

    fn stop_feeders(&self) {
        let feeders = std::mem::take(&mut *self.feeders.lock());
        for feeder in &feeders {
            feeder.running.store(false, Ordering::Release);
        }
        for feeder in feeders {
            // The last strong reference can be dropped on a feeder thread.
            if feeder.handle.thread().id() == thread::current().id() {
                continue;
            }
            if feeder.handle.join().is_err() {
                tracing::error!(
                    "[{}] feeder for stream {} panicked",
                    self.base.name(),
                    feeder.stream_id
                );
            }
        }
    }
}

impl Node for SourceNode {
    fn base(&self) -> &NodeBase {
        &self.base
    }

    fn start(&self, stream_id: StreamId) -> Result<()> {
        self.base.run_lifecycle(LifecycleOp::Start, stream_id, || {
            // Re-resolved on every start; the device may have been replaced.
            let device = self.resolve_device()?;
            self.start_device(&device)?;

            if let Err(e) = self.supply_buffers() {
                tracing::error!(
                    "[{}] buffer supply failed after device start: {}",
                    self.base.name(),
                    e
                );
                if !self.base.output_ports().is_empty() {
                    self.roll_back(&device);
                }
                return Err(e);
            }
            Ok(())
        })
    }

    fn stop(&self, stream_id: StreamId) -> Result<()> {
        self.base.run_lifecycle(LifecycleOp::Stop, stream_id, || {
            self.stop_feeders();
            let device = self.device.lock().clone();
            match device {
                Some(device) => device.stop(),
                None => {
                    tracing::debug!("[{}] no device to stop", self.base.name());
                    Ok(())
                }
            }
        })
    }

    fn flush(&self, stream_id: StreamId) -> Result<()> {
        self.base.run_lifecycle(LifecycleOp::Flush, stream_id, || {
            match self.device.lock().clone() {
                Some(device) => device.flush(stream_id),
                None => Ok(()),
            }
        })
    }

    fn config(&self, stream_id: StreamId, metadata: &Arc<MetadataRecord>) -> Result<()> {
        self.base.run_lifecycle(LifecycleOp::Config, stream_id, || {
            let device = match self.device.lock().clone() {
                Some(device) => device,
                None => self.devices.controller(self.base.camera_id())?,
            };
            device.configure(metadata)
        })
    }
}

impl Drop for SourceNode {
    fn drop(&mut self) {
        self.metadata.remove_node_callback(self.subscription);
        self.stop_feeders();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::device::{StaticDeviceManager, VirtualCamera, VirtualCameraConfig};
    use crate::core::ports::PortDirection;
    use crate::core::types::{CameraId, NodeId, PortFormat};

    fn context(devices: Arc<dyn DeviceManager>) -> NodeContext {
        NodeContext::new(
            NodeId(0),
            CameraId::default(),
            Arc::new(MetadataController::new()),
            devices,
        )
    }

    #[test]
    fn test_source_unsubscribes_on_drop() {
        let ctx = context(Arc::new(StaticDeviceManager::new()));
        let source = SourceNode::new(&NodeSpec::new("src", "device_source"), &ctx, SourceConfig::default());
        assert_eq!(ctx.metadata.subscriber_count(), 1);
        drop(source);
        assert_eq!(ctx.metadata.subscriber_count(), 0);
    }

    #[test]
    fn test_start_without_device_fails_and_stays_initialized() {
        let ctx = context(Arc::new(StaticDeviceManager::new()));
        let source = SourceNode::new(&NodeSpec::new("src", "device_source"), &ctx, SourceConfig::default());
        source
            .base()
            .add_port(PortDirection::Output, PortFormat::new(StreamId(1), 8, 8, 2))
            .unwrap();

        source.init(StreamId(1)).unwrap();
        let err = source.start(StreamId(1)).unwrap_err();
        assert!(matches!(err, PipelineError::DeviceUnavailable(_)));
        assert_eq!(source.state(), crate::core::node::NodeState::Initialized);

        // Stop after a failed start is harmless.
        source.stop(StreamId(1)).unwrap();
    }

    #[test]
    fn test_allocated_pools_follow_port_formats() {
        let camera = Arc::new(VirtualCamera::new(VirtualCameraConfig {
            frame_interval_ms: 0,
            fill_pattern: false,
        }));
        let devices = StaticDeviceManager::new().with_device(CameraId::default(), camera.clone());
        let ctx = context(Arc::new(devices));
        let config = SourceConfig {
            allocate_buffer_pools: true,
            ..SourceConfig::default()
        };
        let source = SourceNode::new(&NodeSpec::new("src", "device_source"), &ctx, config);
        source
            .base()
            .add_port(PortDirection::Output, PortFormat::new(StreamId(3), 4, 2, 3))
            .unwrap();

        source.init(StreamId(3)).unwrap();
        source.start(StreamId(3)).unwrap();
        let pools = source.buffer_pools();
        source.stop(StreamId(3)).unwrap();

        assert_eq!(pools.len(), 1);
        assert_eq!(pools[0].capacity(), 3);
        assert_eq!(pools[0].buffer_size(), 12);
        assert_eq!(camera.start_requests()[0].0, 3);
    }
}
