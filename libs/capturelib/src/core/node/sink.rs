// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Terminal node. Counts what arrives and either hands buffers to an external
//! consumer or returns them to their pool.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::base::{DeliveryOutcome, NodeBase};
use super::{Node, NodeContext, NodeSpec};
use crate::core::buffer::BufferHandle;
use crate::core::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    /// Log every received buffer at debug level.
    pub log_buffers: bool,
}

pub struct SinkNode {
    base: NodeBase,
    config: SinkConfig,
    consumer: Mutex<Option<Sender<BufferHandle>>>,
    buffers: AtomicU64,
    bytes: AtomicU64,
}

impl SinkNode {
    pub const TYPE_NAME: &'static str = "sink";

    pub fn new(spec: &NodeSpec, ctx: &NodeContext, config: SinkConfig) -> Arc<Self> {
        let camera_id = spec.camera_id.clone().unwrap_or_else(|| ctx.camera_id.clone());
        Arc::new(Self {
            base: NodeBase::new(ctx.id, spec.name.clone(), Self::TYPE_NAME, camera_id),
            config,
            consumer: Mutex::new(None),
            buffers: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
        })
    }

    pub fn create(spec: &NodeSpec, ctx: &NodeContext) -> Result<Arc<dyn Node>> {
        let config: SinkConfig = spec.parse_config()?;
        Ok(Self::new(spec, ctx, config))
    }

    /// Forward received buffers to the returned receiver instead of releasing
    /// them. The receiver becomes responsible for releasing.
    pub fn subscribe(&self) -> Receiver<BufferHandle> {
        let (tx, rx) = crossbeam_channel::unbounded();
        *self.consumer.lock() = Some(tx);
        rx
    }

    pub fn buffers_received(&self) -> u64 {
        self.buffers.load(Ordering::Relaxed)
    }

    /// Sum of valid frame sizes received.
    pub fn bytes_received(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }
}

impl Node for SinkNode {
    fn base(&self) -> &NodeBase {
        &self.base
    }

    fn route_buffer(&self, buffer: BufferHandle) -> DeliveryOutcome {
        if !buffer.is_valid() {
            tracing::error!("[{}] invalid buffer, dropping", self.base.name());
            return self.base.record(DeliveryOutcome::Rejected);
        }

        let stream_id = buffer.stream_id();
        let accepted = self
            .base
            .input_ports()
            .iter()
            .any(|port| port.accepts(stream_id));
        if !accepted {
            tracing::debug!(
                "[{}] no input port for stream {}, dropping buffer",
                self.base.name(),
                stream_id
            );
            return self.base.record(DeliveryOutcome::Unmatched);
        }

        let valid = buffer.valid_frame_size();
        self.buffers.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(valid as u64, Ordering::Relaxed);
        if self.config.log_buffers {
            tracing::debug!(
                "[{}] received {} bytes on stream {}",
                self.base.name(),
                valid,
                stream_id
            );
        }

        let consumer = self.consumer.lock().clone();
        match consumer {
            Some(tx) => {
                if let Err(returned) = tx.send(buffer) {
                    tracing::debug!("[{}] consumer gone, releasing buffer", self.base.name());
                    *self.consumer.lock() = None;
                    returned.into_inner().release();
                }
            }
            None => buffer.release(),
        }
        self.base.record(DeliveryOutcome::Consumed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::device::StaticDeviceManager;
    use crate::core::metadata::MetadataController;
    use crate::core::pool::BufferPool;
    use crate::core::ports::PortDirection;
    use crate::core::types::{CameraId, NodeId, PortFormat, StreamId};

    fn sink() -> Arc<SinkNode> {
        let ctx = NodeContext::new(
            NodeId(2),
            CameraId::default(),
            Arc::new(MetadataController::new()),
            Arc::new(StaticDeviceManager::new()),
        );
        let sink = SinkNode::new(&NodeSpec::new("out", SinkNode::TYPE_NAME), &ctx, SinkConfig::default());
        sink.base()
            .add_port(PortDirection::Input, PortFormat::new(StreamId(1), 4, 4, 2))
            .unwrap();
        sink
    }

    #[test]
    fn test_sink_releases_to_pool() {
        let sink = sink();
        let pool = BufferPool::new(StreamId(1), 1, 24).unwrap();
        let buffer = pool.acquire().unwrap();
        buffer.set_valid_frame_size(20).unwrap();

        assert_eq!(sink.route_buffer(buffer), DeliveryOutcome::Consumed);
        assert_eq!(pool.available(), 1);
        assert_eq!(sink.buffers_received(), 1);
        assert_eq!(sink.bytes_received(), 20);
    }

    #[test]
    fn test_sink_forwards_to_subscriber() {
        let sink = sink();
        let rx = sink.subscribe();
        let pool = BufferPool::new(StreamId(1), 1, 24).unwrap();

        sink.deliver_buffer(pool.acquire().unwrap());
        let received = rx.try_recv().unwrap();
        assert_eq!(pool.available(), 0);

        received.release();
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_sink_releases_when_subscriber_dropped() {
        let sink = sink();
        drop(sink.subscribe());
        let pool = BufferPool::new(StreamId(1), 1, 24).unwrap();

        sink.deliver_buffer(pool.acquire().unwrap());
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_sink_drops_unknown_stream() {
        let sink = sink();
        let pool = BufferPool::new(StreamId(7), 1, 24).unwrap();
        assert_eq!(
            sink.route_buffer(pool.acquire().unwrap()),
            DeliveryOutcome::Unmatched
        );
        assert_eq!(sink.buffers_received(), 0);
    }
}
