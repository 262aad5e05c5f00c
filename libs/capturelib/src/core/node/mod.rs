// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Pipeline nodes.
//!
//! Every node embeds a [`NodeBase`] and implements [`Node`]. The default
//! trait methods drive the shared lifecycle state machine with no
//! node-specific work, so a concrete node only overrides what it needs.

mod annotation;
mod base;
mod sink;
mod source;
mod state;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use annotation::{FaceAnnotationConfig, FaceAnnotationNode};
pub use base::{DeliveryOutcome, NodeBase, NodeStats};
pub use sink::{SinkConfig, SinkNode};
pub use source::{SourceConfig, SourceNode, StartRollback};
pub use state::{Admission, LifecycleOp, NodeState};

use super::buffer::BufferHandle;
use super::device::DeviceManager;
use super::error::Result;
use super::metadata::{MetadataController, MetadataRecord};
use super::types::{CameraId, NodeId, StreamId};

/// A pipeline stage.
///
/// All methods take `&self`: lifecycle calls arrive on the control thread
/// while buffers arrive concurrently on device callback threads.
pub trait Node: Send + Sync {
    fn base(&self) -> &NodeBase;

    fn id(&self) -> NodeId {
        self.base().id()
    }

    fn name(&self) -> &str {
        self.base().name()
    }

    fn state(&self) -> NodeState {
        self.base().state()
    }

    fn stats(&self) -> NodeStats {
        self.base().stats()
    }

    /// Prepare per-stream resources.
    fn init(&self, stream_id: StreamId) -> Result<()> {
        self.base().run_lifecycle(LifecycleOp::Init, stream_id, || Ok(()))
    }

    fn start(&self, stream_id: StreamId) -> Result<()> {
        self.base().run_lifecycle(LifecycleOp::Start, stream_id, || Ok(()))
    }

    /// Safe to call repeatedly and after a failed start.
    fn stop(&self, stream_id: StreamId) -> Result<()> {
        self.base().run_lifecycle(LifecycleOp::Stop, stream_id, || Ok(()))
    }

    fn flush(&self, stream_id: StreamId) -> Result<()> {
        self.base().run_lifecycle(LifecycleOp::Flush, stream_id, || Ok(()))
    }

    /// Apply a metadata-driven reconfiguration. Doing nothing is a valid outcome.
    fn config(&self, stream_id: StreamId, metadata: &Arc<MetadataRecord>) -> Result<()> {
        let _ = metadata;
        self.base().run_lifecycle(LifecycleOp::Config, stream_id, || Ok(()))
    }

    fn capture(&self, stream_id: StreamId, capture_id: i32) -> Result<()> {
        tracing::trace!(
            "[{}] capture {} on stream {}",
            self.name(),
            capture_id,
            stream_id
        );
        Ok(())
    }

    fn cancel_capture(&self, stream_id: StreamId) -> Result<()> {
        tracing::trace!("[{}] cancel capture on stream {}", self.name(), stream_id);
        Ok(())
    }

    /// Route one buffer and report what happened to it.
    fn route_buffer(&self, buffer: BufferHandle) -> DeliveryOutcome {
        self.base().route_buffer(buffer, |_| Ok(()))
    }

    /// Data-plane entry point. Runs synchronously on the caller's thread.
    fn deliver_buffer(&self, buffer: BufferHandle) {
        self.route_buffer(buffer);
    }
}

/// Graph-builder description of one node instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub camera_id: Option<CameraId>,
    /// Node-specific options, deserialized by the node's factory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Value>,
}

impl NodeSpec {
    pub fn new(name: impl Into<String>, node_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            node_type: node_type.into(),
            camera_id: None,
            config: None,
        }
    }

    pub fn with_camera(mut self, camera_id: CameraId) -> Self {
        self.camera_id = Some(camera_id);
        self
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = Some(config);
        self
    }

    /// Deserialize the node-specific options, falling back to `T::default()`.
    pub fn parse_config<T>(&self) -> Result<T>
    where
        T: for<'de> Deserialize<'de> + Default,
    {
        match &self.config {
            Some(json) => serde_json::from_value(json.clone()).map_err(|e| {
                super::error::PipelineError::Configuration(format!(
                    "Failed to deserialize config for '{}': {}",
                    self.name, e
                ))
            }),
            None => Ok(T::default()),
        }
    }
}

/// Everything a node factory receives besides its own spec.
#[derive(Clone)]
pub struct NodeContext {
    pub id: NodeId,
    pub camera_id: CameraId,
    pub metadata: Arc<MetadataController>,
    pub devices: Arc<dyn DeviceManager>,
}

impl NodeContext {
    pub fn new(
        id: NodeId,
        camera_id: CameraId,
        metadata: Arc<MetadataController>,
        devices: Arc<dyn DeviceManager>,
    ) -> Self {
        Self {
            id,
            camera_id,
            metadata,
            devices,
        }
    }
}

impl std::fmt::Debug for NodeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeContext")
            .field("id", &self.id)
            .field("camera_id", &self.camera_id)
            .finish_non_exhaustive()
    }
}
